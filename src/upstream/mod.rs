//! # Upstream Speech Service
//!
//! Vendor-neutral contract for the external speech-understanding service.
//!
//! ## Live contract:
//! - **Commands** (relay → service): `Configure`, `Append(bytes)`, `Commit`
//! - **Events** (service → relay): `CapabilityInvoked`, `TranscriptCompleted`,
//!   `Error`, `Closed`
//!
//! The service is told about exactly one capability, `report_laughter`, which
//! it invokes instead of answering with speech or text.
//!
//! ## Batch contract:
//! [`BatchAnalyzer`] transcribes a finished WAV clip and gives a second
//! opinion on whether a short transcript is laughter.
//!
//! ## Implementations:
//! - **realtime**: WebSocket adapter over `tokio-tungstenite`
//! - **batch**: HTTP adapter over `reqwest`

pub mod batch;
pub mod realtime;

use crate::audio::processor::AudioFormat;
use crate::config::UpstreamConfig;
use crate::error::AppResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;

/// Name of the single capability the service may invoke.
pub const LAUGHTER_CAPABILITY: &str = "report_laughter";

const REFEREE_INSTRUCTIONS: &str = "You are a game referee for a singing game where players must not laugh. \
Your only job is to detect when someone laughs during their audio input: laughter sounds (haha, hehe, giggling), \
chuckling or snickering, suppressed laughter, or breathing patterns that indicate amusement. \
When you detect laughter, immediately call the report_laughter function. \
Do not respond with text or speech. If there is no laughter, do nothing.";

/// Encoding, rate and layout of an audio stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamFormat {
    pub encoding: String,
    pub sample_rate_hz: u32,
    pub channels: u16,
}

impl StreamFormat {
    /// 16-bit little-endian PCM at the rate and channel count of `format`.
    pub fn pcm16(format: &AudioFormat) -> Self {
        Self {
            encoding: "pcm16".to_string(),
            sample_rate_hz: format.sample_rate,
            channels: format.channels,
        }
    }
}

/// Server-side voice activity segmentation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

/// A capability the service may invoke, described by a JSON schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Everything the service needs to know before audio starts flowing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfiguration {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub input_audio: StreamFormat,
    pub output_audio: StreamFormat,
    pub input_audio_transcription: serde_json::Value,
    pub turn_detection: TurnDetection,
    pub tools: Vec<CapabilityDefinition>,
}

impl SessionConfiguration {
    /// Configuration for laughter refereeing: bidirectional audio, PCM16 at
    /// 16 kHz mono, server VAD, and the `report_laughter` capability.
    pub fn laughter_detection(config: &UpstreamConfig) -> Self {
        Self {
            modalities: vec!["text".to_string(), "audio".to_string()],
            instructions: REFEREE_INSTRUCTIONS.to_string(),
            input_audio: StreamFormat::pcm16(&AudioFormat::default()),
            output_audio: StreamFormat::pcm16(&AudioFormat::default()),
            input_audio_transcription: json!({ "model": config.transcription_model }),
            turn_detection: TurnDetection {
                kind: "server_vad".to_string(),
                threshold: config.vad_threshold,
                prefix_padding_ms: config.vad_prefix_padding_ms,
                silence_duration_ms: config.vad_silence_duration_ms,
            },
            tools: vec![CapabilityDefinition {
                kind: "function".to_string(),
                name: LAUGHTER_CAPABILITY.to_string(),
                description: "Report when laughter is detected in the audio".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "confidence": {
                            "type": "number",
                            "description": "Confidence level from 0 to 1",
                            "minimum": 0,
                            "maximum": 1
                        },
                        "laughter_type": {
                            "type": "string",
                            "description": "Type of laughter detected",
                            "enum": ["giggling", "loud_laughter", "chuckling", "suppressed", "snickering"]
                        },
                        "timestamp_ms": {
                            "type": "number",
                            "description": "Approximate timestamp in the audio where laughter occurred"
                        }
                    },
                    "required": ["confidence", "laughter_type"]
                }),
            }],
        }
    }
}

/// Relay → service.
#[derive(Debug, Clone)]
pub enum UpstreamCommand {
    Configure(Box<SessionConfiguration>),
    Append(Vec<u8>),
    Commit,
}

/// Service → relay.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// The model called a declared capability; `arguments` is raw JSON text
    CapabilityInvoked { name: String, arguments: String },
    TranscriptCompleted { text: String },
    Error { message: String },
    /// The channel closed from the service side
    Closed,
}

/// Write half of an upstream channel. Owned by exactly one bridge worker.
#[async_trait]
pub trait UpstreamSender: Send {
    async fn send(&mut self, command: UpstreamCommand) -> AppResult<()>;

    /// Best-effort close handshake.
    async fn close(&mut self) -> AppResult<()>;
}

/// An open upstream channel.
pub struct UpstreamLink {
    pub sender: Box<dyn UpstreamSender>,
    pub events: mpsc::Receiver<UpstreamEvent>,
}

/// Opens upstream channels.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self, api_key: &str) -> AppResult<UpstreamLink>;
}

/// One transcribed span of audio.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TranscriptSegment {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub start: f64,
    #[serde(default)]
    pub end: f64,
    #[serde(default)]
    pub tokens: Vec<i64>,
}

/// Transcription of one batch clip.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Transcript {
    #[serde(default)]
    pub text: String,
    /// Clip duration in seconds
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub segments: Vec<TranscriptSegment>,
}

/// Secondary model's judgment of a transcript.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelVerdict {
    pub has_laughter: bool,
    /// 0-100
    #[serde(default)]
    pub confidence: f32,
}

/// Batch-mode speech analysis.
#[async_trait]
pub trait BatchAnalyzer: Send + Sync {
    async fn transcribe(&self, api_key: &str, wav: Vec<u8>) -> AppResult<Transcript>;

    async fn judge(&self, api_key: &str, transcript: &Transcript) -> AppResult<ModelVerdict>;
}
