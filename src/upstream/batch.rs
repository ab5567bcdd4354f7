//! HTTP adapter for batch-mode analysis: multipart transcription upload
//! followed by an optional JSON-mode judgment call.

use super::{BatchAnalyzer, ModelVerdict, Transcript};
use crate::config::UpstreamConfig;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

const JUDGE_PROMPT: &str = "You are an expert at detecting laughter in audio transcriptions. \
Analyze the following transcription and determine if there is laughter present. \
Consider sounds like 'haha', 'hehe', giggling descriptions, or any indication of laughter. \
Respond with a JSON object containing 'hasLaughter' (boolean) and 'confidence' (0-100).";

pub struct HttpBatchAnalyzer {
    client: Client,
    base_url: String,
    transcription_model: String,
    judge_model: String,
}

impl HttpBatchAnalyzer {
    pub fn new(config: &UpstreamConfig) -> AppResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: config.http_base_url.trim_end_matches('/').to_string(),
            transcription_model: config.transcription_model.clone(),
            judge_model: config.judge_model.clone(),
        })
    }
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl BatchAnalyzer for HttpBatchAnalyzer {
    async fn transcribe(&self, api_key: &str, wav: Vec<u8>) -> AppResult<Transcript> {
        let size = wav.len();
        let file = Part::bytes(wav)
            .file_name("performance.wav")
            .mime_str("audio/wav")?;
        let form = Form::new()
            .part("file", file)
            .text("model", self.transcription_model.clone())
            .text("response_format", "verbose_json");

        let transcript: Transcript = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        debug!(bytes = size, chars = transcript.text.len(), "Batch clip transcribed");
        Ok(transcript)
    }

    async fn judge(&self, api_key: &str, transcript: &Transcript) -> AppResult<ModelVerdict> {
        let segments: Vec<_> = transcript
            .segments
            .iter()
            .map(|s| json!({ "text": s.text, "start": s.start, "end": s.end }))
            .collect();
        let body = json!({
            "model": self.judge_model,
            "messages": [
                { "role": "system", "content": JUDGE_PROMPT },
                {
                    "role": "user",
                    "content": format!(
                        "Transcription: {}\nSegments: {}",
                        transcript.text,
                        serde_json::Value::Array(segments)
                    )
                }
            ],
            "response_format": { "type": "json_object" }
        });

        let completion: ChatCompletion = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| AppError::Upstream("judgment response had no content".to_string()))?;

        serde_json::from_str(&content)
            .map_err(|e| AppError::Upstream(format!("judgment was not valid JSON: {}", e)))
    }
}
