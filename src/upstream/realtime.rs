//! Realtime WebSocket adapter for the upstream contract.
//!
//! One socket per session. The write half is handed to the bridge worker as
//! an [`UpstreamSender`]; the read half is drained by a spawned task that
//! turns server frames into [`UpstreamEvent`]s on a bounded channel.

use super::{UpstreamCommand, UpstreamConnector, UpstreamEvent, UpstreamLink, UpstreamSender};
use crate::config::UpstreamConfig;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_BUFFER: usize = 64;

pub struct RealtimeConnector {
    url: String,
    model: String,
}

impl RealtimeConnector {
    pub fn new(config: &UpstreamConfig) -> Self {
        Self {
            url: config.realtime_url.clone(),
            model: config.realtime_model.clone(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}?model={}", self.url, self.model)
    }
}

#[async_trait]
impl UpstreamConnector for RealtimeConnector {
    async fn connect(&self, api_key: &str) -> AppResult<UpstreamLink> {
        let mut request = self.endpoint().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key)).map_err(|_| {
            AppError::Configuration("API key contains characters not allowed in a header".into())
        })?;
        request.headers_mut().insert(AUTHORIZATION, bearer);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (socket, _) = connect_async(request).await?;
        info!(endpoint = %self.url, "Connected to realtime speech service");

        let (sink, stream) = socket.split();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(read_events(stream, tx));

        Ok(UpstreamLink {
            sender: Box::new(RealtimeSender { sink }),
            events: rx,
        })
    }
}

struct RealtimeSender {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl UpstreamSender for RealtimeSender {
    async fn send(&mut self, command: UpstreamCommand) -> AppResult<()> {
        let frame = encode_command(&command)?;
        self.sink.send(Message::Text(frame.into())).await?;
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        // The close frame may fail if the server already hung up; release the
        // sink regardless.
        let handshake = self.sink.send(Message::Close(None)).await;
        let released = self.sink.close().await;
        handshake?;
        released?;
        Ok(())
    }
}

/// Drain the read half until the socket ends or nobody is listening.
async fn read_events(mut stream: SplitStream<WsStream>, tx: mpsc::Sender<UpstreamEvent>) {
    while let Some(message) = stream.next().await {
        let event = match message {
            Ok(Message::Text(text)) => match parse_server_event(&text) {
                Some(event) => event,
                None => continue,
            },
            Ok(Message::Close(frame)) => {
                debug!(?frame, "Realtime service closed the socket");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "Realtime socket error");
                let _ = tx
                    .send(UpstreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                break;
            }
        };

        if tx.send(event).await.is_err() {
            // Bridge is gone
            return;
        }
    }
    let _ = tx.send(UpstreamEvent::Closed).await;
}

/// Wire encoding of a relay command.
pub fn encode_command(command: &UpstreamCommand) -> AppResult<String> {
    let frame = match command {
        UpstreamCommand::Configure(session) => json!({
            "type": "session.update",
            "session": {
                "modalities": session.modalities,
                "instructions": session.instructions,
                "input_audio_format": session.input_audio.encoding,
                "input_audio_sample_rate": session.input_audio.sample_rate_hz,
                "input_audio_channels": session.input_audio.channels,
                "output_audio_format": session.output_audio.encoding,
                "output_audio_sample_rate": session.output_audio.sample_rate_hz,
                "output_audio_channels": session.output_audio.channels,
                "input_audio_transcription": session.input_audio_transcription,
                "turn_detection": session.turn_detection,
                "tools": session.tools,
            },
        }),
        UpstreamCommand::Append(bytes) => json!({
            "type": "input_audio_buffer.append",
            "audio": STANDARD.encode(bytes),
        }),
        UpstreamCommand::Commit => json!({ "type": "input_audio_buffer.commit" }),
    };
    Ok(serde_json::to_string(&frame)?)
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ServerEvent {
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallDone { name: String, arguments: String },

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        #[serde(default)]
        transcript: String,
    },

    #[serde(rename = "error")]
    Error { error: ServerError },

    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct ServerError {
    #[serde(default)]
    message: Option<String>,
}

/// Map one server frame to a contract event. Frames the relay does not care
/// about, and frames that don't parse, yield `None`.
pub fn parse_server_event(text: &str) -> Option<UpstreamEvent> {
    match serde_json::from_str::<ServerEvent>(text) {
        Ok(ServerEvent::FunctionCallDone { name, arguments }) => {
            Some(UpstreamEvent::CapabilityInvoked { name, arguments })
        }
        Ok(ServerEvent::TranscriptionCompleted { transcript }) => {
            Some(UpstreamEvent::TranscriptCompleted { text: transcript })
        }
        Ok(ServerEvent::Error { error }) => Some(UpstreamEvent::Error {
            message: error
                .message
                .unwrap_or_else(|| "speech service error".to_string()),
        }),
        Ok(ServerEvent::Other) => None,
        Err(e) => {
            debug!(error = %e, "Ignoring unparseable realtime frame");
            None
        }
    }
}
