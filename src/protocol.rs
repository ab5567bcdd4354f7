//! # Client Protocol
//!
//! JSON frames exchanged with clients over the `/ws` socket.
//!
//! ## Inbound:
//! - **Session frames** carry a `type`: `startSession`, `audioData`, `endSession`
//! - **Game actions** carry an `action` and optional `data`: `join-game`,
//!   `start-game`, `submit-performance`, `performance-result`
//!
//! ## Outbound:
//! - [`ServerMessage`]: `{type, ...}` frames about the client's own session
//! - [`GameEvent`]: `{event, data}` frames about the game it follows

use crate::connection::ConnectionId;
use crate::error::{AppError, AppResult};
use crate::game::state::Player;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Session control frames.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SessionRequest {
    StartSession {
        #[serde(default)]
        player_id: Option<String>,
    },
    AudioData {
        audio: String,
    },
    EndSession,
}

/// `join-game` payload: either just a name, or a name and a game id.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum JoinRequest {
    Name(String),
    Detailed {
        name: String,
        #[serde(default, rename = "gameId")]
        game_id: Option<String>,
    },
}

impl JoinRequest {
    pub fn name(&self) -> &str {
        match self {
            JoinRequest::Name(name) => name,
            JoinRequest::Detailed { name, .. } => name,
        }
    }

    pub fn game_id(&self) -> Option<&str> {
        match self {
            JoinRequest::Name(_) => None,
            JoinRequest::Detailed { game_id, .. } => game_id.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PerformanceReport {
    #[serde(rename = "hasLaughter")]
    pub has_laughter: bool,
}

/// Game-flow actions.
#[derive(Debug, Clone, PartialEq)]
pub enum GameAction {
    JoinGame(JoinRequest),
    StartGame,
    /// Performer signals they finished; acknowledged with `performance-received`
    SubmitPerformance,
    PerformanceResult(PerformanceReport),
}

#[derive(Deserialize)]
struct RawAction {
    action: String,
    #[serde(default)]
    data: Value,
}

impl TryFrom<RawAction> for GameAction {
    type Error = AppError;

    fn try_from(raw: RawAction) -> AppResult<Self> {
        match raw.action.as_str() {
            "join-game" => Ok(GameAction::JoinGame(serde_json::from_value(raw.data)?)),
            "start-game" => Ok(GameAction::StartGame),
            "submit-performance" => Ok(GameAction::SubmitPerformance),
            "performance-result" => {
                Ok(GameAction::PerformanceResult(serde_json::from_value(raw.data)?))
            }
            other => Err(AppError::Validation(format!("unknown action '{}'", other))),
        }
    }
}

/// Any frame a client may send.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Session(SessionRequest),
    Game(GameAction),
}

impl ClientMessage {
    /// Parse one text frame.
    pub fn parse(text: &str) -> AppResult<Self> {
        let value: Value = serde_json::from_str(text)?;
        if value.get("type").is_some() {
            Ok(ClientMessage::Session(serde_json::from_value(value)?))
        } else if value.get("action").is_some() {
            let raw: RawAction = serde_json::from_value(value)?;
            Ok(ClientMessage::Game(raw.try_into()?))
        } else {
            Err(AppError::Validation(
                "frame has neither a 'type' nor an 'action'".to_string(),
            ))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaughterReport {
    pub confidence: f32,
    pub laughter_type: String,
    /// Milliseconds; offset into the audio when the service reports one
    pub timestamp: u64,
}

/// Frames about the client's own connection and session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Welcome { client_id: ConnectionId },
    SessionStarted { session_id: String },
    LaughterDetected { data: LaughterReport },
    Transcription { text: String },
    SessionEnded,
    Error { error: String, code: String },
}

impl ServerMessage {
    pub fn error(err: &AppError) -> Self {
        ServerMessage::Error {
            error: err.to_string(),
            code: err.code().to_string(),
        }
    }
}

/// Frames about the game a client follows.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum GameEvent {
    PlayerJoined {
        player_id: ConnectionId,
        game_id: String,
        players: Vec<Player>,
    },
    PlayerListUpdate(Vec<Player>),
    GameFull {
        max_players: usize,
    },
    GameStarted {
        current_player: ConnectionId,
        round: u32,
    },
    NotEnoughPlayers {
        present: usize,
        required: usize,
    },
    PlayerEliminated {
        player_id: ConnectionId,
        player_name: String,
        reason: String,
        confidence: f32,
    },
    NextTurn {
        current_player: ConnectionId,
        round: u32,
    },
    GameOver {
        winner: Option<Player>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    NotYourTurn,
    GameInProgress,
    PerformanceReceived,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_session_frames() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"startSession","playerId":"p1"}"#).unwrap(),
            ClientMessage::Session(SessionRequest::StartSession {
                player_id: Some("p1".into())
            })
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"audioData","audio":"AAAA"}"#).unwrap(),
            ClientMessage::Session(SessionRequest::AudioData { audio: "AAAA".into() })
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"endSession"}"#).unwrap(),
            ClientMessage::Session(SessionRequest::EndSession)
        );
    }

    #[test]
    fn test_parse_game_actions() {
        match ClientMessage::parse(r#"{"action":"join-game","data":"Amy"}"#).unwrap() {
            ClientMessage::Game(GameAction::JoinGame(join)) => {
                assert_eq!(join.name(), "Amy");
                assert_eq!(join.game_id(), None);
            }
            other => panic!("unexpected {:?}", other),
        }
        match ClientMessage::parse(r#"{"action":"join-game","data":{"name":"Bo","gameId":"room-2"}}"#)
            .unwrap()
        {
            ClientMessage::Game(GameAction::JoinGame(join)) => {
                assert_eq!(join.game_id(), Some("room-2"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            ClientMessage::parse(r#"{"action":"start-game"}"#).unwrap(),
            ClientMessage::Game(GameAction::StartGame)
        );
        assert_eq!(
            ClientMessage::parse(r#"{"action":"performance-result","data":{"hasLaughter":true}}"#)
                .unwrap(),
            ClientMessage::Game(GameAction::PerformanceResult(PerformanceReport {
                has_laughter: true
            }))
        );
    }

    /// Malformed frames are validation errors, never panics.
    #[test]
    fn test_malformed_frames_rejected() {
        for frame in [
            "not json",
            r#"{"hello":"world"}"#,
            r#"{"type":"danceParty"}"#,
            r#"{"action":"fly"}"#,
            r#"{"action":"performance-result","data":{}}"#,
            r#"{"type":"audioData"}"#,
        ] {
            let err = ClientMessage::parse(frame).unwrap_err();
            assert_eq!(err.code(), "validation_error", "frame: {}", frame);
        }
    }

    #[test]
    fn test_outbound_shapes() {
        let welcome = serde_json::to_value(ServerMessage::Welcome {
            client_id: ConnectionId::from("c1"),
        })
        .unwrap();
        assert_eq!(welcome, json!({"type": "welcome", "clientId": "c1"}));

        let ended = serde_json::to_value(ServerMessage::SessionEnded).unwrap();
        assert_eq!(ended, json!({"type": "sessionEnded"}));

        let turn = serde_json::to_value(GameEvent::NextTurn {
            current_player: ConnectionId::from("c2"),
            round: 3,
        })
        .unwrap();
        assert_eq!(
            turn,
            json!({"event": "next-turn", "data": {"currentPlayer": "c2", "round": 3}})
        );

        let not_your_turn = serde_json::to_value(GameEvent::NotYourTurn).unwrap();
        assert_eq!(not_your_turn, json!({"event": "not-your-turn"}));

        let over = serde_json::to_value(GameEvent::GameOver {
            winner: None,
            message: Some("Everyone was eliminated!".into()),
        })
        .unwrap();
        assert_eq!(over["data"]["winner"], Value::Null);
    }
}
