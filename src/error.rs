//! # Error Handling
//!
//! This module defines the error taxonomy shared by the relay, the session
//! bridges and the game orchestrator, and how those errors are turned into
//! HTTP responses and client error frames.
//!
//! ## Error Categories:
//! - **Configuration**: missing credentials or invalid settings (fatal to `start`)
//! - **Upstream**: network/protocol failure talking to the speech service (recoverable)
//! - **ConnectionGone**: a delivery target is no longer reachable (triggers cleanup)
//! - **Validation**: malformed inbound message (rejected, connection stays open)
//! - **Capacity / NotEnoughPlayers / NotYourTurn / InvalidState**: expected
//!   game-flow rejections, not system failures
//!
//! ## Why one enum:
//! Every layer returns `AppResult<T>`, so `?` works across the bridge, the game
//! and the HTTP handlers without conversion boilerplate.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;

/// Application error type.
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::Validation("audio payload is empty".to_string()));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Credentials or configuration are unavailable
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Network or protocol failure talking to the speech service
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// The target connection can no longer be reached
    #[error("Connection gone: {0}")]
    ConnectionGone(String),

    /// Malformed inbound data
    #[error("Validation error: {0}")]
    Validation(String),

    /// The game roster is full
    #[error("Game is full (maximum {max} players)")]
    Capacity { max: usize },

    /// `start` was requested with too few players
    #[error("Not enough players: {present} joined, {required} required")]
    NotEnoughPlayers { present: usize, required: usize },

    /// A turn-scoped action came from someone other than the current player
    #[error("It is not your turn")]
    NotYourTurn,

    /// The operation is not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Requested resource doesn't exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Anything else
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code, used in both JSON bodies and client
    /// `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Configuration(_) => "configuration_error",
            AppError::Upstream(_) => "upstream_error",
            AppError::ConnectionGone(_) => "connection_gone",
            AppError::Validation(_) => "validation_error",
            AppError::Capacity { .. } => "game_full",
            AppError::NotEnoughPlayers { .. } => "not_enough_players",
            AppError::NotYourTurn => "not_your_turn",
            AppError::InvalidState(_) => "invalid_state",
            AppError::NotFound(_) => "not_found",
            AppError::Internal(_) => "internal_error",
        }
    }

    /// Whether the error is an expected game-flow rejection rather than a
    /// system failure. These are logged at debug level only.
    pub fn is_game_rejection(&self) -> bool {
        matches!(
            self,
            AppError::Capacity { .. }
                | AppError::NotEnoughPlayers { .. }
                | AppError::NotYourTurn
                | AppError::InvalidState(_)
        )
    }
}

/// Converts errors into HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "validation_error",
///     "message": "Validation error: elimination threshold must be within [0, 1]",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) | AppError::ConnectionGone(_) => StatusCode::NOT_FOUND,
            AppError::Capacity { .. }
            | AppError::NotEnoughPlayers { .. }
            | AppError::NotYourTurn
            | AppError::InvalidState(_) => StatusCode::CONFLICT,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::Configuration(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.code(),
                "message": self.to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// `anyhow` errors from helper code become internal errors.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always caused by the client, so they map to
/// validation errors rather than internal ones.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Validation(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Upstream(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::Upstream(err.to_string())
    }
}

impl From<base64::DecodeError> for AppError {
    fn from(err: base64::DecodeError) -> Self {
        AppError::Validation(format!("audio is not valid base64: {}", err))
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn game_rejections_are_not_system_failures() {
        assert!(AppError::Capacity { max: 10 }.is_game_rejection());
        assert!(AppError::NotYourTurn.is_game_rejection());
        assert!(!AppError::Upstream("socket reset".into()).is_game_rejection());
        assert!(!AppError::Configuration("missing key".into()).is_game_rejection());
    }

    #[test]
    fn json_errors_map_to_validation() {
        let err: AppError = serde_json::from_str::<serde_json::Value>("{oops")
            .unwrap_err()
            .into();
        assert_eq!(err.code(), "validation_error");
    }

    #[test]
    fn status_codes_follow_taxonomy() {
        use actix_web::http::StatusCode;
        assert_eq!(
            AppError::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::NotEnoughPlayers { present: 1, required: 2 }.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::Upstream("x".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }
}
