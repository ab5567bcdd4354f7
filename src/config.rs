//! # Configuration Management
//!
//! Loads the relay's settings from layered sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml, optional)
//! - Environment variables (with APP_ prefix)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables (`APP_GAME__ELIMINATION_THRESHOLD=0.7`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Nested keys use a double underscore because several field names already
//! contain a single one (`chunks_per_batch`, `max_players`).

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Sections:
/// - `server`: where the HTTP/WebSocket listener binds
/// - `upstream`: how the speech service is reached
/// - `bridge`: which detection strategy sessions use
/// - `batch`: chunk accumulation and classification knobs
/// - `game`: roster limits and the elimination rule
/// - `secrets`: credential cache behaviour
/// - `performance`: channel and session capacities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub bridge: BridgeConfig,
    pub batch: BatchConfig,
    pub game: GameConfig,
    pub secrets: SecretsConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Speech service endpoints and timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// WebSocket endpoint of the realtime speech service
    pub realtime_url: String,
    /// Realtime model identifier sent as the `model` query parameter
    pub realtime_model: String,
    /// Base URL for the batch transcription and judgment calls
    pub http_base_url: String,
    pub transcription_model: String,
    pub judge_model: String,
    /// Name of the secret that holds the API key
    pub api_key_secret: String,
    pub connect_timeout_ms: u64,
    /// How long `end` waits for trailing detections after the commit
    pub end_grace_ms: u64,
    /// Server-side voice activity detection
    pub vad_threshold: f32,
    pub vad_prefix_padding_ms: u32,
    pub vad_silence_duration_ms: u32,
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn end_grace(&self) -> Duration {
        Duration::from_millis(self.end_grace_ms)
    }
}

/// Which detection strategy new sessions use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeMode {
    /// Persistent upstream connection; the service reports laughter itself
    Live,
    /// Accumulate chunks, transcribe them and classify the transcript locally
    Batch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub mode: BridgeMode,
    /// Capacity of each bridge's ordered command queue
    pub command_queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub chunks_per_batch: usize,
    pub chunk_ttl_secs: u64,
    /// Transcripts at least this long skip the secondary model check
    pub model_max_chars: usize,
}

/// Roster limits and the elimination rule.
///
/// A detection eliminates the performer when its confidence is strictly
/// greater than `elimination_threshold`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameConfig {
    pub default_game_id: String,
    pub max_players: usize,
    pub min_players: usize,
    pub elimination_threshold: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    pub refresh_interval_secs: u64,
}

/// Performance tuning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    /// Bounded channel from session bridges to the game hub
    pub detection_channel_capacity: usize,
    /// Per-game command queue
    pub game_queue_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            upstream: UpstreamConfig {
                realtime_url: "wss://api.openai.com/v1/realtime".to_string(),
                realtime_model: "gpt-4o-realtime-preview".to_string(),
                http_base_url: "https://api.openai.com/v1".to_string(),
                transcription_model: "whisper-1".to_string(),
                judge_model: "gpt-4o-mini".to_string(),
                api_key_secret: "OPENAI_API_KEY".to_string(),
                connect_timeout_ms: 10_000,
                end_grace_ms: 1_000,
                vad_threshold: 0.5,
                vad_prefix_padding_ms: 300,
                vad_silence_duration_ms: 500,
            },
            bridge: BridgeConfig {
                mode: BridgeMode::Live,
                command_queue_capacity: 256,
            },
            batch: BatchConfig {
                chunks_per_batch: 10, // ~2.5 s of audio at typical chunk sizes
                chunk_ttl_secs: 300,
                model_max_chars: 100,
            },
            game: GameConfig {
                default_game_id: "main".to_string(),
                max_players: 10,
                min_players: 2,
                elimination_threshold: 0.6,
            },
            secrets: SecretsConfig {
                refresh_interval_secs: 300,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 100,
                detection_channel_capacity: 64,
                game_queue_capacity: 128,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_BRIDGE__MODE=batch`: Use the batch strategy
    /// - `APP_GAME__MAX_PLAYERS=6`: Smaller rooms
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if !(0.0..=1.0).contains(&self.game.elimination_threshold) {
            return Err(anyhow::anyhow!(
                "Elimination threshold must be within [0, 1], got {}",
                self.game.elimination_threshold
            ));
        }

        if self.game.min_players == 0 || self.game.min_players > self.game.max_players {
            return Err(anyhow::anyhow!(
                "Player limits are inconsistent: min {} / max {}",
                self.game.min_players,
                self.game.max_players
            ));
        }

        if self.game.default_game_id.trim().is_empty() {
            return Err(anyhow::anyhow!("Default game id cannot be empty"));
        }

        if self.batch.chunks_per_batch == 0 {
            return Err(anyhow::anyhow!("Chunks per batch must be greater than 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        // tokio panics on zero-capacity channels
        if self.performance.detection_channel_capacity == 0
            || self.performance.game_queue_capacity == 0
            || self.bridge.command_queue_capacity == 0
        {
            return Err(anyhow::anyhow!("Channel capacities must be greater than 0"));
        }

        if self.upstream.connect_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Upstream connect timeout must be greater than 0"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// Only the fields that make sense to change on a running relay are
    /// accepted. Game limits apply to games created afterwards; bridge mode
    /// applies to sessions started afterwards. The update is validated on a
    /// copy, so a rejected update leaves the current configuration untouched.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;
        let mut next = self.clone();

        if let Some(game) = partial_config.get("game") {
            if let Some(max) = game.get("max_players").and_then(|v| v.as_u64()) {
                next.game.max_players = max as usize;
            }
            if let Some(min) = game.get("min_players").and_then(|v| v.as_u64()) {
                next.game.min_players = min as usize;
            }
            if let Some(threshold) = game.get("elimination_threshold").and_then(|v| v.as_f64()) {
                next.game.elimination_threshold = threshold as f32;
            }
        }

        if let Some(bridge) = partial_config.get("bridge") {
            if let Some(mode) = bridge.get("mode") {
                next.bridge.mode = serde_json::from_value(mode.clone())?;
            }
        }

        if let Some(batch) = partial_config.get("batch") {
            if let Some(chunks) = batch.get("chunks_per_batch").and_then(|v| v.as_u64()) {
                next.batch.chunks_per_batch = chunks as usize;
            }
            if let Some(chars) = batch.get("model_max_chars").and_then(|v| v.as_u64()) {
                next.batch.model_max_chars = chars as usize;
            }
        }

        if let Some(upstream) = partial_config.get("upstream") {
            if let Some(grace) = upstream.get("end_grace_ms").and_then(|v| v.as_u64()) {
                next.upstream.end_grace_ms = grace;
            }
            if let Some(timeout) = upstream.get("connect_timeout_ms").and_then(|v| v.as_u64()) {
                next.upstream.connect_timeout_ms = timeout;
            }
        }

        next.validate()?;
        *self = next;
        Ok(())
    }

    pub fn chunk_ttl(&self) -> Duration {
        Duration::from_secs(self.batch.chunk_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Defaults match the documented game rules and pass validation.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.game.max_players, 10);
        assert_eq!(config.game.min_players, 2);
        assert!((config.game.elimination_threshold - 0.6).abs() < f32::EPSILON);
        assert_eq!(config.batch.chunks_per_batch, 10);
        assert_eq!(config.batch.chunk_ttl_secs, 300);
        assert_eq!(config.bridge.mode, BridgeMode::Live);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.game.elimination_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.game.min_players = 11;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"game": {"elimination_threshold": 0.75}, "bridge": {"mode": "batch"}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert!((config.game.elimination_threshold - 0.75).abs() < f32::EPSILON);
        assert_eq!(config.bridge.mode, BridgeMode::Batch);
        assert_eq!(config.game.max_players, 10);
    }

    /// A rejected update must not leave a half-applied configuration behind.
    #[test]
    fn test_rejected_update_is_atomic() {
        let mut config = AppConfig::default();
        let json = r#"{"game": {"max_players": 4, "elimination_threshold": 3.0}}"#;
        assert!(config.update_from_json(json).is_err());
        assert_eq!(config.game.max_players, 10);
    }
}
