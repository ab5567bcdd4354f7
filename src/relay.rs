//! # Relay
//!
//! Wires the connection registry, session bridges and game hub together and
//! routes every client frame to the right one.
//!
//! ## Background tasks:
//! - **detection router**: bridge verdicts → game tasks
//! - **reaper**: connections whose peer became unreachable during a
//!   delivery → full `deregister` cascade

use crate::audio::buffer::AudioIngestBuffer;
use crate::audio::processor::AudioProcessor;
use crate::bridge::{BridgeManager, GenerationTracker};
use crate::config::AppConfig;
use crate::connection::{Broadcaster, ConnectionId, ConnectionRegistry, ConnectionSink};
use crate::detection::{BatchClassifier, DetectionEvent};
use crate::error::{AppError, AppResult};
use crate::game::GameHub;
use crate::protocol::{ClientMessage, GameAction, ServerMessage, SessionRequest};
use crate::secrets::{SecretSource, SecretsVault};
use crate::upstream::{BatchAnalyzer, Transcript, UpstreamConnector};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// External services the relay talks to.
#[derive(Clone)]
pub struct UpstreamServices {
    pub connector: Arc<dyn UpstreamConnector>,
    pub analyzer: Arc<dyn BatchAnalyzer>,
    pub secrets: Arc<dyn SecretSource>,
}

pub struct Relay {
    registry: Arc<ConnectionRegistry>,
    broadcaster: Arc<Broadcaster>,
    hub: Arc<GameHub>,
    bridges: BridgeManager,
    vault: Arc<SecretsVault>,
    analyzer: Arc<dyn BatchAnalyzer>,
    processor: AudioProcessor,
    config: Arc<RwLock<AppConfig>>,
}

impl Relay {
    /// Build the relay and spawn its background tasks. Must run inside a
    /// tokio runtime.
    pub fn start(config: Arc<RwLock<AppConfig>>, services: UpstreamServices) -> Arc<Self> {
        let snapshot = config.read().unwrap_or_else(PoisonError::into_inner).clone();

        let registry = Arc::new(ConnectionRegistry::new());
        let (broadcaster, evictions) = Broadcaster::new(registry.clone());
        let broadcaster = Arc::new(broadcaster);
        let hub = Arc::new(GameHub::new(
            registry.clone(),
            broadcaster.clone(),
            config.clone(),
        ));

        let (detection_tx, detection_rx) =
            mpsc::channel(snapshot.performance.detection_channel_capacity.max(1));
        let generations = Arc::new(GenerationTracker::default());
        let vault = Arc::new(SecretsVault::new(
            services.secrets,
            Duration::from_secs(snapshot.secrets.refresh_interval_secs),
        ));
        let bridges = BridgeManager::new(
            generations.clone(),
            vault.clone(),
            services.connector,
            services.analyzer.clone(),
            Arc::new(AudioIngestBuffer::new(snapshot.chunk_ttl())),
            broadcaster.clone(),
            detection_tx,
            config.clone(),
        );

        let relay = Arc::new(Self {
            registry,
            broadcaster,
            hub: hub.clone(),
            bridges,
            vault,
            analyzer: services.analyzer,
            processor: AudioProcessor::default(),
            config,
        });

        tokio::spawn(hub.route_detections(detection_rx, generations));
        tokio::spawn(relay.clone().reap(evictions));
        info!(
            "Relay started ({:?} bridge mode, default game '{}')",
            snapshot.bridge.mode, snapshot.game.default_game_id
        );
        relay
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn hub(&self) -> &GameHub {
        &self.hub
    }

    pub fn bridges(&self) -> &BridgeManager {
        &self.bridges
    }

    pub fn delivery_failures(&self) -> u64 {
        self.broadcaster.delivery_failures()
    }

    /// Admit a connection: registry entry, default game subscription, and a
    /// `welcome` frame carrying its id.
    pub fn register(&self, sink: Arc<dyn ConnectionSink>) -> ConnectionId {
        let id = self.registry.register(sink);
        if let Err(e) = self.registry.subscribe(&id, &self.hub.default_game_id()) {
            warn!("Could not subscribe {} to the default game: {}", id, e);
        }
        if let Err(e) = self
            .broadcaster
            .send_to(&id, &ServerMessage::Welcome { client_id: id.clone() })
        {
            debug!("Welcome to {} not delivered: {}", id, e);
        }
        info!(
            "Client connected: {} ({} connections)",
            id,
            self.registry.len()
        );
        id
    }

    /// Remove a connection and everything it owns. Safe to call twice.
    pub async fn deregister(&self, id: &ConnectionId) {
        let removed = self.registry.delete(id).is_some();
        self.bridges.release(id);
        self.hub.disconnect(id).await;
        if removed {
            info!(
                "Client disconnected: {} ({} connections)",
                id,
                self.registry.len()
            );
        }
    }

    async fn reap(self: Arc<Self>, mut evictions: mpsc::UnboundedReceiver<ConnectionId>) {
        while let Some(id) = evictions.recv().await {
            warn!("Peer {} unreachable, deregistering", id);
            self.deregister(&id).await;
        }
    }

    /// Handle one text frame from a client.
    pub async fn handle_frame(&self, conn: &ConnectionId, text: &str) {
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                debug!("Rejected frame from {}: {}", conn, e);
                self.reply_error(conn, &e);
                return;
            }
        };

        match message {
            ClientMessage::Session(request) => {
                if let Err(e) = self.handle_session(conn, request).await {
                    debug!("Session request from {} failed: {}", conn, e);
                    self.reply_error(conn, &e);
                }
            }
            ClientMessage::Game(action) => {
                // The game already answered the requester with a game event
                // or error frame; only plumbing failures are left to report.
                if let Err(e) = self.handle_game(conn, action).await {
                    match e {
                        AppError::Internal(_) | AppError::ConnectionGone(_) => {
                            warn!("Game action from {} failed: {}", conn, e);
                            self.reply_error(conn, &e);
                        }
                        other => debug!("Game action from {} rejected: {}", conn, other),
                    }
                }
            }
        }
    }

    async fn handle_session(&self, conn: &ConnectionId, request: SessionRequest) -> AppResult<()> {
        match request {
            SessionRequest::StartSession { player_id } => {
                let turn = self.hub.turn_info(conn).await;
                self.bridges.start(conn, player_id, turn).await?;
                Ok(())
            }
            SessionRequest::AudioData { audio } => {
                let bytes = self.processor.decode_chunk(&audio)?;
                self.bridges.feed(conn, bytes)?;
                Ok(())
            }
            SessionRequest::EndSession => self.bridges.end(conn).await,
        }
    }

    async fn handle_game(&self, conn: &ConnectionId, action: GameAction) -> AppResult<()> {
        match action {
            GameAction::JoinGame(request) => {
                self.hub
                    .join(conn, request.name(), request.game_id())
                    .await
            }
            GameAction::StartGame => self.hub.start(conn).await,
            GameAction::SubmitPerformance => self.hub.submit_performance(conn).await,
            GameAction::PerformanceResult(report) => {
                self.hub.performance_result(conn, report.has_laughter).await
            }
        }
    }

    fn reply_error(&self, conn: &ConnectionId, err: &AppError) {
        if let Err(e) = self.broadcaster.send_to(conn, &ServerMessage::error(err)) {
            debug!("Error frame to {} not delivered: {}", conn, e);
        }
    }

    /// One-shot analysis of a complete PCM16 clip outside of any game.
    pub async fn analyze_clip(&self, pcm: &[u8]) -> AppResult<(Transcript, Option<DetectionEvent>)> {
        self.processor.validate_audio_data(pcm)?;
        let wav = self.processor.wrap_wav(pcm)?;
        let (secret, max_chars) = {
            let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
            (
                config.upstream.api_key_secret.clone(),
                config.batch.model_max_chars,
            )
        };
        let api_key = self.vault.get(&secret).await?;
        BatchClassifier::new(self.analyzer.clone(), max_chars)
            .analyze_clip(&api_key, wav, None)
            .await
    }

    pub fn processor(&self) -> &AudioProcessor {
        &self.processor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::session::SessionState;
    use crate::bridge::tests::{ScriptedConnector, StaticSecret};
    use crate::connection::registry::tests::{ClosedSink, RecordingSink};
    use crate::detection::dispatcher::tests::FakeAnalyzer;
    use crate::upstream::{UpstreamEvent, LAUGHTER_CAPABILITY};
    use serde_json::Value;

    fn relay(connector: ScriptedConnector) -> Arc<Relay> {
        let mut config = AppConfig::default();
        config.upstream.end_grace_ms = 10;
        Relay::start(
            Arc::new(RwLock::new(config)),
            UpstreamServices {
                connector: Arc::new(connector),
                analyzer: Arc::new(FakeAnalyzer::new("haha", 0.8, None)),
                secrets: Arc::new(StaticSecret(Some("sk-test"))),
            },
        )
    }

    async fn wait_for_event(sink: &RecordingSink, event: &str) -> Value {
        for _ in 0..200 {
            if let Some(frame) = sink.json().into_iter().find(|f| f["event"] == event) {
                return frame;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no '{}' event arrived", event);
    }

    #[tokio::test]
    async fn test_register_sends_welcome() {
        let relay = relay(ScriptedConnector::default());
        let sink = Arc::new(RecordingSink::default());
        let id = relay.register(sink.clone());
        let welcome = &sink.json()[0];
        assert_eq!(welcome["type"], "welcome");
        assert_eq!(welcome["clientId"], id.as_str());
        assert_eq!(relay.registry().get(&id).unwrap().game.as_deref(), Some("main"));
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection() {
        let relay = relay(ScriptedConnector::default());
        let sink = Arc::new(RecordingSink::default());
        let id = relay.register(sink.clone());
        relay.handle_frame(&id, "{{{").await;
        relay
            .handle_frame(&id, r#"{"type":"audioData","audio":"!!not base64!!"}"#)
            .await;
        let frames = sink.json();
        let errors: Vec<&Value> = frames.iter().filter(|f| f["type"] == "error").collect();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|f| f["code"] == "validation_error"));
        assert!(relay.registry().get(&id).is_some());
    }

    #[tokio::test]
    async fn test_live_detection_eliminates_performer() {
        let connector = ScriptedConnector::default();
        connector.script.lock().unwrap().push(UpstreamEvent::CapabilityInvoked {
            name: LAUGHTER_CAPABILITY.to_string(),
            arguments: r#"{"confidence":0.9,"laughter_type":"giggling"}"#.to_string(),
        });
        let relay = relay(connector);
        let amy_sink = Arc::new(RecordingSink::default());
        let bo_sink = Arc::new(RecordingSink::default());
        let amy = relay.register(amy_sink.clone());
        let bo = relay.register(bo_sink.clone());

        relay
            .handle_frame(&amy, r#"{"action":"join-game","data":"Amy"}"#)
            .await;
        relay
            .handle_frame(&bo, r#"{"action":"join-game","data":"Bo"}"#)
            .await;
        relay.handle_frame(&amy, r#"{"action":"start-game"}"#).await;
        relay
            .handle_frame(&amy, r#"{"type":"startSession","playerId":"amy"}"#)
            .await;

        let eliminated = wait_for_event(&bo_sink, "player-eliminated").await;
        assert_eq!(eliminated["data"]["playerName"], "Amy");
        let over = wait_for_event(&bo_sink, "game-over").await;
        assert_eq!(over["data"]["winner"]["name"], "Bo");
        assert!(amy_sink
            .json()
            .iter()
            .any(|f| f["type"] == "laughterDetected"));
    }

    /// A threshold change after the game was created must not let the bridge
    /// submit a detection the game will not eliminate on.
    #[tokio::test]
    async fn test_runtime_threshold_change_keeps_session_live() {
        let connector = ScriptedConnector::default();
        connector.script.lock().unwrap().push(UpstreamEvent::CapabilityInvoked {
            name: LAUGHTER_CAPABILITY.to_string(),
            arguments: r#"{"confidence":0.4,"laughter_type":"chuckle"}"#.to_string(),
        });
        let config = Arc::new(RwLock::new(AppConfig::default()));
        let relay = Relay::start(
            config.clone(),
            UpstreamServices {
                connector: Arc::new(connector),
                analyzer: Arc::new(FakeAnalyzer::new("haha", 0.8, None)),
                secrets: Arc::new(StaticSecret(Some("sk-test"))),
            },
        );
        let sinks: Vec<Arc<RecordingSink>> =
            (0..3).map(|_| Arc::new(RecordingSink::default())).collect();
        let ids: Vec<ConnectionId> = sinks.iter().map(|s| relay.register(s.clone())).collect();
        for (id, name) in ids.iter().zip(["Amy", "Bo", "Cee"]) {
            relay
                .handle_frame(id, &format!(r#"{{"action":"join-game","data":"{}"}}"#, name))
                .await;
        }
        relay.handle_frame(&ids[0], r#"{"action":"start-game"}"#).await;

        config.write().unwrap().game.elimination_threshold = 0.3;
        relay
            .handle_frame(&ids[0], r#"{"type":"startSession"}"#)
            .await;

        for _ in 0..200 {
            if sinks[0].json().iter().any(|f| f["type"] == "laughterDetected") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let snapshot = relay.hub().snapshot("main").await.unwrap();
        assert!(snapshot.eliminated.is_empty());
        assert_eq!(snapshot.current_player.as_ref(), Some(&ids[0]));
        let session = relay.bridges().session(&ids[0]).unwrap();
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_deregister_cascade_advances_turn() {
        let relay = relay(ScriptedConnector::default());
        let sinks: Vec<Arc<RecordingSink>> =
            (0..3).map(|_| Arc::new(RecordingSink::default())).collect();
        let ids: Vec<ConnectionId> = sinks.iter().map(|s| relay.register(s.clone())).collect();
        for (id, name) in ids.iter().zip(["Amy", "Bo", "Cee"]) {
            relay
                .handle_frame(id, &format!(r#"{{"action":"join-game","data":"{}"}}"#, name))
                .await;
        }
        relay.handle_frame(&ids[0], r#"{"action":"start-game"}"#).await;
        relay
            .handle_frame(&ids[0], r#"{"type":"startSession"}"#)
            .await;

        relay.deregister(&ids[0]).await;
        relay.deregister(&ids[0]).await;

        let turn = wait_for_event(&sinks[1], "next-turn").await;
        assert_eq!(turn["data"]["currentPlayer"], ids[1].as_str());
        assert!(relay.bridges().session(&ids[0]).is_none());
        assert_eq!(relay.registry().len(), 2);
        let snapshot = relay.hub().snapshot("main").await.unwrap();
        assert_eq!(snapshot.players.len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_evicted() {
        let relay = relay(ScriptedConnector::default());
        let sink = Arc::new(RecordingSink::default());
        let amy = relay.register(sink.clone());
        let ghost = relay.register(Arc::new(ClosedSink));
        relay
            .handle_frame(&amy, r#"{"action":"join-game","data":"Amy"}"#)
            .await;
        relay
            .handle_frame(&ghost, r#"{"action":"join-game","data":"Ghost"}"#)
            .await;

        for _ in 0..200 {
            if relay.registry().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(relay.registry().len(), 1);
        let snapshot = relay.hub().snapshot("main").await.unwrap();
        assert_eq!(snapshot.players.len(), 1);
        assert!(relay.delivery_failures() >= 1);
    }

    #[tokio::test]
    async fn test_analyze_clip() {
        let relay = relay(ScriptedConnector::default());
        let (transcript, event) = relay.analyze_clip(&[0u8; 3200]).await.unwrap();
        assert_eq!(transcript.text, "haha");
        assert!(event.unwrap().confidence > 0.6);
        assert!(relay.analyze_clip(&[]).await.is_err());
    }
}
