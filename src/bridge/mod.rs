//! # Session Bridge
//!
//! Owns, per performing connection, the channel between the client's audio
//! and the upstream speech service.
//!
//! ## Strategies:
//! - **live**: one persistent upstream connection per session; the service
//!   itself reports laughter through a capability call
//! - **batch**: chunks accumulate in the ingest buffer and are transcribed
//!   and classified every few seconds, no long-lived socket needed
//!
//! Both strategies run as one worker task per session. The worker is the
//! only owner of its upstream sender, so writes are serialized by
//! construction. The client side talks to it through an ordered command
//! queue: `feed` assigns the sequence index and enqueues, `end` enqueues the
//! flush request, and `close` cancels the worker outright.
//!
//! Sequence indices are counted per connection, not per session, and are
//! only forgotten when the connection is released.
//!
//! ## Generations:
//! Every `start` bumps the connection's bridge generation. Detections are
//! stamped with it and the router drops any that arrive after their
//! generation was replaced or closed.

pub mod batch;
pub mod live;

use crate::audio::buffer::ChunkStore;
use crate::audio::processor::AudioProcessor;
use crate::audio::session::Session;
use crate::config::{AppConfig, BridgeMode};
use crate::connection::{Broadcaster, ConnectionId};
use crate::detection::{BatchClassifier, DetectionEnvelope, DetectionEvent, VerdictTracker};
use crate::error::{AppError, AppResult};
use crate::game::state::TurnInfo;
use crate::protocol::ServerMessage;
use crate::secrets::SecretsVault;
use crate::upstream::{BatchAnalyzer, UpstreamConnector};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Latest bridge generation per connection.
#[derive(Debug, Default)]
pub struct GenerationTracker {
    counter: AtomicU64,
    current: Mutex<HashMap<ConnectionId, u64>>,
}

impl GenerationTracker {
    /// Allocate a new generation for `conn`, superseding the previous one.
    pub fn next(&self, conn: &ConnectionId) -> u64 {
        let generation = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conn.clone(), generation);
        generation
    }

    pub fn is_current(&self, conn: &ConnectionId, generation: u64) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(conn)
            .is_some_and(|current| *current == generation)
    }

    /// Retire `generation` if it is still the latest one for `conn`.
    pub fn retire(&self, conn: &ConnectionId, generation: u64) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.get(conn) == Some(&generation) {
            current.remove(conn);
        }
    }

    /// Retire whatever generation `conn` has.
    pub fn retire_all(&self, conn: &ConnectionId) {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(conn);
    }
}

/// Ordered input for a bridge worker.
#[derive(Debug)]
pub enum BridgeCommand {
    Audio { sequence: u64, bytes: Vec<u8> },
    End,
}

/// How a worker finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Flushed and closed on request; the final verdict was submitted
    Ended,
    /// Upstream failure; the client got an error frame
    Failed,
    /// Cancelled by `close` or a replacing `start`
    Cancelled,
}

/// What a worker shares with the rest of the relay.
pub struct BridgeContext {
    pub session: Arc<Session>,
    pub api_key: String,
    pub broadcaster: Arc<Broadcaster>,
    pub detections: mpsc::Sender<DetectionEnvelope>,
    pub cancel: CancellationToken,
    pub tracker: VerdictTracker,
}

impl BridgeContext {
    /// Frame for the owning client. A vanished client is not the worker's
    /// problem; the relay tears the bridge down when it deregisters.
    pub fn notify(&self, message: &ServerMessage) {
        if let Err(e) = self.broadcaster.send_to(&self.session.connection_id, message) {
            debug!(
                "Could not notify {}: {}",
                self.session.connection_id, e
            );
        }
    }

    /// Forward a detection to the client and, if it settles the turn, to the
    /// game.
    pub async fn report(&mut self, event: DetectionEvent) {
        self.notify(&ServerMessage::LaughterDetected {
            data: event.report(),
        });
        if let Some(verdict) = self.tracker.observe(&event) {
            self.submit(verdict).await;
        }
    }

    async fn submit(&self, event: DetectionEvent) {
        let envelope = DetectionEnvelope {
            connection_id: self.session.connection_id.clone(),
            player_id: self.session.player_id.clone(),
            generation: self.session.generation,
            event,
        };
        if self.detections.send(envelope).await.is_err() {
            warn!("Detection channel closed, verdict dropped");
        }
    }

    /// Close the session normally and submit any verdict still owed.
    pub async fn finish(mut self) -> WorkerExit {
        self.session.close();
        self.notify(&ServerMessage::SessionEnded);
        if let Some(verdict) = self.tracker.finish(self.session.epoch) {
            self.submit(verdict).await;
        }
        info!(
            "Session {} ended after {} chunks, {} bytes ({:.1}s)",
            self.session.session_id,
            self.session.chunks_received(),
            self.session.audio_bytes(),
            self.session.duration_seconds()
        );
        WorkerExit::Ended
    }

    /// Tear down after an upstream failure.
    pub fn fail(self, err: AppError) -> WorkerExit {
        warn!(
            "Session {} for {} failed: {}",
            self.session.session_id, self.session.connection_id, err
        );
        self.session.close();
        self.notify(&ServerMessage::error(&err));
        WorkerExit::Failed
    }

    pub fn cancelled(self) -> WorkerExit {
        debug!("Session {} cancelled", self.session.session_id);
        self.session.close();
        WorkerExit::Cancelled
    }
}

struct BridgeHandle {
    session: Arc<Session>,
    commands: mpsc::Sender<BridgeCommand>,
    cancel: CancellationToken,
    _task: JoinHandle<()>,
}

/// Starts, feeds, ends and closes session bridges.
pub struct BridgeManager {
    sessions: Arc<Mutex<HashMap<ConnectionId, BridgeHandle>>>,
    sequences: Mutex<HashMap<ConnectionId, Arc<AtomicU64>>>,
    generations: Arc<GenerationTracker>,
    vault: Arc<SecretsVault>,
    connector: Arc<dyn UpstreamConnector>,
    analyzer: Arc<dyn BatchAnalyzer>,
    store: Arc<dyn ChunkStore>,
    processor: AudioProcessor,
    broadcaster: Arc<Broadcaster>,
    detections: mpsc::Sender<DetectionEnvelope>,
    config: Arc<RwLock<AppConfig>>,
}

impl BridgeManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        generations: Arc<GenerationTracker>,
        vault: Arc<SecretsVault>,
        connector: Arc<dyn UpstreamConnector>,
        analyzer: Arc<dyn BatchAnalyzer>,
        store: Arc<dyn ChunkStore>,
        broadcaster: Arc<Broadcaster>,
        detections: mpsc::Sender<DetectionEnvelope>,
        config: Arc<RwLock<AppConfig>>,
    ) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            sequences: Mutex::new(HashMap::new()),
            generations,
            vault,
            connector,
            analyzer,
            store,
            processor: AudioProcessor::default(),
            broadcaster,
            detections,
            config,
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<ConnectionId, BridgeHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn processor(&self) -> &AudioProcessor {
        &self.processor
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions().len()
    }

    pub fn session(&self, conn: &ConnectionId) -> Option<Arc<Session>> {
        self.sessions().get(conn).map(|h| h.session.clone())
    }

    fn sequence_for(&self, conn: &ConnectionId) -> Arc<AtomicU64> {
        self.sequences
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(conn.clone())
            .or_default()
            .clone()
    }

    /// Open a session for `conn`.
    ///
    /// Credentials are resolved first; without them no session is created.
    /// A session that is still ending is retired and replaced. Verdicts are
    /// judged against the threshold of `turn`'s game, or the configured one
    /// when the connection plays in no game.
    pub async fn start(
        &self,
        conn: &ConnectionId,
        player_id: Option<String>,
        turn: Option<TurnInfo>,
    ) -> AppResult<Arc<Session>> {
        let config = self
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let api_key = self.vault.get(&config.upstream.api_key_secret).await?;
        let epoch = turn.and_then(|t| t.epoch);
        let threshold = turn.map_or(config.game.elimination_threshold, |t| {
            t.elimination_threshold
        });

        let (session, replaced) = {
            let mut sessions = self.sessions();
            if let Some(existing) = sessions.get(conn) {
                if existing.session.state().blocks_restart() {
                    return Err(AppError::Validation(format!(
                        "session already {} on this connection",
                        existing.session.state().as_str()
                    )));
                }
            }
            let others = sessions.keys().filter(|id| *id != conn).count();
            if others >= config.performance.max_concurrent_sessions {
                return Err(AppError::Validation(format!(
                    "session limit of {} reached",
                    config.performance.max_concurrent_sessions
                )));
            }

            let generation = self.generations.next(conn);
            let player_id = player_id.unwrap_or_else(|| conn.to_string());
            let session = Arc::new(Session::new(
                conn.clone(),
                player_id,
                generation,
                epoch,
                self.sequence_for(conn),
            ));
            session.begin_initializing()?;

            let (tx, rx) = mpsc::channel(config.bridge.command_queue_capacity.max(1));
            let cancel = CancellationToken::new();
            let context = BridgeContext {
                session: session.clone(),
                api_key,
                broadcaster: self.broadcaster.clone(),
                detections: self.detections.clone(),
                cancel: cancel.clone(),
                tracker: VerdictTracker::new(threshold),
            };
            let task = self.spawn_worker(context, &config, rx);

            let replaced = sessions.insert(
                conn.clone(),
                BridgeHandle {
                    session: session.clone(),
                    commands: tx,
                    cancel,
                    _task: task,
                },
            );
            (session, replaced)
        };

        if let Some(old) = replaced {
            debug!("Replacing ending session {}", old.session.session_id);
            old.cancel.cancel();
        }
        info!(
            "Session {} started for {} (player {}, {:?} mode, epoch {:?})",
            session.session_id, conn, session.player_id, config.bridge.mode, epoch
        );
        Ok(session)
    }

    fn spawn_worker(
        &self,
        context: BridgeContext,
        config: &AppConfig,
        commands: mpsc::Receiver<BridgeCommand>,
    ) -> JoinHandle<()> {
        let conn = context.session.connection_id.clone();
        let generation = context.session.generation;
        let sessions = self.sessions.clone();
        let generations = self.generations.clone();

        let worker: std::pin::Pin<Box<dyn std::future::Future<Output = WorkerExit> + Send>> =
            match config.bridge.mode {
                BridgeMode::Live => Box::pin(live::run(
                    context,
                    self.connector.clone(),
                    config.upstream.clone(),
                    commands,
                )),
                BridgeMode::Batch => Box::pin(batch::run(
                    context,
                    batch::BatchSettings {
                        classifier: BatchClassifier::new(
                            self.analyzer.clone(),
                            config.batch.model_max_chars,
                        ),
                        store: self.store.clone(),
                        processor: self.processor.clone(),
                        chunks_per_batch: config.batch.chunks_per_batch,
                    },
                    commands,
                )),
            };

        tokio::spawn(async move {
            let exit = worker.await;
            debug!("Bridge worker for {} exited: {:?}", conn, exit);
            if exit == WorkerExit::Failed {
                generations.retire(&conn, generation);
            }
            let mut sessions = sessions.lock().unwrap_or_else(PoisonError::into_inner);
            if sessions
                .get(&conn)
                .is_some_and(|h| h.session.generation == generation)
            {
                sessions.remove(&conn);
            }
        })
    }

    /// Queue decoded audio for the connection's session, in arrival order.
    /// Returns the sequence index the chunk was given.
    pub fn feed(&self, conn: &ConnectionId, bytes: Vec<u8>) -> AppResult<u64> {
        let sessions = self.sessions();
        let handle = sessions
            .get(conn)
            .ok_or_else(|| AppError::Validation("no active session".to_string()))?;
        if !handle.session.accepts_audio() {
            return Err(AppError::Validation(format!(
                "session is {}",
                handle.session.state().as_str()
            )));
        }

        let sequence = handle.session.next_sequence(bytes.len());
        handle
            .commands
            .try_send(BridgeCommand::Audio { sequence, bytes })
            .map(|()| sequence)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    AppError::Validation("audio backlog, chunk dropped".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    AppError::Validation("session is closing".to_string())
                }
            })
    }

    /// Ask the connection's session to flush and close.
    pub async fn end(&self, conn: &ConnectionId) -> AppResult<()> {
        let commands = self
            .sessions()
            .get(conn)
            .map(|h| h.commands.clone())
            .ok_or_else(|| AppError::Validation("no active session".to_string()))?;
        commands
            .send(BridgeCommand::End)
            .await
            .map_err(|_| AppError::Validation("session is closing".to_string()))
    }

    /// Cancel the connection's session without waiting for anything.
    /// Late results from it are dropped by the router.
    pub fn close(&self, conn: &ConnectionId) -> bool {
        self.generations.retire_all(conn);
        let removed = self.sessions().remove(conn);
        match removed {
            Some(handle) => {
                handle.cancel.cancel();
                handle.session.close();
                debug!("Closed session {} for {}", handle.session.session_id, conn);
                true
            }
            None => false,
        }
    }

    /// Close the connection's session and forget its sequence counter.
    pub fn release(&self, conn: &ConnectionId) -> bool {
        let closed = self.close(conn);
        self.sequences
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(conn);
        closed
    }
}
