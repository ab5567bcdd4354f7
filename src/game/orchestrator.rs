//! Per-game command worker.
//!
//! Every game runs in its own task that owns a [`GameState`] and processes
//! [`GameCommand`]s strictly in arrival order. Joins, starts, detections and
//! disconnects can therefore never interleave halfway through a transition.
//! Callers talk to the task through a [`GameHandle`]; replies come back on
//! oneshot channels.

use super::state::{
    DetectionOutcome, DisconnectOutcome, GameLimits, GameSnapshot, GameState, TurnInfo,
    TurnOutcome, TurnVerdict, ELIMINATION_REASON,
};
use crate::connection::{Broadcaster, ConnectionId};
use crate::detection::DetectionEvent;
use crate::error::{AppError, AppResult};
use crate::protocol::{GameEvent, ServerMessage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Message broadcast when the last performers are eliminated together.
pub const NO_WINNER_MESSAGE: &str = "Everyone was eliminated!";

#[derive(Debug)]
pub enum GameCommand {
    Join {
        player: ConnectionId,
        name: String,
        response_tx: oneshot::Sender<AppResult<()>>,
    },
    Start {
        requested_by: ConnectionId,
        response_tx: oneshot::Sender<AppResult<()>>,
    },
    /// Fire-and-forget verdict from a session bridge
    Detection {
        player: ConnectionId,
        event: DetectionEvent,
    },
    SubmitPerformance {
        player: ConnectionId,
        response_tx: oneshot::Sender<AppResult<()>>,
    },
    PerformanceResult {
        player: ConnectionId,
        has_laughter: bool,
        response_tx: oneshot::Sender<AppResult<()>>,
    },
    TurnInfo {
        player: ConnectionId,
        response_tx: oneshot::Sender<TurnInfo>,
    },
    /// Replies with the number of players left on the roster
    Disconnect {
        player: ConnectionId,
        response_tx: oneshot::Sender<usize>,
    },
    Snapshot {
        response_tx: oneshot::Sender<GameSnapshot>,
    },
    /// Stop the worker if nobody is on the roster. Replies whether it did;
    /// commands queued behind a successful retire are dropped unanswered.
    Retire {
        response_tx: oneshot::Sender<bool>,
    },
}

/// Counters shared by every game task.
#[derive(Debug, Default)]
pub struct GameStats {
    pub detections_applied: AtomicU64,
    pub detections_stale: AtomicU64,
    pub eliminations: AtomicU64,
    pub games_finished: AtomicU64,
}

impl GameStats {
    pub fn applied(&self) -> u64 {
        self.detections_applied.load(Ordering::Relaxed)
    }

    pub fn stale(&self) -> u64 {
        self.detections_stale.load(Ordering::Relaxed)
    }

    pub fn eliminated(&self) -> u64 {
        self.eliminations.load(Ordering::Relaxed)
    }

    pub fn finished(&self) -> u64 {
        self.games_finished.load(Ordering::Relaxed)
    }
}

/// Cloneable sender side of a game task.
#[derive(Debug, Clone)]
pub struct GameHandle {
    id: String,
    sender: mpsc::Sender<GameCommand>,
}

impl GameHandle {
    /// Spawn the worker task for a new game.
    pub fn spawn(
        id: impl Into<String>,
        limits: GameLimits,
        queue_capacity: usize,
        broadcaster: Arc<Broadcaster>,
        stats: Arc<GameStats>,
    ) -> (Self, JoinHandle<()>) {
        let id = id.into();
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let state = GameState::new(id.clone(), limits);
        let worker = GameWorker {
            state,
            broadcaster,
            stats,
        };
        let handle = tokio::spawn(worker.run(receiver));
        (Self { id, sender }, handle)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Whether both handles drive the same game task.
    pub fn same_game(&self, other: &GameHandle) -> bool {
        self.sender.same_channel(&other.sender)
    }

    async fn queue(&self, command: GameCommand) -> AppResult<()> {
        self.sender.send(command).await.map_err(|_| {
            AppError::Internal(format!("game '{}' task stopped", self.id))
        })
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> GameCommand,
    ) -> AppResult<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.queue(build(response_tx)).await?;
        response_rx.await.map_err(|_| {
            AppError::Internal(format!("game '{}' dropped the request", self.id))
        })
    }

    pub async fn join(&self, player: ConnectionId, name: String) -> AppResult<()> {
        self.request(|response_tx| GameCommand::Join {
            player,
            name,
            response_tx,
        })
        .await?
    }

    pub async fn start(&self, requested_by: ConnectionId) -> AppResult<()> {
        self.request(|response_tx| GameCommand::Start {
            requested_by,
            response_tx,
        })
        .await?
    }

    pub async fn detection(&self, player: ConnectionId, event: DetectionEvent) -> AppResult<()> {
        self.queue(GameCommand::Detection { player, event }).await
    }

    pub async fn submit_performance(&self, player: ConnectionId) -> AppResult<()> {
        self.request(|response_tx| GameCommand::SubmitPerformance {
            player,
            response_tx,
        })
        .await?
    }

    pub async fn performance_result(
        &self,
        player: ConnectionId,
        has_laughter: bool,
    ) -> AppResult<()> {
        self.request(|response_tx| GameCommand::PerformanceResult {
            player,
            has_laughter,
            response_tx,
        })
        .await?
    }

    pub async fn turn_info(&self, player: ConnectionId) -> AppResult<TurnInfo> {
        self.request(|response_tx| GameCommand::TurnInfo {
            player,
            response_tx,
        })
        .await
    }

    pub async fn disconnect(&self, player: ConnectionId) -> AppResult<usize> {
        self.request(|response_tx| GameCommand::Disconnect {
            player,
            response_tx,
        })
        .await
    }

    pub async fn snapshot(&self) -> AppResult<GameSnapshot> {
        self.request(|response_tx| GameCommand::Snapshot { response_tx })
            .await
    }

    pub async fn retire(&self) -> AppResult<bool> {
        self.request(|response_tx| GameCommand::Retire { response_tx })
            .await
    }
}

struct GameWorker {
    state: GameState,
    broadcaster: Arc<Broadcaster>,
    stats: Arc<GameStats>,
}

impl GameWorker {
    async fn run(mut self, mut receiver: mpsc::Receiver<GameCommand>) {
        info!("Game '{}' worker started", self.state.id());
        while let Some(command) = receiver.recv().await {
            if let GameCommand::Retire { response_tx } = command {
                let empty = self.state.players().is_empty();
                let _ = response_tx.send(empty);
                if empty {
                    break;
                }
                continue;
            }
            self.handle(command);
        }
        debug!("Game '{}' worker stopped", self.state.id());
    }

    fn handle(&mut self, command: GameCommand) {
        match command {
            GameCommand::Join {
                player,
                name,
                response_tx,
            } => {
                let result = self.join(&player, &name);
                let _ = response_tx.send(result);
            }
            GameCommand::Start {
                requested_by,
                response_tx,
            } => {
                let result = self.start(&requested_by);
                let _ = response_tx.send(result);
            }
            GameCommand::Detection { player, event } => self.detection(&player, event),
            GameCommand::SubmitPerformance {
                player,
                response_tx,
            } => {
                let result = self.submit_performance(&player);
                let _ = response_tx.send(result);
            }
            GameCommand::PerformanceResult {
                player,
                has_laughter,
                response_tx,
            } => {
                let result = self.performance_result(&player, has_laughter);
                let _ = response_tx.send(result);
            }
            GameCommand::TurnInfo {
                player,
                response_tx,
            } => {
                let _ = response_tx.send(self.state.turn_info_for(&player));
            }
            GameCommand::Disconnect {
                player,
                response_tx,
            } => {
                self.disconnect(&player);
                let _ = response_tx.send(self.state.players().len());
            }
            GameCommand::Snapshot { response_tx } => {
                let _ = response_tx.send(self.state.snapshot());
            }
            GameCommand::Retire { response_tx } => {
                let _ = response_tx.send(false);
            }
        }
    }

    fn broadcast(&self, event: &GameEvent) {
        self.broadcaster.broadcast_to_game(self.state.id(), event);
    }

    /// Direct reply to one connection. A vanished requester is not an error
    /// for the game.
    fn reply(&self, to: &ConnectionId, event: &GameEvent) {
        if let Err(e) = self.broadcaster.send_to(to, event) {
            debug!("Could not reply to {}: {}", to, e);
        }
    }

    fn reply_error(&self, to: &ConnectionId, err: &AppError) {
        if let Err(e) = self.broadcaster.send_to(to, &ServerMessage::error(err)) {
            debug!("Could not send error to {}: {}", to, e);
        }
    }

    fn roster_update(&self) {
        self.broadcast(&GameEvent::PlayerListUpdate(self.state.players().to_vec()));
    }

    fn join(&mut self, player: &ConnectionId, name: &str) -> AppResult<()> {
        match self.state.join(player.clone(), name) {
            Ok(joined) => {
                let joined_name = joined.name.clone();
                info!(
                    "Player '{}' ({}) joined game '{}'",
                    joined_name,
                    player,
                    self.state.id()
                );
                self.reply(
                    player,
                    &GameEvent::PlayerJoined {
                        player_id: player.clone(),
                        game_id: self.state.id().to_string(),
                        players: self.state.players().to_vec(),
                    },
                );
                self.roster_update();
                Ok(())
            }
            Err(err) => {
                match &err {
                    AppError::Capacity { max } => {
                        self.reply(player, &GameEvent::GameFull { max_players: *max })
                    }
                    AppError::InvalidState(_) if self.state.player(player).is_none() => {
                        self.reply(player, &GameEvent::GameInProgress)
                    }
                    other => self.reply_error(player, other),
                }
                Err(err)
            }
        }
    }

    fn start(&mut self, requested_by: &ConnectionId) -> AppResult<()> {
        match self.state.start() {
            Ok((current_player, round)) => {
                info!(
                    "Game '{}' started with {} players",
                    self.state.id(),
                    self.state.players().len()
                );
                self.broadcast(&GameEvent::GameStarted {
                    current_player,
                    round,
                });
                Ok(())
            }
            Err(err) => {
                match &err {
                    AppError::NotEnoughPlayers { present, required } => self.reply(
                        requested_by,
                        &GameEvent::NotEnoughPlayers {
                            present: *present,
                            required: *required,
                        },
                    ),
                    other => self.reply_error(requested_by, other),
                }
                Err(err)
            }
        }
    }

    fn detection(&mut self, player: &ConnectionId, event: DetectionEvent) {
        match self.state.on_detection(player, event.confidence, event.epoch) {
            DetectionOutcome::Stale => {
                self.stats.detections_stale.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Discarding stale detection for {} (epoch {:?}, current {})",
                    player,
                    event.epoch,
                    self.state.epoch()
                );
            }
            DetectionOutcome::Applied(verdict) => {
                self.stats.detections_applied.fetch_add(1, Ordering::Relaxed);
                self.announce(verdict);
            }
        }
    }

    fn submit_performance(&mut self, player: &ConnectionId) -> AppResult<()> {
        match self.state.ensure_turn(player) {
            Ok(()) => {
                self.reply(player, &GameEvent::PerformanceReceived);
                Ok(())
            }
            Err(err) => {
                self.turn_rejection(player, &err);
                Err(err)
            }
        }
    }

    fn performance_result(&mut self, player: &ConnectionId, has_laughter: bool) -> AppResult<()> {
        match self.state.performance_result(player, has_laughter) {
            Ok(verdict) => {
                self.announce(verdict);
                Ok(())
            }
            Err(err) => {
                self.turn_rejection(player, &err);
                Err(err)
            }
        }
    }

    fn turn_rejection(&self, player: &ConnectionId, err: &AppError) {
        match err {
            AppError::NotYourTurn => self.reply(player, &GameEvent::NotYourTurn),
            other => self.reply_error(player, other),
        }
    }

    /// Broadcast a concluded turn: the elimination (if any), then where the
    /// turn went.
    fn announce(&mut self, verdict: TurnVerdict) {
        if let Some(player) = verdict.eliminated {
            self.stats.eliminations.fetch_add(1, Ordering::Relaxed);
            info!(
                "Player '{}' eliminated from game '{}' (confidence {:.2})",
                player.name,
                self.state.id(),
                verdict.confidence
            );
            self.broadcast(&GameEvent::PlayerEliminated {
                player_id: player.id,
                player_name: player.name,
                reason: ELIMINATION_REASON.to_string(),
                confidence: verdict.confidence,
            });
        }
        self.announce_turn(verdict.turn);
    }

    fn announce_turn(&mut self, outcome: TurnOutcome) {
        match outcome {
            TurnOutcome::Next {
                current,
                round,
            } => self.broadcast(&GameEvent::NextTurn {
                current_player: current,
                round,
            }),
            TurnOutcome::Over { winner } => {
                self.stats.games_finished.fetch_add(1, Ordering::Relaxed);
                match &winner {
                    Some(w) => info!("Game '{}' won by '{}'", self.state.id(), w.name),
                    None => info!("Game '{}' ended with no survivors", self.state.id()),
                }
                let message = winner.is_none().then(|| NO_WINNER_MESSAGE.to_string());
                self.broadcast(&GameEvent::GameOver { winner, message });
            }
        }
    }

    fn disconnect(&mut self, player: &ConnectionId) {
        match self.state.disconnect(player) {
            DisconnectOutcome::NotPresent => {}
            DisconnectOutcome::Removed => {
                info!("Player {} left game '{}'", player, self.state.id());
                self.roster_update();
            }
            DisconnectOutcome::TurnChanged(outcome) => {
                warn!(
                    "Player {} left game '{}' mid-game, turn moves on",
                    player,
                    self.state.id()
                );
                self.announce_turn(outcome);
                self.roster_update();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::registry::tests::RecordingSink;
    use crate::connection::ConnectionRegistry;
    use crate::game::state::TurnEpoch;
    use serde_json::Value;

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        game: GameHandle,
        stats: Arc<GameStats>,
    }

    impl Harness {
        fn new(limits: GameLimits) -> Self {
            let registry = Arc::new(ConnectionRegistry::new());
            let (broadcaster, _evictions) = Broadcaster::new(registry.clone());
            let stats = Arc::new(GameStats::default());
            let (game, _task) =
                GameHandle::spawn("main", limits, 16, Arc::new(broadcaster), stats.clone());
            Self {
                registry,
                game,
                stats,
            }
        }

        fn connect(&self) -> (ConnectionId, Arc<RecordingSink>) {
            let sink = Arc::new(RecordingSink::default());
            let id = self.registry.register(sink.clone());
            self.registry.subscribe(&id, "main").unwrap();
            (id, sink)
        }
    }

    fn limits() -> GameLimits {
        GameLimits {
            max_players: 3,
            min_players: 2,
            elimination_threshold: 0.6,
        }
    }

    fn events(sink: &RecordingSink) -> Vec<String> {
        sink.json()
            .iter()
            .filter_map(|frame| frame.get("event").and_then(Value::as_str).map(String::from))
            .collect()
    }

    fn detection(confidence: f32, epoch: Option<TurnEpoch>) -> DetectionEvent {
        DetectionEvent::new(confidence, "giggling", epoch)
    }

    #[tokio::test]
    async fn test_join_and_start_broadcast() {
        let h = Harness::new(limits());
        let (amy, amy_sink) = h.connect();
        let (bo, bo_sink) = h.connect();

        h.game.join(amy.clone(), "Amy".into()).await.unwrap();
        let err = h.game.start(amy.clone()).await.unwrap_err();
        assert_eq!(err.code(), "not_enough_players");

        h.game.join(bo.clone(), "Bo".into()).await.unwrap();
        h.game.start(bo.clone()).await.unwrap();
        let _ = h.game.snapshot().await.unwrap();

        assert_eq!(
            events(&amy_sink),
            vec![
                "player-joined",
                "player-list-update",
                "not-enough-players",
                "player-list-update",
                "game-started"
            ]
        );
        assert_eq!(
            events(&bo_sink),
            vec![
                "player-list-update",
                "player-joined",
                "player-list-update",
                "game-started"
            ]
        );
    }

    #[tokio::test]
    async fn test_capacity_and_in_progress_rejections() {
        let h = Harness::new(limits());
        let mut sinks = Vec::new();
        for name in ["Amy", "Bo", "Cee"] {
            let (id, sink) = h.connect();
            h.game.join(id, name.into()).await.unwrap();
            sinks.push(sink);
        }
        let (dee, dee_sink) = h.connect();
        let err = h.game.join(dee.clone(), "Dee".into()).await.unwrap_err();
        assert_eq!(err.code(), "game_full");
        assert_eq!(events(&dee_sink).last().map(String::as_str), Some("game-full"));

        let snapshot = h.game.snapshot().await.unwrap();
        h.game.start(snapshot.players[0].id.clone()).await.unwrap();
        let err = h.game.join(dee, "Dee".into()).await.unwrap_err();
        assert_eq!(err.code(), "invalid_state");
        assert_eq!(
            events(&dee_sink).last().map(String::as_str),
            Some("game-in-progress")
        );
    }

    #[tokio::test]
    async fn test_detection_eliminates_and_ends_game() {
        let h = Harness::new(limits());
        let (amy, amy_sink) = h.connect();
        let (bo, _) = h.connect();
        h.game.join(amy.clone(), "Amy".into()).await.unwrap();
        h.game.join(bo.clone(), "Bo".into()).await.unwrap();
        h.game.start(amy.clone()).await.unwrap();

        let turn = h.game.turn_info(amy.clone()).await.unwrap();
        let epoch = turn.epoch;
        assert!(epoch.is_some());
        assert!((turn.elimination_threshold - 0.6).abs() < f32::EPSILON);
        assert_eq!(h.game.turn_info(bo.clone()).await.unwrap().epoch, None);

        h.game.detection(amy.clone(), detection(0.9, epoch)).await.unwrap();
        let snapshot = h.game.snapshot().await.unwrap();
        assert_eq!(snapshot.eliminated, vec![amy.clone()]);

        let frames = amy_sink.json();
        let eliminated = frames
            .iter()
            .find(|f| f["event"] == "player-eliminated")
            .unwrap();
        assert_eq!(eliminated["data"]["reason"], ELIMINATION_REASON);
        let over = frames.iter().find(|f| f["event"] == "game-over").unwrap();
        assert_eq!(over["data"]["winner"]["name"], "Bo");
        assert_eq!(h.stats.eliminated(), 1);
        assert_eq!(h.stats.finished(), 1);
    }

    #[tokio::test]
    async fn test_stale_detection_is_counted_not_applied() {
        let h = Harness::new(limits());
        let (amy, _) = h.connect();
        let (bo, bo_sink) = h.connect();
        h.game.join(amy.clone(), "Amy".into()).await.unwrap();
        h.game.join(bo.clone(), "Bo".into()).await.unwrap();
        h.game.start(amy.clone()).await.unwrap();
        let old_epoch = h.game.turn_info(amy.clone()).await.unwrap().epoch;

        h.game.performance_result(amy.clone(), false).await.unwrap();
        h.game.detection(amy.clone(), detection(0.95, old_epoch)).await.unwrap();
        h.game.detection(bo.clone(), detection(0.95, None)).await.unwrap();

        let snapshot = h.game.snapshot().await.unwrap();
        assert!(snapshot.eliminated.is_empty());
        assert_eq!(snapshot.current_player, Some(bo));
        assert_eq!(h.stats.stale(), 2);
        assert_eq!(h.stats.applied(), 0);
        assert_eq!(events(&bo_sink).last().map(String::as_str), Some("next-turn"));
    }

    #[tokio::test]
    async fn test_turn_actions_from_wrong_player() {
        let h = Harness::new(limits());
        let (amy, _) = h.connect();
        let (bo, bo_sink) = h.connect();
        h.game.join(amy.clone(), "Amy".into()).await.unwrap();
        h.game.join(bo.clone(), "Bo".into()).await.unwrap();
        h.game.start(amy.clone()).await.unwrap();

        let err = h.game.performance_result(bo.clone(), true).await.unwrap_err();
        assert!(matches!(err, AppError::NotYourTurn));
        let err = h.game.submit_performance(bo.clone()).await.unwrap_err();
        assert!(matches!(err, AppError::NotYourTurn));
        assert_eq!(
            events(&bo_sink)
                .iter()
                .filter(|e| e.as_str() == "not-your-turn")
                .count(),
            2
        );

        h.game.submit_performance(amy).await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_of_current_performer() {
        let h = Harness::new(limits());
        let (amy, _) = h.connect();
        let (bo, bo_sink) = h.connect();
        let (cee, _) = h.connect();
        for (id, name) in [(&amy, "Amy"), (&bo, "Bo"), (&cee, "Cee")] {
            h.game.join(id.clone(), name.into()).await.unwrap();
        }
        h.game.start(amy.clone()).await.unwrap();

        let remaining = h.game.disconnect(amy).await.unwrap();
        assert_eq!(remaining, 2);
        let snapshot = h.game.snapshot().await.unwrap();
        assert_eq!(snapshot.current_player, Some(bo));
        let tail: Vec<String> = events(&bo_sink).into_iter().rev().take(2).collect();
        assert_eq!(tail, vec!["player-list-update", "next-turn"]);
    }

    #[tokio::test]
    async fn test_last_player_standing_after_disconnect() {
        let h = Harness::new(limits());
        let (amy, amy_sink) = h.connect();
        let (bo, _) = h.connect();
        h.game.join(amy.clone(), "Amy".into()).await.unwrap();
        h.game.join(bo.clone(), "Bo".into()).await.unwrap();
        h.game.start(amy.clone()).await.unwrap();

        // Bo leaves first, so Amy wins by default
        h.game.disconnect(bo).await.unwrap();
        let over = amy_sink
            .json()
            .into_iter()
            .find(|f| f["event"] == "game-over")
            .unwrap();
        assert_eq!(over["data"]["winner"]["name"], "Amy");
        assert!(over["data"].get("message").is_none());
    }

    #[tokio::test]
    async fn test_retire_only_when_empty() {
        let h = Harness::new(limits());
        let (amy, _) = h.connect();
        let (bo, _) = h.connect();
        h.game.join(amy.clone(), "Amy".into()).await.unwrap();
        h.game.disconnect(amy).await.unwrap();

        // Bo's join is queued ahead of the retire and keeps the game alive
        let (joined, retired) = tokio::join!(h.game.join(bo.clone(), "Bo".into()), h.game.retire());
        joined.unwrap();
        assert!(!retired.unwrap());
        assert!(!h.game.is_closed());

        h.game.disconnect(bo.clone()).await.unwrap();
        assert!(h.game.retire().await.unwrap());
        assert!(h.game.join(bo, "Bo".into()).await.is_err());
        assert!(h.game.is_closed());
    }
}
