//! Registry of running games and of which connection plays in which game.
//!
//! Games are created lazily on first use with the limits from the current
//! configuration. The default game always exists; other games retire once
//! their last player leaves and nobody joined in the meantime.

use super::orchestrator::{GameHandle, GameStats};
use super::state::{GameLimits, GameSnapshot, TurnInfo};
use crate::bridge::GenerationTracker;
use crate::config::AppConfig;
use crate::connection::{Broadcaster, ConnectionId, ConnectionRegistry};
use crate::detection::DetectionEnvelope;
use crate::error::{AppError, AppResult};
use crate::protocol::GameEvent;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct GameHub {
    games: RwLock<HashMap<String, GameHandle>>,
    memberships: RwLock<HashMap<ConnectionId, String>>,
    registry: Arc<ConnectionRegistry>,
    broadcaster: Arc<Broadcaster>,
    config: Arc<RwLock<AppConfig>>,
    stats: Arc<GameStats>,
}

impl GameHub {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        broadcaster: Arc<Broadcaster>,
        config: Arc<RwLock<AppConfig>>,
    ) -> Self {
        Self {
            games: RwLock::new(HashMap::new()),
            memberships: RwLock::new(HashMap::new()),
            registry,
            broadcaster,
            config,
            stats: Arc::new(GameStats::default()),
        }
    }

    pub fn stats(&self) -> &GameStats {
        &self.stats
    }

    pub fn default_game_id(&self) -> String {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .game
            .default_game_id
            .clone()
    }

    /// Handle for `id`, spawning the game if it is not running.
    pub fn game(&self, id: &str) -> GameHandle {
        if let Some(handle) = self
            .games
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .filter(|h| !h.is_closed())
        {
            return handle.clone();
        }

        let (limits, queue_capacity) = {
            let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
            (
                GameLimits::from(&config.game),
                config.performance.game_queue_capacity,
            )
        };

        let mut games = self.games.write().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have created it between the two locks
        if let Some(handle) = games.get(id).filter(|h| !h.is_closed()) {
            return handle.clone();
        }
        let (handle, _task) = GameHandle::spawn(
            id,
            limits,
            queue_capacity,
            self.broadcaster.clone(),
            self.stats.clone(),
        );
        info!("Created game '{}'", id);
        games.insert(id.to_string(), handle.clone());
        handle
    }

    pub fn game_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .games
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn membership(&self, conn: &ConnectionId) -> Option<String> {
        self.memberships
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(conn)
            .cloned()
    }

    /// Game a connection acts on: where it plays, else where it listens,
    /// else the default game.
    fn game_id_for(&self, conn: &ConnectionId) -> String {
        self.membership(conn)
            .or_else(|| self.registry.get(conn).and_then(|entry| entry.game))
            .unwrap_or_else(|| self.default_game_id())
    }

    /// Join `game_id` (or the default game), leaving any other game first.
    pub async fn join(
        &self,
        conn: &ConnectionId,
        name: &str,
        game_id: Option<&str>,
    ) -> AppResult<()> {
        let target = game_id
            .map(str::to_string)
            .unwrap_or_else(|| self.default_game_id());

        if let Some(previous) = self.membership(conn) {
            if previous != target {
                debug!("{} moving from game '{}' to '{}'", conn, previous, target);
                self.leave(conn, &previous).await;
            }
        }

        self.registry.subscribe(conn, &target)?;
        let handle = self.game(&target);
        match handle.join(conn.clone(), name.to_string()).await {
            // Retired between lookup and join; the next lookup respawns it
            Err(_) if handle.is_closed() => {
                debug!("Game '{}' retired under {}'s join, retrying", target, conn);
                self.game(&target).join(conn.clone(), name.to_string()).await?
            }
            result => result?,
        }
        self.memberships
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conn.clone(), target.clone());

        // Deregistered while the join was queued
        if self.registry.get(conn).is_none() {
            self.leave(conn, &target).await;
            return Err(AppError::ConnectionGone(conn.to_string()));
        }
        Ok(())
    }

    pub async fn start(&self, conn: &ConnectionId) -> AppResult<()> {
        let game_id = self.game_id_for(conn);
        self.game(&game_id).start(conn.clone()).await
    }

    /// Handle of the game `conn` plays in, or a `not-your-turn` reply when it
    /// plays in none.
    fn playing_in(&self, conn: &ConnectionId) -> AppResult<GameHandle> {
        match self.membership(conn) {
            Some(game_id) => Ok(self.game(&game_id)),
            None => {
                if let Err(e) = self.broadcaster.send_to(conn, &GameEvent::NotYourTurn) {
                    debug!("Could not reply to {}: {}", conn, e);
                }
                Err(AppError::NotYourTurn)
            }
        }
    }

    pub async fn submit_performance(&self, conn: &ConnectionId) -> AppResult<()> {
        self.playing_in(conn)?.submit_performance(conn.clone()).await
    }

    pub async fn performance_result(&self, conn: &ConnectionId, has_laughter: bool) -> AppResult<()> {
        self.playing_in(conn)?
            .performance_result(conn.clone(), has_laughter)
            .await
    }

    /// Turn `conn` is performing right now and its game's threshold, or
    /// None when `conn` plays in no game.
    pub async fn turn_info(&self, conn: &ConnectionId) -> Option<TurnInfo> {
        let game_id = self.membership(conn)?;
        match self.game(&game_id).turn_info(conn.clone()).await {
            Ok(turn) => Some(turn),
            Err(e) => {
                warn!("Could not read turn info for {}: {}", conn, e);
                None
            }
        }
    }

    /// Remove a departed connection from its game.
    pub async fn disconnect(&self, conn: &ConnectionId) {
        let removed = self
            .memberships
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(conn);
        if let Some(game_id) = removed {
            self.leave(conn, &game_id).await;
        }
    }

    async fn leave(&self, conn: &ConnectionId, game_id: &str) {
        self.memberships
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(conn);

        let handle = self.game(game_id);
        let remaining = match handle.disconnect(conn.clone()).await {
            Ok(remaining) => remaining,
            Err(e) => {
                warn!("Failed to remove {} from game '{}': {}", conn, game_id, e);
                return;
            }
        };

        if remaining > 0 || game_id == self.default_game_id() {
            return;
        }
        // A join queued behind the disconnect makes the retire refuse
        match handle.retire().await {
            Ok(true) => {
                let mut games = self.games.write().unwrap_or_else(PoisonError::into_inner);
                if games.get(game_id).is_some_and(|h| h.same_game(&handle)) {
                    games.remove(game_id);
                }
                info!("Game '{}' is empty and was removed", game_id);
            }
            Ok(false) => debug!("Game '{}' gained a player before it could retire", game_id),
            Err(e) => debug!("Game '{}' already stopped: {}", game_id, e),
        }
    }

    /// Snapshot of a running game. The default game always exists.
    pub async fn snapshot(&self, game_id: &str) -> AppResult<GameSnapshot> {
        if game_id == self.default_game_id() {
            return self.game(game_id).snapshot().await;
        }
        let handle = self
            .games
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(game_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("game '{}'", game_id)))?;
        handle.snapshot().await
    }

    /// Forward bridge detections to the game each performer plays in.
    ///
    /// Envelopes from a bridge generation that has since been replaced or
    /// closed are dropped here, before they can reach a game.
    pub async fn route_detections(
        self: Arc<Self>,
        mut receiver: mpsc::Receiver<DetectionEnvelope>,
        generations: Arc<GenerationTracker>,
    ) {
        while let Some(envelope) = receiver.recv().await {
            let DetectionEnvelope {
                connection_id,
                player_id,
                generation,
                event,
            } = envelope;

            if !generations.is_current(&connection_id, generation) {
                self.stats.detections_stale.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Dropping detection from retired bridge generation {} of {}",
                    generation, connection_id
                );
                continue;
            }

            let Some(game_id) = self.membership(&connection_id) else {
                debug!(
                    "Detection for {} (player {}) who is in no game",
                    connection_id, player_id
                );
                continue;
            };

            if let Err(e) = self.game(&game_id).detection(connection_id, event).await {
                warn!("Failed to forward detection to game '{}': {}", game_id, e);
            }
        }
        debug!("Detection router stopped");
    }
}
