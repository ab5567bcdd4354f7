//! # Game State Machine
//!
//! Pure, synchronous rules of the elimination game. Nothing in here does I/O
//! or knows about tasks and sockets: the orchestrator owns one `GameState`,
//! applies commands to it one at a time, and broadcasts what the methods
//! return.
//!
//! ## Phases:
//! - **Lobby**: accepting joins
//! - **Active**: turns in progress, one current performer
//! - **Over**: terminal, with or without a winner
//!
//! ## Turn epochs:
//! Every change of current performer bumps `epoch`. Detections carry the
//! epoch they were produced under; a detection from an earlier epoch belongs
//! to a turn that has already ended and is discarded.

use crate::config::GameConfig;
use crate::connection::ConnectionId;
use crate::error::{AppError, AppResult};
use serde::Serialize;
use std::collections::HashSet;

pub type TurnEpoch = u64;

/// Reason broadcast when a performer is eliminated.
pub const ELIMINATION_REASON: &str = "Laughed during performance!";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: ConnectionId,
    pub name: String,
    pub is_alive: bool,
    /// Turns survived
    pub score: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "lowercase")]
pub enum GamePhase {
    Lobby,
    Active,
    Over { winner: Option<Player> },
}

/// Limits captured when the game is created. Runtime config changes apply
/// to games created afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameLimits {
    pub max_players: usize,
    pub min_players: usize,
    pub elimination_threshold: f32,
}

impl From<&GameConfig> for GameLimits {
    fn from(config: &GameConfig) -> Self {
        Self {
            max_players: config.max_players,
            min_players: config.min_players,
            elimination_threshold: config.elimination_threshold,
        }
    }
}

/// Turn a bridge is opened for, and the threshold its verdicts are judged
/// against. The threshold comes from the game's limits so that the bridge
/// and the game never disagree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TurnInfo {
    pub epoch: Option<TurnEpoch>,
    pub elimination_threshold: f32,
}

/// Where the turn went after it concluded.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Next { current: ConnectionId, round: u32 },
    Over { winner: Option<Player> },
}

/// A concluded turn: who (if anyone) was eliminated, and what happens next.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnVerdict {
    pub eliminated: Option<Player>,
    pub confidence: f32,
    pub turn: TurnOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DetectionOutcome {
    /// Not active, not the current performer, or from an earlier turn
    Stale,
    Applied(TurnVerdict),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DisconnectOutcome {
    NotPresent,
    /// Removed without affecting whose turn it is
    Removed,
    /// Removed, and the turn moved on (current left, or the win condition
    /// was met by the departure)
    TurnChanged(TurnOutcome),
}

/// Serializable view for the HTTP surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSnapshot {
    pub id: String,
    #[serde(flatten)]
    pub phase: GamePhase,
    pub players: Vec<Player>,
    pub current_player: Option<ConnectionId>,
    pub round: u32,
    pub eliminated: Vec<ConnectionId>,
    pub epoch: TurnEpoch,
    pub limits: GameLimits,
}

#[derive(Debug, Clone)]
pub struct GameState {
    id: String,
    phase: GamePhase,
    roster: Vec<Player>,
    current: Option<ConnectionId>,
    round: u32,
    eliminated: HashSet<ConnectionId>,
    epoch: TurnEpoch,
    limits: GameLimits,
}

impl GameState {
    pub fn new(id: impl Into<String>, limits: GameLimits) -> Self {
        Self {
            id: id.into(),
            phase: GamePhase::Lobby,
            roster: Vec::new(),
            current: None,
            round: 0,
            eliminated: HashSet::new(),
            epoch: 0,
            limits,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> &GamePhase {
        &self.phase
    }

    pub fn players(&self) -> &[Player] {
        &self.roster
    }

    pub fn current(&self) -> Option<&ConnectionId> {
        self.current.as_ref()
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn epoch(&self) -> TurnEpoch {
        self.epoch
    }

    pub fn player(&self, id: &ConnectionId) -> Option<&Player> {
        self.roster.iter().find(|p| &p.id == id)
    }

    /// Epoch of the turn `id` is performing right now, if any.
    pub fn turn_epoch_for(&self, id: &ConnectionId) -> Option<TurnEpoch> {
        match (&self.phase, &self.current) {
            (GamePhase::Active, Some(current)) if current == id => Some(self.epoch),
            _ => None,
        }
    }

    pub fn turn_info_for(&self, id: &ConnectionId) -> TurnInfo {
        TurnInfo {
            epoch: self.turn_epoch_for(id),
            elimination_threshold: self.limits.elimination_threshold,
        }
    }

    /// Add a player to the lobby.
    ///
    /// A game that is already over is replaced by a fresh lobby first.
    pub fn join(&mut self, id: ConnectionId, name: &str) -> AppResult<&Player> {
        if matches!(self.phase, GamePhase::Over { .. }) {
            self.reset_to_lobby();
        }
        if self.phase != GamePhase::Lobby {
            return Err(AppError::InvalidState("game already in progress".to_string()));
        }

        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::Validation("player name cannot be empty".to_string()));
        }
        if self.player(&id).is_some() {
            return Err(AppError::InvalidState("already joined this game".to_string()));
        }
        if self.roster.len() >= self.limits.max_players {
            return Err(AppError::Capacity {
                max: self.limits.max_players,
            });
        }

        self.roster.push(Player {
            id,
            name: name.to_string(),
            is_alive: true,
            score: 0,
        });
        Ok(&self.roster[self.roster.len() - 1])
    }

    /// Lobby → Active. Returns the first performer and the round.
    pub fn start(&mut self) -> AppResult<(ConnectionId, u32)> {
        match self.phase {
            GamePhase::Lobby => {}
            GamePhase::Active => {
                return Err(AppError::InvalidState("game already started".to_string()))
            }
            GamePhase::Over { .. } => {
                return Err(AppError::InvalidState("game is over".to_string()))
            }
        }
        if self.roster.len() < self.limits.min_players {
            return Err(AppError::NotEnoughPlayers {
                present: self.roster.len(),
                required: self.limits.min_players,
            });
        }

        for player in &mut self.roster {
            player.is_alive = true;
        }
        self.eliminated.clear();
        self.round = 1;
        let first = self.roster[0].id.clone();
        self.current = Some(first.clone());
        self.epoch += 1;
        self.phase = GamePhase::Active;
        Ok((first, self.round))
    }

    /// Apply a detection verdict for the current turn.
    ///
    /// Confidence strictly greater than the elimination threshold eliminates
    /// the performer. Either way the turn is concluded and passes on.
    pub fn on_detection(
        &mut self,
        player: &ConnectionId,
        confidence: f32,
        epoch: Option<TurnEpoch>,
    ) -> DetectionOutcome {
        if self.turn_epoch_for(player).is_none() || epoch != Some(self.epoch) {
            return DetectionOutcome::Stale;
        }
        let eliminate = confidence > self.limits.elimination_threshold;
        DetectionOutcome::Applied(self.conclude_turn(eliminate, confidence))
    }

    /// Client-reported verdict for the current turn.
    pub fn performance_result(
        &mut self,
        player: &ConnectionId,
        has_laughter: bool,
    ) -> AppResult<TurnVerdict> {
        if self.phase != GamePhase::Active {
            return Err(AppError::InvalidState("game is not active".to_string()));
        }
        if self.current.as_ref() != Some(player) {
            return Err(AppError::NotYourTurn);
        }
        let confidence = if has_laughter { 1.0 } else { 0.0 };
        Ok(self.conclude_turn(has_laughter, confidence))
    }

    /// Whether `player` may act on the current turn right now.
    pub fn ensure_turn(&self, player: &ConnectionId) -> AppResult<()> {
        if self.phase != GamePhase::Active {
            return Err(AppError::InvalidState("game is not active".to_string()));
        }
        if self.current.as_ref() != Some(player) {
            return Err(AppError::NotYourTurn);
        }
        Ok(())
    }

    fn conclude_turn(&mut self, eliminate: bool, confidence: f32) -> TurnVerdict {
        let mut eliminated = None;
        if let Some(current) = self.current.clone() {
            if let Some(player) = self.roster.iter_mut().find(|p| p.id == current) {
                if eliminate {
                    player.is_alive = false;
                    self.eliminated.insert(current);
                    eliminated = Some(player.clone());
                } else {
                    player.score += 1;
                }
            }
        }
        TurnVerdict {
            eliminated,
            confidence,
            turn: self.advance_turn(),
        }
    }

    /// Pass the turn to the next alive player in join order.
    pub fn advance_turn(&mut self) -> TurnOutcome {
        let from = self
            .current
            .as_ref()
            .and_then(|current| self.roster.iter().position(|p| &p.id == current))
            .map(|index| index + 1)
            .unwrap_or(0);
        self.advance_from(from)
    }

    /// Scan for the next alive player starting at roster position `start`,
    /// wrapping around. Landing before `start` means the cycle completed.
    fn advance_from(&mut self, start: usize) -> TurnOutcome {
        if self.phase != GamePhase::Active {
            return TurnOutcome::Over {
                winner: self.winner(),
            };
        }

        let alive: Vec<usize> = self
            .roster
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_alive)
            .map(|(i, _)| i)
            .collect();

        match alive.as_slice() {
            [] => self.finish(None),
            [only] => {
                let winner = self.roster[*only].clone();
                self.finish(Some(winner))
            }
            _ => {
                let next = alive
                    .iter()
                    .copied()
                    .find(|&i| i >= start)
                    .unwrap_or(alive[0]);
                if next < start {
                    self.round += 1;
                }
                let id = self.roster[next].id.clone();
                self.current = Some(id.clone());
                self.epoch += 1;
                TurnOutcome::Next {
                    current: id,
                    round: self.round,
                }
            }
        }
    }

    fn finish(&mut self, winner: Option<Player>) -> TurnOutcome {
        self.current = winner.as_ref().map(|w| w.id.clone());
        self.epoch += 1;
        self.phase = GamePhase::Over {
            winner: winner.clone(),
        };
        TurnOutcome::Over { winner }
    }

    fn winner(&self) -> Option<Player> {
        match &self.phase {
            GamePhase::Over { winner } => winner.clone(),
            _ => None,
        }
    }

    /// Remove a player whose connection went away.
    ///
    /// Leaving while performing never counts as an elimination; the turn
    /// simply moves on from the departed player's seat.
    pub fn disconnect(&mut self, id: &ConnectionId) -> DisconnectOutcome {
        let Some(index) = self.roster.iter().position(|p| &p.id == id) else {
            return DisconnectOutcome::NotPresent;
        };
        self.roster.remove(index);
        self.eliminated.remove(id);

        if self.phase != GamePhase::Active {
            if self.current.as_ref() == Some(id) {
                self.current = None;
            }
            return DisconnectOutcome::Removed;
        }

        let was_current = self.current.as_ref() == Some(id);
        let alive = self.roster.iter().filter(|p| p.is_alive).count();
        if was_current || alive <= 1 {
            let start = if was_current {
                index
            } else {
                // Position of the unchanged current performer, plus one
                self.current
                    .as_ref()
                    .and_then(|c| self.roster.iter().position(|p| &p.id == c))
                    .map(|i| i + 1)
                    .unwrap_or(0)
            };
            return DisconnectOutcome::TurnChanged(self.advance_from(start));
        }
        DisconnectOutcome::Removed
    }

    fn reset_to_lobby(&mut self) {
        self.phase = GamePhase::Lobby;
        self.roster.clear();
        self.current = None;
        self.round = 0;
        self.eliminated.clear();
        self.epoch += 1;
    }

    pub fn snapshot(&self) -> GameSnapshot {
        let mut eliminated: Vec<ConnectionId> = self.eliminated.iter().cloned().collect();
        eliminated.sort();
        GameSnapshot {
            id: self.id.clone(),
            phase: self.phase.clone(),
            players: self.roster.clone(),
            current_player: self.current.clone(),
            round: self.round,
            eliminated,
            epoch: self.epoch,
            limits: self.limits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> GameLimits {
        GameLimits {
            max_players: 10,
            min_players: 2,
            elimination_threshold: 0.6,
        }
    }

    fn id(name: &str) -> ConnectionId {
        ConnectionId::from(name)
    }

    fn game_with(names: &[&str]) -> GameState {
        let mut game = GameState::new("g1", limits());
        for name in names {
            game.join(id(name), name).unwrap();
        }
        game
    }

    fn current(game: &GameState) -> String {
        game.current().map(|c| c.to_string()).unwrap_or_default()
    }

    /// The join that would exceed capacity is rejected and the roster
    /// is unchanged.
    #[test]
    fn test_join_capacity() {
        let mut game = GameState::new("g1", GameLimits { max_players: 3, ..limits() });
        for name in ["a", "b", "c"] {
            game.join(id(name), name).unwrap();
        }
        let err = game.join(id("d"), "d").unwrap_err();
        assert!(matches!(err, AppError::Capacity { max: 3 }));
        assert_eq!(game.players().len(), 3);
    }

    #[test]
    fn test_join_rejections() {
        let mut game = game_with(&["a", "b"]);
        assert!(game.join(id("a"), "again").is_err());
        assert!(game.join(id("z"), "   ").is_err());
        game.start().unwrap();
        assert!(matches!(
            game.join(id("c"), "c"),
            Err(AppError::InvalidState(_))
        ));
        assert_eq!(game.players().len(), 2);
    }

    #[test]
    fn test_start_requires_min_players() {
        let mut game = game_with(&["solo"]);
        assert!(matches!(
            game.start(),
            Err(AppError::NotEnoughPlayers { present: 1, required: 2 })
        ));
        assert_eq!(game.phase(), &GamePhase::Lobby);
    }

    /// A second start while active changes neither round nor performer.
    #[test]
    fn test_double_start_has_no_effect() {
        let mut game = game_with(&["a", "b", "c"]);
        game.start().unwrap();
        game.advance_turn();
        let (round, performer, epoch) = (game.round(), current(&game), game.epoch());

        assert!(game.start().is_err());
        assert_eq!(game.round(), round);
        assert_eq!(current(&game), performer);
        assert_eq!(game.epoch(), epoch);
    }

    /// Given alive [A, B, C], A→B→C→A increments the round exactly once.
    #[test]
    fn test_round_increments_once_per_cycle() {
        let mut game = game_with(&["A", "B", "C"]);
        game.start().unwrap();
        assert_eq!((current(&game).as_str(), game.round()), ("A", 1));

        game.advance_turn();
        assert_eq!((current(&game).as_str(), game.round()), ("B", 1));
        game.advance_turn();
        assert_eq!((current(&game).as_str(), game.round()), ("C", 1));
        game.advance_turn();
        assert_eq!((current(&game).as_str(), game.round()), ("A", 2));
    }

    /// Eliminating everyone but one always ends with that survivor as the
    /// winner, whatever their seat.
    #[test]
    fn test_elimination_to_one_survivor() {
        for survivor in ["p0", "p1", "p2", "p3"] {
            let mut game = game_with(&["p0", "p1", "p2", "p3"]);
            game.start().unwrap();
            let mut guard = 0;
            while game.phase() == &GamePhase::Active {
                let performer = game.current().cloned().unwrap();
                let confidence = if performer.as_str() == survivor { 0.1 } else { 0.95 };
                let epoch = game.epoch();
                assert!(matches!(
                    game.on_detection(&performer, confidence, Some(epoch)),
                    DetectionOutcome::Applied(_)
                ));
                guard += 1;
                assert!(guard < 20);
            }
            match game.phase() {
                GamePhase::Over { winner: Some(w) } => assert_eq!(w.id.as_str(), survivor),
                other => panic!("unexpected phase {:?}", other),
            }
            assert_eq!(current(&game), survivor);
        }
    }

    #[test]
    fn test_threshold_is_strictly_exceeded() {
        let mut game = game_with(&["a", "b", "c"]);
        game.start().unwrap();
        let epoch = game.epoch();
        match game.on_detection(&id("a"), 0.6, Some(epoch)) {
            DetectionOutcome::Applied(verdict) => assert!(verdict.eliminated.is_none()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(game.player(&id("a")).unwrap().score, 1);
    }

    /// Detections from a finished turn, or from someone who is not
    /// performing, never touch the game.
    #[test]
    fn test_stale_detections_discarded() {
        let mut game = game_with(&["a", "b", "c"]);
        game.start().unwrap();
        let old_epoch = game.epoch();
        game.advance_turn();

        assert_eq!(game.on_detection(&id("b"), 0.99, Some(old_epoch)), DetectionOutcome::Stale);
        assert_eq!(game.on_detection(&id("b"), 0.99, None), DetectionOutcome::Stale);
        let epoch = game.epoch();
        assert_eq!(game.on_detection(&id("c"), 0.99, Some(epoch)), DetectionOutcome::Stale);
        assert!(game.player(&id("b")).unwrap().is_alive);
        assert_eq!(current(&game), "b");
    }

    #[test]
    fn test_performance_result_checks_turn() {
        let mut game = game_with(&["a", "b"]);
        game.start().unwrap();
        assert!(matches!(
            game.performance_result(&id("b"), true),
            Err(AppError::NotYourTurn)
        ));
        let verdict = game.performance_result(&id("a"), true).unwrap();
        assert_eq!(verdict.eliminated.unwrap().id, id("a"));
        assert!(matches!(verdict.turn, TurnOutcome::Over { winner: Some(ref w) } if w.id == id("b")));
    }

    /// The current performer leaving never leaves a dangling or dead
    /// current player.
    #[test]
    fn test_disconnect_of_current_never_dangles() {
        let mut game = game_with(&["a", "b", "c", "d"]);
        game.start().unwrap();
        game.advance_turn(); // b
        let epoch = game.epoch();
        game.on_detection(&id("b"), 0.9, Some(epoch)); // b out, c performing

        let outcome = game.disconnect(&id("c"));
        assert!(matches!(outcome, DisconnectOutcome::TurnChanged(TurnOutcome::Next { .. })));
        let performer = game.current().cloned().unwrap();
        let player = game.player(&performer).unwrap();
        assert!(player.is_alive);
        assert_eq!(performer, id("d"));

        game.disconnect(&id("d"));
        let performer = game.current().cloned().unwrap();
        assert_eq!(performer, id("a"));
        assert!(matches!(game.phase(), GamePhase::Over { .. }));
    }

    #[test]
    fn test_disconnect_of_spectating_player_checks_win() {
        let mut game = game_with(&["a", "b"]);
        game.start().unwrap();
        let outcome = game.disconnect(&id("b"));
        assert!(matches!(
            outcome,
            DisconnectOutcome::TurnChanged(TurnOutcome::Over { winner: Some(_) })
        ));
        assert_eq!(game.disconnect(&id("ghost")), DisconnectOutcome::NotPresent);
    }

    #[test]
    fn test_disconnect_non_current_keeps_turn() {
        let mut game = game_with(&["a", "b", "c"]);
        game.start().unwrap();
        let epoch = game.epoch();
        assert_eq!(game.disconnect(&id("c")), DisconnectOutcome::Removed);
        assert_eq!(current(&game), "a");
        assert_eq!(game.epoch(), epoch);
    }

    /// Amy, Bo and Cee join; Amy laughs, Bo keeps a straight face, Cee
    /// leaves, and Bo wins.
    #[test]
    fn test_amy_bo_cee_scenario() {
        let mut game = game_with(&["Amy", "Bo", "Cee"]);
        let (first, round) = game.start().unwrap();
        assert_eq!((first.as_str(), round), ("Amy", 1));

        let epoch = game.epoch();
        match game.on_detection(&id("Amy"), 0.9, Some(epoch)) {
            DetectionOutcome::Applied(verdict) => {
                assert_eq!(verdict.eliminated.unwrap().name, "Amy");
                assert_eq!(verdict.turn, TurnOutcome::Next { current: id("Bo"), round: 1 });
            }
            other => panic!("unexpected {:?}", other),
        }

        let epoch = game.epoch();
        match game.on_detection(&id("Bo"), 0.2, Some(epoch)) {
            DetectionOutcome::Applied(verdict) => {
                assert!(verdict.eliminated.is_none());
                assert_eq!(verdict.turn, TurnOutcome::Next { current: id("Cee"), round: 1 });
            }
            other => panic!("unexpected {:?}", other),
        }

        match game.disconnect(&id("Cee")) {
            DisconnectOutcome::TurnChanged(TurnOutcome::Over { winner: Some(winner) }) => {
                assert_eq!(winner.name, "Bo");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_join_after_game_over_opens_new_lobby() {
        let mut game = game_with(&["a", "b"]);
        game.start().unwrap();
        game.performance_result(&id("a"), true).unwrap();
        assert!(matches!(game.phase(), GamePhase::Over { .. }));

        game.join(id("c"), "c").unwrap();
        assert_eq!(game.phase(), &GamePhase::Lobby);
        assert_eq!(game.players().len(), 1);
    }

    #[test]
    fn test_snapshot_serialization() {
        let mut game = game_with(&["a", "b"]);
        game.start().unwrap();
        let json = serde_json::to_value(game.snapshot()).unwrap();
        assert_eq!(json["phase"], "active");
        assert_eq!(json["currentPlayer"], "a");
        assert_eq!(json["players"][0]["isAlive"], true);
    }
}
