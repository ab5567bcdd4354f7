//! # Connection Registry
//!
//! Keeps one record per live client socket so that any part of the relay can
//! address a client by id without holding a reference to its actor.
//!
//! ## Key Rust Concepts:
//! - **Trait objects**: `Arc<dyn ConnectionSink>` hides whether a frame goes to
//!   an actix actor, a test recorder or anything else that can deliver text
//! - **Newtype**: `ConnectionId` wraps a `String` so ids can't be confused with
//!   player names or game ids
//! - **RwLock<HashMap>**: many concurrent readers (fan-out), rare writers
//!   (connect/disconnect)

use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

/// Stable identifier for one client connection.
///
/// Players are identified by the connection they joined from, so this is
/// also the player id used in game events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Why a frame could not be handed to a client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The peer is gone for good; its record should be evicted
    #[error("peer unreachable")]
    PeerUnreachable,

    /// The peer's outbound mailbox is full; this frame is dropped
    #[error("peer mailbox is full")]
    Backpressure,
}

/// Something that can push a text frame to one client.
///
/// Delivery must not block: implementations hand the frame off and return.
pub trait ConnectionSink: Send + Sync {
    fn deliver(&self, frame: &str) -> Result<(), DeliveryError>;
}

/// One registered connection.
#[derive(Clone)]
pub struct ConnectionEntry {
    pub id: ConnectionId,
    pub created_at: DateTime<Utc>,
    pub alive: bool,
    /// Game whose events this connection receives
    pub game: Option<String>,
    pub sink: Arc<dyn ConnectionSink>,
}

impl fmt::Debug for ConnectionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEntry")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("alive", &self.alive)
            .field("game", &self.game)
            .finish_non_exhaustive()
    }
}

impl ConnectionEntry {
    pub fn new(id: ConnectionId, sink: Arc<dyn ConnectionSink>) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            alive: true,
            game: None,
            sink,
        }
    }
}

/// In-process keyed store of connection records.
///
/// ## Operations:
/// - `put` / `get` / `delete`: plain keyed access
/// - `register`: admission of new sockets
/// - `subscribe`: choose which game's events a connection receives
/// - `mark_dead`: flag a connection whose peer stopped answering
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave a half-written entry
    // behind, so poisoned guards are safe to reuse.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<ConnectionId, ConnectionEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ConnectionId, ConnectionEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a new connection and return its freshly generated id.
    pub fn register(&self, sink: Arc<dyn ConnectionSink>) -> ConnectionId {
        let id = ConnectionId::generate();
        self.put(ConnectionEntry::new(id.clone(), sink));
        id
    }

    pub fn put(&self, entry: ConnectionEntry) {
        self.write().insert(entry.id.clone(), entry);
    }

    pub fn get(&self, id: &ConnectionId) -> Option<ConnectionEntry> {
        self.read().get(id).cloned()
    }

    pub fn delete(&self, id: &ConnectionId) -> Option<ConnectionEntry> {
        self.write().remove(id)
    }

    /// Route the game's events to this connection from now on.
    pub fn subscribe(&self, id: &ConnectionId, game: &str) -> AppResult<()> {
        let mut entries = self.write();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| AppError::ConnectionGone(id.to_string()))?;
        entry.game = Some(game.to_string());
        Ok(())
    }

    /// Flag the connection as unreachable. Returns `true` the first time only,
    /// so callers can schedule eviction exactly once.
    pub fn mark_dead(&self, id: &ConnectionId) -> bool {
        match self.write().get_mut(id) {
            Some(entry) if entry.alive => {
                entry.alive = false;
                true
            }
            _ => false,
        }
    }

    /// Live connections subscribed to `game`.
    pub fn subscribers(&self, game: &str) -> Vec<ConnectionEntry> {
        self.read()
            .values()
            .filter(|entry| entry.alive && entry.game.as_deref() == Some(game))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn alive_count(&self) -> usize {
        self.read().values().filter(|entry| entry.alive).count()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Sink that records every frame it receives.
    #[derive(Default)]
    pub struct RecordingSink {
        pub frames: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        pub fn frames(&self) -> Vec<String> {
            self.frames.lock().unwrap().clone()
        }

        /// Parsed JSON of every received frame.
        pub fn json(&self) -> Vec<serde_json::Value> {
            self.frames()
                .iter()
                .map(|frame| serde_json::from_str(frame).unwrap())
                .collect()
        }
    }

    impl ConnectionSink for RecordingSink {
        fn deliver(&self, frame: &str) -> Result<(), DeliveryError> {
            self.frames.lock().unwrap().push(frame.to_string());
            Ok(())
        }
    }

    /// Sink whose peer has gone away.
    pub struct ClosedSink;

    impl ConnectionSink for ClosedSink {
        fn deliver(&self, _frame: &str) -> Result<(), DeliveryError> {
            Err(DeliveryError::PeerUnreachable)
        }
    }

    #[test]
    fn test_register_and_delete() {
        let registry = ConnectionRegistry::new();
        let a = registry.register(Arc::new(RecordingSink::default()));
        let b = registry.register(Arc::new(RecordingSink::default()));
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert!(registry.get(&a).is_some());
        assert!(registry.delete(&a).is_some());
        assert!(registry.get(&a).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_subscribers_filter_by_game_and_liveness() {
        let registry = ConnectionRegistry::new();
        let a = registry.register(Arc::new(RecordingSink::default()));
        let b = registry.register(Arc::new(RecordingSink::default()));
        let c = registry.register(Arc::new(RecordingSink::default()));
        registry.subscribe(&a, "g1").unwrap();
        registry.subscribe(&b, "g1").unwrap();
        registry.subscribe(&c, "g2").unwrap();

        assert!(registry.mark_dead(&b));
        assert!(!registry.mark_dead(&b));

        let subscribers = registry.subscribers("g1");
        assert_eq!(subscribers.len(), 1);
        assert_eq!(subscribers[0].id, a);
    }

    #[test]
    fn test_subscribe_unknown_connection() {
        let registry = ConnectionRegistry::new();
        let err = registry.subscribe(&ConnectionId::from("ghost"), "g1").unwrap_err();
        assert!(matches!(err, AppError::ConnectionGone(_)));
    }
}
