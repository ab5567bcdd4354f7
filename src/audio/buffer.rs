//! # Audio Ingest Buffer
//!
//! Short-lived store for the audio chunks a batch session accumulates between
//! classification passes. Chunks are keyed by connection and sequence index,
//! expire after a fixed retention period, and are handed back in sequence
//! order no matter how they arrived.
//!
//! ## Key Features:
//! - **TTL retention**: expired chunks are never returned and are purged
//!   opportunistically on every `store`
//! - **Ordered drain**: `drain` sorts by sequence and removes what it returns
//! - **Pluggable backend**: the [`ChunkStore`] trait lets a shared external
//!   store replace the in-memory map

use crate::connection::ConnectionId;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// One stored chunk of PCM16 audio. Immutable once stored.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub connection_id: ConnectionId,
    pub sequence: u64,
    pub payload: Vec<u8>,
    pub stored_at: DateTime<Utc>,
    expires_at: Instant,
}

impl AudioChunk {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Keyed chunk storage with retention.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Store a chunk. A sequence index that is already present for the
    /// connection is rejected.
    async fn store(&self, connection_id: &ConnectionId, sequence: u64, payload: Vec<u8>)
        -> AppResult<()>;

    /// Remove and return every unexpired chunk for the connection, ascending
    /// by sequence.
    async fn drain(&self, connection_id: &ConnectionId) -> AppResult<Vec<AudioChunk>>;
}

/// In-memory [`ChunkStore`].
///
/// ## Memory Layout:
/// `HashMap<connection, BTreeMap<sequence, chunk>>` keeps each connection's
/// chunks sorted by construction, so a drain is a single in-order walk.
pub struct AudioIngestBuffer {
    chunks: Mutex<HashMap<ConnectionId, BTreeMap<u64, AudioChunk>>>,
    ttl: Duration,
}

impl AudioIngestBuffer {
    pub fn new(ttl: Duration) -> Self {
        Self {
            chunks: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, BTreeMap<u64, AudioChunk>>> {
        self.chunks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn purge_locked(map: &mut HashMap<ConnectionId, BTreeMap<u64, AudioChunk>>) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        map.retain(|_, per_connection| {
            let before = per_connection.len();
            per_connection.retain(|_, chunk| !chunk.is_expired(now));
            removed += before - per_connection.len();
            !per_connection.is_empty()
        });
        removed
    }
}

#[async_trait]
impl ChunkStore for AudioIngestBuffer {
    async fn store(
        &self,
        connection_id: &ConnectionId,
        sequence: u64,
        payload: Vec<u8>,
    ) -> AppResult<()> {
        let mut map = self.lock();
        let purged = Self::purge_locked(&mut map);
        if purged > 0 {
            debug!("Purged {} expired audio chunks", purged);
        }

        let per_connection = map.entry(connection_id.clone()).or_default();
        if per_connection.contains_key(&sequence) {
            return Err(AppError::Validation(format!(
                "chunk {} already stored for {}",
                sequence, connection_id
            )));
        }

        per_connection.insert(
            sequence,
            AudioChunk {
                connection_id: connection_id.clone(),
                sequence,
                payload,
                stored_at: Utc::now(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }

    async fn drain(&self, connection_id: &ConnectionId) -> AppResult<Vec<AudioChunk>> {
        let now = Instant::now();
        let drained = self.lock().remove(connection_id).unwrap_or_default();
        Ok(drained
            .into_values()
            .filter(|chunk| !chunk.is_expired(now))
            .collect())
    }
}
