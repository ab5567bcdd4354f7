//! # Performance Session Record
//!
//! One `Session` exists per performing connection while its bridge is alive.
//! It tracks where the bridge is in its lifecycle, hands out the strictly
//! increasing sequence indices for incoming audio, and remembers which turn
//! it was opened for. The sequence counter belongs to the connection, so a
//! restarted session continues where the previous one stopped.
//!
//! ## Session Lifecycle:
//! 1. **Idle**: record created, nothing opened yet
//! 2. **Initializing**: upstream connection (or chunk store) being prepared
//! 3. **Active**: audio flowing, detections possible
//! 4. **Ending**: flush requested, waiting for trailing detections
//! 5. **Closed**: upstream released; the record is only kept for reporting
//!
//! Any state may jump straight to Closed when the upstream fails or the
//! client disconnects.

use crate::connection::ConnectionId;
use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use uuid::Uuid;

/// Current state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Initializing,
    Active,
    Ending,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Initializing => "initializing",
            SessionState::Active => "active",
            SessionState::Ending => "ending",
            SessionState::Closed => "closed",
        }
    }

    /// Whether a new `start` for the same connection must be refused.
    pub fn blocks_restart(&self) -> bool {
        matches!(
            self,
            SessionState::Idle | SessionState::Initializing | SessionState::Active
        )
    }
}

/// Per-connection performance session.
///
/// ## Thread Safety:
/// The bridge worker and the websocket actor both touch the session, so the
/// state sits behind a `RwLock` and the counters are atomics.
#[derive(Debug)]
pub struct Session {
    pub session_id: String,
    pub connection_id: ConnectionId,
    pub player_id: String,
    /// Bridge generation this session belongs to
    pub generation: u64,
    /// Turn epoch at the time the session started (None outside a turn)
    pub epoch: Option<u64>,
    pub created_at: DateTime<Utc>,
    state: RwLock<SessionState>,
    sequence: Arc<AtomicU64>,
    chunks: AtomicU64,
    audio_bytes: AtomicUsize,
}

impl Session {
    pub fn new(
        connection_id: ConnectionId,
        player_id: String,
        generation: u64,
        epoch: Option<u64>,
        sequence: Arc<AtomicU64>,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            connection_id,
            player_id,
            generation,
            epoch,
            created_at: Utc::now(),
            state: RwLock::new(SessionState::Idle),
            sequence,
            chunks: AtomicU64::new(0),
            audio_bytes: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, allowed_from: &[SessionState], to: SessionState) -> AppResult<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if !allowed_from.contains(&*state) {
            return Err(AppError::InvalidState(format!(
                "session {} cannot go from {} to {}",
                self.session_id,
                state.as_str(),
                to.as_str()
            )));
        }
        *state = to;
        Ok(())
    }

    /// Idle → Initializing
    pub fn begin_initializing(&self) -> AppResult<()> {
        self.transition(&[SessionState::Idle], SessionState::Initializing)
    }

    /// Initializing → Active
    pub fn activate(&self) -> AppResult<()> {
        self.transition(&[SessionState::Initializing], SessionState::Active)
    }

    /// Active → Ending
    pub fn begin_ending(&self) -> AppResult<()> {
        self.transition(&[SessionState::Active], SessionState::Ending)
    }

    /// Any → Closed. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let was_open = *state != SessionState::Closed;
        *state = SessionState::Closed;
        was_open
    }

    /// Whether audio may be fed right now.
    pub fn accepts_audio(&self) -> bool {
        matches!(self.state(), SessionState::Initializing | SessionState::Active)
    }

    /// Assign the next sequence index to an incoming chunk.
    pub fn next_sequence(&self, byte_len: usize) -> u64 {
        self.audio_bytes.fetch_add(byte_len, Ordering::Relaxed);
        self.chunks.fetch_add(1, Ordering::Relaxed);
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    pub fn chunks_received(&self) -> u64 {
        self.chunks.load(Ordering::Relaxed)
    }

    pub fn audio_bytes(&self) -> usize {
        self.audio_bytes.load(Ordering::Relaxed)
    }

    pub fn duration_seconds(&self) -> f64 {
        Utc::now()
            .signed_duration_since(self.created_at)
            .num_milliseconds() as f64
            / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            ConnectionId::from("c1"),
            "c1".to_string(),
            1,
            Some(3),
            Arc::new(AtomicU64::new(0)),
        )
    }

    #[test]
    fn test_happy_path_transitions() {
        let s = session();
        assert_eq!(s.state(), SessionState::Idle);
        s.begin_initializing().unwrap();
        assert!(s.accepts_audio());
        s.activate().unwrap();
        s.begin_ending().unwrap();
        assert!(!s.accepts_audio());
        assert!(s.close());
        assert!(!s.close());
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let s = session();
        assert!(s.activate().is_err());
        assert!(s.begin_ending().is_err());
        s.begin_initializing().unwrap();
        assert!(s.begin_initializing().is_err());
        assert_eq!(s.state(), SessionState::Initializing);
    }

    #[test]
    fn test_sequence_strictly_increases() {
        let s = session();
        let sequences: Vec<u64> = (0..5).map(|_| s.next_sequence(320)).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
        assert_eq!(s.chunks_received(), 5);
        assert_eq!(s.audio_bytes(), 1600);
    }

    #[test]
    fn test_sequence_continues_across_sessions() {
        let counter = Arc::new(AtomicU64::new(0));
        let conn = ConnectionId::from("c1");
        let first = Session::new(conn.clone(), "c1".into(), 1, None, counter.clone());
        let last = (0..3).map(|_| first.next_sequence(2)).last().unwrap();
        first.close();

        let second = Session::new(conn, "c1".into(), 2, None, counter);
        assert!(second.next_sequence(2) > last);
        assert_eq!(second.chunks_received(), 1);
    }

    #[test]
    fn test_restart_blocking() {
        assert!(SessionState::Active.blocks_restart());
        assert!(SessionState::Initializing.blocks_restart());
        assert!(!SessionState::Ending.blocks_restart());
        assert!(!SessionState::Closed.blocks_restart());
    }
}
