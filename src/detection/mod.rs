//! # Detection Dispatcher
//!
//! Turns upstream signals into [`DetectionEvent`]s and decides which of them
//! become turn verdicts.
//!
//! ## Key Components:
//! - **dispatcher**: live capability parsing and batch classification
//! - **heuristics**: transcript pattern and segment checks for batch mode
//! - **verdict**: per-session tracking of what has been submitted to the game
//!
//! Events travel to the game as [`DetectionEnvelope`]s on a bounded channel,
//! stamped with the bridge generation that produced them.

pub mod dispatcher;
pub mod heuristics;
pub mod verdict;

use crate::connection::ConnectionId;
use crate::game::state::TurnEpoch;
use crate::protocol::LaughterReport;

pub use dispatcher::{parse_capability, BatchClassifier};
pub use verdict::VerdictTracker;

/// Category used for the "nothing detected" verdict at the end of a turn.
pub const NO_LAUGHTER: &str = "none";

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionEvent {
    /// In [0, 1]
    pub confidence: f32,
    pub category: String,
    pub source_timestamp_ms: u64,
    pub transcript: Option<String>,
    /// Turn the audio was recorded in; `None` outside of a turn
    pub epoch: Option<TurnEpoch>,
}

impl DetectionEvent {
    pub fn new(confidence: f32, category: impl Into<String>, epoch: Option<TurnEpoch>) -> Self {
        Self {
            confidence: confidence.clamp(0.0, 1.0),
            category: category.into(),
            source_timestamp_ms: now_millis(),
            transcript: None,
            epoch,
        }
    }

    /// Zero-confidence verdict for a turn that produced no detections.
    pub fn none(epoch: Option<TurnEpoch>) -> Self {
        Self::new(0.0, NO_LAUGHTER, epoch)
    }

    pub fn with_transcript(mut self, transcript: impl Into<String>) -> Self {
        self.transcript = Some(transcript.into());
        self
    }

    pub fn report(&self) -> LaughterReport {
        LaughterReport {
            confidence: self.confidence,
            laughter_type: self.category.clone(),
            timestamp: self.source_timestamp_ms,
        }
    }
}

/// A detection on its way from a session bridge to the game hub.
#[derive(Debug, Clone)]
pub struct DetectionEnvelope {
    pub connection_id: ConnectionId,
    pub player_id: String,
    pub generation: u64,
    pub event: DetectionEvent,
}

pub(crate) fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
