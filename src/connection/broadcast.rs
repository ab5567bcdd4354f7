//! # Broadcast Fan-out
//!
//! Serializes an outbound message once and hands it to each recipient
//! independently. A recipient that fails never prevents delivery to the
//! others; failures are collected in a [`BroadcastReport`].
//!
//! Recipients whose peer is unreachable are marked dead and queued on the
//! eviction channel. The relay drains that channel and runs the full
//! disconnect cascade, so the registry heals itself without the fan-out ever
//! waiting on cleanup.

use super::registry::{ConnectionEntry, ConnectionId, ConnectionRegistry, DeliveryError};
use crate::error::{AppError, AppResult};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Outcome of one fan-out.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: Vec<(ConnectionId, DeliveryError)>,
}

impl BroadcastReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    evictions: mpsc::UnboundedSender<ConnectionId>,
    delivery_failures: AtomicU64,
}

impl Broadcaster {
    /// Create a broadcaster and the receiving end of its eviction channel.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let broadcaster = Self {
            registry,
            evictions: tx,
            delivery_failures: AtomicU64::new(0),
        };
        (broadcaster, rx)
    }

    /// Deliver to every live connection subscribed to `game`.
    pub fn broadcast_to_game<T: Serialize>(&self, game: &str, message: &T) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let frame = match serde_json::to_string(message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(game, error = %e, "Failed to serialize broadcast frame");
                return report;
            }
        };

        for entry in self.registry.subscribers(game) {
            match self.deliver(&entry, &frame) {
                Ok(()) => report.delivered += 1,
                Err(err) => report.failed.push((entry.id.clone(), err)),
            }
        }

        if !report.is_clean() {
            debug!(
                game,
                delivered = report.delivered,
                failed = report.failed.len(),
                "Broadcast completed with failures"
            );
        }
        report
    }

    /// Deliver to a single connection.
    pub fn send_to<T: Serialize>(&self, id: &ConnectionId, message: &T) -> AppResult<()> {
        let entry = self
            .registry
            .get(id)
            .filter(|entry| entry.alive)
            .ok_or_else(|| AppError::ConnectionGone(id.to_string()))?;
        let frame = serde_json::to_string(message)?;
        self.deliver(&entry, &frame).map_err(|err| match err {
            DeliveryError::PeerUnreachable => AppError::ConnectionGone(id.to_string()),
            DeliveryError::Backpressure => {
                AppError::Internal(format!("outbound mailbox full for {}", id))
            }
        })
    }

    /// Total failed deliveries since start.
    pub fn delivery_failures(&self) -> u64 {
        self.delivery_failures.load(Ordering::Relaxed)
    }

    fn deliver(&self, entry: &ConnectionEntry, frame: &str) -> Result<(), DeliveryError> {
        let result = entry.sink.deliver(frame);
        if let Err(err) = &result {
            self.delivery_failures.fetch_add(1, Ordering::Relaxed);
            if *err == DeliveryError::PeerUnreachable && self.registry.mark_dead(&entry.id) {
                debug!(connection_id = %entry.id, "Peer unreachable, scheduling eviction");
                // Receiver only disappears during shutdown.
                let _ = self.evictions.send(entry.id.clone());
            }
        }
        result
    }
}
