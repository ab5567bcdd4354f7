//! # Application State Management
//!
//! Shared state handed to every HTTP handler through `web::Data`.
//!
//! ## What lives here:
//! - **config**: the live [`AppConfig`], shared with the relay so runtime
//!   updates reach games and sessions created afterwards
//! - **metrics**: HTTP request counters written by the metrics middleware
//! - **relay**: the connection registry, bridges and game hub
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: every worker thread's handlers hold a reference to the same data
//! - **RwLock**: many readers OR one writer
//!
//! Locks are taken with `unwrap_or_else(PoisonError::into_inner)`: the data
//! behind them is plain counters and settings, still usable after a panic
//! elsewhere.

use crate::config::AppConfig;
use crate::relay::{Relay, UpstreamServices};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// The application state shared across all HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,

    /// HTTP counters; every request updates these
    pub metrics: Arc<RwLock<AppMetrics>>,

    relay: Arc<Relay>,

    pub start_time: Instant,
}

/// HTTP metrics collected across all requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,

    /// Key: "METHOD /path", e.g. "GET /api/v1/health"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Performance metrics for one endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// Point-in-time view of the relay's own counters.
#[derive(Debug, Clone, Serialize)]
pub struct RelayMetrics {
    pub connections: usize,
    pub alive_connections: usize,
    pub active_sessions: usize,
    pub games: usize,
    pub detections_applied: u64,
    pub detections_stale: u64,
    pub eliminations: u64,
    pub games_finished: u64,
    pub delivery_failures: u64,
}

impl AppState {
    /// Build the state and start the relay. Must run inside the server's
    /// runtime, since the relay spawns its background tasks immediately.
    pub fn new(config: AppConfig, services: UpstreamServices) -> Self {
        let config = Arc::new(RwLock::new(config));
        let relay = Relay::start(config.clone(), services);
        Self::with_relay(config, relay)
    }

    pub fn with_relay(config: Arc<RwLock<AppConfig>>, relay: Arc<Relay>) -> Self {
        Self {
            config,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            relay,
            start_time: Instant::now(),
        }
    }

    pub fn relay(&self) -> Arc<Relay> {
        self.relay.clone()
    }

    /// Copy of the current configuration; the lock is released on return.
    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply a partial JSON update. A rejected update changes nothing.
    pub fn update_config(&self, json: &str) -> anyhow::Result<AppConfig> {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        config.update_from_json(json)?;
        Ok(config.clone())
    }

    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.request_count += 1;
    }

    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.error_count += 1;
    }

    /// Record one finished request against its endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        let endpoint_metric = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Clone of the HTTP metrics, so no lock is held while serializing.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn relay_metrics(&self) -> RelayMetrics {
        let stats = self.relay.hub().stats();
        RelayMetrics {
            connections: self.relay.registry().len(),
            alive_connections: self.relay.registry().alive_count(),
            active_sessions: self.relay.bridges().active_sessions(),
            games: self.relay.hub().game_ids().len(),
            detections_applied: stats.applied(),
            detections_stale: stats.stale(),
            eliminations: stats.eliminated(),
            games_finished: stats.finished(),
            delivery_failures: self.relay.delivery_failures(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl AppMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
