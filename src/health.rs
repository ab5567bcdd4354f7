use crate::config::AppConfig;
use crate::state::{AppState, RelayMetrics};
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let relay = state.relay_metrics();
    let config = state.get_config();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
            "connections": relay.connections,
            "active_sessions": relay.active_sessions,
            "games": relay.games
        },
        "memory": get_memory_info(),
        "bridge": {
            "mode": config.bridge.mode,
            "realtime_model": config.upstream.realtime_model,
            "transcription_model": config.upstream.transcription_model
        },
        "system": get_system_status(&config, &relay)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let relay = state.relay_metrics();
    let uptime_seconds = state.get_uptime_seconds();
    let config = state.get_config();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "relay": relay,
        "endpoints": endpoint_stats,
        "memory": get_memory_info(),
        "performance": {
            "max_concurrent_sessions": config.performance.max_concurrent_sessions,
            "detection_channel_capacity": config.performance.detection_channel_capacity,
            "game_queue_capacity": config.performance.game_queue_capacity
        }
    }))
}

/// Resident and virtual size from `/proc/self/status` where available.
fn get_memory_info() -> serde_json::Value {
    match std::fs::read_to_string("/proc/self/status") {
        Ok(status) => json!({
            "resident_memory_bytes": status_field_bytes(&status, "VmRSS:"),
            "virtual_memory_bytes": status_field_bytes(&status, "VmSize:"),
            "available": true
        }),
        Err(_) => json!({
            "process_id": process::id(),
            "available": false
        }),
    }
}

/// `VmRSS:    1234 kB` → 1234 * 1024
fn status_field_bytes(status: &str, key: &str) -> u64 {
    status
        .lines()
        .find_map(|line| line.strip_prefix(key))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map_or(0, |kb| kb * 1024)
}

fn get_system_status(config: &AppConfig, relay: &RelayMetrics) -> serde_json::Value {
    let session_usage = if config.performance.max_concurrent_sessions > 0 {
        relay.active_sessions as f64 / config.performance.max_concurrent_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": config.performance.max_concurrent_sessions,
        "current_sessions": relay.active_sessions,
        "delivery_failures": relay.delivery_failures,
        "load_warnings": if session_usage > 0.8 {
            vec!["High session usage - consider increasing max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}
