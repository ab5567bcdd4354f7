//! # Laugh Relay - Main Application Entry Point
//!
//! Real-time relay for a "try not to laugh" party game. Players connect over
//! a WebSocket, take turns performing while their microphone audio is
//! streamed to a speech service, and are eliminated when that service (or
//! the local transcript classifier) hears them laugh.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, config.toml, environment)
//! - **connection**: registry of client sockets and broadcast fan-out
//! - **audio**: chunk validation, WAV framing, ingest buffer, session lifecycle
//! - **upstream**: realtime WebSocket and batch HTTP adapters for the speech service
//! - **bridge**: per-session worker tasks in live or batch mode
//! - **detection**: capability parsing, transcript heuristics, turn verdicts
//! - **game**: per-game orchestrator tasks and the hub that routes to them
//! - **relay**: wires the above together and dispatches client frames
//! - **websocket**: the actix actor behind each client socket
//! - **state**, **health**, **handlers**, **middleware**: the HTTP surface

mod audio;
mod bridge;
mod config;
mod connection;
mod detection;
mod error;
mod game;
mod handlers;
mod health;
mod middleware;
mod protocol;
mod relay;
mod secrets;
mod state;
mod upstream;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use crate::config::AppConfig;
use relay::UpstreamServices;
use secrets::EnvSecretSource;
use state::AppState;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upstream::batch::HttpBatchAnalyzer;
use upstream::realtime::RealtimeConnector;

/// Largest JSON body accepted over HTTP (one-shot clips are base64 PCM)
const JSON_LIMIT_BYTES: usize = 16 * 1024 * 1024;

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting laugh-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{}, {:?} bridge mode, threshold {}",
        config.server.host,
        config.server.port,
        config.bridge.mode,
        config.game.elimination_threshold
    );

    let services = UpstreamServices {
        connector: Arc::new(RealtimeConnector::new(&config.upstream)),
        analyzer: Arc::new(HttpBatchAnalyzer::new(&config.upstream)?),
        secrets: Arc::new(EnvSecretSource),
    };
    let app_state = AppState::new(config.clone(), services);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(web::JsonConfig::default().limit(JSON_LIMIT_BYTES))
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .route("/ws", web::get().to(websocket::client_websocket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/games", web::get().to(handlers::list_games))
                    .route("/games/{id}", web::get().to(handlers::get_game))
                    .route("/analyze", web::post().to(handlers::analyze_audio)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` wins; otherwise debug for this crate and info for actix.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "laugh_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolves on SIGTERM or SIGINT. If the handlers can't be installed, only
/// Ctrl+C is honoured.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("Could not install signal handlers: {}", e);
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Could not listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}
