//! Live strategy: one persistent upstream connection per session.
//!
//! The worker connects within the configured timeout, declares the laughter
//! capability, then relays audio up and events down until the client ends
//! the session, the upstream fails, or the bridge is cancelled.

use super::{BridgeCommand, BridgeContext, WorkerExit};
use crate::config::UpstreamConfig;
use crate::detection::parse_capability;
use crate::error::{AppError, AppResult};
use crate::protocol::ServerMessage;
use crate::upstream::{
    SessionConfiguration, UpstreamCommand, UpstreamConnector, UpstreamEvent, UpstreamLink,
    UpstreamSender,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub async fn run(
    ctx: BridgeContext,
    connector: Arc<dyn UpstreamConnector>,
    upstream: UpstreamConfig,
    mut commands: mpsc::Receiver<BridgeCommand>,
) -> WorkerExit {
    let connecting = tokio::time::timeout(
        upstream.connect_timeout(),
        connector.connect(&ctx.api_key),
    );

    let link = tokio::select! {
        _ = ctx.cancel.cancelled() => return ctx.cancelled(),
        result = connecting => match result {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => return ctx.fail(e),
            Err(_) => {
                return ctx.fail(AppError::Upstream(format!(
                    "upstream connection timed out after {}ms",
                    upstream.connect_timeout_ms
                )))
            }
        },
    };
    let UpstreamLink {
        mut sender,
        mut events,
    } = link;

    let configuration = SessionConfiguration::laughter_detection(&upstream);
    if let Err(e) = sender
        .send(UpstreamCommand::Configure(Box::new(configuration)))
        .await
    {
        release(sender.as_mut()).await;
        return ctx.fail(e);
    }
    if ctx.session.activate().is_err() {
        // Closed underneath us while connecting
        release(sender.as_mut()).await;
        return ctx.cancelled();
    }
    ctx.notify(&ServerMessage::SessionStarted {
        session_id: ctx.session.session_id.clone(),
    });

    let mut ctx = ctx;
    loop {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                release(sender.as_mut()).await;
                return ctx.cancelled();
            }
            command = commands.recv() => match command {
                Some(BridgeCommand::Audio { sequence, bytes }) => {
                    if let Err(e) = sender.send(UpstreamCommand::Append(bytes)).await {
                        warn!("Append of chunk {} failed", sequence);
                        release(sender.as_mut()).await;
                        return ctx.fail(e);
                    }
                }
                Some(BridgeCommand::End) | None => {
                    return end(ctx, sender, events, upstream.end_grace()).await;
                }
            },
            event = events.recv() => {
                let event = event.unwrap_or(UpstreamEvent::Closed);
                if let Err(e) = on_event(&mut ctx, event).await {
                    release(sender.as_mut()).await;
                    return ctx.fail(e);
                }
            }
        }
    }
}

/// Commit, collect trailing events for the grace window, then close.
async fn end(
    mut ctx: BridgeContext,
    mut sender: Box<dyn UpstreamSender>,
    mut events: mpsc::Receiver<UpstreamEvent>,
    grace: Duration,
) -> WorkerExit {
    if let Err(e) = ctx.session.begin_ending() {
        debug!("{}", e);
    }
    if let Err(e) = sender.send(UpstreamCommand::Commit).await {
        warn!("Commit failed, closing without trailing detections: {}", e);
    } else {
        let deadline = tokio::time::sleep(grace);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = ctx.cancel.cancelled() => {
                    release(sender.as_mut()).await;
                    return ctx.cancelled();
                }
                event = events.recv() => match event {
                    Some(event @ UpstreamEvent::CapabilityInvoked { .. })
                    | Some(event @ UpstreamEvent::TranscriptCompleted { .. }) => {
                        let _ = on_event(&mut ctx, event).await;
                    }
                    Some(UpstreamEvent::Error { message }) => {
                        debug!("Upstream error while ending: {}", message);
                        break;
                    }
                    Some(UpstreamEvent::Closed) | None => break,
                },
            }
        }
    }

    release(sender.as_mut()).await;
    ctx.finish().await
}

/// Handle one inbound event. Errors mean the upstream is unusable.
async fn on_event(ctx: &mut BridgeContext, event: UpstreamEvent) -> AppResult<()> {
    match event {
        UpstreamEvent::CapabilityInvoked { name, arguments } => {
            match parse_capability(&name, &arguments, ctx.session.epoch) {
                Ok(Some(detection)) => ctx.report(detection).await,
                Ok(None) => {}
                Err(e) => warn!("Dropping capability invocation: {}", e),
            }
            Ok(())
        }
        UpstreamEvent::TranscriptCompleted { text } => {
            debug!("Transcript for {}: {}", ctx.session.connection_id, text);
            ctx.notify(&ServerMessage::Transcription { text });
            Ok(())
        }
        UpstreamEvent::Error { message } => Err(AppError::Upstream(message)),
        UpstreamEvent::Closed => Err(AppError::Upstream(
            "upstream closed the session".to_string(),
        )),
    }
}

/// Best-effort close; resources are released whatever the handshake does.
async fn release(sender: &mut dyn UpstreamSender) {
    if let Err(e) = sender.close().await {
        debug!("Upstream close handshake failed: {}", e);
    }
}
