//! Batch strategy: accumulate, transcribe, classify.
//!
//! Chunks go into the ingest buffer as they arrive. Every
//! `chunks_per_batch` chunks the buffer is drained, the PCM is concatenated
//! and framed as WAV, and the clip is analyzed in a background task so audio
//! keeps flowing meanwhile. Analyses run under a child of the bridge's
//! cancellation token; a closed bridge never reports a late result.

use super::{BridgeCommand, BridgeContext, WorkerExit};
use crate::audio::buffer::ChunkStore;
use crate::audio::processor::AudioProcessor;
use crate::detection::{BatchClassifier, DetectionEvent};
use crate::error::AppResult;
use crate::protocol::ServerMessage;
use crate::upstream::Transcript;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, warn};

pub struct BatchSettings {
    pub classifier: BatchClassifier,
    pub store: Arc<dyn ChunkStore>,
    pub processor: AudioProcessor,
    pub chunks_per_batch: usize,
}

/// `None` when the analysis was cancelled.
type Analysis = Option<AppResult<(Transcript, Option<DetectionEvent>)>>;

pub async fn run(
    ctx: BridgeContext,
    settings: BatchSettings,
    mut commands: mpsc::Receiver<BridgeCommand>,
) -> WorkerExit {
    if ctx.session.activate().is_err() {
        return ctx.cancelled();
    }
    ctx.notify(&ServerMessage::SessionStarted {
        session_id: ctx.session.session_id.clone(),
    });

    let mut ctx = ctx;
    let conn = ctx.session.connection_id.clone();
    let mut analyses: JoinSet<Analysis> = JoinSet::new();
    let mut buffered = 0usize;

    loop {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                analyses.abort_all();
                discard(&settings, &ctx).await;
                return ctx.cancelled();
            }
            Some(joined) = analyses.join_next(), if !analyses.is_empty() => {
                on_analysis(&mut ctx, joined).await;
            }
            command = commands.recv() => match command {
                Some(BridgeCommand::Audio { sequence, bytes }) => {
                    if let Err(e) = settings.store.store(&conn, sequence, bytes).await {
                        warn!("Could not buffer chunk {} for {}: {}", sequence, conn, e);
                        ctx.notify(&ServerMessage::error(&e));
                        continue;
                    }
                    buffered += 1;
                    if buffered >= settings.chunks_per_batch {
                        buffered = 0;
                        dispatch(&ctx, &settings, &mut analyses).await;
                    }
                }
                Some(BridgeCommand::End) | None => break,
            },
        }
    }

    if let Err(e) = ctx.session.begin_ending() {
        debug!("{}", e);
    }
    dispatch(&ctx, &settings, &mut analyses).await;

    loop {
        let joined = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                analyses.abort_all();
                return ctx.cancelled();
            }
            joined = analyses.join_next() => joined,
        };
        match joined {
            Some(joined) => on_analysis(&mut ctx, joined).await,
            None => break,
        }
    }

    ctx.finish().await
}

/// Drain what is buffered and analyze it in the background.
async fn dispatch(ctx: &BridgeContext, settings: &BatchSettings, analyses: &mut JoinSet<Analysis>) {
    let conn = &ctx.session.connection_id;
    let chunks = match settings.store.drain(conn).await {
        Ok(chunks) if !chunks.is_empty() => chunks,
        Ok(_) => return,
        Err(e) => {
            warn!("Could not drain chunks for {}: {}", conn, e);
            return;
        }
    };

    let pcm = settings
        .processor
        .concat(chunks.iter().map(|chunk| chunk.payload.as_slice()));
    let wav = match settings.processor.wrap_wav(&pcm) {
        Ok(wav) => wav,
        Err(e) => {
            warn!("Dropping batch of {} chunks: {}", chunks.len(), e);
            ctx.notify(&ServerMessage::error(&e));
            return;
        }
    };
    debug!(
        "Analyzing {} chunks ({:.2}s) for {}",
        chunks.len(),
        settings.processor.duration_secs(pcm.len()),
        conn
    );

    let classifier = settings.classifier.clone();
    let api_key = ctx.api_key.clone();
    let epoch = ctx.session.epoch;
    let token = ctx.cancel.child_token();
    analyses.spawn(async move {
        tokio::select! {
            _ = token.cancelled() => None,
            result = classifier.analyze_clip(&api_key, wav, epoch) => Some(result),
        }
    });
}

/// A failed analysis is reported to the client; the next batch still runs.
async fn on_analysis(ctx: &mut BridgeContext, joined: Result<Analysis, JoinError>) {
    match joined {
        Ok(Some(Ok((transcript, event)))) => {
            let text = transcript.text.trim();
            if !text.is_empty() {
                ctx.notify(&ServerMessage::Transcription {
                    text: text.to_string(),
                });
            }
            if let Some(event) = event {
                ctx.report(event).await;
            }
        }
        Ok(Some(Err(e))) => {
            warn!("Batch analysis failed for {}: {}", ctx.session.connection_id, e);
            ctx.notify(&ServerMessage::error(&e));
        }
        Ok(None) => {}
        Err(e) if e.is_cancelled() => {}
        Err(e) => warn!("Batch analysis task panicked: {}", e),
    }
}

async fn discard(settings: &BatchSettings, ctx: &BridgeContext) {
    if let Ok(chunks) = settings.store.drain(&ctx.session.connection_id).await {
        if !chunks.is_empty() {
            debug!("Discarded {} buffered chunks", chunks.len());
        }
    }
}
