//! Detection dispatch for both bridge modes.
//!
//! Live mode: the realtime service invokes the `report_laughter` capability
//! with JSON arguments, which [`parse_capability`] turns into an event.
//!
//! Batch mode: [`BatchClassifier`] transcribes a clip, runs the transcript
//! heuristics, and asks the judging model only when the transcript is short.

use super::heuristics;
use super::{now_millis, DetectionEvent};
use crate::error::{AppError, AppResult};
use crate::game::state::TurnEpoch;
use crate::upstream::{BatchAnalyzer, Transcript, LAUGHTER_CAPABILITY};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct CapabilityArguments {
    confidence: f32,
    #[serde(default = "default_laughter_type")]
    laughter_type: String,
    #[serde(default)]
    timestamp_ms: Option<u64>,
}

fn default_laughter_type() -> String {
    "laughter".to_string()
}

/// Parse a capability invocation.
///
/// Returns `Ok(None)` for capabilities other than laughter reporting and a
/// validation error for malformed arguments.
pub fn parse_capability(
    name: &str,
    arguments: &str,
    epoch: Option<TurnEpoch>,
) -> AppResult<Option<DetectionEvent>> {
    if name != LAUGHTER_CAPABILITY {
        debug!("Ignoring capability invocation '{}'", name);
        return Ok(None);
    }

    let args: CapabilityArguments = serde_json::from_str(arguments)
        .map_err(|e| AppError::Validation(format!("malformed {} arguments: {}", name, e)))?;
    if !args.confidence.is_finite() {
        return Err(AppError::Validation(format!(
            "{} confidence is not a number",
            name
        )));
    }

    let mut event = DetectionEvent::new(args.confidence, args.laughter_type, epoch);
    event.source_timestamp_ms = args.timestamp_ms.unwrap_or_else(now_millis);
    Ok(Some(event))
}

/// Transcribe-then-judge classifier for batch mode.
#[derive(Clone)]
pub struct BatchClassifier {
    analyzer: Arc<dyn BatchAnalyzer>,
    model_max_chars: usize,
}

impl BatchClassifier {
    pub fn new(analyzer: Arc<dyn BatchAnalyzer>, model_max_chars: usize) -> Self {
        Self {
            analyzer,
            model_max_chars,
        }
    }

    /// Classify an existing transcript. A failed model call counts as no
    /// opinion.
    pub async fn classify(
        &self,
        api_key: &str,
        transcript: &Transcript,
        epoch: Option<TurnEpoch>,
    ) -> Option<DetectionEvent> {
        let findings = heuristics::analyze(transcript);

        let verdict = if heuristics::wants_model(transcript, self.model_max_chars) {
            match self.analyzer.judge(api_key, transcript).await {
                Ok(verdict) => Some(verdict),
                Err(e) => {
                    warn!("Laughter judge failed, using heuristics only: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let (confidence, category) = heuristics::score(transcript, &findings, verdict.as_ref())?;
        debug!(
            "Batch verdict {:.2} ({}) for transcript '{}'",
            confidence, category, transcript.text
        );
        Some(DetectionEvent::new(confidence, category, epoch).with_transcript(transcript.text.clone()))
    }

    /// Transcribe a WAV clip and classify it.
    pub async fn analyze_clip(
        &self,
        api_key: &str,
        wav: Vec<u8>,
        epoch: Option<TurnEpoch>,
    ) -> AppResult<(Transcript, Option<DetectionEvent>)> {
        let transcript = self.analyzer.transcribe(api_key, wav).await?;
        let event = self.classify(api_key, &transcript, epoch).await;
        Ok((transcript, event))
    }
}
