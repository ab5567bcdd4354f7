//! Per-session verdict tracking.
//!
//! A turn gets exactly one verdict. The first detection above the
//! elimination threshold is submitted as soon as it arrives; if none ever
//! does, the strongest detection seen (or an empty "none" event) is
//! submitted when the session ends so the turn still concludes.

use super::DetectionEvent;
use crate::game::state::TurnEpoch;

#[derive(Debug, Clone)]
pub struct VerdictTracker {
    threshold: f32,
    submitted: bool,
    peak: Option<DetectionEvent>,
}

impl VerdictTracker {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            submitted: false,
            peak: None,
        }
    }

    /// Record a detection. Returns it if it should be submitted right away.
    pub fn observe(&mut self, event: &DetectionEvent) -> Option<DetectionEvent> {
        let is_peak = self
            .peak
            .as_ref()
            .map(|peak| event.confidence > peak.confidence)
            .unwrap_or(true);
        if is_peak {
            self.peak = Some(event.clone());
        }

        if !self.submitted && event.confidence > self.threshold {
            self.submitted = true;
            return Some(event.clone());
        }
        None
    }

    /// Close the turn. Returns the verdict to submit, if one is still owed.
    pub fn finish(&mut self, epoch: Option<TurnEpoch>) -> Option<DetectionEvent> {
        if self.submitted {
            return None;
        }
        self.submitted = true;
        Some(
            self.peak
                .take()
                .unwrap_or_else(|| DetectionEvent::none(epoch)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(confidence: f32) -> DetectionEvent {
        DetectionEvent::new(confidence, "giggling", Some(4))
    }

    #[test]
    fn test_first_event_above_threshold_submitted_once() {
        let mut tracker = VerdictTracker::new(0.6);
        assert!(tracker.observe(&event(0.3)).is_none());
        let submitted = tracker.observe(&event(0.8)).unwrap();
        assert!((submitted.confidence - 0.8).abs() < f32::EPSILON);
        assert!(tracker.observe(&event(0.95)).is_none());
        assert!(tracker.finish(Some(4)).is_none());
    }

    #[test]
    fn test_finish_submits_peak_below_threshold() {
        let mut tracker = VerdictTracker::new(0.6);
        tracker.observe(&event(0.2));
        tracker.observe(&event(0.45));
        tracker.observe(&event(0.1));
        let verdict = tracker.finish(Some(4)).unwrap();
        assert!((verdict.confidence - 0.45).abs() < f32::EPSILON);
        assert!(tracker.finish(Some(4)).is_none());
    }

    #[test]
    fn test_finish_without_detections_submits_none() {
        let mut tracker = VerdictTracker::new(0.6);
        let verdict = tracker.finish(Some(9)).unwrap();
        assert_eq!(verdict.confidence, 0.0);
        assert_eq!(verdict.epoch, Some(9));
        assert!(tracker.finish(Some(9)).is_none());
    }
}
