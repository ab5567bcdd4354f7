//! Transcript heuristics for batch-mode laughter detection.
//!
//! Speech-to-text models rarely write "[laughter]"; they write what laughter
//! sounds like. These patterns and segment checks recognise the usual
//! renderings: repeated "ha"/"he" syllables, stretched vowels, strings of
//! single letters, filler sounds, and very short breathy segments.

use crate::upstream::{ModelVerdict, Transcript, TranscriptSegment};
use once_cell::sync::Lazy;
use regex::Regex;

/// Ordered pattern families. The first family that matches names the
/// category.
static LAUGHTER_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        // haha, hehehe, ahaha, hoho
        (r"(?i)\b(?:ha|he|ho|hi|hu){2,}h?\b", "laughter_syllables"),
        (r"(?i)\b(?:ahaha|ehehe|ohoh)+\b", "laughter_syllables"),
        // aaa, eeee
        (r"(?i)\b(?:a{3,}|e{3,}|i{3,}|o{3,})\b", "stretched_vowels"),
        (r"(?i)(?:ah\s*){2,}", "stretched_vowels"),
        (r"(?i)(?:eh\s*){2,}", "stretched_vowels"),
        // a a a, e e e
        (r"(?i)\b(?:[aeiou]\s+){3,}", "spaced_vowels"),
        (r"(?i)\b(?:uh\s*){3,}", "filler_sounds"),
        (r"(?i)\b(?:um\s*){3,}", "filler_sounds"),
        (r"(?i)(?:^|\s)(?:h+[aeiou]+\s*){3,}", "breathy_giggle"),
        (r"(?i)\b(?:lol|lmao|rofl)\b", "written_laughter"),
    ]
    .into_iter()
    .map(|(pattern, category)| {
        (
            Regex::new(pattern).expect("laughter patterns are valid"),
            category,
        )
    })
    .collect()
});

static SHORT_VOWEL_SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[aeiouhn\s]+$").expect("segment pattern is valid"));

const SHORT_SEGMENT_MAX_CHARS: usize = 5;
const TOKEN_DENSITY_RATIO: f64 = 0.8;

/// What the heuristics found in one transcript.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Findings {
    /// Category of the first pattern matching the whole transcript
    pub transcript_pattern: Option<&'static str>,
    /// Category of the first laughter-like segment
    pub segment: Option<&'static str>,
}

impl Findings {
    pub fn any(&self) -> bool {
        self.transcript_pattern.is_some() || self.segment.is_some()
    }

    /// First matching heuristic, in evaluation order.
    pub fn category(&self) -> Option<&'static str> {
        self.transcript_pattern.or(self.segment)
    }
}

pub fn match_pattern(text: &str) -> Option<&'static str> {
    LAUGHTER_PATTERNS
        .iter()
        .find(|(pattern, _)| pattern.is_match(text))
        .map(|(_, category)| *category)
}

/// Classify one segment: pattern match, then short vowel-only text, then
/// disproportionate token count.
pub fn classify_segment(segment: &TranscriptSegment) -> Option<&'static str> {
    let text = segment.text.trim().to_lowercase();
    if text.is_empty() {
        return None;
    }
    if let Some(category) = match_pattern(&text) {
        return Some(category);
    }
    if text.chars().count() <= SHORT_SEGMENT_MAX_CHARS && SHORT_VOWEL_SEGMENT.is_match(&text) {
        return Some("short_vowel_segment");
    }
    if segment.tokens.len() as f64 > text.chars().count() as f64 * TOKEN_DENSITY_RATIO {
        return Some("token_density");
    }
    None
}

pub fn analyze(transcript: &Transcript) -> Findings {
    Findings {
        transcript_pattern: match_pattern(&transcript.text),
        segment: transcript.segments.iter().find_map(classify_segment),
    }
}

/// Whether the transcript is short enough to justify a model call.
pub fn wants_model(transcript: &Transcript, max_chars: usize) -> bool {
    let len = transcript.text.trim().chars().count();
    len > 0 && len < max_chars
}

/// Combine heuristic findings and the optional model verdict into a
/// confidence in [0, 1], or `None` when nothing points at laughter.
///
/// Scoring on a 0-100 scale: base 50, +20 for a transcript pattern, +20 for
/// a laughter-like segment, +30 when the model agrees, -10 for multi-word
/// text, +10 for clips shorter than two seconds.
pub fn score(
    transcript: &Transcript,
    findings: &Findings,
    model: Option<&ModelVerdict>,
) -> Option<(f32, &'static str)> {
    let model_agrees = model.map(|m| m.has_laughter).unwrap_or(false);
    if !findings.any() && !model_agrees {
        return None;
    }

    let mut confidence: i32 = 50;
    if findings.transcript_pattern.is_some() {
        confidence += 20;
    }
    if findings.segment.is_some() {
        confidence += 20;
    }
    if model_agrees {
        confidence += 30;
    }
    if transcript.text.trim().contains(' ') {
        confidence -= 10;
    }
    if transcript.duration > 0.0 && transcript.duration < 2.0 {
        confidence += 10;
    }

    let category = findings.category().unwrap_or("model_judgment");
    Some((confidence.clamp(0, 100) as f32 / 100.0, category))
}
