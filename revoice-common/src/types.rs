//! Core domain types for audio retargeting
//!
//! A *transcreation* is the overall retarget of a source audio track into a
//! new language while preserving timing. Its transcript is already
//! transcribed, translated, diarized and time-aligned when it reaches this
//! system; everything here treats the segment list as ground truth.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Voice selector sentinel requesting voice cloning from a reference clip
pub const CLONE_VOICE: &str = "clone";

/// Language code applied when neither the segment nor the transcreation
/// carries one
pub const DEFAULT_LANGUAGE: &str = "en-US";

/// One timestamped utterance with translated text and speaker tag.
///
/// Times are milliseconds from the start of the original audio. Segments
/// arrive ordered by `start_ms`; overlap between consecutive segments is
/// permitted on input and resolved during combining.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start_ms: u64,
    pub end_ms: u64,
    /// Translated text to synthesize (non-empty)
    pub text: String,
    /// Untranslated source text, if retained
    pub source_text: Option<String>,
    /// Speaker tag from diarization
    pub speaker: String,
    /// Weighted emotion map, e.g. {"happy": 0.7, "neutral": 0.3}
    pub emotion: Option<BTreeMap<String, f64>>,
    /// Vendor voice id, or [`CLONE_VOICE`] to clone the original speaker
    pub voice: String,
}

impl TranscriptSegment {
    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }

    /// Whether this segment asks for voice cloning
    pub fn wants_clone(&self) -> bool {
        self.voice == CLONE_VOICE
    }
}

/// Transcreation record as read from the job store.
///
/// Read-only to the core; the only fields the core ever writes live in
/// the job status row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcreation {
    pub id: Uuid,
    pub original_audio_url: String,
    pub from_language: Option<String>,
    pub to_language: Option<String>,
    /// Owner's plan name, mapped to a queue priority class at intake
    pub plan: String,
    pub owner_email: Option<String>,
    /// Ordered by `start_ms`
    pub segments: Vec<TranscriptSegment>,
}

/// One synthesis request, derived per segment at intake.
///
/// Carries a back-reference to the originating segment index so results
/// can be positioned without ever reordering the sound-to-text mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsRequestSpec {
    pub segment_index: usize,
    pub text: String,
    /// Vendor voice id or the `clone` sentinel
    pub voice: String,
    /// Forwarded verbatim when present; job target language otherwise
    pub language: Option<String>,
    pub emotion: Option<BTreeMap<String, f64>>,
    /// Speaker tag, used to look up the cloning reference
    pub speaker: String,
}

/// Queued unit of work: everything a worker needs to run one retargeting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub transcreation_id: Uuid,
    pub original_audio_url: String,
    pub transcript: Vec<TranscriptSegment>,
    pub tts_requests: Vec<TtsRequestSpec>,
    pub target_language: String,
    pub owner_email: Option<String>,
    /// Numeric priority class; lower value = sooner
    pub priority: u32,
}

impl JobEnvelope {
    /// Display title: first 5 space-separated tokens of the first
    /// segment's text, empty string when there is no transcript.
    pub fn title(&self) -> String {
        self.transcript
            .first()
            .map(|seg| {
                seg.text
                    .split(' ')
                    .filter(|t| !t.is_empty())
                    .take(5)
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default()
    }

    /// Envelope view exposed through the status API: the transcript (and
    /// the per-segment requests derived from it) are elided.
    pub fn public_data(&self) -> serde_json::Value {
        serde_json::json!({
            "transcreationId": self.transcreation_id,
            "originalAudioUrl": self.original_audio_url,
            "targetLanguage": self.target_language,
            "segmentCount": self.transcript.len(),
            "priority": self.priority,
            "ownerEmail": self.owner_email,
        })
    }

    /// Distinct speakers in transcript order of first appearance
    pub fn speakers(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for seg in &self.transcript {
            if !seen.contains(&seg.speaker) {
                seen.push(seg.speaker.clone());
            }
        }
        seen
    }
}

/// Persisted job lifecycle state.
///
/// Transitions are monotonic (queued → processing → terminal) except that
/// a retry may move a job back to `processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// How a segment's voice is ultimately selected at synthesis time
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceChoice {
    /// A vendor catalog voice, referenced by id
    Catalog(String),
    /// Clone the original speaker from a local reference clip
    Clone(PathBuf),
    /// Cloning was requested but no reference exists; downgraded to the
    /// configured default voice
    DefaultFallback { voice: String, reason: String },
}

/// Progress record emitted at stage boundaries and on TTS batch completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Stage index (0-based)
    pub step: usize,
    pub total_steps: usize,
    /// 0-100, monotonic non-decreasing within a job
    pub percent: u8,
    /// Human-readable operation label
    pub operation: String,
}

/// Map a progress percentage onto the user-facing processing stage label
pub fn processing_stage(percent: u8, failed: bool) -> &'static str {
    if failed {
        return "Failed";
    }
    match percent {
        100 => "Complete",
        p if p > 80 => "Finalizing",
        p if p > 50 => "Combining",
        p if p > 20 => "Separating background",
        _ => "Generating speech",
    }
}

/// Neutral emotion weights sent when a segment specifies none.
///
/// Weights sum to 1 on `neutral` and 0 elsewhere.
pub fn neutral_emotion() -> BTreeMap<String, f64> {
    let mut weights = BTreeMap::new();
    weights.insert("neutral".to_string(), 1.0);
    weights
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(start_ms: u64, end_ms: u64, text: &str, speaker: &str, voice: &str) -> TranscriptSegment {
        TranscriptSegment {
            start_ms,
            end_ms,
            text: text.to_string(),
            source_text: None,
            speaker: speaker.to_string(),
            emotion: None,
            voice: voice.to_string(),
        }
    }

    fn envelope(segments: Vec<TranscriptSegment>) -> JobEnvelope {
        JobEnvelope {
            transcreation_id: Uuid::new_v4(),
            original_audio_url: "https://example.com/a.mp3".to_string(),
            transcript: segments,
            tts_requests: Vec::new(),
            target_language: "es-ES".to_string(),
            owner_email: None,
            priority: 10,
        }
    }

    #[test]
    fn title_takes_first_five_tokens() {
        let env = envelope(vec![segment(
            0,
            1000,
            "uno dos tres cuatro cinco seis siete",
            "s1",
            "vA",
        )]);
        assert_eq!(env.title(), "uno dos tres cuatro cinco");
    }

    #[test]
    fn title_of_empty_transcript_is_empty() {
        let env = envelope(vec![]);
        assert_eq!(env.title(), "");
    }

    #[test]
    fn title_shorter_than_five_tokens() {
        let env = envelope(vec![segment(0, 1000, "hola", "s1", "vA")]);
        assert_eq!(env.title(), "hola");
    }

    #[test]
    fn public_data_excludes_transcript() {
        let env = envelope(vec![segment(0, 1000, "hola", "s1", "vA")]);
        let data = env.public_data();
        assert!(data.get("transcript").is_none());
        assert_eq!(data["segmentCount"], 1);
    }

    #[test]
    fn speakers_preserve_first_appearance_order() {
        let env = envelope(vec![
            segment(0, 500, "a", "s2", "clone"),
            segment(600, 900, "b", "s1", "clone"),
            segment(1000, 1500, "c", "s2", "clone"),
        ]);
        assert_eq!(env.speakers(), vec!["s2".to_string(), "s1".to_string()]);
    }

    #[test]
    fn wants_clone_matches_sentinel_only() {
        assert!(segment(0, 1, "x", "s1", "clone").wants_clone());
        assert!(!segment(0, 1, "x", "s1", "cloneX").wants_clone());
        assert!(!segment(0, 1, "x", "s1", "vA").wants_clone());
    }

    #[test]
    fn processing_stage_boundaries() {
        assert_eq!(processing_stage(0, false), "Generating speech");
        assert_eq!(processing_stage(10, false), "Generating speech");
        assert_eq!(processing_stage(20, false), "Generating speech");
        assert_eq!(processing_stage(21, false), "Separating background");
        assert_eq!(processing_stage(50, false), "Separating background");
        assert_eq!(processing_stage(51, false), "Combining");
        assert_eq!(processing_stage(80, false), "Combining");
        assert_eq!(processing_stage(81, false), "Finalizing");
        assert_eq!(processing_stage(99, false), "Finalizing");
        assert_eq!(processing_stage(100, false), "Complete");
        assert_eq!(processing_stage(40, true), "Failed");
    }

    #[test]
    fn job_state_round_trips_through_str() {
        for state in [
            JobState::Queued,
            JobState::Processing,
            JobState::Completed,
            JobState::Failed,
        ] {
            let parsed: JobState = state.as_str().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert!("bogus".parse::<JobState>().is_err());
    }

    #[test]
    fn neutral_emotion_sums_to_one() {
        let weights = neutral_emotion();
        assert_eq!(weights.len(), 1);
        assert_eq!(weights["neutral"], 1.0);
    }
}
