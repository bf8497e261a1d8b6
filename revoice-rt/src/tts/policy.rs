//! Voice selection, retry classification and backoff policy
//!
//! Pure decision logic of the TTS client, kept apart from the HTTP
//! plumbing so the rules stay testable without a vendor.

use revoice_common::types::{TtsRequestSpec, VoiceChoice};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// What an upstream HTTP status means for this request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Success,
    /// Worth another attempt after backoff (5xx including 524, and 429)
    Retryable,
    /// Terminal for this segment (4xx other than 429)
    Terminal,
}

pub fn classify_status(status: u16) -> Disposition {
    match status {
        200..=299 => Disposition::Success,
        429 => Disposition::Retryable,
        500..=599 => Disposition::Retryable,
        _ => Disposition::Terminal,
    }
}

/// Exponential backoff delay before attempt `attempt + 1`.
///
/// `attempt` is 1-based; the delay doubles per attempt from `base`. A
/// `Retry-After` hint is honored when it asks for a longer wait.
pub fn backoff_delay(attempt: u32, base: Duration, retry_after: Option<Duration>) -> Duration {
    let exp = base.saturating_mul(1u32 << (attempt.saturating_sub(1)).min(16));
    match retry_after {
        Some(hint) if hint > exp => hint,
        _ => exp,
    }
}

/// Resolve how a request's voice selector maps onto the vendor call.
///
/// A cloning request without a reference for its speaker is downgraded
/// to the configured default voice; missing references alone never fail
/// a segment.
pub fn resolve_voice(
    request: &TtsRequestSpec,
    references: &HashMap<String, PathBuf>,
    default_voice: &str,
) -> VoiceChoice {
    if request.voice == revoice_common::CLONE_VOICE {
        match references.get(&request.speaker) {
            Some(reference) => VoiceChoice::Clone(reference.clone()),
            None => VoiceChoice::DefaultFallback {
                voice: default_voice.to_string(),
                reason: format!("no reference audio for speaker {:?}", request.speaker),
            },
        }
    } else {
        VoiceChoice::Catalog(request.voice.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(voice: &str, speaker: &str) -> TtsRequestSpec {
        TtsRequestSpec {
            segment_index: 0,
            text: "hola".to_string(),
            voice: voice.to_string(),
            language: None,
            emotion: None,
            speaker: speaker.to_string(),
        }
    }

    #[test]
    fn status_classification_table() {
        assert_eq!(classify_status(200), Disposition::Success);
        assert_eq!(classify_status(204), Disposition::Success);
        assert_eq!(classify_status(429), Disposition::Retryable);
        assert_eq!(classify_status(500), Disposition::Retryable);
        assert_eq!(classify_status(503), Disposition::Retryable);
        assert_eq!(classify_status(524), Disposition::Retryable);
        assert_eq!(classify_status(400), Disposition::Terminal);
        assert_eq!(classify_status(401), Disposition::Terminal);
        assert_eq!(classify_status(404), Disposition::Terminal);
        assert_eq!(classify_status(302), Disposition::Terminal);
    }

    #[test]
    fn backoff_doubles_from_base() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(1, base, None), Duration::from_secs(1));
        assert_eq!(backoff_delay(2, base, None), Duration::from_secs(2));
        assert_eq!(backoff_delay(3, base, None), Duration::from_secs(4));
    }

    #[test]
    fn retry_after_hint_extends_but_never_shortens() {
        let base = Duration::from_secs(1);
        assert_eq!(
            backoff_delay(1, base, Some(Duration::from_secs(30))),
            Duration::from_secs(30)
        );
        assert_eq!(
            backoff_delay(3, base, Some(Duration::from_secs(1))),
            Duration::from_secs(4)
        );
    }

    #[test]
    fn clone_with_reference_resolves_to_clone() {
        let mut refs = HashMap::new();
        refs.insert("s1".to_string(), PathBuf::from("/tmp/refs/s1.wav"));
        match resolve_voice(&request("clone", "s1"), &refs, "default") {
            VoiceChoice::Clone(path) => assert_eq!(path, PathBuf::from("/tmp/refs/s1.wav")),
            other => panic!("expected Clone, got {other:?}"),
        }
    }

    #[test]
    fn clone_without_reference_downgrades() {
        let refs = HashMap::new();
        match resolve_voice(&request("clone", "s1"), &refs, "narrator") {
            VoiceChoice::DefaultFallback { voice, reason } => {
                assert_eq!(voice, "narrator");
                assert!(reason.contains("s1"));
            }
            other => panic!("expected DefaultFallback, got {other:?}"),
        }
    }

    #[test]
    fn catalog_voice_passes_through() {
        let refs = HashMap::new();
        assert_eq!(
            resolve_voice(&request("voice-7", "s1"), &refs, "default"),
            VoiceChoice::Catalog("voice-7".to_string())
        );
    }
}
