//! Per-speaker voice-cloning reference construction
//!
//! For every speaker that appears in at least one cloning segment, builds
//! one clean reference clip from the separated vocals track. Selection
//! prefers concatenating the speaker's own segments; when those are too
//! short it widens the longest ones, and as a last resort it slices the
//! middle of the whole vocals track.

use super::toolkit::{AudioFilter, DenoiseStrength, Toolkit};
use super::workspace::Workspace;
use revoice_common::time::ms_to_secs;
use revoice_common::types::TranscriptSegment;
use revoice_common::{Result, Settings};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Tunables of the selection policy
#[derive(Debug, Clone)]
pub struct ReferencePolicy {
    /// Segments shorter than this never become candidates
    pub min_clip_ms: u64,
    /// Summed candidate duration that makes a reference without widening
    pub target_total_ms: u64,
    /// Padding added on each side when widening
    pub widen_ms: u64,
    /// How many of the longest segments are widened
    pub widen_top_n: usize,
    /// Length of the centered whole-track fallback slice
    pub fallback_slice_ms: u64,
}

impl Default for ReferencePolicy {
    fn default() -> Self {
        Self {
            min_clip_ms: 500,
            target_total_ms: 10_000,
            widen_ms: 1_000,
            widen_top_n: 3,
            fallback_slice_ms: 40_000,
        }
    }
}

/// A half-open time window `[start_ms, end_ms)` on the vocals track
pub type Window = (u64, u64);

pub struct ReferenceBuilder {
    toolkit: Toolkit,
    policy: ReferencePolicy,
    target_lufs: f64,
    true_peak_db: f64,
    lra: f64,
}

impl ReferenceBuilder {
    pub fn new(toolkit: Toolkit, policy: ReferencePolicy, settings: &Settings) -> Self {
        Self {
            toolkit,
            policy,
            target_lufs: settings.target_lufs,
            true_peak_db: settings.true_peak_db,
            lra: settings.lra,
        }
    }

    /// Build one verified reference clip per speaker needing cloning.
    ///
    /// The returned map is complete before any synthesis starts and is
    /// never mutated afterwards.
    pub async fn build(
        &self,
        vocals: &Path,
        transcript: &[TranscriptSegment],
        workspace: &Workspace,
    ) -> Result<HashMap<String, PathBuf>> {
        let speakers = speakers_needing_reference(transcript);
        if speakers.is_empty() {
            debug!("No segment requests cloning; skipping reference construction");
            return Ok(HashMap::new());
        }

        let vocals_dur_ms = (self.toolkit.probe_duration(vocals).await? * 1000.0).round() as u64;
        let distinct_speakers = count_distinct_speakers(transcript);
        let refs_dir = workspace.named_dir("refs")?;
        let scratch_dir = workspace.dir("ref-clips")?;

        let mut references = HashMap::new();
        for speaker in speakers {
            let reference = self
                .build_for_speaker(
                    vocals,
                    vocals_dur_ms,
                    transcript,
                    &speaker,
                    distinct_speakers,
                    &refs_dir,
                    &scratch_dir,
                    workspace,
                )
                .await?;
            workspace.verify(&reference)?;
            references.insert(speaker, reference);
        }

        info!(count = references.len(), "Speaker references built");
        Ok(references)
    }

    #[allow(clippy::too_many_arguments)]
    async fn build_for_speaker(
        &self,
        vocals: &Path,
        vocals_dur_ms: u64,
        transcript: &[TranscriptSegment],
        speaker: &str,
        distinct_speakers: usize,
        refs_dir: &Path,
        scratch_dir: &Path,
        workspace: &Workspace,
    ) -> Result<PathBuf> {
        // A single-speaker transcript gains nothing from per-segment
        // selection: the whole vocals track is that speaker.
        let raw = if distinct_speakers == 1 {
            self.extract_fallback(vocals, vocals_dur_ms, speaker, scratch_dir, workspace)
                .await?
        } else {
            match self
                .extract_from_segments(vocals, vocals_dur_ms, transcript, speaker, scratch_dir, workspace)
                .await?
            {
                Some(path) => path,
                None => {
                    warn!(speaker, "No usable segment audio; falling back to whole-track slice");
                    self.extract_fallback(vocals, vocals_dur_ms, speaker, scratch_dir, workspace)
                        .await?
                }
            }
        };

        // Mild cleanup only: the chain must preserve voice timbre, so no
        // heavy compression and no pitch-affecting steps.
        let reference = workspace.named_path(refs_dir, &format!("{}.wav", sanitize(speaker)));
        self.toolkit
            .filter(
                &raw,
                &reference,
                &[
                    AudioFilter::Highpass(70),
                    AudioFilter::Lowpass(12_000),
                    AudioFilter::Denoise(DenoiseStrength::Moderate),
                    AudioFilter::Loudnorm {
                        i: self.target_lufs,
                        tp: self.true_peak_db,
                        lra: self.lra,
                    },
                ],
            )
            .await?;
        Ok(reference)
    }

    /// Steps 1-4 of the selection policy; `None` when no usable audio
    /// came out of the speaker's own segments
    async fn extract_from_segments(
        &self,
        vocals: &Path,
        vocals_dur_ms: u64,
        transcript: &[TranscriptSegment],
        speaker: &str,
        scratch_dir: &Path,
        workspace: &Workspace,
    ) -> Result<Option<PathBuf>> {
        let candidates = candidate_windows(transcript, speaker, self.policy.min_clip_ms);
        if candidates.is_empty() {
            return Ok(None);
        }

        let (clips, total_ms) = self
            .extract_windows(vocals, &candidates, speaker, "seg", scratch_dir, workspace)
            .await;

        if total_ms >= self.policy.target_total_ms {
            debug!(speaker, total_ms, "Using direct segment concatenation");
            let out = workspace.named_path(scratch_dir, &format!("{}-joined.wav", sanitize(speaker)));
            self.toolkit.concat(&clips, &out).await?;
            return Ok(Some(out));
        }

        // Too little clean speech: widen the longest segments to scoop up
        // breaths and trailing context around them.
        let widened = widened_windows(
            &candidates,
            self.policy.widen_ms,
            self.policy.widen_top_n,
            vocals_dur_ms,
        );
        let (clips, total_ms) = self
            .extract_windows(vocals, &widened, speaker, "wide", scratch_dir, workspace)
            .await;
        if clips.is_empty() || total_ms == 0 {
            return Ok(None);
        }

        debug!(speaker, total_ms, "Using widened segment concatenation");
        let out = workspace.named_path(scratch_dir, &format!("{}-widened.wav", sanitize(speaker)));
        self.toolkit.concat(&clips, &out).await?;
        Ok(Some(out))
    }

    /// Extract each window as a lossless clip, discarding any that fail
    /// to probe afterwards. Returns surviving clips and their summed
    /// probed duration.
    async fn extract_windows(
        &self,
        vocals: &Path,
        windows: &[Window],
        speaker: &str,
        tag: &str,
        scratch_dir: &Path,
        workspace: &Workspace,
    ) -> (Vec<PathBuf>, u64) {
        let mut clips = Vec::new();
        let mut total_ms = 0u64;
        for (idx, (start_ms, end_ms)) in windows.iter().enumerate() {
            let clip = workspace.named_path(
                scratch_dir,
                &format!("{}-{tag}-{idx}.wav", sanitize(speaker)),
            );
            let dur_ms = end_ms.saturating_sub(*start_ms);
            let extracted = self
                .toolkit
                .trim(vocals, &clip, ms_to_secs(*start_ms), ms_to_secs(dur_ms))
                .await;
            if let Err(e) = extracted {
                warn!(speaker, window = idx, "Discarding clip that failed to extract: {e}");
                continue;
            }
            match self.toolkit.probe_duration(&clip).await {
                Ok(secs) => {
                    total_ms += (secs * 1000.0).round() as u64;
                    clips.push(clip);
                }
                Err(e) => {
                    warn!(speaker, window = idx, "Discarding clip that failed to probe: {e}");
                }
            }
        }
        (clips, total_ms)
    }

    /// Step 5: centered slice of the entire vocals track
    async fn extract_fallback(
        &self,
        vocals: &Path,
        vocals_dur_ms: u64,
        speaker: &str,
        scratch_dir: &Path,
        workspace: &Workspace,
    ) -> Result<PathBuf> {
        let (start_ms, end_ms) = fallback_window(vocals_dur_ms, self.policy.fallback_slice_ms);
        let out = workspace.named_path(scratch_dir, &format!("{}-slice.wav", sanitize(speaker)));
        self.toolkit
            .trim(
                vocals,
                &out,
                ms_to_secs(start_ms),
                ms_to_secs(end_ms - start_ms),
            )
            .await?;
        Ok(out)
    }
}

/// Distinct speakers that appear in at least one cloning segment, in
/// order of first appearance
pub fn speakers_needing_reference(transcript: &[TranscriptSegment]) -> Vec<String> {
    let mut speakers = Vec::new();
    for seg in transcript {
        if seg.wants_clone() && !speakers.contains(&seg.speaker) {
            speakers.push(seg.speaker.clone());
        }
    }
    speakers
}

fn count_distinct_speakers(transcript: &[TranscriptSegment]) -> usize {
    let mut seen: Vec<&str> = Vec::new();
    for seg in transcript {
        if !seen.contains(&seg.speaker.as_str()) {
            seen.push(&seg.speaker);
        }
    }
    seen.len()
}

/// Step 1: the speaker's segments meeting the minimum duration, ordered
/// by start
pub fn candidate_windows(
    transcript: &[TranscriptSegment],
    speaker: &str,
    min_clip_ms: u64,
) -> Vec<Window> {
    let mut windows: Vec<Window> = transcript
        .iter()
        .filter(|seg| seg.speaker == speaker && seg.duration_ms() >= min_clip_ms)
        .map(|seg| (seg.start_ms, seg.end_ms))
        .collect();
    windows.sort_by_key(|w| w.0);
    windows
}

/// Step 4: widen the top-N longest windows by `widen_ms` on each side,
/// clipped to the vocals bounds, returned in start order
pub fn widened_windows(
    candidates: &[Window],
    widen_ms: u64,
    top_n: usize,
    vocals_dur_ms: u64,
) -> Vec<Window> {
    let mut by_length: Vec<Window> = candidates.to_vec();
    by_length.sort_by_key(|(start, end)| std::cmp::Reverse(end - start));
    let mut widened: Vec<Window> = by_length
        .into_iter()
        .take(top_n)
        .map(|(start, end)| {
            (
                start.saturating_sub(widen_ms),
                (end + widen_ms).min(vocals_dur_ms),
            )
        })
        .collect();
    widened.sort_by_key(|w| w.0);
    widened
}

/// Step 5: a centered slice, or the full file when shorter than the
/// requested slice
pub fn fallback_window(vocals_dur_ms: u64, slice_ms: u64) -> Window {
    if vocals_dur_ms <= slice_ms {
        (0, vocals_dur_ms)
    } else {
        let start = (vocals_dur_ms - slice_ms) / 2;
        (start, start + slice_ms)
    }
}

/// Speaker tags come from diarization and may contain anything; keep
/// filenames portable
fn sanitize(speaker: &str) -> String {
    speaker
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
