//! Timeline placement and final mix assembly
//!
//! Takes the accompaniment track plus one synthesized clip per transcript
//! segment and produces a single wav whose length matches the background.
//! Placement may shuffle segment *timing* to resolve overlaps, but the
//! sound-to-text mapping is never reordered: the clip at transcript index
//! i always carries segment i's audio.

use super::toolkit::{MixInput, Toolkit};
use super::workspace::Workspace;
use revoice_common::time::ms_to_secs;
use revoice_common::types::TranscriptSegment;
use revoice_common::{Error, Result, Settings};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A segment's adjusted placement on the output timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledSegment {
    /// Original transcript index
    pub index: usize,
    pub start_ms: u64,
    pub end_ms: u64,
}

impl ScheduledSegment {
    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

#[derive(Debug, Clone)]
pub struct CombinerConfig {
    pub min_gap_ms: u64,
    pub min_segment_ms: u64,
    pub bg_weight: f64,
    pub speech_weight: f64,
    pub stretch_min: f64,
    pub stretch_max: f64,
    pub final_loudnorm: bool,
    pub target_lufs: f64,
    pub true_peak_db: f64,
    pub lra: f64,
}

impl CombinerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            min_gap_ms: settings.min_segment_gap_ms,
            min_segment_ms: settings.min_segment_ms,
            bg_weight: settings.bg_weight,
            speech_weight: settings.speech_weight,
            stretch_min: settings.stretch_min,
            stretch_max: settings.stretch_max,
            final_loudnorm: settings.final_loudnorm,
            target_lufs: settings.target_lufs,
            true_peak_db: settings.true_peak_db,
            lra: settings.lra,
        }
    }
}

pub struct Combiner {
    toolkit: Toolkit,
    cfg: CombinerConfig,
}

impl Combiner {
    pub fn new(toolkit: Toolkit, cfg: CombinerConfig) -> Self {
        Self { toolkit, cfg }
    }

    /// Mix `speech[i]` (synthesized audio of `transcript[i]`) over
    /// `background`, each clip placed at its adjusted start time.
    pub async fn combine(
        &self,
        background: &Path,
        speech: &[PathBuf],
        transcript: &[TranscriptSegment],
        workspace: &Workspace,
    ) -> Result<PathBuf> {
        if speech.len() != transcript.len() {
            return Err(Error::Internal(format!(
                "speech/transcript length mismatch: {} vs {}",
                speech.len(),
                transcript.len()
            )));
        }

        let params = self.toolkit.probe_audio_params(background).await?;
        debug!(
            duration_secs = params.duration_secs,
            sample_rate = params.sample_rate,
            channels = params.channels,
            "Probed background"
        );

        let windows: Vec<(usize, u64, u64)> = transcript
            .iter()
            .enumerate()
            .map(|(i, seg)| (i, seg.start_ms, seg.end_ms))
            .collect();
        let schedule = resolve_overlaps(&windows, self.cfg.min_gap_ms, self.cfg.min_segment_ms);
        for (i, _, _) in &windows {
            if !schedule.iter().any(|s| s.index == *i) {
                warn!(segment = i, "Segment dropped during overlap resolution");
            }
        }

        let fitted_dir = workspace.dir("fitted")?;
        let mix_dir = workspace.named_dir("mix")?;

        // Time-fit each surviving clip to its allotted slot
        let mut inputs = vec![MixInput {
            path: background.to_path_buf(),
            delay_ms: 0,
            weight: self.cfg.bg_weight,
        }];
        for scheduled in &schedule {
            let clip = &speech[scheduled.index];
            let clip_secs = self.toolkit.probe_duration(clip).await?;
            let slot_secs = ms_to_secs(scheduled.duration_ms());

            let fitted =
                workspace.named_path(&fitted_dir, &format!("{}.wav", scheduled.index));
            let outcome = self
                .toolkit
                .stretch(
                    clip,
                    &fitted,
                    clip_secs,
                    slot_secs,
                    self.cfg.stretch_min,
                    self.cfg.stretch_max,
                )
                .await?;
            if outcome.clamped {
                // accept the overrun rather than distorting further
                warn!(
                    segment = scheduled.index,
                    effective_ratio = outcome.effective_ratio,
                    "Stretch ratio clamped; clip will overrun its slot"
                );
            }

            inputs.push(MixInput {
                path: fitted,
                delay_ms: scheduled.start_ms,
                weight: self.cfg.speech_weight,
            });
        }

        let final_path = workspace.named_path(&mix_dir, "final.wav");
        if self.cfg.final_loudnorm {
            let raw = workspace.named_path(&mix_dir, "mix-raw.wav");
            self.toolkit.mix(&inputs, &raw, params).await?;
            self.toolkit
                .loudnorm(
                    &raw,
                    &final_path,
                    self.cfg.target_lufs,
                    self.cfg.true_peak_db,
                    self.cfg.lra,
                )
                .await?;
        } else {
            self.toolkit.mix(&inputs, &final_path, params).await?;
        }

        workspace.verify(&final_path)?;
        info!(
            segments = schedule.len(),
            output = %final_path.display(),
            "Combine completed"
        );
        Ok(final_path)
    }
}

/// Resolve overlapping placements so consecutive segments keep a minimum
/// gap.
///
/// Input windows are `(transcript_index, start_ms, end_ms)`. For each
/// consecutive pair (a, b) in start order with `end_a + gap > start_b`:
/// when `a` is the longer segment its tail is truncated at
/// `start_b - gap`; otherwise `b` (start and end alike) is delayed past
/// `a`. Segments whose adjusted duration falls to `min_segment_ms` or
/// below are dropped.
pub fn resolve_overlaps(
    windows: &[(usize, u64, u64)],
    min_gap_ms: u64,
    min_segment_ms: u64,
) -> Vec<ScheduledSegment> {
    let mut schedule: Vec<ScheduledSegment> = windows
        .iter()
        .map(|&(index, start_ms, end_ms)| ScheduledSegment {
            index,
            start_ms,
            end_ms: end_ms.max(start_ms),
        })
        .collect();
    schedule.sort_by_key(|s| (s.start_ms, s.index));

    for i in 1..schedule.len() {
        let a = schedule[i - 1];
        let b = schedule[i];
        if a.end_ms + min_gap_ms <= b.start_ms {
            continue;
        }
        if a.duration_ms() > b.duration_ms() {
            // the longer earlier segment keeps its start; its tail yields
            schedule[i - 1].end_ms = b.start_ms.saturating_sub(min_gap_ms).max(a.start_ms);
        } else {
            let delta = a.end_ms + min_gap_ms - b.start_ms;
            schedule[i].start_ms = b.start_ms + delta;
            schedule[i].end_ms = b.end_ms + delta;
        }
    }

    schedule
        .into_iter()
        .filter(|s| s.duration_ms() > min_segment_ms)
        .collect()
}
