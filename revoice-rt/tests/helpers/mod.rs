//! Shared helpers for integration tests

#![allow(dead_code)]

use revoice_common::types::{Transcreation, TranscriptSegment};
use revoice_common::{EventBus, JobEnvelope, JobState, RetargetEvent};
use revoice_rt::queue::QueueRuntime;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub fn segment(start_ms: u64, end_ms: u64, text: &str, speaker: &str, voice: &str) -> TranscriptSegment {
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

pub fn envelope(priority: u32, segments: Vec<TranscriptSegment>) -> JobEnvelope {
    let tts_requests = revoice_rt::intake::build_tts_requests(&segments);
    JobEnvelope {
        transcreation_id: Uuid::new_v4(),
        original_audio_url: "https://example.com/original.mp3".to_string(),
        transcript: segments,
        tts_requests,
        target_language: "es-ES".to_string(),
        owner_email: None,
        priority,
    }
}

pub fn transcreation(id: Uuid, original_audio_url: &str, segments: Vec<TranscriptSegment>) -> Transcreation {
    Transcreation {
        id,
        original_audio_url: original_audio_url.to_string(),
        from_language: Some("en-US".to_string()),
        to_language: Some("es-ES".to_string()),
        plan: "pro".to_string(),
        owner_email: Some("owner@example.com".to_string()),
        segments,
    }
}

/// Poll until the job reaches a terminal state or the timeout expires
pub async fn wait_terminal(runtime: &QueueRuntime, job_id: Uuid, timeout: Duration) -> JobState {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(snapshot) = runtime.get(job_id) {
            if snapshot.state.is_terminal() {
                return snapshot.state;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("job {job_id} did not reach a terminal state within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Collect every event from the bus into a shared vector
pub fn collect_events(bus: &EventBus) -> Arc<Mutex<Vec<RetargetEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            sink.lock().unwrap().push(event);
        }
    });
    events
}

pub fn terminal_events_for(events: &[RetargetEvent], job_id: Uuid) -> Vec<&RetargetEvent> {
    events
        .iter()
        .filter(|e| e.job_id() == job_id && e.is_terminal())
        .collect()
}

pub fn progress_percents_for(events: &[RetargetEvent], job_id: Uuid) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e {
            RetargetEvent::JobProgress { job_id: id, percent, .. } if *id == job_id => {
                Some(*percent)
            }
            _ => None,
        })
        .collect()
}

/// Write an executable stub shell script (unix only)
#[cfg(unix)]
pub fn write_stub_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// Stub ffprobe: answers both the duration probe and the stream-params
/// probe with fixed values
#[cfg(unix)]
pub fn stub_ffprobe(dir: &Path) -> PathBuf {
    write_stub_script(
        dir,
        "stub-ffprobe.sh",
        r#"case "$*" in
  *sample_rate*) printf 'sample_rate=44100\nchannels=2\nduration=5.000000\n';;
  *) printf '5.000000\n';;
esac"#,
    )
}

/// Stub ffmpeg: writes a non-empty file at the output path (the last
/// argument); analysis passes ending in `-` are a no-op
#[cfg(unix)]
pub fn stub_ffmpeg(dir: &Path) -> PathBuf {
    write_stub_script(
        dir,
        "stub-ffmpeg.sh",
        r#"for last; do :; done
if [ "$last" = "-" ]; then exit 0; fi
printf 'RIFF-stub-wav-data' > "$last""#,
    )
}

/// Stub ffmpeg that fails whenever a marker file exists, for fault
/// injection at a chosen stage
#[cfg(unix)]
pub fn stub_ffmpeg_failing_when(dir: &Path, marker: &Path) -> PathBuf {
    write_stub_script(
        dir,
        "stub-ffmpeg-faulty.sh",
        &format!(
            r#"if [ -e "{marker}" ]; then echo 'injected fault' >&2; exit 1; fi
for last; do :; done
if [ "$last" = "-" ]; then exit 0; fi
printf 'RIFF-stub-wav-data' > "$last""#,
            marker = marker.display()
        ),
    )
}

/// Stub separator following the helper CLI convention
#[cfg(unix)]
pub fn stub_separator(dir: &Path) -> PathBuf {
    write_stub_script(
        dir,
        "stub-separator.sh",
        r#"outdir="$4"
input="$5"
stem=$(basename "$input" .wav)
mkdir -p "$outdir/$stem"
printf 'RIFF-vocals' > "$outdir/$stem/vocals.wav"
printf 'RIFF-accomp' > "$outdir/$stem/accompaniment.wav""#,
    )
}

/// Stub separator that always fails with stderr output
#[cfg(unix)]
pub fn stub_separator_failing(dir: &Path) -> PathBuf {
    write_stub_script(
        dir,
        "stub-separator-failing.sh",
        "echo 'separation model crashed' >&2; exit 2",
    )
}

/// Count job workspaces left under a temp root
pub fn job_workspaces_under(temp_root: &Path) -> usize {
    match std::fs::read_dir(temp_root) {
        Err(_) => 0,
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("job-"))
            .count(),
    }
}
