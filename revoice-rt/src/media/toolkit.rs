//! Thin wrapper over the ffmpeg/ffprobe command line tools
//!
//! Every operation takes explicit input and output paths; no implicit
//! working directory is assumed. Process failures surface as
//! `ExternalToolFailed` with the tail of stderr, and every invocation
//! runs under a wall-clock deadline.

use revoice_common::time::fmt_secs;
use revoice_common::{Error, Result, Settings};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// How much trailing stderr to keep for diagnostics
const STDERR_TAIL_BYTES: usize = 800;

/// Stretch ratios closer to 1.0 than this are treated as a plain copy
const STRETCH_EPSILON: f64 = 0.005;

/// Declarative audio filter steps, rendered into one `-af` chain
#[derive(Debug, Clone, PartialEq)]
pub enum AudioFilter {
    /// Remove rumble below the cutoff frequency (Hz)
    Highpass(u32),
    /// Remove hiss above the cutoff frequency (Hz)
    Lowpass(u32),
    /// Spectral denoise; strength in dB of noise reduction
    Denoise(DenoiseStrength),
    /// Broadcast loudness normalization
    Loudnorm { i: f64, tp: f64, lra: f64 },
    /// Dynamic range compression
    Compressor { threshold_db: f64, ratio: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenoiseStrength {
    Mild,
    Moderate,
    Strong,
}

impl DenoiseStrength {
    fn noise_reduction_db(&self) -> u32 {
        match self {
            DenoiseStrength::Mild => 6,
            DenoiseStrength::Moderate => 12,
            DenoiseStrength::Strong => 20,
        }
    }
}

impl AudioFilter {
    /// Render to ffmpeg filter syntax
    pub fn render(&self) -> String {
        match self {
            AudioFilter::Highpass(hz) => format!("highpass=f={hz}"),
            AudioFilter::Lowpass(hz) => format!("lowpass=f={hz}"),
            AudioFilter::Denoise(strength) => {
                format!("afftdn=nr={}", strength.noise_reduction_db())
            }
            AudioFilter::Loudnorm { i, tp, lra } => {
                format!("loudnorm=I={i}:TP={tp}:LRA={lra}")
            }
            AudioFilter::Compressor { threshold_db, ratio } => {
                format!("acompressor=threshold={threshold_db}dB:ratio={ratio}")
            }
        }
    }
}

/// One input of a mix call: delayed, weighted, summed onto the timeline
#[derive(Debug, Clone)]
pub struct MixInput {
    pub path: PathBuf,
    pub delay_ms: u64,
    pub weight: f64,
}

/// Outcome of a stretch call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StretchOutcome {
    /// Ratio actually applied after clamping
    pub effective_ratio: f64,
    /// True when the requested ratio fell outside the clamp bounds
    pub clamped: bool,
}

/// Which loudnorm strategy actually ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoudnormMode {
    TwoPass,
    SinglePass,
}

/// Basic stream parameters of an audio file
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioParams {
    pub duration_secs: f64,
    pub sample_rate: u32,
    pub channels: u32,
}

/// Loudnorm analysis stats printed by the first pass
#[derive(Debug, Deserialize)]
struct LoudnormStats {
    input_i: String,
    input_tp: String,
    input_lra: String,
    input_thresh: String,
    target_offset: String,
}

#[derive(Clone)]
pub struct Toolkit {
    ffmpeg: String,
    ffprobe: String,
    timeout: Duration,
}

impl Toolkit {
    pub fn new(ffmpeg: impl Into<String>, ffprobe: impl Into<String>, timeout: Duration) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            timeout,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.ffmpeg_bin.clone(),
            settings.ffprobe_bin.clone(),
            Duration::from_millis(settings.tool_timeout_ms),
        )
    }

    /// Check whether the configured ffmpeg binary can be executed
    pub fn is_available(&self) -> bool {
        std::process::Command::new(&self.ffmpeg)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run a tool to completion under the deadline
    async fn run(&self, component: &str, bin: &str, args: &[String]) -> Result<std::process::Output> {
        debug!(component, bin, ?args, "Running external tool");
        let mut cmd = Command::new(bin);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| Error::Timeout {
                component: component.to_string(),
            })?
            .map_err(|e| Error::ExternalToolFailed {
                component: component.to_string(),
                stderr_tail: format!("failed to spawn {bin}: {e}"),
            })?;

        if !output.status.success() {
            return Err(Error::ExternalToolFailed {
                component: component.to_string(),
                stderr_tail: stderr_tail(&output.stderr),
            });
        }
        Ok(output)
    }

    async fn run_ffmpeg(&self, component: &str, args: &[String]) -> Result<std::process::Output> {
        // -y: outputs are always freshly registered workspace paths
        let mut full = vec!["-hide_banner".to_string(), "-y".to_string()];
        full.extend_from_slice(args);
        self.run(component, &self.ffmpeg, &full).await
    }

    /// Duration of the primary stream in seconds; must be positive
    pub async fn probe_duration(&self, path: &Path) -> Result<f64> {
        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-show_entries".to_string(),
            "format=duration".to_string(),
            "-of".to_string(),
            "default=noprint_wrappers=1:nokey=1".to_string(),
            path.display().to_string(),
        ];
        let output = self.run("ffprobe", &self.ffprobe, &args).await?;
        parse_duration(&String::from_utf8_lossy(&output.stdout), path)
    }

    /// Duration plus sample rate and channel count of the first audio stream
    pub async fn probe_audio_params(&self, path: &Path) -> Result<AudioParams> {
        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-select_streams".to_string(),
            "a:0".to_string(),
            "-show_entries".to_string(),
            "stream=sample_rate,channels:format=duration".to_string(),
            "-of".to_string(),
            "default=noprint_wrappers=1".to_string(),
            path.display().to_string(),
        ];
        let output = self.run("ffprobe", &self.ffprobe, &args).await?;
        parse_audio_params(&String::from_utf8_lossy(&output.stdout), path)
    }

    /// Transcode to PCM wav at the default sample rate. Idempotent: the
    /// same input always yields the same parameters.
    pub async fn to_wav(&self, input: &Path, out: &Path) -> Result<()> {
        let args = vec![
            "-i".to_string(),
            input.display().to_string(),
            "-vn".to_string(),
            "-acodec".to_string(),
            "pcm_s16le".to_string(),
            "-ar".to_string(),
            "44100".to_string(),
            "-ac".to_string(),
            "2".to_string(),
            out.display().to_string(),
        ];
        self.run_ffmpeg("transcoder", &args).await?;
        Ok(())
    }

    /// Cut `[start, start+dur)` out of `input`, preserving the codec
    pub async fn trim(&self, input: &Path, out: &Path, start_secs: f64, dur_secs: f64) -> Result<()> {
        let args = vec![
            "-ss".to_string(),
            fmt_secs(start_secs),
            "-t".to_string(),
            fmt_secs(dur_secs),
            "-i".to_string(),
            input.display().to_string(),
            "-c".to_string(),
            "copy".to_string(),
            out.display().to_string(),
        ];
        self.run_ffmpeg("transcoder", &args).await?;
        Ok(())
    }

    /// Time-stretch `input` to `target_secs` without changing pitch.
    ///
    /// The tempo ratio is clamped to `[min_ratio, max_ratio]`; when the
    /// clamp binds, the operation still runs at the clamped ratio and the
    /// caller learns the effective ratio from the outcome.
    pub async fn stretch(
        &self,
        input: &Path,
        out: &Path,
        current_secs: f64,
        target_secs: f64,
        min_ratio: f64,
        max_ratio: f64,
    ) -> Result<StretchOutcome> {
        if current_secs <= 0.0 || target_secs <= 0.0 {
            return Err(Error::InvalidArtifact {
                path: input.to_path_buf(),
                reason: format!("cannot stretch {current_secs}s clip to {target_secs}s"),
            });
        }

        // atempo factor: >1 plays faster (shorter output)
        let requested = current_secs / target_secs;
        let effective = requested.clamp(min_ratio, max_ratio);
        let clamped = (effective - requested).abs() > f64::EPSILON;

        if (effective - 1.0).abs() < STRETCH_EPSILON {
            // No audible change; copy instead of resynthesis
            let args = vec![
                "-i".to_string(),
                input.display().to_string(),
                "-c".to_string(),
                "copy".to_string(),
                out.display().to_string(),
            ];
            self.run_ffmpeg("transcoder", &args).await?;
            return Ok(StretchOutcome {
                effective_ratio: 1.0,
                clamped,
            });
        }

        let args = vec![
            "-i".to_string(),
            input.display().to_string(),
            "-filter:a".to_string(),
            format!("atempo={effective:.6}"),
            out.display().to_string(),
        ];
        self.run_ffmpeg("transcoder", &args).await?;
        Ok(StretchOutcome {
            effective_ratio: effective,
            clamped,
        })
    }

    /// Lossless concatenation via the demux-concat method
    pub async fn concat(&self, inputs: &[PathBuf], out: &Path) -> Result<()> {
        if inputs.is_empty() {
            return Err(Error::InvalidArtifact {
                path: out.to_path_buf(),
                reason: "concat of empty input list".to_string(),
            });
        }
        for input in inputs {
            if !input.is_file() {
                return Err(Error::InvalidArtifact {
                    path: input.clone(),
                    reason: "concat entry missing".to_string(),
                });
            }
        }

        let list_path = out.with_extension("concat.txt");
        let mut list = String::new();
        for input in inputs {
            // concat demuxer quoting: single quotes, embedded quotes escaped
            let escaped = input.display().to_string().replace('\'', "'\\''");
            list.push_str(&format!("file '{escaped}'\n"));
        }
        std::fs::write(&list_path, list)?;

        let args = vec![
            "-f".to_string(),
            "concat".to_string(),
            "-safe".to_string(),
            "0".to_string(),
            "-i".to_string(),
            list_path.display().to_string(),
            "-c".to_string(),
            "copy".to_string(),
            out.display().to_string(),
        ];
        let result = self.run_ffmpeg("transcoder", &args).await;
        let _ = std::fs::remove_file(&list_path);
        result.map(|_| ())
    }

    /// Apply a declarative filter chain
    pub async fn filter(&self, input: &Path, out: &Path, chain: &[AudioFilter]) -> Result<()> {
        if chain.is_empty() {
            return Err(Error::InvalidArtifact {
                path: input.to_path_buf(),
                reason: "empty filter chain".to_string(),
            });
        }
        let rendered = chain
            .iter()
            .map(AudioFilter::render)
            .collect::<Vec<_>>()
            .join(",");
        let args = vec![
            "-i".to_string(),
            input.display().to_string(),
            "-af".to_string(),
            rendered,
            out.display().to_string(),
        ];
        self.run_ffmpeg("transcoder", &args).await?;
        Ok(())
    }

    /// Single-pass mix: each input delayed by its `delay_ms`, scaled by
    /// its `weight`, summed onto a common timeline. Output duration,
    /// sample rate and channel layout follow the first input.
    pub async fn mix(&self, inputs: &[MixInput], out: &Path, params: AudioParams) -> Result<()> {
        if inputs.is_empty() {
            return Err(Error::InvalidArtifact {
                path: out.to_path_buf(),
                reason: "mix of empty input list".to_string(),
            });
        }

        let mut args = Vec::new();
        for input in inputs {
            args.push("-i".to_string());
            args.push(input.path.display().to_string());
        }

        args.push("-filter_complex".to_string());
        args.push(render_mix_graph(inputs, params.sample_rate));
        args.push("-map".to_string());
        args.push("[mix]".to_string());
        args.push("-ac".to_string());
        args.push(params.channels.to_string());
        // hard cap at the background's length
        args.push("-t".to_string());
        args.push(fmt_secs(params.duration_secs));
        args.push(out.display().to_string());

        self.run_ffmpeg("transcoder", &args).await?;
        Ok(())
    }

    /// Broadcast loudness normalization.
    ///
    /// Attempts two-pass (analysis run with JSON stats, then a measured
    /// second pass); a stats parse failure falls back to single-pass and
    /// is logged, not raised.
    pub async fn loudnorm(
        &self,
        input: &Path,
        out: &Path,
        i: f64,
        tp: f64,
        lra: f64,
    ) -> Result<LoudnormMode> {
        let analysis_args = vec![
            "-i".to_string(),
            input.display().to_string(),
            "-af".to_string(),
            format!("loudnorm=I={i}:TP={tp}:LRA={lra}:print_format=json"),
            "-f".to_string(),
            "null".to_string(),
            "-".to_string(),
        ];

        let stats = match self.run_ffmpeg("transcoder", &analysis_args).await {
            Ok(output) => parse_loudnorm_stats(&String::from_utf8_lossy(&output.stderr)),
            Err(e) => {
                warn!("Loudnorm analysis pass failed, falling back to single-pass: {e}");
                None
            }
        };

        let filter = match &stats {
            Some(s) => format!(
                "loudnorm=I={i}:TP={tp}:LRA={lra}:measured_I={}:measured_TP={}:measured_LRA={}:measured_thresh={}:offset={}:linear=true",
                s.input_i, s.input_tp, s.input_lra, s.input_thresh, s.target_offset
            ),
            None => format!("loudnorm=I={i}:TP={tp}:LRA={lra}"),
        };

        let args = vec![
            "-i".to_string(),
            input.display().to_string(),
            "-af".to_string(),
            filter,
            out.display().to_string(),
        ];
        self.run_ffmpeg("transcoder", &args).await?;

        Ok(if stats.is_some() {
            LoudnormMode::TwoPass
        } else {
            LoudnormMode::SinglePass
        })
    }
}

/// Build the filter_complex graph for a mix call
fn render_mix_graph(inputs: &[MixInput], sample_rate: u32) -> String {
    let mut graph = String::new();
    let mut labels = Vec::with_capacity(inputs.len());
    for (idx, input) in inputs.iter().enumerate() {
        let label = format!("m{idx}");
        graph.push_str(&format!(
            "[{idx}:a]aresample={sample_rate},adelay={delay}:all=1,volume={weight:.4}[{label}];",
            delay = input.delay_ms,
            weight = input.weight,
        ));
        labels.push(label);
    }
    for label in &labels {
        graph.push_str(&format!("[{label}]"));
    }
    graph.push_str(&format!(
        "amix=inputs={}:duration=first:normalize=0[mix]",
        inputs.len()
    ));
    graph
}

/// Extract the loudnorm JSON block ffmpeg prints at the end of stderr
fn parse_loudnorm_stats(stderr: &str) -> Option<LoudnormStats> {
    let start = stderr.rfind('{')?;
    let end = stderr[start..].find('}')? + start;
    match serde_json::from_str::<LoudnormStats>(&stderr[start..=end]) {
        Ok(stats) => Some(stats),
        Err(e) => {
            warn!("Failed to parse loudnorm stats, falling back to single-pass: {e}");
            None
        }
    }
}

fn parse_duration(stdout: &str, path: &Path) -> Result<f64> {
    let value: f64 = stdout
        .trim()
        .parse()
        .map_err(|_| Error::InvalidArtifact {
            path: path.to_path_buf(),
            reason: format!("unparseable duration: {:?}", stdout.trim()),
        })?;
    if value <= 0.0 || !value.is_finite() {
        return Err(Error::InvalidArtifact {
            path: path.to_path_buf(),
            reason: format!("non-positive duration: {value}"),
        });
    }
    Ok(value)
}

fn parse_audio_params(stdout: &str, path: &Path) -> Result<AudioParams> {
    let mut sample_rate = None;
    let mut channels = None;
    let mut duration = None;
    for line in stdout.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        match key {
            "sample_rate" => sample_rate = value.parse::<u32>().ok(),
            "channels" => channels = value.parse::<u32>().ok(),
            "duration" => duration = value.parse::<f64>().ok(),
            _ => {}
        }
    }
    let (Some(sample_rate), Some(channels), Some(duration_secs)) = (sample_rate, channels, duration)
    else {
        return Err(Error::InvalidArtifact {
            path: path.to_path_buf(),
            reason: format!("incomplete probe output: {:?}", stdout.trim()),
        });
    };
    if duration_secs <= 0.0 {
        return Err(Error::InvalidArtifact {
            path: path.to_path_buf(),
            reason: format!("non-positive duration: {duration_secs}"),
        });
    }
    Ok(AudioParams {
        duration_secs,
        sample_rate,
        channels,
    })
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let tail_start = text.len().saturating_sub(STDERR_TAIL_BYTES);
    // don't split a UTF-8 character
    let mut start = tail_start;
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_render_to_ffmpeg_syntax() {
        assert_eq!(AudioFilter::Highpass(70).render(), "highpass=f=70");
        assert_eq!(AudioFilter::Lowpass(12000).render(), "lowpass=f=12000");
        assert_eq!(
            AudioFilter::Denoise(DenoiseStrength::Moderate).render(),
            "afftdn=nr=12"
        );
        assert_eq!(
            AudioFilter::Loudnorm {
                i: -16.0,
                tp: -1.5,
                lra: 11.0
            }
            .render(),
            "loudnorm=I=-16:TP=-1.5:LRA=11"
        );
        assert_eq!(
            AudioFilter::Compressor {
                threshold_db: -20.0,
                ratio: 3.0
            }
            .render(),
            "acompressor=threshold=-20dB:ratio=3"
        );
    }

    #[test]
    fn mix_graph_delays_and_weights_each_input() {
        let inputs = vec![
            MixInput {
                path: PathBuf::from("bg.wav"),
                delay_ms: 0,
                weight: 0.4,
            },
            MixInput {
                path: PathBuf::from("s0.wav"),
                delay_ms: 1000,
                weight: 1.0,
            },
        ];
        let graph = render_mix_graph(&inputs, 44100);
        assert!(graph.contains("[0:a]aresample=44100,adelay=0:all=1,volume=0.4000[m0]"));
        assert!(graph.contains("[1:a]aresample=44100,adelay=1000:all=1,volume=1.0000[m1]"));
        assert!(graph.ends_with("[m0][m1]amix=inputs=2:duration=first:normalize=0[mix]"));
    }

    #[test]
    fn loudnorm_stats_parse_from_stderr_tail() {
        let stderr = r#"
[Parsed_loudnorm_0 @ 0x55e]
{
	"input_i" : "-23.61",
	"input_tp" : "-6.53",
	"input_lra" : "4.30",
	"input_thresh" : "-34.13",
	"output_i" : "-16.18",
	"output_tp" : "-2.10",
	"output_lra" : "3.70",
	"output_thresh" : "-26.68",
	"normalization_type" : "dynamic",
	"target_offset" : "0.18"
}
"#;
        let stats = parse_loudnorm_stats(stderr).expect("stats should parse");
        assert_eq!(stats.input_i, "-23.61");
        assert_eq!(stats.target_offset, "0.18");
    }

    #[test]
    fn loudnorm_parse_failure_is_none_not_error() {
        assert!(parse_loudnorm_stats("no json here").is_none());
        assert!(parse_loudnorm_stats("{ broken json }").is_none());
    }

    #[test]
    fn duration_parsing_rejects_garbage_and_nonpositive() {
        let p = Path::new("x.wav");
        assert_eq!(parse_duration("5.210000\n", p).unwrap(), 5.21);
        assert!(parse_duration("N/A", p).is_err());
        assert!(parse_duration("0.0", p).is_err());
        assert!(parse_duration("-3", p).is_err());
    }

    #[test]
    fn audio_params_parse_key_value_output() {
        let p = Path::new("x.wav");
        let out = "sample_rate=44100\nchannels=2\nduration=5.000000\n";
        let params = parse_audio_params(out, p).unwrap();
        assert_eq!(params.sample_rate, 44100);
        assert_eq!(params.channels, 2);
        assert_eq!(params.duration_secs, 5.0);

        assert!(parse_audio_params("sample_rate=44100\n", p).is_err());
    }

    #[test]
    fn stderr_tail_keeps_the_end() {
        let mut long = vec![b'a'; 2000];
        long.extend_from_slice(b"the actual error");
        let tail = stderr_tail(&long);
        assert!(tail.ends_with("the actual error"));
        assert!(tail.len() <= STDERR_TAIL_BYTES);
    }

    #[tokio::test]
    async fn concat_rejects_empty_and_missing_inputs() {
        let toolkit = Toolkit::new("ffmpeg", "ffprobe", Duration::from_secs(1));
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out.wav");

        assert!(matches!(
            toolkit.concat(&[], &out).await,
            Err(Error::InvalidArtifact { .. })
        ));
        assert!(matches!(
            toolkit
                .concat(&[tmp.path().join("missing.wav")], &out)
                .await,
            Err(Error::InvalidArtifact { .. })
        ));
    }

    #[tokio::test]
    async fn stretch_rejects_degenerate_durations() {
        let toolkit = Toolkit::new("ffmpeg", "ffprobe", Duration::from_secs(1));
        let out = PathBuf::from("out.wav");
        assert!(toolkit
            .stretch(Path::new("in.wav"), &out, 0.0, 1.0, 0.5, 2.0)
            .await
            .is_err());
        assert!(toolkit
            .stretch(Path::new("in.wav"), &out, 1.0, 0.0, 0.5, 2.0)
            .await
            .is_err());
    }
}
