//! Source separation via an external helper process
//!
//! Splits a normalized wav into `vocals` + `accompaniment` stems. The
//! helper follows the spleeter CLI convention:
//!
//! ```text
//! <bin> separate -p spleeter:2stems -o <outdir> <input>
//! ```
//!
//! writing `<outdir>/<input-stem>/vocals.wav` and
//! `<outdir>/<input-stem>/accompaniment.wav`. The input file is never
//! modified.

use super::workspace::Workspace;
use revoice_common::{Error, Result, Settings};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Paths of the two stems produced by a separation run
#[derive(Debug, Clone)]
pub struct SeparatedStems {
    pub vocals: PathBuf,
    pub accompaniment: PathBuf,
}

#[derive(Clone)]
pub struct Separator {
    bin: String,
    timeout: Duration,
}

impl Separator {
    pub fn new(bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            timeout,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.separator_bin.clone(),
            Duration::from_millis(settings.tool_timeout_ms),
        )
    }

    /// Check whether the configured helper can be executed
    pub fn is_available(&self) -> bool {
        std::process::Command::new(&self.bin)
            .arg("--help")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok()
    }

    /// Separate `input` into vocals + accompaniment inside a fresh
    /// workspace subdirectory
    pub async fn separate(&self, input: &Path, workspace: &Workspace) -> Result<SeparatedStems> {
        let out_dir = workspace.dir("separated")?;

        debug!(
            input = %input.display(),
            out_dir = %out_dir.display(),
            "Running source separation"
        );

        let mut cmd = Command::new(&self.bin);
        cmd.arg("separate")
            .arg("-p")
            .arg("spleeter:2stems")
            .arg("-o")
            .arg(&out_dir)
            .arg(input)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| Error::Timeout {
                component: "separator".to_string(),
            })?
            .map_err(|e| Error::ExternalToolFailed {
                component: "separator".to_string(),
                stderr_tail: format!("failed to spawn {}: {e}", self.bin),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail_start = stderr.len().saturating_sub(800);
            let mut start = tail_start;
            while start < stderr.len() && !stderr.is_char_boundary(start) {
                start += 1;
            }
            return Err(Error::ExternalToolFailed {
                component: "separator".to_string(),
                stderr_tail: stderr[start..].to_string(),
            });
        }

        let stem_dir = out_dir.join(input.file_stem().unwrap_or_default());
        let vocals = stem_dir.join("vocals.wav");
        let accompaniment = stem_dir.join("accompaniment.wav");

        // the helper exiting 0 does not guarantee it wrote anything
        for artifact in [&vocals, &accompaniment] {
            workspace.verify(artifact).map_err(|_| Error::ExternalToolFailed {
                component: "separator".to_string(),
                stderr_tail: format!(
                    "separation produced no {} artifact",
                    artifact.file_name().unwrap_or_default().to_string_lossy()
                ),
            })?;
        }

        info!(
            vocals = %vocals.display(),
            accompaniment = %accompaniment.display(),
            "Source separation completed"
        );

        Ok(SeparatedStems {
            vocals,
            accompaniment,
        })
    }
}
