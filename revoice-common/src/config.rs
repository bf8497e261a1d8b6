//! Configuration loading
//!
//! Resolution priority for every setting:
//! 1. Environment variable (highest)
//! 2. TOML config file (`REVOICE_CONFIG`, else platform config dir)
//! 3. Compiled default
//!
//! Environment variable names follow the deployment contract
//! (`TTS_API_KEY`, `QUEUE_WORKER_CONCURRENCY`, ...); TOML keys are the
//! same names lowercased.

use crate::{Error, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

/// Runtime settings for the retargeting service
#[derive(Debug, Clone)]
pub struct Settings {
    // HTTP server
    pub host: String,
    pub port: u16,

    // Job store
    pub database_path: PathBuf,

    // Workspace root for per-job temp directories
    pub temp_root: PathBuf,

    // TTS vendor
    pub tts_base_url: String,
    pub tts_api_key: Option<String>,
    pub tts_max_concurrency: usize,
    pub tts_timeout_ms: u64,
    pub tts_batch_size: usize,
    pub tts_default_voice: String,

    // Queue runtime
    pub queue_worker_concurrency: usize,
    pub queue_max_attempts: u32,
    pub retain_completed_secs: u64,
    pub retain_failed_secs: u64,
    /// plan name -> priority class (lower = sooner); unknown plans map to
    /// the lowest priority
    pub plan_priorities: BTreeMap<String, u32>,

    // External tools
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
    pub separator_bin: String,
    pub tool_timeout_ms: u64,

    // Mixing / loudness
    pub bg_weight: f64,
    pub speech_weight: f64,
    pub target_lufs: f64,
    pub true_peak_db: f64,
    pub lra: f64,
    pub min_segment_gap_ms: u64,
    pub min_segment_ms: u64,
    pub stretch_min: f64,
    pub stretch_max: f64,
    pub final_loudnorm: bool,

    // Blob store
    pub bucket_name: String,
    pub blob_public_dir: Option<PathBuf>,
    pub blob_base_url: Option<String>,

    // Terminal notification webhook
    pub notify_webhook_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        let mut plan_priorities = BTreeMap::new();
        plan_priorities.insert("studio".to_string(), 0);
        plan_priorities.insert("pro".to_string(), 10);
        plan_priorities.insert("free".to_string(), 100);

        Self {
            host: "127.0.0.1".to_string(),
            port: 5730,
            database_path: PathBuf::from("revoice.db"),
            temp_root: default_temp_root(),
            tts_base_url: "http://127.0.0.1:8020/tts".to_string(),
            tts_api_key: None,
            tts_max_concurrency: 5,
            tts_timeout_ms: 1_200_000,
            tts_batch_size: 5,
            tts_default_voice: "default".to_string(),
            queue_worker_concurrency: 2,
            queue_max_attempts: 3,
            retain_completed_secs: 3_600,
            retain_failed_secs: 86_400,
            plan_priorities,
            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
            separator_bin: "spleeter".to_string(),
            tool_timeout_ms: 300_000,
            bg_weight: 0.4,
            speech_weight: 1.0,
            target_lufs: -16.0,
            true_peak_db: -1.5,
            lra: 11.0,
            min_segment_gap_ms: 100,
            min_segment_ms: 100,
            stretch_min: 0.5,
            stretch_max: 2.0,
            final_loudnorm: true,
            bucket_name: "revoice-output".to_string(),
            blob_public_dir: None,
            blob_base_url: None,
            notify_webhook_url: None,
        }
    }
}

/// OS-dependent default root for per-job workspaces
fn default_temp_root() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("revoice"))
        .unwrap_or_else(|| std::env::temp_dir().join("revoice"))
}

impl Settings {
    /// Load settings: defaults, then TOML file, then environment.
    pub fn load() -> Result<Self> {
        let mut settings = Settings::default();
        if let Some(path) = config_file_path() {
            let content = std::fs::read_to_string(&path)?;
            let table: toml::Value = toml::from_str(&content)
                .map_err(|e| Error::Config(format!("invalid config file {}: {e}", path.display())))?;
            settings.apply_toml(&table)?;
        }
        settings.apply_env();
        settings.validate()?;
        Ok(settings)
    }

    /// Apply a parsed TOML table; unknown keys are ignored
    pub fn apply_toml(&mut self, table: &toml::Value) -> Result<()> {
        macro_rules! get {
            ($key:expr, $getter:ident) => {
                table.get($key).and_then(|v| v.$getter())
            };
        }

        if let Some(v) = get!("host", as_str) {
            self.host = v.to_string();
        }
        if let Some(v) = get!("port", as_integer) {
            self.port = v as u16;
        }
        if let Some(v) = get!("database_path", as_str) {
            self.database_path = PathBuf::from(v);
        }
        if let Some(v) = get!("temp_root", as_str) {
            self.temp_root = PathBuf::from(v);
        }
        if let Some(v) = get!("tts_base_url", as_str) {
            self.tts_base_url = v.to_string();
        }
        if let Some(v) = get!("tts_api_key", as_str) {
            self.tts_api_key = Some(v.to_string());
        }
        if let Some(v) = get!("tts_max_concurrency", as_integer) {
            self.tts_max_concurrency = v as usize;
        }
        if let Some(v) = get!("tts_timeout_ms", as_integer) {
            self.tts_timeout_ms = v as u64;
        }
        if let Some(v) = get!("tts_batch_size", as_integer) {
            self.tts_batch_size = v as usize;
        }
        if let Some(v) = get!("tts_default_voice", as_str) {
            self.tts_default_voice = v.to_string();
        }
        if let Some(v) = get!("queue_worker_concurrency", as_integer) {
            self.queue_worker_concurrency = v as usize;
        }
        if let Some(v) = get!("queue_max_attempts", as_integer) {
            self.queue_max_attempts = v as u32;
        }
        if let Some(v) = get!("retain_completed_secs", as_integer) {
            self.retain_completed_secs = v as u64;
        }
        if let Some(v) = get!("retain_failed_secs", as_integer) {
            self.retain_failed_secs = v as u64;
        }
        if let Some(v) = get!("plan_priorities", as_str) {
            self.plan_priorities = parse_plan_priorities(v)?;
        }
        if let Some(v) = get!("ffmpeg_bin", as_str) {
            self.ffmpeg_bin = v.to_string();
        }
        if let Some(v) = get!("ffprobe_bin", as_str) {
            self.ffprobe_bin = v.to_string();
        }
        if let Some(v) = get!("separator_bin", as_str) {
            self.separator_bin = v.to_string();
        }
        if let Some(v) = get!("tool_timeout_ms", as_integer) {
            self.tool_timeout_ms = v as u64;
        }
        if let Some(v) = get!("bg_weight", as_float) {
            self.bg_weight = v;
        }
        if let Some(v) = get!("speech_weight", as_float) {
            self.speech_weight = v;
        }
        if let Some(v) = get!("target_lufs", as_float) {
            self.target_lufs = v;
        }
        if let Some(v) = get!("true_peak_db", as_float) {
            self.true_peak_db = v;
        }
        if let Some(v) = get!("lra", as_float) {
            self.lra = v;
        }
        if let Some(v) = get!("min_segment_gap_ms", as_integer) {
            self.min_segment_gap_ms = v as u64;
        }
        if let Some(v) = get!("min_segment_ms", as_integer) {
            self.min_segment_ms = v as u64;
        }
        if let Some(v) = get!("stretch_min", as_float) {
            self.stretch_min = v;
        }
        if let Some(v) = get!("stretch_max", as_float) {
            self.stretch_max = v;
        }
        if let Some(v) = get!("final_loudnorm", as_bool) {
            self.final_loudnorm = v;
        }
        if let Some(v) = get!("bucket_name", as_str) {
            self.bucket_name = v.to_string();
        }
        if let Some(v) = get!("blob_public_dir", as_str) {
            self.blob_public_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get!("blob_base_url", as_str) {
            self.blob_base_url = Some(v.to_string());
        }
        if let Some(v) = get!("notify_webhook_url", as_str) {
            self.notify_webhook_url = Some(v.to_string());
        }
        Ok(())
    }

    /// Apply environment variable overrides
    pub fn apply_env(&mut self) {
        env_string("REVOICE_HOST", &mut self.host);
        env_parse("REVOICE_PORT", &mut self.port);
        env_path("DATABASE_PATH", &mut self.database_path);
        env_path("TEMP_ROOT", &mut self.temp_root);
        env_string("TTS_BASE_URL", &mut self.tts_base_url);
        env_opt_string("TTS_API_KEY", &mut self.tts_api_key);
        env_parse("TTS_MAX_CONCURRENCY", &mut self.tts_max_concurrency);
        env_parse("TTS_TIMEOUT_MS", &mut self.tts_timeout_ms);
        env_parse("TTS_BATCH_SIZE", &mut self.tts_batch_size);
        env_string("TTS_DEFAULT_VOICE", &mut self.tts_default_voice);
        env_parse("QUEUE_WORKER_CONCURRENCY", &mut self.queue_worker_concurrency);
        env_parse("QUEUE_MAX_ATTEMPTS", &mut self.queue_max_attempts);
        env_parse("RETAIN_COMPLETED_SECS", &mut self.retain_completed_secs);
        env_parse("RETAIN_FAILED_SECS", &mut self.retain_failed_secs);
        if let Ok(raw) = std::env::var("PLAN_PRIORITIES") {
            match parse_plan_priorities(&raw) {
                Ok(map) => self.plan_priorities = map,
                Err(e) => tracing::warn!("Ignoring invalid PLAN_PRIORITIES: {e}"),
            }
        }
        env_string("FFMPEG_BIN", &mut self.ffmpeg_bin);
        env_string("FFPROBE_BIN", &mut self.ffprobe_bin);
        env_string("SEPARATOR_BIN", &mut self.separator_bin);
        env_parse("TOOL_TIMEOUT_MS", &mut self.tool_timeout_ms);
        env_parse("BG_WEIGHT", &mut self.bg_weight);
        env_parse("SPEECH_WEIGHT", &mut self.speech_weight);
        env_parse("TARGET_LUFS", &mut self.target_lufs);
        env_parse("TRUE_PEAK_DB", &mut self.true_peak_db);
        env_parse("LRA", &mut self.lra);
        env_parse("MIN_SEGMENT_GAP_MS", &mut self.min_segment_gap_ms);
        env_parse("MIN_SEGMENT_MS", &mut self.min_segment_ms);
        env_parse("STRETCH_MIN", &mut self.stretch_min);
        env_parse("STRETCH_MAX", &mut self.stretch_max);
        env_parse("FINAL_LOUDNORM", &mut self.final_loudnorm);
        env_string("BUCKET_NAME", &mut self.bucket_name);
        if let Ok(v) = std::env::var("BLOB_PUBLIC_DIR") {
            self.blob_public_dir = Some(PathBuf::from(v));
        }
        env_opt_string("BLOB_BASE_URL", &mut self.blob_base_url);
        env_opt_string("NOTIFY_WEBHOOK_URL", &mut self.notify_webhook_url);
    }

    /// Reject configurations that cannot produce a working pipeline
    fn validate(&self) -> Result<()> {
        if self.queue_worker_concurrency == 0 {
            return Err(Error::Config(
                "QUEUE_WORKER_CONCURRENCY must be at least 1".to_string(),
            ));
        }
        if self.tts_max_concurrency == 0 {
            return Err(Error::Config(
                "TTS_MAX_CONCURRENCY must be at least 1".to_string(),
            ));
        }
        if self.tts_batch_size == 0 {
            return Err(Error::Config("TTS_BATCH_SIZE must be at least 1".to_string()));
        }
        if self.queue_max_attempts == 0 {
            return Err(Error::Config("QUEUE_MAX_ATTEMPTS must be at least 1".to_string()));
        }
        if !(self.stretch_min > 0.0 && self.stretch_min <= 1.0) {
            return Err(Error::Config("STRETCH_MIN must be in (0, 1]".to_string()));
        }
        if self.stretch_max < 1.0 {
            return Err(Error::Config("STRETCH_MAX must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Priority class for a plan name; unknown plans sort last
    pub fn priority_for_plan(&self, plan: &str) -> u32 {
        self.plan_priorities
            .get(plan)
            .copied()
            .unwrap_or(u32::MAX)
    }
}

/// Parse `"studio:0,pro:10,free:100"` into a plan -> priority map
pub fn parse_plan_priorities(raw: &str) -> Result<BTreeMap<String, u32>> {
    let mut map = BTreeMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (plan, prio) = entry
            .split_once(':')
            .ok_or_else(|| Error::Config(format!("bad plan priority entry: {entry}")))?;
        let prio: u32 = prio
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("bad priority value in: {entry}")))?;
        map.insert(plan.trim().to_string(), prio);
    }
    if map.is_empty() {
        return Err(Error::Config("empty plan priority table".to_string()));
    }
    Ok(map)
}

/// Config file location: `REVOICE_CONFIG` if set, else the platform
/// config directory, else none (defaults apply)
fn config_file_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("REVOICE_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let candidate = dirs::config_dir()?.join("revoice").join("config.toml");
    candidate.exists().then_some(candidate)
}

fn env_string(key: &str, target: &mut String) {
    if let Ok(v) = std::env::var(key) {
        *target = v;
    }
}

fn env_opt_string(key: &str, target: &mut Option<String>) {
    if let Ok(v) = std::env::var(key) {
        *target = Some(v);
    }
}

fn env_path(key: &str, target: &mut PathBuf) {
    if let Ok(v) = std::env::var(key) {
        *target = PathBuf::from(v);
    }
}

fn env_parse<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse::<T>() {
            Ok(v) => *target = v,
            Err(_) => tracing::warn!("Ignoring unparseable {key}={raw}"),
        }
    }
}
