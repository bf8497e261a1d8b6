//! HTTP client for the TTS vendor
//!
//! Maps `TtsRequestSpec` lists onto synthesized wav files, preserving
//! input order. In-flight requests are bounded by a FIFO semaphore;
//! transient upstream failures retry with exponential backoff inside the
//! client, and only exhausted or terminal failures escalate to the
//! pipeline.

use super::policy::{backoff_delay, classify_status, resolve_voice, Disposition};
use crate::media::Workspace;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::future::join_all;
use revoice_common::types::{neutral_emotion, TtsRequestSpec, VoiceChoice};
use revoice_common::{Error, Result, Settings};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct TtsClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub default_voice: String,
    pub max_concurrency: usize,
    pub request_timeout: Duration,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl TtsClientConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            base_url: settings.tts_base_url.clone(),
            api_key: settings.tts_api_key.clone(),
            default_voice: settings.tts_default_voice.clone(),
            max_concurrency: settings.tts_max_concurrency,
            request_timeout: Duration::from_millis(settings.tts_timeout_ms),
            batch_size: settings.tts_batch_size,
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

/// Wire format of one synthesis call
#[derive(Debug, Serialize)]
struct VendorRequest<'a> {
    text: &'a str,
    language: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    default_voice_name: Option<&'a str>,
    /// Base64 reference audio for voice cloning
    #[serde(skip_serializing_if = "Option::is_none")]
    reference_audio: Option<&'a str>,
    emotion: &'a BTreeMap<String, f64>,
    format: &'static str,
}

/// Failure mode of a single HTTP attempt
#[derive(Debug)]
enum SendFailure {
    Retryable {
        status: Option<u16>,
        retry_after: Option<Duration>,
    },
    Terminal {
        status: u16,
    },
    Malformed(String),
}

pub struct TtsClient {
    http: reqwest::Client,
    cfg: TtsClientConfig,
    semaphore: Arc<Semaphore>,
}

impl TtsClient {
    pub fn new(cfg: TtsClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;
        let semaphore = Arc::new(Semaphore::new(cfg.max_concurrency));
        Ok(Self {
            http,
            cfg,
            semaphore,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(TtsClientConfig::from_settings(settings))
    }

    /// Synthesize one request into `out`.
    ///
    /// Cancellation is honored at attempt boundaries and during backoff
    /// sleeps; a cancelled call never counts as a segment failure.
    pub async fn synthesize(
        &self,
        request: &TtsRequestSpec,
        target_language: &str,
        references: &HashMap<String, PathBuf>,
        out: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let choice = resolve_voice(request, references, &self.cfg.default_voice);
        let reference_b64 = match &choice {
            VoiceChoice::Clone(path) => {
                let bytes = tokio::fs::read(path).await.map_err(|e| Error::InvalidArtifact {
                    path: path.clone(),
                    reason: format!("unreadable reference: {e}"),
                })?;
                Some(BASE64.encode(bytes))
            }
            VoiceChoice::DefaultFallback { voice, reason } => {
                warn!(
                    segment = request.segment_index,
                    fallback_voice = %voice,
                    "Downgrading cloning request: {reason}"
                );
                None
            }
            VoiceChoice::Catalog(_) => None,
        };
        let voice_name = match &choice {
            VoiceChoice::Catalog(id) => Some(id.as_str()),
            VoiceChoice::DefaultFallback { voice, .. } => Some(voice.as_str()),
            VoiceChoice::Clone(_) => None,
        };

        let emotion = request.emotion.clone().unwrap_or_else(neutral_emotion);
        let language = request.language.as_deref().unwrap_or(target_language);
        let body = VendorRequest {
            text: &request.text,
            language,
            default_voice_name: voice_name,
            reference_audio: reference_b64.as_deref(),
            emotion: &emotion,
            format: "wav",
        };

        let mut attempt = 1u32;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            // FIFO among waiters; bounds in-flight vendor calls
            let permit = self
                .semaphore
                .acquire()
                .await
                .map_err(|_| Error::Internal("TTS semaphore closed".to_string()))?;

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                outcome = self.send_once(&body) => outcome,
            };
            drop(permit);

            match outcome {
                Ok(bytes) => {
                    tokio::fs::write(out, &bytes).await?;
                    debug!(
                        segment = request.segment_index,
                        bytes = bytes.len(),
                        "Synthesis completed"
                    );
                    return Ok(());
                }
                Err(SendFailure::Terminal { status }) => {
                    return Err(Error::TtsFailed {
                        request_index: request.segment_index,
                        retryable: false,
                        upstream_status: Some(status),
                    });
                }
                Err(SendFailure::Malformed(detail)) => {
                    warn!(segment = request.segment_index, "Unusable vendor payload: {detail}");
                    return Err(Error::TtsFailed {
                        request_index: request.segment_index,
                        retryable: false,
                        upstream_status: Some(200),
                    });
                }
                Err(SendFailure::Retryable {
                    status,
                    retry_after,
                }) => {
                    if attempt >= self.cfg.max_attempts {
                        return Err(Error::TtsFailed {
                            request_index: request.segment_index,
                            retryable: true,
                            upstream_status: status,
                        });
                    }
                    let delay = backoff_delay(attempt, self.cfg.backoff_base, retry_after);
                    warn!(
                        segment = request.segment_index,
                        attempt,
                        status = ?status,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying synthesis after transient failure"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// One HTTP attempt, classified
    async fn send_once(&self, body: &VendorRequest<'_>) -> std::result::Result<Vec<u8>, SendFailure> {
        let mut request = self.http.post(&self.cfg.base_url).json(body);
        if let Some(key) = &self.cfg.api_key {
            request = request.bearer_auth(key);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Err(SendFailure::Retryable {
                    status: None,
                    retry_after: None,
                })
            }
            Err(e) => {
                // connection-level failures are transient by assumption
                debug!("TTS transport error: {e}");
                return Err(SendFailure::Retryable {
                    status: e.status().map(|s| s.as_u16()),
                    retry_after: None,
                });
            }
        };

        let status = response.status().as_u16();
        match classify_status(status) {
            Disposition::Success => {
                let content_type = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                let bytes = response.bytes().await.map_err(|e| {
                    SendFailure::Retryable {
                        status: Some(status),
                        retry_after: None,
                    }
                    .tap_log(&e)
                })?;
                to_bytes(&content_type, &bytes).map_err(SendFailure::Malformed)
            }
            Disposition::Retryable => {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs);
                Err(SendFailure::Retryable {
                    status: Some(status),
                    retry_after,
                })
            }
            Disposition::Terminal => Err(SendFailure::Terminal { status }),
        }
    }

    /// Synthesize a request list in fixed-size chunks, each chunk fully
    /// awaited before the next starts. Returns output paths in input
    /// order; a terminal failure of any request aborts the whole batch.
    pub async fn batch(
        &self,
        requests: &[TtsRequestSpec],
        target_language: &str,
        references: &HashMap<String, PathBuf>,
        workspace: &Workspace,
        cancel: &CancellationToken,
        mut on_batch_done: impl FnMut(usize, usize),
    ) -> Result<Vec<PathBuf>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let tts_dir = workspace.named_dir("tts")?;
        let total_batches = requests.len().div_ceil(self.cfg.batch_size);
        let mut outputs = Vec::with_capacity(requests.len());

        for (batch_index, chunk) in requests.chunks(self.cfg.batch_size).enumerate() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let futures = chunk.iter().map(|request| {
                let out = workspace
                    .named_path(&tts_dir, &format!("{}.wav", request.segment_index));
                async move {
                    self.synthesize(request, target_language, references, &out, cancel)
                        .await
                        .map(|_| out)
                }
            });

            // join_all preserves input order within the chunk
            for result in join_all(futures).await {
                outputs.push(result?);
            }

            info!(
                batch = batch_index + 1,
                total = total_batches,
                "Synthesis batch completed"
            );
            on_batch_done(batch_index + 1, total_batches);
        }

        Ok(outputs)
    }
}

impl SendFailure {
    fn tap_log(self, err: &dyn std::fmt::Display) -> Self {
        debug!("TTS body read failed: {err}");
        self
    }
}

/// Normalize the vendor's response shapes behind one boundary.
///
/// The vendor returns either raw audio bytes or a JSON object carrying
/// base64 audio under `audio` (some deployments use `data`). Downstream
/// code only ever sees a byte vector.
fn to_bytes(content_type: &str, body: &[u8]) -> std::result::Result<Vec<u8>, String> {
    if body.is_empty() {
        return Err("empty response body".to_string());
    }
    if content_type.contains("application/json") {
        let value: serde_json::Value =
            serde_json::from_slice(body).map_err(|e| format!("invalid JSON body: {e}"))?;
        let encoded = value
            .get("audio")
            .or_else(|| value.get("data"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| "JSON body without audio field".to_string())?;
        BASE64
            .decode(encoded)
            .map_err(|e| format!("invalid base64 audio: {e}"))
    } else {
        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_audio_body_passes_through() {
        let bytes = to_bytes("audio/wav", b"RIFFdata").unwrap();
        assert_eq!(bytes, b"RIFFdata");
    }

    #[test]
    fn json_audio_field_is_base64_decoded() {
        let encoded = BASE64.encode(b"RIFFdata");
        let body = serde_json::json!({ "audio": encoded }).to_string();
        let bytes = to_bytes("application/json", body.as_bytes()).unwrap();
        assert_eq!(bytes, b"RIFFdata");
    }

    #[test]
    fn json_data_field_is_accepted_too() {
        let encoded = BASE64.encode(b"xyz");
        let body = serde_json::json!({ "data": encoded }).to_string();
        assert_eq!(to_bytes("application/json", body.as_bytes()).unwrap(), b"xyz");
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert!(to_bytes("application/json", b"not json").is_err());
        assert!(to_bytes("application/json", br#"{"other": 1}"#).is_err());
        assert!(to_bytes(
            "application/json",
            br#"{"audio": "!!not-base64!!"}"#
        )
        .is_err());
        assert!(to_bytes("audio/wav", b"").is_err());
    }

    #[test]
    fn vendor_request_serializes_catalog_voice() {
        let emotion = neutral_emotion();
        let body = VendorRequest {
            text: "hola",
            language: "es-ES",
            default_voice_name: Some("voice-7"),
            reference_audio: None,
            emotion: &emotion,
            format: "wav",
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["default_voice_name"], "voice-7");
        assert!(json.get("reference_audio").is_none());
        assert_eq!(json["emotion"]["neutral"], 1.0);
        assert_eq!(json["format"], "wav");
    }

    #[test]
    fn vendor_request_serializes_cloning() {
        let emotion = neutral_emotion();
        let body = VendorRequest {
            text: "hola",
            language: "es-ES",
            default_voice_name: None,
            reference_audio: Some("QUJD"),
            emotion: &emotion,
            format: "wav",
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("default_voice_name").is_none());
        assert_eq!(json["reference_audio"], "QUJD");
    }
}
