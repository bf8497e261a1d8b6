//! Terminal event notification
//!
//! A background task subscribes to the event bus and posts one webhook
//! per terminal event. Exactly-one-notification follows directly from
//! the runtime's exactly-once terminal emission; delivery itself is
//! fire-and-forget with logging.

use crate::queue::QueueRuntime;
use revoice_common::{EventBus, RetargetEvent};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub enum Notifier {
    Webhook(WebhookNotifier),
    Null,
}

impl Notifier {
    pub fn from_webhook_url(url: Option<String>) -> Self {
        match url {
            Some(url) => Notifier::Webhook(WebhookNotifier::new(url)),
            None => Notifier::Null,
        }
    }

    async fn notify(&self, payload: serde_json::Value) {
        match self {
            Notifier::Webhook(webhook) => webhook.notify(payload).await,
            Notifier::Null => debug!("Terminal notification suppressed (no webhook configured)"),
        }
    }
}

#[derive(Clone)]
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
        }
    }

    async fn notify(&self, payload: serde_json::Value) {
        match self.http.post(&self.url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                debug!("Terminal notification delivered");
            }
            Ok(response) => {
                warn!(status = %response.status(), "Terminal notification rejected");
            }
            Err(e) => warn!("Terminal notification failed: {e}"),
        }
    }
}

/// Subscribe to the bus and forward terminal events until the bus closes
pub fn spawn_notifier(events: &EventBus, notifier: Notifier, runtime: Arc<QueueRuntime>) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Notifier lagged behind event bus");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            if !event.is_terminal() {
                continue;
            }

            let snapshot = runtime.get(event.job_id());
            let (owner, title) = snapshot
                .map(|s| {
                    let owner = s
                        .data
                        .get("ownerEmail")
                        .and_then(|v| v.as_str())
                        .map(str::to_string);
                    (owner, s.title)
                })
                .unwrap_or((None, String::new()));

            let payload = match &event {
                RetargetEvent::JobCompleted { job_id, result_url, .. } => serde_json::json!({
                    "jobId": job_id,
                    "status": "completed",
                    "resultUrl": result_url,
                    "ownerEmail": owner,
                    "title": title,
                }),
                RetargetEvent::JobFailed { job_id, reason, .. } => serde_json::json!({
                    "jobId": job_id,
                    "status": "failed",
                    "reason": reason,
                    "ownerEmail": owner,
                    "title": title,
                }),
                _ => continue,
            };
            notifier.notify(payload).await;
        }
    });
}
