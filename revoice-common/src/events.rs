//! Event types and broadcast bus for the retargeting runtime
//!
//! Events are broadcast via [`EventBus`] and serialized for SSE
//! transmission. All components publish into the same central enum so
//! subscribers can match exhaustively.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Retargeting runtime events
///
/// Per-job ordering guarantee: for one `job_id`, progress events observed
/// by any single subscriber are monotonic, and exactly one terminal event
/// (`JobCompleted` or `JobFailed`) is ever emitted. Across jobs there is
/// no ordering guarantee.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RetargetEvent {
    /// Job accepted by intake and placed on the priority queue
    JobQueued {
        job_id: Uuid,
        priority: u32,
        timestamp: DateTime<Utc>,
    },

    /// A worker picked the job up; `attempt` is 1-based
    JobStarted {
        job_id: Uuid,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },

    /// Pipeline progress changed
    ///
    /// Triggers:
    /// - SSE: push a fresh status snapshot to the job's subscribers
    JobProgress {
        job_id: Uuid,
        /// 0-100, monotonic within the job
        percent: u8,
        /// Current operation label, e.g. "separate"
        operation: String,
        timestamp: DateTime<Utc>,
    },

    /// Terminal success; emitted exactly once per job
    JobCompleted {
        job_id: Uuid,
        /// Signed URL of the final mixed audio
        result_url: String,
        timestamp: DateTime<Utc>,
    },

    /// Terminal failure; emitted exactly once per job, after all retry
    /// attempts are exhausted (or immediately for non-retryable errors)
    JobFailed {
        job_id: Uuid,
        /// Short stable reason code, no stack traces
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl RetargetEvent {
    /// Event type name, used as the SSE event field
    pub fn event_type(&self) -> &'static str {
        match self {
            RetargetEvent::JobQueued { .. } => "JobQueued",
            RetargetEvent::JobStarted { .. } => "JobStarted",
            RetargetEvent::JobProgress { .. } => "JobProgress",
            RetargetEvent::JobCompleted { .. } => "JobCompleted",
            RetargetEvent::JobFailed { .. } => "JobFailed",
        }
    }

    /// The job this event concerns
    pub fn job_id(&self) -> Uuid {
        match self {
            RetargetEvent::JobQueued { job_id, .. }
            | RetargetEvent::JobStarted { job_id, .. }
            | RetargetEvent::JobProgress { job_id, .. }
            | RetargetEvent::JobCompleted { job_id, .. }
            | RetargetEvent::JobFailed { job_id, .. } => *job_id,
        }
    }

    /// Whether this is a terminal event (`JobCompleted` / `JobFailed`)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RetargetEvent::JobCompleted { .. } | RetargetEvent::JobFailed { .. }
        )
    }
}

/// Broadcast bus connecting the queue runtime to SSE subscribers and the
/// terminal notifier.
///
/// The sender holds no references to subscribers; a subscriber that lags
/// past the buffer capacity simply misses events and re-derives state
/// from the runtime snapshot.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RetargetEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a new bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<RetargetEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers.
    ///
    /// Returns `Ok(subscriber_count)`; errors only when nobody is
    /// listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: RetargetEvent,
    ) -> Result<usize, broadcast::error::SendError<RetargetEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, silently dropping it when no subscribers exist.
    ///
    /// Progress events use this path: a job with no watchers should not
    /// log errors every stage boundary.
    pub fn emit_lossy(&self, event: RetargetEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(job_id: Uuid, percent: u8) -> RetargetEvent {
        RetargetEvent::JobProgress {
            job_id,
            percent,
            operation: "separate".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn event_type_names() {
        let id = Uuid::new_v4();
        assert_eq!(progress(id, 10).event_type(), "JobProgress");
        assert_eq!(
            RetargetEvent::JobCompleted {
                job_id: id,
                result_url: "https://blob/x".into(),
                timestamp: Utc::now(),
            }
            .event_type(),
            "JobCompleted"
        );
    }

    #[test]
    fn terminal_classification() {
        let id = Uuid::new_v4();
        assert!(!progress(id, 10).is_terminal());
        assert!(RetargetEvent::JobFailed {
            job_id: id,
            reason: "TTSFailed".into(),
            timestamp: Utc::now(),
        }
        .is_terminal());
    }

    #[test]
    fn serializes_with_type_tag() {
        let id = Uuid::new_v4();
        let json = serde_json::to_string(&progress(id, 42)).unwrap();
        assert!(json.contains("\"type\":\"JobProgress\""));
        assert!(json.contains("\"percent\":42"));

        let back: RetargetEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.job_id(), id);
    }

    #[test]
    fn bus_delivers_to_all_subscribers() {
        let bus = EventBus::new(10);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        let id = Uuid::new_v4();
        bus.emit(progress(id, 25)).expect("emit should succeed");

        assert_eq!(rx1.try_recv().unwrap().job_id(), id);
        assert_eq!(rx2.try_recv().unwrap().job_id(), id);
    }

    #[test]
    fn emit_lossy_without_subscribers_does_not_panic() {
        let bus = EventBus::new(2);
        for i in 0..10 {
            bus.emit_lossy(progress(Uuid::new_v4(), i));
        }
        assert_eq!(bus.capacity(), 2);
    }
}
