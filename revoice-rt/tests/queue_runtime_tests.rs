//! Queue runtime behavior: priority ordering, retries, terminal
//! semantics, cancellation

mod helpers;

use helpers::*;
use revoice_common::{Error, EventBus, JobState, RetargetEvent};
use revoice_rt::queue::{JobExecutor, QueueConfig, QueueRuntime};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn test_config(workers: usize, max_attempts: u32) -> QueueConfig {
    QueueConfig {
        worker_concurrency: workers,
        max_attempts,
        backoff_base: Duration::from_millis(5),
        retain_completed: Duration::from_secs(3600),
        retain_failed: Duration::from_secs(86400),
    }
}

#[tokio::test]
async fn higher_priority_jobs_start_first_under_saturation() {
    let bus = EventBus::new(64);
    let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let order_sink = Arc::clone(&order);

    let executor = JobExecutor::func(move |ctx| {
        let order = Arc::clone(&order_sink);
        Box::pin(async move {
            order.lock().unwrap().push(ctx.envelope.priority);
            Ok("https://blob/out.wav".to_string())
        })
    });

    // single worker, not yet started: everything below enqueues before
    // any job can run
    let runtime = QueueRuntime::new(test_config(1, 1), bus, executor);
    let low = runtime.enqueue(envelope(100, vec![segment(0, 1000, "a", "s1", "v")])).unwrap();
    let high = runtime.enqueue(envelope(0, vec![segment(0, 1000, "b", "s1", "v")])).unwrap();
    let mid = runtime.enqueue(envelope(10, vec![segment(0, 1000, "c", "s1", "v")])).unwrap();

    runtime.start();
    for job in [low, high, mid] {
        assert_eq!(
            wait_terminal(&runtime, job, Duration::from_secs(5)).await,
            JobState::Completed
        );
    }

    assert_eq!(*order.lock().unwrap(), vec![0, 10, 100]);
}

#[tokio::test]
async fn fifo_within_equal_priority() {
    let bus = EventBus::new(64);
    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let order_sink = Arc::clone(&order);

    let executor = JobExecutor::func(move |ctx| {
        let order = Arc::clone(&order_sink);
        Box::pin(async move {
            order.lock().unwrap().push(ctx.envelope.title());
            Ok("https://blob/out.wav".to_string())
        })
    });

    let runtime = QueueRuntime::new(test_config(1, 1), bus, executor);
    let first = runtime.enqueue(envelope(5, vec![segment(0, 1000, "first", "s1", "v")])).unwrap();
    let second = runtime.enqueue(envelope(5, vec![segment(0, 1000, "second", "s1", "v")])).unwrap();

    runtime.start();
    wait_terminal(&runtime, first, Duration::from_secs(5)).await;
    wait_terminal(&runtime, second, Duration::from_secs(5)).await;

    assert_eq!(*order.lock().unwrap(), vec!["first".to_string(), "second".to_string()]);
}

#[tokio::test]
async fn retryable_failure_retries_then_succeeds_with_one_terminal() {
    let bus = EventBus::new(64);
    let events = collect_events(&bus);
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_probe = Arc::clone(&attempts);

    let executor = JobExecutor::func(move |_ctx| {
        let attempts = Arc::clone(&attempts_probe);
        Box::pin(async move {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::Timeout { component: "tts".to_string() })
            } else {
                Ok("https://blob/out.wav".to_string())
            }
        })
    });

    let runtime = QueueRuntime::new(test_config(1, 3), bus, executor);
    runtime.start();
    let job = runtime.enqueue(envelope(1, vec![segment(0, 1000, "x", "s1", "v")])).unwrap();

    assert_eq!(
        wait_terminal(&runtime, job, Duration::from_secs(5)).await,
        JobState::Completed
    );
    // exactly one retry
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(runtime.get(job).unwrap().attempts, 2);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let events = events.lock().unwrap();
    let terminals = terminal_events_for(&events, job);
    assert_eq!(terminals.len(), 1);
    assert!(matches!(terminals[0], RetargetEvent::JobCompleted { .. }));
}

#[tokio::test]
async fn exhausted_retries_emit_exactly_one_failed() {
    let bus = EventBus::new(64);
    let events = collect_events(&bus);
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_probe = Arc::clone(&attempts);

    let executor = JobExecutor::func(move |_ctx| {
        let attempts = Arc::clone(&attempts_probe);
        Box::pin(async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<String, _>(Error::ExternalToolFailed {
                component: "separator".to_string(),
                stderr_tail: "boom".to_string(),
            })
        })
    });

    let runtime = QueueRuntime::new(test_config(1, 3), bus, executor);
    runtime.start();
    let job = runtime.enqueue(envelope(1, vec![segment(0, 1000, "x", "s1", "v")])).unwrap();

    assert_eq!(
        wait_terminal(&runtime, job, Duration::from_secs(5)).await,
        JobState::Failed
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let snapshot = runtime.get(job).unwrap();
    assert_eq!(snapshot.failure_reason.as_deref(), Some("ExternalToolFailed"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let events = events.lock().unwrap();
    assert_eq!(terminal_events_for(&events, job).len(), 1);
}

#[tokio::test]
async fn non_retryable_failure_aborts_immediately() {
    let bus = EventBus::new(64);
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_probe = Arc::clone(&attempts);

    let executor = JobExecutor::func(move |_ctx| {
        let attempts = Arc::clone(&attempts_probe);
        Box::pin(async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<String, _>(Error::TtsFailed {
                request_index: 2,
                retryable: false,
                upstream_status: Some(400),
            })
        })
    });

    let runtime = QueueRuntime::new(test_config(1, 3), bus, executor);
    runtime.start();
    let job = runtime.enqueue(envelope(1, vec![segment(0, 1000, "x", "s1", "v")])).unwrap();

    assert_eq!(
        wait_terminal(&runtime, job, Duration::from_secs(5)).await,
        JobState::Failed
    );
    // no retry for a terminal 400
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(
        runtime.get(job).unwrap().failure_reason.as_deref(),
        Some("TTSFailed")
    );
}

#[tokio::test]
async fn progress_is_clamped_monotonic() {
    let bus = EventBus::new(64);
    let events = collect_events(&bus);

    let executor = JobExecutor::func(|ctx| {
        Box::pin(async move {
            ctx.progress.update(10, "fetch");
            ctx.progress.update(40, "references");
            // a later stage computing a lower value is clamped up
            ctx.progress.update(25, "separate");
            ctx.progress.update(90, "synthesize");
            ctx.progress.update(80, "combine");
            Ok("https://blob/out.wav".to_string())
        })
    });

    let runtime = QueueRuntime::new(test_config(1, 1), bus, executor);
    runtime.start();
    let job = runtime.enqueue(envelope(1, vec![segment(0, 1000, "x", "s1", "v")])).unwrap();
    assert_eq!(
        wait_terminal(&runtime, job, Duration::from_secs(5)).await,
        JobState::Completed
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    let events = events.lock().unwrap();
    let percents = progress_percents_for(&events, job);
    assert!(!percents.is_empty());
    assert!(
        percents.windows(2).all(|w| w[0] <= w[1]),
        "progress regressed: {percents:?}"
    );
    assert_eq!(runtime.get(job).unwrap().progress, 100);
}

#[tokio::test]
async fn cancelling_a_queued_job_fails_it_without_running() {
    let bus = EventBus::new(64);
    let events = collect_events(&bus);
    let ran = Arc::new(AtomicUsize::new(0));
    let ran_probe = Arc::clone(&ran);

    let executor = JobExecutor::func(move |_ctx| {
        let ran = Arc::clone(&ran_probe);
        Box::pin(async move {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok("https://blob/out.wav".to_string())
        })
    });

    // not started: the job stays queued while we cancel it
    let runtime = QueueRuntime::new(test_config(1, 3), bus, executor);
    let job = runtime.enqueue(envelope(1, vec![segment(0, 1000, "x", "s1", "v")])).unwrap();

    assert!(runtime.cancel(job));
    assert_eq!(
        wait_terminal(&runtime, job, Duration::from_secs(5)).await,
        JobState::Failed
    );
    assert_eq!(
        runtime.get(job).unwrap().failure_reason.as_deref(),
        Some("Cancelled")
    );

    runtime.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    let events = events.lock().unwrap();
    let terminals = terminal_events_for(&events, job);
    assert_eq!(terminals.len(), 1);
    assert!(matches!(terminals[0], RetargetEvent::JobFailed { .. }));
}

#[tokio::test]
async fn cancelling_a_processing_job_aborts_at_checkpoint() {
    let bus = EventBus::new(64);

    let executor = JobExecutor::func(|ctx| {
        Box::pin(async move {
            // long-running stage honoring its cancellation checkpoint
            tokio::select! {
                _ = ctx.cancel.cancelled() => Err(Error::Cancelled),
                _ = tokio::time::sleep(Duration::from_secs(30)) => {
                    Ok("https://blob/out.wav".to_string())
                }
            }
        })
    });

    let runtime = QueueRuntime::new(test_config(1, 3), bus, executor);
    runtime.start();
    let job = runtime.enqueue(envelope(1, vec![segment(0, 1000, "x", "s1", "v")])).unwrap();

    // wait until a worker picked it up
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if runtime.get(job).unwrap().state == JobState::Processing {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(runtime.cancel(job));
    assert_eq!(
        wait_terminal(&runtime, job, Duration::from_secs(5)).await,
        JobState::Failed
    );
    assert_eq!(
        runtime.get(job).unwrap().failure_reason.as_deref(),
        Some("Cancelled")
    );
}

#[tokio::test]
async fn duplicate_enqueue_of_active_job_is_rejected() {
    let bus = EventBus::new(64);
    let executor = JobExecutor::func(|_ctx| Box::pin(async { Ok(String::from("url")) }));
    let runtime = QueueRuntime::new(test_config(1, 1), bus, executor);

    let env = envelope(1, vec![segment(0, 1000, "x", "s1", "v")]);
    let mut duplicate = env.clone();
    duplicate.priority = 2;

    runtime.enqueue(env).unwrap();
    let err = runtime.enqueue(duplicate).unwrap_err();
    assert!(matches!(err, Error::PreconditionFailed(_)));
}

#[tokio::test]
async fn unknown_job_is_not_cancellable_or_gettable() {
    let bus = EventBus::new(8);
    let executor = JobExecutor::func(|_ctx| Box::pin(async { Ok(String::new()) }));
    let runtime = QueueRuntime::new(test_config(1, 1), bus, executor);

    let unknown = uuid::Uuid::new_v4();
    assert!(runtime.get(unknown).is_none());
    assert!(!runtime.cancel(unknown));
}
