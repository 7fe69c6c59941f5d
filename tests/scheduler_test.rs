use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::sleep;

use headcount::models::job::{JobId, JobStatus};
use headcount::services::scheduler::{JobContext, SchedulerError, TaskScheduler};

const POLL: Duration = Duration::from_millis(10);
const LONG: Duration = Duration::from_secs(5);

/// Submit a job that parks until `gate` is notified, then returns `value`.
fn submit_gated(scheduler: &TaskScheduler<Value>, gate: Arc<Notify>, value: Value) -> JobId {
    scheduler
        .submit(LONG, move |_ctx| async move {
            gate.notified().await;
            Ok::<_, String>(value)
        })
        .unwrap()
}

async fn wait_for_status(scheduler: &TaskScheduler<Value>, id: JobId, status: JobStatus) {
    for _ in 0..500 {
        if scheduler.status(id).unwrap().status == status {
            return;
        }
        sleep(POLL).await;
    }
    panic!("job {id} never reached {status}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_job_completes_with_result() {
    let scheduler = TaskScheduler::<Value>::new(4);

    let id = scheduler
        .submit(LONG, |_ctx| async {
            sleep(Duration::from_millis(50)).await;
            Ok::<_, String>(json!({"people": 3}))
        })
        .unwrap();

    let view = scheduler.wait(id, POLL).await.unwrap();
    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(view.result, Some(json!({"people": 3})));
    assert_eq!(view.error, None);
    assert_eq!(view.progress, 100);

    let started = view.started_at.expect("started_at set");
    let completed = view.completed_at.expect("completed_at set");
    let ran_for = (completed - started).num_milliseconds();
    assert!((45..1000).contains(&ran_for), "ran for {ran_for}ms");
    assert!(view.created_at <= started);
}

#[tokio::test]
async fn test_new_job_is_pending_or_running() {
    let scheduler = TaskScheduler::<Value>::new(1);
    let gate = Arc::new(Notify::new());
    let id = submit_gated(&scheduler, Arc::clone(&gate), json!(1));

    let view = scheduler.status(id).unwrap();
    assert!(matches!(view.status, JobStatus::Pending | JobStatus::Running));
    assert!(view.completed_at.is_none());
    assert!(view.result.is_none());

    gate.notify_one();
    scheduler.wait(id, POLL).await.unwrap();
}

#[tokio::test]
async fn test_status_is_idempotent_once_completed() {
    let scheduler = TaskScheduler::<Value>::new(2);
    let id = scheduler
        .submit(LONG, |_ctx| async { Ok::<_, String>(json!({"people": 7})) })
        .unwrap();

    let first = scheduler.wait(id, POLL).await.unwrap();
    for _ in 0..5 {
        let again = scheduler.status(id).unwrap();
        assert_eq!(again.status, JobStatus::Completed);
        assert_eq!(again.result, first.result);
        assert_eq!(again.completed_at, first.completed_at);
    }
    assert!(!scheduler.cancel(id).unwrap());
}

#[tokio::test]
async fn test_zero_timeout_rejected() {
    let scheduler = TaskScheduler::<Value>::new(1);
    let err = scheduler
        .submit(Duration::ZERO, |_ctx| async { Ok::<_, String>(Value::Null) })
        .unwrap_err();

    assert!(matches!(err, SchedulerError::InvalidArgument(_)));
    assert_eq!(scheduler.counts().total(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_observed_on_poll() {
    let scheduler = TaskScheduler::<Value>::new(1);
    let id = scheduler
        .submit(Duration::from_millis(100), |_ctx| async {
            sleep(Duration::from_secs(3)).await;
            Ok::<_, String>(json!("too late"))
        })
        .unwrap();

    sleep(Duration::from_millis(250)).await;
    let view = scheduler.status(id).unwrap();
    assert_eq!(view.status, JobStatus::TimedOut);
    assert!(view.error.unwrap().contains("timed out"));
    assert!(view.result.is_none());
    assert!(view.completed_at.is_some());

    // Absorbing
    assert_eq!(scheduler.status(id).unwrap().status, JobStatus::TimedOut);
    assert!(!scheduler.cancel(id).unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timed_out_work_frees_its_slot() {
    let scheduler = TaskScheduler::<Value>::new(1);
    let stuck = scheduler
        .submit(Duration::from_millis(50), |_ctx| async {
            sleep(Duration::from_secs(30)).await;
            Ok::<_, String>(Value::Null)
        })
        .unwrap();
    let next = scheduler
        .submit(LONG, |_ctx| async { Ok::<_, String>(json!("next")) })
        .unwrap();

    sleep(Duration::from_millis(120)).await;
    assert_eq!(scheduler.status(stuck).unwrap().status, JobStatus::TimedOut);

    let view = tokio::time::timeout(Duration::from_secs(2), scheduler.wait(next, POLL))
        .await
        .expect("queued job should start once the timed-out work is aborted")
        .unwrap();
    assert_eq!(view.result, Some(json!("next")));
}

#[tokio::test]
async fn test_progress_updates_while_running() {
    let scheduler = TaskScheduler::<Value>::new(1);
    let gate = Arc::new(Notify::new());
    let id = submit_gated(&scheduler, Arc::clone(&gate), json!("done"));
    wait_for_status(&scheduler, id, JobStatus::Running).await;

    for pct in [0u8, 42, 100, 17] {
        scheduler.update_progress(id, pct).unwrap();
        assert_eq!(scheduler.status(id).unwrap().progress, pct);
    }

    let err = scheduler.update_progress(id, 101).unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidArgument(_)));
    assert_eq!(scheduler.status(id).unwrap().progress, 17);

    gate.notify_one();
    scheduler.wait(id, POLL).await.unwrap();

    // Terminal jobs are frozen
    scheduler.update_progress(id, 5).unwrap();
    assert_eq!(scheduler.status(id).unwrap().progress, 100);
}

#[tokio::test]
async fn test_work_reports_progress_through_context() {
    let scheduler = TaskScheduler::<Value>::new(1);
    let gate = Arc::new(Notify::new());
    let release = Arc::clone(&gate);

    let id = scheduler
        .submit(LONG, move |ctx: JobContext| async move {
            ctx.set_progress(60).map_err(|e| e.to_string())?;
            release.notified().await;
            Ok::<_, String>(Value::Null)
        })
        .unwrap();

    for _ in 0..500 {
        if scheduler.status(id).unwrap().progress == 60 {
            break;
        }
        sleep(POLL).await;
    }
    assert_eq!(scheduler.status(id).unwrap().progress, 60);

    gate.notify_one();
    scheduler.wait(id, POLL).await.unwrap();
}

#[tokio::test]
async fn test_unknown_job() {
    let scheduler = TaskScheduler::<Value>::new(1);
    let ghost = JobId::new();

    assert_eq!(scheduler.status(ghost).unwrap_err(), SchedulerError::NotFound(ghost));
    assert_eq!(scheduler.cancel(ghost).unwrap_err(), SchedulerError::NotFound(ghost));
    tokio_test::assert_ok!(scheduler.update_progress(ghost, 50));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_job_does_not_affect_others() {
    let scheduler = TaskScheduler::<Value>::new(2);

    let bad = scheduler
        .submit(LONG, |_ctx| async { Err::<Value, _>("detector unreachable") })
        .unwrap();
    let good = scheduler
        .submit(LONG, |_ctx| async { Ok::<_, String>(json!({"people": 1})) })
        .unwrap();

    let bad_view = scheduler.wait(bad, POLL).await.unwrap();
    assert_eq!(bad_view.status, JobStatus::Failed);
    assert_eq!(bad_view.error.as_deref(), Some("detector unreachable"));
    assert!(bad_view.result.is_none());

    let good_view = scheduler.wait(good, POLL).await.unwrap();
    assert_eq!(good_view.status, JobStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_job_is_failed() {
    let scheduler = TaskScheduler::<Value>::new(1);

    let id = scheduler
        .submit(LONG, |_ctx| async {
            if true {
                panic!("frame buffer exploded");
            }
            Ok::<_, String>(Value::Null)
        })
        .unwrap();

    let view = scheduler.wait(id, POLL).await.unwrap();
    assert_eq!(view.status, JobStatus::Failed);
    assert!(view.error.unwrap().contains("frame buffer exploded"));

    // The slot is released and the scheduler keeps working.
    let after = scheduler
        .submit(LONG, |_ctx| async { Ok::<_, String>(json!(2)) })
        .unwrap();
    assert_eq!(scheduler.wait(after, POLL).await.unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn test_cancel_pending_job_never_runs() {
    let scheduler = TaskScheduler::<Value>::new(1);
    let gate = Arc::new(Notify::new());
    let blocker = submit_gated(&scheduler, Arc::clone(&gate), json!("first"));
    wait_for_status(&scheduler, blocker, JobStatus::Running).await;

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let queued = scheduler
        .submit(LONG, move |_ctx| async move {
            flag.store(true, Ordering::SeqCst);
            Ok::<_, String>(Value::Null)
        })
        .unwrap();
    assert_eq!(scheduler.status(queued).unwrap().status, JobStatus::Pending);

    assert!(scheduler.cancel(queued).unwrap());
    assert!(!scheduler.cancel(queued).unwrap());

    gate.notify_one();
    scheduler.wait(blocker, POLL).await.unwrap();
    scheduler.shutdown().await;

    let view = scheduler.status(queued).unwrap();
    assert_eq!(view.status, JobStatus::Cancelled);
    assert!(view.started_at.is_none());
    assert!(view.error.is_some());
    assert!(!ran.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_running_job() {
    let scheduler = TaskScheduler::<Value>::new(1);
    let id = scheduler
        .submit(LONG, |ctx: JobContext| async move {
            while !ctx.is_cancelled() {
                sleep(Duration::from_millis(5)).await;
            }
            Ok::<_, String>(json!("should be discarded"))
        })
        .unwrap();
    wait_for_status(&scheduler, id, JobStatus::Running).await;

    assert!(scheduler.cancel(id).unwrap());
    sleep(Duration::from_millis(50)).await;

    let view = scheduler.status(id).unwrap();
    assert_eq!(view.status, JobStatus::Cancelled);
    assert!(view.result.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_running_jobs_bounded_by_pool_size() {
    let scheduler = TaskScheduler::<Value>::new(2);
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let ids: Vec<JobId> = (0..6)
        .map(|n| {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            scheduler
                .submit(LONG, move |_ctx| async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(60)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(json!(n))
                })
                .unwrap()
        })
        .collect();

    let mut saw_queue = false;
    loop {
        let counts = scheduler.counts();
        assert!(counts.running <= 2, "{} jobs running", counts.running);
        saw_queue |= counts.pending > 0;
        if counts.completed == ids.len() {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }

    assert!(saw_queue);
    assert_eq!(peak.load(Ordering::SeqCst), 2);
    for id in ids {
        assert_eq!(scheduler.status(id).unwrap().status, JobStatus::Completed);
    }
}

#[tokio::test]
async fn test_cleanup_only_removes_finished_jobs() {
    let scheduler = TaskScheduler::<Value>::new(1);
    let done = scheduler
        .submit(LONG, |_ctx| async { Ok::<_, String>(Value::Null) })
        .unwrap();
    scheduler.wait(done, POLL).await.unwrap();

    let gate = Arc::new(Notify::new());
    let live = submit_gated(&scheduler, Arc::clone(&gate), Value::Null);
    wait_for_status(&scheduler, live, JobStatus::Running).await;

    assert_eq!(scheduler.cleanup(Duration::from_secs(3600)), 0);
    assert!(scheduler.status(done).is_ok());

    sleep(Duration::from_millis(20)).await;
    assert_eq!(scheduler.cleanup(Duration::from_millis(10)), 1);
    assert_eq!(scheduler.status(done).unwrap_err(), SchedulerError::NotFound(done));
    assert_eq!(scheduler.status(live).unwrap().status, JobStatus::Running);

    gate.notify_one();
    scheduler.wait(live, POLL).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_drains_queue_and_rejects_new_work() {
    let scheduler = TaskScheduler::<Value>::new(1);
    let ids: Vec<JobId> = (0..3)
        .map(|n| {
            scheduler
                .submit(LONG, move |_ctx| async move {
                    sleep(Duration::from_millis(20)).await;
                    Ok::<_, String>(json!(n))
                })
                .unwrap()
        })
        .collect();

    scheduler.shutdown().await;
    assert!(!scheduler.is_accepting());

    for (n, id) in ids.into_iter().enumerate() {
        let view = scheduler.status(id).unwrap();
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.result, Some(json!(n)));
    }

    let err = scheduler
        .submit(LONG, |_ctx| async { Ok::<_, String>(Value::Null) })
        .unwrap_err();
    assert_eq!(err, SchedulerError::ShuttingDown);
}

#[tokio::test]
async fn test_concurrent_submitters() {
    let scheduler = TaskScheduler::<Value>::new(3);

    let handles: Vec<_> = (0..8)
        .map(|n| {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler
                    .submit(LONG, move |_ctx| async move { Ok::<_, String>(json!(n)) })
                    .unwrap()
            })
        })
        .collect();

    let ids: Vec<JobId> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|h| h.unwrap())
        .collect();

    for id in &ids {
        assert_eq!(scheduler.wait(*id, POLL).await.unwrap().status, JobStatus::Completed);
    }
    assert_eq!(scheduler.counts().completed, 8);
}

#[test]
fn test_detached_context_validates_progress() {
    let ctx = JobContext::detached();
    assert!(!ctx.is_cancelled());
    assert!(ctx.set_progress(100).is_ok());
    assert!(matches!(
        ctx.set_progress(250),
        Err(SchedulerError::InvalidArgument(_))
    ));
}
