//! Lifecycle tests for the task scheduler.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time;

use eventvisor::{SchedulerConfig, TaskScheduler};

#[tokio::test]
async fn cancel_waits_for_cooperative_exit() {
    let scheduler = TaskScheduler::new();
    let stopped = Arc::new(AtomicBool::new(false));

    let flag = stopped.clone();
    let handle = scheduler
        .create("looper", move |ctx| async move {
            ctx.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        })
        .await;

    assert!(scheduler.is_active(&handle).await);
    assert!(scheduler.cancel(&handle, true).await);
    assert!(stopped.load(Ordering::SeqCst));
    assert!(!scheduler.is_active(&handle).await);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn cancelling_twice_is_a_noop() {
    let scheduler = TaskScheduler::new();

    let handle = scheduler
        .create("once", |ctx| async move {
            ctx.cancelled().await;
        })
        .await;

    assert!(scheduler.cancel(&handle, true).await);
    assert!(!scheduler.cancel(&handle, true).await);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn cleanup_sweep_drops_finished_entries() {
    let scheduler = TaskScheduler::with_config(SchedulerConfig {
        grace: Duration::from_secs(1),
        cleanup_interval: Duration::from_millis(20),
    });

    scheduler.create("short", |_ctx| async {}).await;
    scheduler.create("short", |_ctx| async {}).await;

    for _ in 0..100 {
        if scheduler.live_count().await == 0 {
            break;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(scheduler.live_count().await, 0);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_every_task() {
    let scheduler = TaskScheduler::new();
    let stopped = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let counter = stopped.clone();
        scheduler
            .create("looper", move |ctx| async move {
                ctx.cancelled().await;
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;
    }

    assert_eq!(scheduler.live_count().await, 3);
    scheduler.shutdown().await;
    assert_eq!(scheduler.live_count().await, 0);
    assert_eq!(stopped.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn grace_exceeded_aborts_the_task() {
    let scheduler = TaskScheduler::with_config(SchedulerConfig {
        grace: Duration::from_millis(50),
        cleanup_interval: Duration::from_secs(300),
    });

    // Ignores its token, so only the abort can stop it.
    let handle = scheduler
        .create("stubborn", |_ctx| async {
            loop {
                time::sleep(Duration::from_secs(3600)).await;
            }
        })
        .await;

    assert!(!scheduler.cancel(&handle, true).await);
    assert!(!scheduler.is_active(&handle).await);

    scheduler.shutdown().await;
}
