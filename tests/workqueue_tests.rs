#![allow(clippy::unwrap_used, missing_docs)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aggfs::error::VfsError;
use aggfs::workqueue::WorkQueue;
use tokio::sync::Notify;

/// Poll until `cond` holds or the deadline passes.
async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within deadline");
}

#[tokio::test]
async fn tasks_are_processed() {
    let processed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&processed);
    let queue = WorkQueue::new(10, 2, move |n: usize| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(n, Ordering::SeqCst);
            Ok(())
        }
    });

    for _ in 0..5 {
        queue.submit(1, |_| panic!("must not drop"));
    }
    wait_until(|| processed.load(Ordering::SeqCst) == 5).await;
}

#[tokio::test]
async fn handler_failure_does_not_kill_the_worker() {
    let processed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&processed);
    let queue = WorkQueue::new(10, 1, move |fail: bool| {
        let counter = Arc::clone(&counter);
        async move {
            if fail {
                return Err(VfsError::other("task failed"));
            }
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    queue.submit(true, |_| {});
    queue.submit(false, |_| {});
    queue.submit(false, |_| {});
    wait_until(|| processed.load(Ordering::SeqCst) == 2).await;
}

#[tokio::test]
async fn shutdown_drains_pending_tasks() {
    let processed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&processed);
    let queue = WorkQueue::new(10, 1, move |_: u32| {
        let counter = Arc::clone(&counter);
        async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    for i in 0..4 {
        queue.submit(i, |_| panic!("must not drop"));
    }
    queue.shutdown().await;
    assert_eq!(
        processed.load(Ordering::SeqCst),
        4,
        "workers drain the channel before exiting"
    );
}

#[tokio::test]
async fn submit_after_shutdown_drops_immediately() {
    let queue = WorkQueue::new(4, 1, |_: u32| async { Ok(()) });
    queue.shutdown().await;

    let dropped = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&dropped);
    queue.submit(7, move |_| flag.store(true, Ordering::SeqCst));
    assert!(dropped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn overflow_never_blocks_and_supervisor_cleans_up_on_shutdown() {
    // One worker stuck on a gated task, a queue of capacity one already
    // holding a second task: the third submit must return immediately and
    // park in a supervisor, which drops the task when shutdown fires.
    let gate = Arc::new(Notify::new());
    let started = Arc::new(AtomicUsize::new(0));

    let gate_for_handler = Arc::clone(&gate);
    let started_for_handler = Arc::clone(&started);
    let queue = Arc::new(WorkQueue::new(1, 1, move |_: u32| {
        let gate = Arc::clone(&gate_for_handler);
        let started = Arc::clone(&started_for_handler);
        async move {
            started.fetch_add(1, Ordering::SeqCst);
            gate.notified().await;
            Ok(())
        }
    }));

    queue.submit(1, |_| panic!("task 1 must run"));
    wait_until(|| started.load(Ordering::SeqCst) == 1).await;
    // Fills the single queue slot.
    queue.submit(2, |_| panic!("task 2 must run"));

    // Queue full: this one parks in the overflow supervisor.
    let dropped = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&dropped);
    let before = std::time::Instant::now();
    queue.submit(3, move |task| {
        assert_eq!(task, 3);
        flag.store(true, Ordering::SeqCst);
    });
    assert!(
        before.elapsed() < Duration::from_millis(100),
        "submit must not block the foreground path"
    );

    // Shutdown: wake the supervisor first, then release the workers so
    // they can drain tasks 1 and 2.
    let queue_for_shutdown = Arc::clone(&queue);
    let shutdown = tokio::spawn(async move { queue_for_shutdown.shutdown().await });
    wait_until(|| dropped.load(Ordering::SeqCst)).await;

    gate.notify_waiters();
    gate.notify_one();
    wait_until(|| started.load(Ordering::SeqCst) == 2).await;
    gate.notify_waiters();
    gate.notify_one();
    shutdown.await.unwrap();

    assert!(dropped.load(Ordering::SeqCst), "supervised task was dropped");
    assert_eq!(
        started.load(Ordering::SeqCst),
        2,
        "only the two queued tasks ran"
    );
}
