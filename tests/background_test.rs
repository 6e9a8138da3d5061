use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use tagmill::background::{PeriodicTask, SingleRun};
use tagmill::types::{Error, Result};

struct Counter {
    runs: AtomicUsize,
}

#[async_trait]
impl SingleRun for Counter {
    async fn single_run(&self) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FailsImmediately {
    runs: AtomicUsize,
}

#[async_trait]
impl SingleRun for FailsImmediately {
    async fn single_run(&self) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Err(Error::General("infrastructure broke".to_string()))
    }
}

#[tokio::test]
async fn periodic_task_runs_repeatedly_until_stopped() {
    let work = Arc::new(Counter {
        runs: AtomicUsize::new(0),
    });

    let mut task = PeriodicTask::new("counter", Duration::from_millis(5), work.clone());

    task.start(true);

    tokio::time::sleep(Duration::from_millis(50)).await;

    task.stop().await;

    let runs = work.runs.load(Ordering::SeqCst);
    assert!(runs >= 2, "expected repeated runs, got {}", runs);

    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(work.runs.load(Ordering::SeqCst), runs);
}

#[tokio::test]
async fn failing_task_stops_and_stays_stopped() {
    let work = Arc::new(FailsImmediately {
        runs: AtomicUsize::new(0),
    });

    let mut task = PeriodicTask::new("failing", Duration::from_millis(5), work.clone());

    task.start(true);

    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(work.runs.load(Ordering::SeqCst), 1);

    task.stop().await;
}

#[tokio::test]
async fn request_run_triggers_without_waiting_for_the_delay() {
    let work = Arc::new(Counter {
        runs: AtomicUsize::new(0),
    });

    let mut task = PeriodicTask::new("on-demand", Duration::from_secs(3600), work.clone());

    task.start(false);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(work.runs.load(Ordering::SeqCst), 0);

    task.request_run();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(work.runs.load(Ordering::SeqCst), 1);

    task.stop().await;
}
