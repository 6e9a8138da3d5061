use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::types::Result;

/// One unit of periodic work. Per-item failures must be handled inside
/// `single_run`; an error escaping it is treated as an infrastructure
/// problem and stops the task's loop permanently (fail-stop).
#[async_trait]
pub trait SingleRun: Send + Sync {
    async fn single_run(&self) -> Result<()>;
}

/// Cooperative periodic task: a scheduler sub-task sleeps a fixed delay and
/// signals "run requested"; a runner sub-task waits on the signal and
/// executes one `single_run` at a time. Stopping wakes the runner and waits
/// for any in-flight run to finish, so a unit of work always completes or
/// fails as a whole.
pub struct PeriodicTask {
    name: String,
    delay_between_runs: Duration,
    work: Arc<dyn SingleRun>,
    run_requested: Arc<Notify>,
    stop_sender: watch::Sender<bool>,
    runner: Option<JoinHandle<()>>,
    scheduler: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn new(name: impl Into<String>, delay_between_runs: Duration, work: Arc<dyn SingleRun>) -> Self {
        let (stop_sender, _) = watch::channel(false);

        Self {
            name: name.into(),
            delay_between_runs,
            work,
            run_requested: Arc::new(Notify::new()),
            stop_sender,
            runner: None,
            scheduler: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn running(&self) -> bool {
        self.runner.is_some()
    }

    pub fn request_run(&self) {
        self.run_requested.notify_one();
    }

    pub fn start(&mut self, from_start: bool) {
        assert!(self.runner.is_none(), "task started twice: {}", self.name);

        info!(task = %self.name, "start_background_task");

        if from_start {
            self.run_requested.notify_one();
        }

        self.runner = Some(tokio::spawn(runner_loop(
            self.name.clone(),
            self.work.clone(),
            self.run_requested.clone(),
            self.stop_sender.subscribe(),
        )));

        self.scheduler = Some(tokio::spawn(scheduler_loop(
            self.delay_between_runs,
            self.run_requested.clone(),
            self.stop_sender.subscribe(),
        )));
    }

    pub fn request_stop(&self) {
        let _ = self.stop_sender.send(true);
        self.run_requested.notify_one();
    }

    pub async fn stop(&mut self) {
        self.request_stop();

        if let Some(runner) = self.runner.take() {
            let _ = runner.await;
        }

        if let Some(scheduler) = self.scheduler.take() {
            let _ = scheduler.await;
        }

        info!(task = %self.name, "background_task_stopped");
    }
}

async fn scheduler_loop(delay: Duration, run_requested: Arc<Notify>, mut stop: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                run_requested.notify_one();
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    return;
                }
            }
        }
    }
}

async fn runner_loop(
    name: String,
    work: Arc<dyn SingleRun>,
    run_requested: Arc<Notify>,
    stop: watch::Receiver<bool>,
) {
    loop {
        run_requested.notified().await;

        if *stop.borrow() {
            info!(task = %name, "stop_background_task");
            return;
        }

        debug!(task = %name, "running_background_task");

        if let Err(error) = work.single_run().await {
            // An uncaught failure here means the infrastructure is broken,
            // not a single item. The loop stops and stays stopped.
            error!(task = %name, %error, "error_in_background_task");
            return;
        }

        if *stop.borrow() {
            info!(task = %name, "stop_background_task");
            return;
        }
    }
}
