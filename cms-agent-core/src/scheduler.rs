//! Background loop driving the monitor and orchestrator on a timer.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{agent::Agent, status::SchedulerState};

/// How long an aborted run gets to unwind before its task is killed.
const ABORT_GRACE: Duration = Duration::from_secs(5);

/// Longest accepted poll interval.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Deadline used when `from + interval` is not representable.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// Runtime-mutable schedule. Changes wake the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleSettings {
    pub poll_interval: Duration,
    pub auto_update: bool,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(6 * 60 * 60),
            auto_update: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReport {
    /// The loop stopped within the grace period.
    Clean,
    /// An in-flight run had to be aborted.
    Unclean,
}

#[derive(Debug)]
pub struct SchedulerHandle {
    agent: Arc<Agent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Starts the background loop. The first check runs immediately.
pub fn spawn(agent: Arc<Agent>) -> SchedulerHandle {
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run_loop(Arc::clone(&agent), cancel.clone()));
    info!(
        dataset = agent.dataset_id(),
        poll_interval = %humantime::format_duration(agent.settings().poll_interval),
        "scheduler started"
    );
    SchedulerHandle {
        agent,
        cancel,
        task,
    }
}

impl SchedulerHandle {
    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the loop, letting an in-flight run finish within `grace`.
    /// Past that the run's abort token fires.
    pub async fn shutdown(mut self, grace: Duration) -> ShutdownReport {
        info!(grace = %humantime::format_duration(grace), "scheduler shutting down");
        self.cancel.cancel();

        let report = match tokio::time::timeout(grace, &mut self.task).await {
            Ok(Ok(())) => ShutdownReport::Clean,
            Ok(Err(err)) => {
                error!(
                    dataset = self.agent.dataset_id(),
                    error = %err,
                    "unclean shutdown: scheduler task did not exit normally"
                );
                ShutdownReport::Unclean
            }
            Err(_) => {
                error!(
                    dataset = self.agent.dataset_id(),
                    grace = %humantime::format_duration(grace),
                    "unclean shutdown: update still running after grace period, aborting"
                );
                self.agent.abort_token().cancel();
                if tokio::time::timeout(ABORT_GRACE, &mut self.task)
                    .await
                    .is_err()
                {
                    self.task.abort();
                }
                ShutdownReport::Unclean
            }
        };

        self.agent.status_publisher().set_state(SchedulerState::Stopped);
        info!(clean = report == ShutdownReport::Clean, "scheduler stopped");
        report
    }
}

async fn run_loop(agent: Arc<Agent>, cancel: CancellationToken) {
    let status = agent.status_publisher().clone();
    let mut settings = agent.watch_settings();

    loop {
        status.set_state(SchedulerState::Checking);
        let freshness = tokio::select! {
            _ = cancel.cancelled() => return,
            freshness = agent.check_for_updates() => freshness,
        };

        if freshness.is_stale() {
            if settings.borrow().auto_update {
                status.set_state(SchedulerState::Running);
                let outcome = agent.run_stale(freshness).await;
                debug!(
                    run_id = %outcome.run_id,
                    status = outcome.status.as_str(),
                    "scheduled run finished"
                );
            } else {
                info!(
                    dataset = agent.dataset_id(),
                    freshness = freshness.as_str(),
                    "update available; auto-update disabled"
                );
            }
        }

        status.set_state(SchedulerState::Sleeping);
        let slept_from = Instant::now();
        if !sleep_until_next_check(slept_from, &mut settings, &cancel).await {
            return;
        }
    }
}

/// Sleeps one poll interval measured from `from`, re-measuring whenever the
/// settings change. Returns `false` once cancelled.
async fn sleep_until_next_check(
    from: Instant,
    settings: &mut watch::Receiver<ScheduleSettings>,
    cancel: &CancellationToken,
) -> bool {
    let mut deadline =
        next_deadline(from, settings.borrow_and_update().poll_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = sleep_until(deadline) => return true,
            Ok(()) = settings.changed() => {
                let interval = settings.borrow_and_update().poll_interval;
                deadline = next_deadline(from, interval);
                debug!(
                    poll_interval = %humantime::format_duration(interval),
                    "next check rescheduled"
                );
            }
        }
    }
}

fn next_deadline(from: Instant, interval: Duration) -> Instant {
    from.checked_add(interval)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}
