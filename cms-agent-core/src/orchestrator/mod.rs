//! Fetch → validate → publish, one run at a time.

mod outcome;
mod retry;

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    checkpoint::{Checkpoint, CheckpointStore, CountRegression},
    error::AgentError,
    fetch::{DatasetQuery, FetchClient},
    fs::RunLock,
    monitor::{ChangeMonitor, Freshness},
    notify::{DispatchHandle, NotificationDispatcher, SinkDelivery},
    status::StatusPublisher,
    validation::{ValidationEngine, ValidationReport},
};

pub use outcome::{Anomaly, Outcome, OutcomeStatus, ValidationSummary};
pub use retry::RetryPolicy;

/// How often a waiting run re-tries a run lock held by another process.
const LOCK_POLL: Duration = Duration::from_millis(250);

/// What a run does when another run already holds the lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunContention {
    /// Return [`OutcomeStatus::Busy`] immediately.
    #[default]
    Reject,
    /// Queue behind the in-flight run.
    Wait,
}

pub struct OrchestratorDeps {
    pub dataset_id: String,
    pub client: Arc<dyn FetchClient>,
    pub monitor: Arc<ChangeMonitor>,
    pub engine: ValidationEngine,
    pub store: Arc<CheckpointStore>,
    pub status: StatusPublisher,
    pub notifier: Arc<NotificationDispatcher>,
}

impl fmt::Debug for OrchestratorDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorDeps")
            .field("dataset_id", &self.dataset_id)
            .finish_non_exhaustive()
    }
}

pub struct UpdateOrchestrator {
    dataset_id: String,
    query: DatasetQuery,
    client: Arc<dyn FetchClient>,
    monitor: Arc<ChangeMonitor>,
    engine: ValidationEngine,
    store: Arc<CheckpointStore>,
    status: StatusPublisher,
    notifier: Arc<NotificationDispatcher>,
    retry: RetryPolicy,
    contention: RunContention,
    run_lock: Mutex<()>,
    abort: CancellationToken,
    last_dispatch: parking_lot::Mutex<Option<DispatchHandle>>,
}

impl fmt::Debug for UpdateOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateOrchestrator")
            .field("dataset_id", &self.dataset_id)
            .field("retry", &self.retry)
            .field("contention", &self.contention)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

struct Published {
    checkpoint: Checkpoint,
    report: ValidationReport,
}

struct AttemptFailure {
    error: AgentError,
    report: Option<ValidationReport>,
}

impl From<AgentError> for AttemptFailure {
    fn from(error: AgentError) -> Self {
        Self {
            error,
            report: None,
        }
    }
}

struct RunContext {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    started: Instant,
    forced: bool,
    freshness: Option<Freshness>,
}

impl RunContext {
    fn new(forced: bool, freshness: Option<Freshness>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            started: Instant::now(),
            forced,
            freshness,
        }
    }

    fn outcome(
        self,
        dataset_id: &str,
        status: OutcomeStatus,
        before: Option<Checkpoint>,
    ) -> Outcome {
        Outcome {
            run_id: self.run_id,
            dataset_id: dataset_id.to_string(),
            status,
            forced: self.forced,
            started_at: self.started_at,
            duration_ms: self.started.elapsed().as_millis() as u64,
            attempts: 0,
            error: None,
            freshness: self.freshness,
            checkpoint_before: before,
            checkpoint_after: None,
            validation: None,
            anomalies: Vec::new(),
        }
    }
}

impl UpdateOrchestrator {
    pub fn new(
        deps: OrchestratorDeps,
        retry: RetryPolicy,
        contention: RunContention,
    ) -> Self {
        Self {
            query: DatasetQuery::all(deps.dataset_id.clone()),
            dataset_id: deps.dataset_id,
            client: deps.client,
            monitor: deps.monitor,
            engine: deps.engine,
            store: deps.store,
            status: deps.status,
            notifier: deps.notifier,
            retry,
            contention,
            run_lock: Mutex::new(()),
            abort: CancellationToken::new(),
            last_dispatch: parking_lot::Mutex::new(None),
        }
    }

    /// Fires to abandon an in-flight run during forced shutdown.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    /// Runs one update cycle. Unless `force` is set the monitor is consulted
    /// first and a fresh or unknown dataset short-circuits to `up_to_date`.
    pub async fn run(&self, force: bool) -> Outcome {
        if force {
            return self.execute(true, None).await;
        }

        let freshness = self.monitor.check_for_updates().await;
        if freshness.is_stale() {
            self.execute(false, Some(freshness)).await
        } else {
            let outcome = RunContext::new(false, Some(freshness)).outcome(
                &self.dataset_id,
                OutcomeStatus::UpToDate,
                self.store.current(),
            );
            self.finish(outcome)
        }
    }

    /// Like [`Self::run`], but on its own task: dropping the returned future
    /// leaves the run to finish, publish and dispatch its outcome.
    pub async fn run_detached(self: &Arc<Self>, force: bool) -> Outcome {
        let orchestrator = Arc::clone(self);
        match tokio::spawn(async move { orchestrator.run(force).await }).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let mut outcome = RunContext::new(force, None).outcome(
                    &self.dataset_id,
                    OutcomeStatus::Failed,
                    self.store.current(),
                );
                outcome.error = Some(format!("run task failed: {err}"));
                self.finish(outcome)
            }
        }
    }

    /// Runs the update for a dataset the caller already found stale.
    pub async fn run_stale(&self, freshness: Freshness) -> Outcome {
        self.execute(false, Some(freshness)).await
    }

    async fn execute(
        &self,
        forced: bool,
        freshness: Option<Freshness>,
    ) -> Outcome {
        let ctx = RunContext::new(forced, freshness);
        let guard = match self.contention {
            RunContention::Reject => match self.run_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    info!(
                        dataset = %self.dataset_id,
                        run_id = %ctx.run_id,
                        "update already in progress; rejecting run"
                    );
                    let outcome = ctx.outcome(
                        &self.dataset_id,
                        OutcomeStatus::Busy,
                        self.store.current(),
                    );
                    return self.finish(outcome);
                }
            },
            RunContention::Wait => self.run_lock.lock().await,
        };
        let run_file = match self.acquire_run_file().await {
            Ok(lock) => lock,
            Err(()) => {
                info!(
                    dataset = %self.dataset_id,
                    run_id = %ctx.run_id,
                    "update already in progress in another process; rejecting run"
                );
                let outcome = ctx.outcome(
                    &self.dataset_id,
                    OutcomeStatus::Busy,
                    self.store.current(),
                );
                return self.finish(outcome);
            }
        };

        let run_id = ctx.run_id;
        let before = self.store.refresh().await;
        let max_attempts = self.retry.attempts();
        let mut attempts = 0;

        let result = loop {
            attempts += 1;
            match self.attempt(before.as_ref()).await {
                Ok(published) => break Ok(published),
                Err(failure)
                    if failure.error.is_retryable()
                        && attempts < max_attempts =>
                {
                    let delay = self.retry.delay_for(attempts - 1);
                    warn!(
                        dataset = %self.dataset_id,
                        %run_id,
                        attempt = attempts,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure.error,
                        "update attempt failed; backing off"
                    );
                    tokio::select! {
                        _ = self.abort.cancelled() => {
                            break Err(AttemptFailure::from(AgentError::Abandoned(
                                "shutdown during retry backoff".into(),
                            )));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(failure) => break Err(failure),
            }
        };
        drop(run_file);
        drop(guard);

        let mut outcome =
            ctx.outcome(&self.dataset_id, OutcomeStatus::Failed, before);
        outcome.attempts = attempts;
        match result {
            Ok(Published { checkpoint, report }) => {
                outcome.status = OutcomeStatus::Updated;
                outcome.validation = Some((&report).into());
                if let Some(regression) = checkpoint.count_regression {
                    outcome.anomalies.push(Anomaly::CountDecreased {
                        previous: regression.previous,
                        current: regression.current,
                    });
                }
                outcome.checkpoint_after = Some(checkpoint);
            }
            Err(AttemptFailure { error, report }) => {
                if error.is_validation() {
                    outcome.status = OutcomeStatus::Invalid;
                }
                outcome.validation = report.as_ref().map(Into::into);
                outcome.error = Some(error.to_string());
            }
        }

        self.finish(outcome)
    }

    /// Takes the lock file shared with other processes using the same
    /// output directory. `Err` means the run should report busy. An
    /// unusable lock file is logged and the run continues unguarded.
    async fn acquire_run_file(&self) -> Result<Option<RunLock>, ()> {
        let path = self.store.lock_path();
        loop {
            match RunLock::try_acquire(&path) {
                Ok(Some(lock)) => return Ok(Some(lock)),
                Ok(None) if self.contention == RunContention::Reject => {
                    return Err(());
                }
                Ok(None) => {
                    debug!(path = %path.display(), "waiting for run lock held by another process");
                    tokio::select! {
                        _ = self.abort.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(LOCK_POLL) => {}
                    }
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "run lock file unavailable; continuing without cross-process exclusion"
                    );
                    return Ok(None);
                }
            }
        }
    }

    async fn attempt(
        &self,
        before: Option<&Checkpoint>,
    ) -> Result<Published, AttemptFailure> {
        let payload = tokio::select! {
            _ = self.abort.cancelled() => {
                return Err(AgentError::Abandoned("shutdown during fetch".into()).into());
            }
            fetched = self.client.fetch_all(&self.query) => {
                fetched.map_err(AgentError::from_fetch)?
            }
        };

        let report = self.engine.validate(payload.as_bytes());
        if let Some(error) = report.to_error() {
            return Err(AttemptFailure {
                error,
                report: Some(report),
            });
        }
        if report.is_advisory() {
            info!(
                dataset = %self.dataset_id,
                issues = report.total_issues,
                affected = report.affected_records,
                "payload passed validation with advisory issues"
            );
        }

        if self.abort.is_cancelled() {
            return Err(AgentError::Abandoned("shutdown before publish".into()).into());
        }

        let record_count = report.record_count as u64;
        let count_regression = before
            .filter(|previous| record_count < previous.record_count)
            .map(|previous| CountRegression {
                previous: previous.record_count,
                current: record_count,
            });
        if let Some(regression) = count_regression {
            warn!(
                dataset = %self.dataset_id,
                previous = regression.previous,
                current = regression.current,
                "publishing dataset with fewer records than the previous checkpoint"
            );
        }

        let checkpoint = Checkpoint {
            record_count,
            fingerprint: payload.fingerprint(),
            fetched_at: Utc::now(),
            file_size: payload.len() as u64,
            count_regression,
        };
        self.store
            .publish(payload, checkpoint.clone())
            .await
            .map_err(AgentError::from)?;

        Ok(Published { checkpoint, report })
    }

    fn finish(&self, outcome: Outcome) -> Outcome {
        self.apply_status(&outcome);

        match outcome.status {
            OutcomeStatus::Updated => info!(
                dataset = %outcome.dataset_id,
                run_id = %outcome.run_id,
                record_count = outcome
                    .checkpoint_after
                    .as_ref()
                    .map(|c| c.record_count),
                attempts = outcome.attempts,
                duration_ms = outcome.duration_ms,
                "dataset updated"
            ),
            OutcomeStatus::UpToDate => debug!(
                dataset = %outcome.dataset_id,
                run_id = %outcome.run_id,
                "dataset up to date"
            ),
            OutcomeStatus::Busy => debug!(
                dataset = %outcome.dataset_id,
                run_id = %outcome.run_id,
                "run rejected as busy"
            ),
            OutcomeStatus::Failed | OutcomeStatus::Invalid => error!(
                dataset = %outcome.dataset_id,
                run_id = %outcome.run_id,
                status = outcome.status.as_str(),
                attempts = outcome.attempts,
                error = outcome.error.as_deref().unwrap_or_default(),
                "dataset update did not complete"
            ),
        }

        let deliveries = self.notifier.dispatch(&outcome);
        if !deliveries.is_empty() {
            debug!(
                run_id = %outcome.run_id,
                sinks = deliveries.len(),
                "outcome dispatched"
            );
            *self.last_dispatch.lock() = Some(deliveries);
        }
        outcome
    }

    /// Waits for the deliveries of the most recent dispatch. Earlier ones
    /// are left detached.
    pub async fn flush_notifications(&self) -> Vec<SinkDelivery> {
        let pending = self.last_dispatch.lock().take();
        match pending {
            Some(handle) => handle.join().await,
            None => Vec::new(),
        }
    }

    fn apply_status(&self, outcome: &Outcome) {
        self.status.update(|status| {
            status.last_outcome = Some(outcome.status);
            match outcome.status {
                OutcomeStatus::Updated => {
                    if let Some(after) = &outcome.checkpoint_after {
                        status.last_update = Some(after.fetched_at);
                        status.previous_record_count = outcome
                            .checkpoint_before
                            .as_ref()
                            .map(|c| c.record_count);
                        status.current_record_count = Some(after.record_count);
                        status.file_size = Some(after.file_size);
                    }
                    status.update_available = false;
                    status.last_error = None;
                    status.data_valid = Some(true);
                    status.anomaly =
                        outcome.anomalies.first().map(ToString::to_string);
                }
                OutcomeStatus::Failed | OutcomeStatus::Invalid => {
                    status.last_error = outcome.error.clone();
                }
                OutcomeStatus::UpToDate => {
                    // An unknown probe leaves its error visible.
                    if !matches!(outcome.freshness, Some(Freshness::Unknown { .. })) {
                        status.last_error = None;
                    }
                }
                OutcomeStatus::Busy => {}
            }
        });
    }
}
