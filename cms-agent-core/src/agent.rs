//! The one handle the server, the CLI and the scheduler talk to.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    checkpoint::{Checkpoint, CheckpointStore},
    error::{AgentError, PersistenceError},
    fetch::FetchClient,
    monitor::{ChangeMonitor, Freshness},
    notify::{NotificationDispatcher, SinkDelivery},
    orchestrator::{
        OrchestratorDeps, Outcome, RetryPolicy, RunContention,
        UpdateOrchestrator,
    },
    scheduler::{MAX_POLL_INTERVAL, ScheduleSettings},
    status::{
        AgentStatus, MetricsSnapshot, SchedulerState, StatusPublisher,
        StatusReader,
    },
    validation::{FileValidation, ValidationEngine, ValidationRuleSet},
};

/// Everything needed to assemble an [`Agent`].
pub struct AgentParts {
    pub dataset_id: String,
    pub client: Arc<dyn FetchClient>,
    pub store: Arc<CheckpointStore>,
    pub rules: ValidationRuleSet,
    pub notifier: NotificationDispatcher,
    pub retry: RetryPolicy,
    pub contention: RunContention,
    pub schedule: ScheduleSettings,
}

/// Runtime change to the schedule. Absent fields keep their value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettingsPatch {
    pub poll_interval: Option<Duration>,
    pub auto_update: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub live: bool,
    pub ready: bool,
    pub state: SchedulerState,
    pub last_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub record_count: Option<u64>,
    pub data_valid: Option<bool>,
}

pub struct Agent {
    dataset_id: String,
    monitor: Arc<ChangeMonitor>,
    orchestrator: Arc<UpdateOrchestrator>,
    engine: ValidationEngine,
    store: Arc<CheckpointStore>,
    status: StatusPublisher,
    settings: watch::Sender<ScheduleSettings>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("dataset_id", &self.dataset_id)
            .field("settings", &*self.settings.borrow())
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}

impl Agent {
    pub fn new(parts: AgentParts) -> Self {
        let AgentParts {
            dataset_id,
            client,
            store,
            rules,
            notifier,
            retry,
            contention,
            schedule,
        } = parts;

        let status = StatusPublisher::new(AgentStatus::new(
            Utc::now(),
            store.current().as_ref(),
        ));
        let monitor = Arc::new(ChangeMonitor::new(
            Arc::clone(&client),
            dataset_id.clone(),
            Arc::clone(&store),
            rules.maximum_age(),
            status.clone(),
        ));
        let engine = ValidationEngine::new(rules);
        let orchestrator = Arc::new(UpdateOrchestrator::new(
            OrchestratorDeps {
                dataset_id: dataset_id.clone(),
                client,
                monitor: Arc::clone(&monitor),
                engine: engine.clone(),
                store: Arc::clone(&store),
                status: status.clone(),
                notifier: Arc::new(notifier),
            },
            retry,
            contention,
        ));
        let (settings, _) = watch::channel(schedule);

        Self {
            dataset_id,
            monitor,
            orchestrator,
            engine,
            store,
            status,
            settings,
        }
    }

    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    pub async fn check_for_updates(&self) -> Freshness {
        self.monitor.check_for_updates().await
    }

    /// Runs one update cycle on its own task. Dropping the returned future
    /// does not cancel the run; its outcome is still published and
    /// dispatched.
    pub async fn run(&self, force: bool) -> Outcome {
        self.orchestrator.run_detached(force).await
    }

    pub(crate) async fn run_stale(&self, freshness: Freshness) -> Outcome {
        self.orchestrator.run_stale(freshness).await
    }

    /// Re-validates the published dataset file and records the result in
    /// status.
    pub async fn validate_published(
        &self,
    ) -> Result<FileValidation, PersistenceError> {
        let path = &self.store.paths().dataset;
        match self.engine.validate_file(path).await {
            Ok(validation) => {
                info!(
                    path = %path.display(),
                    valid = validation.report.valid,
                    record_count = validation.report.record_count,
                    file_size_mb = validation.file_size_mb(),
                    "published dataset validated"
                );
                self.status.update(|status| {
                    status.data_valid = Some(validation.report.valid);
                    status.file_size = Some(validation.file_size);
                });
                Ok(validation)
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "published dataset unreadable");
                self.status.update(|status| status.data_valid = Some(false));
                Err(err)
            }
        }
    }

    pub fn status(&self) -> Arc<AgentStatus> {
        self.status.snapshot()
    }

    pub fn subscribe(&self) -> StatusReader {
        self.status.subscribe()
    }

    pub(crate) fn status_publisher(&self) -> &StatusPublisher {
        &self.status
    }

    pub fn checkpoint(&self) -> Option<Checkpoint> {
        self.store.current()
    }

    pub fn metrics(&self, now: DateTime<Utc>) -> MetricsSnapshot {
        self.status.snapshot().metrics(now)
    }

    /// Live while the process answers. Ready while the scheduler runs and
    /// the last successful probe is no older than two poll intervals; before
    /// the first probe the start time stands in.
    pub fn health(&self, now: DateTime<Utc>) -> HealthReport {
        let status = self.status.snapshot();
        let interval = self.settings.borrow().poll_interval;
        let window = TimeDelta::from_std(interval.saturating_mul(2))
            .unwrap_or(TimeDelta::MAX);
        let reference = status.last_check.unwrap_or(status.started_at);
        let ready = status.state != SchedulerState::Stopped
            && now.signed_duration_since(reference) <= window;

        HealthReport {
            live: true,
            ready,
            state: status.state,
            last_check: status.last_check,
            last_error: status.last_error.clone(),
            record_count: status.current_record_count,
            data_valid: status.data_valid,
        }
    }

    pub fn settings(&self) -> ScheduleSettings {
        *self.settings.borrow()
    }

    pub(crate) fn watch_settings(&self) -> watch::Receiver<ScheduleSettings> {
        self.settings.subscribe()
    }

    /// Applies `patch` and wakes the scheduler so the next check is
    /// rescheduled.
    pub fn update_settings(
        &self,
        patch: SettingsPatch,
    ) -> Result<ScheduleSettings, AgentError> {
        if let Some(interval) = patch.poll_interval {
            if interval.is_zero() {
                return Err(AgentError::Configuration(
                    "poll interval must be greater than zero".into(),
                ));
            }
            if interval > MAX_POLL_INTERVAL {
                return Err(AgentError::Configuration(format!(
                    "poll interval must not exceed {}",
                    humantime::format_duration(MAX_POLL_INTERVAL)
                )));
            }
        }

        self.settings.send_modify(|settings| {
            if let Some(interval) = patch.poll_interval {
                settings.poll_interval = interval;
            }
            if let Some(auto_update) = patch.auto_update {
                settings.auto_update = auto_update;
            }
        });
        let updated = self.settings();
        info!(
            poll_interval = %humantime::format_duration(updated.poll_interval),
            auto_update = updated.auto_update,
            "schedule settings changed"
        );
        Ok(updated)
    }

    pub fn abort_token(&self) -> CancellationToken {
        self.orchestrator.abort_token()
    }

    /// Waits for the notifications of the latest run to be delivered.
    pub async fn flush_notifications(&self) -> Vec<SinkDelivery> {
        self.orchestrator.flush_notifications().await
    }
}
