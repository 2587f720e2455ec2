//! Agent status projection.
//!
//! [`StatusPublisher`] is the only writer. Every update replaces the whole
//! snapshot behind a `watch` channel, so readers always hold a consistent
//! copy.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{checkpoint::Checkpoint, orchestrator::OutcomeStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Checking,
    Running,
    Sleeping,
    Stopped,
}

impl SchedulerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Checking => "checking",
            SchedulerState::Running => "running",
            SchedulerState::Sleeping => "sleeping",
            SchedulerState::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub state: SchedulerState,
    pub started_at: DateTime<Utc>,
    pub last_check: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub current_record_count: Option<u64>,
    pub previous_record_count: Option<u64>,
    pub update_available: bool,
    pub last_error: Option<String>,
    pub last_outcome: Option<OutcomeStatus>,
    /// Result of the most recent validation of the published file.
    pub data_valid: Option<bool>,
    pub file_size: Option<u64>,
    pub anomaly: Option<String>,
}

impl AgentStatus {
    pub fn new(started_at: DateTime<Utc>, checkpoint: Option<&Checkpoint>) -> Self {
        Self {
            state: SchedulerState::Idle,
            started_at,
            last_check: None,
            last_update: checkpoint.map(|c| c.fetched_at),
            current_record_count: checkpoint.map(|c| c.record_count),
            previous_record_count: None,
            update_available: false,
            last_error: None,
            last_outcome: None,
            data_valid: checkpoint.map(|_| true),
            file_size: checkpoint.map(|c| c.file_size),
            anomaly: checkpoint.and_then(|c| {
                c.count_regression.map(|r| {
                    format!(
                        "record count decreased from {} to {}",
                        r.previous, r.current
                    )
                })
            }),
        }
    }

    pub fn uptime(&self, now: DateTime<Utc>) -> TimeDelta {
        now.signed_duration_since(self.started_at)
    }

    pub fn data_age_hours(&self, now: DateTime<Utc>) -> Option<f64> {
        self.last_update.map(|updated| {
            now.signed_duration_since(updated).num_seconds() as f64 / 3600.0
        })
    }

    /// Flat metric view of this snapshot.
    pub fn metrics(&self, now: DateTime<Utc>) -> MetricsSnapshot {
        let mut metrics = MetricsSnapshot::new();
        let mut number = |key: &'static str, value: f64| {
            metrics.insert(key, MetricValue::Number(value));
        };

        number(
            "cms_data_records",
            self.current_record_count.unwrap_or(0) as f64,
        );
        if let Some(previous) = self.previous_record_count {
            number("cms_data_previous_records", previous as f64);
        }
        if let Some(age) = self.data_age_hours(now) {
            number("cms_data_age_hours", age);
        }
        number(
            "cms_data_valid",
            if self.data_valid.unwrap_or(false) { 1.0 } else { 0.0 },
        );
        if let Some(size) = self.file_size {
            number("cms_data_file_size_bytes", size as f64);
            number("cms_data_file_size_mb", size as f64 / (1024.0 * 1024.0));
        }
        number(
            "cms_agent_update_available",
            if self.update_available { 1.0 } else { 0.0 },
        );
        number(
            "cms_agent_uptime_seconds",
            self.uptime(now).num_seconds().max(0) as f64,
        );
        if let Some(checked) = self.last_check {
            number("cms_agent_last_check_timestamp", checked.timestamp() as f64);
        }
        if let Some(updated) = self.last_update {
            number(
                "cms_agent_last_update_timestamp",
                updated.timestamp() as f64,
            );
        }
        number(
            "cms_agent_error",
            if self.last_error.is_some() { 1.0 } else { 0.0 },
        );
        number(
            "cms_agent_anomaly",
            if self.anomaly.is_some() { 1.0 } else { 0.0 },
        );

        metrics.insert(
            "cms_agent_state",
            MetricValue::Text(self.state.as_str().to_string()),
        );
        if let Some(outcome) = self.last_outcome {
            metrics.insert(
                "cms_agent_last_outcome",
                MetricValue::Text(outcome.as_str().to_string()),
            );
        }
        if let Some(error) = &self.last_error {
            metrics
                .insert("cms_agent_last_error", MetricValue::Text(error.clone()));
        }
        metrics
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
}

pub type MetricsSnapshot = BTreeMap<&'static str, MetricValue>;

#[derive(Debug, Clone)]
pub struct StatusPublisher {
    tx: Arc<watch::Sender<Arc<AgentStatus>>>,
}

impl StatusPublisher {
    pub fn new(initial: AgentStatus) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx: Arc::new(tx) }
    }

    /// Applies `f` to a private copy and publishes it as the new snapshot.
    pub fn update(&self, f: impl FnOnce(&mut AgentStatus)) {
        self.tx.send_modify(|current| {
            let mut next = AgentStatus::clone(current);
            f(&mut next);
            *current = Arc::new(next);
        });
    }

    pub fn set_state(&self, state: SchedulerState) {
        self.update(|status| status.state = state);
    }

    pub fn snapshot(&self) -> Arc<AgentStatus> {
        Arc::clone(&self.tx.borrow())
    }

    pub fn subscribe(&self) -> StatusReader {
        StatusReader {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusReader {
    rx: watch::Receiver<Arc<AgentStatus>>,
}

impl StatusReader {
    pub fn snapshot(&self) -> Arc<AgentStatus> {
        Arc::clone(&self.rx.borrow())
    }

    /// Waits for the next published snapshot.
    pub async fn changed(&mut self) -> Option<Arc<AgentStatus>> {
        self.rx.changed().await.ok()?;
        Some(Arc::clone(&self.rx.borrow_and_update()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshots_held_by_readers_are_immutable() {
        let publisher = StatusPublisher::new(AgentStatus::new(Utc::now(), None));
        let before = publisher.snapshot();

        publisher.update(|status| {
            status.current_record_count = Some(12068);
            status.update_available = true;
        });

        assert_eq!(before.current_record_count, None);
        let after = publisher.snapshot();
        assert_eq!(after.current_record_count, Some(12068));
        assert!(after.update_available);
    }

    #[tokio::test]
    async fn readers_observe_published_updates() {
        let publisher = StatusPublisher::new(AgentStatus::new(Utc::now(), None));
        let mut reader = publisher.subscribe();

        publisher.set_state(SchedulerState::Checking);
        let seen = reader.changed().await.unwrap();
        assert_eq!(seen.state, SchedulerState::Checking);
    }

    #[test]
    fn initial_status_reflects_checkpoint() {
        let fetched_at = Utc::now() - TimeDelta::hours(2);
        let checkpoint = Checkpoint {
            record_count: 12068,
            fingerprint: "f".into(),
            fetched_at,
            file_size: 2 * 1024 * 1024,
            count_regression: None,
        };
        let status = AgentStatus::new(Utc::now(), Some(&checkpoint));
        let metrics = status.metrics(fetched_at + TimeDelta::hours(2));

        assert_eq!(
            metrics.get("cms_data_records"),
            Some(&MetricValue::Number(12068.0))
        );
        assert_eq!(
            metrics.get("cms_data_age_hours"),
            Some(&MetricValue::Number(2.0))
        );
        assert_eq!(
            metrics.get("cms_data_file_size_mb"),
            Some(&MetricValue::Number(2.0))
        );
        assert_eq!(
            metrics.get("cms_data_valid"),
            Some(&MetricValue::Number(1.0))
        );
        assert_eq!(
            metrics.get("cms_agent_state"),
            Some(&MetricValue::Text("idle".into()))
        );
    }
}
