use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    checkpoint::Checkpoint, monitor::Freshness, validation::ValidationReport,
};

/// Number of issue descriptions carried on an outcome.
const SAMPLE_ISSUES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    UpToDate,
    Updated,
    Failed,
    Invalid,
    Busy,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::UpToDate => "up_to_date",
            OutcomeStatus::Updated => "updated",
            OutcomeStatus::Failed => "failed",
            OutcomeStatus::Invalid => "invalid",
            OutcomeStatus::Busy => "busy",
        }
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    CountDecreased { previous: u64, current: u64 },
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anomaly::CountDecreased { previous, current } => write!(
                f,
                "record count decreased from {previous} to {current}"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationSummary {
    pub valid: bool,
    pub record_count: usize,
    pub total_issues: usize,
    pub affected_records: usize,
    pub issue_ratio: f64,
    pub sample_issues: Vec<String>,
}

impl From<&ValidationReport> for ValidationSummary {
    fn from(report: &ValidationReport) -> Self {
        Self {
            valid: report.valid,
            record_count: report.record_count,
            total_issues: report.total_issues,
            affected_records: report.affected_records,
            issue_ratio: report.issue_ratio,
            sample_issues: report
                .issues
                .iter()
                .take(SAMPLE_ISSUES)
                .map(ToString::to_string)
                .collect(),
        }
    }
}

/// Result of one orchestrator run. Only lives long enough to be logged,
/// reflected into status and dispatched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome {
    pub run_id: Uuid,
    pub dataset_id: String,
    pub status: OutcomeStatus,
    pub forced: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub attempts: u32,
    pub error: Option<String>,
    pub freshness: Option<Freshness>,
    pub checkpoint_before: Option<Checkpoint>,
    pub checkpoint_after: Option<Checkpoint>,
    pub validation: Option<ValidationSummary>,
    pub anomalies: Vec<Anomaly>,
}

impl Outcome {
    /// One-line human summary used by chat and mail sinks.
    pub fn headline(&self) -> String {
        let id = &self.dataset_id;
        match self.status {
            OutcomeStatus::UpToDate => {
                let count = self
                    .checkpoint_before
                    .as_ref()
                    .map(|c| c.record_count)
                    .unwrap_or_default();
                format!("dataset {id} is up to date ({count} records)")
            }
            OutcomeStatus::Updated => {
                let after = self
                    .checkpoint_after
                    .as_ref()
                    .map(|c| c.record_count)
                    .unwrap_or_default();
                match &self.checkpoint_before {
                    Some(before) => format!(
                        "dataset {id} updated: {} -> {after} records",
                        before.record_count
                    ),
                    None => {
                        format!("dataset {id} published with {after} records")
                    }
                }
            }
            OutcomeStatus::Failed => format!(
                "dataset {id} update failed after {} attempt(s)",
                self.attempts
            ),
            OutcomeStatus::Invalid => {
                format!("dataset {id} update rejected by validation")
            }
            OutcomeStatus::Busy => {
                format!("dataset {id} update skipped: another run is in progress")
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn test_fixture(status: OutcomeStatus) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            dataset_id: "ds-test".into(),
            status,
            forced: false,
            started_at: Utc::now(),
            duration_ms: 12,
            attempts: 1,
            error: None,
            freshness: None,
            checkpoint_before: None,
            checkpoint_after: None,
            validation: None,
            anomalies: Vec::new(),
        }
    }
}
