//! Payload validation.
//!
//! Checks run in a fixed order: structure, record count, required fields,
//! rating values. A structural failure stops evaluation; everything after it
//! only accumulates issues, and the report is rejected once the share of
//! affected records crosses the configured ratio.

mod rules;

use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AgentError, PersistenceError};

pub use rules::{DEFAULT_PROVIDER_ID_FIELD, DEFAULT_RATING_FIELD, ValidationRuleSet};

/// Object keys under which a record array may be wrapped.
const WRAPPER_KEYS: [&str; 2] = ["data", "results"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationIssue {
    Structural {
        reason: String,
    },
    BelowMinimumCount {
        record_count: usize,
        minimum: usize,
    },
    MissingField {
        record: usize,
        field: String,
    },
    InvalidRating {
        record: usize,
        field: String,
        value: String,
    },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::Structural { reason } => f.write_str(reason),
            ValidationIssue::BelowMinimumCount {
                record_count,
                minimum,
            } => write!(
                f,
                "record count {record_count} is below the minimum of {minimum}"
            ),
            ValidationIssue::MissingField { record, field } => {
                write!(f, "record {record} is missing required field '{field}'")
            }
            ValidationIssue::InvalidRating {
                record,
                field,
                value,
            } => write!(f, "record {record} has invalid {field} value '{value}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub record_count: usize,
    /// Reported issues, capped at `max_reported_issues`.
    pub issues: Vec<ValidationIssue>,
    pub total_issues: usize,
    pub affected_records: usize,
    pub issue_ratio: f64,
    pub missing_fields: BTreeMap<String, usize>,
    pub invalid_ratings: usize,
    pub unique_keys: Option<usize>,
}

impl ValidationReport {
    fn structural(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            record_count: 0,
            issues: vec![ValidationIssue::Structural {
                reason: reason.into(),
            }],
            total_issues: 1,
            affected_records: 0,
            issue_ratio: 0.0,
            missing_fields: BTreeMap::new(),
            invalid_ratings: 0,
            unique_keys: None,
        }
    }

    pub fn is_structural_failure(&self) -> bool {
        matches!(self.issues.first(), Some(ValidationIssue::Structural { .. }))
    }

    /// Passed, but with issues under the threshold.
    pub fn is_advisory(&self) -> bool {
        self.valid && self.total_issues > 0
    }

    pub fn describe(&self) -> String {
        if let Some(ValidationIssue::Structural { reason }) = self.issues.first()
        {
            return reason.clone();
        }
        let mut text = format!(
            "{} of {} records ({:.1}%) have issues, {} issues total",
            self.affected_records,
            self.record_count,
            self.issue_ratio * 100.0,
            self.total_issues
        );
        if let Some(first) = self.issues.first() {
            text.push_str(&format!(" (first: {first})"));
        }
        text
    }

    /// The error a rejected report maps to, if any.
    pub fn to_error(&self) -> Option<AgentError> {
        if self.valid {
            None
        } else if self.is_structural_failure() {
            Some(AgentError::StructuralValidation(self.describe()))
        } else {
            Some(AgentError::PolicyValidation(self.describe()))
        }
    }
}

/// Validation of the currently published dataset file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileValidation {
    pub path: PathBuf,
    pub file_size: u64,
    #[serde(flatten)]
    pub report: ValidationReport,
}

impl FileValidation {
    pub fn file_size_mb(&self) -> f64 {
        self.file_size as f64 / (1024.0 * 1024.0)
    }
}

#[derive(Debug, Clone)]
pub struct ValidationEngine {
    rules: Arc<ValidationRuleSet>,
}

impl ValidationEngine {
    pub fn new(rules: ValidationRuleSet) -> Self {
        Self {
            rules: Arc::new(rules),
        }
    }

    pub fn rules(&self) -> &ValidationRuleSet {
        &self.rules
    }

    pub fn validate(&self, payload: &[u8]) -> ValidationReport {
        let document: Value = match serde_json::from_slice(payload) {
            Ok(document) => document,
            Err(err) => {
                return ValidationReport::structural(format!(
                    "payload is not valid JSON: {err}"
                ));
            }
        };
        let Some(records) = record_array(&document) else {
            return ValidationReport::structural(
                "payload is not a record array",
            );
        };
        let mut objects = Vec::with_capacity(records.len());
        for (index, record) in records.iter().enumerate() {
            match record.as_object() {
                Some(fields) => objects.push(fields),
                None => {
                    return ValidationReport::structural(format!(
                        "element {index} is not a record object"
                    ));
                }
            }
        }

        self.check_records(&objects)
    }

    fn check_records(&self, records: &[&Map<String, Value>]) -> ValidationReport {
        let rules = &*self.rules;
        let record_count = records.len();
        let mut log = IssueLog::new(rules.max_reported_issues);

        if record_count < rules.minimum_record_count {
            log.push(ValidationIssue::BelowMinimumCount {
                record_count,
                minimum: rules.minimum_record_count,
            });
        }

        let mut missing_fields = BTreeMap::new();
        let mut invalid_ratings = 0;
        let mut affected_records = 0;
        let mut keys = rules.unique_key_field.as_ref().map(|field| {
            (field.as_str(), HashSet::<String>::with_capacity(record_count))
        });

        for (index, fields) in records.iter().enumerate() {
            let mut flagged = false;

            for field in &rules.required_fields {
                if !fields.contains_key(field) {
                    *missing_fields.entry(field.clone()).or_insert(0) += 1;
                    log.push(ValidationIssue::MissingField {
                        record: index,
                        field: field.clone(),
                    });
                    flagged = true;
                }
            }

            for field in &rules.rating_fields {
                if let Some(value) = fields.get(field).and_then(scalar_text)
                    && !value.is_empty()
                    && !rules.allows_rating(&value)
                {
                    invalid_ratings += 1;
                    log.push(ValidationIssue::InvalidRating {
                        record: index,
                        field: field.clone(),
                        value,
                    });
                    flagged = true;
                }
            }

            if let Some((key_field, seen)) = keys.as_mut()
                && let Some(key) = fields.get(*key_field).and_then(scalar_text)
            {
                seen.insert(key);
            }

            if flagged {
                affected_records += 1;
            }
        }

        let record_ratio = if record_count == 0 {
            0.0
        } else {
            affected_records as f64 / record_count as f64
        };
        let shortfall = if record_count >= rules.minimum_record_count {
            0.0
        } else {
            (rules.minimum_record_count - record_count) as f64
                / rules.minimum_record_count as f64
        };
        let issue_ratio = record_ratio.max(shortfall);
        let exceeds = if rules.max_issue_ratio <= 0.0 {
            log.total > 0
        } else {
            issue_ratio > rules.max_issue_ratio
        };

        ValidationReport {
            valid: !exceeds,
            record_count,
            issues: log.entries,
            total_issues: log.total,
            affected_records,
            issue_ratio,
            missing_fields,
            invalid_ratings,
            unique_keys: keys.map(|(_, seen)| seen.len()),
        }
    }

    pub async fn validate_file(
        &self,
        path: &Path,
    ) -> Result<FileValidation, PersistenceError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| {
            PersistenceError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;
        let file_size = bytes.len() as u64;
        let engine = self.clone();
        let report =
            tokio::task::spawn_blocking(move || engine.validate(&bytes))
                .await
                .map_err(|err| PersistenceError::Task(err.to_string()))?;

        Ok(FileValidation {
            path: path.to_path_buf(),
            file_size,
            report,
        })
    }
}

fn record_array(document: &Value) -> Option<&Vec<Value>> {
    match document {
        Value::Array(records) => Some(records),
        Value::Object(map) => WRAPPER_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array)),
        _ => None,
    }
}

/// Text form of a scalar cell; `None` for null.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.trim().to_string()),
        other => Some(other.to_string()),
    }
}

struct IssueLog {
    entries: Vec<ValidationIssue>,
    total: usize,
    cap: usize,
}

impl IssueLog {
    fn new(cap: usize) -> Self {
        Self {
            entries: Vec::new(),
            total: 0,
            cap,
        }
    }

    fn push(&mut self, issue: ValidationIssue) {
        self.total += 1;
        if self.entries.len() < self.cap {
            self.entries.push(issue);
        }
    }
}
