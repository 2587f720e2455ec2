use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PROVIDER_ID_FIELD: &str = "cms_certification_number_ccn";
pub const DEFAULT_RATING_FIELD: &str = "hhcahps_survey_summary_star_rating";

/// Read-only rule set applied to every fetched payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationRuleSet {
    pub minimum_record_count: usize,
    pub required_fields: Vec<String>,
    pub allowed_rating_values: Vec<String>,
    /// Age after which a checkpoint counts as stale regardless of counts.
    pub maximum_age_hours: u64,
    /// Fields whose values must come from `allowed_rating_values`.
    pub rating_fields: Vec<String>,
    /// Fraction of records allowed to carry issues before the payload is
    /// rejected. Zero means any issue rejects.
    pub max_issue_ratio: f64,
    /// Cap on issue entries kept in a report; totals are always counted.
    pub max_reported_issues: usize,
    /// Field whose distinct values are reported as `unique_keys`.
    pub unique_key_field: Option<String>,
}

impl ValidationRuleSet {
    pub fn maximum_age(&self) -> TimeDelta {
        i64::try_from(self.maximum_age_hours)
            .ok()
            .and_then(TimeDelta::try_hours)
            .unwrap_or(TimeDelta::MAX)
    }

    pub fn allows_rating(&self, value: &str) -> bool {
        self.allowed_rating_values.iter().any(|allowed| allowed == value)
    }
}

impl Default for ValidationRuleSet {
    fn default() -> Self {
        Self {
            minimum_record_count: 10_000,
            required_fields: vec![
                DEFAULT_PROVIDER_ID_FIELD.to_string(),
                DEFAULT_RATING_FIELD.to_string(),
            ],
            allowed_rating_values: ["1", "2", "3", "4", "5", ""]
                .into_iter()
                .map(String::from)
                .collect(),
            maximum_age_hours: 48,
            rating_fields: vec![DEFAULT_RATING_FIELD.to_string()],
            max_issue_ratio: 0.10,
            max_reported_issues: 50,
            unique_key_field: Some(DEFAULT_PROVIDER_ID_FIELD.to_string()),
        }
    }
}
