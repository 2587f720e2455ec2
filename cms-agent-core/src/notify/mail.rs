use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{NotificationSink, default_statuses, default_timeout_secs};
use crate::{
    error::NotifyError,
    orchestrator::{Outcome, OutcomeStatus},
};

/// Mail delivered through an HTTP mail relay (`POST` of a JSON message).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailSinkConfig {
    pub relay_url: String,
    pub from: String,
    pub recipients: Vec<String>,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_statuses")]
    pub statuses: Vec<OutcomeStatus>,
}

fn default_subject_prefix() -> String {
    "[cms-agent]".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct MailMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub text: String,
}

impl MailMessage {
    pub(crate) fn compose(config: &MailSinkConfig, outcome: &Outcome) -> Self {
        let subject = format!(
            "{} dataset {} {}",
            config.subject_prefix,
            outcome.dataset_id,
            outcome.status.as_str()
        );

        let mut text = outcome.headline();
        text.push_str(&format!("\n\nRun: {}", outcome.run_id));
        text.push_str(&format!("\nStarted: {}", outcome.started_at.to_rfc3339()));
        text.push_str(&format!("\nAttempts: {}", outcome.attempts));
        if let Some(error) = &outcome.error {
            text.push_str(&format!("\nError: {error}"));
        }
        for anomaly in &outcome.anomalies {
            text.push_str(&format!("\nAnomaly: {anomaly}"));
        }
        if let Some(validation) = &outcome.validation {
            text.push_str(&format!(
                "\nValidation: {} records, {} issues",
                validation.record_count, validation.total_issues
            ));
        }

        Self {
            from: config.from.clone(),
            to: config.recipients.clone(),
            subject,
            text,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MailSink {
    http: reqwest::Client,
    config: MailSinkConfig,
}

impl MailSink {
    pub fn new(http: reqwest::Client, config: MailSinkConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl NotificationSink for MailSink {
    fn name(&self) -> &str {
        "mail"
    }

    async fn deliver(&self, outcome: &Outcome) -> Result<(), NotifyError> {
        let message = MailMessage::compose(&self.config, outcome);
        let mut request = self.http.post(&self.config.relay_url).json(&message);
        if let Some(token) = &self.config.api_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}
