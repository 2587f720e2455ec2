use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{NotificationSink, default_statuses, default_timeout_secs};
use crate::{
    error::NotifyError,
    orchestrator::{Outcome, OutcomeStatus},
};

/// Slack-compatible incoming webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSinkConfig {
    pub webhook_url: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_statuses")]
    pub statuses: Vec<OutcomeStatus>,
}

#[derive(Debug, Clone)]
pub struct ChatSink {
    http: reqwest::Client,
    config: ChatSinkConfig,
}

impl ChatSinkConfig {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            channel: None,
            timeout_secs: default_timeout_secs(),
            statuses: default_statuses(),
        }
    }
}

impl ChatSink {
    pub fn new(http: reqwest::Client, config: ChatSinkConfig) -> Self {
        Self { http, config }
    }
}

pub(crate) fn chat_message(outcome: &Outcome, channel: Option<&str>) -> serde_json::Value {
    let mut body = json!({ "text": outcome.headline() });
    if let Some(channel) = channel {
        body["channel"] = json!(channel);
    }
    if let Some(error) = &outcome.error {
        body["attachments"] = json!([{ "color": "danger", "text": error }]);
    } else if let Some(anomaly) = outcome.anomalies.first() {
        body["attachments"] =
            json!([{ "color": "warning", "text": anomaly.to_string() }]);
    }
    body
}

#[async_trait]
impl NotificationSink for ChatSink {
    fn name(&self) -> &str {
        "chat"
    }

    async fn deliver(&self, outcome: &Outcome) -> Result<(), NotifyError> {
        let body = chat_message(outcome, self.config.channel.as_deref());
        let response = self
            .http
            .post(&self.config.webhook_url)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}
