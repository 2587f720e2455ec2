use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{NotificationSink, default_statuses, default_timeout_secs};
use crate::{
    error::NotifyError,
    orchestrator::{Outcome, OutcomeStatus},
};

/// Generic webhook receiving the outcome as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookSinkConfig {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_statuses")]
    pub statuses: Vec<OutcomeStatus>,
}

#[derive(Debug, Clone)]
pub struct WebhookSink {
    http: reqwest::Client,
    config: WebhookSinkConfig,
}

impl WebhookSinkConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            timeout_secs: default_timeout_secs(),
            statuses: default_statuses(),
        }
    }
}

impl WebhookSink {
    pub fn new(http: reqwest::Client, config: WebhookSinkConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, outcome: &Outcome) -> Result<(), NotifyError> {
        let mut request = self.http.post(&self.config.url).json(outcome);
        for (name, value) in &self.config.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}
