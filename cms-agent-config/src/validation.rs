use std::time::Duration;

use cms_agent_core::{MAX_POLL_INTERVAL, notify::SinkConfig};
use thiserror::Error;
use url::Url;

use crate::models::{AgentConfig, Profile};

/// Poll intervals below this are allowed but flagged.
const SHORT_POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("poll interval must be greater than zero")]
    ZeroPollInterval,
    #[error("poll interval of {0} exceeds the maximum of {max}", max = humantime::format_duration(MAX_POLL_INTERVAL))]
    PollIntervalTooLong(String),
    #[error("max_retries must allow at least one attempt")]
    ZeroRetries,
    #[error("max_issue_ratio must lie within [0, 1], got {0}")]
    IssueRatioOutOfRange(f64),
    #[error("{field} is not a usable URL (`{value}`): {reason}")]
    InvalidUrl {
        field: String,
        value: String,
        reason: String,
    },
    #[error("provider dataset id must not be empty")]
    EmptyDatasetId,
    #[error("request timeout must be greater than zero")]
    ZeroRequestTimeout,
    #[error("dataset and checkpoint would share the file name `{0}`")]
    StoragePathCollision(String),
    #[error("{sink} sink is misconfigured: {reason}")]
    InvalidSink { sink: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(
        &mut self,
        message: S,
        hint: H,
    ) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigWarning> {
        self.items.iter()
    }
}

pub fn apply_guard_rails(
    config: &AgentConfig,
) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();

    if config.schedule.poll_interval.is_zero() {
        return Err(ConfigGuardRailError::ZeroPollInterval);
    }
    if config.schedule.poll_interval > MAX_POLL_INTERVAL {
        return Err(ConfigGuardRailError::PollIntervalTooLong(
            humantime::format_duration(config.schedule.poll_interval).to_string(),
        ));
    }
    if config.retry.max_retries == 0 {
        return Err(ConfigGuardRailError::ZeroRetries);
    }
    let ratio = config.validation.max_issue_ratio;
    if !(0.0..=1.0).contains(&ratio) {
        return Err(ConfigGuardRailError::IssueRatioOutOfRange(ratio));
    }
    if config.provider.dataset_id.trim().is_empty() {
        return Err(ConfigGuardRailError::EmptyDatasetId);
    }
    if config.provider.request_timeout_ms == 0 {
        return Err(ConfigGuardRailError::ZeroRequestTimeout);
    }

    if config.storage.dataset_file == config.storage.checkpoint_file {
        return Err(ConfigGuardRailError::StoragePathCollision(
            config.storage.dataset_file.clone(),
        ));
    }

    check_url("provider.base_url", &config.provider.base_url)?;
    for (index, sink) in config.notifications.sinks.iter().enumerate() {
        validate_sink(index, sink)?;
    }

    if config.schedule.poll_interval < SHORT_POLL_INTERVAL {
        warnings.push_with_hint(
            format!(
                "poll interval of {} is very short",
                humantime::format_duration(config.schedule.poll_interval)
            ),
            "Each check issues a count query against the provider; consider 5m or more",
        );
    }

    if config.notifications.sinks.is_empty() {
        warnings.push_with_hint(
            "No notification sinks configured; run outcomes are only logged",
            "Set SLACK_WEBHOOK_URL or NOTIFICATION_WEBHOOK_URL, or add [[notifications.sinks]] entries",
        );
    }

    if !config.schedule.auto_update && config.profile == Profile::Production {
        warnings.push_with_hint(
            "auto_update is disabled in the production profile",
            "Stale data will only be flagged; trigger updates through the control API or `cms-agent update`",
        );
    }

    if ratio == 0.0 {
        warnings.push(
            "max_issue_ratio is 0; any validation issue rejects the payload",
        );
    }

    if config.retry.backoff_base_ms > config.retry.backoff_max_ms {
        warnings.push(format!(
            "retry backoff base ({}ms) exceeds backoff max ({}ms); every delay will be the max",
            config.retry.backoff_base_ms, config.retry.backoff_max_ms
        ));
    }

    Ok(warnings)
}

fn validate_sink(
    index: usize,
    sink: &SinkConfig,
) -> Result<(), ConfigGuardRailError> {
    for url in sink.urls() {
        check_url(&format!("notifications.sinks[{index}]"), url)?;
    }
    if sink.timeout().is_zero() {
        return Err(ConfigGuardRailError::InvalidSink {
            sink: sink.kind(),
            reason: "timeout_secs must be greater than zero".into(),
        });
    }
    if let SinkConfig::Mail(mail) = sink {
        if mail.recipients.is_empty() {
            return Err(ConfigGuardRailError::InvalidSink {
                sink: "mail",
                reason: "at least one recipient is required".into(),
            });
        }
        if !mail.from.contains('@') {
            return Err(ConfigGuardRailError::InvalidSink {
                sink: "mail",
                reason: format!("`{}` is not a sender address", mail.from),
            });
        }
    }
    Ok(())
}

fn check_url(field: &str, value: &str) -> Result<(), ConfigGuardRailError> {
    let invalid = |reason: String| ConfigGuardRailError::InvalidUrl {
        field: field.to_string(),
        value: value.to_string(),
        reason,
    };
    let url = Url::parse(value).map_err(|err| invalid(err.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(invalid(format!("unsupported scheme `{other}`"))),
    }
}
