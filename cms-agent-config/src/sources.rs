use std::{path::PathBuf, str::FromStr, time::Duration};

use cms_agent_core::{
    RunContention, ValidationRuleSet, fetch::ProviderAuth, notify::SinkConfig,
};
use serde::{Deserialize, Serialize};

use crate::{
    loader::ConfigLoadError,
    models::Profile,
    util::{parse_bool, parse_csv, parse_duration, parse_hours},
};

/// Raw configuration as defined in a TOML file. Durations are humantime
/// strings (`"6h"`, `"30s"`).
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct FileConfig {
    pub profile: Option<Profile>,
    #[serde(default)]
    pub server: FileServerConfig,
    #[serde(default)]
    pub cors: FileCorsConfig,
    #[serde(default)]
    pub provider: FileProviderConfig,
    #[serde(default)]
    pub storage: FileStorageConfig,
    #[serde(default)]
    pub schedule: FileScheduleConfig,
    #[serde(default)]
    pub retry: FileRetryConfig,
    pub validation: Option<ValidationRuleSet>,
    #[serde(default)]
    pub notifications: FileNotificationsConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileCorsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_origins: Option<Vec<String>>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileProviderConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<ProviderAuth>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileStorageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_file: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileScheduleConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_update: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_grace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contention: Option<RunContention>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileRetryConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_base: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_max: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileNotificationsConfig {
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
}

/// Environment-derived configuration values.
///
/// `CMS_AGENT_*` names take precedence over the legacy names kept for older
/// deployments (`CMS_OUTPUT_DIR`, `CMS_CHECK_INTERVAL`, `CMS_AUTO_UPDATE`).
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub profile: Option<Profile>,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub cors_allowed_origins: Option<Vec<String>>,
    pub base_url: Option<String>,
    pub dataset_id: Option<String>,
    pub request_timeout: Option<Duration>,
    pub api_token: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub poll_interval: Option<Duration>,
    pub auto_update: Option<bool>,
    pub shutdown_grace: Option<Duration>,
    pub contention: Option<RunContention>,
    pub max_retries: Option<u32>,
    pub minimum_record_count: Option<usize>,
    pub max_issue_ratio: Option<f64>,
    pub chat_webhook_url: Option<String>,
    pub webhook_url: Option<String>,
}

impl EnvConfig {
    pub fn gather() -> Result<Self, ConfigLoadError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the env layer from any name → value lookup. Blank values
    /// count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigLoadError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvLookup(lookup);

        Ok(Self {
            config_path: env.get("CMS_AGENT_CONFIG").map(PathBuf::from),
            profile: env.parse("CMS_AGENT_PROFILE", Profile::from_str)?,
            server_host: env.get("CMS_AGENT_HOST"),
            server_port: env.parse("CMS_AGENT_PORT", number)?,
            cors_allowed_origins: env
                .get("CMS_AGENT_CORS_ORIGINS")
                .map(|raw| parse_csv(&raw)),
            base_url: env.get("CMS_AGENT_BASE_URL"),
            dataset_id: env.get("CMS_AGENT_DATASET_ID"),
            request_timeout: env
                .parse("CMS_AGENT_REQUEST_TIMEOUT", parse_duration)?,
            api_token: env.get("CMS_AGENT_API_TOKEN"),
            output_dir: env
                .get("CMS_AGENT_OUTPUT_DIR")
                .or_else(|| env.get("CMS_OUTPUT_DIR"))
                .map(PathBuf::from),
            poll_interval: match env
                .parse("CMS_AGENT_POLL_INTERVAL", parse_duration)?
            {
                Some(interval) => Some(interval),
                None => env.parse("CMS_CHECK_INTERVAL", parse_hours)?,
            },
            auto_update: match env.parse("CMS_AGENT_AUTO_UPDATE", boolean)? {
                Some(flag) => Some(flag),
                None => env.parse("CMS_AUTO_UPDATE", boolean)?,
            },
            shutdown_grace: env
                .parse("CMS_AGENT_SHUTDOWN_GRACE", parse_duration)?,
            contention: env.parse("CMS_AGENT_CONTENTION", contention)?,
            max_retries: env.parse("CMS_AGENT_MAX_RETRIES", number)?,
            minimum_record_count: env.parse("CMS_AGENT_MIN_RECORDS", number)?,
            max_issue_ratio: env.parse("CMS_AGENT_MAX_ISSUE_RATIO", number)?,
            chat_webhook_url: env
                .get("CMS_AGENT_CHAT_WEBHOOK_URL")
                .or_else(|| env.get("SLACK_WEBHOOK_URL")),
            webhook_url: env
                .get("CMS_AGENT_WEBHOOK_URL")
                .or_else(|| env.get("NOTIFICATION_WEBHOOK_URL")),
        })
    }
}

struct EnvLookup<F>(F);

impl<F> EnvLookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|value| !value.trim().is_empty())
    }

    fn parse<T>(
        &self,
        name: &'static str,
        parse: impl FnOnce(&str) -> Result<T, String>,
    ) -> Result<Option<T>, ConfigLoadError> {
        self.get(name)
            .map(|raw| {
                parse(raw.trim()).map_err(|reason| ConfigLoadError::InvalidEnv {
                    name,
                    value: raw.clone(),
                    reason,
                })
            })
            .transpose()
    }
}

fn number<T>(raw: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|err| err.to_string())
}

fn contention(raw: &str) -> Result<RunContention, String> {
    match raw.to_ascii_lowercase().as_str() {
        "reject" => Ok(RunContention::Reject),
        "wait" => Ok(RunContention::Wait),
        other => Err(format!(
            "unknown contention mode `{other}` (expected reject or wait)"
        )),
    }
}

fn boolean(raw: &str) -> Result<bool, String> {
    parse_bool(raw).ok_or_else(|| format!("`{raw}` is not a boolean"))
}
