use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use cms_agent_core::{
    RetryPolicy, RunContention, ScheduleSettings, StoragePaths,
    ValidationRuleSet, fetch::DatastoreConfig, notify::SinkConfig,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub profile: Profile,
    pub server: ServerConfig,
    pub cors: CorsConfig,
    pub provider: DatastoreConfig,
    pub storage: StorageConfig,
    pub schedule: ScheduleConfig,
    pub retry: RetryPolicy,
    pub validation: ValidationRuleSet,
    pub notifications: NotificationsConfig,
    pub metadata: ConfigMetadata,
}

impl AgentConfig {
    /// Profile defaults with nothing loaded on top.
    pub fn for_profile(profile: Profile) -> Self {
        Self {
            profile,
            server: ServerConfig::default(),
            cors: CorsConfig::default(),
            provider: DatastoreConfig::default(),
            storage: StorageConfig {
                output_dir: profile.output_dir(),
                ..StorageConfig::default()
            },
            schedule: ScheduleConfig {
                poll_interval: profile.poll_interval(),
                auto_update: profile.auto_update(),
                ..ScheduleConfig::default()
            },
            retry: RetryPolicy::default(),
            validation: ValidationRuleSet::default(),
            notifications: NotificationsConfig::default(),
            metadata: ConfigMetadata::default(),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Deployment profile supplying baseline defaults.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    Development,
    #[default]
    Production,
    Testing,
}

impl Profile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Development => "development",
            Profile::Production => "production",
            Profile::Testing => "testing",
        }
    }

    pub fn poll_interval(&self) -> Duration {
        match self {
            Profile::Development => Duration::from_secs(60 * 60),
            Profile::Production => Duration::from_secs(6 * 60 * 60),
            Profile::Testing => Duration::from_secs(6 * 60),
        }
    }

    pub fn auto_update(&self) -> bool {
        !matches!(self, Profile::Testing)
    }

    pub fn output_dir(&self) -> PathBuf {
        PathBuf::from(match self {
            Profile::Development => "dev_data",
            Profile::Production => "cms_data",
            Profile::Testing => "test_data",
        })
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Profile {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Profile::Development),
            "production" | "prod" => Ok(Profile::Production),
            "testing" | "test" => Ok(Profile::Testing),
            other => Err(format!(
                "unknown profile `{other}` (expected development, production or testing)"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

impl CorsConfig {
    pub fn is_wildcard_included(&self) -> bool {
        self.allowed_origins
            .iter()
            .any(|origin| origin.trim() == "*")
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub output_dir: PathBuf,
    pub dataset_file: String,
    pub checkpoint_file: String,
}

impl StorageConfig {
    pub fn paths(&self) -> StoragePaths {
        StoragePaths::in_dir(
            &self.output_dir,
            &self.dataset_file,
            &self.checkpoint_file,
        )
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("cms_data"),
            dataset_file: "cms_full_dataset.json".to_string(),
            checkpoint_file: "checkpoint.json".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub poll_interval: Duration,
    pub auto_update: bool,
    /// How long shutdown waits for an in-flight run before aborting it.
    pub shutdown_grace: Duration,
    pub contention: RunContention,
}

impl ScheduleConfig {
    pub fn settings(&self) -> ScheduleSettings {
        ScheduleSettings {
            poll_interval: self.poll_interval,
            auto_update: self.auto_update,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            poll_interval: Profile::Production.poll_interval(),
            auto_update: true,
            shutdown_grace: Duration::from_secs(30),
            contention: RunContention::Reject,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NotificationsConfig {
    pub sinks: Vec<SinkConfig>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}
