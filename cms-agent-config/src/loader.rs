use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use cms_agent_core::{
    RetryPolicy,
    fetch::{DatastoreConfig, ProviderAuth},
    notify::{ChatSinkConfig, SinkConfig, WebhookSinkConfig},
};
use once_cell::sync::Lazy;
use thiserror::Error;

use crate::{
    models::{
        AgentConfig, ConfigMetadata, CorsConfig, NotificationsConfig,
        ScheduleConfig, ServerConfig, StorageConfig,
    },
    sources::{EnvConfig, FileConfig, FileProviderConfig, FileRetryConfig},
    util::parse_duration,
    validation::{self, ConfigGuardRailError, ConfigWarnings},
};

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![
        PathBuf::from("cms-agent.toml"),
        PathBuf::from("config/cms-agent.toml"),
    ]
});

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Loads `.env` into the process environment, then composes
    /// environment, file and profile defaults.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(
                |err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                },
            )?,
            None => {
                dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                })?
            }
        };

        let mut load = self.load_with_env(EnvConfig::gather()?)?;
        load.config.metadata.env_file_loaded = env_file_loaded;
        Ok(load)
    }

    /// Composes an already gathered environment layer with the file and
    /// defaults. Never touches the process environment.
    pub fn load_with_env(
        &self,
        env: EnvConfig,
    ) -> Result<ConfigLoad, ConfigLoadError> {
        let (file_config, config_path) = self.load_file_config(&env)?;
        let (config, warnings) =
            self.compose_config(file_config, env, config_path)?;
        Ok(ConfigLoad { config, warnings })
    }

    fn load_file_config(
        &self,
        env_config: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let mut source = ConfigPathSource::default();

        if let Some(explicit) = &self.options.config_path {
            source.explicit = Some(explicit.clone());
        } else if let Some(from_env) = &env_config.config_path {
            source.env = Some(from_env.clone());
        } else {
            source.default = DEFAULT_CONFIG_LOCATIONS
                .iter()
                .find(|candidate| candidate.exists())
                .cloned();
        }

        let Some((path, provenance)) = source.resolved_path() else {
            return Ok((None, None));
        };

        if !path.exists() {
            if provenance.is_explicit() {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, None));
        }

        let contents = fs::read_to_string(&path).map_err(|source| {
            ConfigLoadError::Io {
                path: path.clone(),
                source,
            }
        })?;
        let file_config: FileConfig =
            toml::from_str(&contents).map_err(|source| {
                ConfigLoadError::Parse {
                    path: path.clone(),
                    source,
                }
            })?;

        Ok((Some(file_config), Some(path)))
    }

    fn compose_config(
        &self,
        file_config: Option<FileConfig>,
        env: EnvConfig,
        config_path: Option<PathBuf>,
    ) -> Result<(AgentConfig, ConfigWarnings), ConfigLoadError> {
        let mut warnings = ConfigWarnings::default();

        if config_path.is_none() {
            warnings.push_with_hint(
                "No cms-agent.toml detected; using environment variables and profile defaults",
                "Pass --config or set CMS_AGENT_CONFIG to load a configuration file",
            );
        }

        let FileConfig {
            profile: file_profile,
            server: file_server,
            cors: file_cors,
            provider: file_provider,
            storage: file_storage,
            schedule: file_schedule,
            retry: file_retry,
            validation: file_validation,
            notifications: file_notifications,
        } = file_config.unwrap_or_default();

        let profile = env.profile.or(file_profile).unwrap_or_default();
        let base = AgentConfig::for_profile(profile);

        let server = ServerConfig {
            host: env
                .server_host
                .clone()
                .or(file_server.host)
                .unwrap_or(base.server.host),
            port: env.server_port.or(file_server.port).unwrap_or(base.server.port),
        };

        let cors = CorsConfig {
            allowed_origins: env
                .cors_allowed_origins
                .clone()
                .or(file_cors.allowed_origins)
                .unwrap_or(base.cors.allowed_origins),
        };

        let provider = compose_provider(&env, file_provider, base.provider)?;

        let storage = StorageConfig {
            output_dir: env
                .output_dir
                .clone()
                .or(file_storage.output_dir)
                .unwrap_or(base.storage.output_dir),
            dataset_file: file_storage
                .dataset_file
                .unwrap_or(base.storage.dataset_file),
            checkpoint_file: file_storage
                .checkpoint_file
                .unwrap_or(base.storage.checkpoint_file),
        };

        let schedule = ScheduleConfig {
            poll_interval: match env.poll_interval {
                Some(interval) => interval,
                None => file_duration(
                    "schedule.poll_interval",
                    file_schedule.poll_interval.as_deref(),
                )?
                .unwrap_or(base.schedule.poll_interval),
            },
            auto_update: env
                .auto_update
                .or(file_schedule.auto_update)
                .unwrap_or(base.schedule.auto_update),
            shutdown_grace: match env.shutdown_grace {
                Some(grace) => grace,
                None => file_duration(
                    "schedule.shutdown_grace",
                    file_schedule.shutdown_grace.as_deref(),
                )?
                .unwrap_or(base.schedule.shutdown_grace),
            },
            contention: env
                .contention
                .or(file_schedule.contention)
                .unwrap_or(base.schedule.contention),
        };

        let retry = compose_retry(&env, file_retry, base.retry)?;

        let mut validation = file_validation.unwrap_or(base.validation);
        if let Some(minimum) = env.minimum_record_count {
            validation.minimum_record_count = minimum;
        }
        if let Some(ratio) = env.max_issue_ratio {
            validation.max_issue_ratio = ratio;
        }

        let mut sinks = file_notifications.sinks;
        let env_sinks = [
            env.chat_webhook_url
                .clone()
                .map(|url| SinkConfig::Chat(ChatSinkConfig::new(url))),
            env.webhook_url
                .clone()
                .map(|url| SinkConfig::Webhook(WebhookSinkConfig::new(url))),
        ];
        for sink in env_sinks.into_iter().flatten() {
            let duplicate = sink
                .urls()
                .iter()
                .any(|url| sinks.iter().any(|s| s.urls().contains(url)));
            if !duplicate {
                sinks.push(sink);
            }
        }

        let config = AgentConfig {
            profile,
            server,
            cors,
            provider,
            storage,
            schedule,
            retry,
            validation,
            notifications: NotificationsConfig { sinks },
            metadata: ConfigMetadata {
                config_path,
                env_file_loaded: false,
            },
        };

        let guard_warnings = validation::apply_guard_rails(&config)?;
        warnings.extend(guard_warnings);

        Ok((config, warnings))
    }
}

fn compose_provider(
    env: &EnvConfig,
    file: FileProviderConfig,
    base: DatastoreConfig,
) -> Result<DatastoreConfig, ConfigLoadError> {
    let request_timeout = match env.request_timeout {
        Some(timeout) => Some(timeout),
        None => file_duration(
            "provider.request_timeout",
            file.request_timeout.as_deref(),
        )?,
    };
    let auth = match &env.api_token {
        Some(token) => ProviderAuth::Bearer {
            token: token.clone(),
        },
        None => file.auth.unwrap_or(base.auth),
    };

    Ok(DatastoreConfig {
        base_url: env
            .base_url
            .clone()
            .or(file.base_url)
            .unwrap_or(base.base_url)
            .trim_end_matches('/')
            .to_string(),
        dataset_id: env
            .dataset_id
            .clone()
            .or(file.dataset_id)
            .unwrap_or(base.dataset_id),
        request_timeout_ms: request_timeout
            .map(|timeout| u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(base.request_timeout_ms),
        auth,
    })
}

fn compose_retry(
    env: &EnvConfig,
    file: FileRetryConfig,
    base: RetryPolicy,
) -> Result<RetryPolicy, ConfigLoadError> {
    let millis = |duration: Duration| {
        u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
    };
    Ok(RetryPolicy {
        max_retries: env
            .max_retries
            .or(file.max_retries)
            .unwrap_or(base.max_retries),
        backoff_base_ms: file_duration(
            "retry.backoff_base",
            file.backoff_base.as_deref(),
        )?
        .map(millis)
        .unwrap_or(base.backoff_base_ms),
        backoff_max_ms: file_duration(
            "retry.backoff_max",
            file.backoff_max.as_deref(),
        )?
        .map(millis)
        .unwrap_or(base.backoff_max_ms),
    })
}

fn file_duration(
    field: &'static str,
    raw: Option<&str>,
) -> Result<Option<Duration>, ConfigLoadError> {
    raw.map(|raw| {
        parse_duration(raw).map_err(|reason| ConfigLoadError::InvalidDuration {
            field,
            value: raw.to_string(),
            reason,
        })
    })
    .transpose()
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value `{value}` for {name}: {reason}")]
    InvalidEnv {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid duration `{value}` for {field}: {reason}")]
    InvalidDuration {
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

#[derive(Debug, Default)]
struct ConfigPathSource {
    explicit: Option<PathBuf>,
    env: Option<PathBuf>,
    default: Option<PathBuf>,
}

impl ConfigPathSource {
    fn resolved_path(&self) -> Option<(PathBuf, ConfigPathProvenance)> {
        if let Some(path) = &self.explicit {
            return Some((path.clone(), ConfigPathProvenance::Explicit));
        }
        if let Some(path) = &self.env {
            return Some((path.clone(), ConfigPathProvenance::Env));
        }
        if let Some(path) = &self.default {
            return Some((path.clone(), ConfigPathProvenance::Default));
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigPathProvenance {
    Explicit,
    Env,
    Default,
}

impl ConfigPathProvenance {
    fn is_explicit(self) -> bool {
        matches!(
            self,
            ConfigPathProvenance::Explicit | ConfigPathProvenance::Env
        )
    }
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: AgentConfig,
    pub warnings: ConfigWarnings,
}

impl ConfigLoad {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.metadata.config_path.as_deref()
    }
}
