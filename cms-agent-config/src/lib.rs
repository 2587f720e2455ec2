//! Configuration for the CMS data agent.
//!
//! [`ConfigLoader`] composes environment variables (optionally seeded from a
//! `.env` file), a TOML file and profile defaults into an [`AgentConfig`],
//! then runs the guard rails in [`validation`]. Values are immutable once
//! loaded; only the schedule can change at runtime, through the agent.

pub mod loader;
pub mod models;
pub mod sources;
pub mod util;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::{
    AgentConfig, ConfigMetadata, CorsConfig, NotificationsConfig, Profile,
    ScheduleConfig, ServerConfig, StorageConfig,
};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
