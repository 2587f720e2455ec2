//! # CMS Agent Core
//!
//! Core library for the CMS data agent: keeps a locally published copy of a
//! CMS Provider Data dataset fresh.
//!
//! ## Overview
//!
//! - **Fetch**: [`fetch::FetchClient`] seam plus the datastore HTTP client
//! - **Validation**: ordered structural and policy checks over a payload
//! - **Checkpoint**: durable record of the last published dataset
//! - **Monitor**: cheap count probes deciding fresh / stale / unknown
//! - **Orchestrator**: fetch → validate → publish with retry and backoff
//! - **Scheduler**: background loop with graceful shutdown and health
//! - **Notifications**: best-effort fan-out of run outcomes
//!
//! [`agent::Agent`] wires these together and is what the server and CLI
//! talk to.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod agent;
pub mod checkpoint;
pub mod error;
pub mod fetch;
pub mod monitor;
pub mod notify;
pub mod orchestrator;
pub mod scheduler;
pub mod status;
pub mod validation;

mod fs;
#[cfg(test)]
mod testing;

pub use agent::{Agent, AgentParts, HealthReport, SettingsPatch};
pub use checkpoint::{Checkpoint, CheckpointStore, CountRegression, StoragePaths};
pub use error::{AgentError, FetchError, NotifyError, PersistenceError};
pub use fetch::{DatasetQuery, FetchClient, Payload};
pub use monitor::{ChangeMonitor, Freshness, StaleReason};
pub use orchestrator::{
    Outcome, OutcomeStatus, RetryPolicy, RunContention, UpdateOrchestrator,
};
pub use scheduler::{
    MAX_POLL_INTERVAL, ScheduleSettings, SchedulerHandle, ShutdownReport,
};
pub use status::{AgentStatus, MetricValue, MetricsSnapshot, SchedulerState};
pub use validation::{ValidationEngine, ValidationReport, ValidationRuleSet};
