use std::{path::PathBuf, time::Duration};

use thiserror::Error;

/// Failure reported by a [`crate::fetch::FetchClient`].
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("provider request timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider connection failed: {0}")]
    Connect(String),

    #[error("provider returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("provider response could not be decoded: {0}")]
    Decode(String),

    #[error("provider request failed: {0}")]
    Request(String),
}

impl FetchError {
    /// Network faults, timeouts, throttling and server errors are worth
    /// another attempt; client errors and undecodable bodies are not.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout(_)
            | FetchError::Connect(_)
            | FetchError::Request(_) => true,
            FetchError::Status { status, .. } => {
                *status == 429 || (500..600).contains(status)
            }
            FetchError::Decode(_) => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode checkpoint: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("publish task failed: {0}")]
    Task(String),
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("sink request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("sink returned HTTP {0}")]
    Status(u16),

    #[error("sink timed out after {0:?}")]
    Timeout(Duration),
}

/// Pipeline failures as seen by the orchestrator.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("transient fetch failure: {0}")]
    TransientFetch(#[source] FetchError),

    #[error("fetch rejected: {0}")]
    Fetch(#[source] FetchError),

    #[error("structural validation failed: {0}")]
    StructuralValidation(String),

    #[error("validation threshold exceeded: {0}")]
    PolicyValidation(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("run abandoned: {0}")]
    Abandoned(String),
}

impl AgentError {
    pub fn from_fetch(err: FetchError) -> Self {
        if err.is_transient() {
            AgentError::TransientFetch(err)
        } else {
            AgentError::Fetch(err)
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::TransientFetch(_) | AgentError::Persistence(_)
        )
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AgentError::StructuralValidation(_)
                | AgentError::PolicyValidation(_)
        )
    }
}
