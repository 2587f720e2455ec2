//! Provider access.
//!
//! The rest of the crate only talks to the provider through [`FetchClient`];
//! [`http::DatastoreClient`] is the production implementation for the CMS
//! Provider Data datastore.

pub mod http;

use std::fmt;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::FetchError;

pub use http::{DatastoreClient, DatastoreConfig, ProviderAuth};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// Cardinality probe
    Count,
    /// Full record listing
    All,
}

/// A parameterized query against one dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetQuery {
    pub dataset_id: String,
    pub kind: QueryKind,
}

impl DatasetQuery {
    pub fn count(dataset_id: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            kind: QueryKind::Count,
        }
    }

    pub fn all(dataset_id: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            kind: QueryKind::All,
        }
    }

    /// Renders the datastore SQL dialect (bracketed statements).
    pub fn to_sql(&self) -> String {
        match self.kind {
            QueryKind::Count => {
                format!("[SELECT COUNT(*) FROM {}]", self.dataset_id)
            }
            QueryKind::All => format!("[SELECT * FROM {}]", self.dataset_id),
        }
    }
}

/// Raw response body of a full fetch.
#[derive(Clone, PartialEq, Eq)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lowercase hex SHA-256 of the body.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.0))
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload").field("len", &self.0.len()).finish()
    }
}

#[async_trait]
pub trait FetchClient: Send + Sync {
    /// Cheap cardinality estimate for change detection.
    async fn probe_count(&self, query: &DatasetQuery)
    -> Result<u64, FetchError>;

    /// Full record payload, exactly as served.
    async fn fetch_all(&self, query: &DatasetQuery)
    -> Result<Payload, FetchError>;
}
