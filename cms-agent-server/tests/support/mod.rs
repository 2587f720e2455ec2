use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};

use anyhow::Result;
use async_trait::async_trait;
use axum_test::TestServer;
use cms_agent_config::{AgentConfig, Profile};
use cms_agent_core::{
    Agent, DatasetQuery, FetchClient, FetchError, Payload,
    validation::{DEFAULT_PROVIDER_ID_FIELD, DEFAULT_RATING_FIELD},
};
use cms_agent_server::{
    AppState, create_app, infra::startup::build_agent_with_client,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tempfile::TempDir;

/// In-process provider serving a fixed count and payload.
#[derive(Debug, Default)]
pub struct FakeProvider {
    count: AtomicU64,
    payload: Mutex<Vec<u8>>,
    pub fetches: AtomicUsize,
    hang: AtomicBool,
}

impl FakeProvider {
    pub fn serving(records: usize) -> Arc<Self> {
        let provider = Arc::new(Self::default());
        provider.set_records(records);
        provider
    }

    pub fn set_records(&self, records: usize) {
        self.count.store(records as u64, Ordering::SeqCst);
        *self.payload.lock() = dataset(records);
    }

    /// Makes every later fetch block forever.
    #[allow(unused)]
    pub fn hang_fetches(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FetchClient for FakeProvider {
    async fn probe_count(&self, _query: &DatasetQuery) -> Result<u64, FetchError> {
        Ok(self.count.load(Ordering::SeqCst))
    }

    async fn fetch_all(&self, _query: &DatasetQuery) -> Result<Payload, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(Payload::new(self.payload.lock().clone()))
    }
}

pub fn dataset(records: usize) -> Vec<u8> {
    let rows: Vec<Value> = (0..records)
        .map(|i| {
            json!({
                DEFAULT_PROVIDER_ID_FIELD: format!("{i:06}"),
                DEFAULT_RATING_FIELD: "4",
            })
        })
        .collect();
    serde_json::to_vec(&rows).unwrap()
}

#[allow(unused)]
pub struct TestApp {
    pub server: TestServer,
    pub state: AppState,
    pub provider: Arc<FakeProvider>,
    pub config: AgentConfig,
    _tempdir: TempDir,
}

#[allow(unused)]
impl TestApp {
    pub fn agent(&self) -> &Arc<Agent> {
        &self.state.agent
    }
}

pub fn test_config(dir: &TempDir) -> AgentConfig {
    let mut config = AgentConfig::for_profile(Profile::Testing);
    config.storage.output_dir = dir.path().join("cms_data");
    config.validation.minimum_record_count = 10;
    config
}

pub async fn build_test_app(records: usize) -> Result<TestApp> {
    let tempdir = tempfile::tempdir()?;
    let config = test_config(&tempdir);
    let provider = FakeProvider::serving(records);
    let agent = build_agent_with_client(&config, provider.clone()).await?;
    let state = AppState::new(agent, config.cors.clone());
    let server = TestServer::new(create_app(state.clone()))?;

    Ok(TestApp {
        server,
        state,
        provider,
        config,
        _tempdir: tempdir,
    })
}
