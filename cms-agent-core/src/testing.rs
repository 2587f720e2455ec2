//! Fakes shared by unit tests.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc};

use crate::{
    error::{FetchError, NotifyError},
    fetch::{DatasetQuery, FetchClient, Payload},
    notify::NotificationSink,
    orchestrator::{Outcome, OutcomeStatus},
    validation::ValidationRuleSet,
};

/// `total` records keyed `id`, the first `missing_rating` without a rating.
pub(crate) fn dataset(total: usize, missing_rating: usize) -> Vec<u8> {
    let rows: Vec<Value> = (0..total)
        .map(|i| {
            if i < missing_rating {
                json!({"id": format!("P{i:05}")})
            } else {
                json!({"id": format!("P{i:05}"), "rating": "4"})
            }
        })
        .collect();
    serde_json::to_vec(&rows).unwrap()
}

pub(crate) fn rules(minimum: usize) -> ValidationRuleSet {
    ValidationRuleSet {
        minimum_record_count: minimum,
        required_fields: vec!["id".into(), "rating".into()],
        rating_fields: vec!["rating".into()],
        unique_key_field: Some("id".into()),
        max_issue_ratio: 0.10,
        ..ValidationRuleSet::default()
    }
}

/// Blocks fetches until released, announcing each one that starts.
#[derive(Debug, Default)]
pub(crate) struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

#[derive(Debug, Default)]
pub(crate) struct ScriptedClient {
    count: AtomicU64,
    probe_failure: Mutex<Option<u16>>,
    payload: Mutex<Vec<u8>>,
    failures: Mutex<VecDeque<FetchError>>,
    gate: Mutex<Option<Arc<Gate>>>,
    probes: AtomicUsize,
    pub fetch_times: Mutex<Vec<tokio::time::Instant>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl ScriptedClient {
    pub fn serving(count: u64, payload: Vec<u8>) -> Arc<Self> {
        let client = Self::default();
        client.count.store(count, Ordering::SeqCst);
        *client.payload.lock() = payload;
        Arc::new(client)
    }

    pub fn set_dataset(&self, count: u64, payload: Vec<u8>) {
        self.count.store(count, Ordering::SeqCst);
        *self.payload.lock() = payload;
    }

    pub fn fail_probes_with(&self, status: Option<u16>) {
        *self.probe_failure.lock() = status;
    }

    pub fn push_failure(&self, err: FetchError) {
        self.failures.lock().push_back(err);
    }

    pub fn gate(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.fetch_times.lock().len()
    }
}

#[async_trait]
impl FetchClient for ScriptedClient {
    async fn probe_count(
        &self,
        _query: &DatasetQuery,
    ) -> Result<u64, FetchError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = *self.probe_failure.lock() {
            return Err(FetchError::Status {
                status,
                message: "probe failed".into(),
            });
        }
        Ok(self.count.load(Ordering::SeqCst))
    }

    async fn fetch_all(
        &self,
        _query: &DatasetQuery,
    ) -> Result<Payload, FetchError> {
        self.fetch_times.lock().push(tokio::time::Instant::now());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        let result = match self.failures.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(Payload::new(self.payload.lock().clone())),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[derive(Debug)]
pub(crate) struct RecordingSink {
    pub tx: mpsc::UnboundedSender<Outcome>,
}

#[async_trait]
impl NotificationSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn deliver(&self, outcome: &Outcome) -> Result<(), NotifyError> {
        let _ = self.tx.send(outcome.clone());
        Ok(())
    }
}

pub(crate) fn every_status() -> Vec<OutcomeStatus> {
    vec![
        OutcomeStatus::UpToDate,
        OutcomeStatus::Updated,
        OutcomeStatus::Failed,
        OutcomeStatus::Invalid,
        OutcomeStatus::Busy,
    ]
}
