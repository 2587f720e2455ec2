use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    checkpoint::CheckpointStore,
    fetch::{DatasetQuery, FetchClient},
    status::StatusPublisher,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "freshness", rename_all = "snake_case")]
pub enum Freshness {
    Fresh { record_count: u64 },
    Stale { reason: StaleReason },
    Unknown { error: String },
}

impl Freshness {
    pub fn is_stale(&self) -> bool {
        matches!(self, Freshness::Stale { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Freshness::Fresh { .. } => "fresh",
            Freshness::Stale { .. } => "stale",
            Freshness::Unknown { .. } => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StaleReason {
    NoCheckpoint { probed: u64 },
    CountChanged { previous: u64, current: u64 },
    CountDecreased { previous: u64, current: u64 },
    Expired { record_count: u64, age_hours: f64 },
}

/// Decides staleness from a count probe and the checkpoint age. Never
/// touches the checkpoint.
pub struct ChangeMonitor {
    client: Arc<dyn FetchClient>,
    query: DatasetQuery,
    store: Arc<CheckpointStore>,
    maximum_age: TimeDelta,
    status: StatusPublisher,
}

impl std::fmt::Debug for ChangeMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeMonitor")
            .field("query", &self.query)
            .field("maximum_age", &self.maximum_age)
            .finish_non_exhaustive()
    }
}

impl ChangeMonitor {
    pub fn new(
        client: Arc<dyn FetchClient>,
        dataset_id: impl Into<String>,
        store: Arc<CheckpointStore>,
        maximum_age: TimeDelta,
        status: StatusPublisher,
    ) -> Self {
        Self {
            client,
            query: DatasetQuery::count(dataset_id),
            store,
            maximum_age,
            status,
        }
    }

    pub async fn check_for_updates(&self) -> Freshness {
        let probed = match self.client.probe_count(&self.query).await {
            Ok(count) => count,
            Err(err) => {
                warn!(
                    dataset = %self.query.dataset_id,
                    error = %err,
                    "count probe failed; freshness unknown"
                );
                let error = format!("count probe failed: {err}");
                self.status.update(|status| {
                    status.last_error = Some(error.clone());
                });
                return Freshness::Unknown { error };
            }
        };

        let now = Utc::now();
        let mut checkpoint = self.store.current();
        let settled = checkpoint.as_ref().is_some_and(|cp| {
            cp.record_count == probed && cp.age(now) <= self.maximum_age
        });
        if !settled {
            checkpoint = self.store.refresh().await;
        }
        let freshness = match &checkpoint {
            None => Freshness::Stale {
                reason: StaleReason::NoCheckpoint { probed },
            },
            Some(cp) if probed < cp.record_count => {
                warn!(
                    dataset = %self.query.dataset_id,
                    previous = cp.record_count,
                    current = probed,
                    "provider record count decreased"
                );
                Freshness::Stale {
                    reason: StaleReason::CountDecreased {
                        previous: cp.record_count,
                        current: probed,
                    },
                }
            }
            Some(cp) if probed != cp.record_count => Freshness::Stale {
                reason: StaleReason::CountChanged {
                    previous: cp.record_count,
                    current: probed,
                },
            },
            Some(cp) if cp.age(now) > self.maximum_age => Freshness::Stale {
                reason: StaleReason::Expired {
                    record_count: cp.record_count,
                    age_hours: cp.age_hours(now),
                },
            },
            Some(_) => Freshness::Fresh {
                record_count: probed,
            },
        };

        match &freshness {
            Freshness::Stale { reason } => {
                info!(dataset = %self.query.dataset_id, ?reason, "dataset is stale")
            }
            _ => debug!(
                dataset = %self.query.dataset_id,
                record_count = probed,
                "dataset is fresh"
            ),
        }

        let stale = freshness.is_stale();
        let known = checkpoint.as_ref().map(|cp| cp.record_count);
        self.status.update(|status| {
            status.last_check = Some(now);
            status.update_available = stale;
            if known != Some(probed) {
                status.previous_record_count = known;
            }
            status.current_record_count = Some(probed);
            if !stale {
                status.last_error = None;
            }
        });

        freshness
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        checkpoint::{Checkpoint, StoragePaths},
        error::FetchError,
        fetch::Payload,
        status::AgentStatus,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ProbeOnly {
        result: Result<u64, u16>,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl FetchClient for ProbeOnly {
        async fn probe_count(
            &self,
            _query: &DatasetQuery,
        ) -> Result<u64, FetchError> {
            self.result.map_err(|status| FetchError::Status {
                status,
                message: "down".into(),
            })
        }

        async fn fetch_all(
            &self,
            _query: &DatasetQuery,
        ) -> Result<Payload, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(Payload::new(b"[]".to_vec()))
        }
    }

    fn checkpoint(count: u64, age: TimeDelta) -> Checkpoint {
        Checkpoint {
            record_count: count,
            fingerprint: "f".into(),
            fetched_at: Utc::now() - age,
            file_size: 1,
            count_regression: None,
        }
    }

    fn monitor(
        probe: Result<u64, u16>,
        cp: Option<Checkpoint>,
    ) -> (ChangeMonitor, Arc<CheckpointStore>, StatusPublisher) {
        let paths = StoragePaths::in_dir(
            std::path::Path::new("/nonexistent"),
            "d.json",
            "c.json",
        );
        let store = Arc::new(CheckpointStore::with_checkpoint(paths, cp));
        let status = StatusPublisher::new(AgentStatus::new(
            Utc::now(),
            store.current().as_ref(),
        ));
        let client = Arc::new(ProbeOnly {
            result: probe,
            fetches: AtomicUsize::new(0),
        });
        let monitor = ChangeMonitor::new(
            client,
            "ds",
            Arc::clone(&store),
            TimeDelta::hours(48),
            status.clone(),
        );
        (monitor, store, status)
    }

    #[tokio::test]
    async fn matching_count_within_max_age_is_fresh() {
        let cp = checkpoint(12068, TimeDelta::hours(2));
        let (monitor, store, status) = monitor(Ok(12068), Some(cp.clone()));

        let freshness = monitor.check_for_updates().await;
        assert_eq!(
            freshness,
            Freshness::Fresh {
                record_count: 12068
            }
        );
        let snapshot = status.snapshot();
        assert!(snapshot.last_check.is_some());
        assert!(!snapshot.update_available);
        assert_eq!(store.current(), Some(cp));
    }

    #[tokio::test]
    async fn changed_count_is_stale() {
        let (monitor, _store, status) =
            monitor(Ok(12100), Some(checkpoint(12068, TimeDelta::hours(2))));

        let freshness = monitor.check_for_updates().await;
        assert_eq!(
            freshness,
            Freshness::Stale {
                reason: StaleReason::CountChanged {
                    previous: 12068,
                    current: 12100
                }
            }
        );
        let snapshot = status.snapshot();
        assert!(snapshot.update_available);
        assert_eq!(snapshot.previous_record_count, Some(12068));
        assert_eq!(snapshot.current_record_count, Some(12100));
    }

    #[tokio::test]
    async fn decreased_count_is_flagged_stale() {
        let (monitor, _, _) =
            monitor(Ok(11000), Some(checkpoint(12068, TimeDelta::hours(2))));
        assert!(matches!(
            monitor.check_for_updates().await,
            Freshness::Stale {
                reason: StaleReason::CountDecreased { .. }
            }
        ));
    }

    #[tokio::test]
    async fn old_checkpoint_is_stale_even_with_same_count() {
        let (monitor, _, _) =
            monitor(Ok(12068), Some(checkpoint(12068, TimeDelta::hours(49))));
        assert!(matches!(
            monitor.check_for_updates().await,
            Freshness::Stale {
                reason: StaleReason::Expired { .. }
            }
        ));
    }

    #[tokio::test]
    async fn missing_checkpoint_is_stale() {
        let (monitor, _, _) = monitor(Ok(5), None);
        assert_eq!(
            monitor.check_for_updates().await,
            Freshness::Stale {
                reason: StaleReason::NoCheckpoint { probed: 5 }
            }
        );
    }

    #[tokio::test]
    async fn checkpoint_published_by_another_process_is_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StoragePaths::in_dir(dir.path(), "d.json", "c.json");
        CheckpointStore::with_checkpoint(paths.clone(), None)
            .publish(Payload::new(b"[]".to_vec()), checkpoint(20, TimeDelta::hours(1)))
            .await
            .unwrap();

        let store = Arc::new(CheckpointStore::with_checkpoint(paths, None));
        let status = StatusPublisher::new(AgentStatus::new(Utc::now(), None));
        let monitor = ChangeMonitor::new(
            Arc::new(ProbeOnly {
                result: Ok(20),
                fetches: AtomicUsize::new(0),
            }),
            "ds",
            Arc::clone(&store),
            TimeDelta::hours(48),
            status,
        );

        assert_eq!(
            monitor.check_for_updates().await,
            Freshness::Fresh { record_count: 20 }
        );
        assert_eq!(store.current().unwrap().record_count, 20);
    }

    #[tokio::test]
    async fn probe_failure_is_unknown_and_recorded() {
        let cp = checkpoint(12068, TimeDelta::hours(2));
        let (monitor, store, status) = monitor(Err(503), Some(cp.clone()));

        let freshness = monitor.check_for_updates().await;
        assert!(matches!(freshness, Freshness::Unknown { .. }));
        assert!(!freshness.is_stale());

        let snapshot = status.snapshot();
        assert!(snapshot.last_error.as_deref().unwrap().contains("503"));
        assert!(snapshot.last_check.is_none());
        assert_eq!(store.current(), Some(cp));
    }
}
