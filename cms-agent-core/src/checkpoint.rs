//! Durable record of the last published dataset.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::PersistenceError,
    fetch::Payload,
    fs::{Previous, StagedFile, sync_parent},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub record_count: u64,
    /// Hex SHA-256 of the published payload
    pub fingerprint: String,
    pub fetched_at: DateTime<Utc>,
    pub file_size: u64,
    /// Set when this checkpoint replaced one with a higher count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count_regression: Option<CountRegression>,
}

impl Checkpoint {
    pub fn age(&self, now: DateTime<Utc>) -> TimeDelta {
        now.signed_duration_since(self.fetched_at)
    }

    pub fn age_hours(&self, now: DateTime<Utc>) -> f64 {
        self.age(now).num_seconds() as f64 / 3600.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountRegression {
    pub previous: u64,
    pub current: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    pub dataset: PathBuf,
    pub checkpoint: PathBuf,
}

impl StoragePaths {
    pub fn in_dir(
        output_dir: &Path,
        dataset_file: &str,
        checkpoint_file: &str,
    ) -> Self {
        Self {
            dataset: output_dir.join(dataset_file),
            checkpoint: output_dir.join(checkpoint_file),
        }
    }
}

/// Holds the one live [`Checkpoint`] for a dataset and replaces it, together
/// with the dataset file, atomically on disk.
#[derive(Debug)]
pub struct CheckpointStore {
    paths: StoragePaths,
    current: RwLock<Option<Checkpoint>>,
}

impl CheckpointStore {
    /// Loads the persisted checkpoint if one exists. An unreadable file is
    /// treated as absent so the next run republishes.
    pub async fn open(paths: StoragePaths) -> Result<Self, PersistenceError> {
        let current = match tokio::fs::read(&paths.checkpoint).await {
            Ok(bytes) => match serde_json::from_slice::<Checkpoint>(&bytes) {
                Ok(checkpoint) => {
                    debug!(
                        path = %paths.checkpoint.display(),
                        record_count = checkpoint.record_count,
                        "loaded checkpoint"
                    );
                    Some(checkpoint)
                }
                Err(err) => {
                    warn!(
                        path = %paths.checkpoint.display(),
                        error = %err,
                        "ignoring unreadable checkpoint"
                    );
                    None
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => {
                return Err(PersistenceError::Read {
                    path: paths.checkpoint.clone(),
                    source,
                });
            }
        };

        Ok(Self {
            paths,
            current: RwLock::new(current),
        })
    }

    pub fn with_checkpoint(
        paths: StoragePaths,
        checkpoint: Option<Checkpoint>,
    ) -> Self {
        Self {
            paths,
            current: RwLock::new(checkpoint),
        }
    }

    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    pub fn current(&self) -> Option<Checkpoint> {
        self.current.read().clone()
    }

    /// Replaces the dataset file and the checkpoint as a pair. Both are
    /// staged and synced first; if the checkpoint cannot be renamed into
    /// place the previous dataset file is put back. The in-memory checkpoint
    /// only changes once both renames succeeded.
    pub async fn publish(
        &self,
        payload: Payload,
        checkpoint: Checkpoint,
    ) -> Result<(), PersistenceError> {
        let encoded = serde_json::to_vec_pretty(&checkpoint)
            .map_err(PersistenceError::Encode)?;
        let paths = self.paths.clone();

        tokio::task::spawn_blocking(move || {
            let dataset = StagedFile::write(&paths.dataset, payload.as_bytes())
                .map_err(write_failed(&paths.dataset))?;
            let staged_checkpoint = StagedFile::write(&paths.checkpoint, &encoded)
                .map_err(write_failed(&paths.checkpoint))?;
            let previous =
                Previous::keep(&paths.dataset).map_err(write_failed(&paths.dataset))?;

            dataset.commit().map_err(write_failed(&paths.dataset))?;
            if let Err(source) = staged_checkpoint.commit() {
                previous.restore();
                return Err(write_failed(&paths.checkpoint)(source));
            }
            previous.discard();
            sync_parent(&paths.dataset);
            Ok(())
        })
        .await
        .map_err(|err| PersistenceError::Task(err.to_string()))??;

        *self.current.write() = Some(checkpoint);
        Ok(())
    }

    /// Re-reads the checkpoint file so runs published by another process
    /// become visible. Unreadable or missing files leave the current value.
    pub async fn refresh(&self) -> Option<Checkpoint> {
        let on_disk = match tokio::fs::read(&self.paths.checkpoint).await {
            Ok(bytes) => serde_json::from_slice::<Checkpoint>(&bytes).ok(),
            Err(_) => None,
        };
        if let Some(checkpoint) = on_disk {
            let mut current = self.current.write();
            if current.as_ref() != Some(&checkpoint) {
                debug!(
                    path = %self.paths.checkpoint.display(),
                    record_count = checkpoint.record_count,
                    "checkpoint changed on disk; reloaded"
                );
                *current = Some(checkpoint);
            }
        }
        self.current()
    }

    /// Advisory lock file serializing runs across processes that share the
    /// output directory.
    pub fn lock_path(&self) -> PathBuf {
        self.paths.checkpoint.with_extension("lock")
    }
}

fn write_failed(
    path: &Path,
) -> impl FnOnce(std::io::Error) -> PersistenceError + use<> {
    let path = path.to_path_buf();
    move |source| PersistenceError::Write { path, source }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(count: u64) -> Checkpoint {
        Checkpoint {
            record_count: count,
            fingerprint: "abc".into(),
            fetched_at: Utc::now(),
            file_size: 2,
            count_regression: None,
        }
    }

    fn paths_in(dir: &Path) -> StoragePaths {
        StoragePaths::in_dir(dir, "dataset.json", "checkpoint.json")
    }

    #[tokio::test]
    async fn missing_checkpoint_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(paths_in(dir.path())).await.unwrap();
        assert!(store.current().is_none());
    }

    #[tokio::test]
    async fn published_checkpoint_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(paths_in(dir.path())).await.unwrap();
        let checkpoint = sample(12068);

        store
            .publish(Payload::new(b"[]".to_vec()), checkpoint.clone())
            .await
            .unwrap();
        assert_eq!(store.current(), Some(checkpoint.clone()));

        let reopened =
            CheckpointStore::open(paths_in(dir.path())).await.unwrap();
        assert_eq!(reopened.current(), Some(checkpoint));
        assert_eq!(
            std::fs::read(dir.path().join("dataset.json")).unwrap(),
            b"[]"
        );
    }

    #[tokio::test]
    async fn corrupt_checkpoint_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("checkpoint.json"), b"{not json").unwrap();

        let store = CheckpointStore::open(paths_in(dir.path())).await.unwrap();
        assert!(store.current().is_none());
    }

    #[tokio::test]
    async fn failed_publish_keeps_previous_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file").unwrap();
        let previous = sample(100);
        let store = CheckpointStore::with_checkpoint(
            paths_in(&blocker),
            Some(previous.clone()),
        );

        let err = store
            .publish(Payload::new(b"[]".to_vec()), sample(200))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Write { .. }));
        assert_eq!(store.current(), Some(previous));
    }

    #[tokio::test]
    async fn failed_checkpoint_rename_restores_previous_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(paths_in(dir.path())).await.unwrap();
        store
            .publish(Payload::new(b"[1,2]".to_vec()), sample(2))
            .await
            .unwrap();

        let checkpoint_path = dir.path().join("checkpoint.json");
        std::fs::remove_file(&checkpoint_path).unwrap();
        std::fs::create_dir(&checkpoint_path).unwrap();
        std::fs::write(checkpoint_path.join("occupied"), b"x").unwrap();

        let err = store
            .publish(Payload::new(b"[1,2,3]".to_vec()), sample(3))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Write { ref path, .. } if *path == checkpoint_path));
        assert_eq!(store.current().unwrap().record_count, 2);
        assert_eq!(
            std::fs::read(dir.path().join("dataset.json")).unwrap(),
            b"[1,2]"
        );

        let mut names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["checkpoint.json", "dataset.json"]);
    }

    #[tokio::test]
    async fn refresh_picks_up_checkpoint_written_elsewhere() {
        let dir = tempfile::tempdir().unwrap();
        let reader = CheckpointStore::open(paths_in(dir.path())).await.unwrap();
        let writer = CheckpointStore::open(paths_in(dir.path())).await.unwrap();

        writer
            .publish(Payload::new(b"[]".to_vec()), sample(7))
            .await
            .unwrap();
        assert!(reader.current().is_none());
        assert_eq!(reader.refresh().await.unwrap().record_count, 7);
        assert_eq!(reader.current().unwrap().record_count, 7);
    }

    #[test]
    fn regression_flag_is_omitted_when_absent() {
        let json = serde_json::to_value(sample(1)).unwrap();
        assert!(json.get("count_regression").is_none());

        let mut flagged = sample(1);
        flagged.count_regression = Some(CountRegression {
            previous: 5,
            current: 1,
        });
        let json = serde_json::to_value(flagged).unwrap();
        assert_eq!(json["count_regression"]["previous"], 5);
    }
}
