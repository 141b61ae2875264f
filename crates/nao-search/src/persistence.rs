//! Durable storage of ranked architecture pools, keyed by search step.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nao_types::{NaoResult, SearchError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::pool::ArchRecord;

const FILE_PREFIX: &str = "arch_pool-";
const FILE_SUFFIX: &str = ".json";

/// Storage for the ranked pool of every search step.
#[async_trait]
pub trait ArchStore: Send + Sync + std::fmt::Debug {
    /// Store the ranked `(arch, error rate)` pairs of `step`, replacing any
    /// earlier save of the same step.
    async fn save_arches(&self, step: u64, records: &[ArchRecord]) -> NaoResult<()>;

    /// Records of `step` in the order they were saved.
    async fn load_arches(&self, step: u64) -> NaoResult<Vec<ArchRecord>>;

    /// Highest saved step, if any.
    async fn latest_step(&self) -> NaoResult<Option<u64>>;

    fn name(&self) -> &str;
}

/// On-disk layout of one saved step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub run_id: Uuid,
    pub step: u64,
    pub saved_at: DateTime<Utc>,
    pub records: Vec<ArchRecord>,
}

/// Writes `<dir>/arch_pool-<step>.json` files.
#[derive(Debug, Clone)]
pub struct JsonArchStore {
    dir: PathBuf,
    run_id: Uuid,
}

impl JsonArchStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            run_id: Uuid::new_v4(),
        }
    }

    /// Per-user data directory, or the working directory when there is none.
    pub fn default_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nao-search")
            .join("arch_pools")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn step_path(&self, step: u64) -> PathBuf {
        self.dir.join(format!("{}{}{}", FILE_PREFIX, step, FILE_SUFFIX))
    }

    fn parse_step(file_name: &str) -> Option<u64> {
        file_name
            .strip_prefix(FILE_PREFIX)?
            .strip_suffix(FILE_SUFFIX)?
            .parse()
            .ok()
    }
}

#[async_trait]
impl ArchStore for JsonArchStore {
    async fn save_arches(&self, step: u64, records: &[ArchRecord]) -> NaoResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let snapshot = PoolSnapshot {
            run_id: self.run_id,
            step,
            saved_at: Utc::now(),
            records: records.to_vec(),
        };
        let path = self.step_path(step);
        tokio::fs::write(&path, serde_json::to_string_pretty(&snapshot)?).await?;
        info!("Saved {} arches of step {} to {}", records.len(), step, path.display());
        Ok(())
    }

    async fn load_arches(&self, step: u64) -> NaoResult<Vec<ArchRecord>> {
        let path = self.step_path(step);
        if !tokio::fs::try_exists(&path).await? {
            return Err(SearchError::Persistence {
                message: format!("no saved arch pool at {}", path.display()),
            }
            .into());
        }
        let text = tokio::fs::read_to_string(&path).await?;
        let snapshot: PoolSnapshot = serde_json::from_str(&text)?;
        if snapshot.step != step {
            return Err(SearchError::Persistence {
                message: format!("{} holds step {}, expected {}", path.display(), snapshot.step, step),
            }
            .into());
        }
        debug!("Loaded {} arches of step {} (run {})", snapshot.records.len(), step, snapshot.run_id);
        Ok(snapshot.records)
    }

    async fn latest_step(&self) -> NaoResult<Option<u64>> {
        if !tokio::fs::try_exists(&self.dir).await? {
            return Ok(None);
        }
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut latest = None;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(step) = entry.file_name().to_str().and_then(Self::parse_step) {
                latest = latest.max(Some(step));
            }
        }
        Ok(latest)
    }

    fn name(&self) -> &str {
        "json"
    }
}

/// Keeps saved pools in memory.
#[derive(Debug, Default)]
pub struct MemoryArchStore {
    steps: Mutex<BTreeMap<u64, Vec<ArchRecord>>>,
}

impl MemoryArchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_steps(&self) -> usize {
        self.steps.lock().len()
    }
}

#[async_trait]
impl ArchStore for MemoryArchStore {
    async fn save_arches(&self, step: u64, records: &[ArchRecord]) -> NaoResult<()> {
        self.steps.lock().insert(step, records.to_vec());
        Ok(())
    }

    async fn load_arches(&self, step: u64) -> NaoResult<Vec<ArchRecord>> {
        self.steps.lock().get(&step).cloned().ok_or_else(|| {
            SearchError::Persistence {
                message: format!("no saved arch pool for step {}", step),
            }
            .into()
        })
    }

    async fn latest_step(&self) -> NaoResult<Option<u64>> {
        Ok(self.steps.lock().keys().next_back().copied())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nao_types::{NaoError, NetCode};
    use tempfile::tempdir;

    fn records() -> Vec<ArchRecord> {
        vec![
            ArchRecord {
                net_code: NetCode::new(vec![vec![0, 1, 0, 1, 0, 0]], vec![vec![2, 0, 1, 0, 2, 1]]),
                error_rate: 0.25,
            },
            ArchRecord {
                net_code: NetCode::new(vec![vec![1, 2, 3, 1, 1, 2]], vec![vec![0, 3, 0, 0, 3, 3]]),
                error_rate: 0.75,
            },
        ]
    }

    #[tokio::test]
    async fn json_store_round_trip() {
        let temp_dir = tempdir().unwrap();
        let store = JsonArchStore::new(temp_dir.path().join("pools"));

        assert_eq!(store.latest_step().await.unwrap(), None);
        store.save_arches(1, &records()).await.unwrap();
        store.save_arches(12, &records()[..1]).await.unwrap();

        assert!(store.step_path(12).ends_with("arch_pool-12.json"));
        assert_eq!(store.load_arches(1).await.unwrap(), records());
        assert_eq!(store.load_arches(12).await.unwrap().len(), 1);
        assert_eq!(store.latest_step().await.unwrap(), Some(12));

        let text = std::fs::read_to_string(store.step_path(1)).unwrap();
        let snapshot: PoolSnapshot = serde_json::from_str(&text).unwrap();
        assert_eq!(snapshot.run_id, store.run_id());
        assert_eq!(snapshot.step, 1);
    }

    #[tokio::test]
    async fn json_store_missing_step() {
        let temp_dir = tempdir().unwrap();
        let store = JsonArchStore::new(temp_dir.path());
        std::fs::write(temp_dir.path().join("notes.txt"), "x").unwrap();
        assert_eq!(store.latest_step().await.unwrap(), None);
        assert!(matches!(
            store.load_arches(3).await,
            Err(NaoError::Search(SearchError::Persistence { .. }))
        ));
    }

    #[tokio::test]
    async fn memory_store_overwrites_step() {
        let store = MemoryArchStore::new();
        store.save_arches(2, &records()).await.unwrap();
        store.save_arches(2, &records()[1..]).await.unwrap();
        store.save_arches(1, &records()).await.unwrap();
        assert_eq!(store.num_steps(), 2);
        assert_eq!(store.load_arches(2).await.unwrap(), records()[1..].to_vec());
        assert_eq!(store.latest_step().await.unwrap(), Some(2));
        assert!(store.load_arches(7).await.is_err());
    }

    #[test]
    fn parses_step_file_names() {
        assert_eq!(JsonArchStore::parse_step("arch_pool-7.json"), Some(7));
        assert_eq!(JsonArchStore::parse_step("arch_pool-x.json"), None);
        assert_eq!(JsonArchStore::parse_step("pool-7.json"), None);
    }
}
