//! Persistence seam.
//!
//! The engine commits one full `EconomySnapshot` per mutation. Agents, bids,
//! the transaction log and market states travel together, so a crash never
//! leaves a partially applied cycle behind.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::attention::AttentionSlot;
use crate::book::BidBook;
use crate::config::StorageConfig;
use crate::ledger::Ledger;
use crate::market::MarketState;
use crate::types::PerResource;

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("state store IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("state store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("unsupported snapshot format version {0}")]
    UnsupportedFormat(u32),
    #[error("state store unavailable: {0}")]
    Unavailable(String),
}

/// Everything needed to recover the economy after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EconomySnapshot {
    pub format_version: u32,
    /// Number of cycles fully committed so far.
    pub cycle: u64,
    pub saved_at: DateTime<Utc>,
    pub ledger: Ledger,
    pub bids: BidBook,
    pub market: PerResource<MarketState>,
    pub attention: AttentionSlot,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    fn label(&self) -> &'static str;

    async fn load(&self) -> Result<Option<EconomySnapshot>, StorageError>;

    async fn commit(&self, snapshot: &EconomySnapshot) -> Result<(), StorageError>;
}

/// Keeps the last committed snapshot in process memory.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    current: Mutex<Option<EconomySnapshot>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    fn label(&self) -> &'static str {
        "memory"
    }

    async fn load(&self) -> Result<Option<EconomySnapshot>, StorageError> {
        Ok(self.current.lock().await.clone())
    }

    async fn commit(&self, snapshot: &EconomySnapshot) -> Result<(), StorageError> {
        *self.current.lock().await = Some(snapshot.clone());
        Ok(())
    }
}

/// Writes each snapshot to a temp file and renames it over the target.
#[derive(Debug)]
pub struct JsonFileStateStore {
    path: PathBuf,
}

impl JsonFileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateStore for JsonFileStateStore {
    fn label(&self) -> &'static str {
        "json_file"
    }

    async fn load(&self) -> Result<Option<EconomySnapshot>, StorageError> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(None);
        }
        let bytes = tokio::fs::read(&self.path).await?;
        if bytes.is_empty() {
            return Ok(None);
        }
        let snapshot: EconomySnapshot = serde_json::from_slice(&bytes)?;
        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(StorageError::UnsupportedFormat(snapshot.format_version));
        }
        Ok(Some(snapshot))
    }

    async fn commit(&self, snapshot: &EconomySnapshot) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, bytes).await?;
        tokio::fs::rename(tmp_path, &self.path).await?;
        Ok(())
    }
}

pub fn build_store(config: &StorageConfig) -> Arc<dyn StateStore> {
    match config {
        StorageConfig::Memory => Arc::new(MemoryStateStore::new()),
        StorageConfig::JsonFile { path } => Arc::new(JsonFileStateStore::new(path.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MarketConfig;
    use crate::market::Market;
    use crate::types::{AgentId, Credits};
    use uuid::Uuid;

    fn snapshot() -> EconomySnapshot {
        let mut ledger = Ledger::new();
        ledger
            .open_account(AgentId::new("a"), Credits::from_credits(100), vec![], Utc::now())
            .unwrap();
        EconomySnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            cycle: 7,
            saved_at: Utc::now(),
            ledger,
            bids: BidBook::new(),
            market: Market::new(MarketConfig::default()).states().clone(),
            attention: AttentionSlot::new(),
        }
    }

    #[tokio::test]
    async fn memory_store_returns_last_commit() {
        let store = MemoryStateStore::new();
        assert!(store.load().await.unwrap().is_none());
        store.commit(&snapshot()).await.unwrap();
        assert_eq!(store.load().await.unwrap().unwrap().cycle, 7);
    }

    #[tokio::test]
    async fn json_store_persists_across_reload() {
        let dir = std::env::temp_dir().join(format!("syntropism-store-{}", Uuid::new_v4()));
        let path = dir.join("state.json");

        let store = JsonFileStateStore::new(&path);
        assert!(store.load().await.unwrap().is_none());
        store.commit(&snapshot()).await.unwrap();

        let reloaded = JsonFileStateStore::new(&path).load().await.unwrap().unwrap();
        assert_eq!(reloaded.cycle, 7);
        assert_eq!(
            reloaded.ledger.balance(&"a".into()).unwrap(),
            Credits::from_credits(100)
        );
        assert!(!path.with_extension("tmp").exists());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn builds_configured_backend() {
        assert_eq!(build_store(&StorageConfig::Memory).label(), "memory");
        assert_eq!(
            build_store(&StorageConfig::json_file("/tmp/x.json")).label(),
            "json_file"
        );
    }
}
