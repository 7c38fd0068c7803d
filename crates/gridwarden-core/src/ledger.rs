//! Operation ledger
//!
//! Append-only record of every mutating tool invocation a task made. The only
//! permitted mutation is `success → rolled_back`.

use crate::error::{Result, WardenError};
use crate::resource::{RegionState, SheetState};
use crate::tool::ToolCall;
use crate::types::{now, Params, Timestamp};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Outcome of a recorded operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationResult {
    /// Applied
    Success,
    /// Tool failed
    Failed,
    /// Applied, then reversed
    RolledBack,
}

/// Everything needed to reverse one operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RollbackData {
    /// Pre-state of the touched region
    Region {
        /// Captured cells
        state: RegionState,
    },
    /// Pre-state of a whole sheet; `None` means the sheet did not exist
    Sheet {
        /// Sheet name
        sheet: String,
        /// Captured sheet
        state: Option<SheetState>,
    },
    /// Inverse tool call
    Compensation {
        /// Call to run
        call: ToolCall,
    },
}

/// One ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Record id
    pub id: Uuid,
    /// When the tool was invoked
    pub timestamp: Timestamp,
    /// Tool name
    pub tool_name: String,
    /// Tool parameters
    pub tool_input: Params,
    /// Outcome
    pub result: OperationResult,
    /// Plan step that issued it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Reversal data (mutating tools only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_data: Option<RollbackData>,
}

/// Per-task ledger
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationLedger {
    records: Vec<OperationRecord>,
}

impl OperationLedger {
    /// Empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record and return its id
    pub fn append(
        &mut self,
        tool_name: &str,
        tool_input: &Params,
        result: OperationResult,
        step_id: Option<String>,
        rollback_data: Option<RollbackData>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.records.push(OperationRecord {
            id,
            timestamp: now(),
            tool_name: tool_name.to_string(),
            tool_input: tool_input.clone(),
            result,
            step_id,
            rollback_data,
        });
        id
    }

    /// All records, oldest first
    pub fn records(&self) -> &[OperationRecord] {
        &self.records
    }

    /// Look up a record
    pub fn get(&self, id: Uuid) -> Option<&OperationRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    /// Index of a record
    pub fn position(&self, id: Uuid) -> Option<usize> {
        self.records.iter().position(|r| r.id == id)
    }

    /// Flip a successful record to rolled back; false otherwise
    pub fn mark_rolled_back(&mut self, id: Uuid) -> bool {
        match self.records.iter_mut().find(|r| r.id == id) {
            Some(record) if record.result == OperationResult::Success => {
                record.result = OperationResult::RolledBack;
                true
            }
            _ => false,
        }
    }

    /// Number of successful (not rolled back) operations
    pub fn applied_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.result == OperationResult::Success)
            .count()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the ledger is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Serialized ledger blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedLedger {
    /// Owning task
    pub task_id: Uuid,
    /// When it was saved
    pub saved_at: Timestamp,
    /// Most recent records
    pub records: Vec<OperationRecord>,
}

/// Key/value blob store for ledgers
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Write a blob
    async fn put(&self, key: &str, blob: String) -> Result<()>;

    /// Read a blob
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Delete a blob
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Stores each blob as a JSON file in a directory
#[derive(Debug, Clone)]
pub struct FileLedgerStore {
    base_path: PathBuf,
}

impl FileLedgerStore {
    /// Store rooted at `base_path` (created on first write)
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.base_path.join(format!("{}.json", file))
    }
}

#[async_trait]
impl LedgerStore for FileLedgerStore {
    async fn put(&self, key: &str, blob: String) -> Result<()> {
        tokio::fs::create_dir_all(&self.base_path).await?;
        tokio::fs::write(self.path_for(key), blob).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(tokio::fs::read_to_string(&path).await?))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }
}

/// In-process store
#[derive(Debug, Clone, Default)]
pub struct MemoryLedgerStore {
    blobs: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryLedgerStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn put(&self, key: &str, blob: String) -> Result<()> {
        self.blobs.lock().insert(key.to_string(), blob);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.blobs.lock().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.blobs.lock().remove(key);
        Ok(())
    }
}

/// Saves and loads ledgers under `gridwarden:ledger:<task-id>`
#[derive(Clone)]
pub struct LedgerPersistence {
    store: Arc<dyn LedgerStore>,
    max_records: usize,
    retention: chrono::Duration,
}

impl std::fmt::Debug for LedgerPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerPersistence")
            .field("max_records", &self.max_records)
            .field("retention", &self.retention)
            .finish()
    }
}

impl LedgerPersistence {
    /// Persistence keeping at most `max_records` records for `retention`
    pub fn new(store: Arc<dyn LedgerStore>, max_records: usize, retention: chrono::Duration) -> Self {
        Self {
            store,
            max_records: max_records.max(1),
            retention,
        }
    }

    /// Storage key of a task's ledger
    pub fn key(task_id: Uuid) -> String {
        format!("gridwarden:ledger:{}", task_id)
    }

    /// Save the most recent records
    pub async fn save(&self, task_id: Uuid, ledger: &OperationLedger) -> Result<()> {
        let records = ledger.records();
        let skip = records.len().saturating_sub(self.max_records);
        let blob = PersistedLedger {
            task_id,
            saved_at: now(),
            records: records[skip..].to_vec(),
        };
        let json = serde_json::to_string_pretty(&blob)?;
        self.store.put(&Self::key(task_id), json).await?;
        tracing::debug!(task_id = %task_id, records = blob.records.len(), "ledger persisted");
        Ok(())
    }

    /// Load a ledger, dropping records older than the retention window
    pub async fn load(&self, task_id: Uuid) -> Result<Option<PersistedLedger>> {
        let Some(json) = self.store.get(&Self::key(task_id)).await? else {
            return Ok(None);
        };
        let mut blob: PersistedLedger = serde_json::from_str(&json).map_err(|e| {
            WardenError::Serialization(e).context(format!("loading ledger for task {}", task_id))
        })?;
        let cutoff = now() - self.retention;
        let before = blob.records.len();
        blob.records.retain(|r| r.timestamp >= cutoff);
        if blob.records.len() < before {
            tracing::debug!(
                task_id = %task_id,
                expired = before - blob.records.len(),
                "discarded expired ledger records"
            );
        }
        Ok(Some(blob))
    }

    /// Delete a task's ledger
    pub async fn forget(&self, task_id: Uuid) -> Result<()> {
        self.store.delete(&Self::key(task_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::params_from;
    use serde_json::json;
    use tempfile::TempDir;

    fn ledger_with(n: usize) -> OperationLedger {
        let mut ledger = OperationLedger::new();
        for i in 0..n {
            ledger.append(
                "write_range",
                &params_from(json!({"i": i})),
                OperationResult::Success,
                None,
                None,
            );
        }
        ledger
    }

    #[test]
    fn only_success_can_be_rolled_back() {
        let mut ledger = OperationLedger::new();
        let ok = ledger.append("write_range", &Params::new(), OperationResult::Success, None, None);
        let failed = ledger.append("write_range", &Params::new(), OperationResult::Failed, None, None);

        assert!(ledger.mark_rolled_back(ok));
        assert!(!ledger.mark_rolled_back(ok));
        assert!(!ledger.mark_rolled_back(failed));
        assert_eq!(ledger.get(ok).unwrap().result, OperationResult::RolledBack);
        assert_eq!(ledger.applied_count(), 0);
    }

    #[tokio::test]
    async fn file_store_keeps_most_recent_records() {
        let dir = TempDir::new().unwrap();
        let persistence = LedgerPersistence::new(
            Arc::new(FileLedgerStore::new(dir.path())),
            3,
            chrono::Duration::hours(1),
        );
        let task_id = Uuid::new_v4();
        persistence.save(task_id, &ledger_with(5)).await.unwrap();

        let loaded = persistence.load(task_id).await.unwrap().unwrap();
        assert_eq!(loaded.task_id, task_id);
        assert_eq!(loaded.records.len(), 3);
        assert_eq!(loaded.records[0].tool_input["i"], json!(2));

        persistence.forget(task_id).await.unwrap();
        assert!(persistence.load(task_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_records_are_discarded_on_load() {
        let store = Arc::new(MemoryLedgerStore::new());
        let persistence = LedgerPersistence::new(store.clone(), 10, chrono::Duration::minutes(5));
        let task_id = Uuid::new_v4();

        let mut ledger = ledger_with(2);
        ledger.records[0].timestamp = now() - chrono::Duration::hours(2);
        persistence.save(task_id, &ledger).await.unwrap();

        let loaded = persistence.load(task_id).await.unwrap().unwrap();
        assert_eq!(loaded.records.len(), 1);
        let key = LedgerPersistence::key(task_id);
        assert!(key.starts_with("gridwarden:ledger:"));
        assert!(store.get(&key).await.unwrap().is_some());
    }
}
