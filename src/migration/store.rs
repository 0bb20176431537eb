use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::{AppError, Result};

/// A raw row as read from the legacy store.
pub type SourceRow = serde_json::Map<String, serde_json::Value>;

/// Read-only access to the legacy store.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// All rows of `table`. An unreachable store or unknown table is a systemic error.
    async fn read_table(&self, table: &str) -> Result<Vec<SourceRow>>;
}

/// A record as written into the new platform store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRecord {
    pub migration_id: String,
    pub table: String,
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub source_timestamp: DateTime<Utc>,
    pub imported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Another writer got there first; the existing record was left untouched.
    AlreadyPresent,
}

/// Write access to the new store. No delete capability is required.
#[async_trait]
pub trait TargetStore: Send + Sync {
    async fn find_by_migration_id(&self, table: &str, migration_id: &str) -> Result<Option<TargetRecord>>;

    /// Atomic upsert-if-absent keyed by `(table, migration_id)`.
    async fn insert_if_absent(&self, record: TargetRecord) -> Result<InsertOutcome>;
}

#[derive(Default)]
pub struct InMemorySourceStore {
    tables: HashMap<String, Vec<SourceRow>>,
}

impl InMemorySourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: impl Into<String>, rows: Vec<SourceRow>) -> Self {
        self.tables.insert(table.into(), rows);
        self
    }
}

#[async_trait]
impl SourceStore for InMemorySourceStore {
    async fn read_table(&self, table: &str) -> Result<Vec<SourceRow>> {
        self.tables
            .get(table)
            .cloned()
            .ok_or_else(|| AppError::SourceStoreError(format!("table {} not found", table)))
    }
}

#[derive(Default)]
pub struct InMemoryTargetStore {
    records: RwLock<HashMap<(String, String), TargetRecord>>,
}

impl InMemoryTargetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Records of one table ordered by migration id, for state comparisons.
    pub async fn table_snapshot(&self, table: &str) -> Vec<TargetRecord> {
        let records = self.records.read().await;
        let mut rows: Vec<TargetRecord> = records
            .iter()
            .filter(|((t, _), _)| t == table)
            .map(|(_, r)| r.clone())
            .collect();
        rows.sort_by(|a, b| a.migration_id.cmp(&b.migration_id));
        rows
    }
}

#[async_trait]
impl TargetStore for InMemoryTargetStore {
    async fn find_by_migration_id(&self, table: &str, migration_id: &str) -> Result<Option<TargetRecord>> {
        let records = self.records.read().await;
        Ok(records
            .get(&(table.to_string(), migration_id.to_string()))
            .cloned())
    }

    async fn insert_if_absent(&self, record: TargetRecord) -> Result<InsertOutcome> {
        let mut records = self.records.write().await;
        let key = (record.table.clone(), record.migration_id.clone());
        if records.contains_key(&key) {
            return Ok(InsertOutcome::AlreadyPresent);
        }
        records.insert(key, record);
        Ok(InsertOutcome::Inserted)
    }
}
