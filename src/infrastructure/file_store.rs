use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::migration::store::{InsertOutcome, SourceRow, SourceStore, TargetRecord, TargetStore};

/// Legacy tables dumped as `<dir>/<table>.json`, each a JSON array of objects.
pub struct JsonDirSourceStore {
    dir: PathBuf,
}

impl JsonDirSourceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl SourceStore for JsonDirSourceStore {
    async fn read_table(&self, table: &str) -> Result<Vec<SourceRow>> {
        let path = self.dir.join(format!("{}.json", table));
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            AppError::SourceStoreError(format!("cannot read {}: {}", path.display(), e))
        })?;
        let rows: Vec<serde_json::Value> = serde_json::from_slice(&bytes).map_err(|e| {
            AppError::SourceStoreError(format!("{} is not a JSON array: {}", path.display(), e))
        })?;

        rows.into_iter()
            .enumerate()
            .map(|(i, row)| match row {
                serde_json::Value::Object(map) => Ok(map),
                _ => Err(AppError::SourceStoreError(format!(
                    "{} row {} is not an object",
                    path.display(),
                    i
                ))),
            })
            .collect()
    }
}

/// Append-only JSON-lines target, one `<dir>/<table>.jsonl` per table.
/// Each table's index is loaded on first use and kept in memory.
pub struct JsonDirTargetStore {
    dir: PathBuf,
    tables: Mutex<HashMap<String, HashMap<String, TargetRecord>>>,
}

impl JsonDirTargetStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            AppError::TargetStoreError(format!("cannot create {}: {}", dir.display(), e))
        })?;
        Ok(Self {
            dir,
            tables: Mutex::new(HashMap::new()),
        })
    }

    fn table_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", table))
    }

    async fn load_table(path: &Path) -> Result<HashMap<String, TargetRecord>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => {
                return Err(AppError::TargetStoreError(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        // Only newline-terminated lines were fully written.
        let complete = content.rfind('\n').map(|i| i + 1).unwrap_or(0);
        if complete < content.len() {
            warn!(
                path = %path.display(),
                dropped_bytes = content.len() - complete,
                "Discarding unterminated last line"
            );
            truncate(path, complete as u64).await?;
        }

        let mut records = HashMap::new();
        for line in content[..complete].lines().filter(|l| !l.trim().is_empty()) {
            let record: TargetRecord = serde_json::from_str(line).map_err(|e| {
                AppError::TargetStoreError(format!("corrupt line in {}: {}", path.display(), e))
            })?;
            records.entry(record.migration_id.clone()).or_insert(record);
        }
        debug!(path = %path.display(), records = records.len(), "Loaded target table");
        Ok(records)
    }
}

#[async_trait]
impl TargetStore for JsonDirTargetStore {
    async fn find_by_migration_id(&self, table: &str, migration_id: &str) -> Result<Option<TargetRecord>> {
        let mut tables = self.tables.lock().await;
        if !tables.contains_key(table) {
            let loaded = Self::load_table(&self.table_path(table)).await?;
            tables.insert(table.to_string(), loaded);
        }
        Ok(tables
            .get(table)
            .and_then(|records| records.get(migration_id))
            .cloned())
    }

    async fn insert_if_absent(&self, record: TargetRecord) -> Result<InsertOutcome> {
        let mut tables = self.tables.lock().await;
        if !tables.contains_key(&record.table) {
            let loaded = Self::load_table(&self.table_path(&record.table)).await?;
            tables.insert(record.table.clone(), loaded);
        }
        let Some(records) = tables.get_mut(&record.table) else {
            return Err(AppError::TargetStoreError(format!("table {} unavailable", record.table)));
        };
        if records.contains_key(&record.migration_id) {
            return Ok(InsertOutcome::AlreadyPresent);
        }

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let path = self.table_path(&record.table);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| AppError::TargetStoreError(format!("cannot open {}: {}", path.display(), e)))?;
        let prev_len = file
            .metadata()
            .await
            .map_err(|e| AppError::TargetStoreError(format!("cannot stat {}: {}", path.display(), e)))?
            .len();

        let written = match file.write_all(&line).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            drop(file);
            if let Err(truncate_err) = truncate(&path, prev_len).await {
                warn!(path = %path.display(), error = %truncate_err, "Could not drop partial line");
            }
            return Err(AppError::TargetStoreError(format!(
                "write to {} failed: {}",
                path.display(),
                e
            )));
        }

        records.insert(record.migration_id.clone(), record);
        Ok(InsertOutcome::Inserted)
    }
}

async fn truncate(path: &Path, len: u64) -> Result<()> {
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(|e| AppError::TargetStoreError(format!("cannot open {}: {}", path.display(), e)))?;
    file.set_len(len)
        .await
        .map_err(|e| AppError::TargetStoreError(format!("cannot truncate {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(id: &str) -> TargetRecord {
        TargetRecord {
            migration_id: id.to_string(),
            table: "users".to_string(),
            fields: serde_json::Map::new(),
            source_timestamp: Utc::now(),
            imported_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_source_reads_json_array() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("users.json"), r#"[{"id": 1}, {"id": 2}]"#)
            .await
            .unwrap();

        let rows = JsonDirSourceStore::new(dir.path()).read_table("users").await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_source_rejects_non_object_rows() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("users.json"), "[1, 2]").await.unwrap();

        let result = JsonDirSourceStore::new(dir.path()).read_table("users").await;
        assert!(matches!(result, Err(AppError::SourceStoreError(_))));
    }

    #[tokio::test]
    async fn test_target_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = JsonDirTargetStore::open(dir.path()).await.unwrap();
            assert_eq!(store.insert_if_absent(record("a")).await.unwrap(), InsertOutcome::Inserted);
        }

        let reopened = JsonDirTargetStore::open(dir.path()).await.unwrap();
        assert!(reopened.find_by_migration_id("users", "a").await.unwrap().is_some());
        assert_eq!(
            reopened.insert_if_absent(record("a")).await.unwrap(),
            InsertOutcome::AlreadyPresent
        );

        let content = tokio::fs::read_to_string(dir.path().join("users.jsonl")).await.unwrap();
        assert_eq!(content.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_torn_last_line_is_dropped_and_appends_stay_readable() {
        let dir = TempDir::new().unwrap();
        {
            let store = JsonDirTargetStore::open(dir.path()).await.unwrap();
            store.insert_if_absent(record("a")).await.unwrap();
        }
        let path = dir.path().join("users.jsonl");
        let mut file = tokio::fs::OpenOptions::new().append(true).open(&path).await.unwrap();
        file.write_all(br#"{"migrationId":"b","tab"#).await.unwrap();
        drop(file);

        let store = JsonDirTargetStore::open(dir.path()).await.unwrap();
        assert!(store.find_by_migration_id("users", "a").await.unwrap().is_some());
        assert!(store.find_by_migration_id("users", "b").await.unwrap().is_none());
        assert_eq!(store.insert_if_absent(record("b")).await.unwrap(), InsertOutcome::Inserted);

        let reopened = JsonDirTargetStore::open(dir.path()).await.unwrap();
        assert!(reopened.find_by_migration_id("users", "b").await.unwrap().is_some());
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.ends_with('\n'));
    }
}
