//! Record Exporter
//!
//! Reads rows from the source store, applies the per-field export policy and
//! produces one sealed bundle per table. A row that fails to transform is
//! recorded and skipped; a store-level failure aborts the table.

use chrono::{DateTime, Utc};
use futures::{stream, StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::integrity::IntegrityValidator;
use super::model::{ExportBundle, ExportFailure, ExportRecord, FieldValue, ManifestEntry, MigrationManifest};
use super::policy::{ExportPolicy, FieldPolicy};
use super::store::{SourceRow, SourceStore};
use super::{bundle_file_name, validate_table_name, write_atomic, MANIFEST_FILE, SCHEMA_VERSION};
use crate::error::{AppError, Result};
use crate::services::encryption::{hash_field, FieldCipher};

pub const FAILURES_FILE: &str = "export-failures.json";

/// Stable record identity: the same `(table_tag, primary_key)` always yields the same id.
pub fn derive_migration_id(table_tag: &str, primary_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(table_tag.as_bytes());
    hasher.update([0x1f]);
    hasher.update(primary_key.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct ExporterSettings {
    pub source_system: String,
    pub schema_version: String,
    pub key_id: Option<String>,
    pub hash_pepper: Option<String>,
    pub parallel_tables: usize,
}

impl Default for ExporterSettings {
    fn default() -> Self {
        Self {
            source_system: "legacy".to_string(),
            schema_version: SCHEMA_VERSION.to_string(),
            key_id: None,
            hash_pepper: None,
            parallel_tables: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TableExport {
    pub bundle: ExportBundle,
    pub failures: Vec<ExportFailure>,
}

/// A bundle together with the exact bytes its checksum covers.
#[derive(Debug, Clone)]
pub struct SealedBundle {
    pub bundle: ExportBundle,
    pub bytes: Vec<u8>,
    pub checksum: String,
}

impl SealedBundle {
    pub fn manifest_entry(&self) -> ManifestEntry {
        ManifestEntry {
            table_name: self.bundle.table_name.clone(),
            record_count: self.bundle.record_count,
            checksum: self.checksum.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportRun {
    pub manifest: MigrationManifest,
    pub bundles: Vec<SealedBundle>,
    pub failures: Vec<ExportFailure>,
}

pub struct RecordExporter {
    source: Arc<dyn SourceStore>,
    cipher: Arc<dyn FieldCipher>,
    validator: IntegrityValidator,
    settings: ExporterSettings,
}

impl RecordExporter {
    pub fn new(
        source: Arc<dyn SourceStore>,
        cipher: Arc<dyn FieldCipher>,
        settings: ExporterSettings,
    ) -> Self {
        Self {
            source,
            cipher,
            validator: IntegrityValidator::new(),
            settings,
        }
    }

    pub fn with_validator(mut self, validator: IntegrityValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Exports one table. Per-record failures land in `failures`; the returned
    /// bundle's `record_count` covers only the records that made it.
    pub async fn export(&self, table: &str, policy: &ExportPolicy) -> Result<TableExport> {
        validate_table_name(table)?;

        if policy.encrypts_anything() {
            // An unusable key would fail every row; treat it as systemic up front.
            let key_id = self.require_key_id()?;
            self.cipher.encrypt("", key_id).await?;
        }

        let rows = self.source.read_table(table).await?;
        let exported_at = Utc::now();
        debug!(table = table, rows = rows.len(), "Read source rows");

        let mut records = Vec::with_capacity(rows.len());
        let mut failures = Vec::new();
        let mut seen = HashSet::new();

        for row in &rows {
            match self.transform(table, row, policy, exported_at).await {
                Ok(record) if !seen.insert(record.migration_id.clone()) => {
                    failures.push(ExportFailure {
                        table: table.to_string(),
                        source_key: primary_key_of(row, &policy.primary_key).ok(),
                        message: "duplicate primary key".to_string(),
                    });
                }
                Ok(record) => records.push(record),
                Err(e) => {
                    let source_key = primary_key_of(row, &policy.primary_key).ok();
                    warn!(table = table, source_key = ?source_key, error = %e, "Skipping record that failed to transform");
                    failures.push(ExportFailure {
                        table: table.to_string(),
                        source_key,
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            table = table,
            exported = records.len(),
            failed = failures.len(),
            "📦 Table exported"
        );

        Ok(TableExport {
            bundle: ExportBundle::new(table, &self.settings.schema_version, exported_at, records),
            failures,
        })
    }

    pub fn seal(&self, export: TableExport) -> Result<(SealedBundle, Vec<ExportFailure>)> {
        let (bytes, checksum) = self.validator.seal(&export.bundle)?;
        Ok((
            SealedBundle {
                bundle: export.bundle,
                bytes,
                checksum,
            },
            export.failures,
        ))
    }

    /// Exports every table, up to `parallel_tables` at a time. Any systemic
    /// failure aborts the run before a manifest exists.
    pub async fn export_all(&self, tables: &[(String, ExportPolicy)]) -> Result<ExportRun> {
        let sealed: Vec<(SealedBundle, Vec<ExportFailure>)> = stream::iter(tables.iter())
            .map(|(table, policy)| async move {
                let export = self.export(table, policy).await?;
                self.seal(export)
            })
            .buffered(self.settings.parallel_tables.max(1))
            .try_collect()
            .await?;

        let mut manifest = MigrationManifest::new(
            &self.settings.source_system,
            &self.settings.schema_version,
            self.settings.key_id.clone(),
        );
        let mut bundles = Vec::with_capacity(sealed.len());
        let mut failures = Vec::new();
        for (bundle, table_failures) in sealed {
            manifest.push_bundle(bundle.manifest_entry());
            bundles.push(bundle);
            failures.extend(table_failures);
        }

        info!(
            migration_id = %manifest.migration_id,
            tables = manifest.bundles.len(),
            total_records = manifest.total_records,
            failures = failures.len(),
            "✅ Export run complete"
        );

        Ok(ExportRun {
            manifest,
            bundles,
            failures,
        })
    }

    async fn transform(
        &self,
        table: &str,
        row: &SourceRow,
        policy: &ExportPolicy,
        exported_at: DateTime<Utc>,
    ) -> Result<ExportRecord> {
        let primary_key = primary_key_of(row, &policy.primary_key)?;
        let migration_id = derive_migration_id(table, &primary_key);

        let mut fields = BTreeMap::new();
        for (name, value) in row {
            let exported = if value.is_null() {
                FieldValue::Plaintext(serde_json::Value::Null)
            } else {
                match policy.policy_for(name) {
                    FieldPolicy::Plaintext => FieldValue::Plaintext(value.clone()),
                    FieldPolicy::OneWayHash => {
                        let text = scalar_text(name, value)?;
                        FieldValue::OneWayHash(hash_field(&text, self.settings.hash_pepper.as_deref()))
                    }
                    FieldPolicy::ReversibleEncrypt => {
                        let key_id = self.require_key_id()?;
                        let encoded = serde_json::to_string(value)?;
                        FieldValue::Encrypted(self.cipher.encrypt(&encoded, key_id).await?)
                    }
                }
            };
            fields.insert(name.clone(), exported);
        }

        let source_timestamp = match &policy.timestamp_field {
            Some(field) => match row.get(field) {
                None | Some(serde_json::Value::Null) => exported_at,
                Some(value) => parse_timestamp(value).ok_or_else(|| {
                    AppError::TransformError(format!("field {} is not a timestamp", field))
                })?,
            },
            None => exported_at,
        };

        Ok(ExportRecord {
            migration_id,
            fields,
            source_timestamp,
        })
    }

    fn require_key_id(&self) -> Result<&str> {
        self.settings.key_id.as_deref().ok_or_else(|| {
            AppError::ConfigError("reversible_encrypt field without a configured key id".to_string())
        })
    }
}

/// Writes every bundle, then the failures list, then the manifest. Each file
/// appears under its final name only once fully written.
pub async fn write_run(run: &ExportRun, dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;

    for bundle in &run.bundles {
        let path = dir.join(bundle_file_name(&bundle.bundle.table_name));
        write_atomic(&path, &bundle.bytes).await?;
        debug!(path = %path.display(), "Bundle written");
    }

    if !run.failures.is_empty() {
        let failures = serde_json::to_vec_pretty(&run.failures)?;
        write_atomic(&dir.join(FAILURES_FILE), &failures).await?;
    }

    let manifest = serde_json::to_vec_pretty(&run.manifest)?;
    write_atomic(&dir.join(MANIFEST_FILE), &manifest).await?;

    info!(dir = %dir.display(), "📝 Export bundles and manifest written");
    Ok(())
}

fn primary_key_of(row: &SourceRow, field: &str) -> Result<String> {
    match row.get(field) {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
        _ => Err(AppError::TransformError(format!(
            "missing or invalid primary key {}",
            field
        ))),
    }
}

fn scalar_text(name: &str, value: &serde_json::Value) -> Result<String> {
    match value {
        serde_json::Value::String(s) => Ok(s.clone()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Bool(b) => Ok(b.to_string()),
        _ => Err(AppError::TransformError(format!(
            "field {} holds a nested value and cannot be hashed",
            name
        ))),
    }
}

fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    }
}
