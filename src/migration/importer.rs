//! Record Importer
//!
//! Verifies each bundle against its manifest entry before any write, then
//! inserts records keyed by migration id. Re-running an import against the
//! same bundles changes nothing.

use chrono::Utc;
use futures::{stream, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::integrity::IntegrityValidator;
use super::model::{ExportBundle, ExportRecord, FieldValue, ImportReport, ManifestEntry, MigrationManifest, TableImport};
use super::store::{InsertOutcome, TargetRecord, TargetStore};
use super::{bundle_file_name, validate_table_name, write_atomic, MANIFEST_FILE};
use crate::error::{AppError, Result};
use crate::services::encryption::FieldCipher;

#[derive(Debug, Clone)]
pub struct ImporterSettings {
    /// Source table name to target table name. Unmapped tables keep their name.
    pub table_mappings: HashMap<String, String>,
    pub parallel_tables: usize,
}

impl Default for ImporterSettings {
    fn default() -> Self {
        Self {
            table_mappings: HashMap::new(),
            parallel_tables: 4,
        }
    }
}

/// Outcome of checking one bundle file without importing it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleCheck {
    pub table: String,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub struct RecordImporter {
    target: Arc<dyn TargetStore>,
    cipher: Arc<dyn FieldCipher>,
    validator: IntegrityValidator,
    settings: ImporterSettings,
}

impl RecordImporter {
    pub fn new(
        target: Arc<dyn TargetStore>,
        cipher: Arc<dyn FieldCipher>,
        settings: ImporterSettings,
    ) -> Self {
        Self {
            target,
            cipher,
            validator: IntegrityValidator::new(),
            settings,
        }
    }

    pub fn with_validator(mut self, validator: IntegrityValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn target_table<'a>(&'a self, table: &'a str) -> &'a str {
        self.settings
            .table_mappings
            .get(table)
            .map(String::as_str)
            .unwrap_or(table)
    }

    /// Imports one bundle. A bundle that fails verification has every record
    /// reported and nothing written. Per-record failures never stop the table.
    /// A failing lookup against the target store stops the table, and the
    /// records not yet processed are reported as errors.
    pub async fn import(
        &self,
        bytes: &[u8],
        entry: &ManifestEntry,
        key_id: Option<&str>,
    ) -> Result<TableImport> {
        let mut result = TableImport::new(&entry.table_name, entry.record_count);

        if !self.validator.verify(bytes, &entry.checksum) {
            warn!(table = %entry.table_name, "❌ Bundle checksum mismatch, rejecting table");
            reject_all(&mut result, bytes, "checksum mismatch");
            return Ok(result);
        }

        let bundle: ExportBundle = match serde_json::from_slice(bytes) {
            Ok(bundle) => bundle,
            Err(e) => {
                reject_all(&mut result, bytes, &format!("malformed bundle: {}", e));
                return Ok(result);
            }
        };

        if let Err(e) = self.validator.validate_against_entry(&bundle, entry) {
            warn!(table = %entry.table_name, error = %e, "❌ Bundle failed validation, rejecting table");
            reject_all(&mut result, bytes, &e.to_string());
            return Ok(result);
        }

        let target_table = self.target_table(&bundle.table_name).to_string();

        for (index, record) in bundle.records.iter().enumerate() {
            let existing = match self
                .target
                .find_by_migration_id(&target_table, &record.migration_id)
                .await
            {
                Ok(existing) => existing,
                Err(e) => {
                    error!(
                        table = %target_table,
                        pending = bundle.records.len() - index,
                        error = %e,
                        "❌ Target store lookup failed, stopping table"
                    );
                    let message = format!("target store unavailable: {}", e);
                    for pending in &bundle.records[index..] {
                        result.record_error(&pending.migration_id, message.as_str());
                    }
                    break;
                }
            };
            if existing.is_some() {
                result.counts.skipped += 1;
                continue;
            }

            let fields = match self.restore_fields(record, key_id).await {
                Ok(fields) => fields,
                Err(e) => {
                    result.record_error(&record.migration_id, e.to_string());
                    continue;
                }
            };

            let target_record = TargetRecord {
                migration_id: record.migration_id.clone(),
                table: target_table.clone(),
                fields,
                source_timestamp: record.source_timestamp,
                imported_at: Utc::now(),
            };

            match self.target.insert_if_absent(target_record).await {
                Ok(InsertOutcome::Inserted) => result.counts.imported += 1,
                Ok(InsertOutcome::AlreadyPresent) => result.counts.skipped += 1,
                Err(e) => {
                    warn!(
                        table = %target_table,
                        migration_id = %record.migration_id,
                        error = %e,
                        "Record write failed"
                    );
                    result.record_error(&record.migration_id, e.to_string());
                }
            }
        }

        info!(
            table = %entry.table_name,
            target_table = %target_table,
            imported = result.counts.imported,
            skipped = result.counts.skipped,
            errors = result.errors.len(),
            "📥 Table imported"
        );

        Ok(result)
    }

    /// Imports every bundle listed in `dir/manifest.json` and writes the
    /// report next to it. Only an unreadable or invalid manifest is an `Err`;
    /// a table that cannot be imported shows up in the report.
    pub async fn import_dir(&self, dir: &Path) -> Result<ImportReport> {
        let manifest = read_manifest(dir, &self.validator).await?;
        let key_id = manifest.key_id.as_deref();

        info!(
            migration_id = %manifest.migration_id,
            tables = manifest.bundles.len(),
            "🔄 Starting import"
        );

        let fragments: Vec<TableImport> = stream::iter(manifest.bundles.iter())
            .map(|entry| async move {
                if let Err(e) = validate_table_name(&entry.table_name) {
                    let mut rejected = TableImport::new(&entry.table_name, entry.record_count);
                    rejected.record_error("*", e.to_string());
                    return rejected;
                }
                let path = dir.join(bundle_file_name(&entry.table_name));
                let bytes = match tokio::fs::read(&path).await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let mut missing = TableImport::new(&entry.table_name, entry.record_count);
                        missing.record_error("*", format!("bundle file {} unreadable: {}", path.display(), e));
                        return missing;
                    }
                };
                match self.import(&bytes, entry, key_id).await {
                    Ok(fragment) => fragment,
                    Err(e) => {
                        error!(table = %entry.table_name, error = %e, "❌ Table import failed");
                        let mut failed = TableImport::new(&entry.table_name, entry.record_count);
                        failed.record_error("*", e.to_string());
                        failed
                    }
                }
            })
            .buffer_unordered(self.settings.parallel_tables.max(1))
            .collect()
            .await;

        let mut report = ImportReport::new(&manifest.migration_id);
        for fragment in fragments {
            report.merge(fragment);
        }
        let report = report.finish();

        let bytes = serde_json::to_vec_pretty(&report)?;
        write_atomic(&dir.join(report.file_name()), &bytes).await?;

        if report.success {
            info!(import_id = %report.import_id, "✅ Import complete");
        } else {
            error!(
                import_id = %report.import_id,
                errors = report.errors.len(),
                "Import finished with errors"
            );
        }

        Ok(report)
    }

    async fn restore_fields(
        &self,
        record: &ExportRecord,
        key_id: Option<&str>,
    ) -> Result<serde_json::Map<String, serde_json::Value>> {
        let mut fields = serde_json::Map::new();
        for (name, value) in &record.fields {
            let restored = match value {
                FieldValue::Plaintext(v) => v.clone(),
                FieldValue::OneWayHash(digest) => serde_json::Value::String(digest.clone()),
                FieldValue::Encrypted(ciphertext) => {
                    let key_id = key_id.ok_or_else(|| {
                        AppError::EncryptionError("bundle carries encrypted fields but no key id".to_string())
                    })?;
                    let plaintext = self.cipher.decrypt(ciphertext, key_id).await?;
                    serde_json::from_str(&plaintext)?
                }
            };
            fields.insert(name.clone(), restored);
        }
        Ok(fields)
    }
}

fn reject_all(result: &mut TableImport, bytes: &[u8], message: &str) {
    match serde_json::from_slice::<ExportBundle>(bytes) {
        Ok(bundle) if !bundle.records.is_empty() => {
            for record in &bundle.records {
                result.record_error(&record.migration_id, message);
            }
        }
        _ => result.record_error("*", message),
    }
}

pub async fn read_manifest(dir: &Path, validator: &IntegrityValidator) -> Result<MigrationManifest> {
    let path = dir.join(MANIFEST_FILE);
    let bytes = tokio::fs::read(&path).await.map_err(|e| {
        AppError::IntegrityError(format!("manifest {} unreadable: {}", path.display(), e))
    })?;
    let manifest: MigrationManifest = serde_json::from_slice(&bytes)
        .map_err(|e| AppError::IntegrityError(format!("manifest is malformed: {}", e)))?;
    validator.validate_manifest(&manifest)?;
    Ok(manifest)
}

/// Checks every bundle in `dir` against the manifest without touching a store.
pub async fn verify_dir(dir: &Path, validator: &IntegrityValidator) -> Result<Vec<BundleCheck>> {
    let manifest = read_manifest(dir, validator).await?;
    let mut checks = Vec::with_capacity(manifest.bundles.len());

    for entry in &manifest.bundles {
        let outcome = verify_entry(dir, entry, validator).await;
        checks.push(BundleCheck {
            table: entry.table_name.clone(),
            valid: outcome.is_ok(),
            message: outcome.err().map(|e| e.to_string()),
        });
    }

    Ok(checks)
}

async fn verify_entry(dir: &Path, entry: &ManifestEntry, validator: &IntegrityValidator) -> Result<()> {
    validate_table_name(&entry.table_name)?;
    let bytes = tokio::fs::read(dir.join(bundle_file_name(&entry.table_name))).await?;
    if !validator.verify(&bytes, &entry.checksum) {
        return Err(AppError::IntegrityError("checksum mismatch".to_string()));
    }
    let bundle: ExportBundle = serde_json::from_slice(&bytes)?;
    validator.validate_against_entry(&bundle, entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::store::InMemoryTargetStore;
    use crate::services::encryption::AesGcmFieldCipher;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn bundle_with(fields: BTreeMap<String, FieldValue>) -> ExportBundle {
        let record = ExportRecord {
            migration_id: "m-1".to_string(),
            fields,
            source_timestamp: Utc::now(),
        };
        ExportBundle::new("users", crate::migration::SCHEMA_VERSION, Utc::now(), vec![record])
    }

    fn sealed(bundle: &ExportBundle) -> (Vec<u8>, ManifestEntry) {
        let (bytes, checksum) = IntegrityValidator::new().seal(bundle).unwrap();
        let entry = ManifestEntry {
            table_name: bundle.table_name.clone(),
            record_count: bundle.record_count,
            checksum,
        };
        (bytes, entry)
    }

    fn importer(target: Arc<InMemoryTargetStore>, cipher: AesGcmFieldCipher) -> RecordImporter {
        RecordImporter::new(target, Arc::new(cipher), ImporterSettings::default())
    }

    #[tokio::test]
    async fn test_decrypts_encrypted_fields_back_to_original_type() {
        let cipher = AesGcmFieldCipher::with_key("k1", &AesGcmFieldCipher::generate_key()).unwrap();
        let ciphertext = cipher.encrypt("42", "k1").await.unwrap();

        let mut fields = BTreeMap::new();
        fields.insert("age".to_string(), FieldValue::Encrypted(ciphertext));
        fields.insert("name".to_string(), FieldValue::Plaintext(json!("Ada")));
        let (bytes, entry) = sealed(&bundle_with(fields));

        let target = Arc::new(InMemoryTargetStore::new());
        let result = importer(target.clone(), cipher)
            .import(&bytes, &entry, Some("k1"))
            .await
            .unwrap();

        assert_eq!(result.counts.imported, 1);
        let stored = target.find_by_migration_id("users", "m-1").await.unwrap().unwrap();
        assert_eq!(stored.fields["age"], json!(42));
        assert_eq!(stored.fields["name"], json!("Ada"));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_writes_nothing() {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), FieldValue::Plaintext(json!("Ada")));
        let (bytes, mut entry) = sealed(&bundle_with(fields));
        entry.checksum = IntegrityValidator::new().checksum(b"something else");

        let target = Arc::new(InMemoryTargetStore::new());
        let result = importer(target.clone(), AesGcmFieldCipher::new())
            .import(&bytes, &entry, None)
            .await
            .unwrap();

        assert_eq!(result.counts.imported, 0);
        assert_eq!(result.counts.total, 1);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].record_id, "m-1");
        assert!(target.is_empty().await);
    }

    #[tokio::test]
    async fn test_encrypted_field_without_key_id_is_a_record_error() {
        let mut fields = BTreeMap::new();
        fields.insert("ssn".to_string(), FieldValue::Encrypted("AAAA".to_string()));
        let (bytes, entry) = sealed(&bundle_with(fields));

        let target = Arc::new(InMemoryTargetStore::new());
        let result = importer(target.clone(), AesGcmFieldCipher::new())
            .import(&bytes, &entry, None)
            .await
            .unwrap();

        assert_eq!(result.counts.imported, 0);
        assert_eq!(result.errors.len(), 1);
        assert!(target.is_empty().await);
    }

    #[tokio::test]
    async fn test_table_mapping_redirects_writes() {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), FieldValue::Plaintext(json!("Ada")));
        let (bytes, entry) = sealed(&bundle_with(fields));

        let target = Arc::new(InMemoryTargetStore::new());
        let mut settings = ImporterSettings::default();
        settings
            .table_mappings
            .insert("users".to_string(), "accounts".to_string());
        let importer = RecordImporter::new(target.clone(), Arc::new(AesGcmFieldCipher::new()), settings);

        importer.import(&bytes, &entry, None).await.unwrap();
        assert!(target.find_by_migration_id("accounts", "m-1").await.unwrap().is_some());
        assert!(target.find_by_migration_id("users", "m-1").await.unwrap().is_none());
    }
}
