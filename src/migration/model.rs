use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A field value as carried inside a bundle, tagged with the policy applied to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Plaintext(serde_json::Value),
    OneWayHash(String),
    /// Base64 nonce+ciphertext of the JSON-encoded original value.
    Encrypted(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRecord {
    pub migration_id: String,
    pub fields: BTreeMap<String, FieldValue>,
    pub source_timestamp: DateTime<Utc>,
}

/// One table's export artifact. Immutable once sealed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportBundle {
    pub schema_version: String,
    pub exported_at: DateTime<Utc>,
    pub table_name: String,
    pub record_count: usize,
    #[serde(rename = "data")]
    pub records: Vec<ExportRecord>,
}

impl ExportBundle {
    pub fn new(
        table_name: impl Into<String>,
        schema_version: impl Into<String>,
        exported_at: DateTime<Utc>,
        records: Vec<ExportRecord>,
    ) -> Self {
        Self {
            schema_version: schema_version.into(),
            exported_at,
            table_name: table_name.into(),
            record_count: records.len(),
            records,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.record_count == self.records.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub table_name: String,
    pub record_count: usize,
    pub checksum: String,
}

/// Run-level index over every bundle of one export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationManifest {
    pub migration_id: String,
    pub source_system: String,
    pub schema_version: String,
    pub exported_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    pub bundles: Vec<ManifestEntry>,
    pub total_records: usize,
}

impl MigrationManifest {
    pub fn new(
        source_system: impl Into<String>,
        schema_version: impl Into<String>,
        key_id: Option<String>,
    ) -> Self {
        Self {
            migration_id: Uuid::new_v4().to_string(),
            source_system: source_system.into(),
            schema_version: schema_version.into(),
            exported_at: Utc::now(),
            key_id,
            bundles: Vec::new(),
            total_records: 0,
        }
    }

    pub fn push_bundle(&mut self, entry: ManifestEntry) {
        self.total_records += entry.record_count;
        self.bundles.push(entry);
    }

    pub fn entry(&self, table: &str) -> Option<&ManifestEntry> {
        self.bundles.iter().find(|b| b.table_name == table)
    }

    pub fn is_consistent(&self) -> bool {
        self.total_records == self.bundles.iter().map(|b| b.record_count).sum::<usize>()
    }
}

/// A record the exporter had to skip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportFailure {
    pub table: String,
    pub source_key: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCounts {
    pub imported: usize,
    pub skipped: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordError {
    pub table: String,
    pub record_id: String,
    pub message: String,
}

/// The importer's result for a single table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableImport {
    pub table: String,
    pub counts: TableCounts,
    pub errors: Vec<RecordError>,
}

impl TableImport {
    pub fn new(table: impl Into<String>, total: usize) -> Self {
        Self {
            table: table.into(),
            counts: TableCounts {
                total,
                ..TableCounts::default()
            },
            errors: Vec::new(),
        }
    }

    pub fn record_error(&mut self, record_id: impl Into<String>, message: impl Into<String>) {
        self.errors.push(RecordError {
            table: self.table.clone(),
            record_id: record_id.into(),
            message: message.into(),
        });
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub import_id: String,
    pub migration_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub per_table: BTreeMap<String, TableCounts>,
    pub errors: Vec<RecordError>,
    pub success: bool,
}

impl ImportReport {
    pub fn new(migration_id: impl Into<String>) -> Self {
        Self {
            import_id: Uuid::new_v4().to_string(),
            migration_id: migration_id.into(),
            started_at: Utc::now(),
            finished_at: None,
            per_table: BTreeMap::new(),
            errors: Vec::new(),
            success: false,
        }
    }

    pub fn merge(&mut self, fragment: TableImport) {
        self.per_table.insert(fragment.table, fragment.counts);
        self.errors.extend(fragment.errors);
    }

    /// Seals the report; `success` holds iff no error was collected.
    pub fn finish(mut self) -> Self {
        self.success = self.errors.is_empty();
        self.finished_at = Some(Utc::now());
        self
    }

    pub fn file_name(&self) -> String {
        format!("import-report-{}.json", self.import_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_totals_track_bundles() {
        let mut manifest = MigrationManifest::new("legacy", "1.0", None);
        manifest.push_bundle(ManifestEntry {
            table_name: "users".to_string(),
            record_count: 3,
            checksum: "sha256:aa".to_string(),
        });
        manifest.push_bundle(ManifestEntry {
            table_name: "events".to_string(),
            record_count: 2,
            checksum: "sha256:bb".to_string(),
        });

        assert_eq!(manifest.total_records, 5);
        assert!(manifest.is_consistent());
        assert_eq!(manifest.entry("events").map(|e| e.record_count), Some(2));
    }

    #[test]
    fn test_bundle_serializes_records_as_data() {
        let bundle = ExportBundle::new("events", "1.0", Utc::now(), vec![]);
        let json = serde_json::to_value(&bundle).unwrap();

        assert!(json.get("data").is_some());
        assert_eq!(json["recordCount"], 0);
        assert_eq!(json["tableName"], "events");
    }

    #[test]
    fn test_report_success_only_without_errors() {
        let mut report = ImportReport::new("run-1");
        report.merge(TableImport::new("users", 0));
        assert!(report.clone().finish().success);

        let mut failing = TableImport::new("events", 1);
        failing.record_error("abc", "write failed");
        report.merge(failing);
        let report = report.finish();
        assert!(!report.success);
        assert_eq!(report.errors[0].table, "events");
    }

    #[test]
    fn test_field_value_tagging() {
        let value = FieldValue::OneWayHash("deadbeef".to_string());
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json["kind"], "one_way_hash");
        assert_eq!(json["value"], "deadbeef");
    }
}
