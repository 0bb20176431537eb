//! Record migration from a legacy store into the new platform store.
//!
//! The exporter turns source rows into sealed, self-describing bundles (one per
//! table) plus a run manifest; the importer verifies those bundles and writes
//! them into the target store idempotently, keyed by each record's migration id.

pub mod exporter;
pub mod importer;
pub mod integrity;
pub mod model;
pub mod policy;
pub mod store;

use std::path::Path;

use crate::error::{AppError, Result};

/// Bundle/manifest schema version written by this build.
pub const SCHEMA_VERSION: &str = "1.0";

pub const MANIFEST_FILE: &str = "manifest.json";

pub fn bundle_file_name(table: &str) -> String {
    format!("{}.bundle.json", table)
}

/// Table names end up in file names; only plain identifiers are accepted.
pub(crate) fn validate_table_name(table: &str) -> Result<()> {
    let valid = !table.is_empty()
        && !table.starts_with('.')
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(AppError::ValidationFailed(format!("invalid table name: {:?}", table)))
    }
}

/// Writes to a sibling temp file and renames it into place, so readers never
/// observe a partially written file.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| AppError::IoError(format!("invalid output path {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

pub use exporter::{
    derive_migration_id, write_run, ExportRun, ExporterSettings, RecordExporter, SealedBundle,
    TableExport, FAILURES_FILE,
};
pub use importer::{read_manifest, verify_dir, BundleCheck, ImporterSettings, RecordImporter};
pub use integrity::IntegrityValidator;
pub use model::{
    ExportBundle, ExportFailure, ExportRecord, FieldValue, ImportReport, ManifestEntry,
    MigrationManifest, RecordError, TableCounts, TableImport,
};
pub use policy::{ExportPolicy, FieldPolicy};
pub use store::{InMemorySourceStore, InMemoryTargetStore, InsertOutcome, SourceRow, SourceStore, TargetRecord, TargetStore};
