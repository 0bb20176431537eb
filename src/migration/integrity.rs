//! Integrity Validator
//!
//! Content-addressed checksums over bundle bytes, plus schema/consistency
//! checks for bundles and manifests. Pure functions of their input; the
//! exporter seals with it and the importer verifies with it.

use sha2::{Digest, Sha256};

use super::model::{ExportBundle, ManifestEntry, MigrationManifest};
use super::SCHEMA_VERSION;
use crate::error::{AppError, Result};

const CHECKSUM_PREFIX: &str = "sha256:";

#[derive(Debug, Clone)]
pub struct IntegrityValidator {
    supported_versions: Vec<String>,
}

impl Default for IntegrityValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl IntegrityValidator {
    pub fn new() -> Self {
        Self {
            supported_versions: vec![SCHEMA_VERSION.to_string()],
        }
    }

    pub fn with_supported_versions(versions: Vec<String>) -> Self {
        Self {
            supported_versions: versions,
        }
    }

    /// `sha256:<hex>` digest of `bytes`.
    pub fn checksum(&self, bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        format!("{}{}", CHECKSUM_PREFIX, hex::encode(hasher.finalize()))
    }

    pub fn verify(&self, bytes: &[u8], digest: &str) -> bool {
        if !digest.starts_with(CHECKSUM_PREFIX) {
            return false;
        }
        self.checksum(bytes).eq_ignore_ascii_case(digest)
    }

    /// Canonical bytes of a bundle. Field maps are ordered, so the same bundle
    /// always serializes to the same bytes.
    pub fn canonical_bytes(&self, bundle: &ExportBundle) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(bundle).map_err(|e| {
            AppError::IntegrityError(format!(
                "cannot canonicalize bundle {}: {}",
                bundle.table_name, e
            ))
        })
    }

    /// Returns the canonical bytes together with their checksum.
    pub fn seal(&self, bundle: &ExportBundle) -> Result<(Vec<u8>, String)> {
        self.validate_bundle(bundle)?;
        let bytes = self.canonical_bytes(bundle)?;
        let checksum = self.checksum(&bytes);
        Ok((bytes, checksum))
    }

    pub fn validate_schema_version(&self, version: &str) -> Result<()> {
        if self.supported_versions.iter().any(|v| v == version) {
            Ok(())
        } else {
            Err(AppError::IntegrityError(format!(
                "unsupported schema version {} (supported: {})",
                version,
                self.supported_versions.join(", ")
            )))
        }
    }

    pub fn validate_bundle(&self, bundle: &ExportBundle) -> Result<()> {
        self.validate_schema_version(&bundle.schema_version)?;
        if !bundle.is_consistent() {
            return Err(AppError::IntegrityError(format!(
                "bundle {} declares {} records but carries {}",
                bundle.table_name,
                bundle.record_count,
                bundle.records.len()
            )));
        }
        Ok(())
    }

    /// Checks a decoded bundle against the manifest entry that describes it.
    pub fn validate_against_entry(&self, bundle: &ExportBundle, entry: &ManifestEntry) -> Result<()> {
        self.validate_bundle(bundle)?;
        if bundle.table_name != entry.table_name {
            return Err(AppError::IntegrityError(format!(
                "bundle is for table {} but manifest entry is {}",
                bundle.table_name, entry.table_name
            )));
        }
        if bundle.record_count != entry.record_count {
            return Err(AppError::IntegrityError(format!(
                "manifest expects {} records for {}, bundle has {}",
                entry.record_count, entry.table_name, bundle.record_count
            )));
        }
        Ok(())
    }

    pub fn validate_manifest(&self, manifest: &MigrationManifest) -> Result<()> {
        self.validate_schema_version(&manifest.schema_version)?;
        if !manifest.is_consistent() {
            return Err(AppError::IntegrityError(format!(
                "manifest {} total {} does not match its bundles",
                manifest.migration_id, manifest.total_records
            )));
        }
        Ok(())
    }
}
