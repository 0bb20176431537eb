use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a single field leaves the source system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldPolicy {
    #[default]
    Plaintext,
    /// Irreversible; usable for deduplication only.
    OneWayHash,
    /// Encrypted with the run key referenced by the manifest's key id.
    ReversibleEncrypt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportPolicy {
    pub primary_key: String,
    pub fields: BTreeMap<String, FieldPolicy>,
    pub default_policy: FieldPolicy,
    /// Source column holding the row's last-modified time.
    #[serde(default)]
    pub timestamp_field: Option<String>,
}

impl ExportPolicy {
    pub fn new(primary_key: impl Into<String>) -> Self {
        Self {
            primary_key: primary_key.into(),
            fields: BTreeMap::new(),
            default_policy: FieldPolicy::Plaintext,
            timestamp_field: None,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, policy: FieldPolicy) -> Self {
        self.fields.insert(name.into(), policy);
        self
    }

    pub fn with_default(mut self, policy: FieldPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn with_timestamp_field(mut self, field: impl Into<String>) -> Self {
        self.timestamp_field = Some(field.into());
        self
    }

    pub fn policy_for(&self, field: &str) -> FieldPolicy {
        self.fields.get(field).copied().unwrap_or(self.default_policy)
    }

    pub fn encrypts_anything(&self) -> bool {
        self.default_policy == FieldPolicy::ReversibleEncrypt
            || self.fields.values().any(|p| *p == FieldPolicy::ReversibleEncrypt)
    }
}
