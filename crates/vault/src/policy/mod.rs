//! Which fields of which record kinds hold protected amounts.
//!
//! The policy is loaded once at startup, either from a YAML file or from the
//! built-in household ledger defaults, and shared read-only afterwards.
//!
//! ```yaml
//! expense: [amount]
//! loan: [principal, balance, monthly_payment]
//! ```
//!
//! # Module invariants
//!
//! - **No crypto dependencies.** This module only names fields; it never
//!   touches values.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from policy loading and lookup.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The requested record kind has no entry in the policy.
    #[error("unknown record kind: {0}")]
    UnknownKind(String),

    /// The policy document is structurally valid YAML but breaks a rule.
    #[error("invalid field policy: {0}")]
    Invalid(String),

    /// The policy file could not be read.
    #[error("failed to read field policy {path}: {source}")]
    Io {
        /// Path that was read.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The policy file is not a YAML mapping of kind to field list.
    #[error("failed to parse field policy: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Static mapping from record kind to the ordered list of sensitive fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldEncryptionPolicy {
    kinds: BTreeMap<String, Vec<String>>,
}

impl FieldEncryptionPolicy {
    /// Build a policy from `(kind, fields)` pairs.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Invalid`] on empty names or duplicate fields.
    pub fn new<K, F, S>(entries: impl IntoIterator<Item = (K, F)>) -> Result<Self, PolicyError>
    where
        K: Into<String>,
        F: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let kinds = entries
            .into_iter()
            .map(|(kind, fields)| (kind.into(), fields.into_iter().map(Into::into).collect()))
            .collect();
        let policy = Self { kinds };
        policy.validate()?;
        Ok(policy)
    }

    /// The household ledger defaults.
    pub fn builtin() -> Self {
        let kinds = [
            ("account", &["balance"][..]),
            ("budget", &["quota", "spent"][..]),
            ("expense", &["amount"][..]),
            ("income", &["amount"][..]),
            ("loan", &["principal", "balance", "monthly_payment"][..]),
            ("savings_goal", &["target", "saved"][..]),
        ]
        .into_iter()
        .map(|(kind, fields)| {
            (
                kind.to_owned(),
                fields.iter().map(|f| (*f).to_owned()).collect(),
            )
        })
        .collect();
        Self { kinds }
    }

    /// Parse a YAML policy document.
    pub fn from_yaml_str(text: &str) -> Result<Self, PolicyError> {
        let policy: Self = serde_yaml::from_str(text)?;
        policy.validate()?;
        Ok(policy)
    }

    /// Read and parse a YAML policy file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// The sensitive fields of `kind`, in policy order.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::UnknownKind`] if `kind` is not configured.
    pub fn fields(&self, kind: &str) -> Result<&[String], PolicyError> {
        self.kinds
            .get(kind)
            .map(Vec::as_slice)
            .ok_or_else(|| PolicyError::UnknownKind(kind.to_owned()))
    }

    /// All configured kinds, sorted.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }

    fn validate(&self) -> Result<(), PolicyError> {
        for (kind, fields) in &self.kinds {
            if kind.trim().is_empty() {
                return Err(PolicyError::Invalid("record kind must not be empty".into()));
            }
            let mut seen = HashSet::new();
            for field in fields {
                if field.trim().is_empty() {
                    return Err(PolicyError::Invalid(format!(
                        "{kind}: field name must not be empty"
                    )));
                }
                if !seen.insert(field.as_str()) {
                    return Err(PolicyError::Invalid(format!(
                        "{kind}: field {field} listed twice"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for FieldEncryptionPolicy {
    fn default() -> Self {
        Self::builtin()
    }
}
