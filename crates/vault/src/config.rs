//! Configuration loading and validation for the ledger-vault service.
//!
//! All values are read from environment variables at startup. The process will
//! exit with a clear error message if any required variable is missing or invalid.

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::crypto::cipher::MAX_ITERATIONS;
use crate::crypto::kdf::MIN_ITERATIONS;

/// Validated service configuration.
#[derive(Clone, Deserialize)]
pub struct Config {
    /// Base64 master secret. Exactly one of this and `master_secret_arn` is required.
    pub master_secret: Option<String>,

    /// Secrets Manager ARN holding the master secret.
    pub master_secret_arn: Option<String>,

    /// Token expected in `X-Admin-Token` on `/admin/*` routes. **Required.**
    pub admin_token: String,

    /// Feature flag: encrypt new writes. Reads always decrypt.
    #[serde(default = "default_encryption_enabled")]
    pub encryption_enabled: bool,

    /// Accept an emergency master secret on the recovery route.
    #[serde(default)]
    pub allow_recovery_override: bool,

    /// YAML field policy. Built-in defaults when unset.
    pub policy_path: Option<String>,

    /// SQLite database file.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Port the HTTP server listens on.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// PBKDF2 rounds per derivation.
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,

    /// OTLP endpoint for span export. Logs only when unset.
    pub otel_exporter_otlp_endpoint: Option<String>,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Where the master secret comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterSecretSource<'a> {
    /// Base64 value taken directly from `MASTER_SECRET`.
    Inline(&'a str),
    /// Secrets Manager secret id from `MASTER_SECRET_ARN`.
    SecretsManager(&'a str),
}

fn default_encryption_enabled() -> bool {
    true
}
fn default_database_path() -> String {
    "ledger-vault.db".into()
}
fn default_listen_port() -> u16 {
    8080
}
fn default_kdf_iterations() -> u32 {
    MIN_ITERATIONS
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any required variable is absent or cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// The configured master secret source.
    ///
    /// Only meaningful after validation, which guarantees exactly one is set.
    pub fn master_secret_source(&self) -> Result<MasterSecretSource<'_>> {
        match (non_empty(&self.master_secret), non_empty(&self.master_secret_arn)) {
            (Some(inline), None) => Ok(MasterSecretSource::Inline(inline)),
            (None, Some(arn)) => Ok(MasterSecretSource::SecretsManager(arn)),
            (Some(_), Some(_)) => {
                anyhow::bail!("set only one of MASTER_SECRET and MASTER_SECRET_ARN")
            }
            (None, None) => anyhow::bail!(
                "MASTER_SECRET or MASTER_SECRET_ARN is required; encrypted fields cannot be served without it"
            ),
        }
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        self.master_secret_source()?;
        ensure_non_empty(&self.admin_token, "ADMIN_TOKEN")?;
        ensure_non_empty(&self.database_path, "DATABASE_PATH")?;

        if !(MIN_ITERATIONS..=MAX_ITERATIONS).contains(&self.kdf_iterations) {
            anyhow::bail!("KDF_ITERATIONS must be between {MIN_ITERATIONS} and {MAX_ITERATIONS}");
        }
        if self.listen_port == 0 {
            anyhow::bail!("LISTEN_PORT must be > 0");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("master_secret", &self.master_secret.as_ref().map(|_| "[REDACTED]"))
            .field("master_secret_arn", &self.master_secret_arn)
            .field("admin_token", &"[REDACTED]")
            .field("encryption_enabled", &self.encryption_enabled)
            .field("allow_recovery_override", &self.allow_recovery_override)
            .field("policy_path", &self.policy_path)
            .field("database_path", &self.database_path)
            .field("listen_port", &self.listen_port)
            .field("kdf_iterations", &self.kdf_iterations)
            .field("otel_exporter_otlp_endpoint", &self.otel_exporter_otlp_endpoint)
            .field("log_level", &self.log_level)
            .finish()
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            master_secret: Some("c2VjcmV0".into()),
            master_secret_arn: None,
            admin_token: "admin-token".into(),
            encryption_enabled: default_encryption_enabled(),
            allow_recovery_override: false,
            policy_path: None,
            database_path: default_database_path(),
            listen_port: default_listen_port(),
            kdf_iterations: default_kdf_iterations(),
            otel_exporter_otlp_endpoint: None,
            log_level: default_log_level(),
        }
    }

    #[test]
    fn defaults_are_correct() {
        assert!(default_encryption_enabled());
        assert_eq!(default_database_path(), "ledger-vault.db");
        assert_eq!(default_listen_port(), 8080);
        assert_eq!(default_kdf_iterations(), 100_000);
        assert_eq!(default_log_level(), "info");
    }

    #[test]
    fn validate_accepts_valid_config() {
        let cfg = valid();
        assert!(cfg.validate().is_ok());
        assert_eq!(
            cfg.master_secret_source().unwrap(),
            MasterSecretSource::Inline("c2VjcmV0")
        );
    }

    #[test]
    fn validate_rejects_missing_master_secret() {
        let cfg = Config {
            master_secret: Some("   ".into()),
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_two_master_secret_sources() {
        let cfg = Config {
            master_secret_arn: Some("arn:aws:secretsmanager:eu-west-1:1:secret:vault".into()),
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn secrets_manager_source() {
        let cfg = Config {
            master_secret: None,
            master_secret_arn: Some("vault/master".into()),
            ..valid()
        };
        assert_eq!(
            cfg.master_secret_source().unwrap(),
            MasterSecretSource::SecretsManager("vault/master")
        );
    }

    #[test]
    fn validate_rejects_empty_admin_token() {
        let cfg = Config {
            admin_token: "".into(),
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_weak_kdf() {
        let cfg = Config {
            kdf_iterations: 1_000,
            ..valid()
        };
        assert!(cfg.validate().is_err());

        let cfg = Config {
            kdf_iterations: MAX_ITERATIONS + 1,
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn debug_redacts_secrets() {
        let printed = format!("{:?}", valid());
        assert!(!printed.contains("c2VjcmV0"));
        assert!(!printed.contains("admin-token"));
    }
}
