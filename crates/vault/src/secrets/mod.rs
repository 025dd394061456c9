//! Master secret loading.
//!
//! The master secret is read exactly once at startup, from the environment or
//! from AWS Secrets Manager, and handed to the cipher as an explicit
//! dependency. Nothing below this module reads it from the process environment.
//!
//! # Security invariants
//!
//! - The master secret is **never** written to disk, logged, or included in traces.
//! - A missing or empty secret is fatal; there is no fallback key.

use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use tracing::info;

use crate::config::{Config, MasterSecretSource};
use crate::crypto::MasterSecret;

/// Resolve the configured master secret.
///
/// # Errors
///
/// Returns an error if the secret cannot be fetched, is not valid base64, or
/// is empty.
pub async fn load_master_secret(cfg: &Config) -> Result<MasterSecret> {
    match cfg.master_secret_source()? {
        MasterSecretSource::Inline(encoded) => {
            let master = MasterSecret::from_base64(encoded).context("MASTER_SECRET is unusable")?;
            info!(source = "environment", "master secret loaded");
            Ok(master)
        }
        MasterSecretSource::SecretsManager(secret_id) => {
            let master = fetch_from_secrets_manager(secret_id).await?;
            info!(source = "secrets_manager", "master secret loaded");
            Ok(master)
        }
    }
}

/// Fetch the master secret from Secrets Manager.
///
/// A binary secret is used as-is; a string secret must be base64.
async fn fetch_from_secrets_manager(secret_id: &str) -> Result<MasterSecret> {
    let sdk = aws_config::defaults(BehaviorVersion::latest()).load().await;
    let client = aws_sdk_secretsmanager::Client::new(&sdk);

    let secret = client
        .get_secret_value()
        .secret_id(secret_id)
        .send()
        .await
        .context("failed to fetch master secret from Secrets Manager")?;

    let master = if let Some(blob) = secret.secret_binary() {
        MasterSecret::new(blob.as_ref().to_vec())
    } else if let Some(text) = secret.secret_string() {
        MasterSecret::from_base64(text)
    } else {
        anyhow::bail!("master secret in Secrets Manager has no value");
    };
    master.context("master secret from Secrets Manager is unusable")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(master_secret: Option<&str>) -> Config {
        Config {
            master_secret: master_secret.map(Into::into),
            master_secret_arn: None,
            admin_token: "t".into(),
            encryption_enabled: true,
            allow_recovery_override: false,
            policy_path: None,
            database_path: "db".into(),
            listen_port: 8080,
            kdf_iterations: 100_000,
            otel_exporter_otlp_endpoint: None,
            log_level: "info".into(),
        }
    }

    #[tokio::test]
    async fn inline_secret_is_decoded() {
        let master = load_master_secret(&cfg(Some("bWFzdGVy"))).await.unwrap();
        assert_eq!(master.expose(), b"master");
    }

    #[tokio::test]
    async fn invalid_inline_secret_is_fatal() {
        assert!(load_master_secret(&cfg(Some("%%%"))).await.is_err());
    }

    #[tokio::test]
    async fn missing_secret_is_fatal() {
        assert!(load_master_secret(&cfg(None)).await.is_err());
    }
}
