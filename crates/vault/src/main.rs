//! `ledger-vault` — service binary entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise telemetry (JSON logs, optional OTLP spans).
//! 3. Load the master secret from the environment or Secrets Manager.
//! 4. Load the field encryption policy.
//! 5. Open the SQLite record store.
//! 6. Build the cipher, codec, and migration driver.
//! 7. Build the Axum router and start the HTTP server.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use vault::codec::RecordCodec;
use vault::config::Config;
use vault::crypto::FieldCipher;
use vault::policy::FieldEncryptionPolicy;
use vault::server::{self, state::AppState};
use vault::store::SqliteStore;
use vault::{secrets, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init_telemetry(cfg.otel_exporter_otlp_endpoint.as_deref(), &cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen_port = cfg.listen_port,
        encryption_enabled = cfg.encryption_enabled,
        "ledger-vault starting"
    );
    if !cfg.encryption_enabled {
        warn!("encryption disabled: new writes are stored in plaintext");
    }
    if cfg.allow_recovery_override {
        warn!(target: "audit", "emergency master secret override is enabled");
    }

    // -----------------------------------------------------------------------
    // 3. Master secret
    // -----------------------------------------------------------------------
    let master = secrets::load_master_secret(&cfg).await?;

    // -----------------------------------------------------------------------
    // 4. Field policy
    // -----------------------------------------------------------------------
    let policy = match &cfg.policy_path {
        Some(path) => FieldEncryptionPolicy::load(path)
            .with_context(|| format!("failed to load field policy from {path}"))?,
        None => FieldEncryptionPolicy::builtin(),
    };
    info!(kinds = policy.kinds().count(), "field policy loaded");

    // -----------------------------------------------------------------------
    // 5. Record store
    // -----------------------------------------------------------------------
    let store = SqliteStore::open_path(&cfg.database_path)
        .with_context(|| format!("failed to open database {}", cfg.database_path))?;
    info!(path = %cfg.database_path, "record store opened");

    // -----------------------------------------------------------------------
    // 6. Cipher, codec, migration driver
    // -----------------------------------------------------------------------
    let cipher = FieldCipher::with_iterations(master, cfg.kdf_iterations)
        .context("invalid KDF configuration")?;
    let codec = RecordCodec::new(cipher, Arc::new(policy), cfg.encryption_enabled);
    let state = AppState::new(
        codec,
        Arc::new(store),
        cfg.admin_token.clone(),
        cfg.allow_recovery_override,
    );

    // -----------------------------------------------------------------------
    // 7. HTTP server
    // -----------------------------------------------------------------------
    let router = server::router::build(state);

    let addr: std::net::SocketAddr = ([0, 0, 0, 0], cfg.listen_port).into();
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
