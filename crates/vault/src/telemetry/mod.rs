//! Structured logging and optional OpenTelemetry span export.
//!
//! # Telemetry invariants
//!
//! - **No amounts, secrets, salts, or key material** may appear in any span
//!   attribute or log field. Record ids, user ids, kinds, and field names are fine.
//! - Recovery events use the `audit` target so they can be routed separately.
//! - Log level is configurable via `LOG_LEVEL` (default: `info`).

pub mod init;

pub use init::init_telemetry;
