//! `ledger-vault` — field-level encryption for household ledger records.
//!
//! Monetary fields named by a [`policy::FieldEncryptionPolicy`] are sealed
//! per user with keys derived from the user's secret and a service-wide
//! master secret. A second copy of each value is sealed under an escrow key
//! so operators can recover data without the user's secret.

pub mod codec;
pub mod config;
pub mod crypto;
pub mod migration;
pub mod policy;
pub mod secrets;
pub mod server;
pub mod store;
pub mod telemetry;
