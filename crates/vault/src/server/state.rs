//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use crate::codec::RecordCodec;
use crate::migration::Migrator;
use crate::store::RecordStore;

/// Application state shared across all request handlers.
///
/// All fields are cheaply cloneable (`Arc`-wrapped or already `Arc`-backed) so
/// that Axum can clone the state for each request without copying expensive data.
#[derive(Clone)]
pub struct AppState {
    /// Policy-driven record encryption.
    pub codec: RecordCodec,
    /// Migration and recovery driver over the same store.
    pub migrator: Migrator,
    /// Record, user secret, and recovery salt storage.
    pub store: Arc<dyn RecordStore>,
    /// Token required on `/admin/*` routes.
    pub admin_token: Arc<String>,
}

impl AppState {
    /// Wire the codec, store, and migrator together.
    pub fn new(
        codec: RecordCodec,
        store: Arc<dyn RecordStore>,
        admin_token: String,
        allow_recovery_override: bool,
    ) -> Self {
        let migrator = Migrator::new(codec.clone(), store.clone(), allow_recovery_override);
        Self {
            codec,
            migrator,
            store,
            admin_token: Arc::new(admin_token),
        }
    }
}
