//! Axum request handlers for all service endpoints.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use common::protocol::{
    DegradedField, ErrorResponse, HealthResponse, MigrateRequest, MigrateResponse,
    ProtectResponse, RecordRequest, RecoverRequest, RecoverResponse, RevealResponse,
};
use common::ServiceError;
use serde_json::json;
use tracing::{error, warn};
use zeroize::Zeroizing;

use super::middleware::{require_admin, required_header, USER_HEADER};
use super::state::AppState;
use crate::codec::CodecError;
use crate::crypto::{random_salt, CryptoError, MasterSecret};
use crate::migration::{MigrationError, RecoveryError, RecoveryGrant};
use crate::store::StoreError;

/// A [`ServiceError`] rendered as an [`ErrorResponse`] with its HTTP status.
#[derive(Debug)]
pub struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(ErrorResponse::from(&self.0))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Run key derivation and field encryption on the blocking pool.
async fn run_blocking<T, F>(f: F) -> Result<T, ServiceError>
where
    F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        error!(error = %e, "blocking task failed");
        ServiceError::Internal("worker task failed".into())
    })?
}

/// `POST /protect` — encrypt the policy fields of a record for the acting user.
///
/// The user is identified by the `X-User-Id` header. While encryption is
/// enabled the user's recovery salt is created on first use, so every value
/// written here is escrowed. With encryption off no salt is touched.
pub async fn protect(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RecordRequest>,
) -> ApiResult<ProtectResponse> {
    let user_id = required_header(&headers, USER_HEADER)?;
    let secret = Zeroizing::new(
        state
            .store
            .load_user_secret(user_id)
            .await
            .map_err(store_error)?,
    );
    let salt = if state.codec.is_enabled() {
        let salt = state
            .store
            .load_or_create_recovery_salt(user_id, random_salt())
            .await
            .map_err(store_error)?;
        Some(salt)
    } else {
        None
    };

    let codec = state.codec.clone();
    let protected = run_blocking(move || {
        let credential = codec
            .cipher()
            .credential(&secret, salt.as_ref())
            .map_err(crypto_error)?;
        codec
            .protect(&req.record, &req.kind, &credential)
            .map_err(codec_error)
    })
    .await?;

    Ok(Json(ProtectResponse {
        record: protected.record,
        encrypted_fields: protected.encrypted_fields,
    }))
}

/// `POST /reveal` — decrypt the policy fields of a record for the acting user.
///
/// Fields that fail to decrypt are returned still encrypted and listed in
/// `degraded_fields`; the request itself succeeds.
pub async fn reveal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RecordRequest>,
) -> ApiResult<RevealResponse> {
    let user_id = required_header(&headers, USER_HEADER)?;
    let secret = Zeroizing::new(
        state
            .store
            .load_user_secret(user_id)
            .await
            .map_err(store_error)?,
    );

    let codec = state.codec.clone();
    let revealed = run_blocking(move || {
        codec
            .reveal(&req.record, &req.kind, &secret)
            .map_err(codec_error)
    })
    .await?;

    let degraded_fields = revealed
        .failures
        .iter()
        .map(|f| DegradedField {
            field: f.field.clone(),
            reason: f.error.kind().into(),
        })
        .collect();
    Ok(Json(RevealResponse {
        record: revealed.record,
        degraded_fields,
    }))
}

/// `POST /admin/migrate` — encrypt a user's remaining plaintext records.
pub async fn migrate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<MigrateRequest>,
) -> ApiResult<MigrateResponse> {
    require_admin(&headers, &state.admin_token)?;
    let secret = state
        .store
        .load_user_secret(&req.user_id)
        .await
        .map_err(store_error)?;

    let report = state
        .migrator
        .migrate_user(&req.user_id, &req.kind, &secret)
        .await
        .map_err(migration_error)?;

    Ok(Json(MigrateResponse {
        scanned: report.scanned,
        written: report.written,
        already_encrypted: report.already_encrypted,
        failed: report.failed,
    }))
}

/// `POST /admin/recover` — decrypt a user's records through the escrow.
///
/// Requires the admin token plus a named operator and reason. Recovered
/// records are returned only; nothing is written back.
pub async fn recover(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RecoverRequest>,
) -> ApiResult<RecoverResponse> {
    require_admin(&headers, &state.admin_token)?;
    let grant = match RecoveryGrant::new(req.operator, req.reason) {
        Ok(grant) => grant,
        Err(e) => {
            warn!(
                target: "audit",
                user_id = %req.user_id,
                kind = %req.kind,
                error = %e,
                "emergency recovery rejected"
            );
            return Err(recovery_error(e).into());
        }
    };
    let emergency = req
        .emergency_master_secret
        .as_deref()
        .map(MasterSecret::from_base64)
        .transpose()
        .map_err(|e| ServiceError::BadRequest(format!("emergency_master_secret: {e}")))?;

    let records = state
        .migrator
        .recover_without_user_secret(&grant, &req.user_id, &req.kind, emergency)
        .await
        .map_err(recovery_error)?;

    let records = records
        .into_iter()
        .map(|r| json!({ "id": r.id, "owner": r.owner, "fields": r.fields }))
        .collect();
    Ok(Json(RecoverResponse { records }))
}

/// `GET /health` — liveness check.
///
/// Always `200 OK` once the process is serving. `status` is `"degraded"`
/// while the encryption flag is off.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let encryption_enabled = state.codec.is_enabled();
    Json(HealthResponse {
        status: if encryption_enabled { "ok" } else { "degraded" }.into(),
        encryption_enabled,
        policy_kinds: state.codec.policy().kinds().map(str::to_owned).collect(),
    })
}

/// Catch-all 404 handler.
pub async fn not_found() -> impl IntoResponse {
    let err = ErrorResponse::new("not_found", "the requested resource does not exist");
    (StatusCode::NOT_FOUND, Json(err))
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn store_error(err: StoreError) -> ServiceError {
    match err {
        StoreError::UnknownUser(_) | StoreError::NotFound { .. } => {
            ServiceError::NotFound(err.to_string())
        }
        StoreError::Corrupt(_) | StoreError::Backend(_) => {
            error!(error = %err, "store failure");
            ServiceError::Internal("storage failure".into())
        }
    }
}

fn crypto_error(err: CryptoError) -> ServiceError {
    error!(error = %err, "crypto failure");
    ServiceError::EncryptionFailure(err.kind().into())
}

fn codec_error(err: CodecError) -> ServiceError {
    match err {
        CodecError::UnknownKind(kind) => ServiceError::BadRequest(format!("unknown record kind: {kind}")),
        CodecError::Field {
            field,
            source: CryptoError::Format(reason),
        } => ServiceError::BadRequest(format!("field {field}: {reason}")),
        CodecError::Field { field, source } => {
            warn!(field = %field, error = source.kind(), "field rejected");
            ServiceError::EncryptionFailure(format!("field {field}: {}", source.kind()))
        }
    }
}

fn migration_error(err: MigrationError) -> ServiceError {
    match err {
        MigrationError::EncryptionDisabled => ServiceError::Unavailable(err.to_string()),
        MigrationError::UnknownKind(_) => ServiceError::BadRequest(err.to_string()),
        MigrationError::Crypto(e) => crypto_error(e),
        MigrationError::Store(e) => store_error(e),
        MigrationError::Task(_) => {
            error!(error = %err, "migration task failure");
            ServiceError::Internal("migration task failed".into())
        }
    }
}

fn recovery_error(err: RecoveryError) -> ServiceError {
    match err {
        RecoveryError::Unauthorized | RecoveryError::OverrideNotPermitted => {
            ServiceError::Unauthorized(err.to_string())
        }
        RecoveryError::UnknownKind(_) => ServiceError::BadRequest(err.to_string()),
        RecoveryError::MissingSalt(_) => ServiceError::NotFound(err.to_string()),
        RecoveryError::Field { .. } | RecoveryError::Crypto(_) => {
            ServiceError::EncryptionFailure(err.to_string())
        }
        RecoveryError::Store(e) => store_error(e),
        RecoveryError::Task(_) => {
            error!(error = %err, "recovery task failure");
            ServiceError::Internal("recovery task failed".into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::state::fixture;
    use crate::store::{MemoryStore, RecordStore, StoredRecord};
    use serde_json::Value;

    async fn store_with_alice() -> MemoryStore {
        let store = MemoryStore::new();
        store.put_user("alice", "alice-secret").await;
        store
    }

    fn user_headers(user: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_HEADER, user.parse().unwrap());
        headers
    }

    fn request(kind: &str, record: Value) -> Json<RecordRequest> {
        Json(RecordRequest {
            kind: kind.into(),
            record: record.as_object().unwrap().clone(),
        })
    }

    #[tokio::test]
    async fn protect_then_reveal() {
        let state = fixture::state(store_with_alice().await, false);

        let Json(protected) = protect(
            State(state.clone()),
            user_headers("alice"),
            request("expense", json!({"amount": 42.5, "note": "groceries"})),
        )
        .await
        .unwrap();
        assert_eq!(protected.encrypted_fields, vec!["amount".to_string()]);
        assert!(protected.record["amount"].get("ciphertext").is_some());
        assert_eq!(protected.record["note"], "groceries");

        let Json(revealed) = reveal(
            State(state),
            user_headers("alice"),
            request("expense", Value::Object(protected.record)),
        )
        .await
        .unwrap();
        assert!(revealed.degraded_fields.is_empty());
        assert_eq!(revealed.record["amount"], json!(42.5));
    }

    #[tokio::test]
    async fn reveal_with_other_users_secret_is_degraded() {
        let store = store_with_alice().await;
        store.put_user("bob", "bob-secret").await;
        let state = fixture::state(store, false);

        let Json(protected) = protect(
            State(state.clone()),
            user_headers("alice"),
            request("income", json!({"amount": 1000})),
        )
        .await
        .unwrap();

        let Json(revealed) = reveal(
            State(state),
            user_headers("bob"),
            request("income", Value::Object(protected.record.clone())),
        )
        .await
        .unwrap();
        assert_eq!(revealed.degraded_fields.len(), 1);
        assert_eq!(revealed.degraded_fields[0].reason, "authentication_failure");
        assert_eq!(revealed.record["amount"], protected.record["amount"]);
    }

    #[tokio::test]
    async fn protect_rejects_unknown_user_and_kind() {
        let state = fixture::state(store_with_alice().await, false);

        let err = protect(
            State(state.clone()),
            user_headers("mallory"),
            request("expense", json!({"amount": 1})),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0.http_status(), 404);

        let err = protect(
            State(state),
            user_headers("alice"),
            request("horoscope", json!({"amount": 1})),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0.http_status(), 400);
    }

    #[tokio::test]
    async fn protect_rejects_sub_cent_amount() {
        let state = fixture::state(store_with_alice().await, false);
        let err = protect(
            State(state),
            user_headers("alice"),
            request("expense", json!({"amount": 0.001})),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0.http_status(), 400);
    }

    #[tokio::test]
    async fn migrate_then_recover() {
        let store = store_with_alice().await;
        store
            .seed(
                "loan",
                StoredRecord {
                    id: "l1".into(),
                    owner: "alice".into(),
                    fields: json!({"principal": 5000, "balance": 4200.25, "monthly_payment": 150})
                        .as_object()
                        .unwrap()
                        .clone(),
                },
            )
            .await;
        let state = fixture::state(store.clone(), false);

        let mut admin = HeaderMap::new();
        admin.insert(
            crate::server::middleware::ADMIN_TOKEN_HEADER,
            fixture::ADMIN_TOKEN.parse().unwrap(),
        );

        let Json(report) = migrate(
            State(state.clone()),
            admin.clone(),
            Json(MigrateRequest {
                user_id: "alice".into(),
                kind: "loan".into(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(report.written, 1);
        let stored = store.load_record("loan", "l1").await.unwrap();
        assert!(stored.fields["balance"].get("ciphertext").is_some());

        let Json(recovered) = recover(
            State(state),
            admin,
            Json(RecoverRequest {
                user_id: "alice".into(),
                kind: "loan".into(),
                operator: "ops-oncall".into(),
                reason: "user lost access".into(),
                emergency_master_secret: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(recovered.records.len(), 1);
        assert_eq!(recovered.records[0]["fields"]["balance"], json!(4200.25));
    }

    #[tokio::test]
    async fn admin_routes_require_token() {
        let state = fixture::state(store_with_alice().await, false);
        let err = migrate(
            State(state),
            HeaderMap::new(),
            Json(MigrateRequest {
                user_id: "alice".into(),
                kind: "loan".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0.http_status(), 401);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn protect_keeps_the_runtime_responsive() {
        let state = fixture::state(store_with_alice().await, false);
        let work = tokio::spawn(protect(
            State(state),
            user_headers("alice"),
            request(
                "loan",
                json!({"principal": 5000, "balance": 4200.25, "monthly_payment": 150}),
            ),
        ));

        let mut worst = std::time::Duration::ZERO;
        while !work.is_finished() {
            let started = std::time::Instant::now();
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            worst = worst.max(started.elapsed());
        }
        let Json(protected) = work.await.unwrap().unwrap();
        assert_eq!(protected.encrypted_fields.len(), 3);
        assert!(
            worst < std::time::Duration::from_millis(250),
            "runtime stalled for {worst:?}"
        );
    }

    #[tokio::test]
    async fn protect_with_encryption_off_leaves_salt_alone() {
        let store = store_with_alice().await;
        let state = fixture::disabled(store.clone());

        let Json(protected) = protect(
            State(state),
            user_headers("alice"),
            request("expense", json!({"amount": 42.5})),
        )
        .await
        .unwrap();
        assert!(protected.encrypted_fields.is_empty());
        assert_eq!(protected.record["amount"], json!(42.5));
        assert_eq!(store.load_recovery_salt("alice").await.unwrap(), None);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn recover_without_operator_is_audited() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let state = fixture::state(store_with_alice().await, false);
        let mut admin = HeaderMap::new();
        admin.insert(
            crate::server::middleware::ADMIN_TOKEN_HEADER,
            fixture::ADMIN_TOKEN.parse().unwrap(),
        );

        let err = recover(
            State(state),
            admin,
            Json(RecoverRequest {
                user_id: "alice".into(),
                kind: "loan".into(),
                operator: " ".into(),
                reason: "user lost access".into(),
                emergency_master_secret: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0.http_status(), 401);

        let out = logs.contents();
        assert!(out.contains("audit"), "{out}");
        assert!(out.contains("emergency recovery rejected"), "{out}");
        assert!(out.contains("alice"), "{out}");
    }

    #[tokio::test]
    async fn health_lists_policy_kinds() {
        let state = fixture::state(MemoryStore::new(), false);
        let Json(body) = health(State(state)).await;
        assert_eq!(body.status, "ok");
        assert!(body.policy_kinds.contains(&"expense".to_string()));
    }
}
