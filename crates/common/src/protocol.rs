//! Request and response types exchanged with the ledger-vault service.
//!
//! Records travel as plain JSON objects. Protected fields hold an encrypted
//! value object in place of the number; everything else is passed through.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Protect / reveal
// ---------------------------------------------------------------------------

/// Request body for `POST /protect` and `POST /reveal`.
///
/// The acting user is identified by the `X-User-Id` request header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordRequest {
    /// Record kind used to look up the sensitive field list (e.g. `"expense"`).
    pub kind: String,
    /// The record itself.
    pub record: serde_json::Map<String, serde_json::Value>,
}

/// Successful response body for `POST /protect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectResponse {
    /// The record with sensitive numeric fields replaced by encrypted values.
    pub record: serde_json::Map<String, serde_json::Value>,
    /// Names of the fields encrypted by this call.
    pub encrypted_fields: Vec<String>,
}

/// A field that could not be decrypted and was left encrypted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DegradedField {
    /// Field name.
    pub field: String,
    /// Failure category, never the value itself.
    pub reason: String,
}

/// Successful response body for `POST /reveal`.
///
/// A non-empty `degraded_fields` list means the read succeeded only partially.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevealResponse {
    /// The record with every decryptable field restored to a number.
    pub record: serde_json::Map<String, serde_json::Value>,
    /// Fields left encrypted because decryption failed.
    pub degraded_fields: Vec<DegradedField>,
}

// ---------------------------------------------------------------------------
// Administrative endpoints
// ---------------------------------------------------------------------------

/// Request body for `POST /admin/migrate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateRequest {
    /// Owner of the records to migrate.
    pub user_id: String,
    /// Record kind to migrate.
    pub kind: String,
}

/// Response body for `POST /admin/migrate`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResponse {
    /// Records examined.
    pub scanned: usize,
    /// Records rewritten with newly encrypted fields.
    pub written: usize,
    /// Records that needed no change.
    pub already_encrypted: usize,
    /// Records skipped because of an error.
    pub failed: usize,
}

/// Request body for `POST /admin/recover`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverRequest {
    /// User whose data is being recovered.
    pub user_id: String,
    /// Record kind to recover.
    pub kind: String,
    /// Name of the operator performing the recovery. Recorded in the audit log.
    pub operator: String,
    /// Justification for the recovery. Recorded in the audit log.
    pub reason: String,
    /// Optional base64 override for the standing master secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emergency_master_secret: Option<String>,
}

/// Response body for `POST /admin/recover`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverResponse {
    /// Recovered records, decrypted, in storage order.
    pub records: Vec<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

/// Standard error response body returned on any non-2xx status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short machine-readable error code (e.g. `"bad_request"`).
    pub code: String,
    /// Human-readable description safe to expose to callers.
    pub message: String,
}

impl ErrorResponse {
    /// Construct an [`ErrorResponse`] from a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&crate::ServiceError> for ErrorResponse {
    fn from(err: &crate::ServiceError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

/// Response body for `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall service status: `"ok"` or `"degraded"`.
    pub status: String,
    /// Whether new writes are encrypted.
    pub encryption_enabled: bool,
    /// Record kinds with a configured field policy.
    pub policy_kinds: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_request_from_json() {
        let req: RecordRequest = serde_json::from_value(json!({
            "kind": "expense",
            "record": {"amount": 500.0, "note": "rent"}
        }))
        .unwrap();
        assert_eq!(req.kind, "expense");
        assert_eq!(req.record["note"], "rent");
    }

    #[test]
    fn recover_request_override_is_optional() {
        let req: RecoverRequest = serde_json::from_value(json!({
            "user_id": "u1",
            "kind": "loan",
            "operator": "ops",
            "reason": "locked out"
        }))
        .unwrap();
        assert!(req.emergency_master_secret.is_none());
        let out = serde_json::to_value(&req).unwrap();
        assert!(out.get("emergency_master_secret").is_none());
    }

    #[test]
    fn error_response_from_service_error() {
        let e = crate::ServiceError::Unauthorized("missing X-Admin-Token header".into());
        let body = ErrorResponse::from(&e);
        assert_eq!(body.code, "unauthorized");
        assert!(body.message.contains("X-Admin-Token"));
    }
}
