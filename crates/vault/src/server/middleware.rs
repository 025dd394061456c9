//! Request guards shared by the handlers: the acting-user header, the admin
//! token check, and the per-request timeout the router applies.

use std::time::Duration;

use axum::http::HeaderMap;
use common::ServiceError;
use sha2::{Digest, Sha256};

/// Default per-request timeout applied to all routes.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Header naming the acting user on `/protect` and `/reveal`.
pub const USER_HEADER: &str = "x-user-id";

/// Header carrying the admin token on `/admin/*`.
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Read a required ASCII header.
pub fn required_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ServiceError> {
    let value = headers
        .get(name)
        .ok_or_else(|| ServiceError::BadRequest(format!("missing {name} header")))?;
    let value = value
        .to_str()
        .map_err(|_| ServiceError::BadRequest(format!("{name} header contains non-ASCII characters")))?;
    if value.trim().is_empty() {
        return Err(ServiceError::BadRequest(format!("{name} header is empty")));
    }
    Ok(value)
}

/// Reject the request unless it carries the configured admin token.
pub fn require_admin(headers: &HeaderMap, expected: &str) -> Result<(), ServiceError> {
    let presented = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServiceError::Unauthorized("admin token required".into()))?;
    // Fixed-length digests: timing is independent of the matching prefix.
    if Sha256::digest(presented.as_bytes()) != Sha256::digest(expected.as_bytes()) {
        return Err(ServiceError::Unauthorized("invalid admin token".into()));
    }
    Ok(())
}
