//! Bearer / query-key authentication gate.
//!
//! Token sources in order: `Authorization: Bearer …`, then the deprecated
//! `?key=` query parameter (warned per request). Comparison is timing-safe:
//! both sides are hashed to a fixed width before `ct_eq`, so token length
//! never leaks.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use subtle::ConstantTimeEq;

/// Why authentication failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    /// No token was supplied anywhere.
    MissingToken,
    /// A token was supplied but did not match.
    InvalidToken,
    /// More than one `Authorization` header was present.
    AmbiguousAuthorization,
}

impl AuthError {
    pub fn message(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "Missing authentication token",
            AuthError::InvalidToken => "Invalid authentication token",
            AuthError::AmbiguousAuthorization => "Multiple Authorization headers",
        }
    }
}

/// Timing-safe string comparison via fixed-width digests.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = Sha256::digest(a.as_bytes());
    let b = Sha256::digest(b.as_bytes());
    a.ct_eq(&b).into()
}

/// Validate a request's credentials against the expected key.
///
/// `authorization_values` carries every `Authorization` header value as
/// received (the transport layer preserves duplicates so they can be
/// rejected here). An empty `expected_key` disables authentication.
pub fn validate_auth(
    expected_key: &str,
    authorization_values: &[String],
    query: &BTreeMap<String, String>,
) -> Result<(), AuthError> {
    if expected_key.is_empty() {
        return Ok(());
    }

    if authorization_values.len() > 1 {
        return Err(AuthError::AmbiguousAuthorization);
    }

    if let Some(value) = authorization_values.first() {
        let token = value
            .strip_prefix("Bearer ")
            .map(str::trim)
            .ok_or(AuthError::InvalidToken)?;
        return if constant_time_eq(token, expected_key) {
            Ok(())
        } else {
            Err(AuthError::InvalidToken)
        };
    }

    if let Some(key) = query.get("key") {
        tracing::warn!("Authentication via ?key= query parameter is deprecated; use a Bearer token");
        return if constant_time_eq(key, expected_key) {
            Ok(())
        } else {
            Err(AuthError::InvalidToken)
        };
    }

    Err(AuthError::MissingToken)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_expected_key_allows_everything() {
        assert!(validate_auth("", &[], &BTreeMap::new()).is_ok());
        assert!(validate_auth("", &["Bearer whatever".to_string()], &BTreeMap::new()).is_ok());
    }

    #[test]
    fn bearer_token_accepted() {
        let headers = vec!["Bearer sekrit".to_string()];
        assert!(validate_auth("sekrit", &headers, &BTreeMap::new()).is_ok());
    }

    #[test]
    fn bearer_token_rejected_when_wrong() {
        let headers = vec!["Bearer wrong".to_string()];
        assert_eq!(
            validate_auth("sekrit", &headers, &BTreeMap::new()),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn non_bearer_scheme_rejected() {
        let headers = vec!["Basic Zm9vOmJhcg==".to_string()];
        assert_eq!(
            validate_auth("sekrit", &headers, &BTreeMap::new()),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn multiple_authorization_headers_rejected() {
        let headers = vec!["Bearer sekrit".to_string(), "Bearer sekrit".to_string()];
        assert_eq!(
            validate_auth("sekrit", &headers, &BTreeMap::new()),
            Err(AuthError::AmbiguousAuthorization)
        );
    }

    #[test]
    fn query_key_fallback_accepted() {
        assert!(validate_auth("sekrit", &[], &query(&[("key", "sekrit")])).is_ok());
    }

    #[test]
    fn query_key_fallback_rejected_when_wrong() {
        assert_eq!(
            validate_auth("sekrit", &[], &query(&[("key", "nope")])),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn header_takes_precedence_over_query() {
        // Header present but wrong; a correct query key must not rescue it.
        let headers = vec!["Bearer wrong".to_string()];
        assert_eq!(
            validate_auth("sekrit", &headers, &query(&[("key", "sekrit")])),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn missing_token_distinguished_from_invalid() {
        assert_eq!(
            validate_auth("sekrit", &[], &BTreeMap::new()),
            Err(AuthError::MissingToken)
        );
    }

    #[test]
    fn constant_time_eq_basic() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcdef"));
    }
}
