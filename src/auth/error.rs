//! Typed errors for the PKCE session manager
//!
//! Callers distinguish configuration mistakes, stale or forged redirects and
//! provider failures without string matching.

use thiserror::Error;

/// PKCE session errors with typed variants
///
/// - `Configuration` - a required provider field is empty or malformed
/// - `InvalidState` - no pending authorization for this session
/// - `Security` - redirect `state` does not match; possible forgery, never retried
/// - `Provider` - token endpoint answered with a non-success status
/// - `NotAuthorized` - no usable token for an authorized request
#[derive(Debug, Error)]
pub enum AuthError {
    /// Missing or invalid provider configuration
    #[error("Missing OAuth configuration: {0}")]
    Configuration(String),

    /// No pending authorization matches this redirect
    #[error("Invalid provider state: {0}")]
    InvalidState(String),

    /// The `state` echoed by the provider differs from the one we generated
    #[error("State value from provider does not match local state. Possible cross-site request forgery!")]
    Security,

    /// The provider redirected back with an `error` parameter
    #[error("Authorization denied by provider: {error}")]
    Denied { error: String },

    /// The redirect carried neither a code nor an error
    #[error("Provider redirect did not include an authorization code")]
    MissingCode,

    /// Token endpoint returned a non-success status
    #[error("Token endpoint returned {status}: {status_text}")]
    Provider { status: u16, status_text: String },

    /// Token endpoint answered 2xx with a body we could not use
    #[error("Invalid token response: {0}")]
    InvalidResponse(String),

    /// No token is held, or the held token has expired
    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    /// Transport failure talking to the provider
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Durable storage failure
    #[error("Storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

impl AuthError {
    /// Build a `Provider` error from an HTTP status
    pub fn from_status(status: reqwest::StatusCode) -> Self {
        AuthError::Provider {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("Unknown").to_string(),
        }
    }

    /// Whether the flow must be abandoned because the redirect may be forged
    pub fn is_security_violation(&self) -> bool {
        matches!(self, AuthError::Security)
    }

    /// Whether retrying later could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            AuthError::Network(_) => true,
            AuthError::Provider { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Whether the user has to run the authorization flow again
    pub fn needs_reauthorization(&self) -> bool {
        matches!(
            self,
            AuthError::NotAuthorized(_) | AuthError::InvalidState(_)
        ) || matches!(self, AuthError::Provider { status, .. } if *status == 400 || *status == 401)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_uses_canonical_reason() {
        let err = AuthError::from_status(reqwest::StatusCode::BAD_REQUEST);
        match &err {
            AuthError::Provider {
                status,
                status_text,
            } => {
                assert_eq!(*status, 400);
                assert_eq!(status_text, "Bad Request");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.to_string(), "Token endpoint returned 400: Bad Request");
        assert!(err.needs_reauthorization());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_server_errors_are_retryable() {
        assert!(AuthError::from_status(reqwest::StatusCode::BAD_GATEWAY).is_retryable());
        assert!(AuthError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS).is_retryable());
    }

    #[test]
    fn test_security_violation() {
        assert!(AuthError::Security.is_security_violation());
        assert!(!AuthError::Security.is_retryable());
        assert!(AuthError::Security
            .to_string()
            .contains("cross-site request forgery"));
        assert!(!AuthError::MissingCode.is_security_violation());
    }
}
