//! Error taxonomy for login, refresh and session handling.

use thiserror::Error;

/// Errors surfaced by the flow coordinator and the refresh manager.
///
/// Login errors are terminal for the attempt. `RefreshFailed` is terminal for
/// the session: the stored record has already been deleted when it is
/// returned.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Callback `state` does not match a live pending login.
    #[error("state does not match a pending authorization request")]
    StateMismatch,

    /// The provider (or the local replay guard) rejected the grant.
    #[error("invalid grant: {0}")]
    InvalidGrant(String),

    /// Bad signature, issuer, audience, expiry or nonce.
    #[error("token validation failed: {0}")]
    TokenValidation(String),

    /// Refresh could not produce a usable token; the session was invalidated.
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    /// Refresh did not complete within the configured timeout.
    #[error("token refresh timed out")]
    RefreshTimeout,

    /// Provider unreachable or answered with a server error.
    #[error("network error: {0}")]
    Network(String),

    /// No token record is stored for the session.
    #[error("session not found")]
    SessionNotFound,

    /// OAuth error other than `invalid_grant` returned by the provider.
    #[error("provider error {error}: {}", .description.as_deref().unwrap_or(""))]
    Provider {
        error: String,
        description: Option<String>,
    },

    /// Token store backend failure.
    #[error("token store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl AuthError {
    /// Stable label used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::StateMismatch => "state_mismatch",
            AuthError::InvalidGrant(_) => "invalid_grant",
            AuthError::TokenValidation(_) => "token_validation",
            AuthError::RefreshFailed(_) => "refresh_failed",
            AuthError::RefreshTimeout => "refresh_timeout",
            AuthError::Network(_) => "network",
            AuthError::SessionNotFound => "session_not_found",
            AuthError::Provider { .. } => "provider",
            AuthError::Store(_) => "store",
        }
    }

    /// Whether the caller must send the user through login again.
    pub fn requires_reauthentication(&self) -> bool {
        matches!(
            self,
            AuthError::RefreshFailed(_) | AuthError::SessionNotFound | AuthError::InvalidGrant(_)
        )
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        AuthError::Network(err.to_string())
    }
}
