//! Access-token refresh with single flight per session.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::events::{NoopEvents, SessionEvents};
use super::guard::SessionGuard;
use crate::error::AuthError;
use crate::oidc::client::DEFAULT_EXPIRES_IN;
use crate::oidc::validator::{read_claims_unverified, subject_of};
use crate::oidc::{IdTokenValidator, OidcConfig, ProviderClient, TokenResponse};
use crate::session::{SessionId, TokenRecord, TokenStore};

/// A usable access token.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
    /// Whether this call performed a refresh.
    pub refreshed: bool,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("expires_at", &self.expires_at)
            .field("refreshed", &self.refreshed)
            .finish()
    }
}

/// The full record behind a valid access token.
#[derive(Debug, Clone)]
pub struct ValidTokens {
    pub record: TokenRecord,
    pub refreshed: bool,
}

/// Timing knobs for refresh.
#[derive(Debug, Clone, Copy)]
pub struct RefreshPolicy {
    /// Refresh when the token expires within this window.
    pub skew: chrono::Duration,
    /// Upper bound for one refresh including its retry.
    pub timeout: Duration,
    /// Pause before retrying after a network error.
    pub retry_backoff: Duration,
}

impl RefreshPolicy {
    pub fn from_config(config: &OidcConfig) -> Self {
        Self {
            skew: chrono::Duration::seconds(config.refresh_skew_secs),
            timeout: Duration::from_millis(config.refresh_timeout_ms),
            retry_backoff: Duration::from_millis(config.refresh_retry_backoff_ms),
        }
    }
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self::from_config(&OidcConfig::default())
    }
}

/// Returns valid access tokens, refreshing them when they are about to
/// expire. Concurrent callers for one session share a single refresh.
pub struct TokenRefreshManager {
    store: Arc<dyn TokenStore>,
    client: Arc<dyn ProviderClient>,
    validator: Arc<IdTokenValidator>,
    events: Arc<dyn SessionEvents>,
    guard: Arc<SessionGuard>,
    policy: RefreshPolicy,
}

impl TokenRefreshManager {
    pub fn new(
        store: Arc<dyn TokenStore>,
        client: Arc<dyn ProviderClient>,
        validator: Arc<IdTokenValidator>,
        policy: RefreshPolicy,
    ) -> Self {
        Self {
            store,
            client,
            validator,
            events: Arc::new(NoopEvents),
            guard: Arc::new(SessionGuard::default()),
            policy,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn SessionEvents>) -> Self {
        self.events = events;
        self
    }

    /// Share per-session locks and ended sessions with the flow coordinator.
    pub fn with_session_guard(mut self, guard: Arc<SessionGuard>) -> Self {
        self.guard = guard;
        self
    }

    pub fn session_guard(&self) -> &Arc<SessionGuard> {
        &self.guard
    }

    /// Access token for the session, refreshed if it expires within the skew.
    pub async fn get_valid_access_token(
        &self,
        session_id: &SessionId,
    ) -> Result<AccessToken, AuthError> {
        let tokens = self.get_valid_tokens(session_id).await?;
        Ok(AccessToken {
            value: tokens.record.access_token,
            expires_at: tokens.record.access_token_expiry,
            refreshed: tokens.refreshed,
        })
    }

    /// Like `get_valid_access_token` but returns the whole record.
    pub async fn get_valid_tokens(&self, session_id: &SessionId) -> Result<ValidTokens, AuthError> {
        let record = self
            .store
            .load(session_id)?
            .ok_or(AuthError::SessionNotFound)?;

        if !record.needs_refresh(Utc::now(), self.policy.skew) {
            debug!(session_id = %session_id, "Access token still valid");
            return Ok(ValidTokens {
                record,
                refreshed: false,
            });
        }

        let _lock = self.guard.lock(session_id).await;
        self.refresh_locked(session_id).await
    }

    /// Install a record carried by an embedded cookie unless the store
    /// already holds the same or a later one, or the session was signed out
    /// or invalidated. Returns whether it was saved.
    pub async fn adopt(&self, session_id: &SessionId, record: &TokenRecord) -> Result<bool, AuthError> {
        if self.guard.is_ended(session_id) {
            debug!(session_id = %session_id, "Ignoring cookie tokens of an ended session");
            return Ok(false);
        }
        if self.store.load(session_id)?.as_ref() == Some(record) {
            return Ok(false);
        }

        let _lock = self.guard.lock(session_id).await;
        if self.guard.is_ended(session_id) {
            return Ok(false);
        }

        match self.store.load(session_id)? {
            Some(stored) if stored == *record || !stored.may_be_replaced_by(record) => Ok(false),
            _ => {
                self.store.save(session_id, record)?;
                debug!(session_id = %session_id, "Adopted token record from session cookie");
                Ok(true)
            }
        }
    }

    /// Sessions with a lock entry (refresh in flight or queued).
    pub fn locked_sessions(&self) -> usize {
        self.guard.locked_sessions()
    }

    async fn refresh_locked(&self, session_id: &SessionId) -> Result<ValidTokens, AuthError> {
        // Re-read: another caller may have refreshed while we waited.
        let current = self
            .store
            .load(session_id)?
            .ok_or(AuthError::SessionNotFound)?;

        if !current.needs_refresh(Utc::now(), self.policy.skew) {
            debug!(session_id = %session_id, "Token refreshed by a concurrent request");
            return Ok(ValidTokens {
                record: current,
                refreshed: false,
            });
        }

        let Some(refresh_token) = current.refresh_token.clone() else {
            return Err(self.invalidate(session_id, "session has no refresh token".to_string()));
        };

        let issued_at = Utc::now();
        let response =
            match tokio::time::timeout(self.policy.timeout, self.redeem(session_id, &refresh_token))
                .await
            {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    warn!(session_id = %session_id, kind = e.kind(), "Refresh grant failed");
                    return Err(self.invalidate(session_id, e.to_string()));
                }
                Err(_) => {
                    warn!(
                        session_id = %session_id,
                        kind = AuthError::RefreshTimeout.kind(),
                        timeout_ms = self.policy.timeout.as_millis() as u64,
                        "Token refresh timed out"
                    );
                    return Err(AuthError::RefreshTimeout);
                }
            };

        let rotated = response.refresh_token.is_some();
        let response = self.check_id_token(session_id, &current, response).await;
        let mut refreshed = refreshed_record(&current, response, issued_at);

        if !current.may_be_replaced_by(&refreshed) {
            warn!(
                session_id = %session_id,
                "Refreshed token expires before the stored one, keeping stored access token"
            );
            refreshed = TokenRecord {
                refresh_token: refreshed.refresh_token,
                ..current
            };
        }

        // Deleted while the grant was in flight.
        if self.store.load(session_id)?.is_none() {
            return Err(AuthError::SessionNotFound);
        }

        self.store.save(session_id, &refreshed)?;
        self.events.token_refreshed(session_id);

        info!(
            session_id = %session_id,
            rotated = rotated,
            expires_in = refreshed.expires_in(Utc::now()),
            "Access token refreshed"
        );

        Ok(ValidTokens {
            record: refreshed,
            refreshed: true,
        })
    }

    /// refresh_token grant, retried once after a network error.
    async fn redeem(
        &self,
        session_id: &SessionId,
        refresh_token: &str,
    ) -> Result<TokenResponse, AuthError> {
        match self.client.refresh(refresh_token).await {
            Err(AuthError::Network(reason)) => {
                warn!(
                    session_id = %session_id,
                    error = %reason,
                    backoff_ms = self.policy.retry_backoff.as_millis() as u64,
                    "Refresh hit a network error, retrying"
                );
                tokio::time::sleep(self.policy.retry_backoff).await;
                self.client.refresh(refresh_token).await
            }
            other => other,
        }
    }

    /// Drop a refreshed id_token that fails validation; the previous one is
    /// kept.
    async fn check_id_token(
        &self,
        session_id: &SessionId,
        current: &TokenRecord,
        mut response: TokenResponse,
    ) -> TokenResponse {
        let Some(ref id_token) = response.id_token else {
            return response;
        };

        let result = match read_claims_unverified(&current.id_token).map(|c| subject_of(&c)) {
            Some(Ok(subject)) => self.validator.validate_refreshed(id_token, &subject).await,
            _ => Err(AuthError::TokenValidation(
                "stored id_token has no subject".to_string(),
            )),
        };

        if let Err(e) = result {
            warn!(
                session_id = %session_id,
                kind = e.kind(),
                error = %e,
                "Refreshed id_token rejected, keeping the previous one"
            );
            response.id_token = None;
        }
        response
    }

    fn invalidate(&self, session_id: &SessionId, reason: String) -> AuthError {
        self.guard.end(session_id);
        if let Err(e) = self.store.delete(session_id) {
            warn!(session_id = %session_id, error = %e, "Failed to delete invalidated session");
        }
        self.events.session_invalidated(session_id, &reason);
        warn!(session_id = %session_id, reason = %reason, "Session invalidated");
        AuthError::RefreshFailed(reason)
    }
}

/// New record from a refresh response. A missing refresh token or id_token
/// keeps the previous one.
fn refreshed_record(
    current: &TokenRecord,
    response: TokenResponse,
    issued_at: DateTime<Utc>,
) -> TokenRecord {
    let scopes = response
        .granted_scopes()
        .unwrap_or_else(|| current.scopes.clone());
    TokenRecord::issued(
        response.id_token.unwrap_or_else(|| current.id_token.clone()),
        response.access_token,
        response.refresh_token.or_else(|| current.refresh_token.clone()),
        issued_at,
        response.expires_in.unwrap_or(DEFAULT_EXPIRES_IN),
        scopes,
    )
}
