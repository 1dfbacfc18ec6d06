//! Authorization-code flow: login redirect, callback, sign-out.

use anyhow::bail;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::events::{NoopEvents, SessionEvents};
use super::guard::SessionGuard;
use super::pending::{PendingAuth, PendingAuthStore, RedeemedCodes};
use crate::error::AuthError;
use crate::oidc::client::DEFAULT_EXPIRES_IN;
use crate::oidc::pkce::{random_token, PkceChallenge};
use crate::oidc::{
    ClaimSet, ClaimsProjector, IdTokenValidator, JwksCache, OidcConfig, ProviderClient,
    ProviderMetadata, PushedAuthorization,
};
use crate::session::{Session, SessionId, TokenRecord, TokenStore};

/// Where to send the browser to start a login.
#[derive(Debug, Clone)]
pub struct LoginRedirect {
    pub url: String,
    pub state: String,
}

/// Parameters the provider appends to the redirect URI.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl CallbackParams {
    /// Parse a callback query string (without the leading `?`).
    pub fn from_query(query: &str) -> Self {
        let mut params = Self::default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let value = Some(value.into_owned());
            match key.as_ref() {
                "code" => params.code = value,
                "state" => params.state = value,
                "error" => params.error = value,
                "error_description" => params.error_description = value,
                _ => {}
            }
        }
        params
    }
}

/// A completed login.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub session: Session,
    pub tokens: TokenRecord,
    pub identity: ClaimSet,
    /// Sanitised local path to return to.
    pub return_url: String,
}

/// Result of a sign-out.
#[derive(Debug, Clone, Default)]
pub struct LogoutOutcome {
    /// Provider end-session URL, when the provider advertises one.
    pub end_session_url: Option<String>,
}

/// Drives the authorization-code flow with PKCE and optional PAR.
pub struct AuthorizationFlowCoordinator {
    config: OidcConfig,
    metadata: ProviderMetadata,
    client: Arc<dyn ProviderClient>,
    validator: Arc<IdTokenValidator>,
    store: Arc<dyn TokenStore>,
    guard: Arc<SessionGuard>,
    pending: PendingAuthStore,
    redeemed: RedeemedCodes,
    projector: ClaimsProjector,
    events: Arc<dyn SessionEvents>,
    session_ttl_secs: u64,
}

impl AuthorizationFlowCoordinator {
    pub fn new(
        config: OidcConfig,
        metadata: ProviderMetadata,
        client: Arc<dyn ProviderClient>,
        jwks: Arc<JwksCache>,
        store: Arc<dyn TokenStore>,
        session_ttl_secs: u64,
    ) -> anyhow::Result<Self> {
        if config.pushed_authorization == PushedAuthorization::Require && !metadata.supports_par()
        {
            bail!("Pushed authorization is required but the provider has no PAR endpoint");
        }

        Ok(Self {
            validator: Arc::new(IdTokenValidator::new(&config, &metadata.issuer, jwks)),
            guard: Arc::new(SessionGuard::new(session_ttl_secs)),
            pending: PendingAuthStore::new(config.pending_auth_ttl_secs, config.max_pending),
            redeemed: RedeemedCodes::new(config.pending_auth_ttl_secs),
            projector: ClaimsProjector::from_config(&config),
            events: Arc::new(NoopEvents),
            config,
            metadata,
            client,
            store,
            session_ttl_secs,
        })
    }

    /// Replace the lifecycle hooks.
    pub fn with_events(mut self, events: Arc<dyn SessionEvents>) -> Self {
        self.events = events;
        self
    }

    /// Share per-session locks and ended sessions with the refresh manager.
    pub fn with_session_guard(mut self, guard: Arc<SessionGuard>) -> Self {
        self.guard = guard;
        self
    }

    pub fn session_guard(&self) -> &Arc<SessionGuard> {
        &self.guard
    }

    pub fn id_token_validator(&self) -> &Arc<IdTokenValidator> {
        &self.validator
    }

    pub fn metadata(&self) -> &ProviderMetadata {
        &self.metadata
    }

    pub fn projector(&self) -> &ClaimsProjector {
        &self.projector
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn uses_par(&self) -> bool {
        match self.config.pushed_authorization {
            PushedAuthorization::Disable => false,
            PushedAuthorization::UseIfAvailable | PushedAuthorization::Require => {
                self.metadata.supports_par()
            }
        }
    }

    /// Build the authorization redirect for a new login.
    pub async fn begin_login(&self, return_url: Option<&str>) -> Result<LoginRedirect, AuthError> {
        let state = random_token();
        let nonce = random_token();
        let pkce = PkceChallenge::generate();

        let params: Vec<(String, String)> = vec![
            ("client_id".to_string(), self.config.client_id.clone()),
            ("redirect_uri".to_string(), self.config.redirect_uri.clone()),
            ("response_type".to_string(), "code".to_string()),
            ("scope".to_string(), self.config.requested_scopes().join(" ")),
            ("state".to_string(), state.clone()),
            ("nonce".to_string(), nonce.clone()),
            ("code_challenge".to_string(), pkce.challenge.clone()),
            (
                "code_challenge_method".to_string(),
                PkceChallenge::METHOD.to_string(),
            ),
        ];

        let url = if self.uses_par() {
            let pushed = self.client.push_authorization(&params).await?;
            debug!(expires_in = pushed.expires_in, "Authorization request pushed");
            build_url(
                &self.metadata.authorization_endpoint,
                &[
                    ("client_id", self.config.client_id.as_str()),
                    ("request_uri", pushed.request_uri.as_str()),
                ],
            )?
        } else {
            let pairs: Vec<(&str, &str)> =
                params.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            build_url(&self.metadata.authorization_endpoint, &pairs)?
        };

        self.pending.insert(PendingAuth {
            state: state.clone(),
            code_verifier: pkce.verifier,
            nonce,
            return_url: sanitize_return_url(return_url),
            created_at: Utc::now(),
        });

        info!(par = self.uses_par(), pending = self.pending.len(), "Login started");

        Ok(LoginRedirect { url, state })
    }

    /// Handle the provider callback: check state, redeem the code, validate
    /// the id_token and create the session.
    pub async fn complete_login(
        &self,
        callback: &CallbackParams,
    ) -> Result<LoginOutcome, AuthError> {
        let pending = callback
            .state
            .as_deref()
            .and_then(|state| self.pending.take(state))
            .ok_or_else(|| {
                warn!(kind = "state_mismatch", "Callback state matches no pending login");
                AuthError::StateMismatch
            })?;

        if let Some(ref error) = callback.error {
            warn!(error = %error, "Provider returned an authorization error");
            return Err(AuthError::Provider {
                error: error.clone(),
                description: callback.error_description.clone(),
            });
        }

        let code = callback
            .code
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AuthError::InvalidGrant("callback carries no code".to_string()))?;

        if !self.redeemed.mark_redeemed(code) {
            warn!(kind = "invalid_grant", "Authorization code replayed");
            return Err(AuthError::InvalidGrant(
                "authorization code already redeemed".to_string(),
            ));
        }

        let issued_at = Utc::now();
        let response = self.client.exchange_code(code, &pending.code_verifier).await?;

        let id_token = response.id_token.clone().ok_or_else(|| {
            AuthError::TokenValidation("token response carries no id_token".to_string())
        })?;
        let claims = self.validator.validate(&id_token, &pending.nonce).await?;

        let tokens = TokenRecord::issued(
            id_token,
            response.access_token.clone(),
            response.refresh_token.clone(),
            issued_at,
            response.expires_in.unwrap_or(DEFAULT_EXPIRES_IN),
            response
                .granted_scopes()
                .unwrap_or_else(|| self.config.requested_scopes()),
        );

        let session = Session::new(claims.subject, self.session_ttl_secs);
        self.store.save(&session.id, &tokens)?;

        let identity = self.projector.project(&claims.claims);
        self.events.signed_in(&session, &identity);

        info!(
            session_id = %session.id,
            subject = %session.subject,
            has_refresh_token = tokens.refresh_token.is_some(),
            "Login completed"
        );

        Ok(LoginOutcome {
            session,
            tokens,
            identity,
            return_url: pending.return_url,
        })
    }

    /// Drop the session's tokens, revoke the refresh token and build the
    /// provider end-session URL.
    pub async fn sign_out(&self, session_id: &SessionId) -> Result<LogoutOutcome, AuthError> {
        // Under the session lock a refresh in flight finishes first, so the
        // refresh token revoked below is the latest one.
        let record = {
            let _lock = self.guard.lock(session_id).await;
            self.guard.end(session_id);
            let record = self.store.load(session_id)?;
            self.store.delete(session_id)?;
            record
        };

        if let Some(refresh_token) = record.as_ref().and_then(|r| r.refresh_token.as_deref()) {
            if self.metadata.revocation_endpoint.is_some() {
                if let Err(e) = self.client.revoke(refresh_token, "refresh_token").await {
                    warn!(session_id = %session_id, kind = e.kind(), error = %e, "Refresh token revocation failed");
                }
            }
        }

        let end_session_url = self
            .metadata
            .end_session_endpoint
            .as_deref()
            .and_then(|endpoint| {
                let mut params: Vec<(&str, &str)> =
                    vec![("client_id", self.config.client_id.as_str())];
                if let Some(ref record) = record {
                    params.push(("id_token_hint", record.id_token.as_str()));
                }
                if let Some(ref uri) = self.config.post_logout_redirect_uri {
                    params.push(("post_logout_redirect_uri", uri.as_str()));
                }
                match build_url(endpoint, &params) {
                    Ok(url) => Some(url),
                    Err(e) => {
                        warn!(error = %e, "Invalid end-session endpoint");
                        None
                    }
                }
            });

        self.events.signed_out(session_id);
        info!(session_id = %session_id, had_tokens = record.is_some(), "Signed out");

        Ok(LogoutOutcome { end_session_url })
    }

    /// Drop expired pending logins, redeemed-code entries and ended
    /// sessions.
    pub fn evict_expired(&self) -> usize {
        self.pending.evict_expired() + self.redeemed.evict_expired() + self.guard.evict_expired()
    }
}

fn build_url(endpoint: &str, params: &[(&str, &str)]) -> Result<String, AuthError> {
    url::Url::parse_with_params(endpoint, params)
        .map(String::from)
        .map_err(|e| AuthError::Provider {
            error: "invalid_endpoint".to_string(),
            description: Some(format!("{}: {}", endpoint, e)),
        })
}

/// Keep only local absolute paths. Anything else returns to `/`.
pub fn sanitize_return_url(return_url: Option<&str>) -> String {
    match return_url {
        Some(url)
            if url.starts_with('/')
                && !url.starts_with("//")
                && !url.starts_with("/\\")
                && !url.chars().any(|c| c.is_control()) =>
        {
            url.to_string()
        }
        _ => "/".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemoryTokenStore;
    use crate::testing::{coordinator, test_metadata, test_oidc_config, SimulatedProvider};
    use chrono::Duration;
    use std::collections::HashMap;

    fn store() -> Arc<dyn TokenStore> {
        Arc::new(MemoryTokenStore::new(3600))
    }

    fn query_of(url: &str) -> HashMap<String, String> {
        url::Url::parse(url)
            .unwrap()
            .query_pairs()
            .into_owned()
            .collect()
    }

    #[tokio::test]
    async fn test_begin_login_without_par() {
        let provider = SimulatedProvider::new();
        let mut metadata = test_metadata();
        metadata.pushed_authorization_request_endpoint = None;
        let flow = AuthorizationFlowCoordinator::new(
            test_oidc_config(),
            metadata,
            provider.clone(),
            crate::testing::fixture_jwks(),
            store(),
            3600,
        )
        .unwrap();

        let redirect = flow.begin_login(Some("/weather")).await.unwrap();
        let query = query_of(&redirect.url);

        assert!(redirect.url.starts_with("https://idp.example.test/authorize?"));
        assert_eq!(query["response_type"], "code");
        assert_eq!(query["client_id"], "client-123");
        assert_eq!(query["state"], redirect.state);
        assert_eq!(query["code_challenge_method"], "S256");
        assert_eq!(query["code_challenge"].len(), 43);
        assert!(!query["nonce"].is_empty());
        assert_eq!(
            query["scope"],
            "openid profile offline_access api://weather/Weather.Get"
        );
        assert_eq!(provider.pushed_count(), 0);
        assert_eq!(flow.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_begin_login_with_par() {
        let provider = SimulatedProvider::new();
        let flow = coordinator(provider.clone(), store());

        let redirect = flow.begin_login(None).await.unwrap();
        let query = query_of(&redirect.url);

        assert_eq!(provider.pushed_count(), 1);
        assert_eq!(query.len(), 2);
        assert_eq!(query["client_id"], "client-123");
        assert!(query["request_uri"].starts_with("urn:ietf:params:oauth:request_uri:"));
    }

    #[test]
    fn test_par_required_without_endpoint_is_rejected() {
        let mut config = test_oidc_config();
        config.pushed_authorization = PushedAuthorization::Require;
        let mut metadata = test_metadata();
        metadata.pushed_authorization_request_endpoint = None;

        let result = AuthorizationFlowCoordinator::new(
            config,
            metadata,
            SimulatedProvider::new(),
            crate::testing::fixture_jwks(),
            store(),
            3600,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_complete_login_sets_expiry_from_expires_in() {
        let provider = SimulatedProvider::new();
        let store = store();
        let flow = coordinator(provider.clone(), store.clone());

        let redirect = flow.begin_login(Some("/weather?days=5")).await.unwrap();
        let callback = provider.authorize(&redirect.url);

        let before = Utc::now();
        let outcome = flow.complete_login(&callback).await.unwrap();
        let after = Utc::now();

        let expiry = outcome.tokens.access_token_expiry;
        assert!(expiry >= before + Duration::seconds(3600));
        assert!(expiry <= after + Duration::seconds(3600));

        assert_eq!(outcome.return_url, "/weather?days=5");
        assert_eq!(outcome.session.subject, "user-1");
        assert_eq!(outcome.identity.name(), Some("Ada Lovelace"));
        assert!(outcome.identity.has_role("admin"));
        assert!(outcome.identity.get("nonce").is_none());
        assert_eq!(store.load(&outcome.session.id).unwrap(), Some(outcome.tokens));
    }

    #[tokio::test]
    async fn test_replayed_code_is_invalid_grant() {
        let provider = SimulatedProvider::new();
        let flow = coordinator(provider.clone(), store());

        let redirect = flow.begin_login(None).await.unwrap();
        let callback = provider.authorize(&redirect.url);
        flow.complete_login(&callback).await.unwrap();

        // Same code under a fresh, valid state.
        let second = flow.begin_login(None).await.unwrap();
        let replay = CallbackParams {
            code: callback.code.clone(),
            state: Some(second.state),
            ..Default::default()
        };
        let err = flow.complete_login(&replay).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidGrant(_)));
        assert_eq!(provider.exchange_calls(), 1);
    }

    #[tokio::test]
    async fn test_wrong_state_creates_no_session() {
        let provider = SimulatedProvider::new();
        let store = store();
        let flow = coordinator(provider.clone(), store.clone());

        let redirect = flow.begin_login(None).await.unwrap();
        let mut callback = provider.authorize(&redirect.url);
        callback.state = Some("forged".to_string());

        let err = flow.complete_login(&callback).await.unwrap_err();
        assert!(matches!(err, AuthError::StateMismatch));
        assert_eq!(store.session_count().unwrap(), 0);
        assert_eq!(provider.exchange_calls(), 0);

        let missing = CallbackParams {
            code: Some("code".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            flow.complete_login(&missing).await,
            Err(AuthError::StateMismatch)
        ));
    }

    #[tokio::test]
    async fn test_state_is_one_time() {
        let provider = SimulatedProvider::new();
        let flow = coordinator(provider.clone(), store());

        let redirect = flow.begin_login(None).await.unwrap();
        let callback = provider.authorize(&redirect.url);
        flow.complete_login(&callback).await.unwrap();

        assert!(matches!(
            flow.complete_login(&callback).await,
            Err(AuthError::StateMismatch)
        ));
    }

    #[tokio::test]
    async fn test_provider_error_callback() {
        let provider = SimulatedProvider::new();
        let flow = coordinator(provider.clone(), store());

        let redirect = flow.begin_login(None).await.unwrap();
        let callback = CallbackParams::from_query(&format!(
            "error=access_denied&error_description=User%20cancelled&state={}",
            redirect.state
        ));

        let err = flow.complete_login(&callback).await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::Provider { ref error, ref description }
                if error == "access_denied" && description.as_deref() == Some("User cancelled")
        ));
        assert_eq!(flow.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_pkce_verifier_mismatch_fails() {
        let provider = SimulatedProvider::new();
        let flow = coordinator(provider.clone(), store());

        let first = flow.begin_login(None).await.unwrap();
        let second = flow.begin_login(None).await.unwrap();

        // Code bound to the first login's challenge, redeemed under the second.
        let mut callback = provider.authorize(&first.url);
        callback.state = Some(second.state);

        let err = flow.complete_login(&callback).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidGrant(_)));
    }

    #[tokio::test]
    async fn test_sign_out() {
        let provider = SimulatedProvider::new();
        let store = store();
        let flow = coordinator(provider.clone(), store.clone());

        let redirect = flow.begin_login(None).await.unwrap();
        let outcome = flow
            .complete_login(&provider.authorize(&redirect.url))
            .await
            .unwrap();

        let logout = flow.sign_out(&outcome.session.id).await.unwrap();

        assert!(store.load(&outcome.session.id).unwrap().is_none());
        assert_eq!(provider.revoked(), vec![outcome.tokens.refresh_token.unwrap()]);
        assert!(flow.session_guard().is_ended(&outcome.session.id));
        assert_eq!(flow.session_guard().locked_sessions(), 0);

        let url = logout.end_session_url.unwrap();
        let query = query_of(&url);
        assert!(url.starts_with("https://idp.example.test/logout?"));
        assert_eq!(query["id_token_hint"], outcome.tokens.id_token);
        assert_eq!(
            query["post_logout_redirect_uri"],
            "https://app.example.test/signout-callback-oidc"
        );
    }

    #[test]
    fn test_sanitize_return_url() {
        assert_eq!(sanitize_return_url(Some("/weather?x=1")), "/weather?x=1");
        assert_eq!(sanitize_return_url(Some("https://evil.example")), "/");
        assert_eq!(sanitize_return_url(Some("//evil.example")), "/");
        assert_eq!(sanitize_return_url(Some("/\\evil.example")), "/");
        assert_eq!(sanitize_return_url(Some("weather")), "/");
        assert_eq!(sanitize_return_url(None), "/");
    }

    #[test]
    fn test_callback_from_query() {
        let params = CallbackParams::from_query("code=abc%2Fdef&state=s1&extra=1");
        assert_eq!(params.code.as_deref(), Some("abc/def"));
        assert_eq!(params.state.as_deref(), Some("s1"));
        assert!(params.error.is_none());
    }
}
