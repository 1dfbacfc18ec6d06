//! Session agent: routes login, callback and logout, and guards protected
//! paths with the session cookie.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::{AgentConfig, StoreConfig};
use super::protocol::{AgentRequest, AgentResponse, AuditMetadata, HeaderOp};
use crate::error::AuthError;
use crate::flow::{
    sanitize_return_url, AuthorizationFlowCoordinator, CallbackParams, LogoutOutcome, NoopEvents,
    RefreshPolicy, SessionEvents, SessionGuard, TokenRefreshManager,
};
use crate::oidc::validator::read_claims_unverified;
use crate::oidc::{
    spawn_jwks_refresh_task, HttpProviderClient, JwksCache, ProviderClient, ProviderMetadata,
};
use crate::session::{
    spawn_cleanup_task, MemoryTokenStore, RedbTokenStore, Session, SessionCookieCodec,
    TokenRecord, TokenStore,
};

/// OIDC session agent.
pub struct SessionAgent {
    config: AgentConfig,
    codec: SessionCookieCodec,
    store: Arc<dyn TokenStore>,
    flow: Arc<AuthorizationFlowCoordinator>,
    refresh: Arc<TokenRefreshManager>,
    jwks: Arc<JwksCache>,
}

impl SessionAgent {
    /// Assemble an agent from already-built parts.
    pub fn new(
        config: AgentConfig,
        metadata: ProviderMetadata,
        client: Arc<dyn ProviderClient>,
        jwks: Arc<JwksCache>,
        store: Arc<dyn TokenStore>,
        events: Arc<dyn SessionEvents>,
    ) -> Result<Self> {
        config.validate().map_err(|e| anyhow!(e))?;

        let codec = SessionCookieCodec::new(config.cookie.clone())?;
        // Ended sessions are remembered as long as their cookies stay valid.
        let guard = Arc::new(SessionGuard::new(config.cookie.ttl_secs));
        let flow = AuthorizationFlowCoordinator::new(
            config.oidc.clone(),
            metadata,
            client.clone(),
            jwks.clone(),
            store.clone(),
            config.cookie.ttl_secs,
        )?
        .with_events(events.clone())
        .with_session_guard(guard.clone());
        let refresh = TokenRefreshManager::new(
            store.clone(),
            client,
            flow.id_token_validator().clone(),
            RefreshPolicy::from_config(&config.oidc),
        )
        .with_events(events)
        .with_session_guard(guard);

        Ok(Self {
            config,
            codec,
            store,
            flow: Arc::new(flow),
            refresh: Arc::new(refresh),
            jwks,
        })
    }

    /// Discover the provider, load its keys and open the token store.
    pub async fn connect(config: AgentConfig) -> Result<Self> {
        config.validate().map_err(|e| anyhow!(e))?;

        let http = HttpProviderClient::build_http(&config.oidc)?;
        let metadata = match config.oidc.metadata {
            Some(ref metadata) => metadata.clone(),
            None => ProviderMetadata::discover(&http, &config.oidc.authority).await?,
        };
        let jwks = JwksCache::fetch(
            http.clone(),
            metadata.jwks_uri.clone(),
            config.oidc.jwks_refresh_secs,
        )
        .await?;
        let client = HttpProviderClient::new(http, metadata.clone(), &config.oidc);
        let store = open_store(&config)?;

        Self::new(
            config,
            metadata,
            Arc::new(client),
            Arc::new(jwks),
            store,
            Arc::new(NoopEvents),
        )
    }

    /// Start the cleanup and JWKS refresh tasks.
    pub fn spawn_background_tasks(&self) -> Vec<JoinHandle<()>> {
        vec![
            spawn_cleanup_task(
                self.store.clone(),
                self.flow.clone(),
                self.config.cleanup_interval_secs,
            ),
            spawn_jwks_refresh_task(self.jwks.clone(), self.config.oidc.jwks_refresh_secs),
        ]
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn flow(&self) -> &Arc<AuthorizationFlowCoordinator> {
        &self.flow
    }

    pub fn refresh_manager(&self) -> &Arc<TokenRefreshManager> {
        &self.refresh
    }

    pub fn jwks(&self) -> &Arc<JwksCache> {
        &self.jwks
    }

    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    /// Decide what happens to a request.
    pub async fn handle(&self, request: &AgentRequest) -> AgentResponse {
        let path = request.path.as_str();
        let method = request.method.as_str();

        if path == self.config.login_path && method == "GET" {
            return self.handle_login(request).await;
        }
        if path == self.config.callback_path && method == "GET" {
            return self.handle_callback(request).await;
        }
        if path == self.config.logout_path && method == "POST" {
            return self.handle_logout(request).await;
        }
        if path == self.config.signed_out_callback_path && method == "GET" {
            return AgentResponse::redirect("/").with_audit(audit(&["signout"], &[]));
        }

        if !self.config.is_protected_path(path) {
            return AgentResponse::default_allow();
        }

        self.handle_protected(request).await
    }

    fn read_session(&self, request: &AgentRequest) -> Option<Session> {
        let header = request.header("cookie")?;
        let value = self.codec.read_cookie(header)?;
        self.codec.decode(value)
    }

    async fn handle_login(&self, request: &AgentRequest) -> AgentResponse {
        let return_url = request.query_param("returnUrl");
        match self.flow.begin_login(return_url.as_deref()).await {
            Ok(redirect) => {
                AgentResponse::redirect(redirect.url).with_audit(audit(&["login"], &[]))
            }
            Err(e) => {
                warn!(kind = e.kind(), error = %e, "Failed to start login");
                AgentResponse::block(502, Some("Sign-in unavailable".to_string()))
                    .with_audit(audit(&["login", "error"], &[&reason_code(&e)]))
            }
        }
    }

    async fn handle_callback(&self, request: &AgentRequest) -> AgentResponse {
        let params = CallbackParams::from_query(request.query.as_deref().unwrap_or(""));

        let outcome = match self.flow.complete_login(&params).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(kind = e.kind(), error = %e, "Sign-in failed");
                return AgentResponse::block(401, Some("Sign-in failed".to_string()))
                    .with_audit(audit(&["callback", "blocked"], &[&reason_code(&e)]));
            }
        };

        let session = if self.config.cookie.embed_tokens {
            outcome.session.with_tokens(outcome.tokens)
        } else {
            outcome.session
        };

        match self.codec.encode(&session) {
            Ok(value) => AgentResponse::redirect(outcome.return_url)
                .add_response_header(HeaderOp::Set {
                    name: "Set-Cookie".to_string(),
                    value: self.codec.set_cookie(&value),
                })
                .with_audit(audit(&["callback", "session_created"], &[])),
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "Failed to encode session cookie");
                AgentResponse::block(500, Some("Failed to create session".to_string()))
            }
        }
    }

    async fn handle_logout(&self, request: &AgentRequest) -> AgentResponse {
        let outcome = match self.read_session(request) {
            Some(session) => match self.flow.sign_out(&session.id).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(session_id = %session.id, kind = e.kind(), error = %e, "Sign-out failed");
                    LogoutOutcome::default()
                }
            },
            None => LogoutOutcome::default(),
        };

        let location = outcome.end_session_url.unwrap_or_else(|| {
            sanitize_return_url(request.query_param("returnUrl").as_deref())
        });

        AgentResponse::redirect(location)
            .add_response_header(HeaderOp::Set {
                name: "Set-Cookie".to_string(),
                value: self.codec.clear_cookie(),
            })
            .with_audit(audit(&["logout"], &[]))
    }

    async fn handle_protected(&self, request: &AgentRequest) -> AgentResponse {
        let Some(session) = self.read_session(request) else {
            debug!(path = %request.path, "No session cookie");
            return self.challenge(request, "NO_SESSION");
        };

        if self.config.cookie.embed_tokens {
            if let Some(ref tokens) = session.tokens {
                if let Err(e) = self.refresh.adopt(&session.id, tokens).await {
                    warn!(session_id = %session.id, error = %e, "Failed to adopt cookie tokens");
                }
            }
        }

        match self.refresh.get_valid_tokens(&session.id).await {
            Ok(valid) => self.allow_with_identity(request, &session, valid.record),
            Err(e) if e.requires_reauthentication() => {
                info!(session_id = %session.id, kind = e.kind(), "Session needs a new login");
                self.challenge(request, &reason_code(&e))
                    .add_response_header(HeaderOp::Set {
                        name: "Set-Cookie".to_string(),
                        value: self.codec.clear_cookie(),
                    })
            }
            Err(e @ (AuthError::RefreshTimeout | AuthError::Network(_))) => {
                warn!(session_id = %session.id, kind = e.kind(), "Token refresh unavailable");
                AgentResponse::block(503, Some("Token refresh unavailable".to_string()))
                    .with_audit(audit(&["session", "error"], &[&reason_code(&e)]))
            }
            Err(e) => {
                warn!(session_id = %session.id, kind = e.kind(), error = %e, "Session check failed");
                AgentResponse::block(500, Some("Internal error".to_string()))
                    .with_audit(audit(&["session", "error"], &[&reason_code(&e)]))
            }
        }
    }

    fn allow_with_identity(
        &self,
        request: &AgentRequest,
        session: &Session,
        record: TokenRecord,
    ) -> AgentResponse {
        let identity = read_claims_unverified(&record.id_token)
            .map(|claims| self.flow.projector().project(&claims))
            .unwrap_or_default();

        let mut response = AgentResponse::default_allow()
            .add_request_header(HeaderOp::Set {
                name: "Authorization".to_string(),
                value: format!("Bearer {}", record.access_token),
            })
            .add_request_header(HeaderOp::Set {
                name: self.config.user_id_header.clone(),
                value: session.subject.clone(),
            });

        // Inbound claim headers never reach upstream.
        let prefix = self.config.claim_header_prefix.to_ascii_lowercase();
        for name in request.headers.keys() {
            if name.to_ascii_lowercase().starts_with(&prefix) {
                response = response.add_request_header(HeaderOp::Remove { name: name.clone() });
            }
        }

        for (claim, values) in identity.iter() {
            response = response.add_request_header(HeaderOp::Set {
                name: format!("{}{}", self.config.claim_header_prefix, header_token(claim)),
                value: header_value(&values.join(",")),
            });
        }

        if self.config.cookie.embed_tokens && session.tokens.as_ref() != Some(&record) {
            match self.codec.encode(&session.with_tokens(record)) {
                Ok(value) => {
                    debug!(session_id = %session.id, "Re-issuing session cookie with new tokens");
                    response = response.add_response_header(HeaderOp::Set {
                        name: "Set-Cookie".to_string(),
                        value: self.codec.set_cookie(&value),
                    });
                }
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "Failed to re-issue session cookie");
                }
            }
        }

        response.with_audit(audit(&["session", "allowed"], &[]))
    }

    /// Send browsers to login; other callers get 401.
    fn challenge(&self, request: &AgentRequest, reason: &str) -> AgentResponse {
        if request.method == "GET" {
            let location = format!(
                "{}?returnUrl={}",
                self.config.login_path,
                urlencoding::encode(&request.path_and_query())
            );
            AgentResponse::redirect(location).with_audit(audit(&["challenge"], &[reason]))
        } else {
            AgentResponse::block(401, Some("Unauthorized".to_string()))
                .with_audit(audit(&["blocked"], &[reason]))
        }
    }
}

/// Open the configured token store. Entries live as long as the session cookie.
pub fn open_store(config: &AgentConfig) -> Result<Arc<dyn TokenStore>> {
    let ttl = config.cookie.ttl_secs;
    Ok(match config.store {
        StoreConfig::Memory => Arc::new(MemoryTokenStore::new(ttl)),
        StoreConfig::Redb { ref path } => {
            info!(path = ?path, "Opening redb token store");
            Arc::new(RedbTokenStore::open(path.clone(), ttl)?)
        }
    })
}

fn audit(tags: &[&str], reason_codes: &[&str]) -> AuditMetadata {
    AuditMetadata {
        tags: ["auth", "oidc"]
            .iter()
            .chain(tags)
            .map(|t| t.to_string())
            .collect(),
        reason_codes: reason_codes.iter().map(|r| r.to_string()).collect(),
    }
}

fn reason_code(err: &AuthError) -> String {
    err.kind().to_ascii_uppercase()
}

/// Claim name as a header token: anything outside `[A-Za-z0-9-]` becomes `-`.
fn header_token(claim: &str) -> String {
    claim
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

/// Printable ASCII passes through, anything else is percent-encoded.
fn header_value(value: &str) -> String {
    if value.chars().all(|c| c == ' ' || c.is_ascii_graphic()) {
        value.to_string()
    } else {
        urlencoding::encode(value).into_owned()
    }
}
