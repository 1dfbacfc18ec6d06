//! Test fixtures: signing keys, an in-process provider and config helpers.

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::AuthError;
use crate::flow::{AuthorizationFlowCoordinator, CallbackParams, LoginOutcome};
use crate::oidc::client::{PushedAuthorizationResponse, TokenResponse};
use crate::oidc::jwks::Jwks;
use crate::oidc::pkce::s256;
use crate::oidc::{JwksCache, OidcConfig, ProviderClient, ProviderMetadata};
use crate::session::TokenStore;

pub const ISSUER: &str = "https://idp.example.test";
pub const CLIENT_ID: &str = "client-123";
pub const REDIRECT_URI: &str = "https://app.example.test/signin-oidc";
pub const KID: &str = "test-key";

const SIGNING_KEY: &str = include_str!("../fixtures/rsa-private.pem");
const WRONG_SIGNING_KEY: &str = include_str!("../fixtures/wrong-rsa-private.pem");
const JWKS: &str = include_str!("../fixtures/jwks.json");

pub fn test_metadata() -> ProviderMetadata {
    ProviderMetadata {
        issuer: ISSUER.to_string(),
        authorization_endpoint: format!("{}/authorize", ISSUER),
        token_endpoint: format!("{}/token", ISSUER),
        jwks_uri: format!("{}/keys", ISSUER),
        end_session_endpoint: Some(format!("{}/logout", ISSUER)),
        revocation_endpoint: Some(format!("{}/revoke", ISSUER)),
        pushed_authorization_request_endpoint: Some(format!("{}/par", ISSUER)),
        require_pushed_authorization_requests: false,
        code_challenge_methods_supported: vec!["S256".to_string()],
    }
}

pub fn test_oidc_config() -> OidcConfig {
    OidcConfig {
        authority: ISSUER.to_string(),
        client_id: CLIENT_ID.to_string(),
        redirect_uri: REDIRECT_URI.to_string(),
        post_logout_redirect_uri: Some("https://app.example.test/signout-callback-oidc".to_string()),
        scopes: vec!["api://weather/Weather.Get".to_string()],
        metadata: Some(test_metadata()),
        ..Default::default()
    }
}

pub fn fixture_jwks() -> Arc<JwksCache> {
    let jwks: Jwks = serde_json::from_str(JWKS).unwrap();
    Arc::new(JwksCache::from_jwks(jwks).unwrap())
}

fn sign_with(pem: &str, claims: &Value) -> String {
    let mut header = Header::new(jsonwebtoken::Algorithm::RS256);
    header.kid = Some(KID.to_string());
    let key = EncodingKey::from_rsa_pem(pem.as_bytes()).unwrap();
    encode(&header, claims, &key).unwrap()
}

/// RS256 token signed with the key published in `fixtures/jwks.json`.
pub fn sign_token(claims: &Value) -> String {
    sign_with(SIGNING_KEY, claims)
}

/// Same kid, different key.
pub fn sign_token_with_wrong_key(claims: &Value) -> String {
    sign_with(WRONG_SIGNING_KEY, claims)
}

pub fn id_token_claims(subject: &str, nonce: &str) -> Value {
    let now = Utc::now().timestamp();
    json!({
        "iss": ISSUER,
        "aud": CLIENT_ID,
        "sub": subject,
        "nonce": nonce,
        "iat": now,
        "nbf": now,
        "exp": now + 3600,
        "name": "Ada Lovelace",
        "preferred_username": "ada@example.test",
        "roles": ["admin", "reader"],
        "tid": "tenant-1"
    })
}

/// Coordinator over the simulated provider with fixture keys.
pub fn coordinator(
    provider: Arc<SimulatedProvider>,
    store: Arc<dyn TokenStore>,
) -> AuthorizationFlowCoordinator {
    AuthorizationFlowCoordinator::new(
        test_oidc_config(),
        test_metadata(),
        provider,
        fixture_jwks(),
        store,
        3600,
    )
    .unwrap()
}

/// Run a full login against the simulated provider.
pub async fn sign_in(
    flow: &AuthorizationFlowCoordinator,
    provider: &SimulatedProvider,
) -> LoginOutcome {
    let redirect = flow.begin_login(None).await.unwrap();
    flow.complete_login(&provider.authorize(&redirect.url))
        .await
        .unwrap()
}

struct IssuedCode {
    nonce: String,
    code_challenge: String,
}

#[derive(Default)]
struct ProviderState {
    codes: HashMap<String, IssuedCode>,
    pushed: HashMap<String, Vec<(String, String)>>,
    live_refresh_tokens: HashSet<String>,
    revoked: Vec<String>,
    counter: u64,
}

/// In-process identity provider enforcing one-time codes, PKCE and
/// refresh-token rotation.
pub struct SimulatedProvider {
    state: Mutex<ProviderState>,
    expires_in: AtomicU64,
    rotate: AtomicBool,
    refresh_delay_ms: AtomicU64,
    refresh_id_token: Mutex<Option<String>>,
    network_failures: AtomicUsize,
    refresh_calls: AtomicUsize,
    exchange_calls: AtomicUsize,
}

impl SimulatedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ProviderState::default()),
            expires_in: AtomicU64::new(3600),
            rotate: AtomicBool::new(true),
            refresh_delay_ms: AtomicU64::new(0),
            refresh_id_token: Mutex::new(None),
            network_failures: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            exchange_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_expires_in(&self, secs: u64) {
        self.expires_in.store(secs, Ordering::SeqCst);
    }

    pub fn set_rotation(&self, rotate: bool) {
        self.rotate.store(rotate, Ordering::SeqCst);
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        self.refresh_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// id_token to return from subsequent refresh grants.
    pub fn set_refresh_id_token(&self, id_token: Option<String>) {
        *self.refresh_id_token.lock().unwrap() = id_token;
    }

    /// Fail the next `n` refresh calls with a network error.
    pub fn fail_next_refreshes(&self, n: usize) {
        self.network_failures.store(n, Ordering::SeqCst);
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn exchange_calls(&self) -> usize {
        self.exchange_calls.load(Ordering::SeqCst)
    }

    pub fn pushed_count(&self) -> usize {
        self.state.lock().unwrap().pushed.len()
    }

    pub fn revoked(&self) -> Vec<String> {
        self.state.lock().unwrap().revoked.clone()
    }

    /// Revoke every outstanding refresh token.
    pub fn revoke_all(&self) {
        self.state.lock().unwrap().live_refresh_tokens.clear();
    }

    /// Act as the user approving the login at `authorization_url`; returns
    /// what the provider would append to the redirect URI.
    pub fn authorize(&self, authorization_url: &str) -> CallbackParams {
        let url = url::Url::parse(authorization_url).unwrap();
        let mut params: HashMap<String, String> = url.query_pairs().into_owned().collect();

        let mut state = self.state.lock().unwrap();
        if let Some(request_uri) = params.get("request_uri").cloned() {
            let pushed = state.pushed.get(&request_uri).cloned().unwrap();
            params = pushed.into_iter().collect();
        }

        assert_eq!(params["client_id"], CLIENT_ID);
        assert_eq!(params["code_challenge_method"], "S256");

        state.counter += 1;
        let code = format!("code-{}", state.counter);
        state.codes.insert(
            code.clone(),
            IssuedCode {
                nonce: params["nonce"].clone(),
                code_challenge: params["code_challenge"].clone(),
            },
        );

        CallbackParams {
            code: Some(code),
            state: params.get("state").cloned(),
            ..Default::default()
        }
    }

    fn issue(&self, state: &mut ProviderState) -> (String, String) {
        state.counter += 1;
        let access_token = format!("at-{}", state.counter);
        let refresh_token = format!("rt-{}", state.counter);
        state.live_refresh_tokens.insert(refresh_token.clone());
        (access_token, refresh_token)
    }
}

#[async_trait]
impl ProviderClient for SimulatedProvider {
    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse, AuthError> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();

        let issued = state
            .codes
            .remove(code)
            .ok_or_else(|| AuthError::InvalidGrant("unknown or used code".to_string()))?;
        if s256(code_verifier) != issued.code_challenge {
            return Err(AuthError::InvalidGrant("PKCE verification failed".to_string()));
        }

        let (access_token, refresh_token) = self.issue(&mut state);
        Ok(TokenResponse {
            access_token,
            token_type: Some("Bearer".to_string()),
            expires_in: Some(self.expires_in.load(Ordering::SeqCst)),
            refresh_token: Some(refresh_token),
            id_token: Some(sign_token(&id_token_claims("user-1", &issued.nonce))),
            scope: Some("openid profile offline_access api://weather/Weather.Get".to_string()),
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, AuthError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.refresh_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let failed = self
            .network_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(AuthError::Network("connection reset".to_string()));
        }

        let mut state = self.state.lock().unwrap();
        if !state.live_refresh_tokens.contains(refresh_token) {
            return Err(AuthError::InvalidGrant(
                "refresh token revoked or rotated".to_string(),
            ));
        }

        let (access_token, new_refresh_token) = self.issue(&mut state);
        let rotated = if self.rotate.load(Ordering::SeqCst) {
            state.live_refresh_tokens.remove(refresh_token);
            Some(new_refresh_token)
        } else {
            state.live_refresh_tokens.remove(&new_refresh_token);
            None
        };

        Ok(TokenResponse {
            access_token,
            token_type: Some("Bearer".to_string()),
            expires_in: Some(self.expires_in.load(Ordering::SeqCst)),
            refresh_token: rotated,
            id_token: self.refresh_id_token.lock().unwrap().clone(),
            scope: None,
        })
    }

    async fn push_authorization(
        &self,
        params: &[(String, String)],
    ) -> Result<PushedAuthorizationResponse, AuthError> {
        let mut state = self.state.lock().unwrap();
        state.counter += 1;
        let request_uri = format!("urn:ietf:params:oauth:request_uri:{}", state.counter);
        state.pushed.insert(request_uri.clone(), params.to_vec());
        Ok(PushedAuthorizationResponse {
            request_uri,
            expires_in: 60,
        })
    }

    async fn revoke(&self, token: &str, _token_type_hint: &str) -> Result<(), AuthError> {
        let mut state = self.state.lock().unwrap();
        state.live_refresh_tokens.remove(token);
        state.revoked.push(token.to_string());
        Ok(())
    }
}
