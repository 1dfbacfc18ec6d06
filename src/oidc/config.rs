//! OIDC client configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::discovery::ProviderMetadata;

/// Scopes every login requests regardless of configuration.
pub const REQUIRED_SCOPES: [&str; 3] = ["openid", "profile", "offline_access"];

/// Pushed Authorization Request behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PushedAuthorization {
    /// Never use PAR.
    Disable,
    /// Use PAR when the provider advertises an endpoint.
    #[default]
    UseIfAvailable,
    /// Refuse to start when the provider has no PAR endpoint.
    Require,
}

/// OIDC relying-party configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OidcConfig {
    /// Provider authority (issuer). Discovery is fetched below it.
    /// Example: "https://login.example.com/tenant/v2.0"
    #[serde(default)]
    pub authority: String,

    /// Client ID registered with the provider.
    #[serde(default)]
    pub client_id: String,

    /// Client secret. Public client when absent.
    #[serde(default)]
    pub client_secret: Option<String>,

    /// Absolute callback URL registered with the provider.
    #[serde(default)]
    pub redirect_uri: String,

    /// Where the provider sends the browser after end-session.
    #[serde(default)]
    pub post_logout_redirect_uri: Option<String>,

    /// Resource scopes requested in addition to `openid profile offline_access`.
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Pushed Authorization Request behaviour.
    #[serde(default)]
    pub pushed_authorization: PushedAuthorization,

    /// Claim type holding the display name.
    #[serde(default = "default_name_claim")]
    pub name_claim_type: String,

    /// Claim type holding roles.
    #[serde(default = "default_role_claim")]
    pub role_claim_type: String,

    /// Extra provider claim → canonical claim remapping.
    #[serde(default)]
    pub claim_mapping: HashMap<String, String>,

    /// Protocol claims dropped from the projected identity.
    #[serde(default = "default_filtered_claims")]
    pub filtered_claims: Vec<String>,

    /// Accepted id_token signing algorithms.
    #[serde(default = "default_algorithms")]
    pub allowed_algorithms: Vec<String>,

    /// Clock skew tolerance in seconds for id_token exp/nbf validation.
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: i64,

    /// Access tokens expiring within this window are refreshed.
    #[serde(default = "default_refresh_skew")]
    pub refresh_skew_secs: i64,

    /// Upper bound for one refresh, retries included.
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_ms: u64,

    /// Delay before retrying a refresh after a network error.
    #[serde(default = "default_retry_backoff")]
    pub refresh_retry_backoff_ms: u64,

    /// How long a started login waits for its callback.
    #[serde(default = "default_pending_ttl")]
    pub pending_auth_ttl_secs: u64,

    /// Maximum number of logins waiting for a callback.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,

    /// JWKS cache refresh interval in seconds.
    #[serde(default = "default_jwks_refresh")]
    pub jwks_refresh_secs: u64,

    /// Timeout for provider HTTP calls.
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    /// Static provider metadata. Discovery is skipped when set.
    #[serde(default)]
    pub metadata: Option<ProviderMetadata>,
}

fn default_name_claim() -> String {
    "name".to_string()
}

fn default_role_claim() -> String {
    "roles".to_string()
}

fn default_filtered_claims() -> Vec<String> {
    [
        "nonce", "at_hash", "c_hash", "aud", "azp", "acr", "iss", "iat", "nbf", "exp",
        "auth_time", "ipaddr", "platf", "ver",
    ]
    .iter()
    .map(|c| c.to_string())
    .collect()
}

fn default_algorithms() -> Vec<String> {
    ["RS256", "RS384", "RS512", "PS256", "ES256", "ES384"]
        .iter()
        .map(|a| a.to_string())
        .collect()
}

fn default_clock_skew() -> i64 {
    30 // 30 seconds
}

fn default_refresh_skew() -> i64 {
    60
}

fn default_refresh_timeout() -> u64 {
    10_000
}

fn default_retry_backoff() -> u64 {
    250
}

fn default_pending_ttl() -> u64 {
    600 // 10 minutes
}

fn default_max_pending() -> usize {
    10_000
}

fn default_jwks_refresh() -> u64 {
    3600 // 1 hour
}

fn default_http_timeout() -> u64 {
    10
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            authority: String::new(),
            client_id: String::new(),
            client_secret: None,
            redirect_uri: String::new(),
            post_logout_redirect_uri: None,
            scopes: Vec::new(),
            pushed_authorization: PushedAuthorization::default(),
            name_claim_type: default_name_claim(),
            role_claim_type: default_role_claim(),
            claim_mapping: HashMap::new(),
            filtered_claims: default_filtered_claims(),
            allowed_algorithms: default_algorithms(),
            clock_skew_secs: default_clock_skew(),
            refresh_skew_secs: default_refresh_skew(),
            refresh_timeout_ms: default_refresh_timeout(),
            refresh_retry_backoff_ms: default_retry_backoff(),
            pending_auth_ttl_secs: default_pending_ttl(),
            max_pending: default_max_pending(),
            jwks_refresh_secs: default_jwks_refresh(),
            http_timeout_secs: default_http_timeout(),
            metadata: None,
        }
    }
}

impl OidcConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.authority.is_empty() {
            return Err("OIDC authority is required".to_string());
        }

        if !self.authority.starts_with("https://") && !self.authority.starts_with("http://") {
            return Err("OIDC authority must be a valid HTTP(S) URL".to_string());
        }

        if self.client_id.is_empty() {
            return Err("OIDC client_id is required".to_string());
        }

        if url::Url::parse(&self.redirect_uri).is_err() {
            return Err("OIDC redirect_uri must be an absolute URL".to_string());
        }

        if self.allowed_algorithms.is_empty() {
            return Err("At least one id_token algorithm must be allowed".to_string());
        }

        for alg in &self.allowed_algorithms {
            if super::validator::parse_algorithm(alg).is_none() {
                return Err(format!("Unsupported id_token algorithm: {}", alg));
            }
        }

        if self.refresh_timeout_ms == 0 {
            return Err("refresh_timeout_ms must be greater than zero".to_string());
        }

        if self.max_pending == 0 {
            return Err("max_pending must be greater than zero".to_string());
        }

        Ok(())
    }

    /// Scope list sent to the provider: required scopes first, then
    /// configured ones, without duplicates.
    pub fn requested_scopes(&self) -> Vec<String> {
        let mut scopes: Vec<String> = Vec::new();
        for scope in REQUIRED_SCOPES
            .iter()
            .map(|s| s.to_string())
            .chain(self.scopes.iter().cloned())
        {
            if !scope.is_empty() && !scopes.contains(&scope) {
                scopes.push(scope);
            }
        }
        scopes
    }
}

/// JSON configuration for overlaying onto defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct OidcConfigJson {
    pub authority: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_uri: Option<String>,
    pub post_logout_redirect_uri: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub pushed_authorization: Option<PushedAuthorization>,
    pub name_claim_type: Option<String>,
    pub role_claim_type: Option<String>,
    #[serde(default)]
    pub claim_mapping: HashMap<String, String>,
    pub filtered_claims: Option<Vec<String>>,
    pub allowed_algorithms: Option<Vec<String>>,
    pub clock_skew_secs: Option<i64>,
    pub refresh_skew_secs: Option<i64>,
    pub refresh_timeout_ms: Option<u64>,
    pub refresh_retry_backoff_ms: Option<u64>,
    pub pending_auth_ttl_secs: Option<u64>,
    pub max_pending: Option<usize>,
    pub jwks_refresh_secs: Option<u64>,
    pub http_timeout_secs: Option<u64>,
    pub metadata: Option<ProviderMetadata>,
}

impl OidcConfigJson {
    /// Apply JSON config to existing config.
    pub fn apply_to(&self, config: &mut OidcConfig) {
        if let Some(ref authority) = self.authority {
            config.authority = authority.clone();
        }
        if let Some(ref client_id) = self.client_id {
            config.client_id = client_id.clone();
        }
        if let Some(ref secret) = self.client_secret {
            config.client_secret = Some(secret.clone());
        }
        if let Some(ref uri) = self.redirect_uri {
            config.redirect_uri = uri.clone();
        }
        if let Some(ref uri) = self.post_logout_redirect_uri {
            config.post_logout_redirect_uri = Some(uri.clone());
        }
        if !self.scopes.is_empty() {
            config.scopes = self.scopes.clone();
        }
        if let Some(par) = self.pushed_authorization {
            config.pushed_authorization = par;
        }
        if let Some(ref claim) = self.name_claim_type {
            config.name_claim_type = claim.clone();
        }
        if let Some(ref claim) = self.role_claim_type {
            config.role_claim_type = claim.clone();
        }
        if !self.claim_mapping.is_empty() {
            config.claim_mapping = self.claim_mapping.clone();
        }
        if let Some(ref filtered) = self.filtered_claims {
            config.filtered_claims = filtered.clone();
        }
        if let Some(ref algs) = self.allowed_algorithms {
            config.allowed_algorithms = algs.clone();
        }
        if let Some(skew) = self.clock_skew_secs {
            config.clock_skew_secs = skew;
        }
        if let Some(skew) = self.refresh_skew_secs {
            config.refresh_skew_secs = skew;
        }
        if let Some(timeout) = self.refresh_timeout_ms {
            config.refresh_timeout_ms = timeout;
        }
        if let Some(backoff) = self.refresh_retry_backoff_ms {
            config.refresh_retry_backoff_ms = backoff;
        }
        if let Some(ttl) = self.pending_auth_ttl_secs {
            config.pending_auth_ttl_secs = ttl;
        }
        if let Some(max) = self.max_pending {
            config.max_pending = max;
        }
        if let Some(refresh) = self.jwks_refresh_secs {
            config.jwks_refresh_secs = refresh;
        }
        if let Some(timeout) = self.http_timeout_secs {
            config.http_timeout_secs = timeout;
        }
        if let Some(ref metadata) = self.metadata {
            config.metadata = Some(metadata.clone());
        }
    }
}
