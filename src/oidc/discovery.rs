//! Provider metadata from `.well-known/openid-configuration`.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Subset of the OpenID provider metadata document the agent uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
    #[serde(default)]
    pub revocation_endpoint: Option<String>,
    #[serde(default)]
    pub pushed_authorization_request_endpoint: Option<String>,
    #[serde(default)]
    pub require_pushed_authorization_requests: bool,
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
}

impl ProviderMetadata {
    /// Whether the provider advertises a PAR endpoint.
    pub fn supports_par(&self) -> bool {
        self.pushed_authorization_request_endpoint.is_some()
    }

    /// Discovery document URL for an authority.
    pub fn discovery_url(authority: &str) -> String {
        format!(
            "{}/.well-known/openid-configuration",
            authority.trim_end_matches('/')
        )
    }

    /// Fetch and check the discovery document for `authority`.
    pub async fn discover(http: &reqwest::Client, authority: &str) -> Result<Self> {
        let url = Self::discovery_url(authority);
        debug!(url = %url, "Fetching OIDC discovery document");

        let response = http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch discovery document from {}", url))?;

        if !response.status().is_success() {
            bail!("Discovery document fetch failed with status {}", response.status());
        }

        let metadata: ProviderMetadata = response
            .json()
            .await
            .context("Failed to parse discovery document")?;

        metadata.check_issuer(authority)?;

        if !metadata.code_challenge_methods_supported.is_empty()
            && !metadata
                .code_challenge_methods_supported
                .iter()
                .any(|m| m == "S256")
        {
            bail!("Provider does not support the S256 PKCE challenge method");
        }

        info!(
            issuer = %metadata.issuer,
            par = metadata.supports_par(),
            end_session = metadata.end_session_endpoint.is_some(),
            "Loaded OIDC provider metadata"
        );

        Ok(metadata)
    }

    /// The issuer must name the configured authority.
    pub fn check_issuer(&self, authority: &str) -> Result<()> {
        if self.issuer.trim_end_matches('/') != authority.trim_end_matches('/') {
            bail!(
                "Discovery issuer {} does not match authority {}",
                self.issuer,
                authority
            );
        }
        Ok(())
    }
}
