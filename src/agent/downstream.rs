//! HTTP client for APIs that accept the session's access token.

use anyhow::{Context, Result};
use reqwest::{Method, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::flow::TokenRefreshManager;
use crate::session::SessionId;

/// Calls a downstream API on behalf of a session.
///
/// The access token is fetched from the refresh manager right before every
/// request, so a token close to expiry is refreshed first. Token failures
/// surface as an [`AuthError`](crate::error::AuthError) that callers can
/// `downcast_ref`.
pub struct DownstreamApi {
    http: reqwest::Client,
    base_url: Url,
    manager: Arc<TokenRefreshManager>,
}

impl DownstreamApi {
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        manager: Arc<TokenRefreshManager>,
    ) -> Result<Self> {
        let mut base_url =
            Url::parse(base_url).with_context(|| format!("Invalid base URL: {}", base_url))?;
        // Relative paths join below the base, not beside it.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http,
            base_url,
            manager,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Send a request with an optional JSON body. Non-success statuses are errors.
    pub async fn send<B: Serialize + ?Sized>(
        &self,
        session_id: &SessionId,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response> {
        let url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .with_context(|| format!("Invalid downstream path: {}", path))?;

        let token = self.manager.get_valid_access_token(session_id).await?;
        debug!(
            session_id = %session_id,
            method = %method,
            url = %url,
            refreshed = token.refreshed,
            "Calling downstream API"
        );

        let mut request = self.http.request(method, url.clone()).bearer_auth(&token.value);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Downstream request to {} failed", url))?;

        response
            .error_for_status()
            .with_context(|| format!("Downstream API returned an error for {}", url))
    }

    pub async fn get(&self, session_id: &SessionId, path: &str) -> Result<Response> {
        self.send::<()>(session_id, Method::GET, path, None).await
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        session_id: &SessionId,
        path: &str,
    ) -> Result<T> {
        self.get(session_id, path)
            .await?
            .json()
            .await
            .context("Failed to decode downstream response")
    }

    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        session_id: &SessionId,
        path: &str,
        body: &B,
    ) -> Result<T> {
        self.send(session_id, Method::POST, path, Some(body))
            .await?
            .json()
            .await
            .context("Failed to decode downstream response")
    }
}
