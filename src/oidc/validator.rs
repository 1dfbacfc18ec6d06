//! id_token validation.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::config::OidcConfig;
use super::jwks::JwksCache;
use crate::error::AuthError;

/// Claims of a validated id_token.
#[derive(Debug, Clone)]
pub struct IdTokenClaims {
    /// The `sub` claim.
    pub subject: String,
    /// Every claim in the token payload.
    pub claims: HashMap<String, Value>,
}

/// Checks id_tokens against the provider's keys and the client registration.
pub struct IdTokenValidator {
    issuer: String,
    client_id: String,
    allowed_algorithms: Vec<Algorithm>,
    leeway_secs: u64,
    jwks: Arc<JwksCache>,
}

impl IdTokenValidator {
    pub fn new(config: &OidcConfig, issuer: &str, jwks: Arc<JwksCache>) -> Self {
        Self {
            issuer: issuer.to_string(),
            client_id: config.client_id.clone(),
            allowed_algorithms: config
                .allowed_algorithms
                .iter()
                .filter_map(|a| parse_algorithm(a))
                .collect(),
            leeway_secs: config.clock_skew_secs.max(0) as u64,
            jwks,
        }
    }

    /// Verify signature, `iss`, `aud`, `exp` and the login `nonce`.
    pub async fn validate(
        &self,
        token: &str,
        expected_nonce: &str,
    ) -> Result<IdTokenClaims, AuthError> {
        let claims = self.verify(token).await?;

        match claims.get("nonce").and_then(Value::as_str) {
            Some(nonce) if nonce == expected_nonce => {}
            Some(_) => return Err(AuthError::TokenValidation("nonce mismatch".to_string())),
            None => return Err(AuthError::TokenValidation("nonce missing".to_string())),
        }

        let subject = subject_of(&claims)?;
        debug!(subject = %subject, "id_token validated");

        Ok(IdTokenClaims { subject, claims })
    }

    /// Check an id_token returned by a refresh grant. Same checks as at
    /// login except the nonce; `sub` must not change.
    pub async fn validate_refreshed(
        &self,
        token: &str,
        expected_subject: &str,
    ) -> Result<IdTokenClaims, AuthError> {
        let claims = self.verify(token).await?;

        let subject = subject_of(&claims)?;
        if subject != expected_subject {
            return Err(AuthError::TokenValidation("subject changed".to_string()));
        }

        Ok(IdTokenClaims { subject, claims })
    }

    async fn verify(&self, token: &str) -> Result<HashMap<String, Value>, AuthError> {
        let header = decode_header(token)
            .map_err(|e| AuthError::TokenValidation(format!("malformed id_token: {}", e)))?;

        debug!(kid = ?header.kid, alg = ?header.alg, "Validating id_token");

        if !self.allowed_algorithms.contains(&header.alg) {
            return Err(AuthError::TokenValidation(format!(
                "id_token algorithm {:?} not allowed",
                header.alg
            )));
        }

        let key = match header.kid {
            Some(ref kid) => self.jwks.get_key(kid, header.alg).await,
            None => self.jwks.get_default_key(header.alg).await,
        }
        .map_err(key_error)?;

        let mut validation = Validation::new(header.alg);
        validation.leeway = self.leeway_secs;
        validation.validate_nbf = true;
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.client_id]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        decode::<HashMap<String, Value>>(token, &key, &validation)
            .map(|data| data.claims)
            .map_err(|e| AuthError::TokenValidation(describe(e.kind())))
    }
}

/// The non-empty `sub` claim.
pub fn subject_of(claims: &HashMap<String, Value>) -> Result<String, AuthError> {
    claims
        .get("sub")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or_else(|| AuthError::TokenValidation("sub claim is empty".to_string()))
}

/// Decode a JWT payload without checking it. Only for tokens this process
/// validated earlier and has held since.
pub fn read_claims_unverified(token: &str) -> Option<HashMap<String, Value>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Parse an algorithm name. Symmetric and `none` algorithms are refused.
pub fn parse_algorithm(name: &str) -> Option<Algorithm> {
    match name {
        "RS256" => Some(Algorithm::RS256),
        "RS384" => Some(Algorithm::RS384),
        "RS512" => Some(Algorithm::RS512),
        "PS256" => Some(Algorithm::PS256),
        "PS384" => Some(Algorithm::PS384),
        "PS512" => Some(Algorithm::PS512),
        "ES256" => Some(Algorithm::ES256),
        "ES384" => Some(Algorithm::ES384),
        _ => None,
    }
}

fn key_error(e: anyhow::Error) -> AuthError {
    if e.chain().any(|cause| cause.is::<reqwest::Error>()) {
        AuthError::Network(format!("{:#}", e))
    } else {
        AuthError::TokenValidation(format!("{:#}", e))
    }
}

fn describe(kind: &ErrorKind) -> String {
    match kind {
        ErrorKind::ExpiredSignature => "id_token expired".to_string(),
        ErrorKind::ImmatureSignature => "id_token not yet valid".to_string(),
        ErrorKind::InvalidIssuer => "issuer mismatch".to_string(),
        ErrorKind::InvalidAudience => "audience mismatch".to_string(),
        ErrorKind::InvalidSignature => "invalid signature".to_string(),
        ErrorKind::MissingRequiredClaim(claim) => format!("missing claim {}", claim),
        other => format!("invalid id_token: {:?}", other),
    }
}
