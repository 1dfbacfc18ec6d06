//! Session cookie encoding.
//!
//! Cookies are AES-256-GCM sealed MessagePack, base64url without padding.
//! The cookie name is bound in as associated data so a value cannot be
//! replayed under another cookie name.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::types::Session;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Session cookie configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CookieConfig {
    /// Cookie name.
    #[serde(default = "default_cookie_name")]
    pub name: String,

    /// 32-byte encryption key, hex encoded.
    #[serde(default)]
    pub secret: String,

    /// Cookie path.
    #[serde(default = "default_cookie_path")]
    pub path: String,

    /// Cookie domain.
    #[serde(default)]
    pub domain: Option<String>,

    /// Require HTTPS for cookies (Secure flag).
    #[serde(default = "default_true")]
    pub secure: bool,

    /// Set HttpOnly flag on cookies.
    #[serde(default = "default_true")]
    pub http_only: bool,

    /// SameSite attribute (Strict, Lax, None).
    #[serde(default = "default_same_site")]
    pub same_site: String,

    /// Session lifetime in seconds.
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,

    /// Carry the token record inside the cookie instead of only the session.
    #[serde(default)]
    pub embed_tokens: bool,
}

fn default_cookie_name() -> String {
    ".oidc.session".to_string()
}

fn default_cookie_path() -> String {
    "/".to_string()
}

fn default_true() -> bool {
    true
}

fn default_same_site() -> String {
    "Lax".to_string()
}

fn default_ttl() -> u64 {
    14 * 24 * 3600 // 14 days
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            name: default_cookie_name(),
            secret: String::new(),
            path: default_cookie_path(),
            domain: None,
            secure: true,
            http_only: true,
            same_site: default_same_site(),
            ttl_secs: default_ttl(),
            embed_tokens: false,
        }
    }
}

impl CookieConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("Cookie name is required".to_string());
        }

        match hex::decode(&self.secret) {
            Ok(bytes) if bytes.len() == 32 => {}
            _ => return Err("Cookie secret must be 64 hex characters (32 bytes)".to_string()),
        }

        if !["Strict", "Lax", "None"].contains(&self.same_site.as_str()) {
            return Err(format!("Invalid SameSite value: {}", self.same_site));
        }

        if self.same_site == "None" && !self.secure {
            return Err("SameSite=None requires the Secure flag".to_string());
        }

        Ok(())
    }
}

/// JSON configuration for overlaying onto defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct CookieConfigJson {
    pub name: Option<String>,
    pub secret: Option<String>,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub secure: Option<bool>,
    pub http_only: Option<bool>,
    pub same_site: Option<String>,
    pub ttl_secs: Option<u64>,
    pub embed_tokens: Option<bool>,
}

impl CookieConfigJson {
    /// Apply JSON config to existing config.
    pub fn apply_to(&self, config: &mut CookieConfig) {
        if let Some(ref name) = self.name {
            config.name = name.clone();
        }
        if let Some(ref secret) = self.secret {
            config.secret = secret.clone();
        }
        if let Some(ref path) = self.path {
            config.path = path.clone();
        }
        if let Some(ref domain) = self.domain {
            config.domain = Some(domain.clone());
        }
        if let Some(secure) = self.secure {
            config.secure = secure;
        }
        if let Some(http_only) = self.http_only {
            config.http_only = http_only;
        }
        if let Some(ref same_site) = self.same_site {
            config.same_site = same_site.clone();
        }
        if let Some(ttl) = self.ttl_secs {
            config.ttl_secs = ttl;
        }
        if let Some(embed) = self.embed_tokens {
            config.embed_tokens = embed;
        }
    }
}

/// Encodes sessions into sealed cookie values and back.
pub struct SessionCookieCodec {
    cipher: Aes256Gcm,
    config: CookieConfig,
}

impl SessionCookieCodec {
    /// Create a codec from a validated cookie configuration.
    pub fn new(config: CookieConfig) -> Result<Self> {
        config.validate().map_err(|e| anyhow!(e))?;
        let key = hex::decode(&config.secret).context("Cookie secret is not valid hex")?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| anyhow!("Cookie secret must be 32 bytes"))?;
        Ok(Self { cipher, config })
    }

    pub fn config(&self) -> &CookieConfig {
        &self.config
    }

    /// Seal a session into a cookie value.
    pub fn encode(&self, session: &Session) -> Result<String> {
        let plaintext = rmp_serde::to_vec_named(session).context("Failed to serialize session")?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: &plaintext,
                    aad: self.config.name.as_bytes(),
                },
            )
            .map_err(|_| anyhow!("Failed to encrypt session cookie"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);

        Ok(URL_SAFE_NO_PAD.encode(out))
    }

    /// Open a cookie value. Any integrity, format or expiry failure yields `None`.
    pub fn decode(&self, value: &str) -> Option<Session> {
        let raw = URL_SAFE_NO_PAD.decode(value.trim()).ok()?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            debug!("Session cookie too short");
            return None;
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = match self.cipher.decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: self.config.name.as_bytes(),
            },
        ) {
            Ok(p) => p,
            Err(_) => {
                debug!("Session cookie failed authentication");
                return None;
            }
        };

        let session: Session = rmp_serde::from_slice(&plaintext).ok()?;
        if session.is_expired() {
            debug!(session_id = %session.id, "Session cookie expired");
            return None;
        }

        Some(session)
    }

    /// Build the `Set-Cookie` value carrying `value`.
    pub fn set_cookie(&self, value: &str) -> String {
        self.cookie_with_max_age(value, self.config.ttl_secs)
    }

    /// Build a `Set-Cookie` value that removes the session cookie.
    pub fn clear_cookie(&self) -> String {
        self.cookie_with_max_age("", 0)
    }

    fn cookie_with_max_age(&self, value: &str, max_age: u64) -> String {
        let mut cookie = format!("{}={}", self.config.name, value);

        if let Some(ref domain) = self.config.domain {
            cookie.push_str(&format!("; Domain={}", domain));
        }

        cookie.push_str(&format!("; Path={}", self.config.path));

        if self.config.secure {
            cookie.push_str("; Secure");
        }

        if self.config.http_only {
            cookie.push_str("; HttpOnly");
        }

        cookie.push_str(&format!("; SameSite={}", self.config.same_site));
        cookie.push_str(&format!("; Max-Age={}", max_age));

        cookie
    }

    /// Find the session cookie value in a `Cookie` request header.
    pub fn read_cookie<'a>(&self, cookie_header: &'a str) -> Option<&'a str> {
        let prefix = format!("{}=", self.config.name);
        cookie_header
            .split(';')
            .map(str::trim)
            .find_map(|part| part.strip_prefix(prefix.as_str()))
            .filter(|value| !value.is_empty())
    }
}
