//! Session and token record types.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Unique session identifier (16-byte random value, hex-encoded for storage).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId([u8; 16]);

impl SessionId {
    /// Generate a new random session ID.
    pub fn new() -> Self {
        Self(rand::random())
    }

    /// Convert to hex string for storage/cookies.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        if bytes.len() != 16 {
            return None;
        }
        let mut arr = [0u8; 16];
        arr.copy_from_slice(&bytes);
        Some(Self(arr))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Tokens issued for one session.
///
/// Only the flow coordinator (initial issuance) and the refresh manager
/// (refresh) produce new records.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub id_token: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Absolute expiry of `access_token`.
    pub access_token_expiry: DateTime<Utc>,
    pub scopes: Vec<String>,
}

impl TokenRecord {
    /// Build a record from a token response received at `issued_at`.
    pub fn issued(
        id_token: String,
        access_token: String,
        refresh_token: Option<String>,
        issued_at: DateTime<Utc>,
        expires_in: u64,
        scopes: Vec<String>,
    ) -> Self {
        Self {
            id_token,
            access_token,
            refresh_token,
            access_token_expiry: issued_at + Duration::seconds(expires_in as i64),
            scopes,
        }
    }

    /// True when the access token expires within `skew` of `now`.
    pub fn needs_refresh(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        self.access_token_expiry <= now + skew
    }

    /// Seconds until the access token expires, clamped at zero.
    pub fn expires_in(&self, now: DateTime<Utc>) -> u64 {
        (self.access_token_expiry - now).num_seconds().max(0) as u64
    }

    /// Whether `other` may replace this record without moving expiry backwards.
    pub fn may_be_replaced_by(&self, other: &TokenRecord) -> bool {
        other.access_token_expiry >= self.access_token_expiry
    }
}

// Token values never reach logs through Debug.
impl std::fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRecord")
            .field("access_token_expiry", &self.access_token_expiry)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// An authenticated session as carried by the session cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Session ID.
    pub id: SessionId,

    /// User identifier (id_token `sub`).
    pub subject: String,

    /// Session creation time.
    pub created_at: DateTime<Utc>,

    /// Session (cookie) expiry time.
    pub expires_at: DateTime<Utc>,

    /// Token record embedded in the cookie. `None` when tokens live only in
    /// the token store.
    #[serde(default)]
    pub tokens: Option<TokenRecord>,
}

impl Session {
    /// Create a new session for `subject` lasting `ttl_secs`.
    pub fn new(subject: String, ttl_secs: u64) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            subject,
            created_at: now,
            expires_at: now + Duration::seconds(ttl_secs as i64),
            tokens: None,
        }
    }

    /// Check if the session is expired.
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Copy of this session carrying `tokens` for embedded cookies.
    pub fn with_tokens(&self, tokens: TokenRecord) -> Self {
        Self {
            tokens: Some(tokens),
            ..self.clone()
        }
    }

    /// Copy of this session without embedded tokens.
    pub fn without_tokens(&self) -> Self {
        Self {
            tokens: None,
            ..self.clone()
        }
    }
}
