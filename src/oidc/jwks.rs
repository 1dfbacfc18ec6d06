//! Provider signing keys (JWKS) with cached lookup by `kid`.

use anyhow::{anyhow, Context, Result};
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::validator::parse_algorithm;

/// JWKS cache with refresh on unknown `kid` and on interval.
pub struct JwksCache {
    /// kid -> key
    keys: RwLock<HashMap<String, CachedKey>>,
    last_refresh: RwLock<Instant>,
    refresh_interval: Duration,
    /// None for a fixed key set that never refreshes.
    jwks_url: Option<String>,
    http_client: reqwest::Client,
}

struct CachedKey {
    key: DecodingKey,
    /// Algorithm the key is pinned to, if the JWK names one.
    alg: Option<Algorithm>,
}

/// JWKS document.
#[derive(Debug, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// Individual JSON Web Key.
#[derive(Debug, Deserialize)]
pub struct Jwk {
    /// Key type (RSA, EC)
    pub kty: String,
    pub kid: Option<String>,
    pub alg: Option<String>,
    #[serde(rename = "use")]
    pub key_use: Option<String>,

    // RSA
    pub n: Option<String>,
    pub e: Option<String>,

    // EC
    pub crv: Option<String>,
    pub x: Option<String>,
    pub y: Option<String>,
}

impl JwksCache {
    /// Fetch the key set from `jwks_url` and cache it.
    pub async fn fetch(
        http_client: reqwest::Client,
        jwks_url: String,
        refresh_secs: u64,
    ) -> Result<Self> {
        let cache = Self {
            keys: RwLock::new(HashMap::new()),
            last_refresh: RwLock::new(Instant::now()),
            refresh_interval: Duration::from_secs(refresh_secs),
            jwks_url: Some(jwks_url),
            http_client,
        };

        cache.refresh().await?;

        Ok(cache)
    }

    /// Cache over a fixed key set. Unknown kids are never looked up remotely.
    pub fn from_jwks(jwks: Jwks) -> Result<Self> {
        let keys = Self::parse_keys(jwks)?;
        Ok(Self {
            keys: RwLock::new(keys),
            last_refresh: RwLock::new(Instant::now()),
            refresh_interval: Duration::MAX,
            jwks_url: None,
            http_client: reqwest::Client::new(),
        })
    }

    /// Decoding key for `kid`, refreshing once when the kid is unknown
    /// (provider key rotation). Keys pinned to an algorithm refuse others.
    pub async fn get_key(&self, kid: &str, alg: Algorithm) -> Result<DecodingKey> {
        if let Some(key) = self.lookup(kid, alg)? {
            return Ok(key);
        }

        if self.jwks_url.is_none() {
            return Err(anyhow!("Key with kid '{}' not found in JWKS", kid));
        }

        debug!(kid = %kid, "Key not found in cache, refreshing JWKS");
        self.refresh().await?;

        self.lookup(kid, alg)?
            .ok_or_else(|| anyhow!("Key with kid '{}' not found in JWKS", kid))
    }

    /// Key for a token without a kid: only accepted when the set holds
    /// exactly one usable key.
    pub async fn get_default_key(&self, alg: Algorithm) -> Result<DecodingKey> {
        self.refresh_if_needed().await?;

        let keys = self.keys.read().map_err(|_| anyhow!("Lock poisoned"))?;
        let mut usable = keys
            .values()
            .filter(|c| c.alg.map_or(true, |pinned| pinned == alg));

        match (usable.next(), usable.next()) {
            (Some(cached), None) => Ok(cached.key.clone()),
            (None, _) => Err(anyhow!("No keys available in JWKS")),
            (Some(_), Some(_)) => Err(anyhow!("Token has no kid and JWKS holds several keys")),
        }
    }

    fn lookup(&self, kid: &str, alg: Algorithm) -> Result<Option<DecodingKey>> {
        let keys = self.keys.read().map_err(|_| anyhow!("Lock poisoned"))?;
        match keys.get(kid) {
            Some(cached) => {
                if let Some(pinned) = cached.alg {
                    if pinned != alg {
                        return Err(anyhow!(
                            "Key '{}' is pinned to {:?}, token uses {:?}",
                            kid,
                            pinned,
                            alg
                        ));
                    }
                }
                Ok(Some(cached.key.clone()))
            }
            None => Ok(None),
        }
    }

    /// Refresh the cache if the refresh interval has elapsed.
    pub async fn refresh_if_needed(&self) -> Result<()> {
        if self.jwks_url.is_none() {
            return Ok(());
        }

        let should_refresh = {
            let last = self.last_refresh.read().map_err(|_| anyhow!("Lock poisoned"))?;
            last.elapsed() >= self.refresh_interval
        };

        if should_refresh {
            self.refresh().await?;
        }

        Ok(())
    }

    /// Force refresh from the JWKS endpoint. The previous keys stay in place
    /// when the fetch fails.
    pub async fn refresh(&self) -> Result<()> {
        let Some(ref url) = self.jwks_url else {
            return Ok(());
        };

        debug!(url = %url, "Fetching JWKS");

        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .context("Failed to fetch JWKS")?;

        if !response.status().is_success() {
            return Err(anyhow!("JWKS endpoint returned status {}", response.status()));
        }

        let jwks: Jwks = response.json().await.context("Failed to parse JWKS")?;
        let new_keys = Self::parse_keys(jwks)?;
        let key_count = new_keys.len();

        {
            let mut keys = self.keys.write().map_err(|_| anyhow!("Lock poisoned"))?;
            *keys = new_keys;
        }

        {
            let mut last = self
                .last_refresh
                .write()
                .map_err(|_| anyhow!("Lock poisoned"))?;
            *last = Instant::now();
        }

        info!(url = %url, key_count = key_count, "JWKS cache refreshed");

        Ok(())
    }

    /// Number of cached keys.
    pub fn key_count(&self) -> usize {
        self.keys.read().map(|k| k.len()).unwrap_or(0)
    }

    fn parse_keys(jwks: Jwks) -> Result<HashMap<String, CachedKey>> {
        let mut keys = HashMap::new();
        for jwk in jwks.keys {
            if jwk.key_use.as_deref() == Some("enc") {
                continue;
            }

            match Self::jwk_to_decoding_key(&jwk) {
                Ok(key) => {
                    let kid = jwk.kid.clone().unwrap_or_else(|| "default".to_string());
                    let alg = jwk.alg.as_deref().and_then(parse_algorithm);
                    debug!(kid = %kid, kty = %jwk.kty, "Loaded JWK");
                    keys.insert(kid, CachedKey { key, alg });
                }
                Err(e) => {
                    warn!(
                        kid = ?jwk.kid,
                        kty = %jwk.kty,
                        error = %e,
                        "Failed to parse JWK, skipping"
                    );
                }
            }
        }

        if keys.is_empty() {
            return Err(anyhow!("No valid signing keys found in JWKS"));
        }

        Ok(keys)
    }

    fn jwk_to_decoding_key(jwk: &Jwk) -> Result<DecodingKey> {
        match jwk.kty.as_str() {
            "RSA" => {
                let n = jwk.n.as_ref().ok_or_else(|| anyhow!("RSA key missing 'n'"))?;
                let e = jwk.e.as_ref().ok_or_else(|| anyhow!("RSA key missing 'e'"))?;

                DecodingKey::from_rsa_components(n, e).context("Failed to create RSA DecodingKey")
            }
            "EC" => {
                match jwk.crv.as_deref() {
                    Some("P-256") | Some("P-384") => {}
                    Some(crv) => return Err(anyhow!("Unsupported EC curve: {}", crv)),
                    None => return Err(anyhow!("EC key missing 'crv'")),
                }
                let x = jwk.x.as_ref().ok_or_else(|| anyhow!("EC key missing 'x'"))?;
                let y = jwk.y.as_ref().ok_or_else(|| anyhow!("EC key missing 'y'"))?;

                DecodingKey::from_ec_components(x, y).context("Failed to create EC DecodingKey")
            }
            kty => Err(anyhow!("Unsupported key type: {}", kty)),
        }
    }
}

/// Refresh the key set on its interval so rotations are picked up before a
/// token signed with a new key arrives.
pub fn spawn_jwks_refresh_task(jwks: Arc<JwksCache>, interval_secs: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        interval.tick().await;

        loop {
            interval.tick().await;
            if let Err(e) = jwks.refresh().await {
                warn!(error = %e, "Periodic JWKS refresh failed, keeping cached keys");
            }
        }
    })
}
