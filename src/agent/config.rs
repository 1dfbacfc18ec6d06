//! Agent configuration: routes, headers, store backend.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::oidc::{OidcConfig, OidcConfigJson};
use crate::session::{CookieConfig, CookieConfigJson, DEFAULT_CLEANUP_INTERVAL_SECS};

/// Where token records are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "backend", rename_all = "kebab-case")]
pub enum StoreConfig {
    #[default]
    Memory,
    Redb {
        path: PathBuf,
    },
}

/// Session agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default)]
    pub oidc: OidcConfig,

    #[serde(default)]
    pub cookie: CookieConfig,

    #[serde(default)]
    pub store: StoreConfig,

    /// Starts a login (GET).
    #[serde(default = "default_login_path")]
    pub login_path: String,

    /// Provider redirect target. Must match the path of `oidc.redirect_uri`.
    #[serde(default = "default_callback_path")]
    pub callback_path: String,

    /// Ends the session (POST).
    #[serde(default = "default_logout_path")]
    pub logout_path: String,

    /// Where the provider returns after end-session.
    #[serde(default = "default_signed_out_callback_path")]
    pub signed_out_callback_path: String,

    /// Path prefixes requiring a session.
    #[serde(default = "default_protected_paths")]
    pub protected_paths: Vec<String>,

    /// Path prefixes passed through untouched, checked before protection.
    #[serde(default)]
    pub public_paths: Vec<String>,

    /// Upstream header carrying the session subject.
    #[serde(default = "default_user_id_header")]
    pub user_id_header: String,

    /// Prefix for upstream claim headers.
    #[serde(default = "default_claim_header_prefix")]
    pub claim_header_prefix: String,

    /// Cleanup interval in seconds.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

fn default_login_path() -> String {
    "/authentication/login".to_string()
}

fn default_callback_path() -> String {
    "/signin-oidc".to_string()
}

fn default_logout_path() -> String {
    "/authentication/logout".to_string()
}

fn default_signed_out_callback_path() -> String {
    "/signout-callback-oidc".to_string()
}

fn default_protected_paths() -> Vec<String> {
    vec!["/".to_string()]
}

fn default_user_id_header() -> String {
    "X-User-Id".to_string()
}

fn default_claim_header_prefix() -> String {
    "X-Auth-Claim-".to_string()
}

fn default_cleanup_interval() -> u64 {
    DEFAULT_CLEANUP_INTERVAL_SECS
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            oidc: OidcConfig::default(),
            cookie: CookieConfig::default(),
            store: StoreConfig::default(),
            login_path: default_login_path(),
            callback_path: default_callback_path(),
            logout_path: default_logout_path(),
            signed_out_callback_path: default_signed_out_callback_path(),
            protected_paths: default_protected_paths(),
            public_paths: Vec::new(),
            user_id_header: default_user_id_header(),
            claim_header_prefix: default_claim_header_prefix(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl AgentConfig {
    /// Load a JSON overlay file onto the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let json: AgentConfigJson = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        let mut config = AgentConfig::default();
        json.apply_to(&mut config);
        config.validate().map_err(|e| anyhow!(e))?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        self.oidc.validate()?;
        self.cookie.validate()?;

        for (name, path) in [
            ("login_path", &self.login_path),
            ("callback_path", &self.callback_path),
            ("logout_path", &self.logout_path),
            ("signed_out_callback_path", &self.signed_out_callback_path),
        ] {
            if !path.starts_with('/') {
                return Err(format!("{} must start with '/'", name));
            }
        }

        let redirect_path = url::Url::parse(&self.oidc.redirect_uri)
            .map(|u| u.path().to_string())
            .map_err(|e| format!("Invalid redirect_uri: {}", e))?;
        if redirect_path != self.callback_path {
            return Err(format!(
                "redirect_uri path {} does not match callback_path {}",
                redirect_path, self.callback_path
            ));
        }

        if self.user_id_header.is_empty() {
            return Err("user_id_header must not be empty".to_string());
        }

        if let StoreConfig::Redb { ref path } = self.store {
            if path.as_os_str().is_empty() {
                return Err("redb store requires a path".to_string());
            }
        }

        Ok(())
    }

    /// Whether `path` falls under one of `prefixes`, on a segment boundary.
    fn matches_prefix(prefixes: &[String], path: &str) -> bool {
        prefixes.iter().any(|prefix| {
            prefix == "/"
                || path == prefix
                || path
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| prefix.ends_with('/') || rest.starts_with('/'))
        })
    }

    pub fn is_public_path(&self, path: &str) -> bool {
        Self::matches_prefix(&self.public_paths, path)
    }

    pub fn is_protected_path(&self, path: &str) -> bool {
        !self.is_public_path(path) && Self::matches_prefix(&self.protected_paths, path)
    }
}

/// JSON configuration for overlaying onto defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct AgentConfigJson {
    #[serde(default)]
    pub oidc: OidcConfigJson,
    #[serde(default)]
    pub cookie: CookieConfigJson,
    pub store: Option<StoreConfig>,
    pub login_path: Option<String>,
    pub callback_path: Option<String>,
    pub logout_path: Option<String>,
    pub signed_out_callback_path: Option<String>,
    pub protected_paths: Option<Vec<String>>,
    pub public_paths: Option<Vec<String>>,
    pub user_id_header: Option<String>,
    pub claim_header_prefix: Option<String>,
    pub cleanup_interval_secs: Option<u64>,
}

impl AgentConfigJson {
    /// Apply JSON config to existing config.
    pub fn apply_to(&self, config: &mut AgentConfig) {
        self.oidc.apply_to(&mut config.oidc);
        self.cookie.apply_to(&mut config.cookie);

        if let Some(ref store) = self.store {
            config.store = store.clone();
        }
        if let Some(ref path) = self.login_path {
            config.login_path = path.clone();
        }
        if let Some(ref path) = self.callback_path {
            config.callback_path = path.clone();
        }
        if let Some(ref path) = self.logout_path {
            config.logout_path = path.clone();
        }
        if let Some(ref path) = self.signed_out_callback_path {
            config.signed_out_callback_path = path.clone();
        }
        if let Some(ref paths) = self.protected_paths {
            config.protected_paths = paths.clone();
        }
        if let Some(ref paths) = self.public_paths {
            config.public_paths = paths.clone();
        }
        if let Some(ref header) = self.user_id_header {
            config.user_id_header = header.clone();
        }
        if let Some(ref prefix) = self.claim_header_prefix {
            config.claim_header_prefix = prefix.clone();
        }
        if let Some(interval) = self.cleanup_interval_secs {
            config.cleanup_interval_secs = interval;
        }
    }
}
