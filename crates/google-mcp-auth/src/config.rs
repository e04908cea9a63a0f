//! Configuration
//!
//! Static OAuth configuration, loaded once at startup from a JSON config file
//! and the environment, then shared immutably as `Arc<OAuthConfig>`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{AuthError, Result};
use crate::paths;

/// Redirect URI registered with the provider for desktop clients.
pub const DEFAULT_REDIRECT_URI: &str = "http://localhost:8080/callback";

/// Scopes requested on first consent.
pub fn default_scopes() -> Vec<String> {
    [
        "https://www.googleapis.com/auth/calendar",
        "https://www.googleapis.com/auth/drive",
        "https://www.googleapis.com/auth/gmail.modify",
        "https://www.googleapis.com/auth/spreadsheets",
        "https://www.googleapis.com/auth/documents",
        "https://www.googleapis.com/auth/presentations",
        "https://www.googleapis.com/auth/userinfo.email",
        "https://www.googleapis.com/auth/userinfo.profile",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

// ── Provider endpoints ──────────────────────────────────────────────────────

/// Identity-provider URLs. Overridable so tests can point at a mock server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderEndpoints {
    pub auth: String,
    pub token: String,
    pub revoke: String,
    pub token_info: String,
    pub user_info: String,
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            auth: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token: "https://oauth2.googleapis.com/token".to_string(),
            revoke: "https://oauth2.googleapis.com/revoke".to_string(),
            token_info: "https://oauth2.googleapis.com/tokeninfo".to_string(),
            user_info: "https://www.googleapis.com/oauth2/v2/userinfo".to_string(),
        }
    }
}

impl ProviderEndpoints {
    /// All endpoints rooted at `base` (used against mock providers).
    pub fn with_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            auth: format!("{}/auth", base),
            token: format!("{}/token", base),
            revoke: format!("{}/revoke", base),
            token_info: format!("{}/tokeninfo", base),
            user_info: format!("{}/userinfo", base),
        }
    }
}

// ── OAuthConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    /// Legacy single-account token file
    pub token_file: Option<PathBuf>,
    /// Directory holding one token file per account
    pub accounts_dir: Option<PathBuf>,
    pub endpoints: ProviderEndpoints,
    /// How long the browser flow waits for the callback; `AUTH_TIMEOUT` when unset
    pub auth_timeout_secs: Option<u64>,
}

/// Shape of the config file: `{ "oauth": { ... } }`
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    oauth: OAuthConfig,
}

impl OAuthConfig {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            ..Default::default()
        }
    }

    /// Load from the first readable config file, then the process environment.
    pub fn load() -> Result<Self> {
        let mut config = Self::default();
        for path in paths::config_search_paths() {
            match Self::from_file(&path) {
                Ok(c) => {
                    info!("Loaded OAuth configuration from {:?}", path);
                    config = c;
                    break;
                }
                Err(e) => debug!("Skipping config {:?}: {}", path, e),
            }
        }
        config.apply_env(|key| std::env::var(key).ok());
        config.with_defaults()
    }

    /// Read the `oauth` section of a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: ConfigFile = serde_json::from_str(&content)?;
        Ok(file.oauth)
    }

    /// Override fields from environment variables (lookup injected for tests).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = non_empty("GOOGLE_CLIENT_ID") {
            self.client_id = v;
        }
        if let Some(v) = non_empty("GOOGLE_CLIENT_SECRET") {
            self.client_secret = v;
        }
        if let Some(v) = non_empty("GOOGLE_REDIRECT_URI") {
            self.redirect_uri = v;
        }
        if let Some(v) = non_empty("GOOGLE_TOKEN_FILE") {
            self.token_file = Some(PathBuf::from(v));
        }
        if let Some(v) = non_empty("GOOGLE_ACCOUNTS_DIR") {
            self.accounts_dir = Some(PathBuf::from(v));
        }
    }

    /// Validate and fill every default. The result is ready to share.
    pub fn with_defaults(mut self) -> Result<Self> {
        self.client_id = self.client_id.trim().to_string();
        self.client_secret = self.client_secret.trim().to_string();
        if self.client_id.is_empty() || self.client_secret.is_empty() {
            return Err(AuthError::Config(
                "client ID and client secret are required (set GOOGLE_CLIENT_ID and GOOGLE_CLIENT_SECRET)"
                    .into(),
            ));
        }

        if self.redirect_uri.trim().is_empty() {
            self.redirect_uri = DEFAULT_REDIRECT_URI.to_string();
        }
        let redirect = url::Url::parse(&self.redirect_uri)
            .map_err(|e| AuthError::Config(format!("invalid redirect URI {}: {}", self.redirect_uri, e)))?;
        if redirect.scheme() != "http" || redirect.host_str().is_none() {
            return Err(AuthError::Config(format!(
                "redirect URI must be an absolute http URL, got {}",
                self.redirect_uri
            )));
        }

        if self.scopes.is_empty() {
            self.scopes = default_scopes();
        }

        self.token_file = Some(match self.token_file.take() {
            Some(p) => paths::expand_tilde(&p)?,
            None => paths::default_token_file()?,
        });
        self.accounts_dir = Some(match self.accounts_dir.take() {
            Some(p) => paths::expand_tilde(&p)?,
            None => paths::default_accounts_dir()?,
        });

        Ok(self)
    }

    pub fn auth_timeout(&self) -> Duration {
        match self.auth_timeout_secs {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => crate::client::AUTH_TIMEOUT,
        }
    }

    /// Legacy token path. Only meaningful after `with_defaults`.
    pub fn legacy_token_path(&self) -> Result<PathBuf> {
        match &self.token_file {
            Some(p) => Ok(p.clone()),
            None => paths::default_token_file(),
        }
    }

    /// Accounts directory. Only meaningful after `with_defaults`.
    pub fn accounts_path(&self) -> Result<PathBuf> {
        match &self.accounts_dir {
            Some(p) => Ok(p.clone()),
            None => paths::default_accounts_dir(),
        }
    }
}
