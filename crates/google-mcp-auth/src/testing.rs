//! Shared fixtures for unit tests.

use std::path::Path;
use std::sync::Arc;

use chrono::{Duration, SubsecRound, Utc};

use crate::client::UrlOpener;
use crate::config::{default_scopes, OAuthConfig, ProviderEndpoints};
use crate::credential::{Credential, TokenRecord};

/// Config pointed at a mock provider, with every path inside `dir`.
pub(crate) fn test_config(base: &str, dir: &Path) -> Arc<OAuthConfig> {
    let mut config = OAuthConfig::new("client-1", "secret-1");
    config.redirect_uri = "http://127.0.0.1:0/callback".into();
    config.scopes = default_scopes();
    config.token_file = Some(dir.join("legacy-token.json"));
    config.accounts_dir = Some(dir.join("accounts"));
    config.endpoints = ProviderEndpoints::with_base(base);
    Arc::new(config)
}

pub(crate) fn record(
    email: &str,
    access_token: &str,
    refresh_token: Option<&str>,
    expires_in: Duration,
) -> TokenRecord {
    TokenRecord {
        account: Some(email.to_string()),
        name: None,
        picture: None,
        credential: Credential {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.map(String::from),
            token_type: "Bearer".into(),
            expiry: (Utc::now() + expires_in).trunc_subsecs(0),
            scope: default_scopes().join(" "),
        },
    }
}

/// Opener that never opens anything.
pub(crate) struct NoopOpener;

impl UrlOpener for NoopOpener {
    fn open(&self, _url: &str) -> std::io::Result<()> {
        Ok(())
    }
}

/// Opener that plays the browser: follows the redirect back to the local
/// callback server with a fixed query.
pub(crate) struct CallbackOpener {
    query: String,
    echo_state: bool,
}

impl CallbackOpener {
    /// Return `code` together with the state from the authorization URL.
    pub(crate) fn code(code: &str) -> Self {
        Self {
            query: format!("code={}", code),
            echo_state: true,
        }
    }

    /// Return exactly `query`.
    pub(crate) fn query(query: &str) -> Self {
        Self {
            query: query.to_string(),
            echo_state: false,
        }
    }
}

impl UrlOpener for CallbackOpener {
    fn open(&self, auth_url: &str) -> std::io::Result<()> {
        let parsed = url::Url::parse(auth_url)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let param = |name: &str| {
            parsed
                .query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
                .unwrap_or_default()
        };

        let mut target = format!("{}?{}", param("redirect_uri"), self.query);
        if self.echo_state {
            target.push_str(&format!("&state={}", param("state")));
        }

        tokio::spawn(async move {
            let _ = reqwest::get(target).await;
        });
        Ok(())
    }
}
