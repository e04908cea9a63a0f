//! Credential Client
//!
//! Owns one account's OAuth2 lifecycle: interactive authorization through the
//! local callback server, background refresh, revocation, and the bound
//! transport handed to service clients.
//!
//! All mutable state sits behind one `RwLock`. The refresh schedule is a single
//! task per client that sleeps until the next deadline, refreshes, and loops;
//! it holds only a weak reference, so dropping the client ends it.

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::callback::{BoundListener, CallbackOutcome};
use crate::config::{default_scopes, OAuthConfig};
use crate::credential::{Credential, TokenRecord};
use crate::error::{AuthError, Result};
use crate::http::create_api_client;
use crate::provider::{
    generate_code_challenge, generate_code_verifier, generate_state, GoogleProvider, UserProfile,
};
use crate::store::TokenStore;
use crate::transport::Transport;

/// Refresh this long before the access token expires
const REFRESH_MARGIN_SECS: i64 = 300;
const MIN_REFRESH_DELAY: Duration = Duration::from_secs(1);
/// Next attempt when a fresh token is already inside the refresh window (clock skew)
const RETRY_DELAY: Duration = Duration::from_secs(30);
/// How long the interactive flow waits for the browser unless configured otherwise
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(300);

// ── Account state ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountState {
    /// Usable credential, refresh schedule running
    Authenticated,
    /// No usable credential, or a scope upgrade is waiting for consent
    NeedsInteractiveAuth,
}

impl std::fmt::Display for AccountState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccountState::Authenticated => write!(f, "authenticated"),
            AccountState::NeedsInteractiveAuth => write!(f, "needs interactive auth"),
        }
    }
}

// ── Browser ─────────────────────────────────────────────────────────────────

/// Opens the authorization URL for the user.
pub trait UrlOpener: Send + Sync {
    fn open(&self, url: &str) -> std::io::Result<()>;
}

/// Default opener: the system browser.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

impl UrlOpener for SystemBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        open::that(url)
    }
}

// ── CredentialClient ────────────────────────────────────────────────────────

#[derive(Default)]
struct ClientState {
    credential: Option<Credential>,
    transport: Option<Transport>,
    token_path: Option<PathBuf>,
    profile: Option<UserProfile>,
    /// Scopes the next consent must request (set by a scope upgrade)
    pending_scopes: Option<Vec<String>>,
    refresh_task: Option<JoinHandle<()>>,
}

impl ClientState {
    fn email(&self) -> &str {
        self.profile.as_ref().map(|p| p.email.as_str()).unwrap_or("")
    }

    fn record(&self) -> Option<TokenRecord> {
        let credential = self.credential.clone()?;
        Some(TokenRecord {
            account: self.profile.as_ref().map(|p| p.email.clone()),
            name: self.profile.as_ref().and_then(|p| p.name.clone()),
            picture: self.profile.as_ref().and_then(|p| p.picture.clone()),
            credential,
        })
    }

    fn stop_refresh(&mut self) {
        if let Some(task) = self.refresh_task.take() {
            task.abort();
        }
    }
}

pub struct CredentialClient {
    config: Arc<OAuthConfig>,
    provider: GoogleProvider,
    api_http: reqwest::Client,
    state: RwLock<ClientState>,
    weak_self: Weak<CredentialClient>,
}

impl std::fmt::Debug for CredentialClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialClient")
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

impl CredentialClient {
    /// A client with no credential yet, in `NeedsInteractiveAuth`.
    ///
    /// Fails with `Config` when the client id or secret is missing.
    pub fn detached(config: Arc<OAuthConfig>) -> Result<Arc<Self>> {
        let provider = GoogleProvider::new(&config)?;
        let api_http = create_api_client()?;
        Ok(Arc::new_cyclic(|weak| Self {
            config,
            provider,
            api_http,
            state: RwLock::new(ClientState::default()),
            weak_self: weak.clone(),
        }))
    }

    /// Non-interactive construction from a token file.
    ///
    /// Fails with `NotFound` for a missing file and `Expired` for a credential
    /// that can never be used again.
    pub async fn load(config: Arc<OAuthConfig>, path: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let path = path.into();
        let record = TokenStore::load(&path)?;
        let client = Self::detached(config)?;
        {
            let mut state = client.state.write().await;
            state.token_path = Some(path);
            client.install(&mut state, record);
        }
        Ok(client)
    }

    /// Load the token file at `path`, or run the browser flow when there is
    /// no usable credential there.
    pub async fn connect(
        config: Arc<OAuthConfig>,
        path: impl Into<PathBuf>,
        opener: &dyn UrlOpener,
        cancel: &CancellationToken,
    ) -> Result<Arc<Self>> {
        let path = path.into();
        match Self::load(Arc::clone(&config), &path).await {
            Ok(client) => return Ok(client),
            Err(AuthError::NotFound(_)) => info!("No token at {:?}, starting authorization", path),
            Err(AuthError::Expired(reason)) => info!("Stored token unusable ({}), re-authorizing", reason),
            Err(AuthError::Json(e)) => warn!("Ignoring unreadable token file {:?}: {}", path, e),
            Err(e) => return Err(e),
        }

        let client = Self::detached(config)?;
        client.bind_path(path).await;
        client.authorize(opener, None, cancel).await?;
        Ok(client)
    }

    fn install(&self, state: &mut ClientState, record: TokenRecord) {
        if let Some(email) = record.account.clone() {
            state.profile = Some(UserProfile {
                email,
                name: record.name.clone(),
                picture: record.picture.clone(),
            });
        }
        state.transport = Some(Transport::new(
            self.api_http.clone(),
            &record.credential.access_token,
            state.email(),
        ));
        state.credential = Some(record.credential.clone());
        state.pending_scopes = None;
        self.arm_refresh(state);
    }

    // ── Interactive flow ────────────────────────────────────────────────────

    /// Run the browser consent flow and install the resulting credential.
    ///
    /// Blocks until the callback arrives, the provider reports an error,
    /// `cancel` fires, or the configured auth timeout elapses. The callback
    /// server is shut down on every path. Returns the identity the credential
    /// belongs to.
    ///
    /// With `expected_email` set, a sign-in as any other identity is revoked
    /// and rejected before the client's state or token file is touched.
    pub async fn authorize(
        &self,
        opener: &dyn UrlOpener,
        expected_email: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<UserProfile> {
        let scopes = {
            let state = self.state.read().await;
            match &state.pending_scopes {
                Some(s) => s.clone(),
                None if self.config.scopes.is_empty() => default_scopes(),
                None => self.config.scopes.clone(),
            }
        };

        let bound = BoundListener::bind(&self.config.redirect_uri).await?;
        let redirect_uri = bound.redirect_uri().to_string();

        let verifier = generate_code_verifier();
        let challenge = generate_code_challenge(&verifier);
        let anti_replay = generate_state();
        let auth_url = self
            .provider
            .authorize_url(&scopes, &anti_replay, &challenge, &redirect_uri);

        let mut server = bound.serve(auth_url.clone(), anti_replay);

        eprintln!(
            "\nOpen this URL in your browser to authorize Google access:\n\n{}\n",
            auth_url
        );
        if let Err(e) = opener.open(&auth_url) {
            warn!("Could not open browser ({}), use the URL above", e);
        }

        let timeout = self.config.auth_timeout();
        let outcome = tokio::select! {
            result = server.wait() => result,
            _ = cancel.cancelled() => Err(AuthError::Cancelled),
            _ = tokio::time::sleep(timeout) => Err(AuthError::Timeout {
                what: "the OAuth callback".into(),
                secs: timeout.as_secs(),
            }),
        };
        server.shutdown().await;

        let code = match outcome? {
            CallbackOutcome::Code(code) => code,
            CallbackOutcome::Error(reason) => return Err(AuthError::Rejected(reason)),
        };

        let credential = self
            .provider
            .exchange_code(&code, &verifier, &redirect_uri)
            .await?;
        let profile = self.provider.user_info(&credential.access_token).await?;

        if let Some(expected) = expected_email.map(crate::store::normalize_email) {
            if profile.email != expected {
                warn!(account = %expected, "Browser signed in as {}, discarding its token", profile.email);
                let token = credential
                    .refresh_token
                    .as_deref()
                    .filter(|t| !t.is_empty())
                    .unwrap_or(credential.access_token.as_str());
                if let Err(e) = self.provider.revoke(token).await {
                    warn!(account = %expected, "Could not revoke the discarded token: {}", e);
                }
                return Err(AuthError::Rejected(format!(
                    "signed in as {}, expected {}",
                    profile.email, expected
                )));
            }
        }
        info!(account = %profile.email, "Authorization complete");

        let record = TokenRecord {
            account: Some(profile.email.clone()),
            name: profile.name.clone(),
            picture: profile.picture.clone(),
            credential,
        };

        let mut state = self.state.write().await;
        state.profile = Some(profile.clone());
        self.install(&mut state, record);
        if state.token_path.is_some() {
            Self::persist_locked(&state)?;
        }
        Ok(profile)
    }

    // ── Transport / state ───────────────────────────────────────────────────

    /// Transport bound to the current access token. Fetch one per call.
    pub async fn transport(&self) -> Result<Transport> {
        let state = self.state.read().await;
        state
            .transport
            .clone()
            .ok_or_else(|| AuthError::ReauthRequired {
                account: state.email().to_string(),
                reason: match state.pending_scopes {
                    Some(_) => "additional scopes need consent".into(),
                    None => "no usable credential".into(),
                },
            })
    }

    pub async fn state(&self) -> AccountState {
        let state = self.state.read().await;
        match &state.credential {
            Some(c) if state.pending_scopes.is_none() && c.is_usable(Utc::now()) => {
                AccountState::Authenticated
            }
            _ => AccountState::NeedsInteractiveAuth,
        }
    }

    /// Snapshot of the current credential
    pub async fn credential(&self) -> Option<Credential> {
        self.state.read().await.credential.clone()
    }

    pub async fn profile(&self) -> Option<UserProfile> {
        self.state.read().await.profile.clone()
    }

    pub async fn token_path(&self) -> Option<PathBuf> {
        self.state.read().await.token_path.clone()
    }

    /// Attach the client to the file it persists to.
    pub async fn bind_path(&self, path: impl Into<PathBuf>) {
        self.state.write().await.token_path = Some(path.into());
    }

    /// Write the current credential and identity to the bound path.
    pub async fn persist(&self) -> Result<()> {
        let state = self.state.read().await;
        Self::persist_locked(&state)
    }

    fn persist_locked(state: &ClientState) -> Result<()> {
        let path = state
            .token_path
            .as_deref()
            .ok_or_else(|| AuthError::Config("no token file bound to this client".into()))?;
        let record = state.record().ok_or_else(|| AuthError::ReauthRequired {
            account: state.email().to_string(),
            reason: "no credential to persist".into(),
        })?;
        TokenStore::save(path, &record)
    }

    // ── Refresh ─────────────────────────────────────────────────────────────

    /// (Re)arm the refresh schedule. Replaces any pending schedule.
    pub async fn schedule_refresh(&self) {
        let mut state = self.state.write().await;
        self.arm_refresh(&mut state);
    }

    fn arm_refresh(&self, state: &mut ClientState) {
        state.stop_refresh();

        let Some(credential) = state.credential.as_ref() else {
            return;
        };
        if !credential.has_refresh_token() {
            debug!(account = %state.email(), "No refresh token, not scheduling refresh");
            return;
        }

        let delay = refresh_delay(credential.expiry, Utc::now());
        debug!(account = %state.email(), "Next token refresh in {:?}", delay);
        state.refresh_task = Some(tokio::spawn(refresh_loop(self.weak_self.clone(), delay)));
    }

    /// Refresh immediately and re-arm the schedule. Failures are returned.
    pub async fn refresh_now(&self) -> Result<()> {
        self.refresh_once().await?;
        self.schedule_refresh().await;
        Ok(())
    }

    /// One refresh round trip. Returns the delay until the next one.
    async fn refresh_once(&self) -> Result<Duration> {
        let (current, email) = {
            let state = self.state.read().await;
            let current = state.credential.clone().ok_or_else(|| AuthError::ReauthRequired {
                account: state.email().to_string(),
                reason: "no credential to refresh".into(),
            })?;
            (current, state.email().to_string())
        };

        let fresh = self.provider.refresh(&current).await?;

        let mut state = self.state.write().await;
        if state.credential.is_none() {
            // Cleared (revoke or scope upgrade) while the request was in flight
            return Err(AuthError::ReauthRequired {
                account: email,
                reason: "credential cleared during refresh".into(),
            });
        }

        let now = Utc::now();
        let next = if fresh.expiry - now <= chrono::Duration::seconds(REFRESH_MARGIN_SECS) {
            RETRY_DELAY
        } else {
            refresh_delay(fresh.expiry, now)
        };

        info!(account = %email, "Access token refreshed, expires {}", fresh.expiry.to_rfc3339());
        state.transport = Some(Transport::new(
            self.api_http.clone(),
            &fresh.access_token,
            &email,
        ));
        state.credential = Some(fresh);

        if state.token_path.is_some() {
            if let Err(e) = Self::persist_locked(&state) {
                warn!(account = %email, "Refreshed token not saved: {}", e);
            }
        }
        Ok(next)
    }

    // ── Revoke / re-consent ─────────────────────────────────────────────────

    /// Revoke at the provider (best effort), delete the token file, forget
    /// the credential.
    pub async fn revoke(&self) -> Result<()> {
        let (token, email) = {
            let state = self.state.read().await;
            let token = state.credential.as_ref().map(|c| {
                c.refresh_token
                    .clone()
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| c.access_token.clone())
            });
            (token, state.email().to_string())
        };

        if let Some(token) = token {
            if let Err(e) = self.provider.revoke(&token).await {
                warn!(account = %email, "Token revocation failed, removing locally anyway: {}", e);
            }
        }

        let mut state = self.state.write().await;
        state.stop_refresh();
        state.credential = None;
        state.transport = None;
        if let Some(path) = state.token_path.as_deref() {
            TokenStore::delete(path)?;
        }
        info!(account = %email, "Credential revoked");
        Ok(())
    }

    /// Drop the credential so the next consent can request `scopes`.
    ///
    /// Providers do not widen scopes on a refresh token, so the stored
    /// credential is deleted rather than kept alongside the pending request.
    pub async fn require_reauth(&self, scopes: Vec<String>) -> Result<()> {
        let mut state = self.state.write().await;
        state.stop_refresh();
        state.credential = None;
        state.transport = None;
        state.pending_scopes = Some(scopes);
        if let Some(path) = state.token_path.as_deref() {
            TokenStore::delete(path)?;
        }
        info!(account = %state.email(), "Credential cleared, waiting for consent to new scopes");
        Ok(())
    }

    /// Scopes a pending upgrade will request, if any
    pub async fn pending_scopes(&self) -> Option<Vec<String>> {
        self.state.read().await.pending_scopes.clone()
    }

    /// Stop the refresh schedule. The credential stays readable.
    pub async fn shutdown(&self) {
        self.state.write().await.stop_refresh();
    }

    #[cfg(test)]
    pub(crate) async fn has_refresh_task(&self) -> bool {
        self.state
            .read()
            .await
            .refresh_task
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }
}

impl Drop for CredentialClient {
    fn drop(&mut self) {
        self.state.get_mut().stop_refresh();
    }
}

/// Delay before refreshing a credential that expires at `expiry`.
///
/// Zero when already expired, otherwise `expiry - margin` floored at one second.
fn refresh_delay(expiry: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    if expiry <= now {
        return Duration::ZERO;
    }
    (expiry - now - chrono::Duration::seconds(REFRESH_MARGIN_SECS))
        .to_std()
        .unwrap_or(Duration::ZERO)
        .max(MIN_REFRESH_DELAY)
}

async fn refresh_loop(client: Weak<CredentialClient>, mut delay: Duration) {
    loop {
        tokio::time::sleep(delay).await;

        let Some(client) = client.upgrade() else {
            return;
        };
        match client.refresh_once().await {
            Ok(next) => delay = next,
            Err(e) => {
                // The stale credential stays; the next API call's 401 is the re-auth trigger
                let email = client.state.read().await.email().to_string();
                warn!(account = %email, "Background token refresh failed: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{record, test_config, CallbackOpener, NoopOpener};
    use chrono::Duration as ChronoDuration;
    use mockito::Matcher;

    async fn wait_until<F, Fut>(mut f: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if f().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_refresh_delay() {
        let now = Utc::now();
        assert_eq!(refresh_delay(now - ChronoDuration::hours(1), now), Duration::ZERO);
        assert_eq!(refresh_delay(now + ChronoDuration::minutes(2), now), MIN_REFRESH_DELAY);
        assert_eq!(
            refresh_delay(now + ChronoDuration::minutes(65), now),
            Duration::from_secs(3600)
        );
    }

    #[tokio::test]
    async fn test_construction_is_ok_or_err_never_both() {
        let dir = tempfile::tempdir().unwrap();
        for (id, secret) in [("", ""), ("id", ""), ("", "secret"), ("id", "secret")] {
            let mut config = (*test_config("http://127.0.0.1:1", dir.path())).clone();
            config.client_id = id.into();
            config.client_secret = secret.into();
            let result = CredentialClient::detached(Arc::new(config));
            let complete = !id.is_empty() && !secret.is_empty();
            assert_eq!(result.is_ok(), complete, "{:?}/{:?}", id, secret);
            if let Err(e) = result {
                assert!(matches!(e, AuthError::Config(_)));
            }
        }
    }

    #[tokio::test]
    async fn test_detached_needs_interactive_auth() {
        let dir = tempfile::tempdir().unwrap();
        let client = CredentialClient::detached(test_config("http://127.0.0.1:1", dir.path())).unwrap();
        assert_eq!(client.state().await, AccountState::NeedsInteractiveAuth);
        assert!(matches!(
            client.transport().await,
            Err(AuthError::ReauthRequired { .. })
        ));
    }

    #[tokio::test]
    async fn test_load_expired_without_refresh_token_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.json");
        TokenStore::save(&path, &record("alex@example.com", "ya29.old", None, ChronoDuration::hours(-1)))
            .unwrap();

        let err = CredentialClient::load(test_config("http://127.0.0.1:1", dir.path()), &path)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Expired(_)));
    }

    #[tokio::test]
    async fn test_expired_token_with_refresh_token_refreshes_immediately() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(Matcher::UrlEncoded("refresh_token".into(), "1//r".into()))
            .with_status(200)
            .with_body(r#"{"access_token": "ya29.new", "expires_in": 3600}"#)
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.json");
        TokenStore::save(
            &path,
            &record("alex@example.com", "ya29.old", Some("1//r"), ChronoDuration::hours(-1)),
        )
        .unwrap();

        let client = CredentialClient::load(test_config(&server.url(), dir.path()), &path)
            .await
            .unwrap();
        assert_eq!(client.state().await, AccountState::Authenticated);

        wait_until(|| async {
            client.credential().await.is_some_and(|c| c.access_token == "ya29.new")
        })
        .await;
        mock.assert_async().await;

        let saved = TokenStore::load(&path).unwrap();
        assert_eq!(saved.credential.access_token, "ya29.new");
        assert_eq!(saved.credential.refresh_token.as_deref(), Some("1//r"));
        assert_eq!(saved.account.as_deref(), Some("alex@example.com"));
        assert_eq!(client.transport().await.unwrap().account(), "alex@example.com");
    }

    #[tokio::test]
    async fn test_scheduling_twice_refreshes_once() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"access_token": "ya29.new", "expires_in": 3600}"#)
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.json");
        TokenStore::save(
            &path,
            &record("alex@example.com", "ya29.old", Some("1//r"), ChronoDuration::hours(-1)),
        )
        .unwrap();

        let client = CredentialClient::load(test_config(&server.url(), dir.path()), &path)
            .await
            .unwrap();
        client.schedule_refresh().await;
        client.schedule_refresh().await;

        wait_until(|| async {
            client.credential().await.is_some_and(|c| c.access_token == "ya29.new")
        })
        .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        mock.assert_async().await;
        assert!(client.has_refresh_task().await);
    }

    #[tokio::test]
    async fn test_background_refresh_failure_keeps_stale_credential() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error": "invalid_grant"}"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.json");
        TokenStore::save(
            &path,
            &record("alex@example.com", "ya29.old", Some("1//r"), ChronoDuration::hours(-1)),
        )
        .unwrap();

        let client = CredentialClient::load(test_config(&server.url(), dir.path()), &path)
            .await
            .unwrap();

        wait_until(|| async { !client.has_refresh_task().await }).await;
        mock.assert_async().await;
        assert_eq!(client.credential().await.unwrap().access_token, "ya29.old");
        assert!(client.transport().await.is_ok());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_refresh_now_surfaces_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error": "invalid_grant"}"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.json");
        TokenStore::save(
            &path,
            &record("alex@example.com", "ya29.old", Some("1//r"), ChronoDuration::hours(1)),
        )
        .unwrap();

        let client = CredentialClient::load(test_config(&server.url(), dir.path()), &path)
            .await
            .unwrap();
        let err = client.refresh_now().await.unwrap_err();
        assert!(matches!(err, AuthError::Api { status: 400, .. }));
    }

    #[tokio::test]
    async fn test_authorize_end_to_end() {
        let mut server = mockito::Server::new_async().await;
        let token = server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                Matcher::UrlEncoded("code".into(), "abc".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"access_token": "ya29.fresh", "refresh_token": "1//fresh", "expires_in": 3600,
                    "scope": "https://www.googleapis.com/auth/drive"}"#,
            )
            .create_async()
            .await;
        server
            .mock("GET", "/userinfo")
            .with_status(200)
            .with_body(r#"{"email": "alex@example.com", "name": "Alex"}"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts").join("alex.json");
        let opener = CallbackOpener::code("abc");

        let client = CredentialClient::connect(
            test_config(&server.url(), dir.path()),
            &path,
            &opener,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        token.assert_async().await;
        assert_eq!(client.state().await, AccountState::Authenticated);
        let transport = client.transport().await.unwrap();
        assert_eq!(transport.account(), "alex@example.com");

        let saved = TokenStore::load(&path).unwrap();
        assert_eq!(saved.credential.access_token, "ya29.fresh");
        assert_eq!(saved.name.as_deref(), Some("Alex"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[tokio::test]
    async fn test_authorize_provider_error_is_rejection() {
        let dir = tempfile::tempdir().unwrap();
        let client = CredentialClient::detached(test_config("http://127.0.0.1:1", dir.path())).unwrap();
        let opener = CallbackOpener::query("error=access_denied");

        let err = client
            .authorize(&opener, None, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            AuthError::Rejected(reason) => assert!(reason.contains("access_denied")),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(client.state().await, AccountState::NeedsInteractiveAuth);
    }

    /// Config whose redirect URI names a currently free fixed port.
    async fn fixed_port_config(dir: &std::path::Path) -> (Arc<OAuthConfig>, u16) {
        let free = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = free.local_addr().unwrap().port();
        drop(free);

        let mut config = (*test_config("http://127.0.0.1:1", dir)).clone();
        config.redirect_uri = format!("http://127.0.0.1:{}/callback", port);
        config.auth_timeout_secs = Some(1);
        (Arc::new(config), port)
    }

    #[tokio::test]
    async fn test_authorize_cancelled_releases_port() {
        let dir = tempfile::tempdir().unwrap();
        let (config, port) = fixed_port_config(dir.path()).await;
        let client = CredentialClient::detached(config).unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = client.authorize(&NoopOpener, None, &cancel).await.unwrap_err();
        assert!(matches!(err, AuthError::Cancelled));
        assert!(tokio::net::TcpListener::bind(("127.0.0.1", port)).await.is_ok());
        assert_eq!(client.state().await, AccountState::NeedsInteractiveAuth);
    }

    #[tokio::test]
    async fn test_authorize_times_out_and_releases_port() {
        let dir = tempfile::tempdir().unwrap();
        let (config, port) = fixed_port_config(dir.path()).await;
        let client = CredentialClient::detached(config).unwrap();

        let started = std::time::Instant::now();
        let err = client
            .authorize(&NoopOpener, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Timeout { secs: 1, .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(tokio::net::TcpListener::bind(("127.0.0.1", port)).await.is_ok());
        assert_eq!(client.state().await, AccountState::NeedsInteractiveAuth);
    }

    #[tokio::test]
    async fn test_authorize_as_other_identity_leaves_state_untouched() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .match_body(Matcher::UrlEncoded("code".into(), "abc".into()))
            .with_status(200)
            .with_body(r#"{"access_token": "ya29.bob", "refresh_token": "1//bob", "expires_in": 3600}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/userinfo")
            .with_status(200)
            .with_body(r#"{"email": "bob@example.com"}"#)
            .create_async()
            .await;
        let revoke = server
            .mock("POST", "/revoke")
            .match_body(Matcher::UrlEncoded("token".into(), "1//bob".into()))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.json");
        TokenStore::save(
            &path,
            &record("alex@example.com", "ya29.alex", Some("1//alex"), ChronoDuration::hours(1)),
        )
        .unwrap();
        let client = CredentialClient::load(test_config(&server.url(), dir.path()), &path)
            .await
            .unwrap();

        let err = client
            .authorize(
                &CallbackOpener::code("abc"),
                Some("alex@example.com"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        match err {
            AuthError::Rejected(reason) => {
                assert!(reason.contains("bob@example.com"));
                assert!(reason.contains("expected alex@example.com"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        revoke.assert_async().await;

        assert_eq!(client.profile().await.unwrap().email, "alex@example.com");
        assert_eq!(client.credential().await.unwrap().access_token, "ya29.alex");
        assert_eq!(client.transport().await.unwrap().account(), "alex@example.com");
        let saved = TokenStore::load(&path).unwrap();
        assert_eq!(saved.account.as_deref(), Some("alex@example.com"));
        assert_eq!(saved.credential.access_token, "ya29.alex");
    }

    #[tokio::test]
    async fn test_require_reauth_clears_credential_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.json");
        TokenStore::save(
            &path,
            &record("alex@example.com", "ya29.old", Some("1//r"), ChronoDuration::hours(1)),
        )
        .unwrap();
        let client = CredentialClient::load(test_config("http://127.0.0.1:1", dir.path()), &path)
            .await
            .unwrap();
        assert!(client.has_refresh_task().await);

        let scopes = vec!["https://www.googleapis.com/auth/drive".to_string()];
        client.require_reauth(scopes.clone()).await.unwrap();

        assert!(!path.exists());
        assert!(!client.has_refresh_task().await);
        assert_eq!(client.state().await, AccountState::NeedsInteractiveAuth);
        assert_eq!(client.pending_scopes().await, Some(scopes));
        assert!(matches!(
            client.transport().await,
            Err(AuthError::ReauthRequired { .. })
        ));
    }

    #[tokio::test]
    async fn test_revoke_removes_everything() {
        let mut server = mockito::Server::new_async().await;
        let revoke = server
            .mock("POST", "/revoke")
            .match_body(Matcher::UrlEncoded("token".into(), "1//r".into()))
            .with_status(200)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.json");
        TokenStore::save(
            &path,
            &record("alex@example.com", "ya29.old", Some("1//r"), ChronoDuration::hours(1)),
        )
        .unwrap();
        let client = CredentialClient::load(test_config(&server.url(), dir.path()), &path)
            .await
            .unwrap();

        client.revoke().await.unwrap();
        revoke.assert_async().await;
        assert!(!path.exists());
        assert!(client.credential().await.is_none());
    }

    #[tokio::test]
    async fn test_revoke_network_failure_still_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.json");
        TokenStore::save(
            &path,
            &record("alex@example.com", "ya29.old", Some("1//r"), ChronoDuration::hours(1)),
        )
        .unwrap();
        let client = CredentialClient::load(test_config("http://127.0.0.1:1", dir.path()), &path)
            .await
            .unwrap();

        client.revoke().await.unwrap();
        assert!(!path.exists());
        assert!(client.transport().await.is_err());
    }
}
