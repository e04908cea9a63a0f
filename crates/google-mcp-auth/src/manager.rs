//! Account Manager
//!
//! The set of authenticated accounts, keyed by normalised email. Loads every
//! persisted account at startup (migrating the legacy single-account token
//! file when nothing else exists), resolves which account a request means,
//! and gates service calls behind scope checks.
//!
//! The map is ordered, so listings and fan-out keys are deterministic.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{AccountState, CredentialClient, SystemBrowser, UrlOpener};
use crate::config::OAuthConfig;
use crate::credential::{parse_scope_string, TokenRecord};
use crate::error::{AuthError, Result};
use crate::provider::GoogleProvider;
use crate::scopes::{required_scopes, ScopeChecker};
use crate::store::{normalize_email, TokenStore};
use crate::transport::Transport;

// ── Account ─────────────────────────────────────────────────────────────────

/// One authenticated identity and the client that keeps its credential fresh.
#[derive(Debug, Clone)]
pub struct Account {
    email: String,
    client: Arc<CredentialClient>,
}

impl Account {
    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn client(&self) -> &Arc<CredentialClient> {
        &self.client
    }

    /// Transport bound to the account's current access token
    pub async fn transport(&self) -> Result<Transport> {
        self.client.transport().await
    }
}

/// Listing entry for account-management front ends.
#[derive(Debug, Clone, Serialize)]
pub struct AccountInfo {
    pub email: String,
    pub name: Option<String>,
    pub state: AccountState,
    pub expiry: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub last_used: Option<DateTime<Utc>>,
}

// ── AccountManager ──────────────────────────────────────────────────────────

pub struct AccountManager {
    config: Arc<OAuthConfig>,
    store: TokenStore,
    provider: GoogleProvider,
    checker: ScopeChecker,
    opener: Arc<dyn UrlOpener>,
    accounts: RwLock<BTreeMap<String, Account>>,
    last_used: Mutex<HashMap<String, DateTime<Utc>>>,
    closed: CancellationToken,
}

impl std::fmt::Debug for AccountManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountManager")
            .field("store", &self.store)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl AccountManager {
    /// Load every persisted account. Interactive flows use the system browser.
    pub async fn new(config: Arc<OAuthConfig>) -> Result<Self> {
        Self::with_opener(config, Arc::new(SystemBrowser)).await
    }

    pub async fn with_opener(config: Arc<OAuthConfig>, opener: Arc<dyn UrlOpener>) -> Result<Self> {
        let provider = GoogleProvider::new(&config)?;
        let store = TokenStore::open(config.accounts_path()?)?;

        let manager = Self {
            checker: ScopeChecker::new(provider.clone()),
            provider,
            store,
            opener,
            config,
            accounts: RwLock::new(BTreeMap::new()),
            last_used: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        };
        manager.load_accounts().await?;
        Ok(manager)
    }

    async fn load_accounts(&self) -> Result<()> {
        let files = self.store.list()?;
        let mut accounts = BTreeMap::new();

        for path in &files {
            let client = match CredentialClient::load(Arc::clone(&self.config), path).await {
                Ok(c) => c,
                Err(e) => {
                    warn!("Skipping token file {:?}: {}", path, e);
                    continue;
                }
            };
            let Some(profile) = client.profile().await else {
                warn!("Token file {:?} names no account, skipping", path);
                client.shutdown().await;
                continue;
            };

            let email = normalize_email(&profile.email);
            if accounts.contains_key(&email) {
                warn!("Duplicate token file {:?} for {}, keeping the first", path, email);
                client.shutdown().await;
                continue;
            }
            debug!("Loaded account {}", email);
            accounts.insert(email.clone(), Account { email, client });
        }

        if files.is_empty() {
            match self.migrate_legacy().await {
                Ok(Some(account)) => {
                    accounts.insert(account.email.clone(), account);
                }
                Ok(None) => {}
                Err(e) => warn!("Legacy token migration failed: {}", e),
            }
        }

        info!("Loaded {} account(s)", accounts.len());
        *self.accounts.write().await = accounts;
        Ok(())
    }

    /// Re-persist the legacy single-account token under its email.
    ///
    /// The legacy file is left in place.
    async fn migrate_legacy(&self) -> Result<Option<Account>> {
        let legacy = self.config.legacy_token_path()?;
        if !legacy.exists() {
            return Ok(None);
        }
        info!("Migrating legacy token file {:?}", legacy);

        let record = TokenStore::load(&legacy)?;
        let mut credential = record.credential.clone();
        if credential.is_expired(Utc::now()) {
            credential = self.provider.refresh(&credential).await?;
        }

        let profile = self.provider.user_info(&credential.access_token).await?;
        let path = self.store.account_path(&profile.email);
        TokenStore::save(
            &path,
            &TokenRecord {
                account: Some(profile.email.clone()),
                name: profile.name.clone(),
                picture: profile.picture.clone(),
                credential,
            },
        )?;

        let client = CredentialClient::load(Arc::clone(&self.config), &path).await?;
        info!(account = %profile.email, "Migrated legacy token");
        Ok(Some(Account {
            email: profile.email,
            client,
        }))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(AuthError::ShutDown);
        }
        Ok(())
    }

    fn touch(&self, email: &str) {
        let mut last_used = match self.last_used.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        last_used.insert(email.to_string(), Utc::now());
    }

    // ── Adding / removing ───────────────────────────────────────────────────

    /// Run the browser flow and store the account it authenticates.
    ///
    /// Signing in as an account that already exists replaces its credential.
    pub async fn add_account(&self, cancel: &CancellationToken) -> Result<Account> {
        self.ensure_open()?;

        let client = CredentialClient::detached(Arc::clone(&self.config))?;
        let profile = tokio::select! {
            result = client.authorize(self.opener.as_ref(), None, cancel) => result?,
            _ = self.closed.cancelled() => return Err(AuthError::ShutDown),
        };

        let email = profile.email;
        client.bind_path(self.store.account_path(&email)).await;
        client.persist().await?;

        let account = Account {
            email: email.clone(),
            client,
        };
        let previous = self
            .accounts
            .write()
            .await
            .insert(email.clone(), account.clone());
        if let Some(previous) = previous {
            previous.client.shutdown().await;
            info!(account = %email, "Replaced existing account");
        } else {
            info!(account = %email, "Added account");
        }
        Ok(account)
    }

    /// Revoke (best effort), delete the token file, forget the account.
    pub async fn remove_account(&self, email: &str) -> Result<()> {
        self.ensure_open()?;
        let email = normalize_email(email);
        let account = self
            .accounts
            .write()
            .await
            .remove(&email)
            .ok_or_else(|| AuthError::NotFound(format!("account {}", email)))?;

        account.client.revoke().await?;
        account.client.shutdown().await;
        if let Ok(mut last_used) = self.last_used.lock() {
            last_used.remove(&email);
        }
        info!(account = %email, "Removed account");
        Ok(())
    }

    // ── Lookup ──────────────────────────────────────────────────────────────

    pub async fn get_account(&self, email: &str) -> Result<Account> {
        self.ensure_open()?;
        let email = normalize_email(email);
        let account = self
            .accounts
            .read()
            .await
            .get(&email)
            .cloned()
            .ok_or_else(|| AuthError::NotFound(format!("account {}", email)))?;
        self.touch(&email);
        Ok(account)
    }

    /// Pick the account a request means.
    ///
    /// Tried in order: exact email; a hint contained in exactly one email (or
    /// containing exactly one email); a hint naming exactly one account's
    /// domain; an empty hint with exactly one account. Anything else is
    /// `Ambiguous` with every candidate listed.
    pub async fn resolve_for_context(&self, hint: &str) -> Result<Account> {
        self.ensure_open()?;
        let accounts = self.accounts.read().await;
        let resolved = resolve(&accounts, hint).cloned();
        let candidates: Vec<String> = accounts.keys().cloned().collect();
        drop(accounts);

        match resolved {
            Some(account) => {
                debug!(account = %account.email, "Resolved account for hint {:?}", hint);
                self.touch(&account.email);
                Ok(account)
            }
            None => Err(AuthError::Ambiguous {
                hint: hint.to_string(),
                candidates,
            }),
        }
    }

    /// Accounts in email order
    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        self.ensure_open()?;
        Ok(self.accounts.read().await.values().cloned().collect())
    }

    /// Copy of the account map, for slow per-account work without the lock.
    pub async fn snapshot(&self) -> Result<BTreeMap<String, Account>> {
        self.ensure_open()?;
        Ok(self.accounts.read().await.clone())
    }

    /// Details for one account, or for all of them.
    pub async fn account_details(&self, email: Option<&str>) -> Result<Vec<AccountInfo>> {
        let accounts = match email {
            Some(e) => {
                self.ensure_open()?;
                let e = normalize_email(e);
                let account = self
                    .accounts
                    .read()
                    .await
                    .get(&e)
                    .cloned()
                    .ok_or_else(|| AuthError::NotFound(format!("account {}", e)))?;
                vec![account]
            }
            None => self.list_accounts().await?,
        };

        let last_used = match self.last_used.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        let mut details = Vec::with_capacity(accounts.len());
        for account in accounts {
            let credential = account.client.credential().await;
            let profile = account.client.profile().await;
            details.push(AccountInfo {
                name: profile.and_then(|p| p.name),
                state: account.client.state().await,
                expiry: credential.as_ref().map(|c| c.expiry),
                scopes: credential
                    .as_ref()
                    .map(|c| c.granted_scopes().into_iter().collect())
                    .unwrap_or_default(),
                last_used: last_used.get(&account.email).copied(),
                email: account.email,
            });
        }
        Ok(details)
    }

    // ── Credential maintenance ──────────────────────────────────────────────

    /// Force a refresh now; failures are returned, not swallowed.
    pub async fn refresh_account(&self, email: &str) -> Result<()> {
        let account = self.get_account(email).await?;
        account.client.refresh_now().await
    }

    /// Browser re-consent for an account, requesting any pending scopes.
    pub async fn reauthorize(&self, email: &str, cancel: &CancellationToken) -> Result<()> {
        let account = self.get_account(email).await?;
        let client = &account.client;

        tokio::select! {
            result = client.authorize(self.opener.as_ref(), Some(account.email.as_str()), cancel) => result?,
            _ = self.closed.cancelled() => return Err(AuthError::ShutDown),
        };
        info!(account = %account.email, "Re-authorized");
        Ok(())
    }

    // ── Scopes ──────────────────────────────────────────────────────────────

    pub fn scope_checker(&self) -> &ScopeChecker {
        &self.checker
    }

    /// Verify the account's token carries what `service` needs.
    pub async fn require_scopes(&self, email: &str, service: &str) -> Result<()> {
        let account = self.get_account(email).await?;
        let credential = account
            .client
            .credential()
            .await
            .ok_or_else(|| AuthError::ReauthRequired {
                account: account.email.clone(),
                reason: "no usable credential".into(),
            })?;
        self.checker
            .check(&account.email, &credential.access_token, service)
            .await
    }

    /// Prepare a scope upgrade: the next consent requests granted, configured
    /// and `additional` scopes together.
    ///
    /// Never opens a browser. The stored credential is cleared and the call
    /// fails with `ReauthRequired`; `reauthorize` completes the upgrade.
    pub async fn upgrade_scopes(&self, email: &str, additional: &[String]) -> Result<()> {
        let account = self.get_account(email).await?;

        let mut scopes: BTreeSet<String> = match account.client.credential().await {
            Some(credential) => match self.checker.granted_scopes(&credential.access_token).await {
                Ok(granted) => granted,
                Err(e) => {
                    warn!(account = %account.email, "Introspection failed, using recorded scopes: {}", e);
                    parse_scope_string(&credential.scope)
                }
            },
            None => BTreeSet::new(),
        };
        scopes.extend(self.config.scopes.iter().cloned());
        scopes.extend(additional.iter().cloned());

        let scopes: Vec<String> = scopes.into_iter().collect();
        account.client.require_reauth(scopes.clone()).await?;

        Err(AuthError::ReauthRequired {
            account: account.email,
            reason: format!("consent needed for scopes: {}", scopes.join(" ")),
        })
    }

    /// Scope upgrade covering everything `service` requires.
    pub async fn upgrade_for_service(&self, email: &str, service: &str) -> Result<()> {
        self.upgrade_scopes(email, &required_scopes(service)).await
    }

    // ── Shutdown ────────────────────────────────────────────────────────────

    /// Stop every refresh schedule and refuse further operations.
    pub async fn shutdown(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        for account in self.accounts.read().await.values() {
            account.client.shutdown().await;
        }
        info!("Account manager shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.is_cancelled()
    }
}

fn domain_of(email: &str) -> Option<&str> {
    email.rsplit_once('@').map(|(_, d)| d).filter(|d| !d.is_empty())
}

/// Pure resolution over the account map.
fn resolve<'a>(accounts: &'a BTreeMap<String, Account>, hint: &str) -> Option<&'a Account> {
    let hint = normalize_email(hint);

    if hint.is_empty() {
        return match accounts.len() {
            1 => accounts.values().next(),
            _ => None,
        };
    }

    if let Some(account) = accounts.get(&hint) {
        return Some(account);
    }

    let unique = |matches: Vec<&'a Account>| match matches.as_slice() {
        [only] => Some(*only),
        _ => None,
    };

    let by_substring: Vec<&Account> = accounts
        .values()
        .filter(|a| a.email.contains(&hint) || hint.contains(&a.email))
        .collect();
    if let Some(account) = unique(by_substring) {
        return Some(account);
    }

    if hint.contains('.') {
        let by_domain: Vec<&Account> = accounts
            .values()
            .filter(|a| domain_of(&a.email).is_some_and(|d| hint.contains(d)))
            .collect();
        if let Some(account) = unique(by_domain) {
            return Some(account);
        }
    }

    None
}
