//! Fan-out executor
//!
//! Runs one operation against every account concurrently and collects the
//! outcome per account. Every task runs to completion (or its own timeout);
//! there is no early exit on the first error.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use tokio::task::{JoinError, JoinSet};
use tracing::{debug, warn};

use crate::error::AuthError;
use crate::manager::{Account, AccountManager};

/// Default per-account budget
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-account outcome of a fan-out. Keys are account emails.
#[derive(Debug)]
pub struct FanOut<T, E = AuthError> {
    pub results: BTreeMap<String, T>,
    pub errors: BTreeMap<String, E>,
}

impl<T, E> FanOut<T, E> {
    pub fn is_partial(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Run `op` for every account in the manager's current snapshot.
///
/// Succeeds when at least one account succeeds, with failed accounts listed
/// in `errors`. When every account fails, returns the error of whichever
/// task finished first.
pub async fn fan_out<T, E, F, Fut>(
    manager: &AccountManager,
    timeout: Duration,
    op: F,
) -> Result<FanOut<T, E>, E>
where
    F: Fn(Account) -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: From<AuthError> + Send + 'static,
{
    let accounts = manager.snapshot().await.map_err(E::from)?;
    fan_out_accounts(accounts.into_values(), timeout, op).await
}

/// Same as [`fan_out`] over an explicit account list.
pub async fn fan_out_accounts<T, E, F, Fut>(
    accounts: impl IntoIterator<Item = Account>,
    timeout: Duration,
    op: F,
) -> Result<FanOut<T, E>, E>
where
    F: Fn(Account) -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: From<AuthError> + Send + 'static,
{
    let mut tasks = JoinSet::new();
    for account in accounts {
        let email = account.email().to_string();
        let work = op(account);
        tasks.spawn(async move {
            // Inner task so a panic is reported against this account
            let mut handle = tokio::spawn(work);
            let result = match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) => Err(E::from(AuthError::Task(join_err.to_string()))),
                Err(_) => {
                    handle.abort();
                    Err(E::from(AuthError::Timeout {
                        what: format!("account {}", email),
                        secs: timeout.as_secs(),
                    }))
                }
            };
            (email, result)
        });
    }

    if tasks.is_empty() {
        return Err(E::from(AuthError::Ambiguous {
            hint: String::new(),
            candidates: Vec::new(),
        }));
    }

    let mut collected = Collected::default();
    while let Some(joined) = tasks.join_next().await {
        collected.record(joined);
    }
    collected.finish()
}

/// Outcomes gathered so far, in completion order.
struct Collected<T, E> {
    results: BTreeMap<String, T>,
    errors: BTreeMap<String, E>,
    first_failed: Option<String>,
    supervisor_failure: Option<JoinError>,
}

impl<T, E> Default for Collected<T, E> {
    fn default() -> Self {
        Self {
            results: BTreeMap::new(),
            errors: BTreeMap::new(),
            first_failed: None,
            supervisor_failure: None,
        }
    }
}

impl<T, E: From<AuthError>> Collected<T, E> {
    fn record(&mut self, joined: std::result::Result<(String, Result<T, E>), JoinError>) {
        match joined {
            Ok((email, Ok(value))) => {
                debug!(account = %email, "Fan-out task succeeded");
                self.results.insert(email, value);
            }
            Ok((email, Err(e))) => {
                debug!(account = %email, "Fan-out task failed");
                self.first_failed.get_or_insert_with(|| email.clone());
                self.errors.insert(email, e);
            }
            Err(e) => {
                warn!("Fan-out supervisor task failed: {}", e);
                self.supervisor_failure.get_or_insert(e);
            }
        }
    }

    fn finish(mut self) -> Result<FanOut<T, E>, E> {
        if self.results.is_empty() {
            if let Some(first) = self.first_failed.and_then(|email| self.errors.remove(&email)) {
                return Err(first);
            }
            if let Some(e) = self.supervisor_failure {
                return Err(E::from(AuthError::Task(e.to_string())));
            }
        }
        Ok(FanOut {
            results: self.results,
            errors: self.errors,
        })
    }
}
