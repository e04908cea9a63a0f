//! Multi-account Google OAuth2 for the Google MCP server.
//!
//! [`AccountManager`] owns one [`CredentialClient`] per signed-in account.
//! Each client keeps its access token fresh in the background and hands out
//! a [`Transport`] bound to the current token; service clients only ever see
//! the transport. [`fan_out`] runs an operation across every account.

pub mod callback;
pub mod client;
pub mod config;
pub mod credential;
pub mod error;
pub mod fanout;
pub mod http;
pub mod manager;
pub mod paths;
pub mod provider;
pub mod scopes;
pub mod store;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{AccountState, CredentialClient, SystemBrowser, UrlOpener, AUTH_TIMEOUT};
pub use config::OAuthConfig;
pub use credential::{Credential, TokenRecord};
pub use error::{AuthError, ErrorCode, Result};
pub use fanout::{fan_out, FanOut, DEFAULT_TASK_TIMEOUT};
pub use manager::{Account, AccountInfo, AccountManager};
pub use scopes::{ScopeChecker, ScopeError};
pub use store::TokenStore;
pub use transport::Transport;
