//! Error Types
//!
//! Unified error handling for the auth subsystem with JSON-RPC code mapping,
//! so tool handlers can surface any failure as a tool-call-level error.

use crate::scopes::{self, ScopeError};

/// JSON-RPC error codes
///
/// Custom codes live in the -32099 to -32000 band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    TokenNotFound = -32010,
    ScopeInsufficient = -32012,
    AuthFlowFailed = -32013,
    AuthFlowTimeout = -32014,
    AmbiguousAccount = -32015,
    IntrospectionFailed = -32016,
    ReauthRequired = -32017,
    InvalidConfig = -32018,
    Unauthorized = -32019,
    ShutDown = -32020,

    // Generic application error
    GenericError = -32000,
}

impl ErrorCode {
    pub fn code(&self) -> i32 {
        *self as i32
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The provider refused the authorization (user denied, bad code, wrong identity).
    #[error("Authorization rejected: {0}")]
    Rejected(String),

    #[error("Timed out after {secs}s waiting for {what}")]
    Timeout { what: String, secs: u64 },

    #[error("Authorization cancelled")]
    Cancelled,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{}", ambiguous_message(.hint, .candidates))]
    Ambiguous { hint: String, candidates: Vec<String> },

    #[error(transparent)]
    Scope(#[from] ScopeError),

    #[error("Could not verify granted scopes: {0}")]
    Introspection(String),

    #[error("Account {account} needs re-authentication: {reason}. Run: google-mcp-accounts refresh {account}")]
    ReauthRequired { account: String, reason: String },

    #[error("Token expired and no refresh token available ({0})")]
    Expired(String),

    /// The API rejected the access token; the caller should re-authenticate.
    #[error("Access token rejected by the API (HTTP 401)")]
    Unauthorized,

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Account manager is shut down")]
    ShutDown,

    #[error("Background task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, AuthError>;

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        AuthError::Http(e.to_string())
    }
}

fn ambiguous_message(hint: &str, candidates: &[String]) -> String {
    if candidates.is_empty() {
        return "No authenticated accounts available. Run account add first".to_string();
    }
    if hint.is_empty() {
        format!(
            "Multiple accounts available, please specify one of: {}",
            candidates.join(", ")
        )
    } else {
        format!(
            "'{}' does not identify a single account, please specify one of: {}",
            hint,
            candidates.join(", ")
        )
    }
}

impl AuthError {
    /// Map onto the JSON-RPC error code used at the tool boundary.
    pub fn code(&self) -> ErrorCode {
        match self {
            AuthError::Config(_) => ErrorCode::InvalidConfig,
            AuthError::Rejected(_) | AuthError::Cancelled => ErrorCode::AuthFlowFailed,
            AuthError::Timeout { .. } => ErrorCode::AuthFlowTimeout,
            AuthError::NotFound(_) => ErrorCode::TokenNotFound,
            AuthError::Ambiguous { .. } => ErrorCode::AmbiguousAccount,
            AuthError::Scope(_) => ErrorCode::ScopeInsufficient,
            AuthError::Introspection(_) => ErrorCode::IntrospectionFailed,
            AuthError::ReauthRequired { .. } | AuthError::Expired(_) => ErrorCode::ReauthRequired,
            AuthError::Unauthorized => ErrorCode::Unauthorized,
            AuthError::ShutDown => ErrorCode::ShutDown,
            AuthError::Api { .. }
            | AuthError::Http(_)
            | AuthError::Io(_)
            | AuthError::Json(_)
            | AuthError::Task(_) => ErrorCode::GenericError,
        }
    }

    /// Whether the error means the account must go through the browser flow again.
    pub fn needs_reauth(&self) -> bool {
        matches!(
            self,
            AuthError::Unauthorized | AuthError::ReauthRequired { .. } | AuthError::Expired(_)
        )
    }

    /// Convert to (code, message) tuple for tool-call responses
    pub fn to_tuple(&self) -> (i32, String) {
        (self.code().code(), self.to_string())
    }

    /// User-facing fix instructions for errors a service call can run into.
    ///
    /// `None` when the error has no known remedy beyond its own message.
    pub fn remediation(&self, service: &str, account: &str) -> Option<String> {
        match self {
            AuthError::Scope(e) => Some(format!(
                "{}\n\nTo fix this:\n1. Run: google-mcp-accounts upgrade {} {}\n2. Authorize the required scopes in the browser",
                e, e.account, e.service
            )),
            AuthError::Api { message, .. } if scopes::is_api_disabled(message) => {
                Some(scopes::api_disabled_help(service, account))
            }
            AuthError::Api { status, message }
                if scopes::is_insufficient_permission(*status, message) =>
            {
                Some(scopes::insufficient_permission_help(service, account))
            }
            AuthError::Unauthorized | AuthError::Expired(_) => Some(format!(
                "The stored credential for {} is no longer accepted.\nRun: google-mcp-accounts refresh {}",
                account, account
            )),
            _ => None,
        }
    }
}
