//! Scope Checker
//!
//! Per-service scope requirements, verified against what the provider's
//! introspection endpoint says a token actually carries. The scopes recorded
//! at consent time are not trusted: users can untick boxes on the consent
//! screen and admins can revoke grants later.

use std::collections::BTreeSet;
use std::fmt;

use tracing::{debug, warn};

use crate::credential::parse_scope_string;
use crate::error::{AuthError, Result};
use crate::provider::GoogleProvider;

const SCOPE_BASE: &str = "https://www.googleapis.com/auth/";

/// Required scopes per service. Unknown services require nothing.
const REQUIREMENTS: &[(&str, &[&str])] = &[
    ("calendar", &["calendar"]),
    ("drive", &["drive"]),
    ("gmail", &["gmail.modify"]),
    ("sheets", &["spreadsheets"]),
    ("docs", &["documents"]),
    ("slides", &["presentations"]),
];

const API_LIBRARY_URL: &str = "https://console.cloud.google.com/apis/library";

/// Cloud Console pages for enabling each service's API
const ENABLE_API_URLS: &[(&str, &str)] = &[
    ("calendar", "https://console.cloud.google.com/apis/library/calendar-json.googleapis.com"),
    ("drive", "https://console.cloud.google.com/apis/library/drive.googleapis.com"),
    ("gmail", "https://console.cloud.google.com/apis/library/gmail.googleapis.com"),
    ("sheets", "https://console.cloud.google.com/apis/library/sheets.googleapis.com"),
    ("docs", "https://console.cloud.google.com/apis/library/docs.googleapis.com"),
    ("slides", "https://console.cloud.google.com/apis/library/slides.googleapis.com"),
];

/// Full scope URLs a service requires, in table order.
pub fn required_scopes(service: &str) -> Vec<String> {
    REQUIREMENTS
        .iter()
        .find(|(name, _)| *name == service)
        .map(|(_, scopes)| scopes.iter().map(|s| format!("{}{}", SCOPE_BASE, s)).collect())
        .unwrap_or_default()
}

/// Services with an entry in the requirement table
pub fn known_services() -> impl Iterator<Item = &'static str> {
    REQUIREMENTS.iter().map(|(name, _)| *name)
}

/// Every required scope must appear verbatim in `granted`.
///
/// On failure returns the missing scopes in `required` order.
pub fn satisfies(required: &[String], granted: &BTreeSet<String>) -> std::result::Result<(), Vec<String>> {
    let missing: Vec<String> = required
        .iter()
        .filter(|s| !granted.contains(*s))
        .cloned()
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(missing)
    }
}

// ── ScopeError ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeError {
    pub service: String,
    pub account: String,
    pub required: Vec<String>,
    pub granted: Vec<String>,
    pub missing: Vec<String>,
}

impl fmt::Display for ScopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Missing required OAuth scopes for {} service.\n\
             Account: {}\n\
             Required scopes: {}\n\
             Missing scopes: {}\n\
             Please re-authenticate with: google-mcp-accounts upgrade {} {}",
            self.service,
            self.account,
            self.required.join(", "),
            self.missing.join(", "),
            self.account,
            self.service,
        )
    }
}

impl std::error::Error for ScopeError {}

// ── ScopeChecker ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ScopeChecker {
    provider: GoogleProvider,
}

impl ScopeChecker {
    pub fn new(provider: GoogleProvider) -> Self {
        Self { provider }
    }

    /// Scopes the provider reports for this access token.
    ///
    /// An introspection failure is an error, never an empty set: an
    /// unverifiable grant must block the operation.
    pub async fn granted_scopes(&self, access_token: &str) -> Result<BTreeSet<String>> {
        let scope = self.provider.token_info(access_token).await?;
        Ok(parse_scope_string(&scope))
    }

    /// Verify `account`'s token carries everything `service` needs.
    pub async fn check(&self, account: &str, access_token: &str, service: &str) -> Result<()> {
        let required = required_scopes(service);
        if required.is_empty() {
            debug!("No scope requirements for service {}", service);
            return Ok(());
        }

        let granted = self.granted_scopes(access_token).await?;
        match satisfies(&required, &granted) {
            Ok(()) => Ok(()),
            Err(missing) => {
                warn!(
                    account = %account,
                    "Missing scopes for {}: {}",
                    service,
                    missing.join(", ")
                );
                Err(AuthError::Scope(ScopeError {
                    service: service.to_string(),
                    account: account.to_string(),
                    required,
                    granted: granted.into_iter().collect(),
                    missing,
                }))
            }
        }
    }
}

// ── Service error classification ────────────────────────────────────────────

/// Cloud Console page for enabling a service's API
pub fn enable_api_url(service: &str) -> &'static str {
    ENABLE_API_URLS
        .iter()
        .find(|(name, _)| *name == service)
        .map(|(_, url)| *url)
        .unwrap_or(API_LIBRARY_URL)
}

/// The API is switched off for the OAuth client's Cloud project.
pub fn is_api_disabled(message: &str) -> bool {
    message.contains("SERVICE_DISABLED")
        || message.contains("has not been used in project")
        || message.contains("accessNotConfigured")
}

/// A 403 caused by the token or account lacking permission.
pub fn is_insufficient_permission(status: u16, message: &str) -> bool {
    status == 403
        && (message.contains("insufficientPermissions")
            || message.contains("Insufficient Permission")
            || message.contains("PERMISSION_DENIED"))
}

fn title_case(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub(crate) fn api_disabled_help(service: &str, account: &str) -> String {
    format!(
        "Google {} API is not enabled for this project.\n\n\
         Account: {}\n\n\
         To fix this:\n\
         1. Enable the API at: {}\n\
         2. Wait a few minutes for the change to propagate\n\
         3. Re-authenticate using: google-mcp-accounts refresh {}",
        title_case(service),
        account,
        enable_api_url(service),
        account,
    )
}

pub(crate) fn insufficient_permission_help(service: &str, account: &str) -> String {
    format!(
        "Insufficient permissions for {} API.\n\n\
         Account: {}\n\n\
         This usually means a required OAuth scope is missing, the API is not\n\
         enabled in your project, or the account cannot access the resource.\n\n\
         To fix this, re-authorize all requested permissions:\n\
         google-mcp-accounts upgrade {} {}",
        title_case(service),
        account,
        account,
        service,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn set(scopes: &[&str]) -> BTreeSet<String> {
        scopes.iter().map(|s| s.to_string()).collect()
    }

    fn checker(base: &str) -> ScopeChecker {
        let mut config = crate::config::OAuthConfig::new("client-1", "secret-1");
        config.endpoints = crate::config::ProviderEndpoints::with_base(base);
        ScopeChecker::new(GoogleProvider::new(&config).unwrap())
    }

    #[test]
    fn test_satisfies_subset() {
        let required = vec!["A".to_string(), "B".to_string()];
        assert_eq!(satisfies(&required, &set(&["A", "B", "C"])), Ok(()));
    }

    #[test]
    fn test_satisfies_reports_missing() {
        let required = vec!["A".to_string(), "B".to_string()];
        assert_eq!(satisfies(&required, &set(&["A"])), Err(vec!["B".to_string()]));
    }

    #[test]
    fn test_no_prefix_matching() {
        let required = required_scopes("drive");
        let granted = set(&["https://www.googleapis.com/auth/drive.readonly"]);
        assert!(satisfies(&required, &granted).is_err());
    }

    #[test]
    fn test_unknown_service_requires_nothing() {
        assert!(required_scopes("tasks").is_empty());
        assert_eq!(
            required_scopes("gmail"),
            vec!["https://www.googleapis.com/auth/gmail.modify".to_string()]
        );
    }

    #[test]
    fn test_default_scopes_cover_every_service() {
        let defaults: BTreeSet<String> = crate::config::default_scopes().into_iter().collect();
        for service in known_services() {
            assert_eq!(satisfies(&required_scopes(service), &defaults), Ok(()), "{}", service);
        }
    }

    #[test]
    fn test_scope_error_names_remediation() {
        let err = ScopeError {
            service: "drive".into(),
            account: "alex@example.com".into(),
            required: required_scopes("drive"),
            granted: vec![],
            missing: required_scopes("drive"),
        };
        let msg = err.to_string();
        assert!(msg.contains("alex@example.com"));
        assert!(msg.contains("auth/drive"));
        assert!(msg.contains("google-mcp-accounts upgrade alex@example.com drive"));
    }

    #[test]
    fn test_service_error_classification() {
        assert!(is_api_disabled("Drive API has not been used in project 123 before"));
        assert!(is_api_disabled("reason: accessNotConfigured"));
        assert!(!is_api_disabled("quota exceeded"));

        assert!(is_insufficient_permission(403, "Request had insufficient permissions (PERMISSION_DENIED)"));
        assert!(!is_insufficient_permission(404, "PERMISSION_DENIED"));

        assert!(enable_api_url("calendar").contains("calendar-json"));
        assert_eq!(enable_api_url("tasks"), API_LIBRARY_URL);
    }

    #[tokio::test]
    async fn test_check_against_introspection() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/tokeninfo")
            .match_query(Matcher::UrlEncoded("access_token".into(), "ya29.x".into()))
            .with_status(200)
            .with_body(r#"{"scope": "https://www.googleapis.com/auth/drive https://www.googleapis.com/auth/userinfo.email"}"#)
            .create_async()
            .await;

        let checker = checker(&server.url());
        checker.check("alex@example.com", "ya29.x", "drive").await.unwrap();

        let err = checker
            .check("alex@example.com", "ya29.x", "gmail")
            .await
            .unwrap_err();
        match err {
            AuthError::Scope(e) => {
                assert_eq!(e.missing, vec!["https://www.googleapis.com/auth/gmail.modify".to_string()]);
                assert_eq!(e.granted.len(), 2);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_introspection_failure_blocks() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/tokeninfo")
            .match_query(Matcher::Any)
            .with_status(500)
            .create_async()
            .await;

        let err = checker(&server.url())
            .check("alex@example.com", "ya29.x", "drive")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Introspection(_)));
    }

    #[tokio::test]
    async fn test_unknown_service_skips_network() {
        // Nothing listens here; a network call would fail
        let checker = checker("http://127.0.0.1:1");
        checker.check("alex@example.com", "ya29.x", "tasks").await.unwrap();
    }
}
