//! Credential types
//!
//! The in-memory credential and its on-disk record. Secret fields are
//! zeroised on drop and redacted from `Debug` output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// One account's OAuth2 credential. Replaced wholesale on refresh.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Credential {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    #[zeroize(skip)]
    pub token_type: String,
    #[zeroize(skip)]
    pub expiry: DateTime<Utc>,
    /// Space-delimited granted scopes as reported by the provider
    #[serde(default)]
    #[zeroize(skip)]
    pub scope: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("token_type", &self.token_type)
            .field("expiry", &self.expiry)
            .field("scope", &self.scope)
            .finish()
    }
}

impl Credential {
    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry <= now
    }

    /// Usable iff not yet expired, or it can be refreshed without the user.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) || self.has_refresh_token()
    }

    pub fn granted_scopes(&self) -> BTreeSet<String> {
        parse_scope_string(&self.scope)
    }
}

/// Split a space-delimited scope string into a set.
pub fn parse_scope_string(scope: &str) -> BTreeSet<String> {
    scope.split_whitespace().map(String::from).collect()
}

// ── On-disk record ──────────────────────────────────────────────────────────

/// Token file contents: the credential plus the identity it belongs to.
///
/// Legacy single-account files carry no identity fields.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(flatten)]
    pub credential: Credential,
}

impl fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRecord")
            .field("account", &self.account)
            .field("name", &self.name)
            .field("credential", &self.credential)
            .finish()
    }
}

impl TokenRecord {
    pub fn anonymous(credential: Credential) -> Self {
        Self {
            account: None,
            name: None,
            picture: None,
            credential,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn credential(expiry: DateTime<Utc>, refresh: Option<&str>) -> Credential {
        Credential {
            access_token: "ya29.test".into(),
            refresh_token: refresh.map(String::from),
            token_type: "Bearer".into(),
            expiry,
            scope: "openid https://www.googleapis.com/auth/drive".into(),
        }
    }

    #[test]
    fn test_usable_rules() {
        let now = Utc::now();
        assert!(credential(now + Duration::hours(1), None).is_usable(now));
        assert!(credential(now - Duration::hours(1), Some("1//r")).is_usable(now));
        assert!(!credential(now - Duration::hours(1), None).is_usable(now));
        assert!(!credential(now - Duration::hours(1), Some("")).is_usable(now));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let c = credential(Utc::now(), Some("1//secret-refresh"));
        let out = format!("{:?}", c);
        assert!(!out.contains("ya29.test"));
        assert!(!out.contains("secret-refresh"));
        assert!(out.contains("[REDACTED]"));
    }

    #[test]
    fn test_granted_scopes_split() {
        let c = credential(Utc::now(), None);
        let scopes = c.granted_scopes();
        assert_eq!(scopes.len(), 2);
        assert!(scopes.contains("openid"));
    }

    #[test]
    fn test_legacy_token_shape_parses() {
        // Older single-account files: no scope, expiry with a local offset.
        let json = r#"{
            "access_token": "ya29.legacy",
            "token_type": "Bearer",
            "refresh_token": "1//legacy",
            "expiry": "2024-05-01T10:00:00+09:00"
        }"#;
        let record: TokenRecord = serde_json::from_str(json).unwrap();
        assert!(record.account.is_none());
        assert_eq!(record.credential.scope, "");
        assert_eq!(
            record.credential.expiry,
            "2024-05-01T01:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }
}
