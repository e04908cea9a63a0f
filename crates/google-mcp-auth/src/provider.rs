//! Google OAuth2 Provider
//!
//! Authorization-code grant with offline access and PKCE, plus the token,
//! revoke, introspection (tokeninfo) and identity (userinfo) endpoints.

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::config::{OAuthConfig, ProviderEndpoints};
use crate::credential::Credential;
use crate::error::{AuthError, Result};
use crate::http::create_provider_client;

/// Assumed lifetime when the provider omits `expires_in`.
const DEFAULT_EXPIRES_IN: i64 = 3600;

/// Identity resolved from the userinfo endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserProfile {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
}

/// Google OAuth2 provider.
#[derive(Clone)]
pub struct GoogleProvider {
    client_id: String,
    client_secret: String,
    endpoints: ProviderEndpoints,
    http: reqwest::Client,
}

impl std::fmt::Debug for GoogleProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleProvider")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

impl GoogleProvider {
    pub fn new(config: &OAuthConfig) -> Result<Self> {
        if config.client_id.is_empty() || config.client_secret.is_empty() {
            return Err(AuthError::Config(
                "client ID and client secret are required".into(),
            ));
        }
        Ok(Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            endpoints: config.endpoints.clone(),
            http: create_provider_client()?,
        })
    }

    /// Build the authorization URL for the PKCE flow.
    pub fn authorize_url(
        &self,
        scopes: &[String],
        state: &str,
        code_challenge: &str,
        redirect_uri: &str,
    ) -> String {
        let scope_str = scopes.join(" ");
        format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&state={}&code_challenge={}&code_challenge_method=S256&access_type=offline&prompt=consent",
            self.endpoints.auth,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scope_str),
            urlencoding::encode(state),
            urlencoding::encode(code_challenge),
        )
    }

    /// Exchange an authorization code for a credential.
    pub async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> Result<Credential> {
        info!("Exchanging authorization code for tokens");

        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("code", code),
            ("code_verifier", code_verifier),
            ("grant_type", "authorization_code"),
            ("redirect_uri", redirect_uri),
        ];

        let body = self
            .post_form(&self.endpoints.token, &params)
            .await
            .map_err(|e| match e {
                AuthError::Api { message, .. } => AuthError::Rejected(message),
                other => other,
            })?;
        parse_token_response(&body)
    }

    /// Mint a new credential from the current one's refresh token.
    ///
    /// The provider may omit the refresh token and scope on refresh; the
    /// current values carry over in that case.
    pub async fn refresh(&self, current: &Credential) -> Result<Credential> {
        let refresh_token = current
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::Expired("no refresh token".into()))?;

        debug!("Refreshing access token");

        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];

        let body = self.post_form(&self.endpoints.token, &params).await?;
        let mut fresh = parse_token_response(&body)?;
        if !fresh.has_refresh_token() {
            fresh.refresh_token = current.refresh_token.clone();
        }
        if fresh.scope.is_empty() {
            fresh.scope = current.scope.clone();
        }
        Ok(fresh)
    }

    /// Revoke a token at the provider.
    pub async fn revoke(&self, token: &str) -> Result<()> {
        info!("Revoking token at provider");
        self.post_form(&self.endpoints.revoke, &[("token", token)])
            .await
            .map(|_| ())
    }

    /// Ask the introspection endpoint which scopes the token actually carries.
    pub async fn token_info(&self, access_token: &str) -> Result<String> {
        let response = self
            .http
            .get(&self.endpoints.token_info)
            .query(&[("access_token", access_token)])
            .send()
            .await
            .map_err(|e| AuthError::Introspection(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Introspection(e.to_string()))?;
        if !status.is_success() {
            return Err(AuthError::Introspection(format!(
                "HTTP {}: {}",
                status,
                error_description(&body)
            )));
        }

        let parsed: Value = serde_json::from_str(&body)
            .map_err(|e| AuthError::Introspection(format!("invalid tokeninfo response: {}", e)))?;
        Ok(parsed
            .get("scope")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }

    /// Resolve the identity behind an access token.
    pub async fn user_info(&self, access_token: &str) -> Result<UserProfile> {
        let response = self
            .http
            .get(&self.endpoints.user_info)
            .bearer_auth(access_token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AuthError::Api {
                status: response.status().as_u16(),
                message: "Failed to fetch user info".into(),
            });
        }

        let mut profile: UserProfile = response
            .json()
            .await
            .map_err(|e| AuthError::Http(format!("Failed to parse user info: {}", e)))?;
        if profile.email.trim().is_empty() {
            return Err(AuthError::Rejected("email not found in user info".into()));
        }
        profile.email = crate::store::normalize_email(&profile.email);
        Ok(profile)
    }

    /// POST a form-encoded request and return the response body.
    ///
    /// Secrets travel in the request body only.
    async fn post_form(&self, url: &str, params: &[(&str, &str)]) -> Result<String> {
        let response = self.http.post(url).form(params).send().await?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Http(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            let message = error_description(&body);
            error!("Provider HTTP error {}: {}", status, message);
            return Err(AuthError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(body)
    }
}

/// Pull `error_description` / `error` out of an OAuth error body.
fn error_description(body: &str) -> String {
    let Ok(parsed) = serde_json::from_str::<Value>(body) else {
        return body.trim().to_string();
    };
    let err = parsed.get("error").and_then(|v| v.as_str());
    let desc = parsed.get("error_description").and_then(|v| v.as_str());
    match (err, desc) {
        (Some(e), Some(d)) => format!("{}: {}", e, d),
        (Some(e), None) => e.to_string(),
        (None, Some(d)) => d.to_string(),
        (None, None) => body.trim().to_string(),
    }
}

/// Parse a Google OAuth2 token response.
fn parse_token_response(body: &str) -> Result<Credential> {
    let parsed: Value = serde_json::from_str(body)?;

    if let Some(err) = parsed.get("error").and_then(|v| v.as_str()) {
        let desc = parsed
            .get("error_description")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown error");
        return Err(AuthError::Rejected(format!("{}: {}", err, desc)));
    }

    let access_token = parsed
        .get("access_token")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AuthError::Rejected("Missing access_token in response".into()))?
        .to_string();

    let refresh_token = parsed
        .get("refresh_token")
        .and_then(|v| v.as_str())
        .map(String::from);

    let token_type = parsed
        .get("token_type")
        .and_then(|v| v.as_str())
        .unwrap_or("Bearer")
        .to_string();

    let expires_in = parsed
        .get("expires_in")
        .and_then(|v| v.as_i64())
        .unwrap_or(DEFAULT_EXPIRES_IN);

    let scope = parsed
        .get("scope")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let expiry = chrono::Duration::try_seconds(expires_in)
        .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
        .ok_or_else(|| AuthError::Rejected(format!("invalid expires_in: {}", expires_in)))?;

    Ok(Credential {
        access_token,
        refresh_token,
        token_type,
        expiry,
        scope,
    })
}

// ── PKCE / state ────────────────────────────────────────────────────────────

/// Generate a PKCE code verifier (43-128 characters of unreserved URI characters).
pub fn generate_code_verifier() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base64_url_encode(&bytes)
}

/// Derive the PKCE code challenge from a code verifier using S256.
pub fn generate_code_challenge(verifier: &str) -> String {
    use sha2::{Digest, Sha256};
    let hash = Sha256::digest(verifier.as_bytes());
    base64_url_encode(&hash)
}

/// Random anti-replay state value
pub fn generate_state() -> String {
    use rand::Rng;
    let bytes: [u8; 16] = rand::rngs::OsRng.gen();
    hex::encode(bytes)
}

/// Base64url encoding (no padding) per RFC 4648 §5.
fn base64_url_encode(data: &[u8]) -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    URL_SAFE_NO_PAD.encode(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn provider(base: &str) -> GoogleProvider {
        let mut config = OAuthConfig::new("client-1", "secret-1");
        config.endpoints = ProviderEndpoints::with_base(base);
        GoogleProvider::new(&config).unwrap()
    }

    fn expiring_credential(refresh: Option<&str>) -> Credential {
        Credential {
            access_token: "ya29.old".into(),
            refresh_token: refresh.map(String::from),
            token_type: "Bearer".into(),
            expiry: Utc::now(),
            scope: "https://www.googleapis.com/auth/drive".into(),
        }
    }

    #[test]
    fn test_code_verifier_length() {
        let v = generate_code_verifier();
        assert!(v.len() >= 43);
        assert!(v.len() <= 128);
    }

    #[test]
    fn test_code_challenge_deterministic() {
        let verifier = "test_verifier_string_for_determinism";
        assert_eq!(
            generate_code_challenge(verifier),
            generate_code_challenge(verifier)
        );
    }

    #[test]
    fn test_state_is_random() {
        assert_ne!(generate_state(), generate_state());
        assert_eq!(generate_state().len(), 32);
    }

    #[test]
    fn test_authorize_url_requests_offline_access() {
        let p = provider("http://127.0.0.1:1");
        let url = p.authorize_url(
            &["openid".to_string(), "email".to_string()],
            "st4te",
            "chall",
            "http://localhost:8080/callback",
        );
        assert!(url.starts_with("http://127.0.0.1:1/auth?"));
        assert!(url.contains("access_type=offline"));
        assert!(url.contains("state=st4te"));
        assert!(url.contains("scope=openid%20email"));
        assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A8080%2Fcallback"));
    }

    #[test]
    fn test_missing_client_secret_rejected() {
        let config = OAuthConfig::new("client-1", "");
        assert!(matches!(
            GoogleProvider::new(&config),
            Err(AuthError::Config(_))
        ));
    }

    #[test]
    fn test_parse_token_response_success() {
        let body = r#"{
            "access_token": "ya29.test",
            "refresh_token": "1//0e.test",
            "token_type": "Bearer",
            "expires_in": 3600,
            "scope": "https://www.googleapis.com/auth/gmail.modify"
        }"#;

        let c = parse_token_response(body).unwrap();
        assert_eq!(c.access_token, "ya29.test");
        assert_eq!(c.refresh_token.as_deref(), Some("1//0e.test"));
        assert_eq!(c.granted_scopes().len(), 1);
        assert!(c.expiry > Utc::now() + chrono::Duration::minutes(59));
    }

    #[test]
    fn test_parse_token_response_error() {
        let body = r#"{"error": "invalid_grant", "error_description": "Token has been revoked"}"#;
        assert!(matches!(
            parse_token_response(body),
            Err(AuthError::Rejected(_))
        ));
    }

    #[test]
    fn test_parse_token_response_out_of_range_expiry() {
        let body = r#"{"access_token": "a", "expires_in": 9223372036854775807}"#;
        match parse_token_response(body) {
            Err(AuthError::Rejected(msg)) => assert!(msg.contains("invalid expires_in")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_refresh_with_out_of_range_expiry_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"access_token": "ya29.new", "expires_in": -9223372036854775808}"#)
            .create_async()
            .await;

        let err = provider(&server.url())
            .refresh(&expiring_credential(Some("1//keep")))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_refresh_keeps_refresh_token_when_omitted() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "1//keep".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token": "ya29.new", "expires_in": 3599, "token_type": "Bearer"}"#)
            .create_async()
            .await;

        let fresh = provider(&server.url())
            .refresh(&expiring_credential(Some("1//keep")))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(fresh.access_token, "ya29.new");
        assert_eq!(fresh.refresh_token.as_deref(), Some("1//keep"));
        assert_eq!(fresh.scope, "https://www.googleapis.com/auth/drive");
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token_fails_locally() {
        let p = provider("http://127.0.0.1:1");
        let err = p.refresh(&expiring_credential(None)).await.unwrap_err();
        assert!(matches!(err, AuthError::Expired(_)));
    }

    #[tokio::test]
    async fn test_exchange_error_is_rejection() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error": "invalid_grant", "error_description": "Bad Request"}"#)
            .create_async()
            .await;

        let err = provider(&server.url())
            .exchange_code("code", "verifier", "http://localhost:8080/callback")
            .await
            .unwrap_err();
        match err {
            AuthError::Rejected(msg) => assert!(msg.contains("invalid_grant")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_token_info_failure_is_introspection_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/tokeninfo")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"error_description": "Invalid Value"}"#)
            .create_async()
            .await;

        let err = provider(&server.url()).token_info("ya29.x").await.unwrap_err();
        assert!(matches!(err, AuthError::Introspection(_)));
    }

    #[tokio::test]
    async fn test_user_info_normalises_email() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/userinfo")
            .match_header("authorization", "Bearer ya29.x")
            .with_status(200)
            .with_body(r#"{"email": "Alex@Example.com", "name": "Alex"}"#)
            .create_async()
            .await;

        let profile = provider(&server.url()).user_info("ya29.x").await.unwrap();
        assert_eq!(profile.email, "alex@example.com");
        assert_eq!(profile.name.as_deref(), Some("Alex"));
        assert!(profile.picture.is_none());
    }
}
