//! Authenticated Transport
//!
//! The only thing downstream service clients receive: an HTTP client bound to
//! one access-token snapshot. Handles pagination and Google's error envelope.
//! Cheap to clone; fetch a fresh one per call since refresh swaps the token.

use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::error::{AuthError, Result};

#[derive(Clone)]
pub struct Transport {
    client: Client,
    access_token: Arc<str>,
    account: Arc<str>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("account", &self.account)
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

impl Transport {
    pub(crate) fn new(client: Client, access_token: &str, account: &str) -> Self {
        Self {
            client,
            access_token: Arc::from(access_token),
            account: Arc::from(account),
        }
    }

    /// Account this transport acts for (empty before the identity is known)
    pub fn account(&self) -> &str {
        &self.account
    }

    /// Start a request with the bearer token attached, for callers that need
    /// bodies or headers the JSON helpers do not cover.
    pub fn request(&self, method: reqwest::Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&*self.access_token)
    }

    /// Make an authenticated GET request
    pub async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<Value> {
        let builder = self.request(reqwest::Method::GET, url).query(query);
        self.execute_request(builder).await
    }

    /// Make an authenticated POST request with JSON body
    pub async fn post(&self, url: &str, body: &Value) -> Result<Value> {
        let builder = self.request(reqwest::Method::POST, url).json(body);
        self.execute_request(builder).await
    }

    /// Make an authenticated PUT request with JSON body
    pub async fn put(&self, url: &str, body: &Value) -> Result<Value> {
        let builder = self.request(reqwest::Method::PUT, url).json(body);
        self.execute_request(builder).await
    }

    /// Make an authenticated PATCH request with JSON body
    pub async fn patch(&self, url: &str, body: &Value) -> Result<Value> {
        let builder = self.request(reqwest::Method::PATCH, url).json(body);
        self.execute_request(builder).await
    }

    /// Make an authenticated DELETE request
    pub async fn delete(&self, url: &str) -> Result<Value> {
        let builder = self.request(reqwest::Method::DELETE, url);
        self.execute_request(builder).await
    }

    /// Execute a request and handle Google API response patterns
    async fn execute_request(&self, builder: RequestBuilder) -> Result<Value> {
        let response = builder.send().await?;

        let status = response.status();
        debug!(account = %self.account, "Response status: {}", status);

        if status == StatusCode::UNAUTHORIZED {
            warn!(account = %self.account, "Access token rejected by API");
            return Err(AuthError::Unauthorized);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!("Rate limited by Google API");
            return Err(AuthError::Api {
                status: status.as_u16(),
                message: "Rate limited. Please try again later.".into(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Http(format!("Failed to read response body: {}", e)))?;

        // Empty successful responses (e.g., DELETE)
        if status.is_success() && body.is_empty() {
            return Ok(Value::Object(serde_json::Map::new()));
        }

        if !status.is_success() {
            let message = match serde_json::from_str::<Value>(&body) {
                Ok(parsed) => extract_error_message(&parsed, status),
                Err(_) => format!("HTTP {} error", status),
            };
            error!("Google API error: {}", message);
            return Err(AuthError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(serde_json::from_str(&body)?)
    }

    /// Handle paginated requests with nextPageToken
    pub async fn get_paginated(
        &self,
        url: &str,
        items_field: &str,
        base_query: &[(&str, String)],
        max_results: Option<usize>,
    ) -> Result<Vec<Value>> {
        let mut all_items = Vec::new();
        let mut page_token: Option<String> = None;
        let remaining = max_results.unwrap_or(usize::MAX);

        loop {
            let mut query = base_query.to_vec();
            if let Some(ref token) = page_token {
                query.push(("pageToken", token.clone()));
            }

            let response = self.get(url, &query).await?;

            if let Some(items) = response.get(items_field).and_then(|v| v.as_array()) {
                all_items.extend(items.iter().cloned());
                if all_items.len() >= remaining {
                    all_items.truncate(remaining);
                    break;
                }
            }

            match response.get("nextPageToken").and_then(|v| v.as_str()) {
                Some(next) => page_token = Some(next.to_string()),
                None => break,
            }
        }

        Ok(all_items)
    }
}

/// Extract error message from Google API error response
///
/// `{"error": {"code": 400, "message": "...", "status": "..."}}`
fn extract_error_message(response: &Value, status: StatusCode) -> String {
    if let Some(error_obj) = response.get("error") {
        if let Some(message) = error_obj.get("message").and_then(|v| v.as_str()) {
            let code = error_obj
                .get("code")
                .and_then(|v| v.as_i64())
                .unwrap_or(status.as_u16() as i64);
            let reason = error_obj
                .get("status")
                .and_then(|v| v.as_str())
                .map(|s| format!(" ({})", s))
                .unwrap_or_default();
            return format!("Google API error {}: {}{}", code, message, reason);
        }
    }

    format!("HTTP {} error", status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn transport() -> Transport {
        Transport::new(Client::new(), "ya29.bound", "alex@example.com")
    }

    #[test]
    fn test_extract_error_message() {
        let error_response = serde_json::json!({
            "error": {
                "code": 403,
                "message": "Request had insufficient authentication scopes.",
                "status": "PERMISSION_DENIED"
            }
        });

        let msg = extract_error_message(&error_response, StatusCode::FORBIDDEN);
        assert!(msg.contains("403"));
        assert!(msg.contains("insufficient authentication scopes"));
        assert!(msg.contains("PERMISSION_DENIED"));
    }

    #[test]
    fn test_debug_hides_token() {
        assert!(!format!("{:?}", transport()).contains("ya29.bound"));
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_reauth_signal() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/calendars")
            .match_header("authorization", "Bearer ya29.bound")
            .with_status(401)
            .create_async()
            .await;

        let err = transport()
            .get(&format!("{}/calendars", server.url()), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Unauthorized));
        assert!(err.needs_reauth());
    }

    #[tokio::test]
    async fn test_paginated_follows_page_tokens() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/files")
            .match_query(Matcher::Regex("^q=x$".into()))
            .with_status(200)
            .with_body(r#"{"files": [{"id": 1}, {"id": 2}], "nextPageToken": "p2"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/files")
            .match_query(Matcher::UrlEncoded("pageToken".into(), "p2".into()))
            .with_status(200)
            .with_body(r#"{"files": [{"id": 3}]}"#)
            .create_async()
            .await;

        let items = transport()
            .get_paginated(
                &format!("{}/files", server.url()),
                "files",
                &[("q", "x".to_string())],
                None,
            )
            .await
            .unwrap();
        assert_eq!(items.len(), 3);
    }

    #[tokio::test]
    async fn test_empty_success_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/events/1")
            .with_status(204)
            .create_async()
            .await;

        let value = transport()
            .delete(&format!("{}/events/1", server.url()))
            .await
            .unwrap();
        assert!(value.as_object().unwrap().is_empty());
    }
}
