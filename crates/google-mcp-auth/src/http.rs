//! HTTP Client Utilities
//!
//! Shared reqwest client construction with consistent timeouts.

use std::time::Duration;

use crate::error::{AuthError, Result};

/// Provider calls (token exchange, refresh, revoke, introspection).
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);
/// API calls made through a bound transport.
const API_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client used for identity-provider endpoints
pub fn create_provider_client() -> Result<reqwest::Client> {
    build(PROVIDER_TIMEOUT)
}

/// Client backing authenticated API transports
pub fn create_api_client() -> Result<reqwest::Client> {
    build(API_TIMEOUT)
}

fn build(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| AuthError::Http(format!("Failed to build HTTP client: {}", e)))
}
