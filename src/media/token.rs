//! Room-Token Abruf
//!
//! Der Token-Endpoint ist ein einzelner HTTP POST ohne Body und antwortet mit
//! `{ "livekitToken": "<token>" }`.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Token request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Token endpoint returned status {0}")]
    Status(u16),

    #[error("Invalid token response: {0}")]
    InvalidBody(#[from] serde_json::Error),

    #[error("Token response did not contain a livekitToken")]
    MissingToken,
}

// ============================================================================
// CREDENTIAL
// ============================================================================

/// Kurzlebiges Credential zum Betreten eines Rooms
#[derive(Clone, PartialEq, Eq)]
pub struct RoomCredential(String);

impl RoomCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for RoomCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RoomCredential").field(&"<redacted>").finish()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(rename = "livekitToken")]
    livekit_token: Option<String>,
}

/// Parst die Antwort des Token-Endpoints
pub fn parse_token_response(body: &[u8]) -> Result<RoomCredential, TokenError> {
    let response: TokenResponse = serde_json::from_slice(body)?;
    match response.livekit_token {
        Some(token) if !token.is_empty() => Ok(RoomCredential(token)),
        _ => Err(TokenError::MissingToken),
    }
}

// ============================================================================
// PROVIDER
// ============================================================================

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn fetch_token(&self) -> Result<RoomCredential, TokenError>;
}

/// Holt Tokens per HTTP vom Cloud-Function Endpoint
#[derive(Debug, Clone)]
pub struct HttpTokenProvider {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpTokenProvider {
    pub fn new(endpoint: Url) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint)
    }

    pub fn with_client(client: reqwest::Client, endpoint: Url) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn fetch_token(&self) -> Result<RoomCredential, TokenError> {
        tracing::debug!("Requesting room token from {}", self.endpoint);

        let response = self.client.post(self.endpoint.clone()).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TokenError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        parse_token_response(&body)
    }
}

// ============================================================================
// TESTS
// ============================================================================
