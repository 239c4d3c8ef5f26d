//! Data model for the PKCE session

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// OAuth 2.0 provider configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub client_id: String,
    /// Redirect URL registered for the client id
    pub redirect_url: String,
    pub authorization_url: String,
    pub token_url: String,
    /// Space separated scopes, optional
    pub scope: String,
}

impl ProviderConfig {
    /// Names of required fields that are empty (every field except `scope`)
    pub fn missing_fields(&self) -> Vec<&'static str> {
        [
            ("client_id", &self.client_id),
            ("redirect_url", &self.redirect_url),
            ("authorization_url", &self.authorization_url),
            ("token_url", &self.token_url),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect()
    }
}

/// State stashed between sending the user to the provider and their return
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAuthorization {
    pub state: String,
    pub code_verifier: String,
    pub sent_code_req: bool,
}

/// Token held by the session and mirrored into durable storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenData {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub token_type: String,
    /// Already shifted early by the refresh margin
    pub expiration: DateTime<Utc>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenData {
    /// A token is only trusted while the local clock is before its expiration
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiration
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Value for the `Authorization` header
    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

/// Whatever sits in this session's storage slot
///
/// Both shapes share one key; the pending record is replaced by the token
/// once the code exchange succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SessionRecord {
    Token(TokenData),
    Pending(PendingAuthorization),
}

/// OAuth2 token endpoint response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Required; a response without a lifetime can't be scheduled for refresh
    pub expires_in: u64,
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Query parameters the provider appended to the redirect
///
/// Provider-specific extras are kept and passed through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizationResponse {
    params: HashMap<String, String>,
}

impl AuthorizationResponse {
    pub fn new(params: HashMap<String, String>) -> Self {
        Self { params }
    }

    /// Parse a raw query string (a leading `?` is allowed)
    pub fn from_query(query: &str) -> Self {
        let query = query.trim().trim_start_matches('?');
        let params = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        Self { params }
    }

    /// Parse either a full redirect URL or a bare query string
    pub fn from_redirect(redirect: &str) -> Self {
        match url::Url::parse(redirect.trim()) {
            Ok(url) => Self::from_query(url.query().unwrap_or_default()),
            Err(_) => Self::from_query(redirect),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn state(&self) -> Option<&str> {
        self.get("state")
    }

    pub fn code(&self) -> Option<&str> {
        self.get("code")
    }

    pub fn error(&self) -> Option<&str> {
        self.get("error")
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }
}

/// Notifications for consumers waiting on the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    /// Authorization code exchanged for a token
    Authorized,
    /// Timer-driven or explicit refresh applied a new token
    Refreshed,
    /// A timer-driven refresh failed; nobody awaits the timer so it lands here
    RefreshFailed { message: String },
    /// Session was logged out
    LoggedOut,
}
