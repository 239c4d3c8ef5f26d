//! PKCE OAuth2 session manager
//!
//! Drives the authorization-code + PKCE exchange for one provider, keeps the
//! token alive with a self-rescheduling refresh, and authorizes outgoing
//! requests. The basic flow:
//! - construct with a `ProviderConfig` (a stored, unexpired token is adopted)
//! - `begin_authorization()` and send the user to the returned URL
//! - `complete_authorization()` with the redirect's query parameters
//! - `authorized_fetch()` instead of calling the HTTP client directly

use super::error::AuthError;
use super::pkce::{code_challenge_s256, generate_random_string, RANDOM_STRING_LEN};
use super::refresh::{self, TimerKey};
use super::state::StateSlot;
use super::types::{
    AuthEvent, AuthorizationResponse, PendingAuthorization, ProviderConfig, SessionRecord,
    TokenData, TokenResponse,
};
use crate::storage::KeyValueStore;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use url::Url;

/// Storage key used when none is configured
pub const DEFAULT_STORAGE_KEY: &str = "PkceHandler";

/// Tokens are treated as expiring this many seconds before the provider says
pub const REFRESH_MARGIN_SECS: u64 = 30;

/// Shortest delay before a refresh that follows a token response, so a
/// provider handing out short-lived tokens can't spin the refresh loop
pub const MIN_REFRESH_DELAY: Duration = Duration::from_secs(5);

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Per-session options supplied alongside the provider configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Nests this session's record under the name inside the storage key.
    /// Required when several providers share one key.
    pub provider_name: Option<String>,
    pub storage_key: String,
    pub auto_refresh: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            provider_name: None,
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            auto_refresh: true,
        }
    }
}

/// Request options for `authorized_fetch`
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub method: reqwest::Method,
    pub headers: HeaderMap,
    pub body: Option<String>,
}

impl FetchOptions {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn new(method: reqwest::Method) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// PKCE OAuth2 session for a single provider
///
/// Cheap to clone; clones share the token, the refresh timer and storage.
#[derive(Clone)]
pub struct PkceHandler {
    inner: Arc<Inner>,
}

struct Inner {
    config: ProviderConfig,
    slot: StateSlot,
    store: Arc<dyn KeyValueStore>,
    auto_refresh: bool,
    http_client: reqwest::Client,
    token: Mutex<Option<TokenData>>,
    timer_key: TimerKey,
    events: broadcast::Sender<AuthEvent>,
}

impl Inner {
    fn owner_id(&self) -> usize {
        self as *const Inner as usize
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Leave the timer alone if another session has taken it over
        refresh::cancel_owned(&self.timer_key, self.owner_id());
    }
}

impl PkceHandler {
    /// Create a session, adopting a stored token if it has not expired
    pub fn new(
        config: ProviderConfig,
        options: SessionOptions,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self, AuthError> {
        Self::with_http_client(config, options, store, reqwest::Client::new())
    }

    /// Same as `new` with a caller-supplied HTTP client
    pub fn with_http_client(
        config: ProviderConfig,
        options: SessionOptions,
        store: Arc<dyn KeyValueStore>,
        http_client: reqwest::Client,
    ) -> Result<Self, AuthError> {
        let slot = StateSlot::resolve(&options.storage_key, options.provider_name.as_deref());

        let adopted = match slot.load(store.as_ref()).map_err(AuthError::Storage)? {
            Some(SessionRecord::Token(token)) if !token.is_expired() => Some(token),
            Some(SessionRecord::Token(_)) => {
                tracing::debug!("Stored token in '{}' has expired; not adopting", slot.key());
                None
            }
            _ => None,
        };

        let timer_key = TimerKey {
            location: store.location(),
            slot: slot.clone(),
        };
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let handler = Self {
            inner: Arc::new(Inner {
                config,
                slot,
                store,
                auto_refresh: options.auto_refresh,
                http_client,
                token: Mutex::new(adopted.clone()),
                timer_key,
                events,
            }),
        };

        if let Some(token) = adopted {
            tracing::info!(
                "Adopted stored token from '{}' (expires {})",
                handler.inner.slot.key(),
                token.expiration
            );
            // Replaces any refresh another session scheduled for this slot
            if handler.inner.auto_refresh {
                handler.schedule_refresh(time_until(token.expiration));
            }
        }

        Ok(handler)
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.inner.config
    }

    pub fn slot(&self) -> &StateSlot {
        &self.inner.slot
    }

    /// Start an authorization round-trip
    ///
    /// Persists a fresh pending authorization and returns the URL the user
    /// must be sent to. Any earlier pending authorization is replaced, so a
    /// redirect answering it will be rejected.
    pub fn begin_authorization(&self) -> Result<Url, AuthError> {
        let config = &self.inner.config;
        let missing = config.missing_fields();
        if !missing.is_empty() {
            return Err(AuthError::Configuration(missing.join(", ")));
        }

        let state = generate_random_string(RANDOM_STRING_LEN);
        let code_verifier = generate_random_string(RANDOM_STRING_LEN);
        let challenge = code_challenge_s256(&code_verifier);
        let url = build_authorization_url(config, &state, &challenge)?;

        // Must land in storage before the user leaves; nothing else survives the redirect
        let pending = PendingAuthorization {
            state,
            code_verifier,
            sent_code_req: true,
        };
        self.inner
            .slot
            .save(self.inner.store.as_ref(), &SessionRecord::Pending(pending))
            .map_err(AuthError::Storage)?;

        tracing::info!("Authorization started for client {}", config.client_id);
        Ok(url)
    }

    /// Exchange the redirect's authorization code for a token
    pub async fn complete_authorization(
        &self,
        response: &AuthorizationResponse,
    ) -> Result<(), AuthError> {
        let pending = match self
            .inner
            .slot
            .load(self.inner.store.as_ref())
            .map_err(AuthError::Storage)?
        {
            Some(SessionRecord::Pending(pending)) if pending.sent_code_req => pending,
            _ => {
                return Err(AuthError::InvalidState(
                    "no authorization request is pending for this session".to_string(),
                ))
            }
        };

        if response.state() != Some(pending.state.as_str()) {
            tracing::warn!("Rejecting provider redirect: state does not match pending authorization");
            return Err(AuthError::Security);
        }

        if let Some(error) = response.error() {
            return Err(AuthError::Denied {
                error: error.to_string(),
            });
        }
        let code = response.code().ok_or(AuthError::MissingCode)?;

        let config = &self.inner.config;
        let params = [
            ("client_id", config.client_id.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", config.redirect_url.as_str()),
            ("code_verifier", pending.code_verifier.as_str()),
        ];
        let token = self.request_token(&params).await?;
        self.apply_token(token)?;

        tracing::info!("Authorization complete");
        self.emit(AuthEvent::Authorized);
        Ok(())
    }

    /// Exchange the held refresh token for a new access token
    pub async fn refresh(&self) -> Result<(), AuthError> {
        let refresh_token = self
            .token_data()
            .and_then(|token| token.refresh_token)
            .ok_or_else(|| AuthError::NotAuthorized("no refresh token held".to_string()))?;

        tracing::debug!("Refreshing OAuth token");
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", self.inner.config.client_id.as_str()),
        ];
        let token = self.request_token(&params).await?;
        self.apply_token(token)?;

        tracing::info!("Refreshed OAuth token at {}", Utc::now());
        self.emit(AuthEvent::Refreshed);
        Ok(())
    }

    /// Send a request carrying the session's bearer token
    ///
    /// Caller headers are kept except `Authorization` and `Content-Type`,
    /// which are always set. The response comes back as the transport
    /// reported it; non-success statuses are not turned into errors.
    pub async fn authorized_fetch(
        &self,
        url: &str,
        options: FetchOptions,
    ) -> Result<reqwest::Response, AuthError> {
        let token = self.valid_token()?;

        let mut authorization = HeaderValue::from_str(&token.authorization_header())
            .map_err(|_| AuthError::InvalidResponse("token is not a valid header value".to_string()))?;
        authorization.set_sensitive(true);

        let mut headers = options.headers;
        headers.insert(AUTHORIZATION, authorization);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let mut request = self
            .inner
            .http_client
            .request(options.method, url)
            .headers(headers);
        if let Some(body) = options.body {
            request = request.body(body);
        }

        Ok(request.send().await?)
    }

    /// Current token, expired or not
    pub fn token_data(&self) -> Option<TokenData> {
        self.token_guard().clone()
    }

    /// Whether an unexpired token is held
    pub fn is_authorized(&self) -> bool {
        self.valid_token().is_ok()
    }

    /// When the pending refresh fires, if one is scheduled
    ///
    /// The timer is shared by every session over the same stored state.
    pub fn next_refresh_at(&self) -> Option<DateTime<Utc>> {
        refresh::fires_at_for(&self.inner.timer_key)
    }

    /// Stop the refresh chain; returns whether a refresh was pending
    pub fn cancel_refresh(&self) -> bool {
        let cancelled = refresh::cancel_for(&self.inner.timer_key);
        if cancelled {
            tracing::debug!("Cancelled pending token refresh");
        }
        cancelled
    }

    /// Receive `AuthEvent`s from this session
    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.events.subscribe()
    }

    /// Forget the token and clear this session's stored record
    pub fn logout(&self) -> Result<(), AuthError> {
        self.cancel_refresh();
        *self.token_guard() = None;
        self.inner
            .slot
            .clear(self.inner.store.as_ref())
            .map_err(AuthError::Storage)?;
        tracing::info!("Logged out of '{}'", self.inner.slot.key());
        self.emit(AuthEvent::LoggedOut);
        Ok(())
    }

    /// Store a token endpoint response as the session token
    ///
    /// Shared by code exchange and refresh; the last writer wins.
    pub(crate) fn apply_token(&self, response: TokenResponse) -> Result<TokenData, AuthError> {
        let now = Utc::now();
        let lifetime = response.expires_in.saturating_sub(REFRESH_MARGIN_SECS);
        let expiration = i64::try_from(lifetime)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        // Providers may omit the refresh token on refresh; keep the one we have
        let refresh_token = response
            .refresh_token
            .or_else(|| self.token_data().and_then(|token| token.refresh_token));

        let token = TokenData {
            access_token: response.access_token,
            refresh_token,
            token_type: response.token_type,
            expiration,
            scope: response.scope,
        };

        if self.inner.auto_refresh {
            self.schedule_refresh(time_until(token.expiration).max(MIN_REFRESH_DELAY));
        }

        *self.token_guard() = Some(token.clone());
        self.inner
            .slot
            .save(self.inner.store.as_ref(), &SessionRecord::Token(token.clone()))
            .map_err(AuthError::Storage)?;

        Ok(token)
    }

    async fn request_token(&self, params: &[(&str, &str)]) -> Result<TokenResponse, AuthError> {
        let response = self
            .inner
            .http_client
            .post(&self.inner.config.token_url)
            .form(params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!("Token endpoint error body: {}", body);
            return Err(AuthError::from_status(status));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))
    }

    fn schedule_refresh(&self, delay: Duration) {
        let weak = Arc::downgrade(&self.inner);

        let task = async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let handler = PkceHandler { inner };
            if let Err(e) = handler.refresh().await {
                tracing::error!("Automatic token refresh failed: {}", e);
                handler.emit(AuthEvent::RefreshFailed {
                    message: e.to_string(),
                });
            }
        };

        let scheduled =
            refresh::schedule_for(&self.inner.timer_key, self.inner.owner_id(), delay, task);
        if let Err(e) = scheduled {
            tracing::warn!("Token refresh not scheduled, no async runtime: {}", e);
        }
    }

    /// Unexpired token, picking up one another session stored if ours is stale
    fn valid_token(&self) -> Result<TokenData, AuthError> {
        let held = self.token_data();
        if let Some(token) = held.as_ref().filter(|token| !token.is_expired()) {
            return Ok(token.clone());
        }

        if let Ok(Some(SessionRecord::Token(stored))) = self.inner.slot.load(self.inner.store.as_ref()) {
            if !stored.is_expired() {
                tracing::debug!("Using token stored by another session in '{}'", self.inner.slot.key());
                *self.token_guard() = Some(stored.clone());
                return Ok(stored);
            }
        }

        match held {
            Some(_) => Err(AuthError::NotAuthorized("token has expired".to_string())),
            None => Err(AuthError::NotAuthorized("no token held".to_string())),
        }
    }

    fn emit(&self, event: AuthEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    fn token_guard(&self) -> MutexGuard<'_, Option<TokenData>> {
        self.inner.token.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn time_until(instant: DateTime<Utc>) -> Duration {
    (instant - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

impl std::fmt::Debug for PkceHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkceHandler")
            .field("client_id", &self.inner.config.client_id)
            .field("slot", &self.inner.slot)
            .field("auto_refresh", &self.inner.auto_refresh)
            .field("authorized", &self.is_authorized())
            .finish()
    }
}

/// Authorization URL with the PKCE query parameters appended
pub fn build_authorization_url(
    config: &ProviderConfig,
    state: &str,
    code_challenge: &str,
) -> Result<Url, AuthError> {
    let mut url = Url::parse(&config.authorization_url)
        .map_err(|e| AuthError::Configuration(format!("authorization_url ({})", e)))?;

    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("response_type", "code")
            .append_pair("client_id", &config.client_id)
            .append_pair("redirect_uri", &config.redirect_url)
            .append_pair("state", state)
            .append_pair("code_challenge", code_challenge)
            .append_pair("code_challenge_method", "S256");
        if !config.scope.is_empty() {
            query.append_pair("scope", &config.scope);
        }
    }

    Ok(url)
}
