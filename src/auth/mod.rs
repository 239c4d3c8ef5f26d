//! OAuth2 authorization-code + PKCE session management
//!
//! `PkceHandler` owns the whole code/token lifecycle for one provider
//! configuration; the rest of this module supports it.

pub mod callback;
mod error;
mod handler;
pub mod pkce;
mod refresh;
mod state;
mod types;

pub use error::AuthError;
pub use handler::{
    build_authorization_url, FetchOptions, PkceHandler, SessionOptions, DEFAULT_STORAGE_KEY,
    MIN_REFRESH_DELAY, REFRESH_MARGIN_SECS,
};
pub use refresh::RefreshTimer;
pub use state::StateSlot;
pub use types::{
    AuthEvent, AuthorizationResponse, PendingAuthorization, ProviderConfig, SessionRecord,
    TokenData, TokenResponse,
};
