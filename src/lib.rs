//! nowplaying: Spotify now-playing companion
//!
//! This library provides:
//! - `PkceHandler`, an OAuth2 authorization-code + PKCE session manager
//! - Pluggable key-value storage for session state (memory and file backed)
//! - A currently-playing poller built on the authorized session
//! - CLI transport for the `nowplaying` binary

pub mod auth;
pub mod config;
pub mod now_playing;
pub mod storage;
pub mod transport;

pub use auth::{AuthError, PkceHandler};
pub use config::Config;
pub use storage::{FileStore, KeyValueStore, MemoryStore};
