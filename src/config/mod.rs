//! Configuration management for nowplaying

use crate::auth::callback::DEFAULT_CALLBACK_TIMEOUT;
use crate::auth::{ProviderConfig, SessionOptions, DEFAULT_STORAGE_KEY};
use crate::storage::FileStore;
use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};

pub const SPOTIFY_AUTHORIZATION_URL: &str = "https://accounts.spotify.com/authorize";
pub const SPOTIFY_TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
pub const SPOTIFY_CURRENTLY_PLAYING_URL: &str =
    "https://api.spotify.com/v1/me/player/currently-playing";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Keys missing from `[provider]` keep the Spotify defaults
    #[serde(deserialize_with = "spotify_provider_with_overrides")]
    pub provider: ProviderConfig,
    pub session: SessionConfig,
    pub now_playing: NowPlayingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: spotify_provider(),
            session: SessionConfig::default(),
            now_playing: NowPlayingConfig::default(),
        }
    }
}

/// Spotify endpoints with a loopback redirect; the client id must be configured
pub fn spotify_provider() -> ProviderConfig {
    ProviderConfig {
        client_id: String::new(),
        redirect_url: "http://127.0.0.1:8888/callback".to_string(),
        authorization_url: SPOTIFY_AUTHORIZATION_URL.to_string(),
        token_url: SPOTIFY_TOKEN_URL.to_string(),
        scope: "user-read-playback-state".to_string(),
    }
}

fn spotify_provider_with_overrides<'de, D>(deserializer: D) -> Result<ProviderConfig, D::Error>
where
    D: Deserializer<'de>,
{
    use serde_json::{Map, Value};

    let overrides = Map::<String, Value>::deserialize(deserializer)?;
    let mut merged = match serde_json::to_value(spotify_provider()) {
        Ok(Value::Object(defaults)) => defaults,
        _ => Map::new(),
    };
    merged.extend(overrides);
    serde_json::from_value(Value::Object(merged)).map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Nests state under this name inside the storage key; "" stores it flat
    pub provider_name: Option<String>,
    pub storage_key: String,
    pub auto_refresh: bool,
    /// Directory for stored session state (default: platform data dir)
    pub storage_dir: Option<PathBuf>,
    /// How long `login` waits for the browser redirect
    pub callback_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            provider_name: Some("spotify".to_string()),
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            auto_refresh: true,
            storage_dir: None,
            callback_timeout_secs: DEFAULT_CALLBACK_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NowPlayingConfig {
    pub api_url: String,
    /// Poll delay while an ad plays or the track is unchanged
    pub same_track_poll_secs: u64,
    /// Poll delay while nothing is playing
    pub idle_poll_secs: u64,
}

impl Default for NowPlayingConfig {
    fn default() -> Self {
        Self {
            api_url: SPOTIFY_CURRENTLY_PLAYING_URL.to_string(),
            same_track_poll_secs: 30,
            idle_poll_secs: 60,
        }
    }
}

impl Config {
    /// Load configuration from default location or create default
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path`, falling back to defaults if absent
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            Ok(config)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Config::default())
        }
    }

    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "nowplaying") {
            let config_dir = proj_dirs.config_dir();
            std::fs::create_dir_all(config_dir)?;
            Ok(config_dir.join("config.toml"))
        } else {
            Ok(PathBuf::from("config.toml"))
        }
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn provider_config(&self) -> ProviderConfig {
        self.provider.clone()
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            provider_name: self.session.provider_name.clone(),
            storage_key: self.session.storage_key.clone(),
            auto_refresh: self.session.auto_refresh,
        }
    }

    /// Durable store for session state
    pub fn open_store(&self) -> Result<FileStore> {
        match &self.session.storage_dir {
            Some(dir) => FileStore::new(dir),
            None => FileStore::default_location(),
        }
    }
}
