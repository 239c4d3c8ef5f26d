//! Currently-playing poller built on the authorized session
//!
//! Polls the player endpoint and turns what it sees into track-change or
//! exception events, timing the next poll to the end of the current track.

use crate::auth::{AuthError, AuthEvent, FetchOptions, PkceHandler};
use crate::config::NowPlayingConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

/// Added to the remaining time so the next poll lands after the track ends
pub const END_OF_TRACK_OFFSET: Duration = Duration::from_millis(150);

const MIN_POLL_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct CurrentlyPlaying {
    #[serde(default)]
    is_playing: bool,
    #[serde(default)]
    progress_ms: Option<u64>,
    #[serde(default)]
    currently_playing_type: Option<String>,
    #[serde(default)]
    item: Option<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    name: String,
    duration_ms: u64,
    #[serde(default)]
    artists: Vec<Named>,
    album: Album,
}

#[derive(Debug, Deserialize)]
struct Named {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Album {
    name: String,
    #[serde(default)]
    images: Vec<Image>,
}

#[derive(Debug, Deserialize)]
struct Image {
    url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackInfo {
    pub artists: Vec<String>,
    pub track: String,
    pub album: String,
    pub album_art: Option<String>,
    pub time_remaining: Duration,
}

impl TrackInfo {
    pub fn is_same_track(&self, other: &TrackInfo) -> bool {
        self.track == other.track && self.album == other.album && self.artists == other.artists
    }

    pub fn artists_display(&self) -> String {
        self.artists.join(", ")
    }
}

/// What the player endpoint reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Playback {
    Playing(TrackInfo),
    Paused(TrackInfo),
    NotPlaying,
    Ad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackException {
    Ad,
    NotPlaying,
    SameTrack,
}

impl PlaybackException {
    pub fn message(&self) -> &'static str {
        match self {
            PlaybackException::Ad => "Advertisement(s) are currently playing.",
            PlaybackException::NotPlaying => "Nothing is currently playing on Spotify.",
            PlaybackException::SameTrack => {
                "The current track hasn't changed from the last request."
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NowPlayingEvent {
    TrackChange(TrackInfo),
    Exception {
        reason: PlaybackException,
        track: Option<TrackInfo>,
    },
}

/// Interpret a player endpoint response
pub fn parse_playback(status: u16, body: &str) -> Result<Playback> {
    if status == 204 || body.trim().is_empty() {
        return Ok(Playback::NotPlaying);
    }

    let data: CurrentlyPlaying =
        serde_json::from_str(body).context("Failed to parse currently-playing response")?;
    if data.currently_playing_type.as_deref() == Some("ad") {
        return Ok(Playback::Ad);
    }
    let Some(item) = data.item else {
        return Ok(Playback::NotPlaying);
    };

    let duration = Duration::from_millis(item.duration_ms);
    let time_remaining = match data.progress_ms {
        Some(progress) if progress > 0 => {
            duration.saturating_sub(Duration::from_millis(progress)) + END_OF_TRACK_OFFSET
        }
        _ => duration,
    };

    let track = TrackInfo {
        artists: item.artists.into_iter().map(|a| a.name).collect(),
        track: item.name,
        album: item.album.name,
        album_art: item.album.images.into_iter().next().map(|i| i.url),
        time_remaining,
    };

    if data.is_playing {
        Ok(Playback::Playing(track))
    } else {
        Ok(Playback::Paused(track))
    }
}

pub struct NowPlayingPoller {
    handler: PkceHandler,
    config: NowPlayingConfig,
    last_track: Option<TrackInfo>,
}

impl NowPlayingPoller {
    pub fn new(handler: PkceHandler, config: NowPlayingConfig) -> Self {
        Self {
            handler,
            config,
            last_track: None,
        }
    }

    pub fn last_track(&self) -> Option<&TrackInfo> {
        self.last_track.as_ref()
    }

    /// Ask the player endpoint what is playing right now
    pub async fn current_track(&self) -> Result<Playback> {
        let response = self
            .handler
            .authorized_fetch(&self.config.api_url, FetchOptions::get())
            .await?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Currently-playing request failed ({})", status);
        }
        let body = response
            .text()
            .await
            .context("Failed to read currently-playing response")?;
        parse_playback(status.as_u16(), &body)
    }

    /// Poll once, returning the event and the delay until the next poll
    pub async fn poll(&mut self) -> Result<(NowPlayingEvent, Duration)> {
        let playback = self.current_track().await?;
        Ok(self.observe(playback))
    }

    /// Classify `playback` against the last seen track
    ///
    /// The same-track check comes first, so pausing the last track reports
    /// `SameTrack` rather than `NotPlaying`.
    pub fn observe(&mut self, playback: Playback) -> (NowPlayingEvent, Duration) {
        let same_track_delay = Duration::from_secs(self.config.same_track_poll_secs);
        let idle_delay = Duration::from_secs(self.config.idle_poll_secs);

        match playback {
            Playback::Ad => (
                NowPlayingEvent::Exception {
                    reason: PlaybackException::Ad,
                    track: None,
                },
                same_track_delay,
            ),
            Playback::NotPlaying => (
                NowPlayingEvent::Exception {
                    reason: PlaybackException::NotPlaying,
                    track: None,
                },
                idle_delay,
            ),
            Playback::Paused(track) => {
                let (reason, delay) = if self.is_last_track(&track) {
                    (PlaybackException::SameTrack, same_track_delay)
                } else {
                    (PlaybackException::NotPlaying, idle_delay)
                };
                (
                    NowPlayingEvent::Exception {
                        reason,
                        track: Some(track),
                    },
                    delay,
                )
            }
            Playback::Playing(track) => {
                if self.is_last_track(&track) {
                    (
                        NowPlayingEvent::Exception {
                            reason: PlaybackException::SameTrack,
                            track: Some(track),
                        },
                        same_track_delay,
                    )
                } else {
                    let delay = track.time_remaining.max(MIN_POLL_DELAY);
                    self.last_track = Some(track.clone());
                    (NowPlayingEvent::TrackChange(track), delay)
                }
            }
        }
    }

    fn is_last_track(&self, track: &TrackInfo) -> bool {
        self.last_track
            .as_ref()
            .is_some_and(|last| last.is_same_track(track))
    }

    /// Poll until the receiver goes away or the session loses authorization
    ///
    /// An expired token only ends the loop when no refresh is pending.
    pub async fn run(mut self, events: mpsc::Sender<NowPlayingEvent>) -> Result<()> {
        loop {
            let delay = match self.poll().await {
                Ok((event, delay)) => {
                    if events.send(event).await.is_err() {
                        return Ok(());
                    }
                    delay
                }
                Err(e) => {
                    if matches!(e.downcast_ref::<AuthError>(), Some(AuthError::NotAuthorized(_))) {
                        if self.handler.next_refresh_at().is_none() {
                            return Err(e);
                        }
                        self.wait_for_refresh().await;
                        continue;
                    }
                    tracing::warn!("Currently-playing poll failed: {}", e);
                    Duration::from_secs(self.config.idle_poll_secs)
                }
            };
            tokio::time::sleep(delay).await;
        }
    }

    /// Wait for the pending refresh to land, at most one idle poll interval
    async fn wait_for_refresh(&self) {
        let mut auth_events = self.handler.subscribe();
        // The refresh may have finished between the failed poll and subscribing
        if self.handler.is_authorized() {
            return;
        }

        tracing::debug!("Token expired, waiting for the scheduled refresh");
        let idle_delay = Duration::from_secs(self.config.idle_poll_secs);
        let _ = tokio::time::timeout(idle_delay, async {
            while let Ok(event) = auth_events.recv().await {
                if matches!(event, AuthEvent::Refreshed | AuthEvent::RefreshFailed { .. }) {
                    break;
                }
            }
        })
        .await;
    }
}
