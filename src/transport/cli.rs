//! CLI transport for direct terminal interaction

use crate::auth::callback::wait_for_redirect;
use crate::auth::{AuthEvent, AuthorizationResponse, PkceHandler, SessionRecord};
use crate::config::Config;
use crate::now_playing::{NowPlayingEvent, NowPlayingPoller, Playback};
use crate::storage::FileStore;
use anyhow::{Context, Result};
use colored::Colorize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Session backed by the configured durable store
pub fn open_session(config: &Config) -> Result<(PkceHandler, Arc<FileStore>)> {
    let store = Arc::new(config.open_store()?);
    let handler = PkceHandler::new(
        config.provider_config(),
        config.session_options(),
        store.clone(),
    )
    .context("Failed to open session")?;
    Ok((handler, store))
}

/// Start authorization and, unless `manual`, capture the redirect locally
pub async fn run_login(config: &Config, no_browser: bool, manual: bool) -> Result<()> {
    println!("{}", "=== Spotify Authorization ===".bold().cyan());
    println!();

    let (handler, _store) = open_session(config)?;
    let url = handler.begin_authorization()?;

    if !no_browser {
        println!("Opening browser for authorization...");
        if let Err(e) = open::that(url.as_str()) {
            tracing::warn!("Failed to open browser: {}", e);
            println!("⚠️  Could not open browser automatically.");
        }
    }
    println!("If the browser doesn't open, visit:");
    println!("{}", url);
    println!();

    if manual {
        println!("After approving, copy the URL you were redirected to and run:");
        println!("  nowplaying complete '<redirect url>'");
        return Ok(());
    }

    println!(
        "Waiting for redirect to {} ...",
        config.provider.redirect_url.dimmed()
    );
    let timeout = Duration::from_secs(config.session.callback_timeout_secs);
    let response = wait_for_redirect(&config.provider.redirect_url, timeout).await?;
    finish_authorization(&handler, &response).await
}

/// Complete authorization from a pasted redirect URL or query string
pub async fn run_complete(config: &Config, redirect: &str) -> Result<()> {
    let (handler, _store) = open_session(config)?;
    let response = AuthorizationResponse::from_redirect(redirect);
    finish_authorization(&handler, &response).await
}

async fn finish_authorization(handler: &PkceHandler, response: &AuthorizationResponse) -> Result<()> {
    println!("Exchanging authorization code for tokens...");
    if let Err(e) = handler.complete_authorization(response).await {
        if e.needs_reauthorization() || e.is_security_violation() {
            eprintln!("Run `nowplaying login` to start a new authorization.");
        }
        return Err(e.into());
    }

    println!("✅ {}", "Authorized with Spotify".green());
    if let Some(token) = handler.token_data() {
        println!("Token valid until: {}", token.expiration.to_rfc3339());
    }
    Ok(())
}

/// Print the stored session state
pub async fn run_status(config: &Config) -> Result<()> {
    let (handler, store) = open_session(config)?;
    // One-shot command; the refresh chain would die with the process anyway
    handler.cancel_refresh();

    println!("{}", "=== Session Status ===".bold().cyan());
    println!();
    println!("Client ID: {}", display_or_unset(&config.provider.client_id));
    println!("Storage:   {}", store.path_for(handler.slot().key()).display());

    match handler.token_data() {
        Some(token) => {
            println!("Status:    {}", "authorized".green());
            println!("Type:      {}", token.token_type);
            println!("Expires:   {}", token.expiration.to_rfc3339());
            if let Some(scope) = &token.scope {
                println!("Scope:     {}", scope);
            }
        }
        None => {
            let pending = matches!(
                handler.slot().load(&*store)?,
                Some(SessionRecord::Pending(_))
            );
            if pending {
                println!("Status:    {}", "authorization pending".yellow());
            } else {
                println!("Status:    {}", "not authorized".red());
                println!();
                println!("Run `nowplaying login` to authorize.");
            }
        }
    }
    Ok(())
}

/// Clear stored session state
pub async fn run_logout(config: &Config) -> Result<()> {
    let (handler, _store) = open_session(config)?;
    handler.logout()?;
    println!("✅ Cleared stored Spotify session");
    Ok(())
}

/// Show what is playing, once or continuously
pub async fn run_now_playing(config: &Config, watch: bool) -> Result<()> {
    let (handler, _store) = open_session(config)?;
    if !handler.is_authorized() {
        anyhow::bail!("Not authorized. Run `nowplaying login` first.");
    }

    if !watch {
        handler.cancel_refresh();
        let poller = NowPlayingPoller::new(handler, config.now_playing.clone());
        match poller.current_track().await? {
            Playback::Playing(track) => print_track(&track.track, &track.artists_display(), &track.album),
            Playback::Paused(track) => {
                print_track(&track.track, &track.artists_display(), &track.album);
                println!("{}", "(paused)".dimmed());
            }
            Playback::Ad => println!("{}", "Advertisement(s) are currently playing.".yellow()),
            Playback::NotPlaying => println!("{}", "Nothing is currently playing on Spotify.".dimmed()),
        }
        return Ok(());
    }

    let mut auth_events = handler.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = auth_events.recv().await {
            match event {
                AuthEvent::RefreshFailed { message } => {
                    eprintln!("{} {}", "Token refresh failed:".red(), message)
                }
                AuthEvent::Refreshed => tracing::debug!("Token refreshed"),
                _ => {}
            }
        }
    });

    let (tx, mut rx) = mpsc::channel(8);
    let poller = NowPlayingPoller::new(handler, config.now_playing.clone());
    let poll_task = tokio::spawn(poller.run(tx));

    while let Some(event) = rx.recv().await {
        match event {
            NowPlayingEvent::TrackChange(track) => {
                print_track(&track.track, &track.artists_display(), &track.album)
            }
            NowPlayingEvent::Exception { reason, .. } => {
                tracing::debug!("{}", reason.message());
            }
        }
    }

    poll_task.await.context("Now-playing poller panicked")?
}

fn print_track(track: &str, artists: &str, album: &str) {
    println!("♪ {} - {} ({})", track.bold(), artists.green(), album.dimmed());
}

fn display_or_unset(value: &str) -> String {
    if value.is_empty() {
        "(not set)".red().to_string()
    } else {
        value.to_string()
    }
}
