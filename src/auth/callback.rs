//! Loopback listener that captures the provider redirect
//!
//! Stands in for the page load that would otherwise receive the redirect:
//! serves the redirect URL's path on its loopback host/port and hands back
//! the first set of query parameters it sees.

use super::types::AuthorizationResponse;
use anyhow::{Context, Result};
use axum::{extract::Query, response::Html, routing::get, Router};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use url::Url;

/// Default time to wait for the user to finish in the browser
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(120);

/// Socket address and path to listen on for a loopback redirect URL
pub fn listen_target(redirect_url: &str) -> Result<(String, String)> {
    let url = Url::parse(redirect_url).context("Invalid redirect_url")?;
    let host = url.host_str().context("redirect_url has no host")?;
    if !matches!(host, "127.0.0.1" | "localhost" | "[::1]") {
        anyhow::bail!(
            "Redirect capture needs a loopback redirect_url, got host '{}'",
            host
        );
    }
    let port = url
        .port_or_known_default()
        .context("Could not determine port from redirect_url")?;
    let bind_host = if host == "[::1]" { "[::1]" } else { "127.0.0.1" };

    let path = match url.path() {
        "" => "/".to_string(),
        path => path.to_string(),
    };
    Ok((format!("{}:{}", bind_host, port), path))
}

/// Wait for the provider to redirect the browser back to `redirect_url`
pub async fn wait_for_redirect(
    redirect_url: &str,
    timeout: Duration,
) -> Result<AuthorizationResponse> {
    let (addr, path) = listen_target(redirect_url)?;
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind redirect listener to {}", addr))?;
    serve_redirect(listener, &path, timeout).await
}

/// Serve `path` on an already-bound listener until one redirect arrives
pub async fn serve_redirect(
    listener: TcpListener,
    path: &str,
    timeout: Duration,
) -> Result<AuthorizationResponse> {
    let (tx, rx) = oneshot::channel::<HashMap<String, String>>();
    let tx = Arc::new(Mutex::new(Some(tx)));

    let app = Router::new().route(
        path,
        get(move |Query(params): Query<HashMap<String, String>>| async move {
            let page = if let Some(error) = params.get("error") {
                format!(
                    "<h1>Authorization failed</h1><p>Error: {}</p><p>Close this window and try again.</p>",
                    html_escape(error)
                )
            } else {
                "<h1>Authorization received</h1><p>You can close this window and return to the terminal.</p>"
                    .to_string()
            };
            if let Some(sender) = tx.lock().ok().and_then(|mut slot| slot.take()) {
                let _ = sender.send(params);
            }
            Html(page)
        }),
    );

    if let Ok(addr) = listener.local_addr() {
        tracing::debug!("Redirect listener on {}{}", addr, path);
    }
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let shutdown = async {
            let _ = shutdown_rx.await;
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!("Redirect listener error: {}", e);
        }
    });

    let outcome = tokio::time::timeout(timeout, rx).await;
    let _ = shutdown_tx.send(());
    // Let the response to the browser flush before returning
    let _ = tokio::time::timeout(Duration::from_secs(2), server).await;

    match outcome {
        Ok(Ok(params)) => Ok(AuthorizationResponse::new(params)),
        Ok(Err(_)) => anyhow::bail!("Redirect listener stopped before a response arrived"),
        Err(_) => anyhow::bail!(
            "Authorization timeout - no redirect after {} seconds. Please try again.",
            timeout.as_secs()
        ),
    }
}

fn html_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
