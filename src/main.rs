use anyhow::Result;
use clap::{Parser, Subcommand};
use nowplaying_cli::transport;
use nowplaying_cli::Config;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    env!("NOWPLAYING_VERSION_SUFFIX")
);

#[derive(Parser)]
#[command(name = "nowplaying")]
#[command(author, version = VERSION, about = "Show what is playing on Spotify", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to config file (default: platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Authorize with Spotify (authorization code + PKCE)
    Login {
        /// Print the authorization URL instead of opening a browser
        #[arg(long)]
        no_browser: bool,

        /// Don't listen for the redirect; finish with `complete` instead
        #[arg(long)]
        manual: bool,
    },

    /// Finish a pending authorization from the redirect URL
    Complete {
        /// Redirect URL (or its query string) the provider sent the browser to
        redirect: String,
    },

    /// Show stored session state
    Status,

    /// Clear stored session state
    Logout,

    /// Show the currently playing track
    NowPlaying {
        /// Keep polling and print each track change
        #[arg(short, long)]
        watch: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "nowplaying_cli=debug"
    } else {
        "nowplaying_cli=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    tracing::debug!(
        "nowplaying {} ({}, built {})",
        VERSION,
        env!("NOWPLAYING_GIT_HASH"),
        env!("NOWPLAYING_BUILD_TIME")
    );

    match cli.command {
        Commands::Login { no_browser, manual } => {
            transport::cli::run_login(&config, no_browser, manual).await?;
        }
        Commands::Complete { redirect } => {
            transport::cli::run_complete(&config, &redirect).await?;
        }
        Commands::Status => {
            transport::cli::run_status(&config).await?;
        }
        Commands::Logout => {
            transport::cli::run_logout(&config).await?;
        }
        Commands::NowPlaying { watch } => {
            transport::cli::run_now_playing(&config, watch).await?;
        }
    }

    Ok(())
}
