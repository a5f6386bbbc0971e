use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

mod commands;
mod ui;

#[derive(Parser)]
#[command(name = "tarr")]
#[command(about = "Confirm that a message sent from the Teams UI got a bot reply.")]
#[command(version)]
struct Cli {
    /// Config file (default: <data dir>/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Show debug logs
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with a device code and cache the refresh token
    Login,

    /// Look up team and channel ids by display name
    Resolve {
        /// Team name (default: target.team_name)
        #[arg(long)]
        team: Option<String>,
        /// Channel name (default: target.channel_name)
        #[arg(long)]
        channel: Option<String>,
        /// List all joined teams, or the team's channels when --team is set
        #[arg(long)]
        list: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Find the message just sent and wait for the bot's reply
    Watch {
        /// Text the UI typed; its first 60 characters identify the message
        #[arg(long)]
        hint: String,
        /// When the UI sent it, RFC 3339 (default: now)
        #[arg(long, value_name = "TIME")]
        sent_at: Option<String>,
        /// Seconds to wait for a reply (default: poll.timeout_secs)
        #[arg(long)]
        timeout: Option<f64>,
        /// Seconds between polls (default: poll.interval_secs)
        #[arg(long)]
        interval: Option<f64>,
        /// Accept any reply after this many polls (0 disables)
        #[arg(long)]
        accept_after: Option<u32>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List application senders seen in the target channel
    Bots {
        /// Root messages to scan
        #[arg(long, default_value = "50")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let config = cli.config;
    match cli.command {
        Commands::Login => commands::login::run(config, cancel).await,
        Commands::Resolve {
            team,
            channel,
            list,
            json,
        } => commands::resolve::run(config, cancel, team, channel, list, json).await,
        Commands::Watch {
            hint,
            sent_at,
            timeout,
            interval,
            accept_after,
            json,
        } => {
            let args = commands::watch::WatchArgs {
                hint,
                sent_at,
                timeout,
                interval,
                accept_after,
                json,
            };
            commands::watch::run(config, cancel, args).await
        }
        Commands::Bots { limit, json } => commands::bots::run(config, cancel, limit, json).await,
    }
}
