use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use lanclip::{
    duration_serde, interfaces, run_with_deadline, Announcer, ClipboardAccess, Config, Outcome,
    ReceiveError, Received, Receiver, SystemClipboard,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "lanclip", about = "Share your clipboard over the LAN")]
#[command(
    long_about = "Share your clipboard over the LAN. Contents are multicast to a group \
                  address; clips larger than one datagram are served over a direct TCP \
                  connection instead."
)]
struct Cli {
    #[arg(short, long, global = true, env = "LANCLIP_CONFIG", help = "Path to config file")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Log level (trace, debug, info, warn, error)")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Announce the clipboard until the timeout elapses
    Send {
        #[arg(short, long, value_parser = duration_serde::parse, help = "How long to keep sending, e.g. 60 or 2m")]
        timeout: Option<Duration>,

        #[arg(short, long = "interface", value_name = "NAME", help = "Interface to multicast on; repeatable (default: all)")]
        interfaces: Vec<String>,
    },
    /// Wait for one announcement and copy it into the clipboard
    Receive {
        #[arg(short, long, value_parser = duration_serde::parse, help = "How long to wait, e.g. 60 or 30s")]
        timeout: Option<Duration>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load_with_env(cli.config.as_deref()).context("loading config")?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
        config.validate()?;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("lanclip={}", config.logging.level).parse()?),
        )
        .init();

    match cli.command {
        Command::Send {
            timeout,
            interfaces,
        } => {
            if !interfaces.is_empty() {
                config.network.interfaces = interfaces;
            }
            send(&config, timeout.unwrap_or(config.transfer.run_timeout)).await
        }
        Command::Receive { timeout } => {
            receive(&config, timeout.unwrap_or(config.transfer.run_timeout)).await
        }
    }
}

async fn send(config: &Config, timeout: Duration) -> anyhow::Result<()> {
    let multicasters =
        interfaces::resolve(&config.network.interfaces, config.network.multicast_addr).await?;
    let clipboard = SystemClipboard::new()?;
    let announcer = Announcer::new(clipboard, multicasters, config.announce_settings());

    match run_with_deadline(timeout, announcer.run()).await {
        Outcome::Completed(result) => result?,
        Outcome::TimedOut => info!(?timeout, "reached broadcasting limit, stopping"),
    }
    Ok(())
}

async fn receive(config: &Config, timeout: Duration) -> anyhow::Result<()> {
    let receiver = Receiver::bind(config.receive_settings()).await?;
    let mut clipboard = SystemClipboard::new()?;
    info!(?timeout, "waiting for clipboard contents");

    match run_with_deadline(timeout, receive_first(&receiver, &mut clipboard)).await {
        Outcome::Completed(received) => {
            let received = received?;
            info!(from = %received.from, len = received.envelope.length, "received clipboard contents");
        }
        Outcome::TimedOut => info!(?timeout, "timed out without receiving anything"),
    }
    Ok(())
}

/// Keep listening until one announcement is adopted. Bad announcements and
/// failed fetches are skipped in favour of the next announcement.
async fn receive_first<C: ClipboardAccess>(
    receiver: &Receiver,
    clipboard: &mut C,
) -> Result<Received, ReceiveError> {
    loop {
        match receiver.receive_once(clipboard).await {
            Ok(received) => return Ok(received),
            Err(e) if e.is_setup_fatal() => return Err(e),
            Err(e) => warn!(error = %e, "receive attempt failed, waiting for next announcement"),
        }
    }
}
