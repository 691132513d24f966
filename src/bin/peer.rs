//! Media mesh peer
//!
//! Usage: `peer <address> [host | join <host-address>] [--config <path>]`
//!
//! Without a command the peer just waits to be joined or hosted by others.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_media_mesh::config::AppConfig;
use lan_media_mesh::participant::{Devices, Participant, Transport};

enum Command {
    Wait,
    Host,
    Join(SocketAddr),
}

struct Args {
    address: SocketAddr,
    command: Command,
    config: Option<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let mut positional = Vec::new();
    let mut config = None;
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().context("--config needs a path")?;
                config = Some(PathBuf::from(path));
            }
            "-h" | "--help" => {
                println!("Usage: peer <address> [host | join <host-address>] [--config <path>]");
                std::process::exit(0);
            }
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let address = positional
        .next()
        .context("missing <address>")?
        .parse()
        .context("invalid <address>")?;
    let command = match positional.next().as_deref() {
        None => Command::Wait,
        Some("host") => Command::Host,
        Some("join") => {
            let host = positional
                .next()
                .context("join needs <host-address>")?
                .parse()
                .context("invalid <host-address>")?;
            Command::Join(host)
        }
        Some(other) => bail!("unknown command {:?}", other),
    };

    Ok(Args {
        address,
        command,
        config,
    })
}

#[cfg(feature = "devices")]
fn devices(config: &AppConfig) -> Result<Devices> {
    use lan_media_mesh::audio::{CpalMicrophone, CpalSpeakers};
    use lan_media_mesh::media::synthetic::{LogDisplay, TestPattern};
    use std::sync::Arc;

    let media = &config.media;
    Ok(Devices {
        camera: Some(Box::new(TestPattern::new(media.width, media.height))),
        microphone: Some(Box::new(CpalMicrophone::open(media)?)),
        speakers: Arc::new(CpalSpeakers::new(media)),
        display: Arc::new(LogDisplay::new(u64::from(media.frames_per_second) * 10)),
    })
}

#[cfg(not(feature = "devices"))]
fn devices(config: &AppConfig) -> Result<Devices> {
    Ok(Devices::synthetic(&config.media))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = parse_args()?;
    let mut config = AppConfig::load_or_default(args.config.as_deref())?;
    config.peer.address = args.address;

    tracing::info!(address = %config.peer.address, "Starting media mesh peer");

    let participant = Participant::start(&config, devices(&config)?, Transport::Udp).await?;

    match args.command {
        Command::Wait => tracing::info!("Waiting for a call"),
        Command::Host => participant.host().await?,
        Command::Join(host) => participant
            .join(host)
            .await
            .with_context(|| format!("joining {}", host))?,
    }
    tracing::info!(members = ?participant.members(), "Ready, press Ctrl+C to quit");

    tokio::signal::ctrl_c().await?;

    tracing::info!(
        sent = participant.sender_stats().packets_sent(),
        received = participant.receiver_stats().datagrams(),
        "Shutting down"
    );
    participant.shutdown().await;
    Ok(())
}
