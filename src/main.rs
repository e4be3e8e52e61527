use std::env;

use anyhow::Context;
use tracing::{info, warn};

use rover_signal::logging;
use rover_signal::model::media::MediaConstraints;
use rover_signal::{EventKind, Negotiator, NegotiatorConfig, NegotiatorEvent, RelayConfig, RelayServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "relay" => run_relay(args.get(2)).await,
            "peer" => run_peer(args.get(2), args.get(3)).await,
            _ => {
                print_usage();
                Ok(())
            }
        }
    } else {
        print_usage();
        Ok(())
    }
}

async fn run_relay(port: Option<&String>) -> anyhow::Result<()> {
    let mut config = RelayConfig::from_env()?;
    if let Some(port) = port {
        config = config.with_port(port.parse().context("port must be a number")?);
    }
    logging::init(&config.log_level, config.log_format);

    let server = RelayServer::bind(config).await?;
    server.run().await?;
    Ok(())
}

async fn run_peer(url: Option<&String>, mode: Option<&String>) -> anyhow::Result<()> {
    let mut config = NegotiatorConfig::from_env()?;
    if let Some(url) = url {
        config = config.with_server_url(url.as_str());
    }
    logging::init(&config.log_level, config.log_format);

    let mut negotiator = Negotiator::with_str0m(config);
    negotiator.on(EventKind::StateChanged, |event| {
        if let NegotiatorEvent::StateChanged(state) = event {
            info!("Session {}", state);
        }
        Ok(())
    });
    negotiator.on(EventKind::Track, |event| {
        if let NegotiatorEvent::Track(track) = event {
            info!("Receiving {:?} on mid {}", track.kind, track.mid);
        }
        Ok(())
    });
    negotiator.on(EventKind::Error, |event| {
        if let NegotiatorEvent::Error(reason) = event {
            warn!("Session error: {}", reason);
        }
        Ok(())
    });

    negotiator.get_user_media(MediaConstraints::default()).await?;
    negotiator.connect().await?;

    if mode.map(String::as_str) == Some("offer") {
        negotiator.call(None).await?;
    }

    tokio::select! {
        _ = negotiator.run() => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    negotiator.close().await;
    Ok(())
}

fn print_usage() {
    println!("Rover Signal");
    println!("Usage:");
    println!("  cargo run relay [port]          - Start the signaling relay");
    println!("  cargo run peer [url] [offer]    - Start a peer, optionally sending the first offer");
}
