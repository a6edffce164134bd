//! Peer binary
//!
//! Registers with the registry and serves overlay traffic until told to stop.

use chorus_node::{PeerCommand, PeerConfig, PeerNode};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chorus=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = PeerConfig::from_env()?.with_args(std::env::args().skip(1))?;
    let peer = PeerNode::start(config).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                match line? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => match line.parse::<PeerCommand>() {
                        Ok(cmd) => println!("{}", peer.execute(cmd)),
                        Err(e) => println!("{}", e),
                    },
                    // Detached peers keep serving
                    None => stdin_open = false,
                }
            }
            _ = peer.stopped() => break,
        }
    }

    tracing::info!("Peer stopped");
    Ok(())
}
