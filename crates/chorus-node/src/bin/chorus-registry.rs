//! Registry binary
//!
//! Accepts peer registrations and runs the operator command loop on stdin.

use std::time::Duration;

use chorus_node::{RegistryCommand, RegistryConfig, RegistryNode};
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

    let config = RegistryConfig::from_env()?.with_args(std::env::args().skip(1))?;
    let registry = RegistryNode::start(config).await?;
    println!("Registry at {}, type 'help' for commands", registry.identity());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                match line? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => {
                        match line.parse::<RegistryCommand>().and_then(|cmd| registry.execute(cmd)) {
                            Ok(output) => println!("{}", output),
                            Err(e) => println!("{}", e),
                        }
                    }
                    None => stdin_open = false,
                }
            }
            _ = registry.stopped() => break,
        }
    }

    // Let queued shutdown frames reach the peers
    tokio::time::sleep(Duration::from_millis(250)).await;
    registry.stop();
    Ok(())
}
