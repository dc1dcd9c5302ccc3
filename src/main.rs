use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use haven::{Node, Settings};

#[derive(Parser, Debug)]
#[command(name = "haven")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Transport listening port (0 picks one at random).
    #[arg(short, long, default_value_t = 0)]
    port: u16,

    /// Handshake a local seed node on this port at startup.
    #[arg(short, long)]
    seed_port: Option<u16>,

    /// Base directory for blobs and key material.
    #[arg(short, long, default_value = ".")]
    data_dir: PathBuf,

    /// Enable the interactive debug shell collaborator.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings {
        port: args.port,
        seed_port: args.seed_port,
        data_dir: args.data_dir,
        debug: args.debug,
        ..Settings::default()
    };

    let node = Node::start(settings).await?;
    info!("node id: {}", node.node_id());
    info!(
        "identity key: {}",
        hex::encode(node.identity_public_key())
    );

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal, exiting gracefully");
    node.shutdown().await;

    Ok(())
}
