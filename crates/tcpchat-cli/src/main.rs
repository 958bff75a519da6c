mod chat;
mod common;
mod connect;
mod events;
mod listen;

use clap::{Parser, Subcommand};
use common::parse_target;
use std::net::IpAddr;
use std::time::Instant;
use tcpchat_transport::{ChatNode, TransportConfig, DEFAULT_BASE_PORT};

#[derive(Parser)]
#[command(name = "tcpchat", about = "Peer-to-peer chat over plain TCP")]
struct Cli {
    /// Display name sent to peers.
    #[arg(short, long, default_value = "User")]
    name: String,

    /// Local address to listen on. Discovered from the network interfaces
    /// when omitted.
    #[arg(long)]
    bind: Option<IpAddr>,

    /// First port tried when listening; the next free one is used.
    #[arg(long, default_value_t = DEFAULT_BASE_PORT)]
    port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept inbound chats.
    Listen,

    /// Open a chat with a listening peer.
    Connect {
        /// Peer endpoint, IP:PORT.
        #[arg(long)]
        addr: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let start = Instant::now();

    let mut config = TransportConfig::new().base_port(cli.port);
    if let Some(addr) = cli.bind {
        config = config.bind_address(addr);
    }
    let node = ChatNode::new(config);

    eprintln!("tcpchat v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();

    match cli.command {
        Command::Listen => {
            listen::run(node, &cli.name, start).await?;
        }

        Command::Connect { addr } => {
            let target = parse_target(&addr)?;
            connect::run(node, &cli.name, target, start).await?;
        }
    }

    Ok(())
}
