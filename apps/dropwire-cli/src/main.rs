//! dropwire command-line entry point.

mod app;
mod config;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use config::Config;

/// dropwire - send a file straight to a waiting peer
#[derive(Parser)]
#[command(name = "dropwire")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for a sender and save the files it sends
    Receive {
        /// Listen address
        #[arg(short, long)]
        listen: Option<SocketAddr>,

        /// Output directory
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Use this token instead of a random one
        #[arg(long)]
        token: Option<String>,

        /// Keep receiving after the first file
        #[arg(long)]
        keep_open: bool,
    },

    /// Send a file to a waiting receiver
    Send {
        /// Receiver address
        addr: SocketAddr,

        /// Token printed by the receiver
        token: String,

        /// File to send
        file: PathBuf,

        /// MIME type announced to the receiver
        #[arg(long)]
        content_type: Option<String>,

        /// Chunk size in bytes
        #[arg(long)]
        chunk_size: Option<usize>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "starting dropwire");

    let mut config = Config::load(cli.config.as_deref())?;

    let rt = tokio::runtime::Runtime::new()?;
    match cli.command {
        Commands::Receive {
            listen,
            out,
            token,
            keep_open,
        } => {
            if let Some(listen) = listen {
                config.receive.listen = listen;
            }
            if let Some(out) = out {
                config.receive.out_dir = out;
            }
            rt.block_on(app::receive(config, token, keep_open))
        }
        Commands::Send {
            addr,
            token,
            file,
            content_type,
            chunk_size,
        } => {
            if let Some(chunk_size) = chunk_size {
                config.transfer.chunk_size = chunk_size;
            }
            rt.block_on(app::send(config, addr, &token, &file, content_type.as_deref()))
        }
    }
}
