//! kote command-line launcher
//!
//! Runs the messenger node: SAM transport, messaging daemon and the local
//! IRC server. Connect any IRC client to the bridge address to use it.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use kote_core::bridge::DEFAULT_BRIDGE_ADDRESS;
use kote_core::sam::DEFAULT_SAM_ADDRESS;
use kote_core::Config;
use tracing_subscriber::EnvFilter;

mod commands;

/// kote - anonymous peer-to-peer messaging over I2P through IRC
#[derive(Parser)]
#[command(name = "kote")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Data directory path
    #[arg(short, long, env = "KOTE_DATADIR", default_value = "~/.config/kote", global = true)]
    data_dir: String,

    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    node: NodeArgs,
}

#[derive(Args, Clone)]
struct NodeArgs {
    /// IRC server listen address
    #[arg(long, env = "KOTE_IRC_ADDRESS", default_value = DEFAULT_BRIDGE_ADDRESS)]
    irc_address: String,

    /// I2P router SAM bridge address
    #[arg(long, env = "KOTE_SAM_ADDRESS", default_value = DEFAULT_SAM_ADDRESS)]
    sam_address: String,

    /// Password IRC clients must send with PASS
    #[arg(long, env = "KOTE_IRC_PASSWORD")]
    irc_password: Option<String>,

    /// Drop connections and requests from unknown addresses
    #[arg(long, env = "KOTE_IGNORE_UNAUTHORIZED")]
    ignore_unauthorized: bool,

    /// SAM session name (random when unset)
    #[arg(long)]
    session_name: Option<String>,

    /// Delay after the first failed delivery, in seconds
    #[arg(long, default_value = "30")]
    initial_backoff: u64,

    /// Upper bound on the retry delay, in seconds
    #[arg(long, default_value = "3600")]
    max_backoff: u64,

    /// Time allowed for a delivery acknowledgment, in seconds
    #[arg(long, default_value = "60")]
    ack_timeout: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node (default)
    Run,

    /// Show the local address and key fingerprint
    Identity,

    /// List contacts and queued messages
    Contacts,
}

impl NodeArgs {
    fn into_config(self, data_dir: &str) -> Config {
        let mut config = Config::new(shellexpand::tilde(data_dir).to_string());
        config.bridge_addr = self.irc_address;
        config.sam_addr = self.sam_address;
        config.bridge_password = self.irc_password;
        config.ignore_unauthorized = self.ignore_unauthorized;
        config.session_name = self.session_name;
        config.delivery.initial_backoff_secs = self.initial_backoff;
        config.delivery.max_backoff_secs = self.max_backoff;
        config.delivery.ack_timeout_secs = self.ack_timeout;
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose when set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = cli.node.into_config(&cli.data_dir);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => commands::run(config).await?,
        Commands::Identity => commands::show_identity(&config)?,
        Commands::Contacts => commands::list_contacts(&config)?,
    }

    Ok(())
}
