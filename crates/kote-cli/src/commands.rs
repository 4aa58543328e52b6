//! CLI command implementations.

use anyhow::{bail, Context, Result};
use kote_core::{
    bridge::IrcBridge,
    delivery::now_millis,
    identity::format_fingerprint,
    messaging::MessagingDaemon,
    sam::SamTransport,
    storage::Database,
    Config,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

fn open_database(config: &Config) -> Result<Database> {
    let db_config = config.database();
    Database::open(&db_config)
        .with_context(|| format!("Failed to open database {}", db_config.path.display()))
}

/// Run the node until Ctrl+C.
pub async fn run(config: Config) -> Result<()> {
    config.validate().context("Invalid configuration")?;

    let database = open_database(&config)?;
    let transport = Arc::new(SamTransport::new(config.sam()));

    println!("\nConnecting to the I2P router at {}...", config.sam_addr);
    let daemon = MessagingDaemon::start(config.daemon(), transport, database)
        .await
        .context("Failed to start messaging daemon")?;

    let bridge = IrcBridge::bind(config.bridge(), daemon.handle())
        .await
        .context("Failed to start IRC server")?;

    println!("\nYour address: {}", daemon.identity().address());
    println!(
        "Connect an IRC client to {} and join #contacts.",
        config.bridge_addr
    );
    println!("Press Ctrl+C to stop.");

    tokio::select! {
        _ = bridge.run() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
        }
    }

    println!("\n\nShutting down...");
    info!("shutdown requested");
    daemon.shutdown().await.context("Failed to save state")?;

    Ok(())
}

/// Print the stored identity.
pub fn show_identity(config: &Config) -> Result<()> {
    let database = open_database(config)?;
    let Some(identity) = database.load_identity()? else {
        bail!("No identity yet. Run `kote run` once to create one.");
    };

    println!("\nYour kote identity:");
    println!("  Address:     {}", identity.address());
    println!(
        "  Fingerprint: {}",
        format_fingerprint(&identity.identity().fingerprint())
    );
    println!("\nShare your address with contacts who want to message you.");

    Ok(())
}

/// Print contacts and their queued envelopes.
pub fn list_contacts(config: &Config) -> Result<()> {
    let database = open_database(config)?;
    let contacts = database.load_contacts()?;
    if contacts.is_empty() {
        println!("No contacts.");
        return Ok(());
    }

    let mut queued: HashMap<String, usize> = HashMap::new();
    for envelope in database.load_envelopes()? {
        *queued.entry(envelope.target.to_string()).or_default() += 1;
    }

    let now = now_millis() / 1000;
    println!("\nContacts ({}):", contacts.len());
    for contact in contacts {
        let seen = match contact.last_seen {
            Some(at) => format!("{}s ago", (now - at).max(0)),
            None => "never".to_string(),
        };
        println!(
            "  {:<20} {:<17} seen {:<12} queued {}  {}",
            contact.nickname.as_deref().unwrap_or("-"),
            contact.state.as_str(),
            seen,
            queued.get(contact.address.as_str()).copied().unwrap_or(0),
            contact.address
        );
    }

    Ok(())
}
