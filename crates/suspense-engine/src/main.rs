//! # SuspenseCore
//!
//! Demo host for the SuspenseCore inventory engine.
//!
//! Runs a server and a predicting client over an in-process link, or with
//! `--console`, reads `inv.*` commands from stdin against a local inventory.
//!
//! Usage: `suspense [config.toml] [--console]`

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

mod sim;

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use suspense_common::{ActorId, ItemId};
use suspense_inventory::{
    InventoryConfig, InventoryManager, ItemDataProvider, ItemDataTable, ValidatedOperation,
    CONFIG_FILE,
};
use suspense_tools::{
    register_inventory_commands, CommandTable, InventoryDebugger, InventorySession,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::sim::Session;

/// Built-in catalogue used when the config names no item file.
const DEFAULT_ITEMS: &str = include_str!("../data/items.ron");

/// Main entry point.
fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("suspense=info".parse()?))
        .init();

    info!("SuspenseCore starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config_path = PathBuf::from(CONFIG_FILE);
    let mut console = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--console" => console = true,
            path => config_path = PathBuf::from(path),
        }
    }

    let config = InventoryConfig::load_from(&config_path);
    let item_data = load_item_data(&config)?;

    if console {
        run_console(&config, item_data)?;
    } else {
        run_session(&config, item_data)?;
    }

    info!("SuspenseCore shutdown complete");
    Ok(())
}

fn load_item_data(config: &InventoryConfig) -> Result<Arc<dyn ItemDataProvider>> {
    let table = match &config.item_data_path {
        Some(path) => ItemDataTable::load_from(path)
            .with_context(|| format!("loading item data from {}", path.display()))?,
        None => ItemDataTable::from_ron_str(DEFAULT_ITEMS).context("parsing built-in item data")?,
    };
    info!("{} item definitions available", table.len());
    Ok(Arc::new(table))
}

/// Scripted client/server exchange, including one request the server refuses.
fn run_session(config: &InventoryConfig, item_data: Arc<dyn ItemDataProvider>) -> Result<()> {
    // Only the server may remove items.
    let gate = |actor: ActorId, op: ValidatedOperation| {
        actor == ActorId::SERVER || op != ValidatedOperation::Remove
    };
    let mut session = Session::new(config, item_data, Box::new(gate))?;
    let inventory = session.inventory();

    session.client_add("rifle_ak", 1, Some(0))?;
    session.client_add("ammo_762", 90, None)?;
    session.client_add("medkit", 3, None)?;
    session.client_add("keycard", 1, None)?;
    let report = session.pump()?;
    info!("Round 1: {:?}", report);

    session
        .server_mut()
        .add_item(inventory, &ItemId::new("vest"), 1)
        .context("server grants a vest")?;
    let report = session.pump()?;
    info!("Round 2: {:?}", report);

    let keycard_slot = session
        .client()
        .inventory(inventory)
        .and_then(|inv| inv.items().iter().find(|i| i.item_id == ItemId::new("keycard")))
        .and_then(|item| item.slot_index)
        .context("keycard not placed")?;
    session.client_remove(keycard_slot, 1)?;
    let report = session.pump()?;
    info!("Round 3: {:?}", report);

    let debugger = InventoryDebugger::new().with_axes();
    if let Some(client) = session.client().inventory(inventory) {
        println!("{}", debugger.render_grid(client));
        println!("{}", debugger.report(client));
    }
    if let Some(replicator) = session.server().replicator(inventory) {
        println!("server replication: {:?}", replicator.stats());
    }

    if session.in_sync() {
        info!("Client and server agree");
    } else {
        for problem in session.divergence() {
            warn!("Divergence: {}", problem);
        }
    }
    Ok(())
}

/// Reads commands from stdin until EOF or `quit`.
fn run_console(config: &InventoryConfig, item_data: Arc<dyn ItemDataProvider>) -> Result<()> {
    let mut manager = InventoryManager::new(config.clone(), item_data);
    let current = manager.create_inventory();
    let mut session = InventorySession::new(manager, current);

    let mut table = CommandTable::new();
    register_inventory_commands(&mut table);

    for line in io::stdin().lock().lines() {
        let line = line?;
        if matches!(line.trim(), "quit" | "exit") {
            break;
        }
        for output in table.execute(&mut session, &line).output {
            println!("{output}");
        }
    }
    Ok(())
}
