//! cemgrd - Carrier Ethernet Service Manager Daemon
//!
//! Entry point for the cemgrd daemon.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use cemgrd::{
    load_port_vlans, CeManager, ConnectPoint, LoggingPacketNode, NullTransport, StaticTopology,
    VlanId,
};

/// Initializes tracing/logging subsystem
fn init_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

fn load_config(path: &Path) -> anyhow::Result<BTreeMap<ConnectPoint, VlanId>> {
    load_port_vlans(path).with_context(|| format!("reading {}", path.display()))
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    info!("--- Starting cemgrd ---");

    // Topology and drivers are wired statically until a controller
    // adapter provides live views.
    let topo = Arc::new(StaticTopology::new());
    let manager = CeManager::new(topo, Arc::new(LoggingPacketNode), Arc::new(NullTransport));

    if let Some(path) = std::env::args().nth(1).map(PathBuf::from) {
        match load_config(&path) {
            Ok(entries) => {
                info!(path = %path.display(), entries = entries.len(), "loaded port VLAN config");
                manager.load_port_vlans(entries);
            }
            Err(err) => {
                error!(%err, "failed to load port VLAN config");
                return ExitCode::FAILURE;
            }
        }
    }

    match manager.populate_from_topology() {
        Ok(added) => info!(added, "cemgrd initialization complete"),
        Err(err) => {
            error!(%err, "interface registration failed");
            return ExitCode::FAILURE;
        }
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "signal handling failed");
        return ExitCode::FAILURE;
    }
    info!("cemgrd shutting down");
    ExitCode::SUCCESS
}
