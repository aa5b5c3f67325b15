//! Controller entry point: installs the `tracing` subscriber, loads
//! configuration, assembles the topology, and installs each switch's static
//! pipeline rules. Mirrors `original_source/EdgeMainRyu.py`'s start-up path,
//! minus the Ryu/OpenFlow event loop itself (out of scope, `SPEC_FULL.md`
//! §1) — a real deployment feeds `Controller::on_packet_in`/`on_flow_removed`
//! from its OpenFlow transport.

use edge_controller::Controller;
use std::path::PathBuf;

fn config_path() -> PathBuf {
    std::env::var("EDGE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/edge/config.json"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let path = config_path();
    tracing::info!(path = %path.display(), "loading configuration");
    let controller = Controller::bootstrap(&path)?;

    tracing::info!(switches = controller.switch_count(), "installing static pipeline rules");
    controller.connect_all();

    tracing::info!("controller ready, waiting for shutdown signal");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    Ok(())
}
