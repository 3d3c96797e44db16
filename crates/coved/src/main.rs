//! coved — Cove peer-to-peer folder synchronization daemon.

use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use cove_core::config::CovedConfig;
use cove_engine::ChunkerParams;

use coved::{Candidate, Discovery, FolderController};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing — RUST_LOG controls verbosity
    // e.g. RUST_LOG=debug cargo run -p coved
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = CovedConfig::write_default_if_missing()?;
    let config = CovedConfig::load()?;
    tracing::info!(
        config = %config_path.display(),
        folders = config.folders.len(),
        "coved starting"
    );

    let controllers = Arc::new(DashMap::new());
    let (shutdown, _) = broadcast::channel(4);
    let discovery = Discovery::new(controllers.clone(), shutdown.clone());

    for params in &config.folders {
        match FolderController::start(params.clone(), ChunkerParams::default()) {
            Ok(controller) => {
                let folder_id = controller.folder_id();
                controllers.insert(folder_id, controller);
                for endpoint in &params.nodes {
                    discovery.submit(Candidate {
                        folder_id,
                        endpoint: endpoint.clone(),
                        pubkey: None,
                    });
                }
            }
            Err(e) => {
                tracing::error!(
                    path = %params.path.display(),
                    error = %e,
                    "folder failed to start"
                );
            }
        }
    }

    if controllers.is_empty() {
        tracing::warn!("no folders running; edit the config and restart");
    }

    if !config.network.listen.is_empty() {
        let listener = TcpListener::bind(&config.network.listen).await?;
        tracing::info!(addr = %listener.local_addr()?, "listening for peers");
        tokio::spawn(coved::transport::serve(
            listener,
            controllers.clone(),
            shutdown.subscribe(),
        ));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    let _ = shutdown.send(());
    for entry in controllers.iter() {
        entry.value().stop();
    }

    Ok(())
}
