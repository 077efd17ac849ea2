//! plfm-vt Charm Agent
//!
//! Keeps one workload's deployed charm in sync with the control plane.
//!
//! ## Architecture
//!
//! - **Reconciler**: Compares desired and deployed charm, drives deploys
//! - **Deployer**: Stages charms in scratch space and swaps them in atomically
//! - **Status**: Reports coarse workload status back to the control plane

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use plfm_charm_agent::charm::HttpDownloader;
use plfm_charm_agent::config::Config;
use plfm_charm_agent::{
    CancelHandle, CharmDeployer, CharmReconciler, ControlPlaneClient, LocalStateStore,
    StatusPublisher,
};

/// Upper bound on waiting for an in-flight tick after shutdown was requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        workload_id = %config.workload_id,
        control_plane_url = %config.control_plane_url,
        data_dir = %config.data_dir.display(),
        "Starting plfm-vt charm agent"
    );

    let control_plane = Arc::new(ControlPlaneClient::new(&config)?);
    let downloader = Arc::new(HttpDownloader::new(config.downloader_config())?);
    let deployer = CharmDeployer::new(
        config.deployer_config(),
        downloader,
        format!("{}/{}", config.workload_id, std::process::id()),
    );

    let (cancel_handle, cancel) = CancelHandle::new();
    let reconciler = CharmReconciler::new(
        config.workload_id.clone(),
        control_plane.clone(),
        deployer,
        LocalStateStore::new(config.state_path()),
        StatusPublisher::new(control_plane),
        cancel,
        config.reconciler_config(),
    );

    let mut reconciler_handle = tokio::spawn(async move {
        reconciler.run().await;
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut reconciler_handle => {
            if let Err(e) = result {
                error!(error = %e, "Reconciler task panicked");
            }
            return Ok(());
        }
    }

    cancel_handle.cancel();

    info!("Waiting for reconciler to shut down...");
    match tokio::time::timeout(SHUTDOWN_GRACE, reconciler_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Reconciler task panicked"),
        Err(_) => warn!("Reconciler did not stop within the grace period"),
    }

    info!("Charm agent shutdown complete");
    Ok(())
}
