//! SCF API server endpoint reconciler
//!
//! Publishes this API server in the bootstrap endpoints for as long as it
//! runs, and withdraws it on shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use scf_apiserver::config::Config;
use scf_apiserver::{LeaseEndpointReconciler, ReconcilerConfig};
use scf_registry::{MemoryRegistry, PgRegistry, Registry};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        advertise_ip = %config.advertise_ip,
        service_group_id = %config.service_group_id,
        service_port = config.service_port,
        endpoints = %format!("{}/{}", config.endpoints_namespace, config.endpoints_name),
        "Starting endpoint reconciler"
    );

    let registry: Arc<dyn Registry> = if config.dev_registry {
        warn!("Using in-memory registry; endpoints are local to this process");
        Arc::new(MemoryRegistry::new())
    } else {
        Arc::new(
            PgRegistry::connect(&config.db)
                .await
                .context("failed to connect to registry database")?,
        )
    };

    let reconciler = Arc::new(LeaseEndpointReconciler::new(
        registry,
        ReconcilerConfig {
            service_group_id: config.service_group_id.clone(),
            ip: config.advertise_ip.to_string(),
            ports: config.ports(),
            lease_duration: config.lease_duration,
            reconcile_ports: config.reconcile_ports,
            namespace: config.endpoints_namespace.clone(),
            name: config.endpoints_name.clone(),
            rpc_timeout: config.rpc_timeout,
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handle = tokio::spawn(reconciler.run(config.reconcile_interval, shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut handle => {
            if let Err(e) = result {
                error!(error = %e, "Endpoint reconciler task panicked");
                return Err(e.into());
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if !handle.is_finished() {
        // Teardown removes our lease and endpoints once.
        if tokio::time::timeout(Duration::from_secs(10), handle).await.is_err() {
            warn!("Endpoint reconciler did not stop in time");
        }
    }

    info!("Endpoint reconciler shutdown complete");
    Ok(())
}
