//! SCF Controller Manager
//!
//! Registers one sharded instance per configured controller type and keeps
//! it in step with its peers until shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use scf_controller_manager::config::Config;
use scf_controller_manager::controller::RequeueOnError;
use scf_controller_manager::{
    BaseConfig, ControllerBase, ControllerInstanceManager, ControllerRunner, ManagerConfig,
    Reconciler, RunnerConfig,
};
use scf_id::{workload_key, Uuid};
use scf_reconcile::ReconcileResult;
use scf_registry::{ControllerInstanceStore, MemoryRegistry, PgRegistry};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Placeholder business logic: logs every object it is handed.
struct LoggingReconciler {
    controller_type: String,
}

#[async_trait]
impl Reconciler for LoggingReconciler {
    type Item = Uuid;

    fn controller_type(&self) -> &str {
        &self.controller_type
    }

    fn workload_key(&self, item: &Uuid) -> i64 {
        workload_key(item)
    }

    async fn reconcile(&self, item: &Uuid) -> ReconcileResult<()> {
        debug!(controller_type = %self.controller_type, uid = %item, "Reconciled");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        controller_types = ?config.controller_types,
        worker_count = config.worker_count,
        max_retries = config.max_retries,
        dev_registry = config.dev_registry,
        "Starting controller manager"
    );

    let registry: Arc<dyn ControllerInstanceStore> = if config.dev_registry {
        warn!("Using in-memory registry; membership is local to this process");
        Arc::new(MemoryRegistry::new())
    } else {
        Arc::new(
            PgRegistry::connect(&config.db)
                .await
                .context("failed to connect to registry database")?,
        )
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let cim = ControllerInstanceManager::start(
        Arc::clone(&registry),
        ManagerConfig {
            rpc_timeout: config.rpc_timeout,
            ..ManagerConfig::default()
        },
    )
    .await
    .context("failed to start controller instance manager")?;

    let mut cim_handle = tokio::spawn(Arc::clone(&cim).run(shutdown_rx.clone()));

    let mut controllers = JoinSet::new();
    for controller_type in &config.controller_types {
        let base = ControllerBase::register(
            controller_type.clone(),
            Arc::clone(&registry),
            Arc::clone(&cim),
            BaseConfig {
                rpc_timeout: config.rpc_timeout,
                drain_poll_interval: config.drain_poll_interval,
                instance_lease: config.instance_lease,
                ..BaseConfig::default()
            },
        )
        .await
        .with_context(|| format!("failed to register controller '{controller_type}'"))?;

        let runner = ControllerRunner::new(
            base,
            LoggingReconciler {
                controller_type: controller_type.clone(),
            },
            RunnerConfig {
                worker_count: config.worker_count,
                item_timeout: config.item_timeout,
                out_of_range: config.out_of_range,
                drain_poll_interval: config.drain_poll_interval,
                health_report_interval: config.health_report_interval,
                ..RunnerConfig::default()
            },
        )
        .with_error_handler(RequeueOnError {
            max_retries: config.max_retries,
        });
        controllers.spawn(runner.run(shutdown_rx.clone()));
    }

    let mut fatal = None;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut cim_handle => {
            match result {
                Ok(Ok(())) => info!("Instance manager exited"),
                Ok(Err(e)) => {
                    error!(error = %e, "Instance manager failed");
                    fatal = Some(anyhow::Error::new(e));
                }
                Err(e) => {
                    error!(error = %e, "Instance manager task panicked");
                    fatal = Some(anyhow::Error::new(e));
                }
            }
        }
        Some(result) = controllers.join_next() => {
            match result {
                Ok(Ok(())) => info!("Controller exited"),
                Ok(Err(e)) => {
                    error!(error = %e, "Controller failed");
                    fatal = Some(anyhow::Error::new(e));
                }
                Err(e) => {
                    error!(error = %e, "Controller task panicked");
                    fatal = Some(anyhow::Error::new(e));
                }
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for controllers to shut down...");
    let joined = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        while let Some(result) = controllers.join_next().await {
            if let Ok(Err(e)) = result {
                warn!(error = %e, "Controller stopped with error");
            }
        }
    })
    .await;
    if joined.is_err() {
        warn!("Controllers did not stop in time");
        controllers.abort_all();
    }
    if !cim_handle.is_finished() {
        let _ = tokio::time::timeout(Duration::from_secs(2), &mut cim_handle).await;
    }

    info!("Controller manager shutdown complete");
    match fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
