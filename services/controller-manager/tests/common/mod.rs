//! Shared harness for controller manager integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use scf_controller_manager::{BaseConfig, ControllerBase, ControllerInstanceManager, ManagerConfig};
use scf_reconcile::BackoffPolicy;
use scf_registry::{ControllerInstanceStore, MemoryRegistry};
use tokio::sync::watch;

pub fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy {
        base: Duration::from_millis(1),
        max: Duration::from_millis(20),
        jitter: 0.0,
    }
}

pub fn base_config() -> BaseConfig {
    BaseConfig {
        rpc_timeout: Duration::from_secs(1),
        drain_poll_interval: Duration::from_millis(10),
        registration_attempts: 3,
        backoff: fast_backoff(),
        instance_lease: Duration::ZERO,
        workload_window: Duration::from_secs(60),
    }
}

pub struct Harness {
    pub registry: Arc<MemoryRegistry>,
    pub cim: Arc<ControllerInstanceManager>,
    pub shutdown_tx: watch::Sender<bool>,
    pub shutdown_rx: watch::Receiver<bool>,
}

impl Harness {
    /// Start an instance manager over a fresh in-memory registry.
    pub async fn start() -> Self {
        Self::with_registry(Arc::new(MemoryRegistry::new())).await
    }

    pub async fn with_registry(registry: Arc<MemoryRegistry>) -> Self {
        let client: Arc<dyn ControllerInstanceStore> = registry.clone();
        let cim = ControllerInstanceManager::start(
            client,
            ManagerConfig {
                rpc_timeout: Duration::from_secs(1),
                backoff: fast_backoff(),
            },
        )
        .await
        .unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(Arc::clone(&cim).run(shutdown_rx.clone()));
        Self {
            registry,
            cim,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn client(&self) -> Arc<dyn ControllerInstanceStore> {
        self.registry.clone()
    }

    pub async fn register(&self, controller_type: &str) -> Arc<ControllerBase> {
        ControllerBase::register(
            controller_type,
            self.client(),
            Arc::clone(&self.cim),
            base_config(),
        )
        .await
        .unwrap()
    }

    /// Wait until the instance manager has seen `name`.
    pub async fn wait_visible(&self, controller_type: &str, name: &str) {
        eventually(|| async {
            self.cim
                .list_by_type(controller_type)
                .await
                .unwrap()
                .contains_key(name)
        })
        .await;
    }
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached in time");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
