//! Controller instance manager.
//!
//! One manager per process keeps the live membership roster of every
//! controller type by listing and then watching the registry's controller
//! instances. Local controller bases read snapshots from it and subscribe to
//! per-type change notifications.
//!
//! # Event handling
//!
//! - Objects carrying a deletion timestamp are treated as deleted.
//! - Adds for a known name are handled as updates.
//! - Updates that are not strictly newer than the stored object are dropped.
//! - A change of `controller_type` on a stored name is fatal.
//! - Updates only notify when `controller_key`, `workload_num` or `is_locked`
//!   changed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, LazyLock, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use scf_reconcile::BackoffPolicy;
use scf_registry::{
    with_timeout, ControllerInstance, ControllerInstanceStore, InstanceWatch, WatchEvent,
    WatchEventType,
};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::error::ManagerError;

/// Snapshot of one controller type's live instances, keyed by name.
pub type InstanceMap = BTreeMap<String, ControllerInstance>;

const NOTIFY_BUFFER: usize = 256;

/// Registry clients that already have a manager in this process.
static ACTIVE_CLIENTS: LazyLock<StdMutex<HashSet<usize>>> =
    LazyLock::new(|| StdMutex::new(HashSet::new()));

fn client_key(client: &Arc<dyn ControllerInstanceStore>) -> usize {
    Arc::as_ptr(client) as *const () as usize
}

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Deadline for each list or watch call.
    pub rpc_timeout: Duration,

    /// Backoff between failed list/watch attempts.
    pub backoff: BackoffPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Default)]
struct Inner {
    by_type: HashMap<String, InstanceMap>,
    type_of: HashMap<String, String>,
    initialized: bool,
    /// Resource version the next watch resumes from.
    resource_version: u64,
}

/// Process-wide membership roster.
pub struct ControllerInstanceManager {
    client: Arc<dyn ControllerInstanceStore>,
    inner: Mutex<Inner>,
    notify: broadcast::Sender<String>,
    config: ManagerConfig,
    key: usize,
}

impl ControllerInstanceManager {
    /// Create the manager for `client` and load the initial roster.
    ///
    /// Fails with `AlreadyRunning` if a manager already exists for the same
    /// client in this process.
    pub async fn start(
        client: Arc<dyn ControllerInstanceStore>,
        config: ManagerConfig,
    ) -> Result<Arc<Self>, ManagerError> {
        let key = client_key(&client);
        {
            let mut active = ACTIVE_CLIENTS.lock().unwrap_or_else(PoisonError::into_inner);
            if !active.insert(key) {
                return Err(ManagerError::AlreadyRunning);
            }
        }

        let (notify, _) = broadcast::channel(NOTIFY_BUFFER);
        let manager = Arc::new(Self {
            client,
            inner: Mutex::new(Inner::default()),
            notify,
            config,
            key,
        });

        manager.resync().await?;
        info!("Controller instance manager started");
        Ok(manager)
    }

    /// Subscribe to per-type change notifications.
    ///
    /// Each message is a controller type whose roster changed. Messages are
    /// hints: receivers re-read [`list_by_type`](Self::list_by_type).
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.notify.subscribe()
    }

    /// Snapshot of the live instances of `controller_type`.
    pub async fn list_by_type(&self, controller_type: &str) -> Result<InstanceMap, ManagerError> {
        if !self.inner.lock().await.initialized {
            self.resync().await?;
        }
        Ok(self
            .inner
            .lock()
            .await
            .by_type
            .get(controller_type)
            .cloned()
            .unwrap_or_default())
    }

    /// Resource version of the last applied event or list.
    pub async fn resource_version(&self) -> u64 {
        self.inner.lock().await.resource_version
    }

    /// Replace the roster with a full list from the registry.
    ///
    /// Returns the resource version to watch from.
    pub async fn resync(&self) -> Result<u64, ManagerError> {
        let list = with_timeout(self.config.rpc_timeout, self.client.list_instances(None)).await?;

        let mut by_type: HashMap<String, InstanceMap> = HashMap::new();
        let mut type_of = HashMap::new();
        for instance in list.items.into_iter().filter(|i| !i.is_deleted()) {
            type_of.insert(instance.name.clone(), instance.controller_type.clone());
            by_type
                .entry(instance.controller_type.clone())
                .or_default()
                .insert(instance.name.clone(), instance);
        }

        let changed: Vec<String> = {
            let mut inner = self.inner.lock().await;
            let mut changed: Vec<String> = by_type
                .iter()
                .filter(|(t, map)| inner.by_type.get(*t) != Some(*map))
                .map(|(t, _)| t.clone())
                .collect();
            changed.extend(
                inner
                    .by_type
                    .keys()
                    .filter(|t| !by_type.contains_key(*t))
                    .cloned(),
            );

            inner.by_type = by_type;
            inner.type_of = type_of;
            inner.initialized = true;
            inner.resource_version = list.resource_version;
            changed
        };

        info!(
            resource_version = list.resource_version,
            changed_types = changed.len(),
            "Controller instance roster resynced"
        );
        for controller_type in changed {
            self.publish(controller_type);
        }
        Ok(list.resource_version)
    }

    /// Apply one watch event to the roster.
    pub async fn apply_event(
        &self,
        event: WatchEvent<ControllerInstance>,
    ) -> Result<(), ManagerError> {
        let WatchEvent { event_type, object } = event;
        let notify = {
            let mut inner = self.inner.lock().await;
            inner.resource_version = inner.resource_version.max(object.resource_version);

            if event_type == WatchEventType::Deleted || object.is_deleted() {
                on_delete(&mut inner, object)
            } else {
                on_upsert(&mut inner, object)?
            }
        };

        if let Some(controller_type) = notify {
            self.publish(controller_type);
        }
        Ok(())
    }

    fn publish(&self, controller_type: String) {
        // No subscribers yet is fine.
        let _ = self.notify.send(controller_type);
    }

    /// Watch the registry and keep the roster current until shutdown.
    ///
    /// Watch disconnects and expired resource versions trigger a relist.
    /// Returns an error only for fatal conditions.
    #[instrument(skip(self, shutdown), name = "instance_manager")]
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ManagerError> {
        let mut since = self.resource_version().await;
        let mut consecutive_failures = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let stream = match with_timeout(
                self.config.rpc_timeout,
                self.client.watch_instances(None, since),
            )
            .await
            {
                Ok(stream) => {
                    consecutive_failures = 0;
                    stream
                }
                Err(e) => {
                    if e.is_expired() {
                        info!(since, "Watch resource version expired, relisting");
                    } else {
                        warn!(error = %e, consecutive_failures, "Failed to open instance watch");
                    }
                    consecutive_failures += 1;
                    if self.backoff(consecutive_failures, &mut shutdown).await {
                        break;
                    }
                    match self.resync().await {
                        Ok(rv) => since = rv,
                        Err(e) => warn!(error = %e, "Relist failed"),
                    }
                    continue;
                }
            };

            match self.consume(stream, &mut shutdown).await? {
                WatchEnd::Shutdown => break,
                WatchEnd::Closed => {
                    debug!("Instance watch closed, reopening");
                    since = self.resource_version().await;
                }
                WatchEnd::Resync => match self.resync().await {
                    Ok(rv) => since = rv,
                    Err(e) => {
                        warn!(error = %e, "Relist failed");
                        consecutive_failures += 1;
                        if self.backoff(consecutive_failures, &mut shutdown).await {
                            break;
                        }
                    }
                },
            }
        }

        info!("Controller instance manager shutting down");
        Ok(())
    }

    async fn consume(
        &self,
        mut stream: InstanceWatch,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<WatchEnd, ManagerError> {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(WatchEnd::Shutdown);
                    }
                }
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        if let Err(e) = self.apply_event(event).await {
                            error!(error = %e, "Fatal instance event");
                            return Err(e);
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Instance watch failed");
                        return Ok(WatchEnd::Resync);
                    }
                    None => return Ok(WatchEnd::Closed),
                }
            }
        }
    }

    /// Sleep for the backoff delay. Returns true if shutdown was requested.
    async fn backoff(&self, attempt: u32, shutdown: &mut watch::Receiver<bool>) -> bool {
        let delay = self.config.backoff.delay(attempt.saturating_sub(1));
        tokio::select! {
            changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
            _ = tokio::time::sleep(delay) => false,
        }
    }
}

impl Drop for ControllerInstanceManager {
    fn drop(&mut self) {
        ACTIVE_CLIENTS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

enum WatchEnd {
    Shutdown,
    Closed,
    Resync,
}

fn on_delete(inner: &mut Inner, object: ControllerInstance) -> Option<String> {
    let controller_type = inner.type_of.remove(&object.name)?;
    let removed = inner
        .by_type
        .get_mut(&controller_type)
        .and_then(|map| map.remove(&object.name));
    if removed.is_some() {
        debug!(name = %object.name, controller_type = %controller_type, "Instance removed");
        Some(controller_type)
    } else {
        None
    }
}

fn on_upsert(
    inner: &mut Inner,
    object: ControllerInstance,
) -> Result<Option<String>, ManagerError> {
    if let Some(known_type) = inner.type_of.get(&object.name) {
        if *known_type != object.controller_type {
            return Err(ManagerError::ImmutableField {
                name: object.name,
                field: "controller_type",
                old: known_type.clone(),
                new: object.controller_type,
            });
        }
    }

    let map = inner
        .by_type
        .entry(object.controller_type.clone())
        .or_default();

    let Some(stored) = map.get(&object.name) else {
        debug!(
            name = %object.name,
            controller_type = %object.controller_type,
            controller_key = object.controller_key,
            resource_version = object.resource_version,
            "Instance added"
        );
        let controller_type = object.controller_type.clone();
        inner
            .type_of
            .insert(object.name.clone(), controller_type.clone());
        map.insert(object.name.clone(), object);
        return Ok(Some(controller_type));
    };

    if object.resource_version <= stored.resource_version {
        debug!(
            name = %object.name,
            incoming = object.resource_version,
            stored = stored.resource_version,
            "Dropping stale instance event"
        );
        return Ok(None);
    }

    let relevant = stored.controller_key != object.controller_key
        || stored.workload_num != object.workload_num
        || stored.is_locked != object.is_locked;
    let controller_type = object.controller_type.clone();
    map.insert(object.name.clone(), object);
    Ok(relevant.then_some(controller_type))
}
