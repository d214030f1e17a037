//! In-memory registry for development and tests.
//!
//! Every mutation takes the next value of a single global revision counter,
//! which becomes the written object's `resource_version`. Instance events are
//! kept in a bounded log so watchers can resume from a recent revision.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use scf_endpoints::Endpoints;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use crate::error::{RegistryError, RegistryResult};
use crate::store::{ControllerInstanceStore, EndpointsStore, InstanceWatch, LeaseStore};
use crate::types::{ControllerInstance, InstanceList, Lease, WatchEvent, WatchEventType};

/// Instance events retained for watch replay.
pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 1024;

const INSTANCE_KIND: &str = "ControllerInstance";
const ENDPOINTS_KIND: &str = "Endpoints";

type Event = WatchEvent<ControllerInstance>;

/// Registry held entirely in process memory.
pub struct MemoryRegistry {
    state: Mutex<State>,
    events: broadcast::Sender<Event>,
    log_capacity: usize,
}

struct State {
    revision: u64,
    instances: BTreeMap<String, ControllerInstance>,
    /// Lease deadlines of instances with a non-zero `lease_duration_ms`.
    instance_expiry: BTreeMap<String, Instant>,
    log: VecDeque<Event>,
    /// Highest revision dropped from the log.
    compacted: u64,
    leases: BTreeMap<(String, String), Instant>,
    endpoints: BTreeMap<(String, String), Endpoints>,
    fail_writes: u32,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::with_log_capacity(DEFAULT_EVENT_LOG_CAPACITY)
    }

    pub fn with_log_capacity(log_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(log_capacity.max(1));
        Self {
            state: Mutex::new(State {
                revision: 0,
                instances: BTreeMap::new(),
                instance_expiry: BTreeMap::new(),
                log: VecDeque::new(),
                compacted: 0,
                leases: BTreeMap::new(),
                endpoints: BTreeMap::new(),
                fail_writes: 0,
            }),
            events,
            log_capacity: log_capacity.max(1),
        }
    }

    /// Make the next `n` writes fail with `Unavailable`.
    ///
    /// Lease renewals and reaping are not affected.
    pub async fn fail_next_writes(&self, n: u32) {
        self.state.lock().await.fail_writes = n;
    }

    /// Injected failures not yet consumed.
    pub async fn pending_write_failures(&self) -> u32 {
        self.state.lock().await.fail_writes
    }

    /// Current global revision.
    pub async fn revision(&self) -> u64 {
        self.state.lock().await.revision
    }

    fn record(&self, state: &mut State, event: Event) {
        state.log.push_back(event.clone());
        while state.log.len() > self.log_capacity {
            if let Some(dropped) = state.log.pop_front() {
                state.compacted = dropped.object.resource_version;
            }
        }
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn arm_instance_lease(&mut self, instance: &ControllerInstance) {
        match instance.lease_duration() {
            Some(ttl) => {
                self.instance_expiry
                    .insert(instance.name.clone(), Instant::now() + ttl);
            }
            None => {
                self.instance_expiry.remove(&instance.name);
            }
        }
    }

    fn check_write(&mut self) -> RegistryResult<()> {
        if self.fail_writes > 0 {
            self.fail_writes -= 1;
            return Err(RegistryError::Unavailable("injected write failure".to_string()));
        }
        Ok(())
    }
}

fn matches_type(filter: Option<&str>, instance: &ControllerInstance) -> bool {
    filter.is_none_or(|t| instance.controller_type == t)
}

#[async_trait]
impl ControllerInstanceStore for MemoryRegistry {
    async fn list_instances(&self, controller_type: Option<&str>) -> RegistryResult<InstanceList> {
        let state = self.state.lock().await;
        let items = state
            .instances
            .values()
            .filter(|i| matches_type(controller_type, i))
            .cloned()
            .collect();
        Ok(InstanceList {
            items,
            resource_version: state.revision,
        })
    }

    async fn get_instance(&self, name: &str) -> RegistryResult<ControllerInstance> {
        self.state
            .lock()
            .await
            .instances
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                kind: INSTANCE_KIND,
                name: name.to_string(),
            })
    }

    async fn create_instance(
        &self,
        mut instance: ControllerInstance,
    ) -> RegistryResult<ControllerInstance> {
        let mut state = self.state.lock().await;
        state.check_write()?;
        if state.instances.contains_key(&instance.name) {
            return Err(RegistryError::AlreadyExists {
                kind: INSTANCE_KIND,
                name: instance.name,
            });
        }

        instance.resource_version = state.next_revision();
        instance.deletion_timestamp = None;
        state.arm_instance_lease(&instance);
        state
            .instances
            .insert(instance.name.clone(), instance.clone());
        debug!(name = %instance.name, resource_version = instance.resource_version, "Created instance");
        self.record(&mut state, WatchEvent::new(WatchEventType::Added, instance.clone()));
        Ok(instance)
    }

    async fn update_instance(
        &self,
        mut instance: ControllerInstance,
    ) -> RegistryResult<ControllerInstance> {
        let mut state = self.state.lock().await;
        state.check_write()?;
        let Some(stored) = state.instances.get(&instance.name) else {
            return Err(RegistryError::NotFound {
                kind: INSTANCE_KIND,
                name: instance.name,
            });
        };
        if stored.controller_type != instance.controller_type {
            return Err(RegistryError::ImmutableField {
                kind: INSTANCE_KIND,
                name: instance.name,
                field: "controller_type",
            });
        }
        if stored.resource_version != instance.resource_version {
            return Err(RegistryError::Conflict {
                kind: INSTANCE_KIND,
                name: instance.name,
                expected: instance.resource_version,
                actual: stored.resource_version,
            });
        }

        instance.resource_version = state.next_revision();
        state.arm_instance_lease(&instance);
        state
            .instances
            .insert(instance.name.clone(), instance.clone());
        self.record(&mut state, WatchEvent::new(WatchEventType::Modified, instance.clone()));
        Ok(instance)
    }

    async fn delete_instance(&self, name: &str) -> RegistryResult<()> {
        let mut state = self.state.lock().await;
        state.check_write()?;
        let Some(mut instance) = state.instances.remove(name) else {
            return Err(RegistryError::NotFound {
                kind: INSTANCE_KIND,
                name: name.to_string(),
            });
        };

        state.instance_expiry.remove(name);
        instance.resource_version = state.next_revision();
        instance.deletion_timestamp = Some(Utc::now());
        debug!(name, resource_version = instance.resource_version, "Deleted instance");
        self.record(&mut state, WatchEvent::new(WatchEventType::Deleted, instance));
        Ok(())
    }

    async fn renew_instance(&self, name: &str) -> RegistryResult<()> {
        let mut state = self.state.lock().await;
        let Some(instance) = state.instances.get(name).cloned() else {
            return Err(RegistryError::NotFound {
                kind: INSTANCE_KIND,
                name: name.to_string(),
            });
        };
        state.arm_instance_lease(&instance);
        Ok(())
    }

    async fn reap_expired_instances(
        &self,
        controller_type: Option<&str>,
    ) -> RegistryResult<Vec<String>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let expired: Vec<String> = state
            .instance_expiry
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(name, _)| name.clone())
            .filter(|name| {
                state
                    .instances
                    .get(name)
                    .is_some_and(|i| matches_type(controller_type, i))
            })
            .collect();

        for name in &expired {
            state.instance_expiry.remove(name);
            let Some(mut instance) = state.instances.remove(name) else {
                continue;
            };
            instance.resource_version = state.next_revision();
            instance.deletion_timestamp = Some(Utc::now());
            warn!(name = %name, resource_version = instance.resource_version, "Reaped expired instance");
            self.record(&mut state, WatchEvent::new(WatchEventType::Deleted, instance));
        }
        Ok(expired)
    }

    async fn watch_instances(
        &self,
        controller_type: Option<&str>,
        since: u64,
    ) -> RegistryResult<InstanceWatch> {
        let state = self.state.lock().await;
        if since < state.compacted {
            return Err(RegistryError::Expired {
                requested: since,
                oldest: state.compacted,
            });
        }

        let filter = controller_type.map(str::to_string);
        let replay: Vec<RegistryResult<Event>> = state
            .log
            .iter()
            .filter(|e| e.object.resource_version > since)
            .filter(|e| matches_type(filter.as_deref(), &e.object))
            .cloned()
            .map(Ok)
            .collect();

        // Subscribed under the lock, so nothing falls between replay and live.
        let live = BroadcastStream::new(self.events.subscribe()).filter_map(move |item| {
            let filter = filter.clone();
            async move {
                match item {
                    Ok(event) if matches_type(filter.as_deref(), &event.object) => Some(Ok(event)),
                    Ok(_) => None,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(skipped, "Instance watcher lagged behind");
                        Some(Err(RegistryError::Expired {
                            requested: since,
                            oldest: since + skipped,
                        }))
                    }
                }
            }
        });

        Ok(stream::iter(replay).chain(live).boxed())
    }
}

#[async_trait]
impl LeaseStore for MemoryRegistry {
    async fn renew_lease(
        &self,
        service_group_id: &str,
        ip: &str,
        ttl: Duration,
    ) -> RegistryResult<()> {
        let mut state = self.state.lock().await;
        state.check_write()?;
        state.leases.insert(
            (service_group_id.to_string(), ip.to_string()),
            Instant::now() + ttl,
        );
        Ok(())
    }

    async fn list_leases(&self) -> RegistryResult<Vec<Lease>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.leases.retain(|_, deadline| *deadline > now);
        Ok(state
            .leases
            .keys()
            .map(|(group, ip)| Lease {
                service_group_id: group.clone(),
                ip: ip.clone(),
            })
            .collect())
    }

    async fn remove_lease(&self, service_group_id: &str, ip: &str) -> RegistryResult<()> {
        let mut state = self.state.lock().await;
        state.check_write()?;
        state
            .leases
            .remove(&(service_group_id.to_string(), ip.to_string()));
        Ok(())
    }
}

#[async_trait]
impl EndpointsStore for MemoryRegistry {
    async fn get_endpoints(&self, namespace: &str, name: &str) -> RegistryResult<Endpoints> {
        self.state
            .lock()
            .await
            .endpoints
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                kind: ENDPOINTS_KIND,
                name: format!("{namespace}/{name}"),
            })
    }

    async fn create_endpoints(&self, mut endpoints: Endpoints) -> RegistryResult<Endpoints> {
        let mut state = self.state.lock().await;
        state.check_write()?;
        let key = (endpoints.namespace.clone(), endpoints.name.clone());
        if state.endpoints.contains_key(&key) {
            return Err(RegistryError::AlreadyExists {
                kind: ENDPOINTS_KIND,
                name: format!("{}/{}", key.0, key.1),
            });
        }
        endpoints.resource_version = state.next_revision();
        state.endpoints.insert(key, endpoints.clone());
        Ok(endpoints)
    }

    async fn update_endpoints(&self, mut endpoints: Endpoints) -> RegistryResult<Endpoints> {
        let mut state = self.state.lock().await;
        state.check_write()?;
        let key = (endpoints.namespace.clone(), endpoints.name.clone());
        let Some(stored) = state.endpoints.get(&key) else {
            return Err(RegistryError::NotFound {
                kind: ENDPOINTS_KIND,
                name: format!("{}/{}", key.0, key.1),
            });
        };
        if stored.resource_version != endpoints.resource_version {
            return Err(RegistryError::Conflict {
                kind: ENDPOINTS_KIND,
                name: format!("{}/{}", key.0, key.1),
                expected: endpoints.resource_version,
                actual: stored.resource_version,
            });
        }
        endpoints.resource_version = state.next_revision();
        state.endpoints.insert(key, endpoints.clone());
        Ok(endpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(name: &str, ty: &str, key: i64) -> ControllerInstance {
        ControllerInstance::new(name, ty, key, false)
    }

    #[tokio::test]
    async fn test_create_assigns_increasing_revisions() {
        let registry = MemoryRegistry::new();
        let a = registry.create_instance(instance("a", "foo", 1)).await.unwrap();
        let b = registry.create_instance(instance("b", "foo", 2)).await.unwrap();
        assert!(b.resource_version > a.resource_version);

        let err = registry
            .create_instance(instance("a", "foo", 3))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_update_is_compare_and_swap() {
        let registry = MemoryRegistry::new();
        let created = registry.create_instance(instance("a", "foo", 1)).await.unwrap();

        let mut first = created.clone();
        first.workload_num = 3;
        let updated = registry.update_instance(first).await.unwrap();
        assert!(updated.resource_version > created.resource_version);

        let mut stale = created;
        stale.is_locked = true;
        let err = registry.update_instance(stale).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_update_rejects_type_change() {
        let registry = MemoryRegistry::new();
        let mut created = registry.create_instance(instance("a", "foo", 1)).await.unwrap();
        created.controller_type = "bar".to_string();
        let err = registry.update_instance(created).await.unwrap_err();
        assert!(matches!(err, RegistryError::ImmutableField { field: "controller_type", .. }));
    }

    #[tokio::test]
    async fn test_list_filters_by_type() {
        let registry = MemoryRegistry::new();
        registry.create_instance(instance("a", "foo", 1)).await.unwrap();
        registry.create_instance(instance("b", "bar", 1)).await.unwrap();

        let foo = registry.list_instances(Some("foo")).await.unwrap();
        assert_eq!(foo.items.len(), 1);
        assert_eq!(foo.resource_version, 2);
        assert_eq!(registry.list_instances(None).await.unwrap().items.len(), 2);
    }

    #[tokio::test]
    async fn test_watch_replays_then_streams_live() {
        let registry = MemoryRegistry::new();
        registry.create_instance(instance("a", "foo", 1)).await.unwrap();
        registry.create_instance(instance("x", "bar", 1)).await.unwrap();

        let mut watch = registry.watch_instances(Some("foo"), 0).await.unwrap();
        let first = watch.next().await.unwrap().unwrap();
        assert_eq!(first.event_type, WatchEventType::Added);
        assert_eq!(first.object.name, "a");

        registry.delete_instance("a").await.unwrap();
        let deleted = watch.next().await.unwrap().unwrap();
        assert_eq!(deleted.event_type, WatchEventType::Deleted);
        assert!(deleted.object.is_deleted());
        assert_eq!(deleted.object.resource_version, 3);
    }

    #[tokio::test]
    async fn test_watch_from_compacted_revision_expires() {
        let registry = MemoryRegistry::with_log_capacity(2);
        for i in 0..4 {
            registry
                .create_instance(instance(&format!("i{i}"), "foo", i))
                .await
                .unwrap();
        }
        let err = match registry.watch_instances(None, 0).await {
            Err(e) => e,
            Ok(_) => panic!("expected expired watch"),
        };
        assert!(err.is_expired());
        assert!(registry.watch_instances(None, 2).await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_write_failures() {
        let registry = MemoryRegistry::new();
        registry.fail_next_writes(1).await;
        let err = registry
            .create_instance(instance("a", "foo", 1))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(registry.create_instance(instance("a", "foo", 1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_instances_are_reaped_as_deletes() {
        let registry = MemoryRegistry::new();
        let short = Duration::from_millis(100);
        registry
            .create_instance(instance("a", "foo", 1).with_lease_duration(short))
            .await
            .unwrap();
        registry
            .create_instance(instance("b", "foo", 2).with_lease_duration(short))
            .await
            .unwrap();
        registry.create_instance(instance("c", "foo", 3)).await.unwrap();
        registry
            .create_instance(instance("x", "bar", 1).with_lease_duration(short))
            .await
            .unwrap();
        let mut watch = registry.watch_instances(Some("foo"), 4).await.unwrap();

        assert!(registry.reap_expired_instances(None).await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(60)).await;
        registry.renew_instance("b").await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let reaped = registry.reap_expired_instances(Some("foo")).await.unwrap();
        assert_eq!(reaped, vec!["a".to_string()]);
        assert!(registry.get_instance("a").await.unwrap_err().is_not_found());
        assert!(registry.get_instance("b").await.is_ok());
        assert!(registry.get_instance("c").await.is_ok());
        assert!(registry.get_instance("x").await.is_ok(), "other types are left alone");

        let event = watch.next().await.unwrap().unwrap();
        assert_eq!(event.event_type, WatchEventType::Deleted);
        assert_eq!(event.object.name, "a");
        assert_eq!(event.object.resource_version, 5);
    }

    #[tokio::test]
    async fn test_renew_unknown_instance_is_not_found() {
        let registry = MemoryRegistry::new();
        assert!(registry.renew_instance("ghost").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_leases_expire() {
        let registry = MemoryRegistry::new();
        registry
            .renew_lease("", "1.2.3.4", Duration::from_millis(30))
            .await
            .unwrap();
        registry
            .renew_lease("", "4.3.2.2", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(registry.list_leases().await.unwrap().len(), 2);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let leases = registry.list_leases().await.unwrap();
        assert_eq!(
            leases,
            vec![Lease {
                service_group_id: String::new(),
                ip: "4.3.2.2".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_endpoints_cas() {
        let registry = MemoryRegistry::new();
        let created = registry
            .create_endpoints(Endpoints::new("default", "kubernetes"))
            .await
            .unwrap();
        assert!(created.resource_version > 0);

        let updated = registry.update_endpoints(created.clone()).await.unwrap();
        assert!(updated.resource_version > created.resource_version);

        let err = registry.update_endpoints(created).await.unwrap_err();
        assert!(err.is_conflict());
    }
}
