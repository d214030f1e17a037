//! Store traits the framework programs against.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use scf_endpoints::Endpoints;

use crate::error::RegistryResult;
use crate::types::{ControllerInstance, InstanceList, Lease, WatchEvent};

/// Stream of instance events, ordered by resource version.
///
/// An `Err(Expired)` item means events were lost; the consumer must relist.
pub type InstanceWatch = BoxStream<'static, RegistryResult<WatchEvent<ControllerInstance>>>;

#[async_trait]
pub trait ControllerInstanceStore: Send + Sync {
    /// List instances, optionally restricted to one controller type.
    async fn list_instances(&self, controller_type: Option<&str>) -> RegistryResult<InstanceList>;

    async fn get_instance(&self, name: &str) -> RegistryResult<ControllerInstance>;

    /// Create a new instance. Fails with `AlreadyExists` if the name is taken.
    async fn create_instance(
        &self,
        instance: ControllerInstance,
    ) -> RegistryResult<ControllerInstance>;

    /// Compare-and-swap update on `resource_version`.
    async fn update_instance(
        &self,
        instance: ControllerInstance,
    ) -> RegistryResult<ControllerInstance>;

    async fn delete_instance(&self, name: &str) -> RegistryResult<()>;

    /// Push the expiry of `name` out by its `lease_duration_ms`.
    ///
    /// Renewal does not produce a new resource version or watch event.
    async fn renew_instance(&self, name: &str) -> RegistryResult<()>;

    /// Delete every instance whose lease has lapsed, each with a `Deleted`
    /// watch event. Returns the reaped names.
    async fn reap_expired_instances(&self, controller_type: Option<&str>)
        -> RegistryResult<Vec<String>>;

    /// Watch events with resource version greater than `since`.
    async fn watch_instances(
        &self,
        controller_type: Option<&str>,
        since: u64,
    ) -> RegistryResult<InstanceWatch>;
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Create or refresh the lease for `(service_group_id, ip)`.
    async fn renew_lease(&self, service_group_id: &str, ip: &str, ttl: Duration)
        -> RegistryResult<()>;

    /// Leases that have not expired, across all service groups.
    async fn list_leases(&self) -> RegistryResult<Vec<Lease>>;

    async fn remove_lease(&self, service_group_id: &str, ip: &str) -> RegistryResult<()>;
}

#[async_trait]
pub trait EndpointsStore: Send + Sync {
    async fn get_endpoints(&self, namespace: &str, name: &str) -> RegistryResult<Endpoints>;

    async fn create_endpoints(&self, endpoints: Endpoints) -> RegistryResult<Endpoints>;

    /// Compare-and-swap update on `resource_version`.
    async fn update_endpoints(&self, endpoints: Endpoints) -> RegistryResult<Endpoints>;
}

/// Everything a control-plane process needs from the registry.
pub trait Registry: ControllerInstanceStore + LeaseStore + EndpointsStore {}

impl<T> Registry for T where T: ControllerInstanceStore + LeaseStore + EndpointsStore {}
