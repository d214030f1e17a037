//! End-to-end membership and hand-off scenarios on the in-memory registry.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{base_config, eventually, fast_backoff, Harness};
use scf_controller_manager::controller::{run_health_loop, WorkAdmission};
use scf_controller_manager::{
    BaseConfig, ControllerBase, ControllerError, ControllerInstanceManager, ControllerState,
    ManagerConfig,
};
use scf_partition::{KeyRange, KEY_MAX};
use scf_registry::{
    ControllerInstance, ControllerInstanceStore, InstanceList, InstanceWatch, MemoryRegistry,
    RegistryError, RegistryResult, WatchEvent, WatchEventType,
};
use tokio::task::JoinHandle;

const HALF: i64 = (1 << 62) - 1;

#[tokio::test]
async fn test_solo_start_owns_full_range() {
    let harness = Harness::start().await;
    let base = harness.register("foo").await;

    assert_eq!(base.state(), ControllerState::Active);
    assert_eq!(base.key_range(), KeyRange::FULL);
    assert!(base.is_in_range(0));
    assert!(base.is_in_range(KEY_MAX));
    assert!(!base.is_in_range(-1));

    let record = harness.registry.get_instance(base.name()).await.unwrap();
    assert_eq!(record.controller_key, KEY_MAX);
    assert_eq!(record.controller_type, "foo");
    assert!(!record.is_locked);
    assert!(base.name().starts_with("foo-"));
}

#[tokio::test]
async fn test_join_drains_then_unlocks_joiner() {
    let harness = Harness::start().await;
    let a = harness.register("foo").await;
    tokio::spawn(Arc::clone(&a).run(harness.shutdown_rx.clone()));
    harness.wait_visible("foo", a.name()).await;

    let guard = match a.begin_work_item(KEY_MAX) {
        WorkAdmission::Admitted(guard) => guard,
        other => panic!("expected admission, got {other:?}"),
    };

    let b = harness.register("foo").await;
    assert_eq!(b.state(), ControllerState::Locked);
    assert_eq!(b.key_range(), KeyRange::new(0, HALF));
    let record = harness.registry.get_instance(b.name()).await.unwrap();
    assert_eq!(record.controller_key, HALF);
    assert!(record.is_locked);
    tokio::spawn(Arc::clone(&b).run(harness.shutdown_rx.clone()));

    eventually(|| async { a.state() == ControllerState::Wait }).await;
    assert_eq!(a.key_range(), KeyRange::new(HALF, KEY_MAX));
    assert!(matches!(a.begin_work_item(KEY_MAX), WorkAdmission::NotActive));
    assert!(a.is_in_range(KEY_MAX));
    assert!(!a.is_in_range(5));

    // Still draining: the joiner must stay locked.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(a.state(), ControllerState::Wait);
    assert_eq!(b.state(), ControllerState::Locked);
    assert_eq!(a.is_done_processing_current_workloads(), (false, 1));

    drop(guard);

    eventually(|| async {
        a.state() == ControllerState::Active && b.state() == ControllerState::Active
    })
    .await;
    eventually(|| async {
        !harness.registry.get_instance(b.name()).await.unwrap().is_locked
    })
    .await;
    assert!(b.is_in_range(5));
    assert!(!b.is_in_range(KEY_MAX));
    assert!(matches!(a.begin_work_item(5), WorkAdmission::OutOfRange));
}

#[tokio::test]
async fn test_third_joiner_splits_largest_range() {
    let registry = Arc::new(MemoryRegistry::new());
    registry
        .create_instance(ControllerInstance::new("foo-x", "foo", 10_000, false))
        .await
        .unwrap();
    registry
        .create_instance(ControllerInstance::new("foo-y", "foo", KEY_MAX, false))
        .await
        .unwrap();
    let harness = Harness::with_registry(registry).await;

    let joiner = harness.register("foo").await;
    let expected = 10_000 + (KEY_MAX - 10_000 + 1) / 2;

    let record = harness.registry.get_instance(joiner.name()).await.unwrap();
    assert_eq!(record.controller_key, expected);
    assert!(record.is_locked);
    assert_eq!(joiner.key_range(), KeyRange::new(10_000, expected));
    let (roster, position) = joiner.roster();
    assert_eq!(roster.len(), 3);
    assert_eq!(position, Some(1));
}

type Running = (Arc<ControllerBase>, JoinHandle<Result<(), ControllerError>>);

/// Two running instances after a completed join: `(left, right)`.
async fn joined_pair(harness: &Harness) -> (Running, Running) {
    let right = harness.register("foo").await;
    let right_task = tokio::spawn(Arc::clone(&right).run(harness.shutdown_rx.clone()));
    harness.wait_visible("foo", right.name()).await;

    let left = harness.register("foo").await;
    let left_task = tokio::spawn(Arc::clone(&left).run(harness.shutdown_rx.clone()));
    eventually(|| async {
        left.state() == ControllerState::Active && right.state() == ControllerState::Active
    })
    .await;
    ((left, left_task), (right, right_task))
}

fn record_states(base: &ControllerBase) -> Arc<Mutex<Vec<ControllerState>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut rx = base.subscribe_state();
    let sink = Arc::clone(&seen);
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let state = *rx.borrow_and_update();
            sink.lock().unwrap().push(state);
        }
    });
    seen
}

#[tokio::test]
async fn test_rightmost_death_pins_predecessor_without_wait() {
    let harness = Harness::start().await;
    let ((left, _left_task), (right, right_task)) = joined_pair(&harness).await;
    let states = record_states(&left);
    let mut bounds = left.subscribe_filter_bounds();

    right_task.abort();
    harness.registry.delete_instance(right.name()).await.unwrap();

    eventually(|| async { left.key_range() == KeyRange::FULL }).await;
    eventually(|| async {
        harness.registry.get_instance(left.name()).await.unwrap().controller_key == KEY_MAX
    })
    .await;
    assert_eq!(left.state(), ControllerState::Active);
    assert!(!states.lock().unwrap().contains(&ControllerState::Wait));

    let bound = bounds.recv().await.unwrap();
    assert_eq!(bound.owner_name, left.name());
    assert_eq!(bound.range(), KeyRange::FULL);
    assert_eq!(left.watch_filter_bound().borrow().clone(), Some(bound));
}

#[tokio::test]
async fn test_leftmost_death_extends_lower_bound() {
    let harness = Harness::start().await;
    let ((left, left_task), (right, _right_task)) = joined_pair(&harness).await;
    let states = record_states(&right);

    left_task.abort();
    harness.registry.delete_instance(left.name()).await.unwrap();

    eventually(|| async { right.key_range() == KeyRange::FULL }).await;
    assert_eq!(right.state(), ControllerState::Active);
    assert!(right.is_in_range(0));
    assert!(!states.lock().unwrap().contains(&ControllerState::Wait));
}

#[tokio::test]
async fn test_lost_membership_is_fatal() {
    let harness = Harness::start().await;
    let base = harness.register("foo").await;
    let task = tokio::spawn(Arc::clone(&base).run(harness.shutdown_rx.clone()));
    harness.wait_visible("foo", base.name()).await;
    // Let the supervisor observe its own record first.
    tokio::time::sleep(Duration::from_millis(100)).await;

    harness.registry.delete_instance(base.name()).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(ControllerError::LostMembership { .. })));
    assert_eq!(base.state(), ControllerState::Error);
    assert!(!base.is_in_range(0));
    assert!(base.wait_until_active().await.is_err());
}

#[tokio::test]
async fn test_types_are_partitioned_independently() {
    let harness = Harness::start().await;
    let foo = harness.register("foo").await;
    tokio::spawn(Arc::clone(&foo).run(harness.shutdown_rx.clone()));
    harness.wait_visible("foo", foo.name()).await;

    let bar = harness.register("bar").await;
    assert_eq!(bar.state(), ControllerState::Active);
    assert_eq!(bar.key_range(), KeyRange::FULL);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(foo.state(), ControllerState::Active);
    assert_eq!(foo.key_range(), KeyRange::FULL);
}

#[tokio::test]
async fn test_registration_retries_transient_failures() {
    let harness = Harness::start().await;
    harness.registry.fail_next_writes(2).await;

    let base = harness.register("foo").await;
    assert_eq!(base.state(), ControllerState::Active);
    assert!(harness.registry.get_instance(base.name()).await.is_ok());
}

#[tokio::test]
async fn test_deregister_removes_instance() {
    let harness = Harness::start().await;
    let base = harness.register("foo").await;

    base.deregister().await.unwrap();
    assert!(harness
        .registry
        .get_instance(base.name())
        .await
        .unwrap_err()
        .is_not_found());
    // Second call is a no-op.
    base.deregister().await.unwrap();
}

#[tokio::test]
async fn test_report_health_writes_workload_num() {
    let harness = Harness::start().await;
    let base = harness.register("foo").await;
    tokio::spawn(Arc::clone(&base).run(harness.shutdown_rx.clone()));
    harness.wait_visible("foo", base.name()).await;

    base.track_workload(1);
    base.track_workload(2);
    base.track_workload(2);
    assert_eq!(base.workload_num(), 2);

    assert!(base.report_health().await.unwrap());
    let record = harness.registry.get_instance(base.name()).await.unwrap();
    assert_eq!(record.workload_num, 2);

    // Unchanged once the manager has caught up.
    eventually(|| async {
        harness.cim.list_by_type("foo").await.unwrap()[base.name()].workload_num == 2
    })
    .await;
    assert!(!base.report_health().await.unwrap());
}

/// Applies every create but reports the first `lost` of them as failed.
struct LostCreateResponses {
    inner: Arc<MemoryRegistry>,
    lost: AtomicU32,
    fail_reads: bool,
}

impl LostCreateResponses {
    fn new(inner: Arc<MemoryRegistry>, lost: u32) -> Self {
        Self {
            inner,
            lost: AtomicU32::new(lost),
            fail_reads: false,
        }
    }
}

#[async_trait]
impl ControllerInstanceStore for LostCreateResponses {
    async fn list_instances(&self, controller_type: Option<&str>) -> RegistryResult<InstanceList> {
        self.inner.list_instances(controller_type).await
    }

    async fn get_instance(&self, name: &str) -> RegistryResult<ControllerInstance> {
        if self.fail_reads {
            return Err(RegistryError::Unavailable("read failed".to_string()));
        }
        self.inner.get_instance(name).await
    }

    async fn create_instance(
        &self,
        instance: ControllerInstance,
    ) -> RegistryResult<ControllerInstance> {
        let created = self.inner.create_instance(instance).await?;
        let lost = self
            .lost
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            return Err(RegistryError::Unavailable("response lost".to_string()));
        }
        Ok(created)
    }

    async fn update_instance(
        &self,
        instance: ControllerInstance,
    ) -> RegistryResult<ControllerInstance> {
        self.inner.update_instance(instance).await
    }

    async fn delete_instance(&self, name: &str) -> RegistryResult<()> {
        self.inner.delete_instance(name).await
    }

    async fn renew_instance(&self, name: &str) -> RegistryResult<()> {
        self.inner.renew_instance(name).await
    }

    async fn reap_expired_instances(
        &self,
        controller_type: Option<&str>,
    ) -> RegistryResult<Vec<String>> {
        self.inner.reap_expired_instances(controller_type).await
    }

    async fn watch_instances(
        &self,
        controller_type: Option<&str>,
        since: u64,
    ) -> RegistryResult<InstanceWatch> {
        self.inner.watch_instances(controller_type, since).await
    }
}

#[tokio::test]
async fn test_registration_adopts_create_with_lost_response() {
    let harness = Harness::start().await;
    let store = Arc::new(LostCreateResponses::new(harness.registry.clone(), 1));

    let base = ControllerBase::register("foo", store, Arc::clone(&harness.cim), base_config())
        .await
        .unwrap();

    assert_eq!(base.state(), ControllerState::Active);
    assert_eq!(base.key_range(), KeyRange::FULL);
    let records = harness.registry.list_instances(Some("foo")).await.unwrap();
    assert_eq!(records.items.len(), 1);
    assert_eq!(records.items[0].name, base.name());
}

#[tokio::test]
async fn test_failed_registration_leaves_no_record() {
    let harness = Harness::start().await;
    let store = Arc::new(LostCreateResponses {
        fail_reads: true,
        ..LostCreateResponses::new(harness.registry.clone(), u32::MAX)
    });

    let result =
        ControllerBase::register("foo", store, Arc::clone(&harness.cim), base_config()).await;

    assert!(matches!(result, Err(ControllerError::Registration { .. })));
    let records = harness.registry.list_instances(Some("foo")).await.unwrap();
    assert!(records.items.is_empty());
}

#[tokio::test]
async fn test_crashed_instance_is_reaped_and_absorbed() {
    let harness = Harness::start().await;
    let lease = Duration::from_millis(300);
    let config = BaseConfig {
        instance_lease: lease,
        ..base_config()
    };
    let health_interval = Duration::from_millis(50);

    let right = ControllerBase::register(
        "foo",
        harness.client(),
        Arc::clone(&harness.cim),
        config.clone(),
    )
    .await
    .unwrap();
    let right_run = tokio::spawn(Arc::clone(&right).run(harness.shutdown_rx.clone()));
    let right_health = tokio::spawn(run_health_loop(
        Arc::clone(&right),
        health_interval,
        harness.shutdown_rx.clone(),
    ));
    harness.wait_visible("foo", right.name()).await;

    let left = ControllerBase::register("foo", harness.client(), Arc::clone(&harness.cim), config)
        .await
        .unwrap();
    tokio::spawn(Arc::clone(&left).run(harness.shutdown_rx.clone()));
    tokio::spawn(run_health_loop(
        Arc::clone(&left),
        health_interval,
        harness.shutdown_rx.clone(),
    ));
    eventually(|| async {
        left.state() == ControllerState::Active && right.state() == ControllerState::Active
    })
    .await;

    // Renewed instances outlive their lease.
    tokio::time::sleep(lease * 2).await;
    assert!(harness.registry.get_instance(right.name()).await.is_ok());
    assert!(harness.registry.get_instance(left.name()).await.is_ok());

    // Crash without deregistering.
    right_run.abort();
    right_health.abort();

    eventually(|| async { left.key_range() == KeyRange::FULL }).await;
    assert_eq!(left.state(), ControllerState::Active);
    assert!(harness
        .registry
        .get_instance(right.name())
        .await
        .unwrap_err()
        .is_not_found());
    eventually(|| async {
        harness.registry.get_instance(left.name()).await.unwrap().controller_key == KEY_MAX
    })
    .await;
}

#[tokio::test]
async fn test_failed_unlock_is_retried() {
    let harness = Harness::start().await;
    let a = harness.register("foo").await;
    tokio::spawn(Arc::clone(&a).run(harness.shutdown_rx.clone()));
    harness.wait_visible("foo", a.name()).await;
    let guard = match a.begin_work_item(KEY_MAX) {
        WorkAdmission::Admitted(guard) => guard,
        other => panic!("expected admission, got {other:?}"),
    };

    let b = harness.register("foo").await;
    tokio::spawn(Arc::clone(&b).run(harness.shutdown_rx.clone()));
    eventually(|| async { a.state() == ControllerState::Wait }).await;

    // The unlock of `b` is the next registry write.
    harness.registry.fail_next_writes(1).await;
    drop(guard);

    eventually(|| async {
        a.state() == ControllerState::Active && b.state() == ControllerState::Active
    })
    .await;
    assert_eq!(harness.registry.pending_write_failures().await, 0);
    assert!(!harness.registry.get_instance(b.name()).await.unwrap().is_locked);
}

#[tokio::test]
async fn test_health_report_conflict_is_skipped() {
    let registry = Arc::new(MemoryRegistry::new());
    let client: Arc<dyn ControllerInstanceStore> = registry.clone();
    // Not running: the manager only learns what the test feeds it.
    let cim = ControllerInstanceManager::start(
        Arc::clone(&client),
        ManagerConfig {
            rpc_timeout: Duration::from_secs(1),
            backoff: fast_backoff(),
        },
    )
    .await
    .unwrap();
    let base = ControllerBase::register("foo", client, Arc::clone(&cim), base_config())
        .await
        .unwrap();

    let record = registry.get_instance(base.name()).await.unwrap();
    cim.apply_event(WatchEvent::new(WatchEventType::Added, record.clone()))
        .await
        .unwrap();
    let mut concurrent = record;
    concurrent.workload_num = 9;
    registry.update_instance(concurrent).await.unwrap();

    base.track_workload(1);
    assert!(!base.report_health().await.unwrap());
    assert_eq!(
        registry.get_instance(base.name()).await.unwrap().workload_num,
        9
    );
}

#[tokio::test]
async fn test_workload_num_forgets_stale_workloads() {
    let harness = Harness::start().await;
    let config = BaseConfig {
        workload_window: Duration::from_millis(50),
        ..base_config()
    };
    let base = ControllerBase::register("foo", harness.client(), Arc::clone(&harness.cim), config)
        .await
        .unwrap();

    base.track_workload(1);
    base.track_workload(2);
    assert_eq!(base.workload_num(), 2);

    tokio::time::sleep(Duration::from_millis(100)).await;
    base.track_workload(3);
    assert_eq!(base.workload_num(), 1);
}
