//! Controller base: registration, range tracking, hand-off and work gating.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use scf_id::{instance_name, InstanceId};
use scf_partition::{KeyRange, KEY_MAX};
use scf_reconcile::BackoffPolicy;
use scf_registry::{
    retry_transient, with_timeout, ControllerInstance, ControllerInstanceStore, RegistryResult,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::filter::FilterBound;
use super::lock;
use super::state::{observe, ControllerState, Observation, Roster};
use crate::error::ControllerError;
use crate::instance_manager::ControllerInstanceManager;

const FILTER_BUFFER: usize = 64;

/// Controller base configuration.
#[derive(Debug, Clone)]
pub struct BaseConfig {
    /// Deadline for each registry call.
    pub rpc_timeout: Duration,

    /// How often a draining controller re-checks its in-flight count.
    pub drain_poll_interval: Duration,

    /// Attempts for the initial registration.
    pub registration_attempts: u32,

    /// Backoff between registration attempts.
    pub backoff: BackoffPolicy,

    /// Membership lease. Peers reap the instance if it is not renewed in
    /// time; zero registers without a lease.
    pub instance_lease: Duration,

    /// A workload counts towards `workload_num` for this long after it was
    /// last handled.
    pub workload_window: Duration,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(10),
            drain_poll_interval: Duration::from_millis(100),
            registration_attempts: 5,
            backoff: BackoffPolicy::default(),
            instance_lease: Duration::from_secs(20),
            workload_window: Duration::from_secs(600),
        }
    }
}

/// Whether a dequeued item may be processed now.
#[derive(Debug)]
pub enum WorkAdmission {
    /// In range and active; the guard counts the item as in flight.
    Admitted(InFlightGuard),
    OutOfRange,
    /// Locked, waiting or stopped.
    NotActive,
}

/// Counts one in-flight work item until dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    counter: Arc<Mutex<usize>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut count = lock(&self.counter);
        *count = count.saturating_sub(1);
    }
}

struct Shared {
    state: ControllerState,
    range: KeyRange,
    roster: Roster,
    position: Option<usize>,
    seen_self: bool,
    /// A registry write failed; retry on the next tick.
    needs_resync: bool,
}

/// Follow-up work computed under the state lock and run after releasing it.
#[derive(Default)]
struct Plan {
    filter: Option<FilterBound>,
    pin_key: bool,
    clear_lock: bool,
    unlock_predecessor: Option<String>,
}

/// Per-controller sharding state embedded in every reconciler.
pub struct ControllerBase {
    controller_type: String,
    name: String,
    registry: Arc<dyn ControllerInstanceStore>,
    cim: Arc<ControllerInstanceManager>,
    config: BaseConfig,
    shared: Mutex<Shared>,
    in_flight: Arc<Mutex<usize>>,
    /// Workload key to when it was last handled.
    workloads: Mutex<HashMap<i64, Instant>>,
    state_tx: watch::Sender<ControllerState>,
    filter_tx: broadcast::Sender<FilterBound>,
    latest_filter: watch::Sender<Option<FilterBound>>,
}

impl ControllerBase {
    /// Pick a key from the current roster and register a new instance.
    ///
    /// The first instance of a type takes the whole key space and starts
    /// `Active`. Joiners split the largest range and start `Locked`.
    pub async fn register(
        controller_type: impl Into<String>,
        registry: Arc<dyn ControllerInstanceStore>,
        cim: Arc<ControllerInstanceManager>,
        config: BaseConfig,
    ) -> Result<Arc<Self>, ControllerError> {
        let controller_type = controller_type.into();
        let name = instance_name(&controller_type, &InstanceId::new());

        let peers = cim.list_by_type(&controller_type).await?;
        let roster = Roster::from_instances(peers.values());
        let (controller_key, is_locked) = if roster.is_empty() {
            (KEY_MAX, false)
        } else {
            (roster.split_point()?.key, true)
        };

        let instance = ControllerInstance::new(&name, &controller_type, controller_key, is_locked)
            .with_lease_duration(config.instance_lease);
        let created = match retry_transient(
            &config.backoff,
            config.registration_attempts,
            config.rpc_timeout,
            || create_or_adopt(registry.as_ref(), &instance, config.rpc_timeout),
        )
        .await
        {
            Ok(created) => created,
            Err(source) => {
                // An attempt may have been applied before its response was lost.
                match with_timeout(config.rpc_timeout, registry.delete_instance(&name)).await {
                    Ok(()) => warn!(instance = %name, "Removed partially registered instance"),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        warn!(instance = %name, error = %e, "Failed to remove partial registration")
                    }
                }
                return Err(ControllerError::Registration { name, source });
            }
        };
        let (controller_key, is_locked) = (created.controller_key, created.is_locked);

        let roster = Roster::from_instances(peers.values().chain(std::iter::once(&created)));
        let position = roster.position_of(&name);
        let range = position
            .and_then(|p| roster.range_at(p))
            .unwrap_or(KeyRange::FULL);
        let state = if is_locked {
            ControllerState::Locked
        } else {
            ControllerState::Active
        };

        info!(
            controller_type = %controller_type,
            instance = %name,
            controller_key,
            range = %range,
            state = %state,
            peers = peers.len(),
            "Registered controller instance"
        );

        let (state_tx, _) = watch::channel(state);
        let (filter_tx, _) = broadcast::channel(FILTER_BUFFER);
        let bound = FilterBound::new(&name, range);
        let (latest_filter, _) = watch::channel(Some(bound));

        Ok(Arc::new(Self {
            controller_type,
            name,
            registry,
            cim,
            config,
            shared: Mutex::new(Shared {
                state,
                range,
                roster,
                position,
                seen_self: false,
                needs_resync: false,
            }),
            in_flight: Arc::new(Mutex::new(0)),
            workloads: Mutex::new(HashMap::new()),
            state_tx,
            filter_tx,
            latest_filter,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn controller_type(&self) -> &str {
        &self.controller_type
    }

    pub fn state(&self) -> ControllerState {
        lock(&self.shared).state
    }

    /// The range currently considered ours.
    pub fn key_range(&self) -> KeyRange {
        lock(&self.shared).range
    }

    /// Copy of the local roster and our position in it.
    pub fn roster(&self) -> (Roster, Option<usize>) {
        let shared = lock(&self.shared);
        (shared.roster.clone(), shared.position)
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ControllerState> {
        self.state_tx.subscribe()
    }

    /// Receive a [`FilterBound`] every time our range changes.
    pub fn subscribe_filter_bounds(&self) -> broadcast::Receiver<FilterBound> {
        self.filter_tx.subscribe()
    }

    /// Latest published bound, for informers catching up after a lag.
    pub fn watch_filter_bound(&self) -> watch::Receiver<Option<FilterBound>> {
        self.latest_filter.subscribe()
    }

    /// Whether `key` is inside our range while we own it.
    pub fn is_in_range(&self, key: i64) -> bool {
        let shared = lock(&self.shared);
        key >= 0 && shared.state.owns_range() && shared.range.contains(key)
    }

    /// Gate a dequeued work item on state and range.
    pub fn begin_work_item(&self, key: i64) -> WorkAdmission {
        let shared = lock(&self.shared);
        if shared.state != ControllerState::Active {
            return WorkAdmission::NotActive;
        }
        if key < 0 || !shared.range.contains(key) {
            return WorkAdmission::OutOfRange;
        }
        // Counted under the state lock so a concurrent Active -> Wait
        // transition always sees this item.
        *lock(&self.in_flight) += 1;
        WorkAdmission::Admitted(InFlightGuard {
            counter: Arc::clone(&self.in_flight),
        })
    }

    pub fn add_processing_work_item(&self) {
        *lock(&self.in_flight) += 1;
    }

    pub fn done_processing_work_item(&self) {
        let mut count = lock(&self.in_flight);
        *count = count.saturating_sub(1);
    }

    /// `(true, 0)` once nothing is in flight; otherwise `(false, count)`.
    pub fn is_done_processing_current_workloads(&self) -> (bool, usize) {
        let count = *lock(&self.in_flight);
        (count == 0, count)
    }

    /// Remember a workload key handled by this instance.
    pub fn track_workload(&self, key: i64) {
        lock(&self.workloads).insert(key, Instant::now());
    }

    /// Distinct workloads in range handled within the workload window.
    pub fn workload_num(&self) -> i32 {
        let mut workloads = lock(&self.workloads);
        let window = self.config.workload_window;
        workloads.retain(|_, seen| seen.elapsed() <= window);
        i32::try_from(workloads.len()).unwrap_or(i32::MAX)
    }

    /// Wait until the controller is `Active`.
    ///
    /// Fails if the controller reaches `Error` instead.
    pub async fn wait_until_active(&self) -> Result<(), ControllerError> {
        let mut rx = self.state_tx.subscribe();
        let state = *rx
            .wait_for(|s| matches!(s, ControllerState::Active | ControllerState::Error))
            .await
            .map_err(|_| ControllerError::Stopped("state channel closed".to_string()))?;
        if state == ControllerState::Error {
            return Err(ControllerError::LostMembership {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Consume roster notifications until shutdown or a fatal error.
    #[instrument(
        skip(self, shutdown),
        fields(instance = %self.name, controller_type = %self.controller_type)
    )]
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ControllerError> {
        let mut notifications = self.cim.subscribe();
        self.sync().await?;

        let mut tick = tokio::time::interval(self.config.drain_poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Controller supervisor shutting down");
                        return Ok(());
                    }
                }
                msg = notifications.recv() => match msg {
                    Ok(controller_type) => {
                        if controller_type == self.controller_type {
                            self.sync().await?;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Roster notifications lagged, resyncing");
                        self.sync().await?;
                    }
                    Err(RecvError::Closed) => {
                        return Err(ControllerError::Stopped(
                            "instance manager closed its notification channel".to_string(),
                        ));
                    }
                },
                _ = tick.tick() => self.on_tick().await?,
            }
        }
    }

    async fn on_tick(&self) -> Result<(), ControllerError> {
        let resync = {
            let mut shared = lock(&self.shared);
            if shared.state == ControllerState::Wait {
                let (done, _) = self.is_done_processing_current_workloads();
                if done {
                    self.set_state(&mut shared, ControllerState::Active, "drained");
                    shared.needs_resync = true;
                }
            }
            shared.needs_resync
        };
        if resync {
            self.sync().await?;
        }
        Ok(())
    }

    /// Apply the instance manager's current roster to local state.
    ///
    /// Only fatal conditions are returned as errors; failed registry writes
    /// are retried on the next tick.
    pub async fn sync(&self) -> Result<(), ControllerError> {
        let snapshot = match self.cim.list_by_type(&self.controller_type).await {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                warn!(error = %e, "Failed to read roster");
                lock(&self.shared).needs_resync = true;
                return Ok(());
            }
        };

        let plan = {
            let mut shared = lock(&self.shared);
            if shared.state == ControllerState::Error {
                return Err(ControllerError::LostMembership {
                    name: self.name.clone(),
                });
            }
            shared.needs_resync = false;

            match observe(&self.name, shared.state, shared.range, shared.seen_self, &snapshot) {
                Observation::NotYetVisible => {
                    debug!("Own instance not yet visible in roster");
                    return Ok(());
                }
                Observation::LostMembership => {
                    self.set_state(&mut shared, ControllerState::Error, "lost membership");
                    error!("Own instance disappeared from the roster");
                    return Err(ControllerError::LostMembership {
                        name: self.name.clone(),
                    });
                }
                Observation::Step(step) => {
                    shared.seen_self = true;
                    if step.state != shared.state {
                        let reason = match step.state {
                            ControllerState::Wait => "range shrank",
                            _ => "unlocked",
                        };
                        self.set_state(&mut shared, step.state, reason);
                    }

                    let mut plan = Plan {
                        pin_key: step.pin_key,
                        clear_lock: step.clear_lock,
                        unlock_predecessor: step.unlock_predecessor,
                        filter: None,
                    };
                    if step.change.is_self_range_updated() {
                        info!(
                            old = %step.change.old,
                            new = %step.change.new,
                            lower_raised = step.change.is_lower_bound_raised(),
                            upper_extended = step.change.is_upper_bound_extended(),
                            "Key range changed"
                        );
                        shared.range = step.change.new;
                        plan.filter = Some(FilterBound::new(&self.name, step.change.new));
                    }
                    shared.roster = step.roster;
                    shared.position = Some(step.position);
                    plan
                }
            }
        };

        self.execute(plan).await;
        Ok(())
    }

    async fn execute(&self, plan: Plan) {
        if let Some(bound) = plan.filter {
            let range = bound.range();
            lock(&self.workloads).retain(|k, _| range.contains(*k));
            self.publish_filter_bound(bound);
        }

        if plan.pin_key || plan.clear_lock {
            let repaired = self.repair_self(plan.pin_key, plan.clear_lock).await;
            if !repaired {
                lock(&self.shared).needs_resync = true;
            }
        }

        if let Some(predecessor) = plan.unlock_predecessor {
            if !self.unlock_predecessor(&predecessor).await {
                lock(&self.shared).needs_resync = true;
            }
        }
    }

    fn set_state(&self, shared: &mut Shared, next: ControllerState, reason: &str) {
        if shared.state == next {
            return;
        }
        info!(from = %shared.state, to = %next, reason, range = %shared.range, "Controller state transition");
        shared.state = next;
        self.state_tx.send_replace(next);
    }

    fn publish_filter_bound(&self, bound: FilterBound) {
        debug!(lower = bound.lower_bound, upper = bound.upper_bound, "Publishing filter bound");
        self.latest_filter.send_replace(Some(bound.clone()));
        // No informers subscribed is fine.
        let _ = self.filter_tx.send(bound);
    }

    /// Persist our own key pin and/or lock release. Returns false on failure.
    async fn repair_self(&self, pin_key: bool, clear_lock: bool) -> bool {
        let timeout = self.config.rpc_timeout;
        let read = with_timeout(timeout, self.registry.get_instance(&self.name)).await;
        let mut current = match read {
            Ok(current) => current,
            Err(e) => {
                warn!(error = %e, "Failed to read own instance");
                return false;
            }
        };

        if pin_key {
            current.controller_key = KEY_MAX;
        }
        if clear_lock {
            current.is_locked = false;
        }

        match with_timeout(timeout, self.registry.update_instance(current)).await {
            Ok(updated) => {
                info!(
                    controller_key = updated.controller_key,
                    is_locked = updated.is_locked,
                    resource_version = updated.resource_version,
                    "Updated own instance"
                );
                true
            }
            Err(e) if e.is_conflict() => {
                debug!(error = %e, "Own instance update raced, retrying");
                false
            }
            Err(e) => {
                warn!(error = %e, "Failed to update own instance");
                false
            }
        }
    }

    /// Release the lock on our immediate predecessor. Returns false on failure.
    async fn unlock_predecessor(&self, predecessor: &str) -> bool {
        let timeout = self.config.rpc_timeout;
        let read = with_timeout(timeout, self.registry.get_instance(predecessor)).await;
        let mut instance = match read {
            Ok(instance) => instance,
            Err(e) if e.is_not_found() => return true,
            Err(e) => {
                warn!(predecessor, error = %e, "Failed to read predecessor");
                return false;
            }
        };
        if !instance.is_locked {
            return true;
        }

        instance.is_locked = false;
        match with_timeout(timeout, self.registry.update_instance(instance)).await {
            Ok(updated) => {
                info!(
                    predecessor,
                    resource_version = updated.resource_version,
                    "Unlocked predecessor"
                );
                true
            }
            Err(e) if e.is_not_found() => true,
            Err(e) if e.is_conflict() => {
                debug!(predecessor, "Unlock raced with another update, retrying");
                false
            }
            Err(e) => {
                warn!(predecessor, error = %e, "Failed to unlock predecessor");
                false
            }
        }
    }

    /// Write `workload_num`, the pinned key and lock release if they differ
    /// from the registered instance. Conflicts are ignored.
    ///
    /// Returns whether a write happened.
    pub async fn report_health(&self) -> Result<bool, ControllerError> {
        let snapshot = self.cim.list_by_type(&self.controller_type).await?;
        let Some(current) = snapshot.get(&self.name) else {
            return Ok(false);
        };

        let (state, rightmost) = {
            let shared = lock(&self.shared);
            let rightmost = shared
                .position
                .is_some_and(|p| shared.roster.is_rightmost(p));
            (shared.state, rightmost)
        };
        if state == ControllerState::Error {
            return Ok(false);
        }

        let mut desired = current.clone();
        desired.workload_num = self.workload_num();
        desired.is_locked = current.is_locked && state == ControllerState::Locked;
        if rightmost {
            desired.controller_key = KEY_MAX;
        }
        if desired == *current {
            return Ok(false);
        }

        match with_timeout(self.config.rpc_timeout, self.registry.update_instance(desired)).await {
            Ok(updated) => {
                debug!(
                    workload_num = updated.workload_num,
                    resource_version = updated.resource_version,
                    "Health reported"
                );
                Ok(true)
            }
            Err(e) if e.is_conflict() || e.is_not_found() => {
                debug!(error = %e, "Health report raced, skipping");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Extend our membership lease.
    ///
    /// A missing record is left to `sync`, which treats it as lost membership.
    pub async fn renew_membership(&self) -> Result<(), ControllerError> {
        let renewal = self.registry.renew_instance(&self.name);
        match with_timeout(self.config.rpc_timeout, renewal).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                warn!(instance = %self.name, "Own instance missing on lease renewal");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete peers of our type whose membership lease lapsed.
    ///
    /// Their ranges are absorbed through the usual delete handling.
    pub async fn reap_expired_peers(&self) -> Result<Vec<String>, ControllerError> {
        let reaped = with_timeout(
            self.config.rpc_timeout,
            self.registry.reap_expired_instances(Some(&self.controller_type)),
        )
        .await?;
        for peer in &reaped {
            info!(instance = %self.name, peer = %peer, "Reaped expired peer instance");
        }
        Ok(reaped)
    }

    /// Delete our instance from the registry.
    pub async fn deregister(&self) -> Result<(), ControllerError> {
        let delete = self.registry.delete_instance(&self.name);
        match with_timeout(self.config.rpc_timeout, delete).await {
            Ok(()) => {
                info!(instance = %self.name, "Deregistered controller instance");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Create `instance`, or adopt it if an earlier attempt already did.
///
/// Instance names are never reused, so an existing record of the same name
/// and type is ours.
async fn create_or_adopt(
    registry: &dyn ControllerInstanceStore,
    instance: &ControllerInstance,
    timeout: Duration,
) -> RegistryResult<ControllerInstance> {
    match registry.create_instance(instance.clone()).await {
        Err(e) if e.is_already_exists() => {
            let stored = with_timeout(timeout, registry.get_instance(&instance.name)).await?;
            if stored.controller_type != instance.controller_type {
                return Err(e);
            }
            info!(
                instance = %stored.name,
                resource_version = stored.resource_version,
                "Adopted instance created by an earlier attempt"
            );
            Ok(stored)
        }
        other => other,
    }
}

impl std::fmt::Debug for ControllerBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerBase")
            .field("controller_type", &self.controller_type)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("range", &self.key_range())
            .finish()
    }
}
