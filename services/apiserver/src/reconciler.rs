//! Lease-based reconciler for the bootstrap endpoints.
//!
//! Every API server holds a TTL lease on `(service_group_id, ip)`. Each pass
//! renews our lease, lists the live leases of our group and rewrites our
//! group's subset of the bootstrap `Endpoints` when it no longer matches.
//! Subsets of other groups are never modified.

use std::sync::Arc;
use std::time::Duration;

use scf_endpoints::{repack, EndpointAddress, EndpointPort, EndpointSubset, Endpoints};
use scf_registry::{with_timeout, Registry};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{EndpointReconcileError, Result};

/// Endpoint reconciler settings.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub service_group_id: String,
    pub ip: String,
    pub ports: Vec<EndpointPort>,
    pub lease_duration: Duration,
    pub reconcile_ports: bool,
    pub namespace: String,
    pub name: String,
    pub rpc_timeout: Duration,
}

/// What a reconcile pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Unchanged,
    Created,
    Updated,
    /// Reconciling was stopped; nothing was done.
    Skipped,
}

/// Checks on our group's part of an existing `Endpoints` object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SubsetCheck {
    /// Exactly one subset for our group.
    format_correct: bool,
    /// Its ready addresses are exactly the lease IPs.
    ips_correct: bool,
    /// Its ports are ours, or ports are not reconciled.
    ports_correct: bool,
}

impl SubsetCheck {
    fn is_correct(&self) -> bool {
        self.format_correct && self.ips_correct && self.ports_correct
    }
}

fn check_subsets(
    related: &[&EndpointSubset],
    ips: &[String],
    ports: &[EndpointPort],
    reconcile_ports: bool,
) -> SubsetCheck {
    let [subset] = related else {
        return SubsetCheck {
            format_correct: false,
            ips_correct: false,
            ports_correct: false,
        };
    };

    let mut addresses: Vec<&str> = subset.addresses.iter().map(|a| a.ip.as_str()).collect();
    addresses.sort_unstable();
    let ips_correct = subset.not_ready_addresses.is_empty()
        && addresses.len() == ips.len()
        && addresses.iter().zip(ips).all(|(a, b)| *a == b.as_str());

    let ports_correct = !reconcile_ports || subset.ports == ports;

    SubsetCheck {
        format_correct: true,
        ips_correct,
        ports_correct,
    }
}

/// Maintains this API server's service group subset of the bootstrap endpoints.
pub struct LeaseEndpointReconciler {
    registry: Arc<dyn Registry>,
    config: ReconcilerConfig,
    /// Serializes passes; `true` once reconciling was stopped.
    stopped: Mutex<bool>,
}

impl LeaseEndpointReconciler {
    pub fn new(registry: Arc<dyn Registry>, config: ReconcilerConfig) -> Self {
        Self {
            registry,
            config,
            stopped: Mutex::new(false),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Renew our lease, then bring our group's subset in line with the leases.
    pub async fn reconcile_endpoints(&self) -> Result<ReconcileOutcome> {
        let stopped = self.stopped.lock().await;
        if *stopped {
            return Ok(ReconcileOutcome::Skipped);
        }

        with_timeout(
            self.config.rpc_timeout,
            self.registry.renew_lease(
                &self.config.service_group_id,
                &self.config.ip,
                self.config.lease_duration,
            ),
        )
        .await?;

        self.pass().await
    }

    /// Drop our lease and run one pass without renewing it.
    pub async fn remove_endpoints(&self) -> Result<ReconcileOutcome> {
        let _guard = self.stopped.lock().await;

        match with_timeout(
            self.config.rpc_timeout,
            self.registry
                .remove_lease(&self.config.service_group_id, &self.config.ip),
        )
        .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        info!(ip = %self.config.ip, service_group_id = %self.config.service_group_id, "Removed API server lease");

        self.pass().await
    }

    /// Make later [`reconcile_endpoints`](Self::reconcile_endpoints) calls no-ops.
    pub async fn stop_reconciling(&self) {
        *self.stopped.lock().await = true;
    }

    async fn pass(&self) -> Result<ReconcileOutcome> {
        let timeout = self.config.rpc_timeout;
        let group = self.config.service_group_id.as_str();

        let mut ips: Vec<String> = with_timeout(timeout, self.registry.list_leases())
            .await?
            .into_iter()
            .filter(|lease| lease.service_group_id == group)
            .map(|lease| lease.ip)
            .collect();
        ips.sort();
        ips.dedup();
        if ips.is_empty() {
            return Err(EndpointReconcileError::NoLeases {
                service_group_id: group.to_string(),
            });
        }

        let existing = match with_timeout(
            timeout,
            self.registry
                .get_endpoints(&self.config.namespace, &self.config.name),
        )
        .await
        {
            Ok(endpoints) => Some(endpoints),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        let Some(mut endpoints) = existing else {
            let mut endpoints = Endpoints::new(&self.config.namespace, &self.config.name);
            endpoints.subsets = repack(&[self.build_subset(&ips, &self.config.ports)], group);
            let created = with_timeout(timeout, self.registry.create_endpoints(endpoints)).await?;
            info!(
                service_group_id = group,
                addresses = ips.len(),
                resource_version = created.resource_version,
                "Created bootstrap endpoints"
            );
            return Ok(ReconcileOutcome::Created);
        };

        let (related, unrelated) = endpoints.partition_by_group(group);
        let check = check_subsets(&related, &ips, &self.config.ports, self.config.reconcile_ports);
        if check.is_correct() {
            debug!(service_group_id = group, addresses = ips.len(), "Endpoints up to date");
            return Ok(ReconcileOutcome::Unchanged);
        }

        // Keep the existing ports when only addresses are reconciled.
        let ports = match related.as_slice() {
            [subset] if !self.config.reconcile_ports => subset.ports.clone(),
            _ => self.config.ports.clone(),
        };
        let mut subsets: Vec<EndpointSubset> = unrelated.into_iter().cloned().collect();
        subsets.push(self.build_subset(&ips, &ports));
        endpoints.subsets = repack(&subsets, group);

        let updated = with_timeout(timeout, self.registry.update_endpoints(endpoints)).await?;
        info!(
            service_group_id = group,
            addresses = ips.len(),
            format_correct = check.format_correct,
            ips_correct = check.ips_correct,
            ports_correct = check.ports_correct,
            resource_version = updated.resource_version,
            "Updated bootstrap endpoints"
        );
        Ok(ReconcileOutcome::Updated)
    }

    fn build_subset(&self, ips: &[String], ports: &[EndpointPort]) -> EndpointSubset {
        EndpointSubset {
            addresses: ips.iter().map(EndpointAddress::new).collect(),
            not_ready_addresses: Vec::new(),
            ports: ports.to_vec(),
            service_group_id: self.config.service_group_id.clone(),
        }
    }

    /// Reconcile every `interval` until shutdown, then remove our endpoints once.
    #[instrument(
        skip(self, shutdown),
        fields(ip = %self.config.ip, service_group_id = %self.config.service_group_id)
    )]
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "Starting endpoint reconciler");

        let mut consecutive_failures = 0u32;
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => match self.reconcile_endpoints().await {
                    Ok(outcome) => {
                        consecutive_failures = 0;
                        debug!(?outcome, "Endpoint reconcile pass finished");
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures <= 3 && e.is_transient() {
                            warn!(error = %e, consecutive_failures, "Endpoint reconcile failed");
                        } else {
                            error!(error = %e, consecutive_failures, "Endpoint reconcile failed repeatedly");
                        }
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Endpoint reconciler shutting down");
                        break;
                    }
                }
            }
        }

        self.stop_reconciling().await;
        match self.remove_endpoints().await {
            Ok(outcome) => info!(?outcome, "Removed own endpoints"),
            Err(EndpointReconcileError::NoLeases { .. }) => {
                info!("Last API server in group left; endpoints left as is")
            }
            Err(e) => warn!(error = %e, "Failed to remove own endpoints"),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn subset(ips: &[&str], ports: &[i32], group: &str) -> EndpointSubset {
        EndpointSubset {
            addresses: ips.iter().map(|ip| EndpointAddress::new(*ip)).collect(),
            not_ready_addresses: Vec::new(),
            ports: ports.iter().map(|p| EndpointPort::tcp("https", *p)).collect(),
            service_group_id: group.to_string(),
        }
    }

    fn ips(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[rstest]
    #[case::matching(vec![subset(&["1.1.1.1", "2.2.2.2"], &[443], "")], true, true, true)]
    #[case::missing_ip(vec![subset(&["1.1.1.1"], &[443], "")], true, false, true)]
    #[case::extra_ip(vec![subset(&["1.1.1.1", "2.2.2.2", "3.3.3.3"], &[443], "")], true, false, true)]
    #[case::wrong_port(vec![subset(&["1.1.1.1", "2.2.2.2"], &[6443], "")], true, true, false)]
    #[case::two_subsets(vec![subset(&["1.1.1.1"], &[443], ""), subset(&["2.2.2.2"], &[443], "")], false, false, false)]
    #[case::no_subset(vec![], false, false, false)]
    fn test_check_subsets(
        #[case] related: Vec<EndpointSubset>,
        #[case] format: bool,
        #[case] ips_ok: bool,
        #[case] ports_ok: bool,
    ) {
        let refs: Vec<&EndpointSubset> = related.iter().collect();
        let check = check_subsets(
            &refs,
            &ips(&["1.1.1.1", "2.2.2.2"]),
            &[EndpointPort::tcp("https", 443)],
            true,
        );
        assert_eq!(check.format_correct, format);
        assert_eq!(check.ips_correct, ips_ok);
        assert_eq!(check.ports_correct, ports_ok);
    }

    #[test]
    fn test_ports_ignored_when_not_reconciled() {
        let related = [subset(&["1.1.1.1"], &[6443], "")];
        let refs: Vec<&EndpointSubset> = related.iter().collect();
        let ports = [EndpointPort::tcp("https", 443)];
        let check = check_subsets(&refs, &ips(&["1.1.1.1"]), &ports, false);
        assert!(check.is_correct());
    }

    #[test]
    fn test_not_ready_addresses_fail_ip_check() {
        let mut s = subset(&["1.1.1.1"], &[443], "");
        s.not_ready_addresses.push(EndpointAddress::new("2.2.2.2"));
        let refs = vec![&s];
        let ports = [EndpointPort::tcp("https", 443)];
        let check = check_subsets(&refs, &ips(&["1.1.1.1"]), &ports, true);
        assert!(check.format_correct);
        assert!(!check.ips_correct);
    }
}
