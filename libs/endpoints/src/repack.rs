//! Canonical repacking of one service group's subsets.
//!
//! Addresses are mapped per port, ports are then grouped by the exact set of
//! (address, readiness) pairs they serve, and each group becomes one subset.
//! The result does not depend on input order.

use std::collections::BTreeMap;

use crate::types::{AddressKey, EndpointAddress, EndpointPort, EndpointSubset};

/// Repack the subsets of `group`, passing other groups' subsets through.
///
/// Output order: subsets of groups sorting before `group`, the repacked
/// subsets of `group`, then subsets of groups sorting after it.
pub fn repack(subsets: &[EndpointSubset], group: &str) -> Vec<EndpointSubset> {
    let (related, mut unrelated): (Vec<&EndpointSubset>, Vec<&EndpointSubset>) =
        subsets.iter().partition(|s| s.service_group_id == group);

    let mut repacked = repack_group(&related, group);
    sort_subsets(&mut repacked);

    unrelated.sort_by(|a, b| {
        a.service_group_id
            .cmp(&b.service_group_id)
            .then_with(|| a.cmp(b))
    });
    let split = unrelated.partition_point(|s| s.service_group_id.as_str() < group);

    let mut out = Vec::with_capacity(unrelated.len() + repacked.len());
    out.extend(unrelated[..split].iter().map(|s| (*s).clone()));
    out.extend(repacked);
    out.extend(unrelated[split..].iter().map(|s| (*s).clone()));
    out
}

fn repack_group(related: &[&EndpointSubset], group: &str) -> Vec<EndpointSubset> {
    // One canonical address per key; the smallest wins so order never matters.
    let mut all_addrs: BTreeMap<AddressKey, EndpointAddress> = BTreeMap::new();
    // `None` stands for "no ports" so port-less subsets are not discarded.
    let mut by_port: BTreeMap<Option<EndpointPort>, BTreeMap<AddressKey, bool>> = BTreeMap::new();

    for subset in related {
        let ports: Vec<Option<&EndpointPort>> = if subset.ports.is_empty() {
            vec![None]
        } else {
            subset.ports.iter().map(Some).collect()
        };

        let addrs = subset
            .addresses
            .iter()
            .map(|a| (a, true))
            .chain(subset.not_ready_addresses.iter().map(|a| (a, false)));

        for (addr, ready) in addrs {
            let key = addr.key();
            all_addrs
                .entry(key.clone())
                .and_modify(|cur| {
                    if addr < cur {
                        *cur = addr.clone();
                    }
                })
                .or_insert_with(|| addr.clone());

            for &port in &ports {
                let set = by_port.entry(port.cloned()).or_default();
                // Not-ready is authoritative.
                let was_ready = set.entry(key.clone()).or_insert(ready);
                *was_ready &= ready;
            }
        }
    }

    let mut by_addr_set: BTreeMap<Vec<(AddressKey, bool)>, Vec<Option<EndpointPort>>> =
        BTreeMap::new();
    for (port, addrs) in by_port {
        let set: Vec<(AddressKey, bool)> = addrs.into_iter().collect();
        by_addr_set.entry(set).or_default().push(port);
    }

    by_addr_set
        .into_iter()
        .filter(|(set, _)| !set.is_empty())
        .map(|(set, ports)| {
            let mut subset = EndpointSubset {
                service_group_id: group.to_string(),
                ports: ports.into_iter().flatten().collect(),
                ..Default::default()
            };
            for (key, ready) in set {
                let Some(addr) = all_addrs.get(&key).cloned() else {
                    continue;
                };
                if ready {
                    subset.addresses.push(addr);
                } else {
                    subset.not_ready_addresses.push(addr);
                }
            }
            subset
        })
        .collect()
}

/// Sort addresses and ports inside each subset, then the subsets themselves
/// by first address and first port.
pub fn sort_subsets(subsets: &mut [EndpointSubset]) {
    for subset in subsets.iter_mut() {
        subset.addresses.sort_by_key(EndpointAddress::key);
        subset.not_ready_addresses.sort_by_key(EndpointAddress::key);
        subset.ports.sort();
    }
    subsets.sort_by(|a, b| {
        let ka = (a.first_address().map(EndpointAddress::key), a.ports.first());
        let kb = (b.first_address().map(EndpointAddress::key), b.ports.first());
        ka.cmp(&kb).then_with(|| a.cmp(b))
    });
}
