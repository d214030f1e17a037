use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Membership record of one controller process shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerInstance {
    /// Globally unique, never reused.
    pub name: String,

    /// Partition namespace, e.g. "replicaset". Immutable.
    pub controller_type: String,

    /// Inclusive upper bound of this instance's key range.
    pub controller_key: i64,

    /// Advisory count of workloads handled, refreshed by health reports.
    #[serde(default)]
    pub workload_num: i32,

    /// True while waiting for the successor to hand off key space.
    #[serde(default)]
    pub is_locked: bool,

    /// Membership lease in milliseconds. The registry reaps the instance when
    /// it goes this long without a write or renewal. 0 never expires.
    #[serde(default)]
    pub lease_duration_ms: u64,

    /// Assigned by the registry on every write; 0 before create.
    #[serde(default)]
    pub resource_version: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ControllerInstance {
    pub fn new(
        name: impl Into<String>,
        controller_type: impl Into<String>,
        controller_key: i64,
        is_locked: bool,
    ) -> Self {
        Self {
            name: name.into(),
            controller_type: controller_type.into(),
            controller_key,
            workload_num: 0,
            is_locked,
            lease_duration_ms: 0,
            resource_version: 0,
            deletion_timestamp: None,
        }
    }

    /// Expire the instance unless renewed within `ttl`.
    pub fn with_lease_duration(mut self, ttl: Duration) -> Self {
        self.lease_duration_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn lease_duration(&self) -> Option<Duration> {
        (self.lease_duration_ms > 0).then(|| Duration::from_millis(self.lease_duration_ms))
    }

    pub fn is_deleted(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

impl WatchEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "ADDED",
            Self::Modified => "MODIFIED",
            Self::Deleted => "DELETED",
        }
    }
}

impl std::str::FromStr for WatchEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADDED" => Ok(Self::Added),
            "MODIFIED" => Ok(Self::Modified),
            "DELETED" => Ok(Self::Deleted),
            other => Err(format!("unknown watch event type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent<T> {
    pub event_type: WatchEventType,
    pub object: T,
}

impl<T> WatchEvent<T> {
    pub fn new(event_type: WatchEventType, object: T) -> Self {
        Self { event_type, object }
    }
}

/// Consistent list result; watch from `resource_version` to continue.
#[derive(Debug, Clone, Default)]
pub struct InstanceList {
    pub items: Vec<ControllerInstance>,
    pub resource_version: u64,
}

/// A live API server lease.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Lease {
    pub service_group_id: String,
    pub ip: String,
}
