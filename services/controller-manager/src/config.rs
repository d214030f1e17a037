//! Configuration for the controller manager.

use std::time::Duration;

use anyhow::Result;
use scf_reconcile::{DEFAULT_ITEM_TIMEOUT, DEFAULT_MAX_RETRIES};
use scf_registry::DbConfig;

use crate::controller::OutOfRangePolicy;

/// Controller manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Controller types hosted by this process.
    pub controller_types: Vec<String>,

    /// Worker tasks per controller.
    pub worker_count: usize,

    /// Interval between health reports.
    pub health_report_interval: Duration,

    /// Membership lease renewed by every health report.
    pub instance_lease: Duration,

    /// Deadline for each registry call.
    pub rpc_timeout: Duration,

    /// Deadline for reconciling one work item.
    pub item_timeout: Duration,

    /// How often a draining controller re-checks its in-flight count.
    pub drain_poll_interval: Duration,

    /// Requeues before a failing item is dropped.
    pub max_retries: u32,

    /// What to do with items outside the local range.
    pub out_of_range: OutOfRangePolicy,

    /// Use the in-memory registry instead of Postgres.
    pub dev_registry: bool,

    /// Postgres registry settings.
    pub db: DbConfig,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controller_types: vec!["replicaset".to_string()],
            worker_count: 5,
            health_report_interval: Duration::from_secs(5),
            instance_lease: Duration::from_secs(20),
            rpc_timeout: Duration::from_secs(10),
            item_timeout: DEFAULT_ITEM_TIMEOUT,
            drain_poll_interval: Duration::from_millis(100),
            max_retries: DEFAULT_MAX_RETRIES,
            out_of_range: OutOfRangePolicy::Requeue,
            dev_registry: false,
            db: DbConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// The in-memory registry is opt-in; without it a database is required.
fn dev_registry_from(scf_dev: Option<&str>, database_url: Option<&str>) -> Result<bool> {
    if scf_dev == Some("1") {
        return Ok(true);
    }
    if database_url.is_none_or(|url| url.trim().is_empty()) {
        anyhow::bail!("DATABASE_URL is required unless SCF_DEV=1");
    }
    Ok(false)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let controller_types = std::env::var("SCF_CONTROLLER_TYPES")
            .map(|s| parse_types(&s))
            .unwrap_or(defaults.controller_types);
        if controller_types.is_empty() {
            anyhow::bail!("SCF_CONTROLLER_TYPES must name at least one controller type");
        }

        let worker_count = env_parse::<usize>("SCF_WORKER_COUNT")
            .unwrap_or(defaults.worker_count)
            .max(1);

        let health_report_interval = env_parse("SCF_HEALTH_REPORT_INTERVAL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.health_report_interval);

        let instance_lease = env_parse("SCF_INSTANCE_LEASE_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.instance_lease);
        if instance_lease <= health_report_interval {
            anyhow::bail!(
                "SCF_INSTANCE_LEASE_SECS ({}s) must exceed the health report interval ({}s)",
                instance_lease.as_secs(),
                health_report_interval.as_secs()
            );
        }

        let rpc_timeout = env_parse("SCF_RPC_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.rpc_timeout);

        let item_timeout = env_parse("SCF_ITEM_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.item_timeout);

        let drain_poll_interval = env_parse("SCF_DRAIN_POLL_INTERVAL_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.drain_poll_interval);

        let max_retries = env_parse("SCF_MAX_RETRIES").unwrap_or(defaults.max_retries);

        let dev_registry = dev_registry_from(
            std::env::var("SCF_DEV").ok().as_deref(),
            std::env::var("DATABASE_URL").ok().as_deref(),
        )?;

        let log_level = std::env::var("SCF_LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            controller_types,
            worker_count,
            health_report_interval,
            instance_lease,
            rpc_timeout,
            item_timeout,
            drain_poll_interval,
            max_retries,
            dev_registry,
            db: DbConfig::from_env(),
            log_level,
            ..defaults
        })
    }
}

fn parse_types(s: &str) -> Vec<String> {
    let mut types: Vec<String> = s
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    types.sort();
    types.dedup();
    types
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.worker_count, 5);
        assert_eq!(config.controller_types, vec!["replicaset"]);
        assert_eq!(config.max_retries, 15);
        assert_eq!(config.item_timeout, Duration::from_secs(60));
        assert!(config.instance_lease > config.health_report_interval);
    }

    #[test]
    fn test_parse_types() {
        assert_eq!(
            parse_types(" replicaset, endpoints ,,replicaset"),
            vec!["endpoints", "replicaset"]
        );
        assert!(parse_types(" , ").is_empty());
    }

    #[rstest]
    #[case::dev_without_database(Some("1"), None, Some(true))]
    #[case::dev_wins_over_database(Some("1"), Some("postgres://db/scf"), Some(true))]
    #[case::database(None, Some("postgres://db/scf"), Some(false))]
    #[case::dev_disabled(Some("0"), Some("postgres://db/scf"), Some(false))]
    #[case::nothing_configured(None, None, None)]
    #[case::blank_url(Some("0"), Some(" "), None)]
    fn test_dev_registry_is_opt_in(
        #[case] scf_dev: Option<&str>,
        #[case] database_url: Option<&str>,
        #[case] expected: Option<bool>,
    ) {
        assert_eq!(dev_registry_from(scf_dev, database_url).ok(), expected);
    }
}
