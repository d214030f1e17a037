//! Configuration for the endpoint reconciler.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use scf_endpoints::EndpointPort;
use scf_registry::DbConfig;

/// Endpoint reconciler configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address this API server publishes in the bootstrap endpoints.
    pub advertise_ip: IpAddr,

    /// Service group this API server belongs to.
    pub service_group_id: String,

    /// Port served on `advertise_ip`.
    pub service_port: i32,

    /// TTL of this server's lease.
    pub lease_duration: Duration,

    /// Interval between reconcile passes.
    pub reconcile_interval: Duration,

    /// Also rewrite the subset when its ports differ from ours.
    pub reconcile_ports: bool,

    pub endpoints_namespace: String,
    pub endpoints_name: String,

    /// Deadline for each registry call.
    pub rpc_timeout: Duration,

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
            advertise_ip: IpAddr::from([127, 0, 0, 1]),
            service_group_id: String::new(),
            service_port: 443,
            lease_duration: Duration::from_secs(15),
            reconcile_interval: Duration::from_secs(10),
            reconcile_ports: true,
            endpoints_namespace: "default".to_string(),
            endpoints_name: "kubernetes".to_string(),
            rpc_timeout: Duration::from_secs(10),
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

        let advertise_ip = std::env::var("SCF_ADVERTISE_IP")
            .context("SCF_ADVERTISE_IP is required")?
            .parse()
            .context("SCF_ADVERTISE_IP is not a valid IP address")?;

        let service_port = env_parse::<i32>("SCF_SERVICE_PORT").unwrap_or(defaults.service_port);
        if !(1..=65535).contains(&service_port) {
            anyhow::bail!("SCF_SERVICE_PORT must be in 1..=65535, got {service_port}");
        }

        let lease_duration = env_parse("SCF_LEASE_DURATION_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.lease_duration);

        let reconcile_interval = env_parse("SCF_RECONCILE_INTERVAL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.reconcile_interval);
        if reconcile_interval >= lease_duration {
            tracing::warn!(
                reconcile_interval_secs = reconcile_interval.as_secs(),
                lease_duration_secs = lease_duration.as_secs(),
                "Reconcile interval is not shorter than the lease duration; leases may lapse"
            );
        }

        let rpc_timeout = env_parse("SCF_RPC_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.rpc_timeout);

        let dev_registry = dev_registry_from(
            std::env::var("SCF_DEV").ok().as_deref(),
            std::env::var("DATABASE_URL").ok().as_deref(),
        )?;

        Ok(Self {
            advertise_ip,
            service_group_id: std::env::var("SCF_SERVICE_GROUP_ID")
                .unwrap_or(defaults.service_group_id),
            service_port,
            lease_duration,
            reconcile_interval,
            reconcile_ports: env_parse("SCF_RECONCILE_PORTS").unwrap_or(defaults.reconcile_ports),
            endpoints_namespace: std::env::var("SCF_ENDPOINTS_NAMESPACE")
                .unwrap_or(defaults.endpoints_namespace),
            endpoints_name: std::env::var("SCF_ENDPOINTS_NAME").unwrap_or(defaults.endpoints_name),
            rpc_timeout,
            dev_registry,
            db: DbConfig::from_env(),
            log_level: std::env::var("SCF_LOG_LEVEL").unwrap_or(defaults.log_level),
        })
    }

    /// Ports published for this API server.
    pub fn ports(&self) -> Vec<EndpointPort> {
        vec![EndpointPort::tcp("https", self.service_port)]
    }
}
