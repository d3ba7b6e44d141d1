//! Controller configuration.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tidepool_reconcile::{
    DEFAULT_IDLE_TIMEOUT, DEFAULT_REGISTRATION_TIMEOUT, DEFAULT_SWEEP_BUDGET,
    DEFAULT_SWEEP_INTERVAL,
};

use crate::sim::QueueSettings;
use crate::workers::DispatchWorkerConfig;

/// Which collaborators the controller talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// The cluster gateway over HTTP.
    Gateway,
    /// In-process simulated cluster and queue.
    Simulated,
}

impl std::str::FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gateway" => Ok(Backend::Gateway),
            "simulated" | "sim" => Ok(Backend::Simulated),
            other => bail!("unknown backend '{other}' (expected 'gateway' or 'simulated')"),
        }
    }
}

/// Controller configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Orchestrator cluster to place tasks on.
    pub cluster_id: String,

    /// Node pool backing the cluster.
    pub pool_id: String,

    /// Task queue to consume (name or URL).
    pub queue: Option<String>,

    pub backend: Backend,

    /// Cluster gateway base URL; required for the gateway backend.
    pub gateway_url: Option<String>,

    /// Empty-node idle period before draining.
    pub idle_timeout: Duration,

    /// Window for a launched instance to register.
    pub registration_timeout: Duration,

    /// Queue visibility timeout (the dispatch retry interval).
    pub visibility_timeout: Duration,

    /// Receives before a message is dead-lettered.
    pub max_receive_count: u32,

    /// Dead-letter retention.
    pub dead_letter_retention: Duration,

    pub sweep_interval: Duration,

    /// Wall-clock budget for one sweep.
    pub sweep_budget: Duration,

    /// Timeout for every collaborator call.
    pub call_timeout: Duration,

    /// Deliveries dispatched at once.
    pub dispatch_concurrency: usize,

    /// Messages requested per receive.
    pub receive_batch: usize,

    /// Long-poll wait per receive.
    pub receive_wait: Duration,

    /// Hold a lease around each sweep.
    pub reaper_lease: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through a variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let secs = |key: &str, default: Duration| -> Result<Duration> {
            let value: u64 = lookup(key)
                .map(|v| v.parse())
                .transpose()
                .with_context(|| format!("{key} must be an integer (seconds)."))?
                .unwrap_or(default.as_secs());
            if value == 0 {
                bail!("{key} must be greater than zero.");
            }
            Ok(Duration::from_secs(value))
        };
        let count = |key: &str, default: usize| -> Result<usize> {
            let value: usize = lookup(key)
                .map(|v| v.parse())
                .transpose()
                .with_context(|| format!("{key} must be an integer."))?
                .unwrap_or(default);
            if value == 0 {
                bail!("{key} must be greater than zero.");
            }
            Ok(value)
        };

        let cluster_id = lookup("TIDEPOOL_CLUSTER_ID")
            .filter(|v| !v.trim().is_empty())
            .context("Missing cluster id. Set TIDEPOOL_CLUSTER_ID.")?;

        let pool_id = lookup("TIDEPOOL_POOL_ID")
            .filter(|v| !v.trim().is_empty())
            .context("Missing node pool id. Set TIDEPOOL_POOL_ID.")?;

        let queue = lookup("TIDEPOOL_QUEUE_URL").or_else(|| lookup("TIDEPOOL_QUEUE_NAME"));

        let backend: Backend = lookup("TIDEPOOL_BACKEND")
            .map(|v| v.parse())
            .transpose()
            .context("TIDEPOOL_BACKEND is invalid.")?
            .unwrap_or(Backend::Gateway);

        let gateway_url = lookup("TIDEPOOL_GATEWAY_URL");
        if backend == Backend::Gateway && gateway_url.is_none() {
            bail!("TIDEPOOL_GATEWAY_URL is required for the gateway backend.");
        }

        let queue_defaults = QueueSettings::default();
        let dispatch_defaults = DispatchWorkerConfig::default();

        let max_receive_count = count(
            "TIDEPOOL_MAX_RECEIVE_COUNT",
            queue_defaults.max_receive_count as usize,
        )?;
        let max_receive_count = u32::try_from(max_receive_count)
            .context("TIDEPOOL_MAX_RECEIVE_COUNT is too large.")?;

        let reaper_lease = lookup("TIDEPOOL_REAPER_LEASE")
            .map(|v| !(v == "0" || v.eq_ignore_ascii_case("false")))
            .unwrap_or(true);

        let log_level = lookup("TIDEPOOL_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            cluster_id,
            pool_id,
            queue,
            backend,
            gateway_url,
            idle_timeout: secs("TIDEPOOL_IDLE_TIMEOUT_SECS", DEFAULT_IDLE_TIMEOUT)?,
            registration_timeout: secs(
                "TIDEPOOL_REGISTRATION_TIMEOUT_SECS",
                DEFAULT_REGISTRATION_TIMEOUT,
            )?,
            visibility_timeout: secs(
                "TIDEPOOL_VISIBILITY_TIMEOUT_SECS",
                queue_defaults.visibility_timeout,
            )?,
            max_receive_count,
            dead_letter_retention: secs(
                "TIDEPOOL_DEAD_LETTER_RETENTION_SECS",
                queue_defaults.dead_letter_retention,
            )?,
            sweep_interval: secs("TIDEPOOL_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL)?,
            sweep_budget: secs("TIDEPOOL_SWEEP_BUDGET_SECS", DEFAULT_SWEEP_BUDGET)?,
            call_timeout: secs("TIDEPOOL_CALL_TIMEOUT_SECS", Duration::from_secs(10))?,
            dispatch_concurrency: count(
                "TIDEPOOL_DISPATCH_CONCURRENCY",
                dispatch_defaults.concurrency,
            )?,
            receive_batch: count("TIDEPOOL_RECEIVE_BATCH", dispatch_defaults.receive_batch)?
                .min(10),
            receive_wait: secs("TIDEPOOL_RECEIVE_WAIT_SECS", dispatch_defaults.receive_wait)?,
            reaper_lease,
            log_level,
        })
    }

    /// Worst-case time from first capacity failure to dead-lettering.
    pub fn max_dispatch_latency(&self) -> Duration {
        self.visibility_timeout * self.max_receive_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    const REQUIRED: [(&str, &str); 3] = [
        ("TIDEPOOL_CLUSTER_ID", "batch"),
        ("TIDEPOOL_POOL_ID", "batch-pool"),
        ("TIDEPOOL_GATEWAY_URL", "http://gateway:8080"),
    ];

    #[test]
    fn test_defaults() {
        let config = load(&REQUIRED).unwrap();

        assert_eq!(config.backend, Backend::Gateway);
        assert_eq!(config.idle_timeout, Duration::from_secs(600));
        assert_eq!(config.registration_timeout, Duration::from_secs(600));
        assert_eq!(config.visibility_timeout, Duration::from_secs(60));
        assert_eq!(config.max_receive_count, 20);
        assert_eq!(config.dead_letter_retention, Duration::from_secs(1_209_600));
        assert_eq!(config.sweep_interval, Duration::from_secs(180));
        assert_eq!(config.sweep_budget, Duration::from_secs(120));
        assert_eq!(config.receive_wait, Duration::from_secs(20));
        assert_eq!(config.dispatch_concurrency, 4);
        assert!(config.reaper_lease);
        assert_eq!(config.max_dispatch_latency(), Duration::from_secs(1200));
    }

    #[test]
    fn test_missing_cluster_id() {
        let err = load(&[("TIDEPOOL_POOL_ID", "p")]).unwrap_err();
        assert!(err.to_string().contains("TIDEPOOL_CLUSTER_ID"));
    }

    #[test]
    fn test_gateway_backend_needs_url() {
        let err = load(&[("TIDEPOOL_CLUSTER_ID", "c"), ("TIDEPOOL_POOL_ID", "p")]).unwrap_err();
        assert!(err.to_string().contains("TIDEPOOL_GATEWAY_URL"));
    }

    #[test]
    fn test_simulated_backend_needs_no_url() {
        let config = load(&[
            ("TIDEPOOL_CLUSTER_ID", "c"),
            ("TIDEPOOL_POOL_ID", "p"),
            ("TIDEPOOL_BACKEND", "simulated"),
        ])
        .unwrap();
        assert_eq!(config.backend, Backend::Simulated);
    }

    #[test]
    fn test_zero_values_are_rejected() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("TIDEPOOL_MAX_RECEIVE_COUNT", "0"));
        assert!(load(&vars).is_err());

        let mut vars = REQUIRED.to_vec();
        vars.push(("TIDEPOOL_IDLE_TIMEOUT_SECS", "0"));
        assert!(load(&vars).is_err());
    }

    #[test]
    fn test_non_numeric_value_is_rejected() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("TIDEPOOL_VISIBILITY_TIMEOUT_SECS", "soon"));
        let err = load(&vars).unwrap_err();
        assert!(err.to_string().contains("TIDEPOOL_VISIBILITY_TIMEOUT_SECS"));
    }

    #[test]
    fn test_lease_can_be_disabled() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("TIDEPOOL_REAPER_LEASE", "false"));
        assert!(!load(&vars).unwrap().reaper_lease);
    }
}
