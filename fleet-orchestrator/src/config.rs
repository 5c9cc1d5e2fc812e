use anyhow::{Context, Result};
use fleet_common::LifecycleOperation;
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::poller::PollSpec;
use crate::retry_client::RetryPolicy;

pub const DEFAULT_METADATA_URL: &str = "http://169.254.169.254/v1/instance-v2-id";
pub const DEFAULT_VULTR_API_URL: &str = "https://api.vultr.com/v2";

/// Convergence budget per lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OperationTimeouts {
    pub create: PollSpec,
    pub start: PollSpec,
    pub stop: PollSpec,
    pub destroy: PollSpec,
    pub snapshot: PollSpec,
}

impl OperationTimeouts {
    pub fn for_operation(&self, op: LifecycleOperation) -> PollSpec {
        match op {
            LifecycleOperation::Create => self.create,
            LifecycleOperation::Start => self.start,
            LifecycleOperation::Stop => self.stop,
            LifecycleOperation::Destroy => self.destroy,
            LifecycleOperation::Snapshot => self.snapshot,
        }
    }
}

impl Default for OperationTimeouts {
    fn default() -> Self {
        let spec = |interval, timeout| PollSpec {
            interval: Duration::from_secs(interval),
            timeout: Duration::from_secs(timeout),
        };
        Self {
            create: spec(10, 20 * 60),
            start: spec(5, 5 * 60),
            stop: spec(5, 5 * 60),
            // The provider may hold a deletion while a snapshot is in progress.
            destroy: spec(10, 30 * 60),
            snapshot: spec(15, 30 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdentityConfig {
    pub metadata_url: String,
    pub probe_timeout: Duration,
    pub override_id: Option<String>,
    /// Let Destroy proceed when the host identity cannot be resolved.
    pub allow_unresolved: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            metadata_url: DEFAULT_METADATA_URL.to_string(),
            probe_timeout: Duration::from_secs(3),
            override_id: None,
            allow_unresolved: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub provider: String,
    pub vultr_api_url: String,
    pub vultr_api_key: Option<String>,
    pub default_plan: String,
    pub retry: RetryPolicy,
    pub timeouts: OperationTimeouts,
    pub identity: IdentityConfig,
    pub admin_user_ids: HashSet<String>,
    pub registry_file: Option<PathBuf>,
    pub reconcile_interval: Option<Duration>,
    pub listen_addr: SocketAddr,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            provider: "vultr".to_string(),
            vultr_api_url: DEFAULT_VULTR_API_URL.to_string(),
            vultr_api_key: None,
            default_plan: "vc2-1c-1gb".to_string(),
            retry: RetryPolicy::default(),
            timeouts: OperationTimeouts::default(),
            identity: IdentityConfig::default(),
            admin_user_ids: HashSet::new(),
            registry_file: None,
            reconcile_interval: Some(Duration::from_secs(60)),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8001)),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key/value source; unset keys keep
    /// their defaults, malformed values are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut cfg = Self::default();

        if let Some(p) = get("PROVIDER") {
            cfg.provider = p.to_ascii_lowercase();
        }
        if let Some(url) = get("VULTR_API_URL") {
            cfg.vultr_api_url = url;
        }
        // Prefer *_FILE for secrets (Docker/K8s friendly), fallback to env var.
        cfg.vultr_api_key = match get("VULTR_API_KEY_FILE") {
            Some(path) => Some(
                fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read VULTR_API_KEY_FILE {}", path))?
                    .trim()
                    .to_string(),
            ),
            None => get("VULTR_API_KEY"),
        };
        if let Some(plan) = get("FLEET_DEFAULT_PLAN") {
            cfg.default_plan = plan;
        }

        if let Some(n) = parse::<u32>(&get, "RETRY_MAX_RETRIES")? {
            cfg.retry.max_retries = n;
        }
        if let Some(ms) = parse::<u64>(&get, "RETRY_INITIAL_DELAY_MS")? {
            cfg.retry.initial_delay = Duration::from_millis(ms);
        }
        if let Some(m) = parse::<f64>(&get, "RETRY_BACKOFF_MULTIPLIER")? {
            anyhow::ensure!(
                m.is_finite() && m >= 1.0,
                "RETRY_BACKOFF_MULTIPLIER must be >= 1.0, got {}",
                m
            );
            cfg.retry.backoff_multiplier = m;
        }
        if let Some(s) = parse::<u64>(&get, "RETRY_ATTEMPT_TIMEOUT_SECS")? {
            cfg.retry.attempt_timeout = Duration::from_secs(s);
        }

        for (name, spec) in [
            ("CREATE", &mut cfg.timeouts.create),
            ("START", &mut cfg.timeouts.start),
            ("STOP", &mut cfg.timeouts.stop),
            ("DESTROY", &mut cfg.timeouts.destroy),
            ("SNAPSHOT", &mut cfg.timeouts.snapshot),
        ] {
            if let Some(s) = parse::<u64>(&get, &format!("POLL_{}_TIMEOUT_SECS", name))? {
                spec.timeout = Duration::from_secs(s);
            }
            if let Some(s) = parse::<u64>(&get, &format!("POLL_{}_INTERVAL_SECS", name))? {
                anyhow::ensure!(s > 0, "POLL_{}_INTERVAL_SECS must be > 0", name);
                spec.interval = Duration::from_secs(s);
            }
        }

        if let Some(url) = get("SELF_METADATA_URL") {
            cfg.identity.metadata_url = url;
        }
        if let Some(s) = parse::<u64>(&get, "SELF_METADATA_TIMEOUT_SECS")? {
            cfg.identity.probe_timeout = Duration::from_secs(s);
        }
        cfg.identity.override_id = get("SELF_HOST_ID");
        if let Some(b) = parse_bool(&get, "ALLOW_UNRESOLVED_SELF_HOST")? {
            cfg.identity.allow_unresolved = b;
        }

        if let Some(ids) = get("FLEET_ADMIN_USER_IDS") {
            cfg.admin_user_ids = ids
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        cfg.registry_file = get("REGISTRY_FILE").map(PathBuf::from);
        if let Some(s) = parse::<u64>(&get, "RECONCILE_INTERVAL_SECS")? {
            cfg.reconcile_interval = (s > 0).then(|| Duration::from_secs(s));
        }
        if let Some(addr) = parse::<SocketAddr>(&get, "ADMIN_LISTEN_ADDR")? {
            cfg.listen_addr = addr;
        }

        Ok(cfg)
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid {}='{}': {}", key, raw, e)),
    }
}

fn parse_bool(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>> {
    match get(key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(None),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => anyhow::bail!("invalid {}='{}': expected a boolean", key, v),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let cfg = OrchestratorConfig::from_lookup(|_| None).unwrap();
        assert_eq!(cfg.provider, "vultr");
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.timeouts.destroy.timeout, Duration::from_secs(1800));
        assert!(!cfg.identity.allow_unresolved);
        assert_eq!(cfg.identity.override_id, None);
        assert_eq!(cfg.reconcile_interval, Some(Duration::from_secs(60)));
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = OrchestratorConfig::from_lookup(lookup(&[
            ("PROVIDER", "Mock"),
            ("RETRY_MAX_RETRIES", "5"),
            ("RETRY_INITIAL_DELAY_MS", "250"),
            ("RETRY_BACKOFF_MULTIPLIER", "3"),
            ("POLL_START_TIMEOUT_SECS", "60"),
            ("POLL_START_INTERVAL_SECS", "2"),
            ("SELF_HOST_ID", " host-1 "),
            ("ALLOW_UNRESOLVED_SELF_HOST", "yes"),
            ("FLEET_ADMIN_USER_IDS", "u1, u2,,"),
            ("RECONCILE_INTERVAL_SECS", "0"),
            ("ADMIN_LISTEN_ADDR", "127.0.0.1:9000"),
        ]))
        .unwrap();
        assert_eq!(cfg.provider, "mock");
        assert_eq!(cfg.retry.max_retries, 5);
        assert_eq!(cfg.retry.initial_delay, Duration::from_millis(250));
        assert_eq!(cfg.retry.backoff_multiplier, 3.0);
        assert_eq!(cfg.timeouts.start.timeout, Duration::from_secs(60));
        assert_eq!(cfg.timeouts.start.interval, Duration::from_secs(2));
        assert_eq!(cfg.identity.override_id.as_deref(), Some("host-1"));
        assert!(cfg.identity.allow_unresolved);
        assert_eq!(cfg.admin_user_ids.len(), 2);
        assert!(cfg.admin_user_ids.contains("u2"));
        assert_eq!(cfg.reconcile_interval, None);
        assert_eq!(cfg.listen_addr.port(), 9000);
    }

    #[test]
    fn malformed_values_are_errors() {
        assert!(OrchestratorConfig::from_lookup(lookup(&[("RETRY_MAX_RETRIES", "many")])).is_err());
        assert!(
            OrchestratorConfig::from_lookup(lookup(&[("RETRY_BACKOFF_MULTIPLIER", "0.5")]))
                .is_err()
        );
        assert!(
            OrchestratorConfig::from_lookup(lookup(&[("ALLOW_UNRESOLVED_SELF_HOST", "maybe")]))
                .is_err()
        );
        assert!(
            OrchestratorConfig::from_lookup(lookup(&[("POLL_STOP_INTERVAL_SECS", "0")])).is_err()
        );
    }

    #[test]
    fn api_key_file_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");
        std::fs::write(&path, "from-file\n").unwrap();
        let path_str = path.to_string_lossy().to_string();

        let cfg = OrchestratorConfig::from_lookup(lookup(&[
            ("VULTR_API_KEY_FILE", path_str.as_str()),
            ("VULTR_API_KEY", "from-env"),
        ]))
        .unwrap();
        assert_eq!(cfg.vultr_api_key.as_deref(), Some("from-file"));
    }
}
