use std::net::SocketAddr;
use std::time::Duration;

use crate::model::Resource;

pub const DEFAULT_STORE_ADDR: &str = "127.0.0.1:2379";

/// Configuration for Docker-based job execution.
///
/// Applied to every `DOCKER` job on top of what the job itself asks for.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Image used when the job does not name one
    pub image: String,
    /// Disable network access in container
    pub network_disabled: bool,
    /// Memory limit (e.g., "256m")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "0.5" for half a CPU)
    pub cpu_limit: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "alpine:latest".to_string(),
            network_disabled: true,
            memory_limit: Some("256m".to_string()),
            cpu_limit: Some("0.5".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub listen_addr: SocketAddr,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: DEFAULT_STORE_ADDR
                .parse()
                .expect("default store address is valid"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Scheduling attempts allowed to run at once
    pub max_concurrent_binds: usize,
    /// Rounds of snapshot/filter/score/bind per attempt before giving up
    pub bind_attempts: usize,
    pub reconcile_interval_ms: u64,
    pub reap_interval_ms: u64,
    /// A node silent for longer than this is marked offline
    pub node_timeout_ms: u64,
    pub store_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_binds: 64,
            bind_attempts: 5,
            reconcile_interval_ms: 5000,
            reap_interval_ms: 2000,
            node_timeout_ms: 10_000,
            store_timeout_ms: 3000,
        }
    }
}

impl SchedulerConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub node_id: String,
    /// Address reported in the node record
    pub address: String,
    pub version: String,
    pub capacity: Resource,
    pub heartbeat_interval_ms: u64,
    pub max_concurrent_jobs: usize,
    /// First retry delay; doubles per attempt
    pub retry_backoff_ms: u64,
    pub retry_backoff_max_ms: u64,
    pub store_timeout_ms: u64,
    pub sandbox: SandboxConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            address: "127.0.0.1".to_string(),
            version: concat!("v", env!("CARGO_PKG_VERSION")).to_string(),
            capacity: Resource::new(4000, 8 * 1024 * 1024 * 1024),
            heartbeat_interval_ms: 3000,
            max_concurrent_jobs: 16,
            retry_backoff_ms: 1000,
            retry_backoff_max_ms: 30_000,
            store_timeout_ms: 3000,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn new(node_id: impl Into<String>, capacity: Resource) -> Self {
        Self {
            node_id: node_id.into(),
            capacity,
            ..Default::default()
        }
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let ms = self
            .retry_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.retry_backoff_max_ms);
        Duration::from_millis(ms)
    }
}

/// Hostname from the environment, or a fixed fallback.
pub fn default_node_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "worker-node-01".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_config_default() {
        let cfg = SandboxConfig::default();
        assert_eq!(cfg.image, "alpine:latest");
        assert!(cfg.network_disabled);
        assert_eq!(cfg.memory_limit.as_deref(), Some("256m"));
        assert_eq!(cfg.cpu_limit.as_deref(), Some("0.5"));
    }

    #[test]
    fn store_config_default() {
        let cfg = StoreConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), DEFAULT_STORE_ADDR);
    }

    #[test]
    fn scheduler_config_default() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.bind_attempts, 5);
        assert_eq!(cfg.store_timeout(), Duration::from_secs(3));
        assert!(cfg.node_timeout_ms > cfg.reap_interval_ms);
    }

    #[test]
    fn agent_config_default() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.heartbeat_interval_ms, 3000);
        assert_eq!(cfg.capacity, Resource::new(4000, 8 * 1024 * 1024 * 1024));
        assert!(!cfg.node_id.is_empty());
        assert!(cfg.version.starts_with('v'));
    }

    #[test]
    fn agent_config_new() {
        let cfg = AgentConfig::new("node-7", Resource::new(1000, 2048));
        assert_eq!(cfg.node_id, "node-7");
        assert_eq!(cfg.capacity, Resource::new(1000, 2048));
        assert_eq!(cfg.heartbeat_interval_ms, 3000);
    }

    #[test]
    fn retry_delay_doubles_up_to_cap() {
        let cfg = AgentConfig {
            retry_backoff_ms: 100,
            retry_backoff_max_ms: 1000,
            ..AgentConfig::default()
        };
        assert_eq!(cfg.retry_delay(1), Duration::from_millis(100));
        assert_eq!(cfg.retry_delay(2), Duration::from_millis(200));
        assert_eq!(cfg.retry_delay(4), Duration::from_millis(800));
        assert_eq!(cfg.retry_delay(5), Duration::from_millis(1000));
        assert_eq!(cfg.retry_delay(64), Duration::from_millis(1000));
    }
}
