use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Configuration for `cmd.run` shell execution on a minion.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Shell used as `<shell> -c <command>`
    pub shell: PathBuf,
    /// Working directory for commands (inherits the minion's when unset)
    pub cwd: Option<PathBuf>,
    /// Start commands with an empty environment
    pub clear_env: bool,
    /// Kill the command after this many milliseconds
    pub timeout_ms: Option<u64>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
            cwd: None,
            clear_env: false,
            timeout_ms: None,
        }
    }
}

/// Session lifetime settings shared by master and minion.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ttl_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 60 * 60 * 1000,
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Identity the master uses on the wire
    pub id: String,
    /// Timeout applied when a job does not name one
    pub default_timeout_ms: u64,
    /// How often the sweeper closes expired jobs
    pub sweep_interval_ms: u64,
    /// How long terminal jobs stay in the registry (`keep_jobs`)
    pub retention_ms: u64,
    /// Registry capacity
    pub max_jobs: usize,
    /// Delay before the single returner retry
    pub returner_retry_delay_ms: u64,
    /// Bound of the inbound message queue
    pub inbound_queue: usize,
    /// Named compound expressions usable as `nodegroup` targets
    pub nodegroups: BTreeMap<String, String>,
    pub session: SessionConfig,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            id: "master".to_string(),
            default_timeout_ms: 5_000,
            sweep_interval_ms: 1_000,
            retention_ms: 24 * 60 * 60 * 1000,
            max_jobs: 10_000,
            returner_retry_delay_ms: 500,
            inbound_queue: 1024,
            nodegroups: BTreeMap::new(),
            session: SessionConfig::default(),
        }
    }
}

impl MasterConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_nodegroup(mut self, name: impl Into<String>, expr: impl Into<String>) -> Self {
        self.nodegroups.insert(name.into(), expr.into());
        self
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    pub fn returner_retry_delay(&self) -> Duration {
        Duration::from_millis(self.returner_retry_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MinionConfig {
    pub id: String,
    /// Identity of the master this minion answers to
    pub master_id: String,
    /// Interval between "still running" heartbeats for a job in progress
    pub heartbeat_interval_ms: u64,
    /// How far each heartbeat pushes the job deadline
    pub heartbeat_extension_ms: u64,
    /// Number of recent job ids remembered for duplicate suppression
    pub jid_queue_hwm: usize,
    pub sandbox: SandboxConfig,
    pub session: SessionConfig,
}

impl Default for MinionConfig {
    fn default() -> Self {
        Self {
            id: "minion".to_string(),
            master_id: "master".to_string(),
            heartbeat_interval_ms: 1_000,
            heartbeat_extension_ms: 3_000,
            jid_queue_hwm: 100,
            sandbox: SandboxConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl MinionConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_heartbeat(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self.heartbeat_extension_ms = interval_ms * 3;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_config_default() {
        let cfg = SandboxConfig::default();
        assert_eq!(cfg.shell, PathBuf::from("/bin/sh"));
        assert!(cfg.cwd.is_none());
        assert!(!cfg.clear_env);
        assert!(cfg.timeout_ms.is_none());
    }

    #[test]
    fn master_config_default() {
        let cfg = MasterConfig::default();
        assert_eq!(cfg.id, "master");
        assert_eq!(cfg.default_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.sweep_interval(), Duration::from_secs(1));
        assert_eq!(cfg.retention(), Duration::from_secs(24 * 60 * 60));
        assert_eq!(cfg.max_jobs, 10_000);
        assert!(cfg.nodegroups.is_empty());
        assert_eq!(cfg.session.ttl(), Duration::from_secs(3600));
    }

    #[test]
    fn master_config_with_nodegroup() {
        let cfg = MasterConfig::new("m1")
            .with_nodegroup("web", "web* or L@lb1")
            .with_nodegroup("db", "G@role:db");
        assert_eq!(cfg.id, "m1");
        assert_eq!(cfg.nodegroups.len(), 2);
        assert_eq!(cfg.nodegroups["web"], "web* or L@lb1");
    }

    #[test]
    fn minion_config_with_heartbeat() {
        let cfg = MinionConfig::new("web1").with_heartbeat(200);
        assert_eq!(cfg.id, "web1");
        assert_eq!(cfg.master_id, "master");
        assert_eq!(cfg.heartbeat_interval_ms, 200);
        assert_eq!(cfg.heartbeat_extension_ms, 600);
        assert_eq!(cfg.jid_queue_hwm, 100);
    }

    #[test]
    fn configs_deserialize_with_defaults() {
        let cfg: MasterConfig = serde_json::from_str(
            r#"{"id": "m2", "default_timeout_ms": 250, "nodegroups": {"all": "*"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.id, "m2");
        assert_eq!(cfg.default_timeout_ms, 250);
        assert_eq!(cfg.sweep_interval_ms, 1_000);
        assert_eq!(cfg.nodegroups["all"], "*");

        let cfg: MinionConfig =
            serde_json::from_str(r#"{"id": "db1", "sandbox": {"clear_env": true}}"#).unwrap();
        assert_eq!(cfg.id, "db1");
        assert!(cfg.sandbox.clear_env);
        assert_eq!(cfg.sandbox.shell, PathBuf::from("/bin/sh"));
    }
}
