//! `fleetwatch.toml` configuration. Every field has a default, so an empty
//! file (or no file) yields a runnable local setup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::IngestConfig;

pub const CONFIG_FILENAME: &str = "fleetwatch.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub ingest: IngestSection,
    pub escalation: EscalationConfig,
    pub workflow: WorkflowConfig,
    pub gateway: GatewayConfig,
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Emit logs as JSON lines.
    pub json_logs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            json_logs: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSection {
    pub concurrency: usize,
    pub region: String,
    pub retention_days: u64,
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            concurrency: 16,
            region: "us-east-1".to_string(),
            retention_days: 90,
        }
    }
}

impl IngestSection {
    pub fn to_ingest_config(&self) -> IngestConfig {
        IngestConfig {
            concurrency: self.concurrency.max(1),
            region: self.region.clone(),
            retention: Duration::from_secs(self.retention_days * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub timeout_ms: u64,
    /// Width of the time bucket in the dedup key.
    pub dedup_window_ms: i64,
    /// How long the in-process queue remembers a dedup key.
    pub dedup_interval_secs: u64,
    /// Post escalations to this URL instead of the in-process queue.
    pub queue_url: Option<String>,
    /// Whether the HTTP queue honours dedup ids.
    pub queue_dedup: bool,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            dedup_window_ms: 10_000,
            dedup_interval_secs: 300,
            queue_url: None,
            queue_dedup: true,
        }
    }
}

impl EscalationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn dedup_interval(&self) -> Duration {
        Duration::from_secs(self.dedup_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Workflow engine start-execution endpoint. Executions are only logged
    /// when unset.
    pub url: Option<String>,
    pub timeout_ms: u64,
    pub max_attempts: u32,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: 10_000,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Management endpoint of an external WebSocket gateway. Sockets served by
    /// this process are used when unset.
    pub endpoint: Option<String>,
    pub timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: 3_000,
        }
    }
}

pub const DEFAULT_SNAPSHOT_FILENAME: &str = "fleetwatch-connections.json";

/// Connection registry persistence. On by default so subscriptions survive a
/// restart; `persist = false` keeps the registry in memory only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub persist: bool,
    pub snapshot_path: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            persist: true,
            snapshot_path: PathBuf::from(DEFAULT_SNAPSHOT_FILENAME),
        }
    }
}

impl RegistryConfig {
    pub fn snapshot(&self) -> Option<&Path> {
        self.persist.then_some(self.snapshot_path.as_path())
    }
}

impl AppConfig {
    /// Load from `path`, or defaults when `path` is `None` and no
    /// `fleetwatch.toml` exists in the working directory.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => load_config_from_path(path),
            None if Path::new(CONFIG_FILENAME).exists() => load_config_from_path(CONFIG_FILENAME),
            None => Ok(Self::default()),
        }
    }
}

pub fn load_config_from_path(path: impl AsRef<Path>) -> Result<AppConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.ingest.region, "us-east-1");
        assert_eq!(config.escalation.dedup_window_ms, 10_000);
        assert_eq!(config.escalation.dedup_interval(), Duration::from_secs(300));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let toml = r#"
[server]
listen = "0.0.0.0:9000"

[escalation]
queue_url = "http://queue.local/escalations"

[registry]
snapshot_path = "/var/lib/fleetwatch/connections.json"
"#;
        let config: AppConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.listen.port(), 9000);
        assert!(!config.server.json_logs);
        assert_eq!(
            config.escalation.queue_url.as_deref(),
            Some("http://queue.local/escalations")
        );
        assert_eq!(config.escalation.timeout_ms, 5_000);
        assert_eq!(
            config.registry.snapshot(),
            Some(Path::new("/var/lib/fleetwatch/connections.json"))
        );
        assert!(config.workflow.url.is_none());
    }

    #[test]
    fn registry_persists_by_default() {
        let config = AppConfig::default();
        assert_eq!(
            config.registry.snapshot(),
            Some(Path::new(DEFAULT_SNAPSHOT_FILENAME))
        );

        let config: AppConfig = toml::from_str("[registry]\npersist = false\n").unwrap();
        assert_eq!(config.registry.snapshot(), None);
    }

    #[test]
    fn retention_days_become_a_duration() {
        let section = IngestSection {
            retention_days: 2,
            concurrency: 0,
            ..Default::default()
        };
        let ingest = section.to_ingest_config();
        assert_eq!(ingest.retention, Duration::from_secs(2 * 86_400));
        assert_eq!(ingest.concurrency, 1);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        std::fs::write(&path, "[ingest]\nconcurrency = 4\n").unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.ingest.concurrency, 4);
    }

    #[test]
    fn load_missing_file_fails() {
        assert!(load_config_from_path("/nonexistent/fleetwatch.toml").is_err());
    }

    #[test]
    fn unknown_types_are_rejected() {
        assert!(toml::from_str::<AppConfig>("[ingest]\nconcurrency = \"many\"\n").is_err());
    }
}
