use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Resolve the control plane data directory in a platform-appropriate location.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir().unwrap_or(std::env::temp_dir()).join("fleet-control")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    /// Probe jobs are dispatched to the instance's agent.
    Agent,
    /// The control plane runs the protocol adapter inline.
    Backend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub data_dir: PathBuf,
    pub bind: String,
    /// Lease length handed to agents on claim. Not negotiable per job.
    pub lease_secs: u64,
    /// Claims after which an expired lease fails the job instead of requeueing it.
    pub max_attempts: u32,
    pub reconcile: ReconcileConfig,
    pub disk: DiskConfig,
    pub query: QueryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub firewall_secs: u64,
    pub disk_secs: u64,
    pub disk_scan_secs: u64,
    pub schedule_secs: u64,
    pub status_secs: u64,
    pub lease_sweep_secs: u64,
    pub max_scan_items_per_pass: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    /// used/limit ratio at which an instance enters the warning tier
    pub warn_ratio: f64,
    /// used/limit ratio at which an instance is blocked and stopped
    pub block_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub fresh_ttl_secs: u64,
    pub queue_cooldown_secs: u64,
    pub probe_timeout_ms: u64,
    pub mode: QueryMode,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            bind: "127.0.0.1:8480".to_string(),
            lease_secs: 300,
            max_attempts: 5,
            reconcile: ReconcileConfig::default(),
            disk: DiskConfig::default(),
            query: QueryConfig::default(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            firewall_secs: 60,
            disk_secs: 60,
            disk_scan_secs: 300,
            schedule_secs: 60,
            status_secs: 30,
            lease_sweep_secs: 30,
            max_scan_items_per_pass: 200,
        }
    }
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self { warn_ratio: 0.9, block_ratio: 1.0 }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            fresh_ttl_secs: 15,
            queue_cooldown_secs: 12,
            probe_timeout_ms: 2000,
            mode: QueryMode::Agent,
        }
    }
}

impl ControlConfig {
    /// Load from an explicit path, else `control.toml` in the data dir, else defaults.
    /// Environment variables override file values.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::read_file(p)?,
            None => {
                let candidate = data_dir_from_env()
                    .unwrap_or_else(default_data_dir)
                    .join("control.toml");
                if candidate.exists() {
                    Self::read_file(&candidate)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(dir) = data_dir_from_env() {
            self.data_dir = dir;
        }
        if let Ok(bind) = std::env::var("FLEET_BIND") {
            self.bind = bind;
        }
        if let Ok(v) = std::env::var("FLEET_LEASE_SECS") {
            self.lease_secs = v
                .parse()
                .map_err(|_| ConfigError::InvalidValue { key: "FLEET_LEASE_SECS", value: v.clone() })?;
        }
        if let Ok(v) = std::env::var("FLEET_QUERY_MODE") {
            self.query.mode = match v.to_lowercase().as_str() {
                "agent" => QueryMode::Agent,
                "backend" => QueryMode::Backend,
                _ => return Err(ConfigError::InvalidValue { key: "FLEET_QUERY_MODE", value: v }),
            };
        }
        Ok(())
    }

    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_secs as i64)
    }
}

fn data_dir_from_env() -> Option<PathBuf> {
    std::env::var("FLEET_DATA_DIR")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
}
