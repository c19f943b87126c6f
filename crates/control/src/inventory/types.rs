use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::QueryMode;

/// An agent host. Its id is the agent id jobs are addressed to.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Node {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Address probes and external clients use to reach instances on this node.
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_scan_interval")]
    pub disk_scan_interval_secs: u64,
    #[serde(default = "default_scan_interval")]
    pub disk_stat_interval_secs: u64,
    #[serde(default)]
    pub last_disk_stat_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub disk_used_bytes: Option<u64>,
    #[serde(default)]
    pub disk_total_bytes: Option<u64>,
    /// Ports the agent last reported open.
    #[serde(default)]
    pub firewall_open_ports: BTreeSet<u16>,
    /// Bumped whenever the observed firewall set changes.
    #[serde(default)]
    pub firewall_revision: u64,
    #[serde(default)]
    pub last_error: Option<String>,
}

fn default_scan_interval() -> u64 {
    3600
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Installing,
    Running,
    Stopped,
    /// Administrative hold, e.g. after disk enforcement. Only an operator lifts it.
    Suspended,
    Error,
}

/// Disk pressure tier derived from used/limit bytes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiskState {
    #[default]
    Ok,
    Warning,
    Blocked,
}

impl DiskState {
    pub fn as_str(self) -> &'static str {
        match self {
            DiskState::Ok => "ok",
            DiskState::Warning => "warning",
            DiskState::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceQuery {
    /// Protocol name, e.g. "a2s", "rcon", "http" or "none".
    #[serde(default = "default_query_type")]
    pub query_type: String,
    /// Overrides the control plane's default mode for this instance.
    #[serde(default)]
    pub mode: Option<QueryMode>,
    #[serde(default)]
    pub http_path: Option<String>,
    #[serde(default)]
    pub rcon_password: Option<String>,
    #[serde(default)]
    pub rcon_command: Option<String>,
}

fn default_query_type() -> String {
    "none".to_string()
}

impl Default for InstanceQuery {
    fn default() -> Self {
        Self {
            query_type: default_query_type(),
            mode: None,
            http_path: None,
            rcon_password: None,
            rcon_command: None,
        }
    }
}

/// Last known live status of an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct QueryCache {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub players: Option<u32>,
    #[serde(default)]
    pub max_players: Option<u32>,
    #[serde(default)]
    pub checked_at: Option<DateTime<Utc>>,
    /// Set while a probe job is outstanding.
    #[serde(default)]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub node_id: String,
    #[serde(default)]
    pub name: String,
    pub status: InstanceStatus,
    #[serde(default)]
    pub disk_limit_bytes: u64,
    #[serde(default)]
    pub disk_used_bytes: u64,
    #[serde(default)]
    pub disk_state: DiskState,
    #[serde(default)]
    pub disk_state_changed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_disk_scan_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub port_block_id: Option<String>,
    /// Port roles in block order, e.g. ["game", "query", "rcon"].
    #[serde(default)]
    pub required_ports: Vec<String>,
    #[serde(default)]
    pub query: InstanceQuery,
    #[serde(default)]
    pub query_cache: QueryCache,
    #[serde(default)]
    pub last_backup_at: Option<DateTime<Utc>>,
    /// Creation time of the newest lifecycle job whose result was applied.
    #[serde(default)]
    pub last_applied_job_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Instance {
    pub fn new(id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_id: node_id.into(),
            name: String::new(),
            status: InstanceStatus::Stopped,
            disk_limit_bytes: 0,
            disk_used_bytes: 0,
            disk_state: DiskState::Ok,
            disk_state_changed_at: None,
            last_disk_scan_at: None,
            port_block_id: None,
            required_ports: Vec::new(),
            query: InstanceQuery::default(),
            query_cache: QueryCache::default(),
            last_backup_at: None,
            last_applied_job_at: None,
            last_error: None,
        }
    }
}

/// Contiguous set of ports reserved on a node, optionally bound to an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortBlock {
    pub id: String,
    pub node_id: String,
    #[serde(default)]
    pub instance_id: Option<String>,
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstallStatus {
    #[default]
    Pending,
    Installing,
    Installed,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    #[default]
    Unknown,
    Running,
    Stopped,
    Error,
}

/// Voice server installation on an agent.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VoiceNode {
    pub id: String,
    pub agent_id: String,
    #[serde(default)]
    pub install_status: InstallStatus,
    #[serde(default)]
    pub service_status: ServiceStatus,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub query_port: Option<u16>,
    /// Creation time of the newest lifecycle job whose result was applied.
    #[serde(default)]
    pub last_applied_job_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum VirtualServerStatus {
    #[default]
    Creating,
    Running,
    Stopped,
    Deleted,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinToken {
    pub token: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VirtualServer {
    pub id: String,
    pub voice_node_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub sid: Option<u32>,
    #[serde(default)]
    pub voice_port: Option<u16>,
    #[serde(default)]
    pub status: VirtualServerStatus,
    #[serde(default)]
    pub tokens: Vec<JoinToken>,
    /// Creation time of the newest lifecycle job whose result was applied.
    #[serde(default)]
    pub last_applied_job_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl VirtualServer {
    pub fn active_token(&self) -> Option<&JoinToken> {
        self.tokens.iter().find(|t| t.active)
    }

    /// Make `token` the single active token. A token already on record, active or
    /// retired, is never reactivated, so replayed or late results change nothing.
    pub fn rotate_token(&mut self, token: &str, now: DateTime<Utc>) -> bool {
        if self.tokens.iter().any(|t| t.token == token) {
            return false;
        }
        self.deactivate_tokens();
        self.tokens.push(JoinToken { token: token.to_string(), active: true, created_at: now });
        true
    }

    pub fn deactivate_tokens(&mut self) {
        for t in self.tokens.iter_mut() {
            t.active = false;
        }
    }
}

/// Music bot installation on an agent.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BotNode {
    pub id: String,
    pub agent_id: String,
    #[serde(default)]
    pub install_status: InstallStatus,
    #[serde(default)]
    pub service_status: ServiceStatus,
    #[serde(default)]
    pub version: Option<String>,
    /// Creation time of the newest lifecycle job whose result was applied.
    #[serde(default)]
    pub last_applied_job_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SshKeyStatus {
    #[default]
    Pending,
    Provisioned,
    Revoked,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SshKey {
    pub id: String,
    pub agent_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub status: SshKeyStatus,
    /// Creation time of the newest lifecycle job whose result was applied.
    #[serde(default)]
    pub last_applied_job_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleAction {
    Start,
    Stop,
    Restart,
    Update,
    Backup,
}

impl ScheduleAction {
    pub fn job_type(self) -> &'static str {
        match self {
            ScheduleAction::Start => "instance.start",
            ScheduleAction::Stop => "instance.stop",
            ScheduleAction::Restart => "instance.restart",
            ScheduleAction::Update => "instance.update",
            ScheduleAction::Backup => "instance.backup.create",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub instance_id: String,
    pub action: ScheduleAction,
    /// Crontab expression; 5 fields, or 6/7 with seconds.
    pub cron: String,
    /// IANA zone name the expression is evaluated in.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub last_queued_at: Option<DateTime<Utc>>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_true() -> bool {
    true
}

/// External server whose reachability is probed by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusCheck {
    pub id: String,
    pub agent_id: String,
    pub host: String,
    pub port: u16,
    pub interval_secs: u64,
    #[serde(default)]
    pub next_check_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_status: Option<String>,
    #[serde(default)]
    pub last_latency_ms: Option<u64>,
    #[serde(default)]
    pub last_checked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}
