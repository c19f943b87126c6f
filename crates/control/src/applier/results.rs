//! Typed views over agent output maps. Every field is decoded on its own, so a
//! missing or mistyped field becomes `None` without discarding the rest.

use common::Output;
use serde::de::DeserializeOwned;

pub fn field<T: DeserializeOwned>(output: &Output, key: &str) -> Option<T> {
    output
        .get(key)
        .filter(|v| !v.is_null())
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

#[derive(Debug, Default, PartialEq)]
pub struct NodeResult {
    pub version: Option<String>,
    pub query_port: Option<u16>,
}

impl NodeResult {
    pub fn from_output(output: &Output) -> Self {
        Self { version: field(output, "version"), query_port: field(output, "query_port") }
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct VirtualServerResult {
    pub sid: Option<u32>,
    pub token: Option<String>,
    pub voice_port: Option<u16>,
}

impl VirtualServerResult {
    pub fn from_output(output: &Output) -> Self {
        Self {
            sid: field(output, "sid"),
            token: field(output, "token"),
            voice_port: field(output, "voice_port"),
        }
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct SshKeyResult {
    pub fingerprint: Option<String>,
}

impl SshKeyResult {
    pub fn from_output(output: &Output) -> Self {
        Self { fingerprint: field(output, "fingerprint") }
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct QueryResult {
    pub status: Option<String>,
    pub players: Option<u32>,
    pub max_players: Option<u32>,
}

impl QueryResult {
    pub fn from_output(output: &Output) -> Self {
        Self {
            status: field(output, "status"),
            players: field(output, "players"),
            max_players: field(output, "max_players"),
        }
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct DiskUsageResult {
    pub used_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
}

impl DiskUsageResult {
    pub fn from_output(output: &Output) -> Self {
        Self { used_bytes: field(output, "used_bytes"), total_bytes: field(output, "total_bytes") }
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct FirewallResult {
    /// Full set of ports the agent reports open after the change.
    pub open_ports: Option<Vec<u16>>,
}

impl FirewallResult {
    pub fn from_output(output: &Output) -> Self {
        Self { open_ports: field(output, "open_ports") }
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct StatusCheckResult {
    pub status: Option<String>,
    pub latency_ms: Option<u64>,
}

impl StatusCheckResult {
    pub fn from_output(output: &Output) -> Self {
        Self { status: field(output, "status"), latency_ms: field(output, "latency_ms") }
    }
}
