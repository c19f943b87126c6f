use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Flat key -> scalar map carried by every job.
pub type Payload = BTreeMap<String, Value>;

/// Free-form output map reported by an agent.
pub type Output = BTreeMap<String, Value>;

// ===================== Job State =====================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Queued or Running.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Whether an existing job in this state satisfies a new dispatch with the same fingerprint.
    pub fn blocks_redispatch(self) -> bool {
        !matches!(self, JobStatus::Failed | JobStatus::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" | "pending" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "succeeded" | "success" | "completed" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" | "canceled" => Ok(JobStatus::Cancelled),
            other => Err(anyhow::anyhow!("unknown job status: {other}")),
        }
    }
}

/// Domain family a job type belongs to. Resolved once when the job is created
/// and stored next to the type string.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobFamily {
    VoiceNode,
    VoiceVirtual,
    BotNode,
    SshKey,
    Instance,
    Query,
    DiskScan,
    Firewall,
    StatusCheck,
    Other,
}

impl JobFamily {
    pub fn from_type(job_type: &str) -> Self {
        // order matters: more specific prefixes first
        if job_type.starts_with("ts3.virtual.") {
            JobFamily::VoiceVirtual
        } else if job_type.starts_with("ts3.") {
            JobFamily::VoiceNode
        } else if job_type.starts_with("sinusbot.") {
            JobFamily::BotNode
        } else if job_type.starts_with("ssh.key.") {
            JobFamily::SshKey
        } else if job_type == "instance.query" {
            JobFamily::Query
        } else if job_type == "instance.disk.scan" || job_type == "node.disk.stat" {
            JobFamily::DiskScan
        } else if job_type.starts_with("instance.") {
            JobFamily::Instance
        } else if job_type.starts_with("firewall.") {
            JobFamily::Firewall
        } else if job_type.starts_with("server.status.") {
            JobFamily::StatusCheck
        } else {
            JobFamily::Other
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobResult {
    pub status: JobStatus,
    #[serde(default)]
    pub output: Output,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub family: JobFamily,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub payload: Payload,
    pub idempotency_key: String,
    pub status: JobStatus,
    #[serde(default)]
    pub locked_by: Option<String>,
    #[serde(default)]
    pub lock_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<JobResult>,
    #[serde(default)]
    pub error_text: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(agent_id: Option<String>, job_type: String, payload: Payload, now: DateTime<Utc>) -> Self {
        let idempotency_key = idempotency_key(agent_id.as_deref(), &job_type, &payload);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            family: JobFamily::from_type(&job_type),
            job_type,
            agent_id,
            payload,
            idempotency_key,
            status: JobStatus::Queued,
            locked_by: None,
            lock_expires_at: None,
            result: None,
            error_text: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn claim(&mut self, agent_id: &str, lease_until: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.locked_by = Some(agent_id.to_string());
        self.lock_expires_at = Some(lease_until);
        self.attempts += 1;
        self.updated_at = now;
    }

    pub fn complete(&mut self, status: JobStatus, output: Output, now: DateTime<Utc>) {
        if status == JobStatus::Failed && self.error_text.is_none() {
            self.error_text = output
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        self.status = status;
        self.locked_by = None;
        self.lock_expires_at = None;
        self.result = Some(JobResult { status, output, completed_at: now });
        self.updated_at = now;
    }

    pub fn fail(&mut self, error: String, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.locked_by = None;
        self.lock_expires_at = None;
        self.error_text = Some(error);
        self.result = Some(JobResult { status: JobStatus::Failed, output: Output::new(), completed_at: now });
        self.updated_at = now;
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Cancelled;
        self.updated_at = now;
    }

    /// Return a Running job to the queue after its lease lapsed.
    pub fn requeue(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Queued;
        self.locked_by = None;
        self.lock_expires_at = None;
        self.updated_at = now;
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running
            && self.lock_expires_at.map(|t| t < now).unwrap_or(true)
    }

    /// Payload value as a string; numbers are rendered, other kinds are absent.
    pub fn payload_str(&self, key: &str) -> Option<String> {
        payload_str(&self.payload, key)
    }
}

pub fn payload_str(payload: &Payload, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// ===================== Fingerprints =====================

/// Stable JSON rendering: object keys sorted at every depth, no whitespace.
pub fn canonical_json(payload: &Payload) -> String {
    let obj: serde_json::Map<String, Value> = payload
        .iter()
        .map(|(k, v)| (k.clone(), canonicalize(v)))
        .collect();
    serde_json::to_string(&Value::Object(obj)).unwrap_or_default()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                out.insert(k.clone(), canonicalize(&map[k]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

pub fn idempotency_key(agent_id: Option<&str>, job_type: &str, payload: &Payload) -> String {
    let material = format!("{}:{}:{}", agent_id.unwrap_or(""), job_type, canonical_json(payload));
    sha256_hex(material.as_bytes())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut h = Sha256::new();
    h.update(bytes);
    let out = h.finalize();
    hex::encode(out)
}

// ===================== Agent API =====================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub agent_id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub payload: Payload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub agent_id: String,
}

/// Terminal outcome an agent may report.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReportedStatus {
    #[serde(alias = "succeeded", alias = "ok")]
    Success,
    #[serde(alias = "error")]
    Failed,
}

impl From<ReportedStatus> for JobStatus {
    fn from(s: ReportedStatus) -> Self {
        match s {
            ReportedStatus::Success => JobStatus::Succeeded,
            ReportedStatus::Failed => JobStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultReport {
    pub agent_id: String,
    pub status: ReportedStatus,
    #[serde(default)]
    pub output: Output,
    /// Claim attempt the result belongs to, as handed out with the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationFailure {
    pub job_type: String,
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_ignores_insertion_order() {
        let mut a = Payload::new();
        a.insert("instance_id".into(), json!("i-1"));
        a.insert("port".into(), json!(27015));
        let mut b = Payload::new();
        b.insert("port".into(), json!(27015));
        b.insert("instance_id".into(), json!("i-1"));
        assert_eq!(
            idempotency_key(Some("agent-1"), "instance.start", &a),
            idempotency_key(Some("agent-1"), "instance.start", &b)
        );
    }

    #[test]
    fn nested_maps_are_sorted() {
        let mut p = Payload::new();
        p.insert("meta".into(), json!({"z": 1, "a": {"y": 2, "b": 3}}));
        assert_eq!(canonical_json(&p), r#"{"meta":{"a":{"b":3,"y":2},"z":1}}"#);
    }

    #[test]
    fn fingerprint_depends_on_agent_and_type() {
        let p = Payload::new();
        let k1 = idempotency_key(Some("a"), "instance.start", &p);
        assert_ne!(k1, idempotency_key(Some("b"), "instance.start", &p));
        assert_ne!(k1, idempotency_key(Some("a"), "instance.stop", &p));
        assert_eq!(k1.len(), 64);
    }

    #[test]
    fn families_resolve_by_prefix() {
        assert_eq!(JobFamily::from_type("ts3.virtual.create"), JobFamily::VoiceVirtual);
        assert_eq!(JobFamily::from_type("ts3.instance.create"), JobFamily::VoiceNode);
        assert_eq!(JobFamily::from_type("sinusbot.node.install"), JobFamily::BotNode);
        assert_eq!(JobFamily::from_type("instance.query"), JobFamily::Query);
        assert_eq!(JobFamily::from_type("instance.disk.scan"), JobFamily::DiskScan);
        assert_eq!(JobFamily::from_type("instance.stop"), JobFamily::Instance);
        assert_eq!(JobFamily::from_type("billing.invoice"), JobFamily::Other);
    }

    #[test]
    fn reported_status_accepts_aliases() {
        let r: ResultReport = serde_json::from_str(r#"{"agent_id":"a","status":"succeeded"}"#).unwrap();
        assert!(r.attempt.is_none());
        assert_eq!(JobStatus::from(r.status), JobStatus::Succeeded);
        let r: ResultReport = serde_json::from_str(r#"{"agent_id":"a","status":"failed","output":{"error":"boom"}}"#).unwrap();
        assert_eq!(r.status, ReportedStatus::Failed);
    }
}
