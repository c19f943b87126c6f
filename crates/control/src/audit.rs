//! Append-only audit trail. Each event carries the hash of its predecessor, so
//! tampering with an earlier entry breaks every later hash.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use common::{canonical_json, sha256_hex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::persist::{load_json, save_json};

pub type Detail = BTreeMap<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub id: String,
    /// None for system-initiated events.
    pub actor: Option<String>,
    pub event: String,
    pub detail: Detail,
    pub at: DateTime<Utc>,
    pub prev_hash: Option<String>,
    pub hash: String,
}

/// Hash of an event chained onto `prev`.
pub fn next_hash(prev: Option<&str>, actor: Option<&str>, event: &str, detail: &Detail, at: DateTime<Utc>) -> String {
    let material = format!(
        "{}|{}|{}|{}|{}",
        prev.unwrap_or(""),
        actor.unwrap_or(""),
        event,
        canonical_json(detail),
        at.to_rfc3339()
    );
    sha256_hex(material.as_bytes())
}

/// Index of the first event whose hash does not match its content or predecessor.
pub fn verify_chain(events: &[AuditEvent]) -> Result<(), usize> {
    let mut prev: Option<&str> = None;
    for (i, ev) in events.iter().enumerate() {
        if ev.prev_hash.as_deref() != prev {
            return Err(i);
        }
        let expected = next_hash(prev, ev.actor.as_deref(), &ev.event, &ev.detail, ev.at);
        if expected != ev.hash {
            return Err(i);
        }
        prev = Some(ev.hash.as_str());
    }
    Ok(())
}

pub struct AuditLog {
    events: Mutex<Vec<AuditEvent>>,
    data_dir: Option<PathBuf>,
}

impl AuditLog {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { events: Mutex::new(Vec::new()), data_dir: Some(data_dir) }
    }

    pub fn in_memory() -> Self {
        Self { events: Mutex::new(Vec::new()), data_dir: None }
    }

    fn state_file(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("audit.json"))
    }

    pub async fn load_from_disk(&self) -> Result<(), StoreError> {
        let Some(path) = self.state_file() else { return Ok(()) };
        if let Some(loaded) = load_json::<Vec<AuditEvent>>(&path).await? {
            *self.events.lock().await = loaded;
        }
        Ok(())
    }

    /// Append a system event (actor = None).
    pub async fn record(&self, event: &str, detail: Detail, now: DateTime<Utc>) -> Result<AuditEvent, StoreError> {
        let mut events = self.events.lock().await;
        // latest hash is read under the same lock the append happens in
        let prev = events.last().map(|e| e.hash.clone());
        let hash = next_hash(prev.as_deref(), None, event, &detail, now);
        let entry = AuditEvent {
            id: uuid::Uuid::new_v4().to_string(),
            actor: None,
            event: event.to_string(),
            detail,
            at: now,
            prev_hash: prev,
            hash,
        };
        events.push(entry.clone());
        if let Some(path) = self.state_file() {
            if let Err(e) = save_json(&path, &*events).await {
                warn!(error=%e, event=%entry.event, "Failed to save audit log, event dropped");
                events.pop();
                return Err(e);
            }
        }
        debug!(event=%entry.event, hash=%entry.hash, "audit event recorded");
        Ok(entry)
    }

    /// Most recent events, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        let events = self.events.lock().await;
        events.iter().rev().take(limit).cloned().collect()
    }

    pub async fn all(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }

    pub async fn verify(&self) -> Result<(), usize> {
        verify_chain(&self.events.lock().await)
    }
}

/// Build a detail map from key/value pairs.
pub fn detail<const N: usize>(pairs: [(&str, Value); N]) -> Detail {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}
