use std::fmt;

use chrono::{DateTime, Utc};
use common::Payload;
use serde_json::json;
use tracing::{info, warn};

use super::Reconciler;
use crate::audit::detail;
use crate::config::DiskConfig;
use crate::inventory::{DiskState, InstanceStatus};

/// Tier for `used` bytes against `limit`. A zero limit means unlimited.
pub fn disk_state(used: u64, limit: u64, config: &DiskConfig) -> DiskState {
    if limit == 0 {
        return DiskState::Ok;
    }
    let ratio = used as f64 / limit as f64;
    if ratio >= config.block_ratio {
        DiskState::Blocked
    } else if ratio >= config.warn_ratio {
        DiskState::Warning
    } else {
        DiskState::Ok
    }
}

#[derive(Debug, Default)]
pub struct DiskReport {
    pub checked: usize,
    pub changed: Vec<String>,
    pub stop_jobs: Vec<String>,
    pub errors: usize,
}

impl fmt::Display for DiskReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "checked={} changed={} stop_jobs={} errors={}",
            self.checked,
            self.changed.len(),
            self.stop_jobs.len(),
            self.errors
        )
    }
}

struct Observed {
    id: String,
    node_id: String,
    used: u64,
    limit: u64,
    state: DiskState,
}

impl Reconciler {
    pub async fn enforce_disk(&self, now: DateTime<Utc>) -> DiskReport {
        let instances: Vec<Observed> = self
            .inventory
            .read(|s| {
                s.instances
                    .values()
                    .map(|i| Observed {
                        id: i.id.clone(),
                        node_id: i.node_id.clone(),
                        used: i.disk_used_bytes,
                        limit: i.disk_limit_bytes,
                        state: i.disk_state,
                    })
                    .collect()
            })
            .await;

        let mut report = DiskReport { checked: instances.len(), ..Default::default() };
        for item in instances {
            let next = disk_state(item.used, item.limit, &self.disk);
            if next == item.state {
                continue;
            }
            match self.transition(&item, next, now).await {
                Ok(stop_job) => {
                    report.changed.push(item.id.clone());
                    report.stop_jobs.extend(stop_job);
                }
                Err(e) => {
                    report.errors += 1;
                    self.item_failed("disk", &item.id, &e).await;
                }
            }
        }
        info!(%report, "disk enforcement pass");
        report
    }

    /// Persist a tier change. Entering Blocked queues the stop before the new
    /// tier is written, so a failed dispatch is retried on the next pass.
    async fn transition(&self, item: &Observed, next: DiskState, now: DateTime<Utc>) -> anyhow::Result<Option<String>> {
        let stop_job = if next == DiskState::Blocked && item.state != DiskState::Blocked {
            let mut payload = Payload::new();
            payload.insert("instance_id".into(), json!(item.id));
            payload.insert("reason".into(), json!("disk_blocked"));
            payload.insert("disk_state_changed_at".into(), json!(now.to_rfc3339()));
            let dispatched = self.dispatcher.submit(&item.node_id, "instance.stop", payload, now).await?;
            Some(dispatched.job.id)
        } else {
            None
        };

        let id = item.id.clone();
        let suspend = stop_job.is_some();
        let found = self
            .inventory
            .mutate(|s| match s.instances.get_mut(&id) {
                Some(instance) => {
                    instance.disk_state = next;
                    instance.disk_state_changed_at = Some(now);
                    if suspend {
                        instance.status = InstanceStatus::Suspended;
                    }
                    true
                }
                None => false,
            })
            .await?;
        if !found {
            anyhow::bail!("instance vanished during pass");
        }

        self.audit
            .record(
                "disk.state.changed",
                detail([
                    ("instance_id", json!(item.id)),
                    ("before", json!(item.state.as_str())),
                    ("after", json!(next.as_str())),
                    ("used_bytes", json!(item.used)),
                    ("limit_bytes", json!(item.limit)),
                ]),
                now,
            )
            .await?;
        if let Some(job_id) = &stop_job {
            warn!(instance_id=%item.id, job_id=%job_id, used=item.used, limit=item.limit, "disk limit reached, instance suspended");
            self.audit
                .record(
                    "disk.enforce.stop",
                    detail([("instance_id", json!(item.id)), ("job_id", json!(job_id))]),
                    now,
                )
                .await?;
        }
        Ok(stop_job)
    }
}
