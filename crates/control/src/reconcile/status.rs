use std::fmt;

use chrono::{DateTime, Duration, Utc};
use common::Payload;
use serde_json::json;
use tracing::info;

use super::Reconciler;
use crate::audit::detail;
use crate::error::StoreError;
use crate::inventory::StatusCheck;

#[derive(Debug, Default)]
pub struct StatusReport {
    pub queued: Vec<String>,
    pub errors: usize,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queued={} errors={}", self.queued.len(), self.errors)
    }
}

impl Reconciler {
    pub async fn queue_status_checks(&self, now: DateTime<Utc>) -> StatusReport {
        let due: Vec<StatusCheck> = self
            .inventory
            .read(|s| {
                s.status_checks
                    .values()
                    .filter(|c| c.next_check_at.map(|at| at <= now).unwrap_or(true))
                    .cloned()
                    .collect()
            })
            .await;

        let mut report = StatusReport::default();
        for check in due {
            let mut payload = Payload::new();
            payload.insert("status_check_id".into(), json!(check.id));
            payload.insert("host".into(), json!(check.host));
            payload.insert("port".into(), json!(check.port));
            payload.insert("check_at".into(), json!(check.next_check_at.unwrap_or(now).to_rfc3339()));
            let dispatched = match self.dispatcher.submit(&check.agent_id, "server.status.check", payload, now).await {
                Ok(d) => d,
                Err(e) => {
                    report.errors += 1;
                    self.item_failed("status", &check.id, &e).await;
                    continue;
                }
            };

            let created = dispatched.created.then_some(dispatched.job.id.as_str());
            let advanced = self.advance(&check, created, now).await;
            match advanced {
                Ok(()) => report.queued.push(dispatched.job.id),
                Err(e) => {
                    report.errors += 1;
                    self.item_failed("status", &check.id, &e).await;
                }
            }
        }
        info!(%report, "status check pass");
        report
    }

    /// Move `next_check_at` one interval past `now`, auditing a newly created job.
    async fn advance(&self, check: &StatusCheck, created: Option<&str>, now: DateTime<Utc>) -> Result<(), StoreError> {
        let id = check.id.clone();
        let next = now + Duration::seconds(check.interval_secs.max(1) as i64);
        self.inventory
            .mutate(|s| {
                if let Some(c) = s.status_checks.get_mut(&id) {
                    c.next_check_at = Some(next);
                }
            })
            .await?;
        if let Some(job_id) = created {
            self.audit
                .record(
                    "status.check.queued",
                    detail([
                        ("status_check_id", json!(check.id)),
                        ("agent_id", json!(check.agent_id)),
                        ("job_id", json!(job_id)),
                    ]),
                    now,
                )
                .await?;
        }
        Ok(())
    }
}
