use std::fmt;

use chrono::{DateTime, Duration, Utc};
use common::Payload;
use serde_json::json;
use tracing::info;

use super::Reconciler;
use crate::audit::detail;

#[derive(Debug, Default)]
pub struct DiskScanReport {
    pub scan_jobs: Vec<String>,
    pub stat_jobs: Vec<String>,
    /// Due scans left for a later pass because of the per-pass cap.
    pub deferred: usize,
    pub errors: usize,
}

impl fmt::Display for DiskScanReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scan_jobs={} stat_jobs={} deferred={} errors={}",
            self.scan_jobs.len(),
            self.stat_jobs.len(),
            self.deferred,
            self.errors
        )
    }
}

fn due(last: Option<DateTime<Utc>>, interval_secs: u64, now: DateTime<Utc>) -> bool {
    match last {
        None => true,
        Some(at) => now - at >= Duration::seconds(interval_secs as i64),
    }
}

/// Interval-sized bucket `now` falls in; repeated passes inside one bucket
/// resolve to the same job fingerprint.
fn window(interval_secs: u64, now: DateTime<Utc>) -> i64 {
    now.timestamp() / (interval_secs.max(1) as i64)
}

impl Reconciler {
    pub async fn queue_disk_scans(&self, now: DateTime<Utc>) -> DiskScanReport {
        // (node/agent id, instance id, interval)
        let (scans, stats) = self
            .inventory
            .read(|s| {
                let scans: Vec<(String, String, u64)> = s
                    .instances
                    .values()
                    .filter_map(|i| {
                        let node = s.nodes.get(&i.node_id)?;
                        due(i.last_disk_scan_at, node.disk_scan_interval_secs, now)
                            .then(|| (node.id.clone(), i.id.clone(), node.disk_scan_interval_secs))
                    })
                    .collect();
                let stats: Vec<(String, u64)> = s
                    .nodes
                    .values()
                    .filter(|n| due(n.last_disk_stat_at, n.disk_stat_interval_secs, now))
                    .map(|n| (n.id.clone(), n.disk_stat_interval_secs))
                    .collect();
                (scans, stats)
            })
            .await;

        let mut report = DiskScanReport::default();
        let cap = self.max_scan_items_per_pass;
        report.deferred = scans.len().saturating_sub(cap);

        for (agent_id, instance_id, interval) in scans.into_iter().take(cap) {
            let mut payload = Payload::new();
            payload.insert("instance_id".into(), json!(instance_id));
            payload.insert("scan_window".into(), json!(window(interval, now)));
            match self.dispatcher.submit(&agent_id, "instance.disk.scan", payload, now).await {
                Ok(dispatched) => {
                    let id = instance_id.clone();
                    let recorded = self
                        .inventory
                        .mutate(|s| {
                            if let Some(instance) = s.instances.get_mut(&id) {
                                instance.last_disk_scan_at = Some(now);
                            }
                        })
                        .await;
                    if let Err(e) = recorded {
                        report.errors += 1;
                        self.item_failed("disk-scan", &instance_id, &e).await;
                    }
                    if dispatched.created {
                        let audited = self
                            .audit
                            .record(
                                "disk.scan.queued",
                                detail([
                                    ("instance_id", json!(instance_id)),
                                    ("agent_id", json!(agent_id)),
                                    ("job_id", json!(dispatched.job.id)),
                                ]),
                                now,
                            )
                            .await;
                        if let Err(e) = audited {
                            report.errors += 1;
                            self.item_failed("disk-scan", &instance_id, &e).await;
                        }
                        report.scan_jobs.push(dispatched.job.id);
                    }
                }
                Err(e) => {
                    report.errors += 1;
                    self.item_failed("disk-scan", &instance_id, &e).await;
                }
            }
        }

        for (node_id, interval) in stats {
            let mut payload = Payload::new();
            payload.insert("node_id".into(), json!(node_id));
            payload.insert("stat_window".into(), json!(window(interval, now)));
            match self.dispatcher.submit(&node_id, "node.disk.stat", payload, now).await {
                Ok(dispatched) if dispatched.created => {
                    let audited = self
                        .audit
                        .record(
                            "disk.stat.queued",
                            detail([("node_id", json!(node_id)), ("job_id", json!(dispatched.job.id))]),
                            now,
                        )
                        .await;
                    if let Err(e) = audited {
                        report.errors += 1;
                        self.item_failed("disk-scan", &node_id, &e).await;
                    }
                    report.stat_jobs.push(dispatched.job.id);
                }
                Ok(_) => {}
                Err(e) => {
                    report.errors += 1;
                    self.item_failed("disk-scan", &node_id, &e).await;
                }
            }
        }
        info!(%report, "disk scan pass");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlConfig;
    use crate::inventory::{Instance, InventoryState, Node};
    use crate::reconcile::testkit::{reconciler, t0};

    fn fleet(instances: usize) -> InventoryState {
        let mut s = InventoryState::default();
        s.nodes.insert(
            "n1".into(),
            Node { id: "n1".into(), disk_scan_interval_secs: 3600, disk_stat_interval_secs: 3600, ..Default::default() },
        );
        for i in 0..instances {
            let id = format!("i{i}");
            s.instances.insert(id.clone(), Instance::new(id, "n1"));
        }
        s
    }

    #[tokio::test]
    async fn scans_are_queued_once_per_interval() {
        let r = reconciler(fleet(2));
        let first = r.queue_disk_scans(t0()).await;
        assert_eq!(first.scan_jobs.len(), 2);
        assert_eq!(first.stat_jobs.len(), 1);
        let recorded = r.inventory().read(|s| s.instances["i0"].last_disk_scan_at).await;
        assert_eq!(recorded, Some(t0()));

        let second = r.queue_disk_scans(t0() + Duration::seconds(60)).await;
        assert!(second.scan_jobs.is_empty());
        // the stat job is still pending in the same window
        assert!(second.stat_jobs.is_empty());

        let third = r.queue_disk_scans(t0() + Duration::seconds(3600)).await;
        assert_eq!(third.scan_jobs.len(), 2);
    }

    #[tokio::test]
    async fn each_new_job_is_audited() {
        let r = reconciler(fleet(2));
        let report = r.queue_disk_scans(t0()).await;
        r.queue_disk_scans(t0() + Duration::seconds(60)).await;

        let events = r.audit().all().await;
        let names: Vec<&str> = events.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(names, vec!["disk.scan.queued", "disk.scan.queued", "disk.stat.queued"]);
        assert_eq!(events[0].detail["job_id"], json!(report.scan_jobs[0]));
        assert_eq!(events[2].detail["node_id"], json!("n1"));
        assert_eq!(events[2].detail["job_id"], json!(report.stat_jobs[0]));
        assert_eq!(r.audit().verify().await, Ok(()));
    }

    #[tokio::test]
    async fn scans_are_capped_per_pass() {
        let cap = ControlConfig::default().reconcile.max_scan_items_per_pass;
        let r = reconciler(fleet(cap + 3));
        let report = r.queue_disk_scans(t0()).await;
        assert_eq!(report.scan_jobs.len(), cap);
        assert_eq!(report.deferred, 3);
        let rest = r.queue_disk_scans(t0() + Duration::seconds(1)).await;
        assert_eq!(rest.scan_jobs.len(), 3);
    }

    #[test]
    fn never_scanned_is_due() {
        assert!(due(None, 3600, t0()));
        assert!(!due(Some(t0()), 3600, t0() + Duration::seconds(3599)));
        assert!(due(Some(t0()), 3600, t0() + Duration::seconds(3600)));
    }
}
