use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use common::Payload;
use serde_json::json;
use tracing::{debug, info};

use super::Reconciler;
use crate::audit::detail;
use crate::error::DispatchError;

/// Parse a comma separated port list. Blank and invalid entries are skipped.
pub fn parse_ports(s: &str) -> BTreeSet<u16> {
    s.split(',').filter_map(|p| p.trim().parse().ok()).collect()
}

/// Ascending, comma separated, no spaces.
pub fn format_ports(ports: &BTreeSet<u16>) -> String {
    ports.iter().map(u16::to_string).collect::<Vec<_>>().join(",")
}

#[derive(Debug, Default, PartialEq)]
pub struct PortDelta {
    pub to_open: BTreeSet<u16>,
    pub to_close: BTreeSet<u16>,
}

pub fn port_delta(desired: &BTreeSet<u16>, current: &BTreeSet<u16>) -> PortDelta {
    PortDelta {
        to_open: desired.difference(current).copied().collect(),
        to_close: current.difference(desired).copied().collect(),
    }
}

#[derive(Debug, Default)]
pub struct FirewallReport {
    pub agents: usize,
    pub open_jobs: Vec<String>,
    pub close_jobs: Vec<String>,
    pub errors: usize,
}

impl fmt::Display for FirewallReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "agents={} open_jobs={} close_jobs={} errors={}",
            self.agents,
            self.open_jobs.len(),
            self.close_jobs.len(),
            self.errors
        )
    }
}

impl Reconciler {
    /// One open and one close job per agent at most, each carrying the full delta.
    pub async fn reconcile_firewall(&self, now: DateTime<Utc>) -> FirewallReport {
        let (desired, observed) = self
            .inventory
            .read(|s| {
                let observed: Vec<(String, BTreeSet<u16>, u64)> = s
                    .nodes
                    .values()
                    .map(|n| (n.id.clone(), n.firewall_open_ports.clone(), n.firewall_revision))
                    .collect();
                (s.desired_ports_by_node(), observed)
            })
            .await;

        let mut report = FirewallReport::default();
        let empty = BTreeSet::new();
        for (agent_id, current, revision) in observed {
            report.agents += 1;
            let delta = port_delta(desired.get(&agent_id).unwrap_or(&empty), &current);
            for (job_type, ports) in [("firewall.open_ports", &delta.to_open), ("firewall.close_ports", &delta.to_close)] {
                if ports.is_empty() {
                    continue;
                }
                match self.queue_ports(&agent_id, job_type, ports, revision, now).await {
                    Ok(Some(job_id)) if job_type == "firewall.open_ports" => report.open_jobs.push(job_id),
                    Ok(Some(job_id)) => report.close_jobs.push(job_id),
                    Ok(None) => {}
                    Err(e) => {
                        report.errors += 1;
                        self.item_failed("firewall", &agent_id, &e).await;
                    }
                }
            }
        }
        info!(%report, "firewall reconcile pass");
        report
    }

    /// Returns the job id when a new job was written. An agent has at most one
    /// outstanding job per direction; a pending one is left to finish first.
    async fn queue_ports(
        &self,
        agent_id: &str,
        job_type: &str,
        ports: &BTreeSet<u16>,
        revision: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, DispatchError> {
        if let Some(pending) = self.dispatcher.store().active_of_type(agent_id, job_type).await {
            debug!(agent=%agent_id, job_id=%pending.id, job_type, "firewall job still outstanding");
            return Ok(None);
        }
        let ports_text = format_ports(ports);
        let mut payload = Payload::new();
        payload.insert("ports".into(), json!(ports_text));
        // observed set revision the delta was computed against; lets the same
        // delta be queued again after an earlier job for it succeeded
        payload.insert("firewall_revision".into(), json!(revision));

        let dispatched = self.dispatcher.submit(agent_id, job_type, payload, now).await?;
        if !dispatched.created {
            return Ok(None);
        }
        let event = if job_type == "firewall.open_ports" {
            "firewall.reconcile.open"
        } else {
            "firewall.reconcile.close"
        };
        self.audit
            .record(
                event,
                detail([
                    ("agent_id", json!(agent_id)),
                    ("ports", json!(ports_text)),
                    ("job_id", json!(dispatched.job.id)),
                ]),
                now,
            )
            .await?;
        Ok(Some(dispatched.job.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{Instance, InventoryState, Node, PortBlock};
    use crate::applier::apply_to;
    use crate::reconcile::testkit::{reconciler, t0};
    use common::{JobStatus, Output};

    #[test]
    fn parses_and_formats_port_lists() {
        assert_eq!(parse_ports(" 443, 80,,x,27015 "), BTreeSet::from([80, 443, 27015]));
        assert_eq!(format_ports(&BTreeSet::from([27015, 80])), "80,27015");
    }

    #[test]
    fn delta_splits_open_and_close() {
        let desired = BTreeSet::from([80, 443, 27015]);
        let current = BTreeSet::from([443, 27016]);
        let delta = port_delta(&desired, &current);
        assert_eq!(delta.to_open, BTreeSet::from([80, 27015]));
        assert_eq!(delta.to_close, BTreeSet::from([27016]));
    }

    fn fleet() -> InventoryState {
        let mut s = InventoryState::default();
        s.nodes.insert(
            "n1".into(),
            Node { id: "n1".into(), firewall_open_ports: BTreeSet::from([443, 27016]), ..Default::default() },
        );
        s.instances.insert("i1".into(), Instance::new("i1", "n1"));
        s.instances.insert("i2".into(), Instance::new("i2", "n1"));
        s.port_blocks.insert(
            "b1".into(),
            PortBlock { id: "b1".into(), node_id: "n1".into(), instance_id: Some("i1".into()), ports: vec![80, 443] },
        );
        s.port_blocks.insert(
            "b2".into(),
            PortBlock { id: "b2".into(), node_id: "n1".into(), instance_id: Some("i2".into()), ports: vec![27015] },
        );
        s
    }

    #[tokio::test]
    async fn one_job_per_direction_with_full_delta() {
        let r = reconciler(fleet());
        let report = r.reconcile_firewall(t0()).await;
        assert_eq!(report.open_jobs.len(), 1);
        assert_eq!(report.close_jobs.len(), 1);

        let open = r.jobs().get(&report.open_jobs[0]).await.unwrap();
        assert_eq!(open.job_type, "firewall.open_ports");
        assert_eq!(open.agent_id.as_deref(), Some("n1"));
        assert_eq!(open.payload_str("ports").as_deref(), Some("80,27015"));
        let close = r.jobs().get(&report.close_jobs[0]).await.unwrap();
        assert_eq!(close.payload_str("ports").as_deref(), Some("27016"));

        let events = r.audit().all().await;
        let names: Vec<&str> = events.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(names, vec!["firewall.reconcile.open", "firewall.reconcile.close"]);
    }

    #[tokio::test]
    async fn pending_jobs_are_not_duplicated() {
        let r = reconciler(fleet());
        r.reconcile_firewall(t0()).await;
        let second = r.reconcile_firewall(t0()).await;
        assert!(second.open_jobs.is_empty());
        assert!(second.close_jobs.is_empty());
        assert_eq!(r.jobs().list(Some(JobStatus::Queued), 10).await.len(), 2);
        assert_eq!(r.audit().all().await.len(), 2);
    }

    #[tokio::test]
    async fn landed_open_job_does_not_duplicate_pending_close() {
        let r = reconciler(fleet());
        let first = r.reconcile_firewall(t0()).await;
        let open_id = &first.open_jobs[0];
        r.jobs().claim(open_id, "n1", t0() + chrono::Duration::seconds(300), t0()).await.unwrap();
        let (done, _) = r
            .jobs()
            .complete(open_id, "n1", None, JobStatus::Succeeded, Output::new(), t0())
            .await
            .unwrap();
        r.inventory()
            .mutate(|s| apply_to(s, &done, JobStatus::Succeeded, &Output::new(), t0()))
            .await
            .unwrap();
        assert_eq!(r.inventory().read(|s| s.nodes["n1"].firewall_revision).await, 1);

        let second = r.reconcile_firewall(t0() + chrono::Duration::seconds(60)).await;
        assert!(second.open_jobs.is_empty());
        assert!(second.close_jobs.is_empty());
        let closes: Vec<_> = r
            .jobs()
            .list(None, 10)
            .await
            .into_iter()
            .filter(|j| j.job_type == "firewall.close_ports" && j.status.is_active())
            .collect();
        assert_eq!(closes.len(), 1);
    }

    #[tokio::test]
    async fn same_delta_is_requeued_after_success() {
        let r = reconciler(fleet());
        let first = r.reconcile_firewall(t0()).await;
        let close_id = &first.close_jobs[0];
        r.jobs().claim(close_id, "n1", t0() + chrono::Duration::seconds(300), t0()).await.unwrap();
        let (done, _) = r
            .jobs()
            .complete(close_id, "n1", None, JobStatus::Succeeded, Output::new(), t0())
            .await
            .unwrap();
        r.inventory()
            .mutate(|s| apply_to(s, &done, JobStatus::Succeeded, &Output::new(), t0()))
            .await
            .unwrap();
        // port reappears out of band
        r.inventory()
            .mutate(|s| {
                s.nodes.get_mut("n1").unwrap().firewall_open_ports.insert(27016);
            })
            .await
            .unwrap();

        let second = r.reconcile_firewall(t0() + chrono::Duration::seconds(60)).await;
        assert_eq!(second.close_jobs.len(), 1);
        assert_ne!(&second.close_jobs[0], close_id);
    }

    #[tokio::test]
    async fn converged_node_gets_nothing() {
        let mut s = fleet();
        s.nodes.get_mut("n1").unwrap().firewall_open_ports = BTreeSet::from([80, 443, 27015]);
        let r = reconciler(s);
        let report = r.reconcile_firewall(t0()).await;
        assert!(report.open_jobs.is_empty() && report.close_jobs.is_empty());
    }
}
