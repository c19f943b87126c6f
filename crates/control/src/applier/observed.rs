//! Results of probe-style jobs: they report what an agent observed rather than
//! effecting a lifecycle change.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use common::{Job, Output};

use super::results::{DiskUsageResult, FirewallResult, QueryResult, StatusCheckResult};
use super::{target_mut, Applied};
use crate::inventory::InventoryState;
use crate::reconcile::firewall::parse_ports;

/// True when an observation newer than this job was already recorded.
fn superseded(recorded: Option<DateTime<Utc>>, job: &Job) -> bool {
    recorded.map(|at| at > job.created_at).unwrap_or(false)
}

pub(super) fn apply_query(state: &mut InventoryState, job: &Job, output: &Output, now: DateTime<Utc>) -> Applied {
    let Some(instance) = target_mut(&mut state.instances, job, "instance_id") else {
        return Applied::TargetMissing;
    };
    let cache = &mut instance.query_cache;
    if superseded(cache.checked_at, job) {
        return Applied::Skipped;
    }
    let result = QueryResult::from_output(output);
    cache.status = Some(result.status.unwrap_or_else(|| "online".to_string()));
    cache.players = result.players;
    cache.max_players = result.max_players;
    cache.checked_at = Some(now);
    cache.queued_at = None;
    cache.error = None;
    Applied::Updated
}

pub(super) fn fail_query(state: &mut InventoryState, job: &Job, error: &str, now: DateTime<Utc>) -> Applied {
    let Some(instance) = target_mut(&mut state.instances, job, "instance_id") else {
        return Applied::TargetMissing;
    };
    let cache = &mut instance.query_cache;
    if superseded(cache.checked_at, job) {
        return Applied::Skipped;
    }
    cache.status = Some("error".to_string());
    cache.players = None;
    cache.max_players = None;
    cache.checked_at = Some(now);
    cache.queued_at = None;
    cache.error = Some(error.to_string());
    Applied::Updated
}

pub(super) fn apply_disk(state: &mut InventoryState, job: &Job, output: &Output, now: DateTime<Utc>) -> Applied {
    let usage = DiskUsageResult::from_output(output);
    if job.job_type == "node.disk.stat" {
        let Some(node) = target_mut(&mut state.nodes, job, "node_id") else { return Applied::TargetMissing };
        if superseded(node.last_disk_stat_at, job) {
            return Applied::Skipped;
        }
        if usage.used_bytes.is_some() {
            node.disk_used_bytes = usage.used_bytes;
        }
        if usage.total_bytes.is_some() {
            node.disk_total_bytes = usage.total_bytes;
        }
        node.last_disk_stat_at = Some(now);
        node.last_error = None;
        return Applied::Updated;
    }

    let Some(instance) = target_mut(&mut state.instances, job, "instance_id") else {
        return Applied::TargetMissing;
    };
    if superseded(instance.last_disk_scan_at, job) {
        return Applied::Skipped;
    }
    if let Some(used) = usage.used_bytes {
        instance.disk_used_bytes = used;
    }
    instance.last_disk_scan_at = Some(now);
    Applied::Updated
}

pub(super) fn fail_disk(state: &mut InventoryState, job: &Job, error: &str) -> Applied {
    let last_error = if job.job_type == "node.disk.stat" {
        target_mut(&mut state.nodes, job, "node_id").map(|n| &mut n.last_error)
    } else {
        target_mut(&mut state.instances, job, "instance_id").map(|i| &mut i.last_error)
    };
    match last_error {
        Some(slot) => {
            *slot = Some(error.to_string());
            Applied::Updated
        }
        None => Applied::TargetMissing,
    }
}

/// Firewall jobs address the node through the agent they ran on.
pub(super) fn apply_firewall(state: &mut InventoryState, job: &Job, output: &Output) -> Applied {
    let Some(node) = job.agent_id.as_ref().and_then(|id| state.nodes.get_mut(id)) else {
        return Applied::TargetMissing;
    };
    let before = node.firewall_open_ports.clone();
    match FirewallResult::from_output(output).open_ports {
        Some(reported) => node.firewall_open_ports = reported.into_iter().collect(),
        None => {
            let ports: BTreeSet<u16> = job.payload_str("ports").map(|p| parse_ports(&p)).unwrap_or_default();
            match job.job_type.as_str() {
                "firewall.open_ports" => node.firewall_open_ports.extend(ports),
                "firewall.close_ports" => node.firewall_open_ports.retain(|p| !ports.contains(p)),
                _ => return Applied::NoHandler,
            }
        }
    }
    if node.firewall_open_ports != before {
        node.firewall_revision += 1;
    }
    node.last_error = None;
    Applied::Updated
}

pub(super) fn fail_firewall(state: &mut InventoryState, job: &Job, error: &str) -> Applied {
    let Some(node) = job.agent_id.as_ref().and_then(|id| state.nodes.get_mut(id)) else {
        return Applied::TargetMissing;
    };
    node.last_error = Some(error.to_string());
    Applied::Updated
}

pub(super) fn apply_status(state: &mut InventoryState, job: &Job, output: &Output, now: DateTime<Utc>) -> Applied {
    let Some(check) = target_mut(&mut state.status_checks, job, "status_check_id") else {
        return Applied::TargetMissing;
    };
    let result = StatusCheckResult::from_output(output);
    check.last_status = Some(result.status.unwrap_or_else(|| "online".to_string()));
    check.last_latency_ms = result.latency_ms;
    check.last_checked_at = Some(now);
    check.last_error = None;
    Applied::Updated
}

pub(super) fn fail_status(state: &mut InventoryState, job: &Job, error: &str, now: DateTime<Utc>) -> Applied {
    let Some(check) = target_mut(&mut state.status_checks, job, "status_check_id") else {
        return Applied::TargetMissing;
    };
    check.last_status = Some("offline".to_string());
    check.last_latency_ms = None;
    check.last_checked_at = Some(now);
    check.last_error = Some(error.to_string());
    Applied::Updated
}
