use chrono::{DateTime, Utc};
use common::Job;

use super::{in_order, target_mut, Applied};
use crate::inventory::{InstanceStatus, InventoryState};

/// Lifecycle state a successful instance job leaves behind. Backups and
/// unknown operations have none.
pub fn target_state(job_type: &str, action: Option<&str>) -> Option<InstanceStatus> {
    match job_type {
        "instance.start" | "instance.restart" | "instance.update" | "instance.reinstall" => {
            Some(InstanceStatus::Running)
        }
        "instance.stop" => Some(InstanceStatus::Stopped),
        "instance.action" if action == Some("stop") => Some(InstanceStatus::Stopped),
        "instance.action" => Some(InstanceStatus::Running),
        _ => None,
    }
}

pub(super) fn apply(state: &mut InventoryState, job: &Job, now: DateTime<Utc>) -> Applied {
    let Some(instance) = target_mut(&mut state.instances, job, "instance_id") else {
        return Applied::TargetMissing;
    };
    if job.job_type == "instance.backup.create" {
        instance.last_backup_at = Some(now);
        instance.last_error = None;
        return Applied::Updated;
    }
    let action = job.payload_str("action");
    let Some(target) = target_state(&job.job_type, action.as_deref()) else { return Applied::NoHandler };
    // only an operator lifts a suspension
    if instance.status == InstanceStatus::Suspended || !in_order(&mut instance.last_applied_job_at, job) {
        return Applied::Skipped;
    }
    instance.status = target;
    instance.last_error = None;
    Applied::Updated
}

pub(super) fn fail(state: &mut InventoryState, job: &Job, error: &str) -> Applied {
    let Some(instance) = target_mut(&mut state.instances, job, "instance_id") else {
        return Applied::TargetMissing;
    };
    if job.job_type == "instance.backup.create" {
        instance.last_error = Some(error.to_string());
        return Applied::Updated;
    }
    if !in_order(&mut instance.last_applied_job_at, job) {
        return Applied::Skipped;
    }
    instance.last_error = Some(error.to_string());
    if instance.status != InstanceStatus::Suspended {
        instance.status = InstanceStatus::Error;
    }
    Applied::Updated
}
