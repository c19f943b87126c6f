use common::{Job, Output};

use super::results::NodeResult;
use super::{in_order, node_target, op_of, target_mut, Applied};
use crate::inventory::{InstallStatus, InventoryState, ServiceStatus};

pub(super) fn apply(state: &mut InventoryState, job: &Job, output: &Output) -> Applied {
    let Some(node) = target_mut(&mut state.bot_nodes, job, "node_id") else { return Applied::TargetMissing };
    if !in_order(&mut node.last_applied_job_at, job) {
        return Applied::Skipped;
    }
    let (install, service) = node_target(op_of(&job.job_type));
    if let Some(install) = install {
        node.install_status = install;
    }
    if let Some(service) = service {
        node.service_status = service;
    }
    if let Some(version) = NodeResult::from_output(output).version {
        node.version = Some(version);
    }
    node.last_error = None;
    Applied::Updated
}

pub(super) fn fail(state: &mut InventoryState, job: &Job, error: &str) -> Applied {
    let Some(node) = target_mut(&mut state.bot_nodes, job, "node_id") else { return Applied::TargetMissing };
    if !in_order(&mut node.last_applied_job_at, job) {
        return Applied::Skipped;
    }
    if op_of(&job.job_type) == "install" {
        node.install_status = InstallStatus::Error;
    } else {
        node.service_status = ServiceStatus::Error;
    }
    node.last_error = Some(error.to_string());
    Applied::Updated
}
