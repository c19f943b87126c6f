use chrono::{DateTime, Utc};
use common::{Job, Output};
use tracing::debug;

use super::results::{field, NodeResult, VirtualServerResult};
use super::{in_order, node_target, op_of, target_mut, Applied};
use crate::inventory::{InstallStatus, InventoryState, ServiceStatus, VirtualServerStatus, VoiceNode};

/// `ts3.instance.create` addresses the voice node through `instance_id`.
fn voice_node<'a>(state: &'a mut InventoryState, job: &Job) -> Option<&'a mut VoiceNode> {
    let id = job.payload_str("node_id").or_else(|| {
        if job.job_type == "ts3.instance.create" {
            job.payload_str("instance_id")
        } else {
            None
        }
    })?;
    state.voice_nodes.get_mut(&id)
}

pub(super) fn apply_node(state: &mut InventoryState, job: &Job, output: &Output) -> Applied {
    let Some(node) = voice_node(state, job) else { return Applied::TargetMissing };
    if !in_order(&mut node.last_applied_job_at, job) {
        return Applied::Skipped;
    }
    let result = NodeResult::from_output(output);

    let (install, service) = node_target(op_of(&job.job_type));
    if let Some(install) = install {
        node.install_status = install;
    }
    if let Some(service) = service {
        node.service_status = service;
    }
    if let Some(version) = result.version {
        node.version = Some(version);
    }
    if let Some(port) = result.query_port.or_else(|| field(&job.payload, "query_port")) {
        node.query_port = Some(port);
    }
    node.last_error = None;
    Applied::Updated
}

pub(super) fn fail_node(state: &mut InventoryState, job: &Job, error: &str) -> Applied {
    let Some(node) = voice_node(state, job) else { return Applied::TargetMissing };
    if !in_order(&mut node.last_applied_job_at, job) {
        return Applied::Skipped;
    }
    match op_of(&job.job_type) {
        "install" | "create" => node.install_status = InstallStatus::Error,
        _ => node.service_status = ServiceStatus::Error,
    }
    node.last_error = Some(error.to_string());
    Applied::Updated
}

pub(super) fn apply_virtual(state: &mut InventoryState, job: &Job, output: &Output, now: DateTime<Utc>) -> Applied {
    let Some(server) = target_mut(&mut state.virtual_servers, job, "virtual_server_id") else {
        return Applied::TargetMissing;
    };
    let op = job.job_type.trim_start_matches("ts3.virtual.");
    if server.status == VirtualServerStatus::Deleted && op != "delete" {
        return Applied::Skipped;
    }
    // token rotation leaves the lifecycle state alone
    if op != "token.rotate" && !in_order(&mut server.last_applied_job_at, job) {
        return Applied::Skipped;
    }
    let result = VirtualServerResult::from_output(output);

    match op {
        "create" => {
            server.status = VirtualServerStatus::Running;
            if let Some(sid) = result.sid {
                server.sid = Some(sid);
            }
            server.voice_port = result.voice_port.or_else(|| field(&job.payload, "voice_port")).or(server.voice_port);
        }
        "start" => server.status = VirtualServerStatus::Running,
        "stop" => server.status = VirtualServerStatus::Stopped,
        "delete" => {
            server.status = VirtualServerStatus::Deleted;
            server.deactivate_tokens();
        }
        _ => {}
    }
    if op != "delete" {
        if let Some(token) = result.token {
            if server.rotate_token(&token, now) {
                debug!(virtual_server=%server.id, "join token rotated");
            }
        }
    }
    server.last_error = None;
    Applied::Updated
}

pub(super) fn fail_virtual(state: &mut InventoryState, job: &Job, error: &str) -> Applied {
    let Some(server) = target_mut(&mut state.virtual_servers, job, "virtual_server_id") else {
        return Applied::TargetMissing;
    };
    if server.status == VirtualServerStatus::Deleted {
        return Applied::Skipped;
    }
    // a failed rotation leaves the current token and server state in place
    if job.job_type != "ts3.virtual.token.rotate" {
        if !in_order(&mut server.last_applied_job_at, job) {
            return Applied::Skipped;
        }
        server.status = VirtualServerStatus::Error;
    }
    server.last_error = Some(error.to_string());
    Applied::Updated
}
