use common::{Job, Output};

use super::results::SshKeyResult;
use super::{in_order, target_mut, Applied};
use crate::inventory::{InventoryState, SshKeyStatus};

pub(super) fn apply(state: &mut InventoryState, job: &Job, output: &Output) -> Applied {
    let Some(key) = target_mut(&mut state.ssh_keys, job, "ssh_key_id") else { return Applied::TargetMissing };
    if !in_order(&mut key.last_applied_job_at, job) {
        return Applied::Skipped;
    }
    match job.job_type.as_str() {
        "ssh.key.provision" => {
            key.status = SshKeyStatus::Provisioned;
            if let Some(fingerprint) = SshKeyResult::from_output(output).fingerprint {
                key.fingerprint = Some(fingerprint);
            }
        }
        "ssh.key.revoke" => key.status = SshKeyStatus::Revoked,
        _ => return Applied::NoHandler,
    }
    key.last_error = None;
    Applied::Updated
}

pub(super) fn fail(state: &mut InventoryState, job: &Job, error: &str) -> Applied {
    let Some(key) = target_mut(&mut state.ssh_keys, job, "ssh_key_id") else { return Applied::TargetMissing };
    if !in_order(&mut key.last_applied_job_at, job) {
        return Applied::Skipped;
    }
    key.status = SshKeyStatus::Error;
    key.last_error = Some(error.to_string());
    Applied::Updated
}
