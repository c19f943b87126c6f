//! Applies terminal job results back onto the inventory.
//!
//! Handlers only ever write absolute target states, so applying the same
//! result twice leaves the inventory as it was after the first application.
//! A result whose payload names an aggregate that no longer exists is dropped.

mod bot;
mod instance;
mod observed;
mod results;
mod ssh;
mod voice;

pub use instance::target_state;
pub use results::field;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{Job, JobFamily, JobStatus, Output};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::inventory::{InstallStatus, Inventory, InventoryState, ServiceStatus};
use crate::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Updated,
    /// The payload names no aggregate, or it was deleted since dispatch.
    TargetMissing,
    /// A newer observation already landed, or the aggregate is held in a
    /// state this result must not override.
    Skipped,
    NoHandler,
}

pub struct ResultApplier {
    inventory: Arc<Inventory>,
    metrics: Arc<Metrics>,
}

impl ResultApplier {
    pub fn new(inventory: Arc<Inventory>, metrics: Arc<Metrics>) -> Self {
        Self { inventory, metrics }
    }

    pub async fn apply(
        &self,
        job: &Job,
        status: JobStatus,
        output: &Output,
        now: DateTime<Utc>,
    ) -> Result<Applied, StoreError> {
        let applied = match status {
            JobStatus::Succeeded | JobStatus::Failed => {
                self.inventory
                    .mutate(|state| apply_to(state, job, status, output, now))
                    .await?
            }
            _ => Applied::NoHandler,
        };
        match applied {
            Applied::Updated => {
                Metrics::inc(&self.metrics.results_applied_total);
                info!(job_id=%job.id, job_type=%job.job_type, status=%status, "result applied");
            }
            Applied::TargetMissing => {
                debug!(job_id=%job.id, job_type=%job.job_type, "result target missing, dropped")
            }
            Applied::Skipped => {
                debug!(job_id=%job.id, job_type=%job.job_type, "result superseded, skipped")
            }
            Applied::NoHandler => {}
        }
        Ok(applied)
    }
}

/// Pure application step, run under the inventory lock.
pub fn apply_to(
    state: &mut InventoryState,
    job: &Job,
    status: JobStatus,
    output: &Output,
    now: DateTime<Utc>,
) -> Applied {
    if status == JobStatus::Failed {
        let error = failure_text(job, output);
        return mark_failed(state, job, &error, now);
    }
    match job.family {
        JobFamily::VoiceNode => voice::apply_node(state, job, output),
        JobFamily::VoiceVirtual => voice::apply_virtual(state, job, output, now),
        JobFamily::BotNode => bot::apply(state, job, output),
        JobFamily::SshKey => ssh::apply(state, job, output),
        JobFamily::Instance => instance::apply(state, job, now),
        JobFamily::Query => observed::apply_query(state, job, output, now),
        JobFamily::DiskScan => observed::apply_disk(state, job, output, now),
        JobFamily::Firewall => observed::apply_firewall(state, job, output),
        JobFamily::StatusCheck => observed::apply_status(state, job, output, now),
        JobFamily::Other => Applied::NoHandler,
    }
}

/// Move the job's aggregate to its error state.
fn mark_failed(state: &mut InventoryState, job: &Job, error: &str, now: DateTime<Utc>) -> Applied {
    match job.family {
        JobFamily::VoiceNode => voice::fail_node(state, job, error),
        JobFamily::VoiceVirtual => voice::fail_virtual(state, job, error),
        JobFamily::BotNode => bot::fail(state, job, error),
        JobFamily::SshKey => ssh::fail(state, job, error),
        JobFamily::Instance => instance::fail(state, job, error),
        JobFamily::Query => observed::fail_query(state, job, error, now),
        JobFamily::DiskScan => observed::fail_disk(state, job, error),
        JobFamily::Firewall => observed::fail_firewall(state, job, error),
        JobFamily::StatusCheck => observed::fail_status(state, job, error, now),
        JobFamily::Other => Applied::NoHandler,
    }
}

fn failure_text(job: &Job, output: &Output) -> String {
    job.error_text
        .clone()
        .or_else(|| field::<String>(output, "error"))
        .unwrap_or_else(|| format!("{} failed", job.job_type))
}

/// Take the lifecycle slot of an aggregate for `job`. False when a job created
/// after it already landed there, so a late result cannot undo a newer one.
fn in_order(applied_at: &mut Option<DateTime<Utc>>, job: &Job) -> bool {
    if applied_at.is_some_and(|at| at > job.created_at) {
        return false;
    }
    *applied_at = Some(job.created_at);
    true
}

/// Record named by the payload field `key`.
fn target_mut<'a, T>(records: &'a mut BTreeMap<String, T>, job: &Job, key: &str) -> Option<&'a mut T> {
    let id = job.payload_str(key)?;
    records.get_mut(&id)
}

/// Install and service state a successful node lifecycle operation leaves behind.
fn node_target(op: &str) -> (Option<InstallStatus>, Option<ServiceStatus>) {
    match op {
        "install" | "create" => (Some(InstallStatus::Installed), Some(ServiceStatus::Running)),
        "start" | "restart" | "update" => (None, Some(ServiceStatus::Running)),
        "stop" => (None, Some(ServiceStatus::Stopped)),
        _ => (None, None),
    }
}

/// Last segment of a dotted job type, e.g. "install" for "sinusbot.node.install".
fn op_of(job_type: &str) -> &str {
    job_type.rsplit('.').next().unwrap_or(job_type)
}
