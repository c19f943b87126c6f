use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use common::{Job, JobStatus, Output, ResultReport};
use tracing::{info, warn};

use crate::applier::{Applied, ResultApplier};
use crate::error::LeaseError;
use crate::job_store::{JobStore, RecoveryAction, ReportOutcome};
use crate::metrics::Metrics;

/// What happened to one reported result.
#[derive(Debug, Clone)]
pub struct ReportReceipt {
    pub job: Job,
    pub outcome: ReportOutcome,
    /// None when the report was ignored.
    pub applied: Option<Applied>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
    pub requeued: Vec<String>,
    pub failed: Vec<String>,
}

/// Agent-facing side of the job store: claim with a fixed lease, report,
/// and the sweep that reclaims lapsed leases.
pub struct LeaseManager {
    store: Arc<JobStore>,
    applier: Arc<ResultApplier>,
    lease: Duration,
    max_attempts: u32,
    metrics: Arc<Metrics>,
}

impl LeaseManager {
    pub fn new(
        store: Arc<JobStore>,
        applier: Arc<ResultApplier>,
        lease: Duration,
        max_attempts: u32,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { store, applier, lease, max_attempts, metrics }
    }

    pub async fn queued(&self, agent_id: &str, limit: usize) -> Vec<Job> {
        self.store.queued_for_agent(agent_id, limit).await
    }

    pub async fn claim(&self, job_id: &str, agent_id: &str, now: DateTime<Utc>) -> Result<Job, LeaseError> {
        let job = self.store.claim(job_id, agent_id, now + self.lease, now).await?;
        Metrics::inc(&self.metrics.jobs_claimed_total);
        info!(job_id=%job.id, agent=%agent_id, job_type=%job.job_type, attempt=job.attempts, "job claimed");
        Ok(job)
    }

    pub async fn claim_next(&self, agent_id: &str, now: DateTime<Utc>) -> Result<Option<Job>, LeaseError> {
        let claimed = self.store.claim_next(agent_id, now + self.lease, now).await?;
        if let Some(job) = &claimed {
            Metrics::inc(&self.metrics.jobs_claimed_total);
            info!(job_id=%job.id, agent=%agent_id, job_type=%job.job_type, attempt=job.attempts, "job claimed");
        }
        Ok(claimed)
    }

    /// Record a terminal result and apply it. A replay of an already recorded
    /// result is applied again, which is harmless because application is idempotent.
    pub async fn report(
        &self,
        job_id: &str,
        report: ResultReport,
        now: DateTime<Utc>,
    ) -> Result<ReportReceipt, LeaseError> {
        let status: JobStatus = report.status.into();
        let (job, outcome) = self
            .store
            .complete(job_id, &report.agent_id, report.attempt, status, report.output, now)
            .await?;

        match outcome {
            ReportOutcome::Accepted => {
                let counter = match job.status {
                    JobStatus::Succeeded => &self.metrics.jobs_succeeded_total,
                    _ => &self.metrics.jobs_failed_total,
                };
                Metrics::inc(counter);
                info!(job_id=%job.id, agent=%report.agent_id, status=%job.status, "result recorded");
            }
            ReportOutcome::Replayed => {
                info!(job_id=%job.id, agent=%report.agent_id, "duplicate result, re-applying");
            }
            ReportOutcome::Ignored(reason) => {
                Metrics::inc(&self.metrics.results_ignored_total);
                warn!(job_id=%job.id, agent=%report.agent_id, status=%job.status, ?reason, "result ignored");
                return Ok(ReportReceipt { job, outcome, applied: None });
            }
        }

        let output = job.result.as_ref().map(|r| r.output.clone()).unwrap_or_default();
        let applied = self
            .applier
            .apply(&job, job.status, &output, now)
            .await
            .map_err(|source| LeaseError::Apply { job_id: job.id.clone(), source })?;
        Ok(ReportReceipt { job, outcome, applied: Some(applied) })
    }

    /// Requeue lapsed leases; jobs out of attempts fail and the failure is
    /// applied to their aggregate.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, LeaseError> {
        let recovered = self.store.recover_expired(now, self.max_attempts).await?;
        let mut report = SweepReport::default();
        for (job, action) in recovered {
            Metrics::inc(&self.metrics.leases_recovered_total);
            match action {
                RecoveryAction::Requeued => report.requeued.push(job.id),
                RecoveryAction::Failed => {
                    Metrics::inc(&self.metrics.jobs_failed_total);
                    if let Err(e) = self.applier.apply(&job, JobStatus::Failed, &Output::new(), now).await {
                        warn!(job_id=%job.id, error=%e, "failed to apply lease failure");
                    }
                    report.failed.push(job.id);
                }
            }
        }
        if !report.requeued.is_empty() || !report.failed.is_empty() {
            info!(requeued = report.requeued.len(), failed = report.failed.len(), "lease sweep");
        }
        Ok(report)
    }
}
