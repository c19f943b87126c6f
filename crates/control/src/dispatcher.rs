use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{Job, Payload};
use tracing::{debug, info, warn};

use crate::error::DispatchError;
use crate::job_store::JobStore;
use crate::metrics::Metrics;
use crate::validator::validate;

/// A dispatch result: the job the fingerprint resolved to, and whether it was
/// written by this call.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub job: Job,
    pub created: bool,
}

/// Fingerprint-deduplicating front door of the job store.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<JobStore>,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(store: Arc<JobStore>, metrics: Arc<Metrics>) -> Self {
        Self { store, metrics }
    }

    /// Strict variant: a payload missing required fields is rejected before any
    /// job is written.
    pub async fn dispatch(
        &self,
        agent_id: &str,
        job_type: &str,
        payload: Payload,
        now: DateTime<Utc>,
    ) -> Result<Job, DispatchError> {
        let errors = validate(job_type, &payload);
        if !errors.is_empty() {
            return Err(DispatchError::Validation { job_type: job_type.to_string(), errors });
        }
        Ok(self.enqueue(agent_id, job_type, payload, now).await?.job)
    }

    /// Unattended variant: validation failures are recorded as a Failed job rather
    /// than returned. Repeated bad calls reuse the job already recorded for the
    /// same fingerprint. Only persistence failures come back as errors.
    pub async fn dispatch_with_failure_logging(
        &self,
        agent_id: &str,
        job_type: &str,
        payload: Payload,
        now: DateTime<Utc>,
    ) -> Result<Job, DispatchError> {
        Ok(self.submit(agent_id, job_type, payload, now).await?.job)
    }

    /// Failure-logging dispatch that also tells the caller whether a new job
    /// was written, so loops only audit what they actually created.
    pub async fn submit(
        &self,
        agent_id: &str,
        job_type: &str,
        payload: Payload,
        now: DateTime<Utc>,
    ) -> Result<Dispatched, DispatchError> {
        let errors = validate(job_type, &payload);
        if errors.is_empty() {
            return self.enqueue(agent_id, job_type, payload, now).await;
        }

        let message = errors.join("; ");
        let mut job = Job::new(Some(agent_id.to_string()), job_type.to_string(), payload, now);
        job.fail(message.clone(), now);
        let (job, created) = self.store.insert_unless(job, |_| true).await?;
        if created {
            Metrics::inc(&self.metrics.jobs_prefailed_total);
            warn!(job_id=%job.id, agent=%agent_id, job_type=%job_type, error=%message, "dispatch rejected, recorded failed job");
        } else {
            debug!(job_id=%job.id, job_type=%job_type, "invalid dispatch already recorded");
        }
        Ok(Dispatched { job, created })
    }

    async fn enqueue(
        &self,
        agent_id: &str,
        job_type: &str,
        payload: Payload,
        now: DateTime<Utc>,
    ) -> Result<Dispatched, DispatchError> {
        let candidate = Job::new(Some(agent_id.to_string()), job_type.to_string(), payload, now);
        let (job, created) = self
            .store
            .insert_unless(candidate, |existing| existing.status.blocks_redispatch())
            .await?;
        if created {
            Metrics::inc(&self.metrics.jobs_dispatched_total);
            info!(job_id=%job.id, agent=%agent_id, job_type=%job_type, "job queued");
        } else {
            Metrics::inc(&self.metrics.jobs_deduplicated_total);
            debug!(job_id=%job.id, status=%job.status, job_type=%job_type, "dispatch matched existing job");
        }
        Ok(Dispatched { job, created })
    }

    /// Cancel a queued job. Running jobs can only be reclaimed through lease expiry.
    pub async fn cancel(&self, job_id: &str, now: DateTime<Utc>) -> Result<bool, DispatchError> {
        let cancelled = self.store.cancel(job_id, now).await?;
        if cancelled {
            info!(job_id=%job_id, "job cancelled");
        }
        Ok(cancelled)
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use common::{JobStatus, Output};
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(JobStore::in_memory()), Arc::new(Metrics::new()))
    }

    fn start_payload() -> Payload {
        let mut p = Payload::new();
        p.insert("instance_id".into(), json!("i-1"));
        p
    }

    #[tokio::test]
    async fn duplicate_dispatch_returns_active_job() {
        let d = dispatcher();
        let first = d.dispatch("a1", "instance.start", start_payload(), now()).await.unwrap();
        let second = d.dispatch("a1", "instance.start", start_payload(), now()).await.unwrap();
        assert_eq!(first.id, second.id);

        d.store()
            .claim(&first.id, "a1", now() + Duration::seconds(300), now())
            .await
            .unwrap();
        let third = d.dispatch("a1", "instance.start", start_payload(), now()).await.unwrap();
        assert_eq!(third.id, first.id);
        assert_eq!(d.store().list(None, 100).await.len(), 1);
    }

    #[tokio::test]
    async fn failed_job_allows_retry() {
        let d = dispatcher();
        let first = d.dispatch("a1", "instance.start", start_payload(), now()).await.unwrap();
        d.store().claim(&first.id, "a1", now() + Duration::seconds(300), now()).await.unwrap();
        d.store()
            .complete(&first.id, "a1", None, JobStatus::Failed, Output::new(), now())
            .await
            .unwrap();

        let retry = d
            .dispatch("a1", "instance.start", start_payload(), now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_ne!(retry.id, first.id);
        assert_eq!(retry.status, JobStatus::Queued);
        assert_eq!(retry.idempotency_key, first.idempotency_key);
        assert_eq!(d.store().list(None, 100).await.len(), 2);
    }

    #[tokio::test]
    async fn succeeded_job_blocks_redispatch() {
        let d = dispatcher();
        let first = d.dispatch("a1", "instance.start", start_payload(), now()).await.unwrap();
        d.store().claim(&first.id, "a1", now() + Duration::seconds(300), now()).await.unwrap();
        d.store()
            .complete(&first.id, "a1", None, JobStatus::Succeeded, Output::new(), now())
            .await
            .unwrap();
        let again = d.dispatch("a1", "instance.start", start_payload(), now()).await.unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn strict_dispatch_rejects_without_writing() {
        let d = dispatcher();
        let err = d.dispatch("a1", "instance.start", Payload::new(), now()).await.unwrap_err();
        assert!(err.to_string().contains("missing required field: instance_id"));
        assert!(d.store().list(None, 100).await.is_empty());
    }

    #[tokio::test]
    async fn failure_logging_records_one_failed_job() {
        let d = dispatcher();
        let a = d
            .dispatch_with_failure_logging("a1", "instance.start", Payload::new(), now())
            .await
            .unwrap();
        assert_eq!(a.status, JobStatus::Failed);
        assert_eq!(a.error_text.as_deref(), Some("missing required field: instance_id"));

        let b = d
            .dispatch_with_failure_logging("a1", "instance.start", Payload::new(), now())
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(d.store().list(None, 100).await.len(), 1);

        let again = d.submit("a1", "instance.start", Payload::new(), now()).await.unwrap();
        assert!(!again.created);
    }

    #[tokio::test]
    async fn concurrent_dispatch_creates_one_job() {
        let d = dispatcher();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let d = d.clone();
            handles.push(tokio::spawn(async move {
                d.dispatch("a1", "instance.start", start_payload(), now()).await.unwrap().id
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(d.store().list(None, 100).await.len(), 1);
    }

    #[tokio::test]
    async fn cancelled_job_allows_redispatch() {
        let d = dispatcher();
        let first = d.dispatch("a1", "instance.start", start_payload(), now()).await.unwrap();
        assert!(d.cancel(&first.id, now()).await.unwrap());
        let second = d.dispatch("a1", "instance.start", start_payload(), now()).await.unwrap();
        assert_ne!(first.id, second.id);
    }
}
