use chrono::{DateTime, Utc};
use common::{Job, JobStatus, Output};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::persist::{load_json, save_json};

type JobId = String;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JobStoreState {
    pub jobs: HashMap<JobId, Job>,
    /// idempotency key -> id of the most recently created job with that key
    #[serde(default)]
    latest_by_key: HashMap<String, JobId>,
}

impl JobStoreState {
    fn rebuild_index(&mut self) {
        let mut latest: HashMap<String, (DateTime<Utc>, JobId)> = HashMap::new();
        for job in self.jobs.values() {
            let entry = latest
                .entry(job.idempotency_key.clone())
                .or_insert((job.created_at, job.id.clone()));
            if job.created_at > entry.0 {
                *entry = (job.created_at, job.id.clone());
            }
        }
        self.latest_by_key = latest.into_iter().map(|(k, (_, id))| (k, id)).collect();
    }

    fn latest_for_key(&self, key: &str) -> Option<&Job> {
        self.latest_by_key.get(key).and_then(|id| self.jobs.get(id))
    }
}

/// How a reported result was taken by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// Running job moved to its terminal state.
    Accepted,
    /// Job was already terminal with the same status; nothing changed.
    Replayed,
    /// Stale or foreign report; the job was left untouched.
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    NotLockHolder,
    /// Sent by the holder for an earlier claim of the same job.
    StaleAttempt,
    NotRunning,
    ConflictingTerminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Requeued,
    Failed,
}

/// Durable job table. All mutations happen under one writer lock, which is what
/// makes fingerprint lookup-then-create atomic.
pub struct JobStore {
    state: Mutex<JobStoreState>,
    data_dir: Option<PathBuf>,
}

impl JobStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            state: Mutex::new(JobStoreState::default()),
            data_dir: Some(data_dir),
        }
    }

    /// Store without a backing file, used by tests and dry runs.
    pub fn in_memory() -> Self {
        Self { state: Mutex::new(JobStoreState::default()), data_dir: None }
    }

    fn state_file(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("jobs.json"))
    }

    pub async fn load_from_disk(&self) -> Result<(), StoreError> {
        let Some(path) = self.state_file() else { return Ok(()) };
        if let Some(mut loaded) = load_json::<JobStoreState>(&path).await? {
            loaded.rebuild_index();
            let count = loaded.jobs.len();
            *self.state.lock().await = loaded;
            info!("Loaded {} jobs from disk", count);
        }
        Ok(())
    }

    /// Copy of the table to restore if the next save fails. None in memory.
    fn checkpoint(&self, state: &JobStoreState) -> Option<JobStoreState> {
        self.data_dir.as_ref().map(|_| state.clone())
    }

    /// Persist the table. On a failed save the table goes back to `before`, so
    /// a caller handed an error never finds the change live afterwards.
    async fn commit(&self, state: &mut JobStoreState, before: Option<JobStoreState>) -> Result<(), StoreError> {
        let Some(path) = self.state_file() else { return Ok(()) };
        if let Err(e) = save_json(&path, &*state).await {
            warn!(error=%e, "Failed to save job state, change rolled back");
            if let Some(before) = before {
                *state = before;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Insert `job` unless the latest job with the same fingerprint satisfies `reuse`,
    /// in which case that job is returned instead. The flag is true when `job` was inserted.
    pub async fn insert_unless<F>(&self, job: Job, reuse: F) -> Result<(Job, bool), StoreError>
    where
        F: Fn(&Job) -> bool,
    {
        let mut state = self.state.lock().await;
        let before = self.checkpoint(&state);
        if let Some(existing) = state.latest_for_key(&job.idempotency_key) {
            if reuse(existing) {
                return Ok((existing.clone(), false));
            }
        }
        state.latest_by_key.insert(job.idempotency_key.clone(), job.id.clone());
        state.jobs.insert(job.id.clone(), job.clone());
        self.commit(&mut state, before).await?;
        Ok((job, true))
    }

    pub async fn latest_for_key(&self, key: &str) -> Option<Job> {
        self.state.lock().await.latest_for_key(key).cloned()
    }

    pub async fn get(&self, job_id: &str) -> Option<Job> {
        self.state.lock().await.jobs.get(job_id).cloned()
    }

    pub async fn list(&self, status: Option<JobStatus>, limit: usize) -> Vec<Job> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| status.map(|s| job.status == s).unwrap_or(true))
            .cloned()
            .collect();
        // newest first
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        jobs
    }

    /// Queued or Running job of `job_type` addressed to `agent_id`, if any.
    pub async fn active_of_type(&self, agent_id: &str, job_type: &str) -> Option<Job> {
        let state = self.state.lock().await;
        state
            .jobs
            .values()
            .find(|job| {
                job.status.is_active() && job.job_type == job_type && job.agent_id.as_deref() == Some(agent_id)
            })
            .cloned()
    }

    /// Queued jobs addressed to one agent, oldest first.
    pub async fn queued_for_agent(&self, agent_id: &str, limit: usize) -> Vec<Job> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Queued && job.agent_id.as_deref() == Some(agent_id))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs.truncate(limit);
        jobs
    }

    pub async fn claim(
        &self,
        job_id: &str,
        agent_id: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let mut state = self.state.lock().await;
        let before = self.checkpoint(&state);
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
        if job.agent_id.as_deref() != Some(agent_id) {
            return Err(StoreError::WrongAgent { id: job_id.to_string(), agent_id: agent_id.to_string() });
        }
        if job.status != JobStatus::Queued {
            return Err(StoreError::InvalidTransition {
                id: job_id.to_string(),
                actual: job.status,
                expected: JobStatus::Queued,
            });
        }
        job.claim(agent_id, lease_until, now);
        let claimed = job.clone();
        self.commit(&mut state, before).await?;
        Ok(claimed)
    }

    /// Claim the oldest queued job for `agent_id`, if any.
    pub async fn claim_next(
        &self,
        agent_id: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut state = self.state.lock().await;
        let before = self.checkpoint(&state);
        let next_id = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Queued && job.agent_id.as_deref() == Some(agent_id))
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
            .map(|job| job.id.clone());
        let Some(id) = next_id else { return Ok(None) };
        let claimed = match state.jobs.get_mut(&id) {
            Some(job) => {
                job.claim(agent_id, lease_until, now);
                job.clone()
            }
            None => return Ok(None),
        };
        self.commit(&mut state, before).await?;
        Ok(Some(claimed))
    }

    /// Record a terminal result reported by `agent_id`. A report naming an
    /// `attempt` is only taken for that claim of the job.
    pub async fn complete(
        &self,
        job_id: &str,
        agent_id: &str,
        attempt: Option<u32>,
        status: JobStatus,
        output: Output,
        now: DateTime<Utc>,
    ) -> Result<(Job, ReportOutcome), StoreError> {
        let mut state = self.state.lock().await;
        let before = self.checkpoint(&state);
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;

        let outcome = match job.status {
            JobStatus::Running if job.locked_by.as_deref() != Some(agent_id) => {
                ReportOutcome::Ignored(IgnoreReason::NotLockHolder)
            }
            JobStatus::Running if attempt.is_some_and(|a| a != job.attempts) => {
                ReportOutcome::Ignored(IgnoreReason::StaleAttempt)
            }
            JobStatus::Running => {
                job.complete(status, output, now);
                ReportOutcome::Accepted
            }
            s if s.is_terminal() && s == status => ReportOutcome::Replayed,
            s if s.is_terminal() => ReportOutcome::Ignored(IgnoreReason::ConflictingTerminal),
            _ => ReportOutcome::Ignored(IgnoreReason::NotRunning),
        };
        let snapshot = job.clone();
        if outcome == ReportOutcome::Accepted {
            self.commit(&mut state, before).await?;
        }
        Ok((snapshot, outcome))
    }

    /// Cancel a job. Only Queued jobs can be cancelled.
    pub async fn cancel(&self, job_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let before = self.checkpoint(&state);
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
        if job.status != JobStatus::Queued {
            return Ok(false);
        }
        job.cancel(now);
        self.commit(&mut state, before).await?;
        Ok(true)
    }

    /// Running jobs whose lease ran out before `now`.
    pub async fn expired_locks(&self, now: DateTime<Utc>) -> Vec<Job> {
        let state = self.state.lock().await;
        state.jobs.values().filter(|job| job.lease_expired(now)).cloned().collect()
    }

    /// Requeue expired leases; jobs that already used `max_attempts` claims are failed.
    pub async fn recover_expired(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<Vec<(Job, RecoveryAction)>, StoreError> {
        let mut state = self.state.lock().await;
        let before = self.checkpoint(&state);
        let mut recovered = Vec::new();
        for job in state.jobs.values_mut().filter(|job| job.lease_expired(now)) {
            let holder = job.locked_by.clone().unwrap_or_default();
            if job.attempts >= max_attempts {
                warn!(job_id=%job.id, agent=%holder, attempts=job.attempts, "lease expired, giving up");
                job.fail(format!("lease expired after {} attempts", job.attempts), now);
                recovered.push((job.clone(), RecoveryAction::Failed));
            } else {
                warn!(job_id=%job.id, agent=%holder, "lease expired, requeueing");
                job.requeue(now);
                recovered.push((job.clone(), RecoveryAction::Requeued));
            }
        }
        if !recovered.is_empty() {
            self.commit(&mut state, before).await?;
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use common::Payload;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn job(agent: &str, ty: &str, id: &str) -> Job {
        let mut payload = Payload::new();
        payload.insert("instance_id".into(), json!(id));
        Job::new(Some(agent.into()), ty.into(), payload, t0())
    }

    #[tokio::test]
    async fn claim_sets_lease_and_rejects_second_claim() {
        let store = JobStore::in_memory();
        let (j, _) = store.insert_unless(job("a1", "instance.start", "i1"), |_| true).await.unwrap();
        let lease_until = t0() + Duration::seconds(300);
        let claimed = store.claim(&j.id, "a1", lease_until, t0()).await.unwrap();
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.locked_by.as_deref(), Some("a1"));
        assert_eq!(claimed.lock_expires_at, Some(lease_until));
        assert!(matches!(
            store.claim(&j.id, "a1", lease_until, t0()).await,
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn claim_is_scoped_to_target_agent() {
        let store = JobStore::in_memory();
        let (j, _) = store.insert_unless(job("a1", "instance.start", "i1"), |_| true).await.unwrap();
        assert!(store.queued_for_agent("a2", 10).await.is_empty());
        assert!(matches!(
            store.claim(&j.id, "a2", t0(), t0()).await,
            Err(StoreError::WrongAgent { .. })
        ));
        assert!(store.claim_next("a2", t0(), t0()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_found_and_requeued() {
        let store = JobStore::in_memory();
        let (j, _) = store.insert_unless(job("a1", "instance.start", "i1"), |_| true).await.unwrap();
        store.claim(&j.id, "a1", t0() + Duration::seconds(60), t0()).await.unwrap();

        let later = t0() + Duration::seconds(120);
        let expired = store.expired_locks(later).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, j.id);

        let recovered = store.recover_expired(later, 5).await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].1, RecoveryAction::Requeued);
        let after = store.get(&j.id).await.unwrap();
        assert_eq!(after.status, JobStatus::Queued);
        assert!(after.lock_expires_at.is_none());
        assert!(store.expired_locks(later).await.is_empty());
    }

    #[tokio::test]
    async fn lease_recovery_gives_up_after_max_attempts() {
        let store = JobStore::in_memory();
        let (j, _) = store.insert_unless(job("a1", "instance.start", "i1"), |_| true).await.unwrap();
        store.claim(&j.id, "a1", t0(), t0()).await.unwrap();
        let recovered = store.recover_expired(t0() + Duration::seconds(1), 1).await.unwrap();
        assert_eq!(recovered[0].1, RecoveryAction::Failed);
        let after = store.get(&j.id).await.unwrap();
        assert_eq!(after.status, JobStatus::Failed);
        assert!(after.error_text.unwrap().contains("lease expired"));
    }

    #[tokio::test]
    async fn report_rules() {
        let store = JobStore::in_memory();
        let (j, _) = store.insert_unless(job("a1", "instance.start", "i1"), |_| true).await.unwrap();
        store.claim(&j.id, "a1", t0() + Duration::seconds(60), t0()).await.unwrap();

        let (_, o) = store.complete(&j.id, "a2", None, JobStatus::Succeeded, Output::new(), t0()).await.unwrap();
        assert_eq!(o, ReportOutcome::Ignored(IgnoreReason::NotLockHolder));

        let (done, o) = store.complete(&j.id, "a1", None, JobStatus::Succeeded, Output::new(), t0()).await.unwrap();
        assert_eq!(o, ReportOutcome::Accepted);
        assert_eq!(done.status, JobStatus::Succeeded);
        assert!(done.locked_by.is_none());
        assert!(done.result.is_some());

        let (_, o) = store.complete(&j.id, "a1", None, JobStatus::Succeeded, Output::new(), t0()).await.unwrap();
        assert_eq!(o, ReportOutcome::Replayed);
        let (_, o) = store.complete(&j.id, "a1", None, JobStatus::Failed, Output::new(), t0()).await.unwrap();
        assert_eq!(o, ReportOutcome::Ignored(IgnoreReason::ConflictingTerminal));
    }

    #[tokio::test]
    async fn report_from_earlier_claim_is_ignored_after_reclaim() {
        let store = JobStore::in_memory();
        let (j, _) = store.insert_unless(job("a1", "instance.start", "i1"), |_| true).await.unwrap();
        let first = store.claim(&j.id, "a1", t0() + Duration::seconds(60), t0()).await.unwrap();
        assert_eq!(first.attempts, 1);

        let later = t0() + Duration::seconds(120);
        store.recover_expired(later, 5).await.unwrap();
        let second = store.claim(&j.id, "a1", later + Duration::seconds(60), later).await.unwrap();
        assert_eq!(second.attempts, 2);

        let (after, o) = store.complete(&j.id, "a1", Some(1), JobStatus::Failed, Output::new(), later).await.unwrap();
        assert_eq!(o, ReportOutcome::Ignored(IgnoreReason::StaleAttempt));
        assert_eq!(after.status, JobStatus::Running);

        let (done, o) = store.complete(&j.id, "a1", Some(2), JobStatus::Succeeded, Output::new(), later).await.unwrap();
        assert_eq!(o, ReportOutcome::Accepted);
        assert_eq!(done.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn only_queued_jobs_cancel() {
        let store = JobStore::in_memory();
        let (a, _) = store.insert_unless(job("a1", "instance.start", "i1"), |_| true).await.unwrap();
        let (b, _) = store.insert_unless(job("a1", "instance.start", "i2"), |_| true).await.unwrap();
        store.claim(&b.id, "a1", t0(), t0()).await.unwrap();
        assert!(store.cancel(&a.id, t0()).await.unwrap());
        assert!(!store.cancel(&b.id, t0()).await.unwrap());
        assert_eq!(store.get(&a.id).await.unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn survives_reload_with_index() {
        let dir = std::env::temp_dir().join(format!("fleet-store-{}", uuid::Uuid::new_v4()));
        let store = JobStore::new(dir.clone());
        let (j, _) = store.insert_unless(job("a1", "instance.start", "i1"), |_| true).await.unwrap();

        let reopened = JobStore::new(dir.clone());
        reopened.load_from_disk().await.unwrap();
        let latest = reopened.latest_for_key(&j.idempotency_key).await.unwrap();
        assert_eq!(latest.id, j.id);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn failed_save_leaves_no_job_behind() {
        // a plain file where the data dir should be makes every save fail
        let blocker = std::env::temp_dir().join(format!("fleet-blocker-{}", uuid::Uuid::new_v4()));
        std::fs::write(&blocker, b"").unwrap();
        let store = JobStore::new(blocker.clone());

        let err = store.insert_unless(job("a1", "instance.start", "i1"), |_| true).await;
        assert!(err.is_err());
        assert!(store.list(None, 10).await.is_empty());
        let key = job("a1", "instance.start", "i1").idempotency_key;
        assert!(store.latest_for_key(&key).await.is_none());
        let _ = std::fs::remove_file(blocker);
    }
}
