use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::info;

use crate::applier::ResultApplier;
use crate::audit::AuditLog;
use crate::config::ControlConfig;
use crate::dispatcher::Dispatcher;
use crate::error::StoreError;
use crate::inventory::{Inventory, InventoryState};
use crate::job_store::JobStore;
use crate::lease::LeaseManager;
use crate::metrics::{new_shared_logs, Metrics, SharedLogs};
use crate::query::QueryService;
use crate::reconcile::{spawn_loop, LoopKind, Reconciler};

/// Every component of the engine, wired together over shared stores.
pub struct ControlPlane {
    pub config: ControlConfig,
    pub store: Arc<JobStore>,
    pub inventory: Arc<Inventory>,
    pub audit: Arc<AuditLog>,
    pub dispatcher: Dispatcher,
    pub leases: LeaseManager,
    pub reconciler: Reconciler,
    pub query: QueryService,
    pub metrics: Arc<Metrics>,
    pub logs: SharedLogs,
}

impl ControlPlane {
    /// Open the stores under `config.data_dir` and load their snapshots.
    pub async fn open(config: ControlConfig) -> Result<Self, StoreError> {
        let dir = config.data_dir.clone();
        let store = Arc::new(JobStore::new(dir.clone()));
        let inventory = Arc::new(Inventory::new(dir.clone()));
        let audit = Arc::new(AuditLog::new(dir));
        store.load_from_disk().await?;
        inventory.load_from_disk().await?;
        audit.load_from_disk().await?;
        Ok(Self::assemble(config, store, inventory, audit))
    }

    /// Unpersisted plane over a prepared inventory.
    pub fn in_memory(config: ControlConfig, state: InventoryState) -> Self {
        Self::assemble(
            config,
            Arc::new(JobStore::in_memory()),
            Arc::new(Inventory::in_memory(state)),
            Arc::new(AuditLog::in_memory()),
        )
    }

    fn assemble(config: ControlConfig, store: Arc<JobStore>, inventory: Arc<Inventory>, audit: Arc<AuditLog>) -> Self {
        let metrics = Arc::new(Metrics::new());
        let logs = new_shared_logs();
        let dispatcher = Dispatcher::new(store.clone(), metrics.clone());
        let applier = Arc::new(ResultApplier::new(inventory.clone(), metrics.clone()));
        let leases = LeaseManager::new(store.clone(), applier, config.lease(), config.max_attempts, metrics.clone());
        let reconciler = Reconciler::new(
            inventory.clone(),
            dispatcher.clone(),
            audit.clone(),
            &config,
            metrics.clone(),
            logs.clone(),
        );
        let query = QueryService::new(inventory.clone(), dispatcher.clone(), config.query.clone(), metrics.clone());
        Self { config, store, inventory, audit, dispatcher, leases, reconciler, query, metrics, logs }
    }

    /// One pass of one loop; returns its summary line.
    pub async fn run_pass(&self, kind: LoopKind, now: DateTime<Utc>) -> anyhow::Result<String> {
        let summary = match kind {
            LoopKind::Firewall => self.reconciler.reconcile_firewall(now).await.to_string(),
            LoopKind::Disk => self.reconciler.enforce_disk(now).await.to_string(),
            LoopKind::DiskScan => self.reconciler.queue_disk_scans(now).await.to_string(),
            LoopKind::Schedules => self.reconciler.run_schedules(now).await.to_string(),
            LoopKind::Status => self.reconciler.queue_status_checks(now).await.to_string(),
            LoopKind::Leases => {
                let report = self.leases.sweep(now).await?;
                format!("requeued={} failed={}", report.requeued.len(), report.failed.len())
            }
        };
        Ok(summary)
    }

    /// Start every loop on its own task at its configured period.
    pub fn spawn_loops(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        LoopKind::ALL
            .into_iter()
            .map(|kind| {
                let plane = self.clone();
                let period = kind.period(&self.config);
                info!(loop_name = kind.name(), period_secs = period.as_secs(), "starting reconcile loop");
                spawn_loop(kind.name(), period, self.metrics.clone(), self.logs.clone(), move || {
                    let plane = plane.clone();
                    async move { plane.run_pass(kind, Utc::now()).await }
                })
            })
            .collect()
    }
}
