//! Periodic loops that compare desired against observed state and enqueue
//! corrective jobs. Each loop runs one pass per tick; an error on one item is
//! logged and counted and the pass carries on with the next item.

pub mod disk;
pub mod disk_scan;
pub mod firewall;
pub mod schedule;
pub mod status;

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::audit::AuditLog;
use crate::config::{ControlConfig, DiskConfig};
use crate::dispatcher::Dispatcher;
use crate::inventory::Inventory;
use crate::metrics::{push_log, Metrics, SharedLogs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LoopKind {
    Firewall,
    Disk,
    DiskScan,
    Schedules,
    Status,
    Leases,
}

impl LoopKind {
    pub const ALL: [LoopKind; 6] = [
        LoopKind::Firewall,
        LoopKind::Disk,
        LoopKind::DiskScan,
        LoopKind::Schedules,
        LoopKind::Status,
        LoopKind::Leases,
    ];

    pub fn name(self) -> &'static str {
        match self {
            LoopKind::Firewall => "firewall",
            LoopKind::Disk => "disk",
            LoopKind::DiskScan => "disk-scan",
            LoopKind::Schedules => "schedules",
            LoopKind::Status => "status",
            LoopKind::Leases => "leases",
        }
    }

    pub fn period(self, config: &ControlConfig) -> Duration {
        let r = &config.reconcile;
        let secs = match self {
            LoopKind::Firewall => r.firewall_secs,
            LoopKind::Disk => r.disk_secs,
            LoopKind::DiskScan => r.disk_scan_secs,
            LoopKind::Schedules => r.schedule_secs,
            LoopKind::Status => r.status_secs,
            LoopKind::Leases => r.lease_sweep_secs,
        };
        Duration::from_secs(secs.max(1))
    }
}

/// Shared handles for the inventory-driven loops.
pub struct Reconciler {
    inventory: Arc<Inventory>,
    dispatcher: Dispatcher,
    audit: Arc<AuditLog>,
    disk: DiskConfig,
    max_scan_items_per_pass: usize,
    metrics: Arc<Metrics>,
    logs: SharedLogs,
}

impl Reconciler {
    pub fn new(
        inventory: Arc<Inventory>,
        dispatcher: Dispatcher,
        audit: Arc<AuditLog>,
        config: &ControlConfig,
        metrics: Arc<Metrics>,
        logs: SharedLogs,
    ) -> Self {
        Self {
            inventory,
            dispatcher,
            audit,
            disk: config.disk.clone(),
            max_scan_items_per_pass: config.reconcile.max_scan_items_per_pass,
            metrics,
            logs,
        }
    }

    async fn item_failed(&self, loop_name: &str, item: &str, error: &(dyn Display + Sync)) {
        Metrics::inc(&self.metrics.reconcile_item_errors_total);
        warn!(loop_name, item, error=%error, "reconcile item failed");
        push_log(&self.logs, loop_name, format!("{item}: {error}")).await;
    }
}

/// Run `pass` every `period` until the task is aborted.
pub fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    metrics: Arc<Metrics>,
    logs: SharedLogs,
    mut pass: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut intv = tokio::time::interval(period);
        intv.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            intv.tick().await;
            match pass().await {
                Ok(summary) => {
                    Metrics::inc(&metrics.reconcile_passes_total);
                    debug!(loop_name = name, %summary, "reconcile pass");
                    push_log(&logs, name, summary).await;
                }
                Err(e) => {
                    warn!(loop_name = name, error=%e, "reconcile pass failed");
                    push_log(&logs, name, format!("pass failed: {e}")).await;
                }
            }
        }
    })
}

#[cfg(test)]
pub(crate) mod testkit {
    use super::*;
    use crate::inventory::InventoryState;
    use crate::job_store::JobStore;
    use crate::metrics::new_shared_logs;
    use chrono::{DateTime, TimeZone, Utc};

    pub fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
    }

    pub fn reconciler(state: InventoryState) -> Reconciler {
        let metrics = Arc::new(Metrics::new());
        let dispatcher = Dispatcher::new(Arc::new(JobStore::in_memory()), metrics.clone());
        Reconciler::new(
            Arc::new(Inventory::in_memory(state)),
            dispatcher,
            Arc::new(AuditLog::in_memory()),
            &ControlConfig::default(),
            metrics,
            new_shared_logs(),
        )
    }

    impl Reconciler {
        pub fn inventory(&self) -> &Arc<Inventory> {
            &self.inventory
        }

        pub fn jobs(&self) -> &Arc<JobStore> {
            self.dispatcher.store()
        }

        pub fn audit(&self) -> &Arc<AuditLog> {
            &self.audit
        }
    }
}
