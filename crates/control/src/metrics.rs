use std::collections::{BTreeMap, VecDeque};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Per-loop ring of recent log lines, served by `GET /logs`.
pub type SharedLogs = Arc<tokio::sync::Mutex<BTreeMap<String, VecDeque<String>>>>;

const LOGS_CAP: usize = 1000;

pub fn new_shared_logs() -> SharedLogs {
    Arc::new(tokio::sync::Mutex::new(BTreeMap::new()))
}

/// Push a line into the log buffer for a given source, trimming when full.
pub async fn push_log(logs: &SharedLogs, name: &str, line: impl Into<String>) {
    let now = chrono::Utc::now().timestamp();
    let mut map = logs.lock().await;
    let buf = map
        .entry(name.to_string())
        .or_insert_with(|| VecDeque::with_capacity(LOGS_CAP));
    if buf.len() >= LOGS_CAP {
        buf.pop_front();
    }
    buf.push_back(format!("{} | {}", now, line.into()));
}

/// Last `tail` lines for one source, or the list of sources when `name` is None.
pub async fn tail_logs(logs: &SharedLogs, name: Option<&str>, tail: usize) -> String {
    let map = logs.lock().await;
    let mut out = String::new();
    match name {
        Some(name) => match map.get(name) {
            Some(buf) => {
                let start = buf.len().saturating_sub(tail);
                for line in buf.iter().skip(start) {
                    out.push_str(line);
                    out.push('\n');
                }
            }
            None => out.push_str("unknown source\n"),
        },
        None => {
            out.push_str("sources:\n");
            for k in map.keys() {
                out.push_str(k);
                out.push('\n');
            }
        }
    }
    out
}

/// In-memory counters exposed in Prometheus text format.
#[derive(Default)]
pub struct Metrics {
    pub jobs_dispatched_total: AtomicU64,
    pub jobs_deduplicated_total: AtomicU64,
    pub jobs_prefailed_total: AtomicU64,
    pub jobs_claimed_total: AtomicU64,
    pub jobs_succeeded_total: AtomicU64,
    pub jobs_failed_total: AtomicU64,
    pub leases_recovered_total: AtomicU64,
    pub results_applied_total: AtomicU64,
    pub results_ignored_total: AtomicU64,
    pub probes_queued_total: AtomicU64,
    pub probes_inline_total: AtomicU64,
    pub reconcile_passes_total: AtomicU64,
    pub reconcile_item_errors_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        let counters: [(&str, &AtomicU64); 13] = [
            ("fleet_jobs_dispatched_total", &self.jobs_dispatched_total),
            ("fleet_jobs_deduplicated_total", &self.jobs_deduplicated_total),
            ("fleet_jobs_prefailed_total", &self.jobs_prefailed_total),
            ("fleet_jobs_claimed_total", &self.jobs_claimed_total),
            ("fleet_jobs_succeeded_total", &self.jobs_succeeded_total),
            ("fleet_jobs_failed_total", &self.jobs_failed_total),
            ("fleet_leases_recovered_total", &self.leases_recovered_total),
            ("fleet_results_applied_total", &self.results_applied_total),
            ("fleet_results_ignored_total", &self.results_ignored_total),
            ("fleet_probes_queued_total", &self.probes_queued_total),
            ("fleet_probes_inline_total", &self.probes_inline_total),
            ("fleet_reconcile_passes_total", &self.reconcile_passes_total),
            ("fleet_reconcile_item_errors_total", &self.reconcile_item_errors_total),
        ];
        let mut out = String::new();
        for (name, counter) in counters {
            out.push_str(&format!("# TYPE {name} counter\n"));
            out.push_str(&format!("{name} {}\n", counter.load(Ordering::Relaxed)));
        }
        out
    }
}
