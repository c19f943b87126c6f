//! Live status of game instances. Reads are served from a per-instance cache;
//! when the cache is stale a probe is either run inline through a protocol
//! adapter or dispatched to the instance's agent as an `instance.query` job.

mod a2s;
mod http;
mod rcon;

pub use a2s::A2sAdapter;
pub use http::HttpAdapter;
pub use rcon::{parse_player_counts, RconAdapter};

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::Payload;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::{QueryConfig, QueryMode};
use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, ProbeError};
use crate::inventory::{InstanceStatus, Inventory, QueryCache};
use crate::metrics::Metrics;

/// Where and how to reach one instance.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    pub host: String,
    pub game_port: Option<u16>,
    pub query_port: Option<u16>,
    pub rcon_port: Option<u16>,
    pub http_path: Option<String>,
    pub rcon_password: Option<String>,
    pub rcon_command: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    pub status: String,
    pub players: Option<u32>,
    pub max_players: Option<u32>,
}

#[async_trait]
pub trait QueryAdapter: Send + Sync {
    fn name(&self) -> &'static str;
    fn supports(&self, query_type: &str) -> bool;
    async fn query(&self, ctx: &QueryContext) -> Result<QueryOutcome, ProbeError>;
}

/// Fallback for instances without a usable protocol.
pub struct NoneAdapter;

#[async_trait]
impl QueryAdapter for NoneAdapter {
    fn name(&self) -> &'static str {
        "none"
    }

    fn supports(&self, query_type: &str) -> bool {
        query_type == "none"
    }

    async fn query(&self, _ctx: &QueryContext) -> Result<QueryOutcome, ProbeError> {
        Ok(QueryOutcome { status: "unavailable".to_string(), players: None, max_players: None })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QuerySnapshot {
    pub instance_id: String,
    pub status: Option<String>,
    pub players: Option<u32>,
    pub max_players: Option<u32>,
    pub checked_at: Option<DateTime<Utc>>,
    pub queued_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Whether `checked_at` is inside the freshness window.
    pub fresh: bool,
}

impl QuerySnapshot {
    fn from_cache(instance_id: &str, cache: &QueryCache, fresh: bool) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            status: cache.status.clone(),
            players: cache.players,
            max_players: cache.max_players,
            checked_at: cache.checked_at,
            queued_at: cache.queued_at,
            error: cache.error.clone(),
            fresh,
        }
    }
}

/// Everything a stale read needs, taken in one inventory read.
struct Target {
    agent_id: String,
    status: InstanceStatus,
    query_type: String,
    mode: QueryMode,
    cache: QueryCache,
    ctx: QueryContext,
}

pub struct QueryService {
    inventory: Arc<Inventory>,
    dispatcher: Dispatcher,
    adapters: Vec<Box<dyn QueryAdapter>>,
    fallback: NoneAdapter,
    config: QueryConfig,
    metrics: Arc<Metrics>,
}

impl QueryService {
    pub fn new(inventory: Arc<Inventory>, dispatcher: Dispatcher, config: QueryConfig, metrics: Arc<Metrics>) -> Self {
        let timeout = StdDuration::from_millis(config.probe_timeout_ms);
        let adapters: Vec<Box<dyn QueryAdapter>> =
            vec![Box::new(HttpAdapter::new(timeout)), Box::new(A2sAdapter), Box::new(RconAdapter)];
        Self { inventory, dispatcher, adapters, fallback: NoneAdapter, config, metrics }
    }

    /// First adapter that claims the query type, else the fallback.
    pub fn adapter_for(&self, query_type: &str) -> &dyn QueryAdapter {
        self.adapters
            .iter()
            .find(|a| a.supports(query_type))
            .map(|a| a.as_ref())
            .unwrap_or(&self.fallback)
    }

    /// None when the instance does not exist.
    pub async fn get_snapshot(
        &self,
        instance_id: &str,
        queue_if_stale: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<QuerySnapshot>, DispatchError> {
        let default_mode = self.config.mode;
        let target = self
            .inventory
            .read(|s| {
                let instance = s.instances.get(instance_id)?;
                let ports = s.instance_ports(instance_id);
                let host = s.nodes.get(&instance.node_id).map(|n| n.host.clone()).unwrap_or_default();
                Some(Target {
                    agent_id: instance.node_id.clone(),
                    status: instance.status,
                    query_type: instance.query.query_type.to_lowercase(),
                    mode: instance.query.mode.unwrap_or(default_mode),
                    cache: instance.query_cache.clone(),
                    ctx: QueryContext {
                        host,
                        game_port: ports.get("game").copied(),
                        query_port: ports.get("query").copied(),
                        rcon_port: ports.get("rcon").copied(),
                        http_path: instance.query.http_path.clone(),
                        rcon_password: instance.query.rcon_password.clone(),
                        rcon_command: instance.query.rcon_command.clone(),
                    },
                })
            })
            .await;
        let Some(target) = target else { return Ok(None) };

        let fresh_ttl = Duration::seconds(self.config.fresh_ttl_secs as i64);
        let fresh = target.cache.checked_at.map(|at| now - at < fresh_ttl).unwrap_or(false);
        if fresh || !queue_if_stale || target.query_type == "none" {
            return Ok(Some(QuerySnapshot::from_cache(instance_id, &target.cache, fresh)));
        }

        match target.mode {
            QueryMode::Backend => self.probe_inline(instance_id, &target, now).await.map(Some),
            QueryMode::Agent => self.queue_probe(instance_id, target, now).await.map(Some),
        }
    }

    async fn probe_inline(
        &self,
        instance_id: &str,
        target: &Target,
        now: DateTime<Utc>,
    ) -> Result<QuerySnapshot, DispatchError> {
        let adapter = self.adapter_for(&target.query_type);
        let timeout_ms = self.config.probe_timeout_ms;
        let result = match tokio::time::timeout(StdDuration::from_millis(timeout_ms), adapter.query(&target.ctx)).await {
            Ok(r) => r,
            Err(_) => Err(ProbeError::Timeout(timeout_ms)),
        };
        Metrics::inc(&self.metrics.probes_inline_total);

        let cache = match result {
            Ok(outcome) => {
                debug!(instance_id, adapter = adapter.name(), players = ?outcome.players, "inline probe");
                QueryCache {
                    status: Some(outcome.status),
                    players: outcome.players,
                    max_players: outcome.max_players,
                    checked_at: Some(now),
                    queued_at: None,
                    error: None,
                }
            }
            Err(e) => {
                warn!(instance_id, adapter = adapter.name(), error=%e, "inline probe failed");
                QueryCache {
                    status: Some("offline".to_string()),
                    players: None,
                    max_players: None,
                    checked_at: Some(now),
                    queued_at: None,
                    error: Some(e.to_string()),
                }
            }
        };
        let stored = cache.clone();
        self.inventory
            .mutate(|s| {
                if let Some(instance) = s.instances.get_mut(instance_id) {
                    instance.query_cache = stored;
                }
            })
            .await?;
        Ok(QuerySnapshot::from_cache(instance_id, &cache, true))
    }

    async fn queue_probe(
        &self,
        instance_id: &str,
        target: Target,
        now: DateTime<Utc>,
    ) -> Result<QuerySnapshot, DispatchError> {
        let cooldown = Duration::seconds(self.config.queue_cooldown_secs as i64);
        let cooling = target.cache.queued_at.map(|at| now - at < cooldown).unwrap_or(false);
        if target.status != InstanceStatus::Running || cooling {
            return Ok(QuerySnapshot::from_cache(instance_id, &target.cache, false));
        }

        let mut payload = Payload::new();
        payload.insert("instance_id".into(), json!(instance_id));
        payload.insert("query_type".into(), json!(target.query_type));
        payload.insert("host".into(), json!(target.ctx.host));
        for (key, port) in [
            ("game_port", target.ctx.game_port),
            ("query_port", target.ctx.query_port),
            ("rcon_port", target.ctx.rcon_port),
        ] {
            if let Some(port) = port {
                payload.insert(key.into(), json!(port));
            }
        }
        payload.insert("requested_at".into(), json!(now.to_rfc3339()));
        let dispatched = self.dispatcher.submit(&target.agent_id, "instance.query", payload, now).await?;
        Metrics::inc(&self.metrics.probes_queued_total);
        info!(instance_id, job_id=%dispatched.job.id, "query probe queued");

        let mut cache = target.cache;
        cache.status = Some("queued".to_string());
        cache.queued_at = Some(now);
        let stored = cache.clone();
        self.inventory
            .mutate(|s| {
                if let Some(instance) = s.instances.get_mut(instance_id) {
                    instance.query_cache.status = stored.status;
                    instance.query_cache.queued_at = stored.queued_at;
                }
            })
            .await?;
        Ok(QuerySnapshot::from_cache(instance_id, &cache, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{Instance, InventoryState, Node, PortBlock};
    use crate::job_store::JobStore;
    use chrono::TimeZone;
    use common::JobStatus;
    use tokio::net::UdpSocket;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn fleet(query_type: &str, ports: Vec<u16>) -> InventoryState {
        let mut s = InventoryState::default();
        s.nodes.insert("n1".into(), Node { id: "n1".into(), host: "127.0.0.1".into(), ..Default::default() });
        let mut inst = Instance::new("i1", "n1");
        inst.status = InstanceStatus::Running;
        inst.query.query_type = query_type.into();
        inst.port_block_id = Some("b1".into());
        inst.required_ports = vec!["game".into(), "query".into()];
        s.instances.insert("i1".into(), inst);
        s.port_blocks.insert(
            "b1".into(),
            PortBlock { id: "b1".into(), node_id: "n1".into(), instance_id: Some("i1".into()), ports },
        );
        s
    }

    fn service(state: InventoryState, mode: QueryMode) -> (QueryService, Arc<JobStore>, Arc<Inventory>) {
        let store = Arc::new(JobStore::in_memory());
        let metrics = Arc::new(Metrics::new());
        let inventory = Arc::new(Inventory::in_memory(state));
        let config = QueryConfig { mode, ..Default::default() };
        let svc = QueryService::new(inventory.clone(), Dispatcher::new(store.clone(), metrics.clone()), config, metrics);
        (svc, store, inventory)
    }

    #[test]
    fn adapter_selection_falls_back_to_none() {
        let (svc, _, _) = service(InventoryState::default(), QueryMode::Agent);
        assert_eq!(svc.adapter_for("a2s").name(), "a2s");
        assert_eq!(svc.adapter_for("http").name(), "http");
        assert_eq!(svc.adapter_for("rcon").name(), "rcon");
        assert_eq!(svc.adapter_for("gamespy").name(), "none");
    }

    #[tokio::test]
    async fn unknown_instance_is_none() {
        let (svc, _, _) = service(InventoryState::default(), QueryMode::Agent);
        assert!(svc.get_snapshot("nope", true, t0()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn agent_mode_respects_cooldown() {
        let (svc, store, _) = service(fleet("a2s", vec![27015, 27016]), QueryMode::Agent);

        let first = svc.get_snapshot("i1", true, t0()).await.unwrap().unwrap();
        assert_eq!(first.status.as_deref(), Some("queued"));
        assert!(!first.fresh);
        let jobs = store.list(Some(JobStatus::Queued), 10).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_type, "instance.query");
        assert_eq!(jobs[0].payload_str("query_port").as_deref(), Some("27016"));

        // inside the cooldown nothing new is queued
        svc.get_snapshot("i1", true, t0() + Duration::seconds(5)).await.unwrap();
        assert_eq!(store.list(None, 10).await.len(), 1);

        // after it, a second probe goes out
        svc.get_snapshot("i1", true, t0() + Duration::seconds(13)).await.unwrap();
        assert_eq!(store.list(None, 10).await.len(), 2);
    }

    #[tokio::test]
    async fn fresh_cache_and_non_queuing_reads_do_not_dispatch() {
        let mut s = fleet("a2s", vec![27015, 27016]);
        s.instances.get_mut("i1").unwrap().query_cache.checked_at = Some(t0() - Duration::seconds(5));
        let (svc, store, _) = service(s, QueryMode::Agent);
        let snap = svc.get_snapshot("i1", true, t0()).await.unwrap().unwrap();
        assert!(snap.fresh);
        let stale = svc.get_snapshot("i1", false, t0() + Duration::seconds(60)).await.unwrap().unwrap();
        assert!(!stale.fresh);
        assert!(store.list(None, 10).await.is_empty());
    }

    #[tokio::test]
    async fn stopped_instance_is_not_probed() {
        let mut s = fleet("a2s", vec![27015, 27016]);
        s.instances.get_mut("i1").unwrap().status = InstanceStatus::Stopped;
        let (svc, store, _) = service(s, QueryMode::Agent);
        svc.get_snapshot("i1", true, t0()).await.unwrap();
        assert!(store.list(None, 10).await.is_empty());
    }

    #[tokio::test]
    async fn backend_mode_probes_inline() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 1400];
            let (_, peer) = server.recv_from(&mut buf).await.unwrap();
            server.send_to(&a2s::tests::info_packet(6, 12), peer).await.unwrap();
        });

        let (svc, store, inventory) = service(fleet("a2s", vec![port, port]), QueryMode::Backend);
        let snap = svc.get_snapshot("i1", true, t0()).await.unwrap().unwrap();
        assert_eq!(snap.status.as_deref(), Some("online"));
        assert_eq!(snap.players, Some(6));
        assert_eq!(snap.max_players, Some(12));
        assert!(store.list(None, 10).await.is_empty());
        let cached = inventory.read(|s| s.instances["i1"].query_cache.checked_at).await;
        assert_eq!(cached, Some(t0()));
    }

    #[tokio::test]
    async fn backend_probe_times_out() {
        // bound but never answers
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();
        let (mut svc, _, _) = service(fleet("a2s", vec![port, port]), QueryMode::Backend);
        svc.config.probe_timeout_ms = 100;
        let snap = svc.get_snapshot("i1", true, t0()).await.unwrap().unwrap();
        assert_eq!(snap.status.as_deref(), Some("offline"));
        assert_eq!(snap.error.as_deref(), Some("Probe timed out after 100 ms"));
        drop(silent);
    }
}
