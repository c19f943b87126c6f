//! Authoritative domain records the engine reconciles and applies results to.
//!
//! CRUD surfaces that create these records live outside this crate; here they
//! are loaded from a JSON snapshot and mutated only by the result applier and
//! the reconciliation loops.

mod types;

pub use types::*;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::persist::{load_json, save_json};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InventoryState {
    #[serde(default)]
    pub nodes: BTreeMap<String, Node>,
    #[serde(default)]
    pub instances: BTreeMap<String, Instance>,
    #[serde(default)]
    pub port_blocks: BTreeMap<String, PortBlock>,
    #[serde(default)]
    pub voice_nodes: BTreeMap<String, VoiceNode>,
    #[serde(default)]
    pub virtual_servers: BTreeMap<String, VirtualServer>,
    #[serde(default)]
    pub bot_nodes: BTreeMap<String, BotNode>,
    #[serde(default)]
    pub ssh_keys: BTreeMap<String, SshKey>,
    #[serde(default)]
    pub schedules: BTreeMap<String, Schedule>,
    #[serde(default)]
    pub status_checks: BTreeMap<String, StatusCheck>,
}

impl InventoryState {
    /// Union of ports of every block bound to an instance, grouped by owning node.
    pub fn desired_ports_by_node(&self) -> BTreeMap<String, BTreeSet<u16>> {
        let mut out: BTreeMap<String, BTreeSet<u16>> = BTreeMap::new();
        for block in self.port_blocks.values() {
            let bound = block
                .instance_id
                .as_ref()
                .map(|id| self.instances.contains_key(id))
                .unwrap_or(false);
            if bound {
                out.entry(block.node_id.clone())
                    .or_default()
                    .extend(block.ports.iter().copied());
            }
        }
        out
    }

    /// Role name -> port for an instance, zipping its required roles with its block's ports.
    pub fn instance_ports(&self, instance_id: &str) -> BTreeMap<String, u16> {
        let Some(instance) = self.instances.get(instance_id) else { return BTreeMap::new() };
        let block = instance
            .port_block_id
            .as_ref()
            .and_then(|id| self.port_blocks.get(id))
            .or_else(|| {
                self.port_blocks
                    .values()
                    .find(|b| b.instance_id.as_deref() == Some(instance_id))
            });
        match block {
            Some(block) => instance
                .required_ports
                .iter()
                .cloned()
                .zip(block.ports.iter().copied())
                .collect(),
            None => BTreeMap::new(),
        }
    }
}

pub struct Inventory {
    state: Mutex<InventoryState>,
    data_dir: Option<PathBuf>,
}

impl Inventory {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { state: Mutex::new(InventoryState::default()), data_dir: Some(data_dir) }
    }

    pub fn in_memory(state: InventoryState) -> Self {
        Self { state: Mutex::new(state), data_dir: None }
    }

    fn state_file(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("inventory.json"))
    }

    pub async fn load_from_disk(&self) -> Result<(), StoreError> {
        let Some(path) = self.state_file() else { return Ok(()) };
        if let Some(loaded) = load_json::<InventoryState>(&path).await? {
            info!(
                nodes = loaded.nodes.len(),
                instances = loaded.instances.len(),
                schedules = loaded.schedules.len(),
                "Loaded inventory from disk"
            );
            *self.state.lock().await = loaded;
        }
        Ok(())
    }

    /// Cloned view for read-only passes.
    pub async fn snapshot(&self) -> InventoryState {
        self.state.lock().await.clone()
    }

    pub async fn read<T>(&self, f: impl FnOnce(&InventoryState) -> T) -> T {
        let state = self.state.lock().await;
        f(&*state)
    }

    /// Run `f` under the lock and persist the result. A failed save undoes `f`.
    pub async fn mutate<T>(&self, f: impl FnOnce(&mut InventoryState) -> T) -> Result<T, StoreError> {
        let mut state = self.state.lock().await;
        let Some(path) = self.state_file() else { return Ok(f(&mut *state)) };
        let before = state.clone();
        let out = f(&mut *state);
        if let Err(e) = save_json(&path, &*state).await {
            warn!(error=%e, "Failed to save inventory, change rolled back");
            *state = before;
            return Err(e);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(id: &str, node: &str, instance: Option<&str>, ports: &[u16]) -> PortBlock {
        PortBlock {
            id: id.into(),
            node_id: node.into(),
            instance_id: instance.map(str::to_string),
            ports: ports.to_vec(),
        }
    }

    #[test]
    fn desired_ports_skip_unbound_blocks() {
        let mut s = InventoryState::default();
        s.instances.insert("i1".into(), Instance::new("i1", "n1"));
        s.port_blocks.insert("b1".into(), block("b1", "n1", Some("i1"), &[27015, 27016]));
        s.port_blocks.insert("b2".into(), block("b2", "n1", None, &[28000]));
        s.port_blocks.insert("b3".into(), block("b3", "n2", Some("gone"), &[29000]));
        let desired = s.desired_ports_by_node();
        assert_eq!(desired.len(), 1);
        assert_eq!(desired["n1"], BTreeSet::from([27015, 27016]));
    }

    #[test]
    fn instance_ports_follow_role_order() {
        let mut s = InventoryState::default();
        let mut inst = Instance::new("i1", "n1");
        inst.port_block_id = Some("b1".into());
        inst.required_ports = vec!["game".into(), "query".into(), "rcon".into()];
        s.instances.insert("i1".into(), inst);
        s.port_blocks.insert("b1".into(), block("b1", "n1", Some("i1"), &[27015, 27016]));
        let ports = s.instance_ports("i1");
        assert_eq!(ports.get("game"), Some(&27015));
        assert_eq!(ports.get("query"), Some(&27016));
        assert_eq!(ports.get("rcon"), None);
    }

    #[tokio::test]
    async fn failed_save_rolls_back_mutation() {
        let blocker = std::env::temp_dir().join(format!("fleet-inv-blocker-{}", uuid::Uuid::new_v4()));
        std::fs::write(&blocker, b"").unwrap();
        let inventory = Inventory::new(blocker.clone());

        let res = inventory.mutate(|s| s.instances.insert("i1".into(), Instance::new("i1", "n1"))).await;
        assert!(res.is_err());
        assert!(inventory.read(|s| s.instances.is_empty()).await);
        let _ = std::fs::remove_file(blocker);
    }

    #[test]
    fn token_rotation_keeps_one_active() {
        let now = chrono::Utc::now();
        let mut vs = VirtualServer::default();
        assert!(vs.rotate_token("a", now));
        assert!(vs.rotate_token("b", now));
        assert!(!vs.rotate_token("b", now));
        assert_eq!(vs.tokens.iter().filter(|t| t.active).count(), 1);
        assert_eq!(vs.active_token().unwrap().token, "b");
    }
}
