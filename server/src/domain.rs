//! §4.E Domain Registry — thread-safe host→[`DomainEntry`] map with
//! synchronous persistence to `server_domains.json` on every mutation.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::store::{load_json, save_json, StateStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEntry {
    pub public_port: u16,
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_pass: Option<String>,
    #[serde(default)]
    pub rate_limit: u32,
    #[serde(default)]
    pub smart_shield: bool,
}

const STORE_KEY: &str = "server_domains";

pub struct DomainRegistry {
    entries: DashMap<String, DomainEntry>,
    store: Arc<dyn StateStore>,
}

impl DomainRegistry {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        let entries: DashMap<String, DomainEntry> =
            load_json::<std::collections::HashMap<String, DomainEntry>>(store.as_ref(), STORE_KEY)
                .unwrap_or_default()
                .into_iter()
                .collect();
        DomainRegistry { entries, store }
    }

    fn persist(&self) {
        let snapshot: std::collections::HashMap<String, DomainEntry> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        save_json(self.store.as_ref(), STORE_KEY, &snapshot);
    }

    /// Adds or replaces a domain mapping. An empty `mode` normalizes to
    /// `"auto"` per §4.E.
    pub fn add(&self, host: String, mut entry: DomainEntry) {
        if entry.mode.is_empty() {
            entry.mode = "auto".to_string();
        }
        self.entries.insert(host, entry);
        self.persist();
    }

    pub fn remove(&self, host: &str) -> Option<DomainEntry> {
        let removed = self.entries.remove(host).map(|(_, v)| v);
        if removed.is_some() {
            self.persist();
        }
        removed
    }

    pub fn get(&self, host: &str) -> Option<DomainEntry> {
        self.entries.get(host).map(|e| e.value().clone())
    }

    pub fn exists(&self, host: &str) -> bool {
        self.entries.contains_key(host)
    }

    pub fn get_port(&self, host: &str) -> Option<u16> {
        self.entries.get(host).map(|e| e.public_port)
    }

    /// All hosts currently mapped to `public_port` — used to cascade
    /// `REQ_UNBIND`-triggered domain cleanup on the client side, and by
    /// tests exercising the server-side registry directly.
    pub fn hosts_for_port(&self, public_port: u16) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.value().public_port == public_port)
            .map(|e| e.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileStore;

    fn temp_registry() -> DomainRegistry {
        let dir = std::env::temp_dir().join(format!("tunnelcow-domain-{}", uuid::Uuid::new_v4()));
        DomainRegistry::new(Arc::new(FileStore::new(dir)))
    }

    #[test]
    fn empty_mode_normalizes_to_auto() {
        let reg = temp_registry();
        reg.add(
            "api.example".to_string(),
            DomainEntry {
                public_port: 9001,
                mode: "".to_string(),
                auth_user: None,
                auth_pass: None,
                rate_limit: 0,
                smart_shield: false,
            },
        );
        assert_eq!(reg.get("api.example").unwrap().mode, "auto");
    }

    #[test]
    fn remove_unknown_host_is_noop() {
        let reg = temp_registry();
        assert!(reg.remove("nope.example").is_none());
    }

    #[test]
    fn get_port_reflects_unbound_ports_too() {
        let reg = temp_registry();
        reg.add(
            "pre.example".to_string(),
            DomainEntry {
                public_port: 4242,
                mode: "auto".to_string(),
                auth_user: None,
                auth_pass: None,
                rate_limit: 0,
                smart_shield: false,
            },
        );
        assert_eq!(reg.get_port("pre.example"), Some(4242));
    }
}
