//! Backend config registry and the reverse index from source objects to the
//! backend keys they currently target.

use std::collections::{BTreeMap, BTreeSet};

use keel_core::{Config, SourceKey};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct ConfigManager {
    /// Backend key (e.g. the parent Gateway) -> resolved connection config.
    configs: FxHashMap<SourceKey, Config>,
    /// Source object -> backend keys it is associated with.
    refs: FxHashMap<SourceKey, BTreeSet<SourceKey>>,
}

impl ConfigManager {
    pub fn new() -> Self { Self::default() }

    /// Replace the backend keys associated with `key`. An empty set clears it.
    pub fn set_config_refs(&mut self, key: &SourceKey, refs: impl IntoIterator<Item = SourceKey>) {
        let refs: BTreeSet<SourceKey> = refs.into_iter().collect();
        debug!(key = %key, refs = refs.len(), "config: set refs");
        if refs.is_empty() {
            self.refs.remove(key);
        } else {
            self.refs.insert(key.clone(), refs);
        }
    }

    pub fn delete_config_refs(&mut self, key: &SourceKey) {
        self.refs.remove(key);
    }

    /// Backend keys currently associated with a source object, sorted.
    pub fn get_config_refs_by_resource_key(&self, key: &SourceKey) -> Vec<SourceKey> {
        self.refs.get(key).map(|s| s.iter().cloned().collect()).unwrap_or_default()
    }

    /// Resolved configs for the backend keys of a source object. Keys
    /// without a registered config are skipped.
    pub fn get_configs_by_resource_key(&self, key: &SourceKey) -> Vec<Config> {
        let mut out: Vec<Config> = Vec::new();
        for backend in self.refs.get(key).into_iter().flatten() {
            if let Some(cfg) = self.configs.get(backend) {
                if !out.iter().any(|c| c.name == cfg.name) {
                    out.push(cfg.clone());
                }
            }
        }
        out
    }

    pub fn get_config(&self, backend: &SourceKey) -> Option<&Config> {
        self.configs.get(backend)
    }

    /// Register or replace the config of a backend. Returns another backend
    /// already registered under the same config name; full syncs see only
    /// one config per name, so such a pair shares a single push.
    pub fn update_config(&mut self, backend: SourceKey, config: Config) -> Option<SourceKey> {
        debug!(backend = %backend, config = %config.name, "config: update");
        let clash = self.configs.iter().find(|(k, c)| **k != backend && c.name == config.name).map(|(k, _)| k.clone());
        if let Some(other) = &clash {
            warn!(backend = %backend, other = %other, config = %config.name, "config: name already used by another backend");
        }
        self.configs.insert(backend, config);
        clash
    }

    /// Forget a backend config and every reference to it.
    pub fn delete_config(&mut self, backend: &SourceKey) -> Option<Config> {
        let removed = self.configs.remove(backend);
        self.refs.retain(|_, set| {
            set.remove(backend);
            !set.is_empty()
        });
        removed
    }

    /// All known configs keyed by config name; the input of a full sync.
    pub fn configs_by_name(&self) -> BTreeMap<String, Config> {
        self.configs.values().map(|c| (c.name.clone(), c.clone())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(name: &str) -> Config {
        Config { name: name.into(), server_addrs: vec![format!("http://{}:9180", name)], ..Default::default() }
    }

    #[test]
    fn refs_resolve_to_configs() {
        let mut m = ConfigManager::new();
        let gw = SourceKey::new("gw", "ns", "Gateway");
        let route = SourceKey::new("r", "ns", "HTTPRoute");
        m.update_config(gw.clone(), cfg("c1"));
        m.set_config_refs(&route, [gw.clone(), SourceKey::new("other", "ns", "Gateway")]);
        assert_eq!(m.get_config_refs_by_resource_key(&route).len(), 2);
        let cfgs = m.get_configs_by_resource_key(&route);
        assert_eq!(cfgs.len(), 1);
        assert_eq!(cfgs[0].name, "c1");
    }

    #[test]
    fn delete_config_drops_dangling_refs() {
        let mut m = ConfigManager::new();
        let gw = SourceKey::new("gw", "ns", "Gateway");
        let route = SourceKey::new("r", "ns", "HTTPRoute");
        m.update_config(gw.clone(), cfg("c1"));
        m.set_config_refs(&route, [gw.clone()]);
        assert!(m.delete_config(&gw).is_some());
        assert!(m.get_config_refs_by_resource_key(&route).is_empty());
        assert!(m.configs_by_name().is_empty());
    }

    #[test]
    fn empty_refs_clear_entry() {
        let mut m = ConfigManager::new();
        let route = SourceKey::new("r", "ns", "HTTPRoute");
        m.set_config_refs(&route, [SourceKey::new("gw", "ns", "Gateway")]);
        m.set_config_refs(&route, []);
        assert!(m.get_config_refs_by_resource_key(&route).is_empty());
    }

    #[test]
    fn shared_config_name_is_reported() {
        let mut m = ConfigManager::new();
        let a = SourceKey::new("gw-a", "ns", "Gateway");
        let b = SourceKey::new("gw-b", "ns", "Gateway");
        assert_eq!(m.update_config(a.clone(), cfg("c1")), None);
        assert_eq!(m.update_config(a.clone(), cfg("c1")), None, "re-registering the same backend is fine");
        assert_eq!(m.update_config(b, cfg("c1")), Some(a));
        assert_eq!(m.configs_by_name().len(), 1);
    }
}
