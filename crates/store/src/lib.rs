//! Keel store: per-backend cache of the gateway resources contributed by
//! every source object, with an owner index for error correlation.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use keel_core::{Consumer, Identified, Labels, PluginMap, ResourceType, Resources, Service, SourceKey, Ssl};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub mod config;

pub use config::ConfigManager;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("config name must not be empty")]
    EmptyConfigName,
    #[error("labels do not identify an owning object (need k8s/name and k8s/kind)")]
    MissingOwner,
    #[error("{resource_type} without id")]
    MissingId { resource_type: ResourceType },
    #[error("{resource_type} {id} in config {config} is already owned by {owner}")]
    Conflict { config: String, resource_type: ResourceType, id: String, owner: SourceKey },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Global-rule plugins contributed by one source object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalRule {
    pub owner: SourceKey,
    pub plugins: PluginMap,
}

#[derive(Debug, Clone)]
struct Owned<T> {
    owner: SourceKey,
    item: T,
}

#[derive(Debug, Default)]
struct Entry {
    services: BTreeMap<String, Owned<Service>>,
    ssls: BTreeMap<String, Owned<Ssl>>,
    consumers: BTreeMap<String, Owned<Consumer>>,
    global_rules: BTreeMap<SourceKey, PluginMap>,
    plugin_metadata: BTreeMap<SourceKey, PluginMap>,
    /// Labels of every object that currently owns something in this entry.
    owners: BTreeMap<SourceKey, Labels>,
    /// (type, id) -> owner for services, ssls and consumers.
    index: FxHashMap<(ResourceType, String), SourceKey>,
}

impl Entry {
    fn is_empty(&self) -> bool {
        self.services.is_empty()
            && self.ssls.is_empty()
            && self.consumers.is_empty()
            && self.global_rules.is_empty()
            && self.plugin_metadata.is_empty()
    }

    fn check_ids<T: Identified>(&self, config: &str, rt: ResourceType, owner: &SourceKey, items: &[T]) -> StoreResult<()> {
        for it in items {
            if it.id().is_empty() {
                return Err(StoreError::MissingId { resource_type: rt });
            }
            if let Some(cur) = self.index.get(&(rt, it.id().to_string())) {
                if cur != owner {
                    return Err(StoreError::Conflict {
                        config: config.to_string(),
                        resource_type: rt,
                        id: it.id().to_string(),
                        owner: cur.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn validate(&self, config: &str, types: &[ResourceType], owner: &SourceKey, resources: &Resources) -> StoreResult<()> {
        for rt in types {
            match rt {
                ResourceType::Service => self.check_ids(config, *rt, owner, &resources.services)?,
                ResourceType::Ssl => self.check_ids(config, *rt, owner, &resources.ssls)?,
                ResourceType::Consumer => self.check_ids(config, *rt, owner, &resources.consumers)?,
                ResourceType::GlobalRule | ResourceType::PluginMetadata => {}
            }
        }
        Ok(())
    }

    fn remove_owned(&mut self, rt: ResourceType, owner: &SourceKey) {
        fn drain<T>(map: &mut BTreeMap<String, Owned<T>>, index: &mut FxHashMap<(ResourceType, String), SourceKey>, rt: ResourceType, owner: &SourceKey) {
            map.retain(|id, o| {
                if &o.owner == owner {
                    index.remove(&(rt, id.clone()));
                    false
                } else {
                    true
                }
            });
        }
        match rt {
            ResourceType::Service => drain(&mut self.services, &mut self.index, rt, owner),
            ResourceType::Ssl => drain(&mut self.ssls, &mut self.index, rt, owner),
            ResourceType::Consumer => drain(&mut self.consumers, &mut self.index, rt, owner),
            ResourceType::GlobalRule => { self.global_rules.remove(owner); }
            ResourceType::PluginMetadata => { self.plugin_metadata.remove(owner); }
        }
    }

    fn owns_anything(&self, owner: &SourceKey) -> bool {
        self.global_rules.contains_key(owner)
            || self.plugin_metadata.contains_key(owner)
            || self.index.values().any(|k| k == owner)
    }
}

fn put_all<T: Identified + Clone>(
    map: &mut BTreeMap<String, Owned<T>>,
    index: &mut FxHashMap<(ResourceType, String), SourceKey>,
    rt: ResourceType,
    owner: &SourceKey,
    items: &[T],
) {
    for it in items {
        index.insert((rt, it.id().to_string()), owner.clone());
        map.insert(it.id().to_string(), Owned { owner: owner.clone(), item: it.clone() });
    }
}

fn declared(resource_types: &[ResourceType]) -> &[ResourceType] {
    if resource_types.is_empty() { &ResourceType::ALL } else { resource_types }
}

/// Merge plugin maps in ascending owner order; on a colliding plugin name the
/// greatest owner key wins.
fn merge_plugins<'a>(maps: impl Iterator<Item = &'a PluginMap>) -> PluginMap {
    let mut out = PluginMap::new();
    for m in maps {
        for (k, v) in m {
            out.insert(k.clone(), v.clone());
        }
    }
    out
}

/// Resource cache keyed by backend config name.
#[derive(Debug, Default)]
pub struct Store {
    entries: FxHashMap<String, Entry>,
}

impl Store {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Replace everything the owner named by `labels` contributes to
    /// `config_name` for the declared resource types (empty = all types).
    ///
    /// Validation runs before any mutation, so a failed insert leaves this
    /// config untouched.
    pub fn insert(&mut self, config_name: &str, resource_types: &[ResourceType], resources: &Resources, labels: &Labels) -> StoreResult<()> {
        if config_name.is_empty() {
            return Err(StoreError::EmptyConfigName);
        }
        let owner = SourceKey::from_labels(labels).ok_or(StoreError::MissingOwner)?;
        let types = declared(resource_types);
        let entry = self.entries.entry(config_name.to_string()).or_default();
        if let Err(e) = entry.validate(config_name, types, &owner, resources) {
            if entry.is_empty() {
                self.entries.remove(config_name);
            }
            return Err(e);
        }
        for rt in types {
            entry.remove_owned(*rt, &owner);
            match rt {
                ResourceType::Service => put_all(&mut entry.services, &mut entry.index, *rt, &owner, &resources.services),
                ResourceType::Ssl => put_all(&mut entry.ssls, &mut entry.index, *rt, &owner, &resources.ssls),
                ResourceType::Consumer => put_all(&mut entry.consumers, &mut entry.index, *rt, &owner, &resources.consumers),
                ResourceType::GlobalRule => {
                    if !resources.global_rules.is_empty() {
                        entry.global_rules.insert(owner.clone(), resources.global_rules.clone());
                    }
                }
                ResourceType::PluginMetadata => {
                    if !resources.plugin_metadata.is_empty() {
                        entry.plugin_metadata.insert(owner.clone(), resources.plugin_metadata.clone());
                    }
                }
            }
        }
        if entry.owns_anything(&owner) {
            entry.owners.insert(owner.clone(), labels.clone());
        } else {
            entry.owners.remove(&owner);
        }
        if entry.is_empty() {
            self.entries.remove(config_name);
        }
        debug!(config = %config_name, owner = %owner, types = %ResourceType::join(types), "store: insert");
        Ok(())
    }

    /// Drop everything the owner contributes to `config_name` for the declared types.
    pub fn delete(&mut self, config_name: &str, resource_types: &[ResourceType], labels: &Labels) -> StoreResult<()> {
        if config_name.is_empty() {
            return Err(StoreError::EmptyConfigName);
        }
        let owner = SourceKey::from_labels(labels).ok_or(StoreError::MissingOwner)?;
        let types = declared(resource_types);
        let Some(entry) = self.entries.get_mut(config_name) else { return Ok(()) };
        for rt in types {
            entry.remove_owned(*rt, &owner);
        }
        if !entry.owns_anything(&owner) {
            entry.owners.remove(&owner);
        }
        if entry.is_empty() {
            self.entries.remove(config_name);
        }
        debug!(config = %config_name, owner = %owner, types = %ResourceType::join(types), "store: delete");
        Ok(())
    }

    /// Merged desired state for a config, or `None` when nothing targets it.
    pub fn get_resources(&self, config_name: &str) -> Option<Resources> {
        let entry = self.entries.get(config_name)?;
        Some(Resources {
            services: entry.services.values().map(|o| o.item.clone()).collect(),
            ssls: entry.ssls.values().map(|o| o.item.clone()).collect(),
            consumers: entry.consumers.values().map(|o| o.item.clone()).collect(),
            global_rules: merge_plugins(entry.global_rules.values()),
            plugin_metadata: merge_plugins(entry.plugin_metadata.values()),
        })
    }

    /// Every global-rule contribution stored for a config, in ascending owner order.
    pub fn list_global_rules(&self, config_name: &str) -> Vec<GlobalRule> {
        self.entries
            .get(config_name)
            .map(|e| {
                e.global_rules
                    .iter()
                    .map(|(owner, plugins)| GlobalRule { owner: owner.clone(), plugins: plugins.clone() })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Global rules of a config merged into one plugin map.
    pub fn merged_global_rules(&self, config_name: &str) -> PluginMap {
        self.entries.get(config_name).map(|e| merge_plugins(e.global_rules.values())).unwrap_or_default()
    }

    /// Ids of the stored services, ssls or consumers of a config.
    pub fn resource_ids(&self, config_name: &str, resource_type: ResourceType) -> Vec<String> {
        let Some(e) = self.entries.get(config_name) else { return Vec::new() };
        match resource_type {
            ResourceType::Service => e.services.keys().cloned().collect(),
            ResourceType::Ssl => e.ssls.keys().cloned().collect(),
            ResourceType::Consumer => e.consumers.keys().cloned().collect(),
            ResourceType::GlobalRule => merge_plugins(e.global_rules.values()).into_keys().collect(),
            ResourceType::PluginMetadata => merge_plugins(e.plugin_metadata.values()).into_keys().collect(),
        }
    }

    /// Owning object of a stored resource.
    ///
    /// Global rules and plugin metadata are keyed by plugin name; the owner is
    /// the contribution that wins the merge.
    pub fn owner_of(&self, config_name: &str, resource_type: ResourceType, resource_id: &str) -> Option<&SourceKey> {
        let e = self.entries.get(config_name)?;
        match resource_type {
            ResourceType::GlobalRule => e.global_rules.iter().rev().find(|(_, p)| p.contains_key(resource_id)).map(|(k, _)| k),
            ResourceType::PluginMetadata => e.plugin_metadata.iter().rev().find(|(_, p)| p.contains_key(resource_id)).map(|(k, _)| k),
            _ => e.index.get(&(resource_type, resource_id.to_string())),
        }
    }

    /// Labels the owning task carried when the resource was inserted.
    pub fn labels_of(&self, config_name: &str, resource_type: ResourceType, resource_id: &str) -> Option<&Labels> {
        let owner = self.owner_of(config_name, resource_type, resource_id)?;
        self.entries.get(config_name)?.owners.get(owner)
    }

    /// Config names with at least one stored resource, sorted.
    pub fn config_names(&self) -> Vec<String> {
        let mut v: Vec<String> = self.entries.keys().cloned().collect();
        v.sort();
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn svc(id: &str) -> Service {
        Service { id: id.into(), name: id.into(), ..Default::default() }
    }

    fn rules(pairs: &[(&str, serde_json::Value)]) -> Resources {
        Resources { global_rules: pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(), ..Default::default() }
    }

    #[test]
    fn insert_replaces_owned_items_of_declared_type() {
        let mut s = Store::new();
        let owner = SourceKey::new("r1", "ns", "ApisixRoute").labels();
        let first = Resources { services: vec![svc("a"), svc("b")], ..Default::default() };
        s.insert("c1", &[ResourceType::Service], &first, &owner).unwrap();
        let second = Resources { services: vec![svc("b")], ..Default::default() };
        s.insert("c1", &[ResourceType::Service], &second, &owner).unwrap();
        assert_eq!(s.resource_ids("c1", ResourceType::Service), vec!["b".to_string()]);
        assert_eq!(s.owner_of("c1", ResourceType::Service, "a"), None);
    }

    #[test]
    fn undeclared_types_are_left_alone() {
        let mut s = Store::new();
        let owner = SourceKey::new("gw", "ns", "Gateway").labels();
        let res = Resources { ssls: vec![Ssl { id: "t1".into(), ..Default::default() }], ..rules(&[("cors", json!({}))]) };
        s.insert("c1", &[], &res, &owner).unwrap();
        s.insert("c1", &[ResourceType::Ssl], &Resources::default(), &owner).unwrap();
        assert!(s.resource_ids("c1", ResourceType::Ssl).is_empty());
        assert_eq!(s.list_global_rules("c1").len(), 1);
    }

    #[test]
    fn conflicting_owner_is_rejected_without_mutation() {
        let mut s = Store::new();
        let a = SourceKey::new("a", "ns", "ApisixRoute").labels();
        let b = SourceKey::new("b", "ns", "ApisixRoute").labels();
        s.insert("c1", &[ResourceType::Service], &Resources { services: vec![svc("x")], ..Default::default() }, &a).unwrap();
        let res = Resources { services: vec![svc("y"), svc("x")], ..Default::default() };
        let err = s.insert("c1", &[ResourceType::Service], &res, &b).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }), "err={}", err);
        assert_eq!(s.resource_ids("c1", ResourceType::Service), vec!["x".to_string()]);
    }

    #[test]
    fn missing_owner_labels_error() {
        let mut s = Store::new();
        let err = s.insert("c1", &[], &Resources::default(), &Labels::new()).unwrap_err();
        assert_eq!(err, StoreError::MissingOwner);
        assert_eq!(s.insert("", &[], &Resources::default(), &Labels::new()).unwrap_err(), StoreError::EmptyConfigName);
    }

    #[test]
    fn global_rules_merge_with_deterministic_tie_break() {
        let mut s = Store::new();
        let a = SourceKey::new("a", "ns", "ApisixGlobalRule").labels();
        let b = SourceKey::new("b", "ns", "ApisixGlobalRule").labels();
        // insert the later owner first; order of insertion must not matter
        s.insert("c1", &[ResourceType::GlobalRule], &rules(&[("b", json!(2)), ("x", json!("from-b"))]), &b).unwrap();
        s.insert("c1", &[ResourceType::GlobalRule], &rules(&[("a", json!(1)), ("x", json!("from-a"))]), &a).unwrap();
        let merged = s.merged_global_rules("c1");
        assert_eq!(merged.get("a"), Some(&json!(1)));
        assert_eq!(merged.get("b"), Some(&json!(2)));
        assert_eq!(merged.get("x"), Some(&json!("from-b")));
        assert_eq!(s.owner_of("c1", ResourceType::GlobalRule, "x").map(|k| k.name.as_str()), Some("b"));
    }

    #[test]
    fn delete_drops_entry_when_empty() {
        let mut s = Store::new();
        let owner = SourceKey::new("r1", "ns", "ApisixRoute").labels();
        s.insert("c1", &[ResourceType::Service], &Resources { services: vec![svc("a")], ..Default::default() }, &owner).unwrap();
        s.delete("c1", &[ResourceType::Service], &owner).unwrap();
        assert!(s.get_resources("c1").is_none());
        assert!(s.is_empty());
        // deleting from an unknown config is a no-op
        s.delete("nope", &[], &owner).unwrap();
    }
}
