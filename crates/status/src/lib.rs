//! Keel status: maps execution errors back to the source objects that own
//! the failing resources and turns the change in failures between two sync
//! cycles into condition updates.
//!
//! Everything here is a pure function of its inputs. The provider owns the
//! previous-failure snapshot and feeds it in.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use keel_core::{ExecutionError, ResourceType, SourceKey, SourceKind, StatusShape};
use keel_store::{ConfigManager, Store};
use kube::core::DynamicObject;
use tracing::debug;

pub mod condition;

pub use condition::{conditions_mutator, route_parents_mutator, set_condition, sync_condition};

/// Source objects failing in one cycle and the messages explaining why.
pub type FailureSnapshot = BTreeMap<SourceKey, Vec<String>>;

/// Mutates a fresh copy of an object; returns whether anything changed.
pub type StatusMutator = Box<dyn FnOnce(&mut DynamicObject) -> bool + Send>;

/// Writes a condition mutation to a live object.
#[async_trait::async_trait]
pub trait StatusUpdater: Send + Sync {
    async fn update(&self, kind: SourceKind, key: &SourceKey, mutate: StatusMutator) -> anyhow::Result<()>;
}

/// Outcome of the last sync for one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Accepted,
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub key: SourceKey,
    pub outcome: SyncOutcome,
}

fn push(out: &mut FailureSnapshot, key: &SourceKey, msg: &str) {
    out.entry(key.clone()).or_default().push(msg.to_string());
}

/// Resolve this cycle's execution errors to owning objects.
///
/// A server error without per-resource entries fails everything stored for
/// that config: every service, consumer and ssl, and every global-rule
/// contribution.
pub fn resolve<'a>(errors: impl IntoIterator<Item = &'a ExecutionError>, store: &Store) -> FailureSnapshot {
    let mut out = FailureSnapshot::new();
    for err in errors {
        let config = err.config_name.as_str();
        for server in &err.failed_errors {
            if server.is_broad() {
                let msg = server.to_string();
                for rt in [ResourceType::Service, ResourceType::Consumer, ResourceType::Ssl] {
                    for id in store.resource_ids(config, rt) {
                        if let Some(owner) = store.owner_of(config, rt, &id) {
                            push(&mut out, owner, &msg);
                        }
                    }
                }
                for rule in store.list_global_rules(config) {
                    push(&mut out, &rule.owner, &msg);
                }
                continue;
            }
            for fs in &server.failed_statuses {
                match store.owner_of(config, fs.resource_type, &fs.resource_id) {
                    Some(owner) => {
                        let msg = format!("ServerAddr: {}, Error: {}", server.server_addr, fs.reason);
                        push(&mut out, owner, &msg);
                    }
                    None => debug!(config, resource_type = %fs.resource_type, id = %fs.resource_id, "status: no owner for failed resource"),
                }
            }
        }
    }
    out
}

/// Join an object's messages; repeats of the same message collapse.
pub fn join_messages(msgs: &[String]) -> String {
    let mut seen: Vec<&str> = Vec::with_capacity(msgs.len());
    for m in msgs {
        if !seen.contains(&m.as_str()) {
            seen.push(m);
        }
    }
    seen.join("; ")
}

/// Status transitions between two snapshots.
///
/// Every currently failing object gets a failure condition. Objects that
/// failed before and no longer do are marked accepted. Objects absent from
/// both are left alone.
pub fn diff(previous: &FailureSnapshot, current: &FailureSnapshot) -> Vec<StatusUpdate> {
    let mut out: Vec<StatusUpdate> = current
        .iter()
        .map(|(key, msgs)| StatusUpdate { key: key.clone(), outcome: SyncOutcome::Failed { message: join_messages(msgs) } })
        .collect();
    out.extend(
        previous
            .keys()
            .filter(|k| !current.contains_key(*k))
            .map(|k| StatusUpdate { key: k.clone(), outcome: SyncOutcome::Accepted }),
    );
    out
}

/// A status update ready to hand to a [`StatusUpdater`].
pub struct PlannedUpdate {
    pub kind: SourceKind,
    pub key: SourceKey,
    pub mutate: StatusMutator,
}

/// Pick the mutator for an update by the owner's kind. Route kinds only touch
/// parent entries of the gateways the route is currently associated with.
/// Kinds without a sync condition yield `None`.
pub fn plan(update: &StatusUpdate, configs: &ConfigManager, controller_name: &str) -> Option<PlannedUpdate> {
    let kind = SourceKind::from_name(&update.key.kind)?;
    let mutate = match kind.status_shape() {
        StatusShape::Conditions => conditions_mutator(update.outcome.clone()),
        StatusShape::RouteParents => {
            let gateways = configs.get_config_refs_by_resource_key(&update.key);
            route_parents_mutator(update.outcome.clone(), gateways, controller_name.to_string())
        }
        StatusShape::None => {
            debug!(key = %update.key, "status: kind has no sync condition; skip");
            return None;
        }
    };
    Some(PlannedUpdate { kind, key: update.key.clone(), mutate })
}
