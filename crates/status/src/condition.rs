//! Accepted-condition construction and the object mutators that apply it.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use keel_core::SourceKey;
use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tracing::warn;

use crate::{StatusMutator, SyncOutcome};

pub const CONDITION_ACCEPTED: &str = "Accepted";
pub const REASON_ACCEPTED: &str = "Accepted";
pub const REASON_SYNC_FAILED: &str = "SyncFailed";

/// `Accepted` condition for a sync outcome at the given object generation.
pub fn sync_condition(outcome: &SyncOutcome, generation: Option<i64>) -> Condition {
    let (status, reason, message) = match outcome {
        SyncOutcome::Accepted => ("True", REASON_ACCEPTED, String::new()),
        SyncOutcome::Failed { message } => ("False", REASON_SYNC_FAILED, message.clone()),
    };
    Condition {
        type_: CONDITION_ACCEPTED.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message,
        observed_generation: generation,
        last_transition_time: Time(chrono::Utc::now()),
    }
}

/// Set a condition keyed by type. Returns false when an identical condition
/// (status, reason, message, generation) is already present. The transition
/// time only moves when the status flips.
pub fn set_condition(conditions: &mut Vec<Condition>, mut cond: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == cond.type_) {
        Some(cur) => {
            if cur.status == cond.status
                && cur.reason == cond.reason
                && cur.message == cond.message
                && cur.observed_generation == cond.observed_generation
            {
                return false;
            }
            if cur.status == cond.status {
                cond.last_transition_time = cur.last_transition_time.clone();
            }
            *cur = cond;
            true
        }
        None => {
            conditions.push(cond);
            true
        }
    }
}

fn status_object(obj: &mut DynamicObject) -> Option<&mut Map<String, Json>> {
    if obj.data.is_null() {
        obj.data = Json::Object(Map::new());
    }
    let root = obj.data.as_object_mut()?;
    let status = root.entry("status").or_insert_with(|| Json::Object(Map::new()));
    if status.is_null() {
        *status = Json::Object(Map::new());
    }
    status.as_object_mut()
}

/// Mutator for kinds that carry `status.conditions` directly.
pub fn conditions_mutator(outcome: SyncOutcome) -> StatusMutator {
    Box::new(move |obj: &mut DynamicObject| {
        let cond = sync_condition(&outcome, obj.metadata.generation);
        let Some(status) = status_object(obj) else { return false };
        let mut conditions: Vec<Condition> = match status.get("conditions") {
            Some(v) => match serde_json::from_value(v.clone()) {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "status: unreadable conditions; replacing");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        if !set_condition(&mut conditions, cond) {
            return false;
        }
        match serde_json::to_value(&conditions) {
            Ok(v) => {
                status.insert("conditions".to_string(), v);
                true
            }
            Err(e) => {
                warn!(error = %e, "status: encoding conditions failed");
                false
            }
        }
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParentReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    name: String,
    #[serde(flatten)]
    rest: Map<String, Json>,
}

impl ParentReference {
    /// Parent gateway key; namespace defaults to the route's, kind to `Gateway`.
    fn resolve(&self, route_namespace: &str) -> SourceKey {
        SourceKey {
            name: self.name.clone(),
            namespace: self.namespace.clone().unwrap_or_else(|| route_namespace.to_string()),
            kind: self.kind.clone().unwrap_or_else(|| "Gateway".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RouteParentStatus {
    parent_ref: ParentReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    controller_name: Option<String>,
    #[serde(default)]
    conditions: Vec<Condition>,
    #[serde(flatten)]
    rest: Map<String, Json>,
}

/// Mutator for Gateway API routes: sets the condition on the
/// `status.parents[]` entries whose parent is one of `gateways`. Entries of
/// other parents, or written by another controller, are left untouched.
pub fn route_parents_mutator(outcome: SyncOutcome, gateways: Vec<SourceKey>, controller_name: String) -> StatusMutator {
    Box::new(move |obj: &mut DynamicObject| {
        let cond = sync_condition(&outcome, obj.metadata.generation);
        let route_ns = obj.metadata.namespace.clone().unwrap_or_default();
        let Some(status) = status_object(obj) else { return false };
        let Some(raw) = status.get("parents") else { return false };
        let mut parents: Vec<RouteParentStatus> = match serde_json::from_value(raw.clone()) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "status: unreadable route parents; skip");
                return false;
            }
        };
        let mut changed = false;
        for p in parents.iter_mut() {
            if p.controller_name.as_deref().is_some_and(|c| c != controller_name) {
                continue;
            }
            if !gateways.contains(&p.parent_ref.resolve(&route_ns)) {
                continue;
            }
            changed |= set_condition(&mut p.conditions, cond.clone());
        }
        if !changed {
            return false;
        }
        match serde_json::to_value(&parents) {
            Ok(v) => {
                status.insert("parents".to_string(), v);
                true
            }
            Err(e) => {
                warn!(error = %e, "status: encoding route parents failed");
                false
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::{ApiResource, GroupVersionKind};
    use serde_json::json;

    fn object(kind: &str, status: Json) -> DynamicObject {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("apisix.apache.org", "v2", kind));
        let mut o = DynamicObject::new("r1", &ar).within("ns").data(json!({ "status": status }));
        o.metadata.generation = Some(3);
        o
    }

    fn conditions(o: &DynamicObject, path: &[&str]) -> Vec<Condition> {
        let mut v = &o.data["status"];
        for p in path {
            v = &v[*p];
        }
        serde_json::from_value(v.clone()).unwrap()
    }

    #[test]
    fn conditions_mutator_sets_then_is_idempotent() {
        let mut o = object("ApisixRoute", Json::Null);
        let failed = SyncOutcome::Failed { message: "ServerAddr: a, Error: b".into() };
        assert!(conditions_mutator(failed.clone())(&mut o));
        let c = conditions(&o, &["conditions"]);
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].status, "False");
        assert_eq!(c[0].reason, REASON_SYNC_FAILED);
        assert_eq!(c[0].observed_generation, Some(3));
        assert!(!conditions_mutator(failed)(&mut o), "same condition must not be rewritten");

        assert!(conditions_mutator(SyncOutcome::Accepted)(&mut o));
        let c = conditions(&o, &["conditions"]);
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].status, "True");
        assert_eq!(c[0].message, "");
    }

    #[test]
    fn set_condition_keeps_transition_time_when_status_holds() {
        let mut cs = vec![sync_condition(&SyncOutcome::Failed { message: "a".into() }, Some(1))];
        let first = cs[0].last_transition_time.clone();
        assert!(set_condition(&mut cs, sync_condition(&SyncOutcome::Failed { message: "b".into() }, Some(1))));
        assert_eq!(cs[0].last_transition_time, first);
        assert_eq!(cs[0].message, "b");
    }

    #[test]
    fn route_mutator_touches_only_current_gateways() {
        let status = json!({
            "parents": [
                { "parentRef": { "name": "gw" }, "controllerName": "keel", "conditions": [] },
                { "parentRef": { "name": "gw", "namespace": "other" }, "controllerName": "keel", "conditions": [] },
                { "parentRef": { "name": "gw" }, "controllerName": "someone-else", "conditions": [] },
                { "parentRef": { "name": "ls", "kind": "ListenerSet" }, "controllerName": "keel", "conditions": [] }
            ]
        });
        let mut o = object("HTTPRoute", status);
        let gateways = vec![SourceKey::new("gw", "ns", "Gateway")];
        let failed = SyncOutcome::Failed { message: "boom".into() };
        assert!(route_parents_mutator(failed, gateways, "keel".into())(&mut o));
        let counts: Vec<usize> = (0..4)
            .map(|i| {
                let v = o.data["status"]["parents"][i]["conditions"].clone();
                serde_json::from_value::<Vec<Condition>>(v).unwrap().len()
            })
            .collect();
        assert_eq!(counts, vec![1, 0, 0, 0]);
        assert_eq!(o.data["status"]["parents"][2]["controllerName"], "someone-else");
    }

    #[test]
    fn route_mutator_without_parents_is_noop() {
        let mut o = object("HTTPRoute", json!({}));
        assert!(!route_parents_mutator(SyncOutcome::Accepted, vec![SourceKey::new("gw", "ns", "Gateway")], "keel".into())(&mut o));
    }
}
