//! Keel kubehub: kube client wiring, discovery of served source kinds and the
//! status-subresource writer behind [`StatusUpdater`].

#![forbid(unsafe_code)]

use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use keel_core::{SourceKey, SourceKind};
use keel_status::{StatusMutator, StatusUpdater};
use keel_translate::api_resource;
use kube::{
    api::{Api, Patch, PatchParams},
    core::DynamicObject,
    discovery::Discovery,
    Client,
};
use metrics::histogram;
use serde_json::{json, Value as Json};
use tracing::{debug, info};

/// Client from the ambient kubeconfig or in-cluster environment.
pub async fn client() -> Result<Client> {
    let client = Client::try_default().await.context("building kube client")?;
    debug!("kube client ready");
    Ok(client)
}

/// Source kinds whose group/version/kind the API server serves.
pub async fn served_kinds(client: Client) -> Result<Vec<SourceKind>> {
    let discovery = Discovery::new(client).run().await?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, _caps) in group.recommended_resources() {
            let api_version = if ar.group.is_empty() { ar.version.clone() } else { format!("{}/{}", ar.group, ar.version) };
            if let Some(kind) = SourceKind::from_type_meta(&api_version, &ar.kind) {
                out.push(kind);
            }
        }
    }
    out.sort_by_key(|k| k.name());
    out.dedup();
    Ok(out)
}

fn api_for(client: Client, kind: SourceKind, namespace: &str) -> Api<DynamicObject> {
    let ar = api_resource(kind);
    if kind.info().namespaced {
        Api::namespaced_with(client, namespace, &ar)
    } else {
        Api::all_with(client, &ar)
    }
}

/// Merge patch for the status subresource. Carrying `resourceVersion` makes
/// the write fail if the object changed since it was read.
fn status_patch(obj: &DynamicObject) -> Result<Json> {
    let status = obj.data.get("status").cloned().ok_or_else(|| anyhow!("object has no status after mutation"))?;
    let mut patch = json!({ "status": status });
    if let Some(rv) = obj.metadata.resource_version.as_deref() {
        patch["metadata"] = json!({ "resourceVersion": rv });
    }
    Ok(patch)
}

/// Writes conditions through the live API server.
#[derive(Clone)]
pub struct KubeStatusUpdater {
    client: Client,
    field_manager: String,
}

impl KubeStatusUpdater {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self { client, field_manager: field_manager.into() }
    }
}

#[async_trait::async_trait]
impl StatusUpdater for KubeStatusUpdater {
    async fn update(&self, kind: SourceKind, key: &SourceKey, mutate: StatusMutator) -> Result<()> {
        let t0 = Instant::now();
        let api = api_for(self.client.clone(), kind, &key.namespace);
        let mut obj = api.get(&key.name).await.with_context(|| format!("fetching {}", key))?;
        if !mutate(&mut obj) {
            debug!(%key, "status: unchanged; skip write");
            return Ok(());
        }
        let patch = status_patch(&obj)?;
        let pp = PatchParams { field_manager: Some(self.field_manager.clone()), ..Default::default() };
        let res = api.patch_status(&key.name, &pp, &Patch::Merge(&patch)).await;
        let status = if res.is_ok() { "success" } else { "failure" };
        histogram!("keel_status_update_duration_seconds", t0.elapsed().as_secs_f64(), "kind" => kind.name(), "status" => status);
        res.with_context(|| format!("patching status of {}", key))?;
        info!(%key, took_ms = %t0.elapsed().as_millis(), "status: updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_status::{conditions_mutator, SyncOutcome};

    fn route() -> DynamicObject {
        let mut o = DynamicObject::new("r1", &api_resource(SourceKind::ApisixRoute)).within("ns");
        o.metadata.resource_version = Some("42".into());
        o.metadata.generation = Some(2);
        o
    }

    #[test]
    fn patch_carries_status_and_resource_version() {
        let mut o = route();
        assert!(conditions_mutator(SyncOutcome::Accepted)(&mut o));
        let p = status_patch(&o).unwrap();
        assert_eq!(p["metadata"]["resourceVersion"], "42");
        assert_eq!(p["status"]["conditions"][0]["type"], "Accepted");
        assert_eq!(p["status"]["conditions"][0]["observedGeneration"], 2);
        assert!(p.get("spec").is_none());
    }

    #[test]
    fn patch_requires_status() {
        assert!(status_patch(&route()).is_err());
    }
}
