//! Offline input for keelctl: backends plus pre-translated objects whose
//! `spec` carries gateway resources verbatim.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use keel_core::{Config, Resources, SourceKey, SourceKind};
use keel_translate::{HandlerRegistry, SourceObject, TranslateContext, TranslateResult};
use kube::core::DynamicObject;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct GatewayRef {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_namespace() -> String { "default".to_string() }

#[derive(Debug, Deserialize)]
pub struct Backend {
    /// Gateway that owns this backend.
    pub gateway: GatewayRef,
    #[serde(flatten)]
    pub config: Config,
}

impl Backend {
    pub fn key(&self) -> SourceKey { SourceKey::new(&self.gateway.name, &self.gateway.namespace, SourceKind::Gateway.name()) }
}

#[derive(Debug, Deserialize)]
pub struct Entry {
    /// Config names this object targets.
    pub backends: Vec<String>,
    pub object: DynamicObject,
}

#[derive(Debug, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub backends: Vec<Backend>,
    #[serde(default)]
    pub objects: Vec<Entry>,
}

impl Manifest {
    /// Read YAML (or JSON, which is YAML) from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    /// Each object classified and paired with the backends it targets.
    pub fn sources(&self) -> Result<Vec<(TranslateContext, SourceObject)>> {
        let by_name: BTreeMap<&str, &Backend> = self.backends.iter().map(|b| (b.config.name.as_str(), b)).collect();
        let mut out = Vec::with_capacity(self.objects.len());
        for entry in &self.objects {
            let obj = SourceObject::from_dynamic(entry.object.clone())?;
            let mut ctx = TranslateContext::default();
            for name in &entry.backends {
                let b = by_name.get(name.as_str()).ok_or_else(|| anyhow!("{}: unknown backend {:?}", obj.key(), name))?;
                ctx = ctx.with_backend(b.key(), b.config.clone());
            }
            out.push((ctx, obj));
        }
        Ok(out)
    }
}

/// `spec` is a [`Resources`] document; an object without one contributes nothing.
fn resources_from_spec(_: &TranslateContext, obj: &SourceObject) -> Result<TranslateResult> {
    let resources: Resources = match obj.object().data.get("spec") {
        Some(spec) => serde_json::from_value(spec.clone()).with_context(|| format!("{}: spec is not a resources document", obj.key()))?,
        None => Resources::default(),
    };
    Ok(TranslateResult {
        services: resources.services,
        ssls: resources.ssls,
        consumers: resources.consumers,
        global_rules: resources.global_rules,
        plugin_metadata: resources.plugin_metadata,
        ..Default::default()
    })
}

/// Registry that passes manifest resources through for every kind.
pub fn passthrough_registry() -> HandlerRegistry {
    let mut reg = HandlerRegistry::new();
    reg.register_all(&SourceKind::ALL, Arc::new(resources_from_spec));
    reg
}
