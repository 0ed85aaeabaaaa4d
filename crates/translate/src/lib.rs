//! Keel translate: dispatch of source objects to per-kind translators.
//!
//! The field-level translation of each kind is supplied from outside through
//! the [`Translator`] trait. The registry only decides which translator runs
//! and stamps the result with the resource categories that kind owns.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use keel_core::{Config, Consumer, PluginMap, ResourceType, ResourceTypes, Resources, Service, SourceKey, SourceKind, Ssl};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("unsupported kind {kind} ({api_version})")]
    UnsupportedKind { api_version: String, kind: String },
    #[error("object is missing type metadata")]
    MissingTypeMeta,
    #[error("no handler registered for {0}")]
    UnregisteredKind(SourceKind),
    /// Failure of the per-kind translator, passed through unchanged.
    #[error(transparent)]
    Translator(#[from] anyhow::Error),
}

/// A watched Kubernetes object of one of the supported kinds.
#[derive(Debug, Clone)]
pub struct SourceObject {
    kind: SourceKind,
    object: DynamicObject,
}

impl SourceObject {
    pub fn new(kind: SourceKind, mut object: DynamicObject) -> Self {
        if object.types.is_none() {
            let info = kind.info();
            object.types = Some(TypeMeta { api_version: info.api_version(), kind: info.kind.to_string() });
        }
        Self { kind, object }
    }

    /// Classify a dynamic object by its `apiVersion`/`kind`.
    pub fn from_dynamic(object: DynamicObject) -> Result<Self, TranslateError> {
        let types = object.types.as_ref().ok_or(TranslateError::MissingTypeMeta)?;
        let kind = SourceKind::from_type_meta(&types.api_version, &types.kind).ok_or_else(|| TranslateError::UnsupportedKind {
            api_version: types.api_version.clone(),
            kind: types.kind.clone(),
        })?;
        Ok(Self { kind, object })
    }

    pub fn kind(&self) -> SourceKind { self.kind }
    pub fn object(&self) -> &DynamicObject { &self.object }

    pub fn key(&self) -> SourceKey {
        SourceKey {
            name: self.object.metadata.name.clone().unwrap_or_default(),
            namespace: self.object.metadata.namespace.clone().unwrap_or_default(),
            kind: self.kind.name().to_string(),
        }
    }

    pub fn generation(&self) -> Option<i64> { self.object.metadata.generation }
}

/// kube `ApiResource` for a source kind, with the plural from the kind table.
pub fn api_resource(kind: SourceKind) -> ApiResource {
    let info = kind.info();
    let gvk = GroupVersionKind::gvk(info.group, info.version, info.kind);
    ApiResource::from_gvk_with_plural(&gvk, info.plural)
}

/// Inputs the translation needs beyond the object itself.
#[derive(Debug, Clone, Default)]
pub struct TranslateContext {
    /// Backends the object targets, keyed by backend identity (usually the parent Gateway).
    pub backends: BTreeMap<SourceKey, Config>,
}

impl TranslateContext {
    pub fn with_backend(mut self, key: SourceKey, config: Config) -> Self {
        self.backends.insert(key, config);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranslateResult {
    pub services: Vec<Service>,
    pub ssls: Vec<Ssl>,
    pub consumers: Vec<Consumer>,
    pub global_rules: PluginMap,
    pub plugin_metadata: PluginMap,
    pub resource_types: ResourceTypes,
}

impl TranslateResult {
    pub fn into_resources(self) -> (ResourceTypes, Resources) {
        let resources = Resources {
            services: self.services,
            ssls: self.ssls,
            consumers: self.consumers,
            global_rules: self.global_rules,
            plugin_metadata: self.plugin_metadata,
        };
        (self.resource_types, resources)
    }
}

/// Field-level translation of one kind.
pub trait Translator: Send + Sync {
    fn translate(&self, ctx: &TranslateContext, obj: &SourceObject) -> anyhow::Result<TranslateResult>;
}

impl<F> Translator for F
where
    F: Fn(&TranslateContext, &SourceObject) -> anyhow::Result<TranslateResult> + Send + Sync,
{
    fn translate(&self, ctx: &TranslateContext, obj: &SourceObject) -> anyhow::Result<TranslateResult> {
        self(ctx, obj)
    }
}

struct Handler {
    translator: Arc<dyn Translator>,
    resource_types: &'static [ResourceType],
}

/// Kind -> handler table, filled once at startup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<SourceKind, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self { Self::default() }

    /// Register (or replace) the translator for a kind.
    pub fn register(&mut self, kind: SourceKind, translator: Arc<dyn Translator>) {
        self.handlers.insert(kind, Handler { translator, resource_types: kind.resource_types() });
    }

    /// Register one translator for several kinds (e.g. both IngressClass versions).
    pub fn register_all(&mut self, kinds: &[SourceKind], translator: Arc<dyn Translator>) {
        for k in kinds {
            self.register(*k, Arc::clone(&translator));
        }
    }

    pub fn is_registered(&self, kind: SourceKind) -> bool { self.handlers.contains_key(&kind) }

    /// Resource categories owned by a registered kind.
    pub fn resource_types(&self, kind: SourceKind) -> Result<&'static [ResourceType], TranslateError> {
        self.handlers.get(&kind).map(|h| h.resource_types).ok_or(TranslateError::UnregisteredKind(kind))
    }

    pub fn translate(&self, ctx: &TranslateContext, obj: &SourceObject) -> Result<TranslateResult, TranslateError> {
        let handler = self.handlers.get(&obj.kind()).ok_or(TranslateError::UnregisteredKind(obj.kind()))?;
        let mut result = handler.translator.translate(ctx, obj)?;
        result.resource_types = handler.resource_types.iter().copied().collect();
        debug!(kind = %obj.kind(), key = %obj.key(), services = result.services.len(), "translate: ok");
        Ok(result)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.handlers.keys().collect();
        kinds.sort();
        f.debug_struct("HandlerRegistry").field("kinds", &kinds).finish()
    }
}
