//! Keel core types: source identities, the canonical gateway resource model,
//! sync tasks and structured execution errors.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use smallvec::SmallVec;

pub mod kind;

pub use kind::{KindInfo, SourceKind, StatusShape};

/// Free-form key/value labels attached to tasks and resources.
pub type Labels = BTreeMap<String, String>;

/// Resource type lists are short (at most five entries).
pub type ResourceTypes = SmallVec<[ResourceType; 4]>;

pub const LABEL_NAME: &str = "k8s/name";
pub const LABEL_NAMESPACE: &str = "k8s/namespace";
pub const LABEL_KIND: &str = "k8s/kind";

/// Identity of a source object, independent of API group and version.
///
/// Field order matters: keys sort by name, then namespace, then kind. The
/// global-rule merge relies on this ordering for its tie-break.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceKey {
    pub name: String,
    pub namespace: String,
    pub kind: String,
}

impl SourceKey {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { name: name.into(), namespace: namespace.into(), kind: kind.into() }
    }

    /// Owner labels carried by every resource this object contributes.
    pub fn labels(&self) -> Labels {
        let mut l = Labels::new();
        l.insert(LABEL_KIND.to_string(), self.kind.clone());
        l.insert(LABEL_NAME.to_string(), self.name.clone());
        l.insert(LABEL_NAMESPACE.to_string(), self.namespace.clone());
        l
    }

    /// Inverse of [`SourceKey::labels`]. Namespace may be absent for cluster-scoped kinds.
    pub fn from_labels(labels: &Labels) -> Option<Self> {
        let name = labels.get(LABEL_NAME)?;
        let kind = labels.get(LABEL_KIND)?;
        let namespace = labels.get(LABEL_NAMESPACE).cloned().unwrap_or_default();
        Some(Self { name: name.clone(), namespace, kind: kind.clone() })
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// Gateway resource categories a translation can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Service,
    Ssl,
    Consumer,
    GlobalRule,
    PluginMetadata,
}

impl ResourceType {
    pub const ALL: [ResourceType; 5] = [
        ResourceType::Service,
        ResourceType::Ssl,
        ResourceType::Consumer,
        ResourceType::GlobalRule,
        ResourceType::PluginMetadata,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Service => "service",
            ResourceType::Ssl => "ssl",
            ResourceType::Consumer => "consumer",
            ResourceType::GlobalRule => "global_rule",
            ResourceType::PluginMetadata => "plugin_metadata",
        }
    }

    /// Comma-joined names, used as a metrics label and in logs.
    pub fn join(types: &[ResourceType]) -> String {
        types.iter().map(|t| t.as_str()).collect::<Vec<_>>().join(",")
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown resource type: {0}")]
pub struct UnknownResourceType(pub String);

impl FromStr for ResourceType {
    type Err = UnknownResourceType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownResourceType(s.to_string()))
    }
}

/// Anything stored in the resource store under a stable id.
pub trait Identified {
    fn id(&self) -> &str;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    pub labels: Labels,
    /// Upstream, routes and plugins; opaque to the sync core.
    #[serde(flatten)]
    pub spec: Map<String, Json>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ssl {
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snis: Vec<String>,
    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    pub labels: Labels,
    #[serde(flatten)]
    pub spec: Map<String, Json>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Consumer {
    pub username: String,
    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    pub labels: Labels,
    #[serde(flatten)]
    pub spec: Map<String, Json>,
}

impl Identified for Service { fn id(&self) -> &str { &self.id } }
impl Identified for Ssl { fn id(&self) -> &str { &self.id } }
impl Identified for Consumer { fn id(&self) -> &str { &self.username } }

/// Plugin name -> plugin configuration.
pub type PluginMap = BTreeMap<String, Json>;

/// Desired gateway state for one task, or the merged state of one backend config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<Service>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssls: Vec<Ssl>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consumers: Vec<Consumer>,
    #[serde(default, skip_serializing_if = "PluginMap::is_empty")]
    pub global_rules: PluginMap,
    #[serde(default, skip_serializing_if = "PluginMap::is_empty")]
    pub plugin_metadata: PluginMap,
}

impl Resources {
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
            && self.ssls.is_empty()
            && self.consumers.is_empty()
            && self.global_rules.is_empty()
            && self.plugin_metadata.is_empty()
    }
}

/// Connection descriptor for one backend control plane, identified by name.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub name: String,
    pub server_addrs: Vec<String>,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_tls_verify")]
    pub tls_verify: bool,
}

fn default_tls_verify() -> bool { true }

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("name", &self.name)
            .field("server_addrs", &self.server_addrs)
            .field("token", &if self.token.is_empty() { "" } else { "<redacted>" })
            .field("tls_verify", &self.tls_verify)
            .finish()
    }
}

/// Unit of work submitted to the sync client.
#[derive(Debug, Clone, Default)]
pub struct Task {
    pub key: Option<SourceKey>,
    pub name: String,
    pub labels: Labels,
    pub configs: Vec<Config>,
    pub resource_types: ResourceTypes,
    pub resources: Resources,
}

impl Task {
    /// Task for one source object; name and owner labels derive from the key.
    pub fn for_object(key: SourceKey, resource_types: &[ResourceType], resources: Resources) -> Self {
        Self {
            name: key.to_string(),
            labels: key.labels(),
            key: Some(key),
            configs: Vec::new(),
            resource_types: resource_types.iter().copied().collect(),
            resources,
        }
    }

    pub fn with_configs(mut self, configs: Vec<Config>) -> Self {
        self.configs = configs;
        self
    }

    /// Empty `resource_types` means every category.
    pub fn declares(&self, t: ResourceType) -> bool {
        self.resource_types.is_empty() || self.resource_types.contains(&t)
    }
}

/// One resource the backend rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedStatus {
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub reason: String,
}

/// Failure reported by one server of a backend config. An empty
/// `failed_statuses` means the whole server failed, not that nothing did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAddrError {
    pub server_addr: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub failed_statuses: Vec<FailedStatus>,
}

impl ServerAddrError {
    pub fn is_broad(&self) -> bool { self.failed_statuses.is_empty() }
}

impl fmt::Display for ServerAddrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerAddr: {}, Error: {}", self.server_addr, self.error)
    }
}

/// Structured executor failure for one backend config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("config {config_name}: {}", join_display(.failed_errors))]
pub struct ExecutionError {
    pub config_name: String,
    pub failed_errors: Vec<ServerAddrError>,
}

fn join_display<T: fmt::Display>(items: &[T]) -> String {
    items.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
}

/// Aggregate of everything that went wrong in one task execution.
///
/// `unknown` holds messages from executor errors that did not carry the
/// structured shape; they can not be mapped back to source objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, thiserror::Error)]
#[error("{}", self.summary())]
pub struct ExecutionErrors {
    pub errors: Vec<ExecutionError>,
    pub unknown: Vec<String>,
}

impl ExecutionErrors {
    pub fn is_empty(&self) -> bool { self.errors.is_empty() && self.unknown.is_empty() }

    pub fn extend(&mut self, other: ExecutionErrors) {
        self.errors.extend(other.errors);
        self.unknown.extend(other.unknown);
    }

    fn summary(&self) -> String {
        let mut parts: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
        parts.extend(self.unknown.iter().map(|u| format!("unknown: {}", u)));
        parts.join("; ")
    }
}

pub mod prelude {
    pub use super::{
        Config, Consumer, ExecutionError, ExecutionErrors, FailedStatus, Identified, Labels, PluginMap,
        ResourceType, ResourceTypes, Resources, ServerAddrError, Service, SourceKey, SourceKind, Ssl, StatusShape, Task,
    };
}
