//! The closed set of source object kinds and their static properties.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ResourceType;

/// How sync outcomes are reported on an object of a given kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusShape {
    /// `status.conditions` on the object itself.
    Conditions,
    /// `status.parents[].conditions` of a Gateway API route.
    RouteParents,
    /// Kind carries no sync condition.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindInfo {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    pub plural: &'static str,
    pub namespaced: bool,
    /// Gateway resource categories a translation of this kind can ever produce.
    pub resource_types: &'static [ResourceType],
    pub status: StatusShape,
}

impl KindInfo {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.to_string() } else { format!("{}/{}", self.group, self.version) }
    }
}

const GATEWAY_API: &str = "gateway.networking.k8s.io";
const NETWORKING: &str = "networking.k8s.io";
const APISIX: &str = "apisix.apache.org";

const SERVICE_ONLY: &[ResourceType] = &[ResourceType::Service];
const CONSUMER_ONLY: &[ResourceType] = &[ResourceType::Consumer];

const fn route(version: &'static str, kind: &'static str, plural: &'static str) -> KindInfo {
    KindInfo { group: GATEWAY_API, version, kind, plural, namespaced: true, resource_types: SERVICE_ONLY, status: StatusShape::RouteParents }
}

const fn apisix(version: &'static str, kind: &'static str, plural: &'static str, resource_types: &'static [ResourceType]) -> KindInfo {
    KindInfo { group: APISIX, version, kind, plural, namespaced: true, resource_types, status: StatusShape::Conditions }
}

const GATEWAY: KindInfo = KindInfo {
    group: GATEWAY_API,
    version: "v1",
    kind: "Gateway",
    plural: "gateways",
    namespaced: true,
    resource_types: &[ResourceType::GlobalRule, ResourceType::Ssl, ResourceType::PluginMetadata],
    status: StatusShape::None,
};
const HTTP_ROUTE: KindInfo = route("v1", "HTTPRoute", "httproutes");
const GRPC_ROUTE: KindInfo = route("v1", "GRPCRoute", "grpcroutes");
const TCP_ROUTE: KindInfo = route("v1alpha2", "TCPRoute", "tcproutes");
const UDP_ROUTE: KindInfo = route("v1alpha2", "UDPRoute", "udproutes");
const TLS_ROUTE: KindInfo = route("v1alpha2", "TLSRoute", "tlsroutes");
const INGRESS: KindInfo = KindInfo {
    group: NETWORKING,
    version: "v1",
    kind: "Ingress",
    plural: "ingresses",
    namespaced: true,
    resource_types: &[ResourceType::Service, ResourceType::Ssl],
    status: StatusShape::None,
};
const INGRESS_CLASS_RESOURCES: &[ResourceType] = &[ResourceType::GlobalRule, ResourceType::PluginMetadata];
const INGRESS_CLASS: KindInfo = KindInfo {
    group: NETWORKING,
    version: "v1",
    kind: "IngressClass",
    plural: "ingressclasses",
    namespaced: false,
    resource_types: INGRESS_CLASS_RESOURCES,
    status: StatusShape::None,
};
const INGRESS_CLASS_V1BETA1: KindInfo = KindInfo { version: "v1beta1", ..INGRESS_CLASS };
const CONSUMER: KindInfo = apisix("v1alpha1", "Consumer", "consumers", CONSUMER_ONLY);
const APISIX_ROUTE: KindInfo = apisix("v2", "ApisixRoute", "apisixroutes", SERVICE_ONLY);
const APISIX_GLOBAL_RULE: KindInfo = apisix("v2", "ApisixGlobalRule", "apisixglobalrules", &[ResourceType::GlobalRule]);
const APISIX_TLS: KindInfo = apisix("v2", "ApisixTls", "apisixtlses", &[ResourceType::Ssl]);
const APISIX_CONSUMER: KindInfo = apisix("v2", "ApisixConsumer", "apisixconsumers", CONSUMER_ONLY);

/// Supported source kinds. The set is closed; every variant has a fixed
/// entry in the static kind table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceKind {
    Gateway,
    HttpRoute,
    GrpcRoute,
    TcpRoute,
    UdpRoute,
    TlsRoute,
    Ingress,
    IngressClass,
    IngressClassV1beta1,
    Consumer,
    ApisixRoute,
    ApisixGlobalRule,
    ApisixTls,
    ApisixConsumer,
}

impl SourceKind {
    pub const ALL: [SourceKind; 14] = [
        SourceKind::Gateway,
        SourceKind::HttpRoute,
        SourceKind::GrpcRoute,
        SourceKind::TcpRoute,
        SourceKind::UdpRoute,
        SourceKind::TlsRoute,
        SourceKind::Ingress,
        SourceKind::IngressClass,
        SourceKind::IngressClassV1beta1,
        SourceKind::Consumer,
        SourceKind::ApisixRoute,
        SourceKind::ApisixGlobalRule,
        SourceKind::ApisixTls,
        SourceKind::ApisixConsumer,
    ];

    pub const fn info(self) -> &'static KindInfo {
        match self {
            SourceKind::Gateway => &GATEWAY,
            SourceKind::HttpRoute => &HTTP_ROUTE,
            SourceKind::GrpcRoute => &GRPC_ROUTE,
            SourceKind::TcpRoute => &TCP_ROUTE,
            SourceKind::UdpRoute => &UDP_ROUTE,
            SourceKind::TlsRoute => &TLS_ROUTE,
            SourceKind::Ingress => &INGRESS,
            SourceKind::IngressClass => &INGRESS_CLASS,
            SourceKind::IngressClassV1beta1 => &INGRESS_CLASS_V1BETA1,
            SourceKind::Consumer => &CONSUMER,
            SourceKind::ApisixRoute => &APISIX_ROUTE,
            SourceKind::ApisixGlobalRule => &APISIX_GLOBAL_RULE,
            SourceKind::ApisixTls => &APISIX_TLS,
            SourceKind::ApisixConsumer => &APISIX_CONSUMER,
        }
    }

    /// Kind name as it appears in `SourceKey::kind` (version independent).
    pub fn name(self) -> &'static str { self.info().kind }

    pub fn resource_types(self) -> &'static [ResourceType] { self.info().resource_types }

    pub fn status_shape(self) -> StatusShape { self.info().status }

    /// Resolve from object type metadata (`apiVersion`, `kind`).
    pub fn from_type_meta(api_version: &str, kind: &str) -> Option<Self> {
        let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
        Self::ALL.into_iter().find(|k| {
            let i = k.info();
            i.group == group && i.version == version && i.kind == kind
        })
    }

    /// Resolve from a version-independent kind name; the preferred version wins.
    pub fn from_name(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == kind)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let i = self.info();
        write!(f, "{}/{}", i.api_version(), i.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_meta_lookup_distinguishes_versions() {
        assert_eq!(SourceKind::from_type_meta("networking.k8s.io/v1beta1", "IngressClass"), Some(SourceKind::IngressClassV1beta1));
        assert_eq!(SourceKind::from_type_meta("networking.k8s.io/v1", "IngressClass"), Some(SourceKind::IngressClass));
        assert_eq!(SourceKind::from_type_meta("v1", "ConfigMap"), None);
        assert_eq!(SourceKind::from_name("IngressClass"), Some(SourceKind::IngressClass));
    }

    #[test]
    fn fixed_resource_types() {
        assert_eq!(SourceKind::HttpRoute.resource_types(), &[ResourceType::Service]);
        assert_eq!(
            SourceKind::Gateway.resource_types(),
            &[ResourceType::GlobalRule, ResourceType::Ssl, ResourceType::PluginMetadata]
        );
        assert_eq!(SourceKind::IngressClassV1beta1.resource_types(), SourceKind::IngressClass.resource_types());
    }

    #[test]
    fn status_shapes() {
        assert_eq!(SourceKind::GrpcRoute.status_shape(), StatusShape::RouteParents);
        assert_eq!(SourceKind::ApisixTls.status_shape(), StatusShape::Conditions);
        assert_eq!(SourceKind::Ingress.status_shape(), StatusShape::None);
    }
}
