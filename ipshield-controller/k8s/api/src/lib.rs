#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod allowlist;
pub mod condition;
pub mod labels;
pub mod route;

pub use self::{
    allowlist::{RouteAllowlist, RouteAllowlistSpec, RouteAllowlistStatus},
    condition::{ConditionType, Reason},
    labels::Labels,
    route::Route,
};
pub use k8s_openapi::{
    api::core::v1::ConfigMap,
    apimachinery::pkg::apis::meta::v1::{Condition, OwnerReference, Time},
};
pub use kube::api::{ObjectMeta, ResourceExt};

/// Label opting a route into allowlist management. Only the value `"true"`
/// marks a route as watched.
pub const WATCHED_RESOURCE_LABEL: &str = "ipshield.stakater.cloud/enabled";

/// Finalizer blocking RouteAllowlist deletion until cleanup has run.
pub const ROUTE_ALLOWLIST_FINALIZER: &str = "ipshield.stakater.cloud/finalizer";

/// The route annotation holding the space-delimited allowlist. Freely editable
/// by other actors; the controller only ever merges into or subtracts from it.
pub const ALLOWLIST_ANNOTATION: &str = "haproxy.router.openshift.io/ip_whitelist";

/// Name of the ConfigMap serving as the provenance ledger for a watch scope.
pub const WATCHED_ROUTES_CONFIG_MAP: &str = "watched-routes";
