use crate::labels;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Grants a set of address ranges access to every watched route selected by
/// the label selector.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "networking.stakater.com",
    version = "v1alpha1",
    kind = "RouteAllowlist",
    status = "RouteAllowlistStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct RouteAllowlistSpec {
    #[serde(default)]
    pub label_selector: labels::Selector,

    /// Address ranges merged into each selected route's allowlist. Order is
    /// not significant.
    #[serde(default)]
    pub ip_ranges: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteAllowlistStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl RouteAllowlist {
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    pub fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .iter()
            .flatten()
            .any(|f| f == crate::ROUTE_ALLOWLIST_FINALIZER)
    }

    pub fn deletion_requested(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
