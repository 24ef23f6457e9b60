use crate::{
    ledger::{Ledger, LedgerRecord},
    store::{Patch, Store, StoreError},
};
use ipshield_controller_core::{AddrSet, ResourceId};
use ipshield_controller_k8s_api::{self as k8s, condition, condition::ConditionType};
use serde_json::json;
use std::sync::Arc;

/// Receives the set of routes a policy currently selects, so the fan-out
/// index can answer "which policies care about this route" without scanning.
pub trait Fanout: Send + Sync {
    fn record_targets(&self, policy: &ResourceId, targets: &[ResourceId]);
}

/// A no-op fan-out for wirings that do not index routes.
impl Fanout for () {
    fn record_targets(&self, _: &ResourceId, _: &[ResourceId]) {}
}

#[async_trait::async_trait]
pub trait Reconcile: Send + Sync {
    async fn reconcile(&self, id: &ResourceId) -> anyhow::Result<()>;
}

/// Drives a RouteAllowlist to convergence: resolves its selector, merges its
/// ranges into each watched route's allowlist, maintains the provenance
/// ledger, and manages the deletion finalizer.
///
/// Every step is idempotent, so a failed pass is always safe to retry from
/// the top; routes patched before the failure keep their state.
pub struct Reconciler {
    policies: Arc<dyn Store<k8s::RouteAllowlist>>,
    routes: Arc<dyn Store<k8s::Route>>,
    ledger: Ledger,
    fanout: Arc<dyn Fanout>,
}

impl Reconciler {
    pub fn new(
        policies: Arc<dyn Store<k8s::RouteAllowlist>>,
        routes: Arc<dyn Store<k8s::Route>>,
        ledger: Ledger,
        fanout: Arc<dyn Fanout>,
    ) -> Self {
        Self {
            policies,
            routes,
            ledger,
            fanout,
        }
    }

    async fn apply(
        &self,
        mut policy: k8s::RouteAllowlist,
        routes: Vec<k8s::Route>,
    ) -> anyhow::Result<()> {
        let policy_id = resource_id(&policy);

        let mut record = match self.ledger.load(&policy).await {
            Ok(record) => record,
            Err(error) => {
                condition::warning(
                    policy.conditions_mut(),
                    ConditionType::LedgerFetchFailure,
                    &error,
                );
                return Err(self.fail(&policy, error.into()).await);
            }
        };
        condition::remove(policy.conditions_mut(), ConditionType::LedgerFetchFailure);

        let ranges: AddrSet = policy.spec.ip_ranges.iter().collect();
        let mut targets = Vec::with_capacity(routes.len());
        for route in &routes {
            let route_id = resource_id(route);
            tracing::debug!(route = %route_id, "updating route");
            targets.push(route_id.clone());

            let result = if route.is_watched() {
                self.watch_route(&mut record, route, &ranges).await
            } else {
                // The route opted out (or fell out of a previous match set);
                // withdraw this policy's contribution.
                self.unwatch_route(&mut record, route, &ranges).await
            };

            if let Err(error) = result {
                tracing::error!(route = %route_id, %error, "failed to update route");
                let conditions = policy.conditions_mut();
                condition::remove(conditions, ConditionType::Reconciling);
                condition::failed(conditions, ConditionType::RouteUpdateFailure, &error);
                return Err(self.fail(&policy, error.into()).await);
            }
        }

        self.fanout.record_targets(&policy_id, &targets);

        let conditions = policy.conditions_mut();
        condition::remove(conditions, ConditionType::Reconciling);
        condition::remove(conditions, ConditionType::RouteUpdateFailure);
        condition::remove(conditions, ConditionType::LedgerUpdateFailure);
        condition::success(conditions, ConditionType::Admitted);
        self.patch_status(&policy).await?;
        Ok(())
    }

    /// Merges the policy's ranges into a watched route, capturing the route's
    /// pre-policy value in the ledger first.
    async fn watch_route(
        &self,
        record: &mut LedgerRecord,
        route: &k8s::Route,
        ranges: &AddrSet,
    ) -> Result<(), StoreError> {
        let route_id = resource_id(route);
        let current_raw = route.allowlist().unwrap_or("");
        record.ensure(&route_id, current_raw);
        // The ledger write lands before the route write; if the second patch
        // is lost, a retry re-reads a baseline that is already recorded.
        self.ledger.commit(record).await?;

        let current = AddrSet::decode(current_raw);
        let merged = current.merge(ranges);
        if merged == current {
            return Ok(());
        }
        self.patch_allowlist(route, Some(merged.encode())).await
    }

    /// Withdraws this policy's contribution from a route, retiring the ledger
    /// entry when nothing beyond the baseline remains.
    async fn unwatch_route(
        &self,
        record: &mut LedgerRecord,
        route: &k8s::Route,
        ranges: &AddrSet,
    ) -> Result<(), StoreError> {
        let route_id = resource_id(route);
        let current = AddrSet::decode(route.allowlist().unwrap_or(""));

        let mut remainder = current.diff(ranges);
        if remainder.is_empty() {
            // The policy's contribution was the entire visible value; restore
            // the recorded baseline. Known convergence gap: with overlapping
            // contributions this can momentarily drop another matching
            // policy's addresses until that policy is re-queued by the
            // route-change fan-out.
            remainder = record.baseline(&route_id);
        }

        record.retire_if_redundant(&route_id, &remainder);
        self.ledger.commit(record).await?;

        if remainder == current {
            return Ok(());
        }
        let value = (!remainder.is_empty()).then(|| remainder.encode());
        self.patch_allowlist(route, value).await
    }

    /// Runs Unwatch on every still-matching route, releases the ledger
    /// back-reference, and removes the finalizer so deletion can complete.
    async fn cleanup(
        &self,
        mut policy: k8s::RouteAllowlist,
        routes: Vec<k8s::Route>,
    ) -> anyhow::Result<()> {
        let policy_id = resource_id(&policy);
        condition::remove(policy.conditions_mut(), ConditionType::RouteDeleteFailure);

        let mut record = match self.ledger.load(&policy).await {
            Ok(record) => record,
            Err(error) => {
                condition::warning(
                    policy.conditions_mut(),
                    ConditionType::LedgerFetchFailure,
                    &error,
                );
                return Err(self.fail(&policy, error.into()).await);
            }
        };
        condition::remove(policy.conditions_mut(), ConditionType::LedgerFetchFailure);

        let ranges: AddrSet = policy.spec.ip_ranges.iter().collect();
        for route in &routes {
            if let Err(error) = self.unwatch_route(&mut record, route, &ranges).await {
                tracing::error!(route = %resource_id(route), %error, "failed to unwatch route");
                condition::failed(
                    policy.conditions_mut(),
                    ConditionType::RouteDeleteFailure,
                    &error,
                );
                return Err(self.fail(&policy, error.into()).await);
            }
        }

        record.release(&policy);
        if let Err(error) = self.ledger.commit(&mut record).await {
            condition::warning(
                policy.conditions_mut(),
                ConditionType::LedgerUpdateFailure,
                &error,
            );
            return Err(self.fail(&policy, error.into()).await);
        }

        self.fanout.record_targets(&policy_id, &[]);

        if let Some(finalizers) = policy.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != k8s::ROUTE_ALLOWLIST_FINALIZER);
        }
        let finalizers = policy.metadata.finalizers.clone().unwrap_or_default();
        match self
            .policies
            .patch(
                &policy_id,
                Patch::merge(json!({ "metadata": { "finalizers": finalizers } })),
            )
            .await
        {
            Ok(_) => {}
            // Vanished mid-cleanup: already converged.
            Err(StoreError::NotFound) => return Ok(()),
            Err(error) => return Err(self.fail(&policy, error.into()).await),
        }

        let conditions = policy.conditions_mut();
        condition::remove(conditions, ConditionType::Reconciling);
        condition::success(conditions, ConditionType::Deleted);
        match self.patch_status(&policy).await {
            Ok(()) | Err(StoreError::NotFound) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    async fn add_finalizer(&self, policy: &mut k8s::RouteAllowlist) -> Result<(), StoreError> {
        policy
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(k8s::ROUTE_ALLOWLIST_FINALIZER.to_string());
        let finalizers = policy.metadata.finalizers.clone().unwrap_or_default();
        self.policies
            .patch(
                &resource_id(policy),
                Patch::merge(json!({ "metadata": { "finalizers": finalizers } })),
            )
            .await
            .map(|_| ())
    }

    async fn patch_allowlist(
        &self,
        route: &k8s::Route,
        value: Option<String>,
    ) -> Result<(), StoreError> {
        let patch = Patch::conditional(
            json!({ "metadata": { "annotations": { k8s::ALLOWLIST_ANNOTATION: value } } }),
            route.metadata.resource_version.clone(),
        );
        self.routes
            .patch(&resource_id(route), patch)
            .await
            .map(|_| ())
    }

    async fn patch_status(&self, policy: &k8s::RouteAllowlist) -> Result<(), StoreError> {
        let value = json!({ "status": { "conditions": policy.conditions() } });
        self.policies
            .patch_status(&resource_id(policy), Patch::merge(value))
            .await
            .map(|_| ())
    }

    /// Publishes the failure via status, then hands the error back to drive a
    /// queue retry. A failed status patch takes precedence; nothing is
    /// swallowed either way.
    async fn fail(&self, policy: &k8s::RouteAllowlist, error: anyhow::Error) -> anyhow::Error {
        if let Err(patch_error) = self.patch_status(policy).await {
            tracing::error!(%patch_error, "failed to update status");
            return patch_error.into();
        }
        error
    }
}

#[async_trait::async_trait]
impl Reconcile for Reconciler {
    async fn reconcile(&self, id: &ResourceId) -> anyhow::Result<()> {
        tracing::info!(policy = %id, "reconciling allowlist");

        let mut policy = match self.policies.get(id).await {
            Ok(policy) => policy,
            Err(StoreError::NotFound) => {
                tracing::debug!(policy = %id, "not found; already converged");
                return Ok(());
            }
            Err(error) => return Err(error.into()),
        };

        {
            let conditions = policy.conditions_mut();
            condition::remove(conditions, ConditionType::Admitted);
            for transient in ConditionType::all().filter(ConditionType::is_transient) {
                condition::remove(conditions, transient);
            }
            condition::set(
                conditions,
                ConditionType::Reconciling,
                true,
                condition::Reason::ProcessingAllowlist,
                "Searching for routes",
            );
        }

        if let Err(error) = policy.spec.label_selector.validate() {
            tracing::warn!(policy = %id, %error, "invalid label selector");
            condition::failed(
                policy.conditions_mut(),
                ConditionType::SelectorInvalid,
                &error,
            );
            return Err(self.fail(&policy, error.into()).await);
        }
        condition::remove(policy.conditions_mut(), ConditionType::SelectorInvalid);

        let routes = match self.routes.list(&policy.spec.label_selector).await {
            Ok(routes) => {
                condition::remove(policy.conditions_mut(), ConditionType::RouteFetchError);
                routes
            }
            Err(error) => {
                condition::failed(
                    policy.conditions_mut(),
                    ConditionType::RouteFetchError,
                    &error,
                );
                return Err(self.fail(&policy, error.into()).await);
            }
        };

        if policy.deletion_requested() {
            return self.cleanup(policy, routes).await;
        }
        if !policy.has_finalizer() {
            self.add_finalizer(&mut policy).await?;
        }

        if routes.is_empty() {
            self.fanout.record_targets(id, &[]);
            let conditions = policy.conditions_mut();
            condition::remove(conditions, ConditionType::Reconciling);
            condition::success(conditions, ConditionType::NoRoutesFound);
            self.patch_status(&policy).await?;
            return Ok(());
        }

        self.apply(policy, routes).await
    }
}

fn resource_id<K: kube::Resource>(obj: &K) -> ResourceId {
    let meta = obj.meta();
    ResourceId::new(
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default(),
    )
}
