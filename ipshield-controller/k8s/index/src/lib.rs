#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Maps watch events to reconcile work.
//!
//! Policy events enqueue the policy itself. Route events are answered from a
//! reverse index of route → interested policies, refreshed by the engine
//! after every pass, so a route edit does not require scanning every policy.
//! Edits that touch neither the watched marker nor the allowlist annotation
//! are dropped to avoid reconcile storms.

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use ipshield_controller_core::ResourceId;
use ipshield_controller_k8s_api::{self as k8s, ResourceExt};
use ipshield_controller_k8s_reconcile::{Fanout, QueueHandle};
use parking_lot::RwLock;
use std::sync::Arc;

pub type SharedIndex = Arc<RwLock<Index>>;

pub struct Index {
    queue: QueueHandle,

    /// Known policies, fingerprinted so redundant watch events collapse.
    policies: HashMap<ResourceId, PolicyFingerprint>,

    /// Last observed reconcile-relevant state per route.
    routes: HashMap<ResourceId, RouteFingerprint>,

    /// Reverse index: route → policies whose selector matched it at their
    /// last completed reconcile.
    interested: HashMap<ResourceId, HashSet<ResourceId>>,
}

#[derive(Debug, PartialEq, Eq)]
struct PolicyFingerprint {
    generation: Option<i64>,
    deleting: bool,
}

#[derive(Debug, PartialEq, Eq)]
struct RouteFingerprint {
    watched: Option<String>,
    allowlist: Option<String>,
}

/// The write half handed to the reconciler so completed passes refresh the
/// reverse index.
#[derive(Clone)]
pub struct IndexFanout(SharedIndex);

impl Index {
    pub fn shared(queue: QueueHandle) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            queue,
            policies: HashMap::new(),
            routes: HashMap::new(),
            interested: HashMap::new(),
        }))
    }

    fn record_targets(&mut self, policy: &ResourceId, targets: &[ResourceId]) {
        for (route, interested) in self.interested.iter_mut() {
            if !targets.contains(route) {
                interested.remove(policy);
            }
        }
        self.interested.retain(|_, interested| !interested.is_empty());
        for route in targets {
            self.interested
                .entry(route.clone())
                .or_default()
                .insert(policy.clone());
        }
    }

    fn requeue_interested(&self, route: &ResourceId) {
        match self.interested.get(route) {
            Some(interested) if !interested.is_empty() => {
                for policy in interested {
                    self.queue.enqueue(policy.clone());
                }
            }
            // Not yet attributed to any policy; selector evaluation lives in
            // the engine, so fan out to every known policy.
            _ => {
                tracing::debug!(route = %route, "route not indexed; enqueueing all policies");
                for policy in self.policies.keys() {
                    self.queue.enqueue(policy.clone());
                }
            }
        }
    }
}

impl IndexFanout {
    pub fn new(index: SharedIndex) -> Self {
        Self(index)
    }
}

impl Fanout for IndexFanout {
    fn record_targets(&self, policy: &ResourceId, targets: &[ResourceId]) {
        self.0.write().record_targets(policy, targets);
    }
}

impl kubert::index::IndexNamespacedResource<k8s::RouteAllowlist> for Index {
    fn apply(&mut self, policy: k8s::RouteAllowlist) {
        let namespace = policy
            .namespace()
            .expect("RouteAllowlist must have a namespace");
        let id = ResourceId::new(namespace, policy.name_unchecked());

        let fingerprint = PolicyFingerprint {
            generation: policy.metadata.generation,
            deleting: policy.metadata.deletion_timestamp.is_some(),
        };
        if self.policies.get(&id) == Some(&fingerprint) {
            return;
        }
        self.policies.insert(id.clone(), fingerprint);

        tracing::debug!(policy = %id, "policy changed");
        self.queue.enqueue(id);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(namespace, name);
        self.policies.remove(&id);
        for interested in self.interested.values_mut() {
            interested.remove(&id);
        }
        self.interested.retain(|_, interested| !interested.is_empty());
    }

    // Since apply only enqueues a single policy at a time, there's no need to
    // handle resets specially.
}

impl kubert::index::IndexNamespacedResource<k8s::Route> for Index {
    fn apply(&mut self, route: k8s::Route) {
        let namespace = route.namespace().expect("Route must have a namespace");
        let id = ResourceId::new(namespace, route.name_unchecked());

        let fingerprint = RouteFingerprint {
            watched: route
                .labels()
                .get(k8s::WATCHED_RESOURCE_LABEL)
                .cloned(),
            allowlist: route.allowlist().map(ToString::to_string),
        };
        if self.routes.get(&id) == Some(&fingerprint) {
            return;
        }
        self.routes.insert(id.clone(), fingerprint);

        tracing::debug!(route = %id, "route changed");
        self.requeue_interested(&id);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(namespace, name);
        self.routes.remove(&id);
        if let Some(interested) = self.interested.remove(&id) {
            for policy in interested {
                self.queue.enqueue(policy);
            }
        }
    }
}
