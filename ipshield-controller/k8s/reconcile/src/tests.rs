use crate::{
    engine::{Reconcile, Reconciler},
    ledger::Ledger,
    store::{Patch, Store, StoreError},
};
use ipshield_controller_core::{AddrSet, ResourceId};
use ipshield_controller_k8s_api::{
    self as k8s, condition, condition::ConditionType, labels, ObjectMeta,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::{collections::BTreeMap, marker::PhantomData, sync::Arc};

const LEDGER_NS: &str = "ipshield-cr";

/// An in-memory resource store: JSON objects keyed by identity, merge-patch
/// semantics per RFC 7386, and a resourceVersion that bumps on every write so
/// optimistic-concurrency behavior matches the API server's.
struct MemStore<K> {
    objects: Mutex<BTreeMap<ResourceId, Value>>,
    fail_patch_for: Mutex<Option<ResourceId>>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> MemStore<K>
where
    K: kube::Resource<DynamicType = ()> + serde::Serialize + serde::de::DeserializeOwned,
{
    fn new() -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(BTreeMap::new()),
            fail_patch_for: Mutex::new(None),
            _kind: PhantomData,
        })
    }

    fn insert(&self, obj: K) {
        let mut value = serde_json::to_value(&obj).unwrap();
        if value["metadata"]["resourceVersion"].is_null() {
            value["metadata"]["resourceVersion"] = json!("1");
        }
        let id = ResourceId::new(
            value["metadata"]["namespace"].as_str().unwrap_or_default(),
            value["metadata"]["name"].as_str().unwrap(),
        );
        self.objects.lock().insert(id, value);
    }

    fn obj(&self, id: &ResourceId) -> K {
        let value = self.objects.lock().get(id).cloned().expect("object exists");
        serde_json::from_value(value).unwrap()
    }

    fn version(&self, id: &ResourceId) -> String {
        let objects = self.objects.lock();
        objects[id]["metadata"]["resourceVersion"]
            .as_str()
            .unwrap()
            .to_string()
    }

    fn contains(&self, id: &ResourceId) -> bool {
        self.objects.lock().contains_key(id)
    }

    /// Simulates an edit by an external actor.
    fn update(&self, id: &ResourceId, f: impl FnOnce(&mut Value)) {
        let mut objects = self.objects.lock();
        let value = objects.get_mut(id).expect("object exists");
        f(value);
        bump_version(value);
    }

    fn fail_next_patch_of(&self, id: Option<ResourceId>) {
        *self.fail_patch_for.lock() = id;
    }
}

#[async_trait::async_trait]
impl<K> Store<K> for MemStore<K>
where
    K: kube::Resource<DynamicType = ()>
        + Clone
        + std::fmt::Debug
        + serde::Serialize
        + serde::de::DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, id: &ResourceId) -> Result<K, StoreError> {
        let value = self
            .objects
            .lock()
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound)?;
        Ok(serde_json::from_value(value).unwrap())
    }

    async fn list(&self, selector: &labels::Selector) -> Result<Vec<K>, StoreError> {
        let objects = self.objects.lock();
        Ok(objects
            .values()
            .filter(|value| {
                let labels = value["metadata"]["labels"]
                    .as_object()
                    .map(|map| {
                        map.iter()
                            .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                            .collect::<labels::Map>()
                    })
                    .unwrap_or_default();
                selector.matches(&k8s::Labels::from(labels))
            })
            .map(|value| serde_json::from_value(value.clone()).unwrap())
            .collect())
    }

    async fn patch(&self, id: &ResourceId, patch: Patch) -> Result<String, StoreError> {
        if self.fail_patch_for.lock().as_ref() == Some(id) {
            return Err(StoreError::Transport(anyhow::anyhow!(
                "injected transport error"
            )));
        }
        let mut objects = self.objects.lock();
        let value = objects.get_mut(id).ok_or(StoreError::NotFound)?;
        if let Some(expected) = patch.expected_version() {
            if value["metadata"]["resourceVersion"].as_str() != Some(expected) {
                return Err(StoreError::Conflict);
            }
        }
        merge_patch(value, patch.value());
        Ok(bump_version(value))
    }

    async fn create(&self, obj: &K) -> Result<String, StoreError> {
        let mut value = serde_json::to_value(obj).unwrap();
        let id = ResourceId::new(
            value["metadata"]["namespace"].as_str().unwrap_or_default(),
            value["metadata"]["name"].as_str().unwrap(),
        );
        let mut objects = self.objects.lock();
        if objects.contains_key(&id) {
            return Err(StoreError::Conflict);
        }
        value["metadata"]["resourceVersion"] = json!("1");
        objects.insert(id, value);
        Ok("1".to_string())
    }
}

fn merge_patch(target: &mut Value, patch: &Value) {
    if let Value::Object(patch) = patch {
        if !target.is_object() {
            *target = Value::Object(Default::default());
        }
        let map = target.as_object_mut().unwrap();
        for (key, value) in patch {
            if value.is_null() {
                map.remove(key);
            } else {
                merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    } else {
        *target = patch.clone();
    }
}

fn bump_version(value: &mut Value) -> String {
    let next = value["metadata"]["resourceVersion"]
        .as_str()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or_default()
        + 1;
    let next = next.to_string();
    value["metadata"]["resourceVersion"] = json!(next);
    next
}

struct Cluster {
    policies: Arc<MemStore<k8s::RouteAllowlist>>,
    routes: Arc<MemStore<k8s::Route>>,
    ledger: Arc<MemStore<k8s::ConfigMap>>,
    reconciler: Reconciler,
}

fn cluster() -> Cluster {
    let policies = MemStore::<k8s::RouteAllowlist>::new();
    let routes = MemStore::<k8s::Route>::new();
    let ledger = MemStore::<k8s::ConfigMap>::new();
    let reconciler = Reconciler::new(
        policies.clone(),
        routes.clone(),
        Ledger::new(ledger.clone(), LEDGER_NS),
        Arc::new(()),
    );
    Cluster {
        policies,
        routes,
        ledger,
        reconciler,
    }
}

impl Cluster {
    fn allowlist_of(&self, route: &ResourceId) -> AddrSet {
        AddrSet::decode(self.routes.obj(route).allowlist().unwrap_or(""))
    }

    fn ledger_entry(&self, route: &ResourceId) -> Option<String> {
        let ledger_id = ResourceId::new(LEDGER_NS, k8s::WATCHED_ROUTES_CONFIG_MAP);
        self.ledger
            .obj(&ledger_id)
            .data
            .unwrap_or_default()
            .get(&route.ledger_key())
            .cloned()
    }

    fn ledger_owners(&self) -> Vec<String> {
        let ledger_id = ResourceId::new(LEDGER_NS, k8s::WATCHED_ROUTES_CONFIG_MAP);
        self.ledger
            .obj(&ledger_id)
            .metadata
            .owner_references
            .unwrap_or_default()
            .into_iter()
            .map(|owner| owner.name)
            .collect()
    }

    fn mark_deleted(&self, policy: &ResourceId) {
        self.policies.update(policy, |value| {
            value["metadata"]["deletionTimestamp"] = json!("2024-01-01T00:00:00Z");
        });
    }

    fn status_condition(
        &self,
        policy: &ResourceId,
        type_: ConditionType,
    ) -> Option<k8s::Condition> {
        let policy = self.policies.obj(policy);
        condition::get(policy.conditions(), type_).cloned()
    }
}

fn mk_policy(
    ns: &str,
    name: &str,
    selector: labels::Selector,
    ranges: &[&str],
) -> k8s::RouteAllowlist {
    k8s::RouteAllowlist {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            uid: Some(format!("uid-{}", name)),
            ..Default::default()
        },
        spec: k8s::RouteAllowlistSpec {
            label_selector: selector,
            ip_ranges: ranges.iter().map(ToString::to_string).collect(),
        },
        status: None,
    }
}

fn mk_route(
    ns: &str,
    name: &str,
    labels: &[(&str, &str)],
    watched: bool,
    allowlist: Option<&str>,
) -> k8s::Route {
    let mut label_map = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect::<BTreeMap<_, _>>();
    if watched {
        label_map.insert(k8s::WATCHED_RESOURCE_LABEL.to_string(), "true".to_string());
    }
    k8s::Route {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            labels: Some(label_map),
            annotations: allowlist.map(|raw| {
                Some((k8s::ALLOWLIST_ANNOTATION.to_string(), raw.to_string()))
                    .into_iter()
                    .collect()
            }),
            ..Default::default()
        },
        spec: k8s::route::RouteSpec::default(),
    }
}

fn web_selector() -> labels::Selector {
    labels::Selector::from_iter(Some(("app", "web")))
}

#[tokio::test]
async fn applies_and_removes_ranges_on_fresh_route() {
    let cluster = cluster();
    let policy_id = ResourceId::new("default", "allow-corp");
    let route_id = ResourceId::new("apps", "web");

    cluster
        .policies
        .insert(mk_policy("default", "allow-corp", web_selector(), &["10.0.0.1"]));
    cluster
        .routes
        .insert(mk_route("apps", "web", &[("app", "web")], true, None));

    cluster.reconciler.reconcile(&policy_id).await.unwrap();

    assert_eq!(
        cluster.allowlist_of(&route_id),
        AddrSet::from_iter(["10.0.0.1"])
    );
    // Baseline was empty; the entry records it so removal can restore it.
    assert_eq!(cluster.ledger_entry(&route_id).as_deref(), Some(""));
    assert_eq!(cluster.ledger_owners(), vec!["allow-corp".to_string()]);

    let policy = cluster.policies.obj(&policy_id);
    assert!(policy.has_finalizer());
    let admitted = cluster
        .status_condition(&policy_id, ConditionType::Admitted)
        .expect("admitted condition");
    assert_eq!(admitted.status, "True");

    // Deleting the policy clears the field and retires the ledger entry.
    cluster.mark_deleted(&policy_id);
    cluster.reconciler.reconcile(&policy_id).await.unwrap();

    assert!(cluster.allowlist_of(&route_id).is_empty());
    assert!(cluster.routes.obj(&route_id).allowlist().is_none());
    assert_eq!(cluster.ledger_entry(&route_id), None);
    assert!(cluster.ledger_owners().is_empty());
    assert!(!cluster.policies.obj(&policy_id).has_finalizer());
    let deleted = cluster
        .status_condition(&policy_id, ConditionType::Deleted)
        .expect("deleted condition");
    assert_eq!(deleted.status, "True");
}

#[tokio::test]
async fn preserves_unrelated_baseline_across_policies() {
    let cluster = cluster();
    let route_id = ResourceId::new("apps", "web");
    let a = ResourceId::new("default", "allow-a");
    let b = ResourceId::new("default", "allow-b");

    cluster.routes.insert(mk_route(
        "apps",
        "web",
        &[("app", "web")],
        true,
        Some("192.168.10.32"),
    ));
    cluster
        .policies
        .insert(mk_policy("default", "allow-a", web_selector(), &["10.0.0.13"]));
    cluster.policies.insert(mk_policy(
        "default",
        "allow-b",
        web_selector(),
        &["10.0.0.13", "10.0.0.132"],
    ));

    cluster.reconciler.reconcile(&a).await.unwrap();
    cluster.reconciler.reconcile(&b).await.unwrap();

    assert_eq!(
        cluster.allowlist_of(&route_id),
        AddrSet::from_iter(["192.168.10.32", "10.0.0.13", "10.0.0.132"])
    );
    // The baseline is the pre-policy value, captured exactly once.
    assert_eq!(
        cluster.ledger_entry(&route_id).as_deref(),
        Some("192.168.10.32")
    );

    // Removing one policy keeps the baseline and, after the fan-out re-queues
    // the surviving policy, its shared contribution.
    cluster.mark_deleted(&a);
    cluster.reconciler.reconcile(&a).await.unwrap();
    cluster.reconciler.reconcile(&b).await.unwrap();

    let remaining = cluster.allowlist_of(&route_id);
    assert!(remaining.contains("192.168.10.32"));
    assert!(remaining.contains("10.0.0.13"));
    assert!(remaining.contains("10.0.0.132"));
}

#[tokio::test]
async fn shared_contribution_restored_after_policy_delete() {
    let cluster = cluster();
    let route_id = ResourceId::new("apps", "web");
    let a = ResourceId::new("default", "allow-a");
    let b = ResourceId::new("default", "allow-b");

    cluster
        .routes
        .insert(mk_route("apps", "web", &[("app", "web")], true, None));
    cluster.policies.insert(mk_policy(
        "default",
        "allow-a",
        web_selector(),
        &["10.0.0.13", "10.1.0.1"],
    ));
    cluster.policies.insert(mk_policy(
        "default",
        "allow-b",
        web_selector(),
        &["10.0.0.13", "10.2.0.2"],
    ));

    cluster.reconciler.reconcile(&a).await.unwrap();
    cluster.reconciler.reconcile(&b).await.unwrap();
    assert_eq!(
        cluster.allowlist_of(&route_id),
        AddrSet::from_iter(["10.0.0.13", "10.1.0.1", "10.2.0.2"])
    );

    cluster.mark_deleted(&a);
    cluster.reconciler.reconcile(&a).await.unwrap();
    cluster.reconciler.reconcile(&b).await.unwrap();

    let remaining = cluster.allowlist_of(&route_id);
    assert!(remaining.contains("10.0.0.13"));
    assert!(remaining.contains("10.2.0.2"));
    assert!(!remaining.contains("10.1.0.1"));
}

#[tokio::test]
async fn unlabeling_a_route_matches_policy_delete() {
    let cluster = cluster();
    let policy_id = ResourceId::new("default", "allow-corp");
    let route_id = ResourceId::new("apps", "web");

    cluster.routes.insert(mk_route(
        "apps",
        "web",
        &[("app", "web")],
        true,
        Some("192.168.10.32"),
    ));
    cluster
        .policies
        .insert(mk_policy("default", "allow-corp", web_selector(), &["10.0.0.1"]));

    cluster.reconciler.reconcile(&policy_id).await.unwrap();
    assert_eq!(
        cluster.allowlist_of(&route_id),
        AddrSet::from_iter(["192.168.10.32", "10.0.0.1"])
    );

    // The route opts out; it still matches the selector, so the next pass
    // runs Unwatch on it.
    cluster.routes.update(&route_id, |value| {
        value["metadata"]["labels"][k8s::WATCHED_RESOURCE_LABEL] = json!("false");
    });
    cluster.reconciler.reconcile(&policy_id).await.unwrap();

    assert_eq!(
        cluster.allowlist_of(&route_id),
        AddrSet::from_iter(["192.168.10.32"])
    );
    assert_eq!(cluster.ledger_entry(&route_id), None);
}

#[tokio::test]
async fn manual_edits_survive_reapply() {
    let cluster = cluster();
    let policy_id = ResourceId::new("default", "allow-corp");
    let route_id = ResourceId::new("apps", "web");

    cluster
        .routes
        .insert(mk_route("apps", "web", &[("app", "web")], true, None));
    cluster
        .policies
        .insert(mk_policy("default", "allow-corp", web_selector(), &["10.0.0.1"]));
    cluster.reconciler.reconcile(&policy_id).await.unwrap();

    // An operator appends an address by hand.
    cluster.routes.update(&route_id, |value| {
        value["metadata"]["annotations"][k8s::ALLOWLIST_ANNOTATION] = json!("10.0.0.1 172.16.0.9");
    });
    cluster.reconciler.reconcile(&policy_id).await.unwrap();

    assert_eq!(
        cluster.allowlist_of(&route_id),
        AddrSet::from_iter(["10.0.0.1", "172.16.0.9"])
    );
}

#[tokio::test]
async fn reapply_is_idempotent() {
    let cluster = cluster();
    let policy_id = ResourceId::new("default", "allow-corp");
    let route_id = ResourceId::new("apps", "web");

    cluster
        .routes
        .insert(mk_route("apps", "web", &[("app", "web")], true, None));
    cluster
        .policies
        .insert(mk_policy("default", "allow-corp", web_selector(), &["10.0.0.1"]));

    cluster.reconciler.reconcile(&policy_id).await.unwrap();
    let settled = cluster.routes.version(&route_id);

    cluster.reconciler.reconcile(&policy_id).await.unwrap();
    assert_eq!(cluster.routes.version(&route_id), settled);
    assert_eq!(
        cluster.allowlist_of(&route_id),
        AddrSet::from_iter(["10.0.0.1"])
    );
}

#[tokio::test]
async fn invalid_selector_surfaces_terminal_condition() {
    let cluster = cluster();
    let policy_id = ResourceId::new("default", "allow-corp");

    let selector = labels::Selector::from_iter(Some(labels::Expression::new(
        "app",
        labels::Operator::In,
        Default::default(),
    )));
    cluster
        .policies
        .insert(mk_policy("default", "allow-corp", selector, &["10.0.0.1"]));

    assert!(cluster.reconciler.reconcile(&policy_id).await.is_err());
    let invalid = cluster
        .status_condition(&policy_id, ConditionType::SelectorInvalid)
        .expect("selector condition");
    assert_eq!(invalid.status, "False");
    assert_eq!(invalid.reason, "ReconcileError");
}

#[tokio::test]
async fn empty_match_set_is_success() {
    let cluster = cluster();
    let policy_id = ResourceId::new("default", "allow-corp");

    cluster.policies.insert(mk_policy(
        "default",
        "allow-corp",
        labels::Selector::from_iter(Some(("app", "nothing"))),
        &["10.0.0.1"],
    ));
    cluster
        .routes
        .insert(mk_route("apps", "web", &[("app", "web")], true, None));

    cluster.reconciler.reconcile(&policy_id).await.unwrap();

    let no_routes = cluster
        .status_condition(&policy_id, ConditionType::NoRoutesFound)
        .expect("no-routes condition");
    assert_eq!(no_routes.status, "True");
    assert!(cluster
        .status_condition(&policy_id, ConditionType::Admitted)
        .is_none());
    assert!(cluster.routes.obj(&ResourceId::new("apps", "web")).allowlist().is_none());
}

#[tokio::test]
async fn vanished_policy_is_converged() {
    let cluster = cluster();
    let policy_id = ResourceId::new("default", "never-created");
    assert!(cluster.reconciler.reconcile(&policy_id).await.is_ok());
}

#[tokio::test]
async fn partial_failure_keeps_applied_routes_and_retries_cleanly() {
    let cluster = cluster();
    let policy_id = ResourceId::new("default", "allow-corp");
    let first = ResourceId::new("apps", "route-a");
    let second = ResourceId::new("apps", "route-b");

    cluster
        .routes
        .insert(mk_route("apps", "route-a", &[("app", "web")], true, None));
    cluster
        .routes
        .insert(mk_route("apps", "route-b", &[("app", "web")], true, None));
    cluster
        .policies
        .insert(mk_policy("default", "allow-corp", web_selector(), &["10.0.0.1"]));

    // Routes iterate in identity order, so route-b fails after route-a landed.
    cluster.routes.fail_next_patch_of(Some(second.clone()));
    assert!(cluster.reconciler.reconcile(&policy_id).await.is_err());

    assert_eq!(
        cluster.allowlist_of(&first),
        AddrSet::from_iter(["10.0.0.1"])
    );
    assert!(cluster.allowlist_of(&second).is_empty());
    let failure = cluster
        .status_condition(&policy_id, ConditionType::RouteUpdateFailure)
        .expect("failure condition");
    assert_eq!(failure.status, "False");

    // The whole reconcile is retried; idempotence makes that safe.
    cluster.routes.fail_next_patch_of(None);
    cluster.reconciler.reconcile(&policy_id).await.unwrap();

    assert_eq!(
        cluster.allowlist_of(&first),
        AddrSet::from_iter(["10.0.0.1"])
    );
    assert_eq!(
        cluster.allowlist_of(&second),
        AddrSet::from_iter(["10.0.0.1"])
    );
    assert!(cluster
        .status_condition(&policy_id, ConditionType::RouteUpdateFailure)
        .is_none());
    assert_eq!(
        cluster
            .status_condition(&policy_id, ConditionType::Admitted)
            .expect("admitted condition")
            .status,
        "True"
    );
}

#[tokio::test]
async fn stale_version_patch_conflicts() {
    let cluster = cluster();
    let route_id = ResourceId::new("apps", "web");
    cluster
        .routes
        .insert(mk_route("apps", "web", &[("app", "web")], true, None));

    let stale = Patch::conditional(
        json!({ "metadata": { "annotations": { k8s::ALLOWLIST_ANNOTATION: "10.0.0.1" } } }),
        Some("0".to_string()),
    );
    let result = cluster.routes.patch(&route_id, stale).await;
    assert!(matches!(result, Err(StoreError::Conflict)));
}

#[tokio::test]
async fn ledger_create_is_lazy_and_shared() {
    let cluster = cluster();
    let ledger_id = ResourceId::new(LEDGER_NS, k8s::WATCHED_ROUTES_CONFIG_MAP);
    assert!(!cluster.ledger.contains(&ledger_id));

    let a = ResourceId::new("default", "allow-a");
    let b = ResourceId::new("default", "allow-b");
    cluster
        .routes
        .insert(mk_route("apps", "web", &[("app", "web")], true, None));
    cluster
        .policies
        .insert(mk_policy("default", "allow-a", web_selector(), &["10.0.0.1"]));
    cluster
        .policies
        .insert(mk_policy("default", "allow-b", web_selector(), &["10.0.0.2"]));

    cluster.reconciler.reconcile(&a).await.unwrap();
    cluster.reconciler.reconcile(&b).await.unwrap();

    assert!(cluster.ledger.contains(&ledger_id));
    let mut owners = cluster.ledger_owners();
    owners.sort();
    assert_eq!(owners, vec!["allow-a".to_string(), "allow-b".to_string()]);
}
