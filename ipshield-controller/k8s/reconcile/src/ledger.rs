use crate::store::{Patch, Store, StoreError};
use ipshield_controller_core::{AddrSet, ResourceId};
use ipshield_controller_k8s_api::{self as k8s, ObjectMeta};
use kube::Resource;
use serde_json::json;
use std::{collections::BTreeMap, sync::Arc};

/// The provenance ledger: one ConfigMap per watch scope recording, per route,
/// the allowlist value observed before any policy touched it.
///
/// The ledger is shared by every RouteAllowlist and carries no lock; all
/// mutations are version-conditioned patches, and the set operations layered
/// on top commute, so concurrent reconciles converge through retries.
pub struct Ledger {
    store: Arc<dyn Store<k8s::ConfigMap>>,
    id: ResourceId,
}

/// A loaded snapshot of the ledger, mutated locally and committed as merge
/// patches. Removed entries are patched as explicit nulls.
pub struct LedgerRecord {
    version: Option<String>,
    entries: BTreeMap<String, String>,
    owners: Vec<k8s::OwnerReference>,
    dirty_entries: BTreeMap<String, Option<String>>,
    owners_dirty: bool,
}

impl Ledger {
    pub fn new(store: Arc<dyn Store<k8s::ConfigMap>>, namespace: impl ToString) -> Self {
        Self {
            store,
            id: ResourceId::new(namespace, k8s::WATCHED_ROUTES_CONFIG_MAP),
        }
    }

    /// Fetches the ledger, creating it lazily on first use, and ensures the
    /// calling policy holds an ownership back-reference. Idempotent; a create
    /// lost to another reconcile is tolerated by re-fetching.
    pub async fn load(&self, policy: &k8s::RouteAllowlist) -> Result<LedgerRecord, StoreError> {
        let config_map = match self.store.get(&self.id).await {
            Ok(config_map) => config_map,
            Err(StoreError::NotFound) => {
                match self.store.create(&self.blank(policy)).await {
                    Ok(_) => {}
                    // Another reconcile created it first.
                    Err(StoreError::Conflict) => {}
                    Err(error) => return Err(error),
                }
                self.store.get(&self.id).await?
            }
            Err(error) => return Err(error),
        };

        let mut record = LedgerRecord::from_config_map(config_map);
        if !record.owned_by(policy) {
            record.owners.push(owner_reference(policy));
            record.owners_dirty = true;
            self.commit(&mut record).await?;
        }
        Ok(record)
    }

    /// Persists any local mutations; a no-op on a clean record.
    pub async fn commit(&self, record: &mut LedgerRecord) -> Result<(), StoreError> {
        let Some(patch) = record.take_patch() else {
            return Ok(());
        };
        let version = self.store.patch(&self.id, patch).await?;
        record.version = Some(version);
        Ok(())
    }

    fn blank(&self, policy: &k8s::RouteAllowlist) -> k8s::ConfigMap {
        k8s::ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.id.name.clone()),
                namespace: Some(self.id.namespace.clone()),
                owner_references: Some(vec![owner_reference(policy)]),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

impl LedgerRecord {
    fn from_config_map(config_map: k8s::ConfigMap) -> Self {
        Self {
            version: config_map.metadata.resource_version,
            entries: config_map.data.unwrap_or_default(),
            owners: config_map.metadata.owner_references.unwrap_or_default(),
            dirty_entries: BTreeMap::new(),
            owners_dirty: false,
        }
    }

    /// Captures the route's current allowlist value as its baseline, unless a
    /// baseline was already recorded. First writer wins.
    pub fn ensure(&mut self, target: &ResourceId, current: &str) {
        let key = target.ledger_key();
        if self.entries.contains_key(&key) {
            return;
        }
        self.entries.insert(key.clone(), current.to_string());
        self.dirty_entries.insert(key, Some(current.to_string()));
    }

    /// The recorded baseline for a route, or the empty set.
    pub fn baseline(&self, target: &ResourceId) -> AddrSet {
        self.entries
            .get(&target.ledger_key())
            .map(|raw| AddrSet::decode(raw))
            .unwrap_or_default()
    }

    /// Drops the route's entry once nothing beyond its baseline remains
    /// attributable to a policy.
    pub fn retire_if_redundant(&mut self, target: &ResourceId, candidate: &AddrSet) {
        if !candidate.diff(&self.baseline(target)).is_empty() {
            return;
        }
        let key = target.ledger_key();
        if self.entries.remove(&key).is_some() {
            self.dirty_entries.insert(key, None);
        }
    }

    /// Drops the policy's ownership back-reference on cleanup.
    pub fn release(&mut self, policy: &k8s::RouteAllowlist) {
        let before = self.owners.len();
        let name = policy.metadata.name.as_deref().unwrap_or_default();
        self.owners
            .retain(|owner| !(owner.kind == "RouteAllowlist" && owner.name == name));
        if self.owners.len() != before {
            self.owners_dirty = true;
        }
    }

    pub fn contains(&self, target: &ResourceId) -> bool {
        self.entries.contains_key(&target.ledger_key())
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty_entries.is_empty() || self.owners_dirty
    }

    fn owned_by(&self, policy: &k8s::RouteAllowlist) -> bool {
        let name = policy.metadata.name.as_deref().unwrap_or_default();
        self.owners
            .iter()
            .any(|owner| owner.kind == "RouteAllowlist" && owner.name == name)
    }

    fn take_patch(&mut self) -> Option<Patch> {
        if !self.is_dirty() {
            return None;
        }

        let mut value = serde_json::Map::new();
        if !self.dirty_entries.is_empty() {
            let data = std::mem::take(&mut self.dirty_entries)
                .into_iter()
                .map(|(k, v)| (k, v.map(serde_json::Value::String).unwrap_or_default()))
                .collect::<serde_json::Map<_, _>>();
            value.insert("data".to_string(), data.into());
        }
        if self.owners_dirty {
            self.owners_dirty = false;
            value.insert(
                "metadata".to_string(),
                json!({ "ownerReferences": self.owners }),
            );
        }

        Some(Patch::conditional(value.into(), self.version.clone()))
    }
}

fn owner_reference(policy: &k8s::RouteAllowlist) -> k8s::OwnerReference {
    k8s::OwnerReference {
        api_version: k8s::RouteAllowlist::api_version(&()).into_owned(),
        kind: k8s::RouteAllowlist::kind(&()).into_owned(),
        name: policy.metadata.name.clone().unwrap_or_default(),
        uid: policy.metadata.uid.clone().unwrap_or_default(),
        block_owner_deletion: None,
        controller: None,
    }
}
