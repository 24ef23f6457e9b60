use ipshield_controller_core::ResourceId;
use ipshield_controller_k8s_api::labels;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, ListParams, Patch as KubePatch, PatchParams, PostParams};
use std::marker::PhantomData;

/// Errors surfaced by a resource store.
///
/// NotFound is frequently not an error at all (a vanished object is already
/// converged); Conflict and Transport are transient and drive a re-enqueue.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("resource not found")]
    NotFound,

    #[error("resource version conflict")]
    Conflict,

    #[error("store transport error: {0}")]
    Transport(#[source] anyhow::Error),
}

impl From<kube::Error> for StoreError {
    fn from(error: kube::Error) -> Self {
        match error {
            kube::Error::Api(response) if response.code == 404 => Self::NotFound,
            kube::Error::Api(response) if response.code == 409 => Self::Conflict,
            error => Self::Transport(error.into()),
        }
    }
}

/// A JSON merge patch, optionally conditioned on the last observed
/// resourceVersion so that concurrent writers conflict instead of clobbering
/// each other.
#[derive(Clone, Debug)]
pub struct Patch {
    expected_version: Option<String>,
    value: serde_json::Value,
}

impl Patch {
    pub fn merge(value: serde_json::Value) -> Self {
        Self {
            expected_version: None,
            value,
        }
    }

    pub fn conditional(value: serde_json::Value, expected_version: Option<String>) -> Self {
        Self {
            expected_version,
            value,
        }
    }

    pub fn expected_version(&self) -> Option<&str> {
        self.expected_version.as_deref()
    }

    pub fn value(&self) -> &serde_json::Value {
        &self.value
    }

    /// The patch body sent on the wire, with the version condition folded into
    /// `metadata.resourceVersion`.
    pub fn into_value(self) -> serde_json::Value {
        let Self {
            expected_version,
            mut value,
        } = self;
        if let Some(version) = expected_version {
            value["metadata"]["resourceVersion"] = serde_json::Value::String(version);
        }
        value
    }
}

/// Uniform access to one concrete resource kind. The reconciler only ever
/// gets, lists, and patches; watches are wired by the surrounding runtime.
///
/// Successful mutations return the object's new resourceVersion so chained
/// patches within one reconcile do not conflict with themselves.
#[async_trait::async_trait]
pub trait Store<T>: Send + Sync {
    async fn get(&self, id: &ResourceId) -> Result<T, StoreError>;

    async fn list(&self, selector: &labels::Selector) -> Result<Vec<T>, StoreError>;

    async fn patch(&self, id: &ResourceId, patch: Patch) -> Result<String, StoreError>;

    async fn patch_status(&self, id: &ResourceId, patch: Patch) -> Result<String, StoreError> {
        self.patch(id, patch).await
    }

    async fn create(&self, obj: &T) -> Result<String, StoreError>;
}

/// The kube-client-backed adapter used against a real API server.
pub struct KubeStore<K> {
    client: kube::Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K> {
    pub fn new(client: kube::Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

impl<K> KubeStore<K>
where
    K: kube::Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    fn namespaced(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl<K> Store<K> for KubeStore<K>
where
    K: kube::Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + std::fmt::Debug
        + serde::Serialize
        + serde::de::DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, id: &ResourceId) -> Result<K, StoreError> {
        let obj = self.namespaced(&id.namespace).get(&id.name).await?;
        Ok(obj)
    }

    async fn list(&self, selector: &labels::Selector) -> Result<Vec<K>, StoreError> {
        let params = ListParams::default().labels(&selector.to_query());
        let list = Api::<K>::all(self.client.clone()).list(&params).await?;
        Ok(list.items)
    }

    async fn patch(&self, id: &ResourceId, patch: Patch) -> Result<String, StoreError> {
        let obj = self
            .namespaced(&id.namespace)
            .patch(
                &id.name,
                &PatchParams::default(),
                &KubePatch::Merge(patch.into_value()),
            )
            .await?;
        Ok(version_of(&obj))
    }

    async fn patch_status(&self, id: &ResourceId, patch: Patch) -> Result<String, StoreError> {
        let obj = self
            .namespaced(&id.namespace)
            .patch_status(
                &id.name,
                &PatchParams::default(),
                &KubePatch::Merge(patch.into_value()),
            )
            .await?;
        Ok(version_of(&obj))
    }

    async fn create(&self, obj: &K) -> Result<String, StoreError> {
        let namespace = obj.meta().namespace.clone().unwrap_or_default();
        let created = self
            .namespaced(&namespace)
            .create(&PostParams::default(), obj)
            .await?;
        Ok(version_of(&created))
    }
}

fn version_of<K: kube::Resource>(obj: &K) -> String {
    obj.meta().resource_version.clone().unwrap_or_default()
}
