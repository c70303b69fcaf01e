//! Typed object store used by every synchronizer and the election engine
//!
//! The controller only ever needs a handful of namespaced verbs. They are
//! collected behind [`ObjectStore`] so the election logic can be driven by an
//! in-memory store in tests; [`KubeStore`] is the production implementation.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};

/// Any namespaced, statically typed Kubernetes object
pub trait StoreResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + DeserializeOwned
    + Serialize
    + Debug
    + Send
    + Sync
    + 'static
{
}

impl<K> StoreResource for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static
{
}

/// Namespaced CRUD over typed objects.
///
/// `get` reports absence as `Ok(None)`. Writes that lose an
/// optimistic-concurrency race fail with [`Error::Conflict`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get<K: StoreResource>(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// List objects matching an equality-based label selector (`k=v,k2=v2`)
    async fn list<K: StoreResource>(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>>;

    async fn create<K: StoreResource>(&self, namespace: &str, obj: &K) -> Result<K>;

    /// Replace the object; the resource version in `obj` must be current
    async fn replace<K: StoreResource>(&self, namespace: &str, obj: &K) -> Result<K>;

    /// Replace only the status subresource; the resource version must be current
    async fn replace_status<K: StoreResource>(&self, namespace: &str, obj: &K) -> Result<K>;

    async fn merge_patch<K: StoreResource>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K>;

    /// Delete the object; returns false if it was already gone
    async fn delete<K: StoreResource>(&self, namespace: &str, name: &str) -> Result<bool>;
}

/// [`ObjectStore`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    field_manager: String,
}

impl KubeStore {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api<K: StoreResource>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }
}

/// Translate a write failure, turning HTTP 409 into [`Error::Conflict`]
fn write_error<K: StoreResource>(name: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(e) if e.code == 409 => Error::Conflict {
            kind: K::kind(&()).to_string(),
            name: name.to_string(),
        },
        e => Error::KubeError(e),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: StoreResource>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        match self.api::<K>(namespace).get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!("{} {}/{} not found", K::kind(&()), namespace, name);
                Ok(None)
            }
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    async fn list<K: StoreResource>(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>> {
        let params = ListParams::default().labels(label_selector);
        let list = self.api::<K>(namespace).list(&params).await?;
        Ok(list.items)
    }

    async fn create<K: StoreResource>(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj.name_any();
        self.api::<K>(namespace)
            .create(&self.post_params(), obj)
            .await
            .map_err(|e| write_error::<K>(&name, e))
    }

    async fn replace<K: StoreResource>(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj.name_any();
        self.api::<K>(namespace)
            .replace(&name, &self.post_params(), obj)
            .await
            .map_err(|e| write_error::<K>(&name, e))
    }

    async fn replace_status<K: StoreResource>(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let data = serde_json::to_vec(obj)?;
        self.api::<K>(namespace)
            .replace_status(&name, &self.post_params(), data)
            .await
            .map_err(|e| write_error::<K>(&name, e))
    }

    async fn merge_patch<K: StoreResource>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K> {
        let params = PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        self.api::<K>(namespace)
            .patch(name, &params, &Patch::Merge(patch))
            .await
            .map_err(|e| write_error::<K>(name, e))
    }

    async fn delete<K: StoreResource>(&self, namespace: &str, name: &str) -> Result<bool> {
        match self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
            Err(e) => Err(Error::KubeError(e)),
        }
    }
}
