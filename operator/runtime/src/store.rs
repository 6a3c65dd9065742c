//! The resource store seam.
//!
//! Reconcilers and the admission handler only talk to the cluster through
//! [`Store`]. Absence is reported as `Ok(None)` (or ignored, for deletes) and
//! stale writes as [`Error::Conflict`], so that callers never inspect raw API
//! status codes.

use async_trait::async_trait;
use fluent_pvc_operator_k8s_api::{
    FluentPvc, FluentPvcBinding, Job, PersistentVolumeClaim, Pod, Resource, ResourceExt,
    StorageClass,
};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    Client,
};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error(transparent)]
    Api(kube::Error),

    #[error("failed to encode object: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A page of a list response.
#[derive(Clone, Debug)]
pub struct Page<K> {
    pub items: Vec<K>,
    pub continue_token: Option<String>,
}

/// A resource type the store can read and write.
pub trait Object:
    Resource<DynamicType = ()>
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Builds an API handle scoped to the namespace, or to the whole cluster.
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;
}

#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>>;

    async fn list<K: Object>(
        &self,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> Result<Page<K>>;

    async fn create<K: Object>(&self, obj: &K) -> Result<K>;

    /// Submits `obj` for creation with server-side dry run, so that it is
    /// validated and admitted but never persisted.
    async fn dry_run_create<K: Object>(&self, obj: &K) -> Result<()>;

    /// Replaces the object, failing with a conflict if its resource version
    /// is stale. The status is not written.
    async fn update<K: Object>(&self, obj: &K) -> Result<K>;

    /// Writes only the status of `obj`, guarded by its resource version.
    async fn update_status<K, S>(&self, obj: &K, status: &S) -> Result<K>
    where
        K: Object,
        S: Serialize + Sync;

    /// Applies a JSON merge patch.
    async fn patch<K: Object>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K>;

    /// Deletes the object. Deleting an absent object succeeds.
    async fn delete<K: Object>(
        &self,
        namespace: Option<&str>,
        name: &str,
        params: &DeleteParams,
    ) -> Result<()>;
}

/// A [`Store`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

// === impl Error ===

impl From<kube::Error> for Error {
    fn from(error: kube::Error) -> Self {
        match &error {
            kube::Error::Api(rsp) if rsp.code == 404 => Self::NotFound(rsp.message.clone()),
            kube::Error::Api(rsp) if rsp.code == 409 && rsp.reason == "AlreadyExists" => {
                Self::AlreadyExists(rsp.message.clone())
            }
            kube::Error::Api(rsp) if rsp.code == 409 => Self::Conflict(rsp.message.clone()),
            kube::Error::Api(rsp) if rsp.code == 422 => Self::Invalid(rsp.message.clone()),
            _ => Self::Api(error),
        }
    }
}

// === impl KubeStore ===

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: Object>(&self, namespace: Option<&str>) -> Api<K> {
        K::api(self.client.clone(), namespace)
    }
}

#[async_trait]
impl Store for KubeStore {
    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn list<K: Object>(
        &self,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> Result<Page<K>> {
        let list = self.api::<K>(namespace).list(params).await?;
        Ok(Page {
            items: list.items,
            continue_token: list.metadata.continue_.filter(|t| !t.is_empty()),
        })
    }

    async fn create<K: Object>(&self, obj: &K) -> Result<K> {
        let api = self.api::<K>(obj.meta().namespace.as_deref());
        Ok(api.create(&PostParams::default(), obj).await?)
    }

    async fn dry_run_create<K: Object>(&self, obj: &K) -> Result<()> {
        let api = self.api::<K>(obj.meta().namespace.as_deref());
        let params = PostParams {
            dry_run: true,
            ..Default::default()
        };
        api.create(&params, obj).await?;
        Ok(())
    }

    async fn update<K: Object>(&self, obj: &K) -> Result<K> {
        let api = self.api::<K>(obj.meta().namespace.as_deref());
        Ok(api
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await?)
    }

    async fn update_status<K, S>(&self, obj: &K, status: &S) -> Result<K>
    where
        K: Object,
        S: Serialize + Sync,
    {
        // A resource version in a merge patch is a precondition: the API
        // rejects the write with a conflict if the object has moved on.
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": obj.resource_version() },
            "status": status,
        });
        let api = self.api::<K>(obj.meta().namespace.as_deref());
        Ok(api
            .patch_status(&obj.name_any(), &PatchParams::default(), &Patch::Merge(patch))
            .await?)
    }

    async fn patch<K: Object>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K> {
        Ok(self
            .api::<K>(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?)
    }

    async fn delete<K: Object>(
        &self,
        namespace: Option<&str>,
        name: &str,
        params: &DeleteParams,
    ) -> Result<()> {
        match self.api::<K>(namespace).delete(name, params).await {
            Ok(_) => Ok(()),
            Err(error) => match Error::from(error) {
                Error::NotFound(_) => Ok(()),
                error => Err(error),
            },
        }
    }
}

macro_rules! namespaced {
    ($($ty:ty),+) => {
        $(
            impl Object for $ty {
                fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
                    match namespace {
                        Some(ns) => Api::namespaced(client, ns),
                        None => Api::all(client),
                    }
                }
            }
        )+
    };
}

macro_rules! cluster_scoped {
    ($($ty:ty),+) => {
        $(
            impl Object for $ty {
                fn api(client: Client, _: Option<&str>) -> Api<Self> {
                    Api::all(client)
                }
            }
        )+
    };
}

namespaced!(FluentPvcBinding, Job, PersistentVolumeClaim, Pod);
cluster_scoped!(FluentPvc, StorageClass);
