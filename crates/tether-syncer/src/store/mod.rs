//! Object store access for one side of the sync
//!
//! Both the logical workspace and the physical cluster are reached through
//! [`ClusterStore`], which speaks `DynamicObject` for any [`ResourceType`].
//! Writes that replace or delete an existing object always carry a
//! resourceVersion precondition.

#[cfg(test)]
pub(crate) mod memory;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams, Preconditions};
use kube::discovery::verbs;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Discovery, ResourceExt};
use tracing::{debug, info};

use tether_common::{Error, ObjectKey, ResourceType, Result, FIELD_MANAGER};

/// Which side of the sync a store talks to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    /// The logical control-plane workspace
    Logical,
    /// The physical target cluster
    Physical,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Logical => write!(f, "logical"),
            Side::Physical => write!(f, "physical"),
        }
    }
}

/// CRUD, watch and discovery against one cluster
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Which side this store serves
    fn side(&self) -> Side;

    /// Fetch one object; `Ok(None)` when it does not exist
    async fn get(&self, rt: &ResourceType, key: &ObjectKey) -> Result<Option<DynamicObject>>;

    /// List objects across all namespaces matching a label selector
    async fn list(&self, rt: &ResourceType, selector: &str) -> Result<Vec<DynamicObject>>;

    /// Create an object
    async fn create(&self, rt: &ResourceType, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Replace an object; `metadata.resourceVersion` is the precondition
    async fn replace(&self, rt: &ResourceType, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Replace the status subresource; `metadata.resourceVersion` is the precondition
    async fn replace_status(&self, rt: &ResourceType, obj: &DynamicObject)
        -> Result<DynamicObject>;

    /// Delete an object, optionally guarded by a resourceVersion.
    ///
    /// Deleting an object that is already gone succeeds.
    async fn delete(
        &self,
        rt: &ResourceType,
        key: &ObjectKey,
        resource_version: Option<&str>,
    ) -> Result<()>;

    /// Ensure a namespace exists, creating it labelled with `labels` if not
    async fn ensure_namespace(&self, name: &str, labels: &[(&str, &str)]) -> Result<()>;

    /// Stream of objects touched (applied or deleted) that match the selector.
    ///
    /// The stream reconnects on its own; errors are surfaced but do not end it.
    fn watch(&self, rt: &ResourceType, selector: &str) -> BoxStream<'static, Result<DynamicObject>>;

    /// Lightweight connectivity probe; returns the server version
    async fn probe(&self) -> Result<String>;

    /// Types served with list and watch support
    async fn served_types(&self) -> Result<Vec<ResourceType>>;
}

/// Run a remote call under a deadline, mapping expiry to a connectivity error
pub async fn with_timeout<T, F>(side: Side, operation: &str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(side.to_string(), operation, limit)),
    }
}

/// [`ClusterStore`] backed by a kube client
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    side: Side,
}

impl KubeStore {
    /// Wrap a client for the given side
    pub fn new(client: Client, side: Side) -> Self {
        Self { client, side }
    }

    fn api(&self, rt: &ResourceType, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = rt.api_resource();
        match namespace {
            Some(ns) if rt.namespaced => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }

    fn api_for(&self, rt: &ResourceType, obj: &DynamicObject) -> Api<DynamicObject> {
        self.api(rt, obj.metadata.namespace.as_deref())
    }
}

pub(crate) fn post_params() -> PostParams {
    PostParams {
        dry_run: false,
        field_manager: Some(FIELD_MANAGER.to_string()),
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    fn side(&self) -> Side {
        self.side
    }

    async fn get(&self, rt: &ResourceType, key: &ObjectKey) -> Result<Option<DynamicObject>> {
        Ok(self
            .api(rt, key.namespace.as_deref())
            .get_opt(&key.name)
            .await?)
    }

    async fn list(&self, rt: &ResourceType, selector: &str) -> Result<Vec<DynamicObject>> {
        let lp = ListParams::default().labels(selector);
        Ok(self.api(rt, None).list(&lp).await?.items)
    }

    async fn create(&self, rt: &ResourceType, obj: &DynamicObject) -> Result<DynamicObject> {
        Ok(self.api_for(rt, obj).create(&post_params(), obj).await?)
    }

    async fn replace(&self, rt: &ResourceType, obj: &DynamicObject) -> Result<DynamicObject> {
        if obj.metadata.resource_version.is_none() {
            return Err(Error::internal_with_context(
                "store",
                format!("replace of {} without resourceVersion", ObjectKey::of(obj)),
            ));
        }
        Ok(self
            .api_for(rt, obj)
            .replace(&obj.name_any(), &post_params(), obj)
            .await?)
    }

    async fn replace_status(
        &self,
        rt: &ResourceType,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        if obj.metadata.resource_version.is_none() {
            return Err(Error::internal_with_context(
                "store",
                format!("status replace of {} without resourceVersion", ObjectKey::of(obj)),
            ));
        }
        let body = serde_json::to_vec(obj)?;
        Ok(self
            .api_for(rt, obj)
            .replace_status(&obj.name_any(), &post_params(), body)
            .await?)
    }

    async fn delete(
        &self,
        rt: &ResourceType,
        key: &ObjectKey,
        resource_version: Option<&str>,
    ) -> Result<()> {
        let dp = DeleteParams {
            preconditions: resource_version.map(|rv| Preconditions {
                resource_version: Some(rv.to_string()),
                uid: None,
            }),
            ..DeleteParams::background()
        };
        match self
            .api(rt, key.namespace.as_deref())
            .delete(&key.name, &dp)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_namespace(&self, name: &str, labels: &[(&str, &str)]) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        if api.get_opt(name).await?.is_some() {
            return Ok(());
        }

        let mut ns = Namespace::default();
        ns.metadata.name = Some(name.to_string());
        ns.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );

        match api.create(&post_params(), &ns).await {
            Ok(_) => {
                info!(side = %self.side, namespace = %name, "Created namespace");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn watch(&self, rt: &ResourceType, selector: &str) -> BoxStream<'static, Result<DynamicObject>> {
        let config = watcher::Config::default().labels(selector).any_semantic();
        watcher(self.api(rt, None), config)
            .default_backoff()
            .touched_objects()
            .map_err(|e| Error::connectivity("watch", e.to_string()))
            .boxed()
    }

    async fn probe(&self) -> Result<String> {
        let info = self.client.apiserver_version().await?;
        Ok(info.git_version)
    }

    async fn served_types(&self) -> Result<Vec<ResourceType>> {
        let discovery = Discovery::new(self.client.clone()).run().await?;

        let mut types = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                let usable = [verbs::LIST, verbs::WATCH, verbs::CREATE, verbs::UPDATE, verbs::DELETE]
                    .iter()
                    .all(|v| caps.supports_operation(v));
                if usable {
                    types.push(ResourceType::from_discovery(&ar, &caps));
                }
            }
        }

        debug!(side = %self.side, count = types.len(), "Discovered served types");
        Ok(types)
    }
}

/// Label selector matching: `k=v` terms joined by commas, all must match
pub fn selector_matches(selector: &str, obj: &DynamicObject) -> bool {
    let labels = obj.labels();
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => labels.contains_key(term),
        })
}
