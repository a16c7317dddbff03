//! On-target agent workload
//!
//! The agent is a ServiceAccount plus a Deployment in the agent namespace of
//! the physical cluster, both named after the SyncTarget so several targets
//! can share one cluster and namespace. The desired objects are pure
//! functions of the SyncTarget; [`KubeAgentDeployer`] compares them against
//! what exists, only writes on drift, and never touches agent objects
//! labelled for another target.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, DeleteParams, Preconditions};
use kube::{Client, Resource, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info};

use tether_common::crd::{AgentSpec, SyncTarget};
use tether_common::{Error, Result, SYNC_TARGET_LABEL};

use crate::store::{post_params, with_timeout, ClusterStore, KubeStore, Side};

/// Prefix of the agent ServiceAccount and Deployment names
pub const AGENT_NAME: &str = "tether-agent";

const AGENT_COMPONENT_LABEL: &str = "app.kubernetes.io/name";

/// What `ensure` did to the agent Deployment
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentOutcome {
    /// Deployment did not exist and was created
    Created,
    /// Deployment drifted and was replaced
    Updated,
    /// Deployment already matched
    Unchanged,
    /// The SyncTarget configures no agent
    NotConfigured,
}

/// Deploys and removes the agent on the physical cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AgentDeployer: Send + Sync {
    /// Create or update the agent workload for a target
    async fn ensure(&self, target: &SyncTarget) -> Result<AgentOutcome>;

    /// Request deletion of the agent workload; absent objects are fine
    async fn delete(&self, target: &SyncTarget) -> Result<()>;

    /// True while the agent Deployment still exists
    async fn exists(&self, target: &SyncTarget) -> Result<bool>;
}

/// Name of the agent ServiceAccount and Deployment for a target
pub fn agent_name(target: &SyncTarget) -> String {
    format!("{}-{}", AGENT_NAME, target.name_any())
}

/// True if an agent object is labelled for `target`
pub fn owned_by(meta: &ObjectMeta, target: &SyncTarget) -> bool {
    meta.labels
        .as_ref()
        .and_then(|l| l.get(SYNC_TARGET_LABEL))
        .is_some_and(|owner| *owner == target.name_any())
}

fn foreign(kind: &str, namespace: &str, name: &str, target: &SyncTarget) -> Error {
    Error::validation_for(
        format!("{}/{}/{}", kind, namespace, name),
        format!("exists but is not owned by sync target {}", target.name_any()),
    )
}

fn agent_labels(target: &SyncTarget) -> BTreeMap<String, String> {
    BTreeMap::from([
        (AGENT_COMPONENT_LABEL.to_string(), AGENT_NAME.to_string()),
        (SYNC_TARGET_LABEL.to_string(), target.name_any()),
    ])
}

/// Desired agent ServiceAccount
pub fn service_account(target: &SyncTarget, agent: &AgentSpec) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(agent_name(target)),
            namespace: Some(agent.namespace.clone()),
            labels: Some(agent_labels(target)),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Desired agent Deployment
pub fn deployment(target: &SyncTarget, agent: &AgentSpec) -> Deployment {
    let labels = agent_labels(target);
    Deployment {
        metadata: ObjectMeta {
            name: Some(agent_name(target)),
            namespace: Some(agent.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(agent.replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(agent_name(target)),
                    containers: vec![Container {
                        name: "agent".to_string(),
                        image: Some(agent.image.clone()),
                        args: Some(vec![
                            format!("--sync-target={}", target.name_any()),
                            format!("--workspace={}", target.spec.workspace),
                        ]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// True if `existing` differs from `desired` in a field the syncer owns.
///
/// Server-defaulted fields are ignored; only replicas, pod labels, service
/// account and the container image and args are compared.
pub fn agent_drifted(existing: &Deployment, desired: &Deployment) -> bool {
    let (Some(have), Some(want)) = (existing.spec.as_ref(), desired.spec.as_ref()) else {
        return true;
    };
    if have.replicas != want.replicas {
        return true;
    }
    let pod_labels = |s: &DeploymentSpec| {
        s.template
            .metadata
            .as_ref()
            .and_then(|m| m.labels.clone())
            .unwrap_or_default()
    };
    if pod_labels(have) != pod_labels(want) {
        return true;
    }
    let (Some(have_pod), Some(want_pod)) = (have.template.spec.as_ref(), want.template.spec.as_ref())
    else {
        return true;
    };
    if have_pod.service_account_name != want_pod.service_account_name
        || have_pod.containers.len() != want_pod.containers.len()
    {
        return true;
    }
    have_pod
        .containers
        .iter()
        .zip(&want_pod.containers)
        .any(|(h, w)| h.name != w.name || h.image != w.image || h.args != w.args)
}

/// [`AgentDeployer`] writing to the physical cluster through kube
pub struct KubeAgentDeployer {
    client: Client,
    timeout: Duration,
}

impl KubeAgentDeployer {
    /// Deployer for the physical cluster reached through `client`
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn ensure_service_account(
        &self,
        target: &SyncTarget,
        sa: &ServiceAccount,
        namespace: &str,
    ) -> Result<()> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let name = agent_name(target);
        match api.get_opt(&name).await? {
            Some(existing) if !owned_by(&existing.metadata, target) => {
                return Err(foreign("serviceaccount", namespace, &name, target));
            }
            Some(_) => return Ok(()),
            None => {}
        }
        match api.create(&post_params(), sa).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_deployment(
        &self,
        target: &SyncTarget,
        desired: &Deployment,
        namespace: &str,
    ) -> Result<AgentOutcome> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let name = agent_name(target);
        match api.get_opt(&name).await? {
            None => {
                api.create(&post_params(), desired).await?;
                Ok(AgentOutcome::Created)
            }
            Some(existing) if !owned_by(&existing.metadata, target) => {
                Err(foreign("deployment", namespace, &name, target))
            }
            Some(existing) if agent_drifted(&existing, desired) => {
                let mut update = desired.clone();
                update.metadata.resource_version = existing.resource_version();
                api.replace(&name, &post_params(), &update).await?;
                Ok(AgentOutcome::Updated)
            }
            Some(_) => Ok(AgentOutcome::Unchanged),
        }
    }

    /// Delete one agent object if it exists and belongs to `target`
    async fn delete_owned<K>(
        &self,
        api: &Api<K>,
        target: &SyncTarget,
        params: DeleteParams,
    ) -> Result<()>
    where
        K: Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned,
    {
        let name = agent_name(target);
        let Some(existing) = api.get_opt(&name).await? else {
            return Ok(());
        };
        if !owned_by(existing.meta(), target) {
            debug!(%name, "Agent object belongs to another target, leaving it");
            return Ok(());
        }
        let params = DeleteParams {
            preconditions: Some(Preconditions {
                uid: existing.meta().uid.clone(),
                resource_version: None,
            }),
            ..params
        };
        match api.delete(&name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl AgentDeployer for KubeAgentDeployer {
    async fn ensure(&self, target: &SyncTarget) -> Result<AgentOutcome> {
        let Some(agent) = target.spec.agent.as_ref() else {
            return Ok(AgentOutcome::NotConfigured);
        };
        let namespace = agent.namespace.as_str();

        let owner = target.name_any();
        let labels = [(SYNC_TARGET_LABEL, owner.as_str())];
        let outcome = with_timeout(Side::Physical, "agent-deploy", self.timeout, async {
            KubeStore::new(self.client.clone(), Side::Physical)
                .ensure_namespace(namespace, &labels)
                .await?;
            self.ensure_service_account(target, &service_account(target, agent), namespace)
                .await?;
            self.ensure_deployment(target, &deployment(target, agent), namespace)
                .await
        })
        .await?;

        match outcome {
            AgentOutcome::Created | AgentOutcome::Updated => {
                info!(sync_target = %target.name_any(), %namespace, ?outcome, "Agent deployed")
            }
            _ => debug!(sync_target = %target.name_any(), %namespace, "Agent up to date"),
        }
        Ok(outcome)
    }

    async fn delete(&self, target: &SyncTarget) -> Result<()> {
        let namespace = target.agent_namespace();
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let accounts: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);

        with_timeout(Side::Physical, "agent-delete", self.timeout, async {
            self.delete_owned(&deployments, target, DeleteParams::foreground())
                .await?;
            self.delete_owned(&accounts, target, DeleteParams::default())
                .await
        })
        .await
    }

    async fn exists(&self, target: &SyncTarget) -> Result<bool> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), target.agent_namespace());
        with_timeout(Side::Physical, "agent-get", self.timeout, async {
            Ok(api
                .get_opt(&agent_name(target))
                .await?
                .is_some_and(|d| owned_by(&d.metadata, target)))
        })
        .await
    }
}
