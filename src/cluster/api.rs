use std::path::Path;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Namespace, Node};
use kube::api::{Api, DeleteParams, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, info, instrument};

use super::{ClusterApi, ClusterError, ConnectivityError, NodeSnapshot, WorkloadKind};
use crate::config::ClusterConfig;

/// Build a kube client from a kubeconfig file with the configured timeouts
pub async fn create_client(
    config: &ClusterConfig,
    kubeconfig: &Path,
) -> Result<Client, ConnectivityError> {
    let kubeconfig_err = |reason: String| ConnectivityError::Kubeconfig {
        path: kubeconfig.display().to_string(),
        reason,
    };

    let raw = Kubeconfig::read_from(kubeconfig).map_err(|e| kubeconfig_err(e.to_string()))?;
    let options = KubeConfigOptions {
        context: config.context.clone(),
        ..Default::default()
    };
    let mut client_config = Config::from_custom_kubeconfig(raw, &options)
        .await
        .map_err(|e| kubeconfig_err(e.to_string()))?;
    client_config.connect_timeout = Some(config.connect_timeout);
    client_config.read_timeout = Some(config.read_timeout);

    Client::try_from(client_config).map_err(|e| ConnectivityError::Client(e.to_string()))
}

/// [`ClusterApi`] backed by a real kube client
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn delete_namespaced<K>(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClusterError>
    where
        K: kube::Resource<Scope = kube::core::NamespaceResourceScope>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        <K as kube::Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);

        // Foreground so the object lingers until its pods are gone
        api.delete(name, &DeleteParams::foreground())
            .await
            .map_err(|e| classify_error(e, kind, namespace, name))?;

        info!(namespace = %namespace, kind = %kind, name = %name, "Deleted workload");
        Ok(())
    }

    async fn exists_namespaced<K>(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<bool, ClusterError>
    where
        K: kube::Resource<Scope = kube::core::NamespaceResourceScope>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        <K as kube::Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let found = api
            .get_opt(name)
            .await
            .map_err(|e| classify_error(e, kind, namespace, name))?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    #[instrument(skip(self))]
    async fn list_nodes(&self, selector: Option<&str>) -> Result<Vec<NodeSnapshot>, ClusterError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let params = match selector {
            Some(selector) => ListParams::default().labels(selector),
            None => ListParams::default(),
        };

        let list = api
            .list(&params)
            .await
            .map_err(|e| ClusterError::Api(improve_error_message(&e, "nodes", "*")))?;

        let nodes: Vec<NodeSnapshot> = list.items.iter().map(NodeSnapshot::from).collect();
        debug!(count = nodes.len(), "Listed nodes");
        Ok(nodes)
    }

    #[instrument(skip(self))]
    async fn delete_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClusterError> {
        match kind {
            WorkloadKind::DaemonSet => {
                self.delete_namespaced::<DaemonSet>(kind, namespace, name)
                    .await
            }
            WorkloadKind::Deployment => {
                self.delete_namespaced::<Deployment>(kind, namespace, name)
                    .await
            }
            WorkloadKind::StatefulSet => {
                self.delete_namespaced::<StatefulSet>(kind, namespace, name)
                    .await
            }
        }
    }

    async fn workload_exists(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<bool, ClusterError> {
        match kind {
            WorkloadKind::DaemonSet => {
                self.exists_namespaced::<DaemonSet>(kind, namespace, name)
                    .await
            }
            WorkloadKind::Deployment => {
                self.exists_namespaced::<Deployment>(kind, namespace, name)
                    .await
            }
            WorkloadKind::StatefulSet => {
                self.exists_namespaced::<StatefulSet>(kind, namespace, name)
                    .await
            }
        }
    }

    async fn list_namespaces(&self) -> Result<Vec<String>, ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| ClusterError::Api(improve_error_message(&e, "namespaces", "*")))?;

        Ok(list
            .items
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .collect())
    }
}

fn classify_error(
    err: kube::Error,
    kind: WorkloadKind,
    namespace: &str,
    name: &str,
) -> ClusterError {
    match &err {
        kube::Error::Api(ae) if ae.code == 404 => ClusterError::NotFound {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(ae) if ae.code == 403 => {
            ClusterError::Forbidden(improve_error_message(&err, kind.as_str(), name))
        }
        _ => ClusterError::Api(improve_error_message(&err, kind.as_str(), name)),
    }
}

/// Turn a kube error into a message naming the resource involved
fn improve_error_message(err: &kube::Error, resource_kind: &str, resource_name: &str) -> String {
    let raw = err.to_string();

    if raw.contains("Forbidden") || raw.contains("403") {
        return format!("{resource_kind} '{resource_name}': permission denied (check RBAC)");
    }

    if raw.contains("connection refused") || raw.contains("ECONNREFUSED") {
        return format!("{resource_kind} '{resource_name}': cannot connect to Kubernetes API");
    }

    if raw.contains("timeout") || raw.contains("timed out") || raw.contains("deadline exceeded")
    {
        return format!("{resource_kind} '{resource_name}': operation timed out");
    }

    format!("{resource_kind} '{resource_name}': {raw}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} message"),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_classify_not_found() {
        let err = classify_error(
            api_error(404, "NotFound"),
            WorkloadKind::DaemonSet,
            "default",
            "fd",
        );
        assert!(err.is_not_found());
    }

    #[test]
    fn test_classify_forbidden() {
        let err = classify_error(
            api_error(403, "Forbidden"),
            WorkloadKind::DaemonSet,
            "default",
            "fd",
        );
        match err {
            ClusterError::Forbidden(msg) => {
                assert!(msg.contains("permission denied"));
                assert!(msg.contains("'fd'"));
            }
            other => panic!("expected Forbidden, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_other_api_error() {
        let err = classify_error(
            api_error(500, "InternalError"),
            WorkloadKind::Deployment,
            "default",
            "app",
        );
        assert!(matches!(err, ClusterError::Api(msg) if msg.starts_with("deployment 'app'")));
    }

    #[tokio::test]
    #[ignore] // Requires real cluster
    async fn test_delete_missing_daemonset_is_not_found() {
        let client = Client::try_default().await.expect("requires kubeconfig");
        let api = KubeClusterApi::new(client);

        let err = api
            .delete_workload(WorkloadKind::DaemonSet, "default", "does-not-exist-e2e")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
