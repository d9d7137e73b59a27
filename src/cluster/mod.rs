//! Cluster connectivity
//!
//! [`ClusterHandle`] bundles the two capabilities the scenario talks to: the
//! Kubernetes API ([`ClusterApi`]) and the package manager
//! ([`PackageManager`](crate::helm::PackageManager)). It is built once before
//! the scenario runs and shared read-only by every step.
//!
//! # Example
//!
//! ```no_run
//! use discovery_e2e::cluster::ClusterHandle;
//! use discovery_e2e::config::ClusterConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let handle = ClusterHandle::connect(&ClusterConfig::new()).await?;
//!     let nodes = handle.api().list_nodes(None).await?;
//!     println!("{} nodes", nodes.len());
//!     Ok(())
//! }
//! ```

mod api;

pub use api::{create_client, KubeClusterApi};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::{ClusterConfig, ConfigError};
use crate::helm::{HelmCli, PackageManager};

/// Kinds of namespaced workloads the cleaner can remove
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkloadKind {
    DaemonSet,
    Deployment,
    StatefulSet,
}

impl WorkloadKind {
    /// Lowercase kind as used in `kind/name` references
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DaemonSet => "daemonset",
            Self::Deployment => "deployment",
            Self::StatefulSet => "statefulset",
        }
    }

    /// Parse a kind, accepting kubectl short names
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "daemonset" | "daemonsets" | "ds" => Some(Self::DaemonSet),
            "deployment" | "deployments" | "deploy" => Some(Self::Deployment),
            "statefulset" | "statefulsets" | "sts" => Some(Self::StatefulSet),
            _ => None,
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Labels of one node at observation time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

impl NodeSnapshot {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn has_label(&self, key: &str) -> bool {
        self.labels.contains_key(key)
    }
}

impl From<&k8s_openapi::api::core::v1::Node> for NodeSnapshot {
    fn from(node: &k8s_openapi::api::core::v1::Node) -> Self {
        Self {
            name: node.metadata.name.clone().unwrap_or_default(),
            labels: node.metadata.labels.clone().unwrap_or_default(),
        }
    }
}

/// Error type for cluster API calls
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClusterError {
    #[error("{kind} '{name}' not found in namespace '{namespace}'")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("permission denied: {0}")]
    Forbidden(String),

    #[error("kubernetes API error: {0}")]
    Api(String),
}

impl ClusterError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors that abort the run before any step executes
#[derive(Debug, thiserror::Error)]
pub enum ConnectivityError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to load kubeconfig {path}: {reason}")]
    Kubeconfig { path: String, reason: String },

    #[error("failed to create Kubernetes client: {0}")]
    Client(String),

    #[error("cluster unreachable: {0}")]
    Unreachable(String),

    #[error("cluster reported no namespaces")]
    EmptyCluster,
}

/// Read side and delete side of the Kubernetes API the scenario needs
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List nodes, optionally filtered by a label selector
    async fn list_nodes(&self, selector: Option<&str>) -> Result<Vec<NodeSnapshot>, ClusterError>;

    /// Delete a named workload; `ClusterError::NotFound` when it does not exist
    async fn delete_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClusterError>;

    /// Check whether a named workload currently exists
    async fn workload_exists(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<bool, ClusterError>;

    /// List namespace names, used as a connectivity probe
    async fn list_namespaces(&self) -> Result<Vec<String>, ClusterError>;
}

/// Live connection to one target cluster and namespace
///
/// Cheap to clone; clones share the same capabilities.
#[derive(Clone)]
pub struct ClusterHandle {
    api: Arc<dyn ClusterApi>,
    charts: Arc<dyn PackageManager>,
    namespace: String,
}

impl ClusterHandle {
    /// Build a handle from explicit capabilities
    #[must_use]
    pub fn new(
        api: Arc<dyn ClusterApi>,
        charts: Arc<dyn PackageManager>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            api,
            charts,
            namespace: namespace.into(),
        }
    }

    /// Connect to the cluster described by `config`
    ///
    /// Loads the kubeconfig, builds a client and probes the API server by
    /// listing namespaces. Not retried: an unreachable control plane makes the
    /// whole scenario meaningless.
    pub async fn connect(config: &ClusterConfig) -> Result<Self, ConnectivityError> {
        let kubeconfig = config.resolve_kubeconfig()?;
        let client = create_client(config, &kubeconfig).await?;
        let api = Arc::new(KubeClusterApi::new(client));

        let namespaces = api
            .list_namespaces()
            .await
            .map_err(|e| ConnectivityError::Unreachable(e.to_string()))?;
        if namespaces.is_empty() {
            return Err(ConnectivityError::EmptyCluster);
        }

        info!(
            kubeconfig = %kubeconfig.display(),
            namespace = %config.namespace,
            namespaces = namespaces.len(),
            "Connected to cluster"
        );

        let charts = HelmCli::new()
            .kubeconfig(kubeconfig)
            .context(config.context.clone());

        Ok(Self::new(api, Arc::new(charts), config.namespace.clone()))
    }

    #[must_use]
    pub fn api(&self) -> &Arc<dyn ClusterApi> {
        &self.api
    }

    #[must_use]
    pub fn charts(&self) -> &Arc<dyn PackageManager> {
        &self.charts
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl fmt::Debug for ClusterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterHandle")
            .field("namespace", &self.namespace)
            .field("charts", &self.charts.name())
            .finish_non_exhaustive()
    }
}
