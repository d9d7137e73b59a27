//! In-memory cluster and package manager
//!
//! [`FakeCluster`] and [`FakeCharts`] implement the same capability traits as
//! the live clients, so a whole scenario can run without a cluster. Linking
//! the two with [`FakeCharts::labels_nodes`] makes installs label every node
//! and uninstalls remove the label, the way the real daemon would.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::cluster::{ClusterApi, ClusterError, NodeSnapshot, WorkloadKind};
use crate::helm::{HelmError, PackageManager, Release, ReleaseSpec};

type WorkloadKey = (WorkloadKind, String, String);

#[derive(Debug)]
struct LabelChange {
    key: String,
    /// `None` removes the label
    value: Option<String>,
    /// `list_nodes` calls still to go before the change is visible
    remaining: u32,
}

#[derive(Debug, Default)]
struct ClusterState {
    nodes: Vec<NodeSnapshot>,
    /// `None` while live, `Some(n)` while terminating with `n` existence checks left
    workloads: BTreeMap<WorkloadKey, Option<u32>>,
    deletion_lag: u32,
    label_lag: u32,
    pending: Vec<LabelChange>,
    delete_error: Option<ClusterError>,
    list_error: Option<ClusterError>,
    exists_error: Option<ClusterError>,
    list_calls: usize,
}

/// Kubernetes API backed by a node list and a workload set
#[derive(Debug)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCluster {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClusterState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn with_nodes(self, nodes: Vec<NodeSnapshot>) -> Self {
        self.lock().nodes = nodes;
        self
    }

    #[must_use]
    pub fn with_workload(self, kind: WorkloadKind, namespace: &str, name: &str) -> Self {
        self.lock()
            .workloads
            .insert((kind, namespace.to_string(), name.to_string()), None);
        self
    }

    /// Deleted workloads keep existing for `checks` existence checks
    #[must_use]
    pub fn with_deletion_lag(self, checks: u32) -> Self {
        self.lock().deletion_lag = checks;
        self
    }

    /// Label changes become visible after `lists` node listings
    #[must_use]
    pub fn with_label_lag(self, lists: u32) -> Self {
        self.lock().label_lag = lists;
        self
    }

    /// Every delete fails with `error`
    #[must_use]
    pub fn with_delete_error(self, error: ClusterError) -> Self {
        self.lock().delete_error = Some(error);
        self
    }

    /// Every existence check fails with `error`
    #[must_use]
    pub fn with_exists_error(self, error: ClusterError) -> Self {
        self.lock().exists_error = Some(error);
        self
    }

    /// Every node listing fails with `error`
    #[must_use]
    pub fn with_list_error(self, error: ClusterError) -> Self {
        self.lock().list_error = Some(error);
        self
    }

    /// Is the workload present, terminating or not
    pub fn has_workload(&self, kind: WorkloadKind, namespace: &str, name: &str) -> bool {
        self.lock()
            .workloads
            .contains_key(&(kind, namespace.to_string(), name.to_string()))
    }

    /// Current nodes, ignoring pending label changes
    pub fn nodes(&self) -> Vec<NodeSnapshot> {
        self.lock().nodes.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.lock().list_calls
    }

    /// Set a label on one node right away
    pub fn label_node(&self, node: &str, key: &str, value: &str) {
        if let Some(n) = self.lock().nodes.iter_mut().find(|n| n.name == node) {
            n.labels.insert(key.to_string(), value.to_string());
        }
    }

    /// Schedule `key=value` on every node, subject to the label lag
    pub fn apply_label(&self, key: &str, value: &str) {
        let mut state = self.lock();
        let remaining = state.label_lag;
        state.pending.push(LabelChange {
            key: key.to_string(),
            value: Some(value.to_string()),
            remaining,
        });
    }

    /// Schedule removal of `key` from every node, subject to the label lag
    pub fn remove_label(&self, key: &str) {
        let mut state = self.lock();
        let remaining = state.label_lag;
        state.pending.push(LabelChange {
            key: key.to_string(),
            value: None,
            remaining,
        });
    }
}

impl ClusterState {
    fn advance_labels(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for mut change in pending {
            if change.remaining > 0 {
                change.remaining -= 1;
                self.pending.push(change);
                continue;
            }
            for node in &mut self.nodes {
                match &change.value {
                    Some(value) => {
                        node.labels.insert(change.key.clone(), value.clone());
                    }
                    None => {
                        node.labels.remove(&change.key);
                    }
                }
            }
        }
    }
}

/// Match a node against `key`, `key=value` and `key!=value` terms
fn selector_matches(node: &NodeSnapshot, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| {
            if let Some((key, value)) = term.split_once("!=") {
                node.labels.get(key).map(String::as_str) != Some(value)
            } else if let Some((key, value)) = term.split_once('=') {
                node.labels.get(key).map(String::as_str) == Some(value)
            } else {
                node.has_label(term)
            }
        })
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_nodes(&self, selector: Option<&str>) -> Result<Vec<NodeSnapshot>, ClusterError> {
        let mut state = self.lock();
        state.list_calls += 1;
        if let Some(err) = &state.list_error {
            return Err(err.clone());
        }
        state.advance_labels();

        Ok(state
            .nodes
            .iter()
            .filter(|n| selector.map_or(true, |s| selector_matches(n, s)))
            .cloned()
            .collect())
    }

    async fn delete_workload(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClusterError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if let Some(err) = &state.delete_error {
            return Err(err.clone());
        }

        let key = (kind, namespace.to_string(), name.to_string());
        let Some(terminating) = state.workloads.get_mut(&key) else {
            return Err(ClusterError::NotFound {
                kind: kind.to_string(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        };

        if state.deletion_lag == 0 {
            state.workloads.remove(&key);
        } else {
            terminating.get_or_insert(state.deletion_lag);
        }
        Ok(())
    }

    async fn workload_exists(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<bool, ClusterError> {
        let mut state = self.lock();
        if let Some(err) = &state.exists_error {
            return Err(err.clone());
        }
        let key = (kind, namespace.to_string(), name.to_string());

        let remaining = match state.workloads.get_mut(&key) {
            None => return Ok(false),
            Some(None) => return Ok(true),
            Some(Some(remaining)) => remaining,
        };
        if *remaining == 0 {
            state.workloads.remove(&key);
            return Ok(false);
        }
        *remaining -= 1;
        Ok(true)
    }

    async fn list_namespaces(&self) -> Result<Vec<String>, ClusterError> {
        Ok(vec!["default".to_string(), "kube-system".to_string()])
    }
}

#[derive(Debug, Default)]
struct ChartsState {
    installed: BTreeSet<String>,
    specs: Vec<ReleaseSpec>,
    uninstall_calls: usize,
}

/// Package manager that records releases in memory
#[derive(Debug, Default)]
pub struct FakeCharts {
    state: Mutex<ChartsState>,
    install_error: Option<String>,
    uninstall_error: Option<String>,
    list_error: Option<String>,
    install_delay: Option<Duration>,
    labeler: Option<(Arc<FakeCluster>, String)>,
}

impl FakeCharts {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ChartsState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Installs fail with `InstallFailed` carrying `reason`
    #[must_use]
    pub fn failing_install(mut self, reason: &str) -> Self {
        self.install_error = Some(reason.to_string());
        self
    }

    #[must_use]
    pub fn failing_uninstall(mut self, reason: &str) -> Self {
        self.uninstall_error = Some(reason.to_string());
        self
    }

    #[must_use]
    pub fn failing_list(mut self, reason: &str) -> Self {
        self.list_error = Some(reason.to_string());
        self
    }

    /// Sleep before recording an install
    #[must_use]
    pub fn install_delay(mut self, delay: Duration) -> Self {
        self.install_delay = Some(delay);
        self
    }

    /// Pretend a release already exists
    #[must_use]
    pub fn with_release(self, name: &str) -> Self {
        self.lock().installed.insert(name.to_string());
        self
    }

    /// Installing labels every node of `cluster` with `key`; uninstalling removes it
    #[must_use]
    pub fn labels_nodes(mut self, cluster: Arc<FakeCluster>, key: &str) -> Self {
        self.labeler = Some((cluster, key.to_string()));
        self
    }

    /// Names of installed releases, sorted
    pub fn installed(&self) -> Vec<String> {
        self.lock().installed.iter().cloned().collect()
    }

    /// Every spec passed to `install`, in order
    pub fn install_specs(&self) -> Vec<ReleaseSpec> {
        self.lock().specs.clone()
    }

    pub fn uninstall_calls(&self) -> usize {
        self.lock().uninstall_calls
    }
}

#[async_trait]
impl PackageManager for FakeCharts {
    async fn install(&self, spec: &ReleaseSpec) -> Result<Release, HelmError> {
        if let Some(delay) = self.install_delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        state.specs.push(spec.clone());

        if let Some(reason) = &self.install_error {
            return Err(HelmError::InstallFailed {
                release: spec.release_name.clone(),
                reason: reason.clone(),
            });
        }
        if !state.installed.insert(spec.release_name.clone()) {
            return Err(HelmError::InstallFailed {
                release: spec.release_name.clone(),
                reason: "cannot re-use a name that is still in use".to_string(),
            });
        }
        drop(state);

        if let Some((cluster, key)) = &self.labeler {
            cluster.apply_label(key, "1");
        }

        let mut release = spec.to_release();
        release.revision = Some(1);
        Ok(release)
    }

    async fn uninstall(&self, release: &Release) -> Result<(), HelmError> {
        let mut state = self.lock();
        state.uninstall_calls += 1;

        if let Some(reason) = &self.uninstall_error {
            return Err(HelmError::UninstallFailed {
                release: release.name.clone(),
                reason: reason.clone(),
            });
        }
        if !state.installed.remove(&release.name) {
            return Err(HelmError::ReleaseNotFound(release.name.clone()));
        }
        drop(state);

        if let Some((cluster, key)) = &self.labeler {
            cluster.remove_label(key);
        }
        Ok(())
    }

    async fn list_releases(&self, _namespace: &str) -> Result<Vec<String>, HelmError> {
        if let Some(reason) = &self.list_error {
            return Err(HelmError::CommandFailed(reason.clone()));
        }
        Ok(self.installed())
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "vendor.example/npu.count";

    #[test]
    fn test_selector_terms() {
        let node = NodeSnapshot::new("a")
            .with_label("role", "worker")
            .with_label("npu", "true");

        assert!(selector_matches(&node, "role=worker"));
        assert!(selector_matches(&node, "role=worker,npu"));
        assert!(selector_matches(&node, "role!=cp"));
        assert!(!selector_matches(&node, "role=cp"));
        assert!(!selector_matches(&node, "gpu"));
        assert!(selector_matches(&node, ""));
    }

    #[tokio::test]
    async fn test_label_lag_delays_visibility() {
        let cluster = FakeCluster::new()
            .with_nodes(vec![NodeSnapshot::new("a")])
            .with_label_lag(2);
        cluster.apply_label(KEY, "1");

        assert!(!cluster.list_nodes(None).await.unwrap()[0].has_label(KEY));
        assert!(!cluster.list_nodes(None).await.unwrap()[0].has_label(KEY));
        assert!(cluster.list_nodes(None).await.unwrap()[0].has_label(KEY));
        assert_eq!(cluster.list_calls(), 3);
    }

    #[tokio::test]
    async fn test_linked_charts_label_and_unlabel() {
        let cluster = Arc::new(FakeCluster::new().with_nodes(vec![NodeSnapshot::new("a")]));
        let charts = FakeCharts::new().labels_nodes(cluster.clone(), KEY);

        let release = charts
            .install(&ReleaseSpec::new("disc-1", "/charts/fd", "default"))
            .await
            .unwrap();
        assert_eq!(release.revision, Some(1));
        assert!(cluster.list_nodes(None).await.unwrap()[0].has_label(KEY));

        charts.uninstall(&release).await.unwrap();
        assert!(!cluster.list_nodes(None).await.unwrap()[0].has_label(KEY));
    }

    #[tokio::test]
    async fn test_uninstall_unknown_release() {
        let charts = FakeCharts::new();
        let release = ReleaseSpec::new("ghost", "/charts/fd", "default").to_release();

        let err = charts.uninstall(&release).await.unwrap_err();
        assert!(matches!(err, HelmError::ReleaseNotFound(_)));
        assert_eq!(charts.uninstall_calls(), 1);
    }
}
