//! Node label verification
//!
//! Every matched node must agree with the expectation. A partial rollout at
//! verification time is a defect in the daemon, not a transient state: the
//! wait before this check has already absorbed normal propagation delay.
//!
//! # Example
//!
//! ```ignore
//! let verifier = ConditionVerifier::new(handle.api().clone());
//! verifier
//!     .assert_label_on_all_nodes(&LabelExpectation::present("vendor.example/npu.count"))
//!     .await?;
//! ```

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::cluster::{ClusterApi, ClusterError, NodeSnapshot};

/// Whether a label key should be present on a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelExpectation {
    pub key: String,
    pub present: bool,
}

impl LabelExpectation {
    #[must_use]
    pub fn present(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            present: true,
        }
    }

    #[must_use]
    pub fn absent(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            present: false,
        }
    }

    /// Does `node` satisfy the expectation
    #[must_use]
    pub fn matches(&self, node: &NodeSnapshot) -> bool {
        node.has_label(&self.key) == self.present
    }
}

impl fmt::Display for LabelExpectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.present { "present" } else { "absent" };
        write!(f, "label '{}' {state}", self.key)
    }
}

/// Error type for label verification
#[derive(Debug, Clone, thiserror::Error)]
pub enum VerifyError {
    #[error("no nodes matched{}", selector_suffix(.selector.as_deref()))]
    NoNodes { selector: Option<String> },

    #[error("node '{node}': label '{key}' present={observed}, expected present={expected} ({matching}/{total} nodes agree)")]
    Mismatch {
        node: String,
        key: String,
        observed: bool,
        expected: bool,
        matching: usize,
        total: usize,
    },

    #[error("failed to list nodes: {0}")]
    Cluster(#[from] ClusterError),
}

fn selector_suffix(selector: Option<&str>) -> String {
    selector.map_or_else(String::new, |s| format!(" selector '{s}'"))
}

/// Check `expectation` against every node
///
/// Zero nodes always fails, whatever the expectation.
pub fn check_nodes(
    nodes: &[NodeSnapshot],
    expectation: &LabelExpectation,
    selector: Option<&str>,
) -> Result<(), VerifyError> {
    if nodes.is_empty() {
        return Err(VerifyError::NoNodes {
            selector: selector.map(str::to_string),
        });
    }

    let matching = nodes.iter().filter(|n| expectation.matches(n)).count();

    match nodes.iter().find(|n| !expectation.matches(n)) {
        None => Ok(()),
        Some(node) => Err(VerifyError::Mismatch {
            node: node.name.clone(),
            key: expectation.key.clone(),
            observed: node.has_label(&expectation.key),
            expected: expectation.present,
            matching,
            total: nodes.len(),
        }),
    }
}

/// Reads node metadata and asserts label state across matched nodes
#[derive(Clone)]
pub struct ConditionVerifier {
    api: Arc<dyn ClusterApi>,
    selector: Option<String>,
}

impl ConditionVerifier {
    #[must_use]
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self {
            api,
            selector: None,
        }
    }

    /// Only verify nodes matching this label selector
    #[must_use]
    pub fn with_selector(mut self, selector: Option<String>) -> Self {
        self.selector = selector;
        self
    }

    /// List matched nodes and check every one of them
    pub async fn assert_label_on_all_nodes(
        &self,
        expectation: &LabelExpectation,
    ) -> Result<(), VerifyError> {
        let nodes = self.api.list_nodes(self.selector.as_deref()).await?;
        debug!(nodes = nodes.len(), expectation = %expectation, "Checking node labels");

        check_nodes(&nodes, expectation, self.selector.as_deref())?;

        info!(nodes = nodes.len(), expectation = %expectation, "All nodes agree");
        Ok(())
    }
}
