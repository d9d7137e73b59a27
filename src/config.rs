//! Configuration types for the discovery scenario
//!
//! Everything is built programmatically. The binary maps CLI flags onto these
//! builders; environment variables only override the image coordinates.
//!
//! # Example
//!
//! ```
//! use discovery_e2e::config::{ClusterConfig, ImageConfig, ScenarioConfig};
//! use std::time::Duration;
//!
//! let cluster = ClusterConfig::new()
//!     .kubeconfig("/tmp/kubeconfig")
//!     .namespace("default");
//!
//! let scenario = ScenarioConfig::new("./deployments/helm")
//!     .release_prefix("disc")
//!     .label_key("vendor.example/npu.count")
//!     .image(ImageConfig::default().tag("v0.3.0"))
//!     .install_timeout(Duration::from_secs(300));
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::cluster::WorkloadKind;
use crate::wait::WaitPolicy;

/// Kubeconfig location relative to the user's home directory
pub const DEFAULT_KUBECONFIG_PATH: &str = ".kube/config";

/// Label the discovery daemon publishes on every node with a detected device
pub const DEFAULT_LABEL_KEY: &str = "vendor.example/npu.count";

pub const DEFAULT_IMAGE_REGISTRY: &str = "registry.example.com/vendor";
pub const DEFAULT_IMAGE_NAME: &str = "feature-discovery";
pub const DEFAULT_IMAGE_TAG: &str = "latest";

pub const ENV_IMAGE_REGISTRY: &str = "E2E_IMAGE_REGISTRY";
pub const ENV_IMAGE_NAME: &str = "E2E_IMAGE_NAME";
pub const ENV_IMAGE_TAG: &str = "E2E_IMAGE_TAG";

/// Helm refuses release names longer than this
pub const MAX_RELEASE_NAME_LEN: usize = 53;

/// Error type for configuration problems
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot locate kubeconfig: HOME is not set and no path was given")]
    HomeNotFound,

    #[error("invalid release prefix '{0}': use lowercase letters, digits and '-'")]
    InvalidReleasePrefix(String),

    #[error("failed to render chart values: {0}")]
    Values(String),
}

/// Connection settings for the target cluster
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Kubeconfig path; `$KUBECONFIG` and then `~/.kube/config` when unset
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to select
    pub context: Option<String>,

    /// Namespace the chart is installed into
    pub namespace: String,

    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            context: None,
            namespace: "default".to_string(),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
        }
    }
}

impl ClusterConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set kubeconfig path
    #[must_use]
    pub fn kubeconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig = Some(path.into());
        self
    }

    /// Set kubeconfig context
    #[must_use]
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Set target namespace
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Resolve the kubeconfig file to read
    ///
    /// Order: explicit path, first entry of `$KUBECONFIG`, `$HOME/.kube/config`.
    pub fn resolve_kubeconfig(&self) -> Result<PathBuf, ConfigError> {
        resolve_kubeconfig_with(self.kubeconfig.as_deref(), |key| std::env::var(key).ok())
    }
}

fn resolve_kubeconfig_with(
    explicit: Option<&Path>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    if let Some(paths) = lookup("KUBECONFIG") {
        if let Some(first) = std::env::split_paths(&paths).find(|p| !p.as_os_str().is_empty()) {
            return Ok(first);
        }
    }

    let home = lookup("HOME").ok_or(ConfigError::HomeNotFound)?;
    Ok(Path::new(&home).join(DEFAULT_KUBECONFIG_PATH))
}

/// Image coordinates of the daemon under test
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageConfig {
    pub registry: String,
    pub name: String,
    pub tag: String,
    pub pull_policy: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            registry: DEFAULT_IMAGE_REGISTRY.to_string(),
            name: DEFAULT_IMAGE_NAME.to_string(),
            tag: DEFAULT_IMAGE_TAG.to_string(),
            pull_policy: "Always".to_string(),
        }
    }
}

impl ImageConfig {
    /// Defaults overridden by `E2E_IMAGE_REGISTRY`, `E2E_IMAGE_NAME`, `E2E_IMAGE_TAG`
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ImageConfig::from_env`] with an injectable variable source
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let pick = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        Self {
            registry: pick(ENV_IMAGE_REGISTRY, DEFAULT_IMAGE_REGISTRY),
            name: pick(ENV_IMAGE_NAME, DEFAULT_IMAGE_NAME),
            tag: pick(ENV_IMAGE_TAG, DEFAULT_IMAGE_TAG),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn registry(mut self, registry: impl Into<String>) -> Self {
        self.registry = registry.into();
        self
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Repository without the tag, e.g. `registry.example.com/vendor/feature-discovery`
    #[must_use]
    pub fn repository(&self) -> String {
        format!("{}/{}", self.registry.trim_end_matches('/'), self.name)
    }

    /// Full image reference
    #[must_use]
    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository(), self.tag)
    }
}

/// A workload left over from an earlier run that must be gone before installing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleWorkload {
    pub kind: WorkloadKind,
    pub name: String,
    /// Defaults to the cluster namespace when unset
    pub namespace: Option<String>,
}

impl StaleWorkload {
    #[must_use]
    pub fn daemon_set(name: impl Into<String>) -> Self {
        Self {
            kind: WorkloadKind::DaemonSet,
            name: name.into(),
            namespace: None,
        }
    }

    #[must_use]
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

/// Everything the discovery scenario needs besides the cluster connection
#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    /// Scenario name used in logs and the report
    pub name: String,

    /// Local chart directory or archive
    pub chart: PathBuf,

    /// Release names are `<prefix>-<random>`
    pub release_prefix: String,

    /// Label that must appear on every node after install
    pub label_key: String,

    /// Restrict verification to nodes matching this label selector
    pub node_selector: Option<String>,

    pub image: ImageConfig,

    /// Block the install call on workload readiness
    pub install_wait: bool,

    pub install_timeout: Duration,

    /// How to wait for label propagation after install (and removal after uninstall)
    pub wait: WaitPolicy,

    /// Optional pause before the precondition check
    pub settle: Option<Duration>,

    /// Workloads to delete before installing
    pub stale_workloads: Vec<StaleWorkload>,

    /// How long a deleted stale workload may take to disappear
    pub cleanup_timeout: Duration,

    /// Extra `--set key=value` overrides
    pub set_values: Vec<(String, String)>,

    /// Also verify the label disappears once the release is uninstalled
    pub check_label_removal: bool,
}

impl ScenarioConfig {
    /// Create a config for the chart at `chart` with defaults for everything else
    #[must_use]
    pub fn new(chart: impl Into<PathBuf>) -> Self {
        Self {
            name: "feature discovery".to_string(),
            chart: chart.into(),
            release_prefix: "disc".to_string(),
            label_key: DEFAULT_LABEL_KEY.to_string(),
            node_selector: None,
            image: ImageConfig::default(),
            install_wait: false,
            install_timeout: Duration::from_secs(300),
            wait: WaitPolicy::default(),
            settle: None,
            stale_workloads: vec![
                StaleWorkload::daemon_set(DEFAULT_IMAGE_NAME),
                StaleWorkload::daemon_set(format!(
                    "{DEFAULT_IMAGE_NAME}-node-feature-discovery-worker"
                )),
            ],
            cleanup_timeout: Duration::from_secs(60),
            set_values: Vec::new(),
            check_label_removal: false,
        }
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn release_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.release_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn label_key(mut self, key: impl Into<String>) -> Self {
        self.label_key = key.into();
        self
    }

    #[must_use]
    pub fn node_selector(mut self, selector: impl Into<String>) -> Self {
        self.node_selector = Some(selector.into());
        self
    }

    #[must_use]
    pub fn image(mut self, image: ImageConfig) -> Self {
        self.image = image;
        self
    }

    #[must_use]
    pub fn install_wait(mut self, wait: bool) -> Self {
        self.install_wait = wait;
        self
    }

    #[must_use]
    pub fn install_timeout(mut self, timeout: Duration) -> Self {
        self.install_timeout = timeout;
        self
    }

    #[must_use]
    pub fn wait(mut self, policy: WaitPolicy) -> Self {
        self.wait = policy;
        self
    }

    #[must_use]
    pub fn settle(mut self, pause: Duration) -> Self {
        self.settle = Some(pause);
        self
    }

    /// Replace the list of stale workloads
    #[must_use]
    pub fn stale_workloads(mut self, workloads: impl IntoIterator<Item = StaleWorkload>) -> Self {
        self.stale_workloads = workloads.into_iter().collect();
        self
    }

    #[must_use]
    pub fn cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    #[must_use]
    pub fn set_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_values.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn check_label_removal(mut self, enabled: bool) -> Self {
        self.check_label_removal = enabled;
        self
    }

    /// Reject prefixes that can never yield a valid release name
    pub fn validate(&self) -> Result<(), ConfigError> {
        let prefix = &self.release_prefix;
        let valid = !prefix.is_empty()
            && prefix.len() < MAX_RELEASE_NAME_LEN - 8
            && prefix.starts_with(|c: char| c.is_ascii_lowercase())
            && prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');

        if valid {
            Ok(())
        } else {
            Err(ConfigError::InvalidReleasePrefix(prefix.clone()))
        }
    }

    /// Render the chart values for `namespace`
    pub fn values_yaml(&self, namespace: &str) -> Result<String, ConfigError> {
        let values = ChartValues {
            namespace: namespace.to_string(),
            daemon_set: DaemonSetValues {
                priority_class_name: "system-node-critical".to_string(),
                update_strategy: UpdateStrategy {
                    kind: "RollingUpdate".to_string(),
                    rolling_update: RollingUpdate { max_unavailable: 1 },
                },
                tolerations: vec![Toleration {
                    key: "npu".to_string(),
                    operator: "Exists".to_string(),
                }],
                image: ImageValues {
                    repository: self.image.repository(),
                    tag: self.image.tag.clone(),
                    pull_policy: self.image.pull_policy.clone(),
                },
                resources: Resources {
                    cpu: "100m".to_string(),
                    memory: "64Mi".to_string(),
                },
            },
        };

        serde_yaml::to_string(&values).map_err(|e| ConfigError::Values(e.to_string()))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChartValues {
    namespace: String,
    daemon_set: DaemonSetValues,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DaemonSetValues {
    priority_class_name: String,
    update_strategy: UpdateStrategy,
    tolerations: Vec<Toleration>,
    image: ImageValues,
    resources: Resources,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateStrategy {
    #[serde(rename = "type")]
    kind: String,
    rolling_update: RollingUpdate,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RollingUpdate {
    max_unavailable: u32,
}

#[derive(Debug, Serialize)]
struct Toleration {
    key: String,
    operator: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageValues {
    repository: String,
    tag: String,
    pull_policy: String,
}

#[derive(Debug, Serialize)]
struct Resources {
    cpu: String,
    memory: String,
}
