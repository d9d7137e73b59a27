//! Package manager capability
//!
//! The scenario only needs three things from Helm: install a release, uninstall
//! it, and list what is already installed so a fresh release name can be
//! picked. [`HelmCli`] drives the `helm` binary; tests use an in-memory fake.

mod cli;

pub use cli::HelmCli;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

/// Error type for package manager operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum HelmError {
    #[error("chart not found: {0}")]
    ChartNotFound(String),

    #[error("install of release '{release}' failed: {reason}")]
    InstallFailed { release: String, reason: String },

    #[error("release '{release}' did not become ready within {timeout:?}")]
    Timeout { release: String, timeout: Duration },

    #[error("uninstall of release '{release}' failed: {reason}")]
    UninstallFailed { release: String, reason: String },

    #[error("release '{0}' not found")]
    ReleaseNotFound(String),

    #[error("failed to write values file: {0}")]
    Values(String),

    #[error("helm command failed: {0}")]
    CommandFailed(String),
}

/// Everything needed to install one release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseSpec {
    pub release_name: String,
    /// Local chart directory or archive
    pub chart: PathBuf,
    pub namespace: String,
    pub create_namespace: bool,
    /// Block until the chart's workloads are ready
    pub wait: bool,
    pub timeout: Duration,
    /// Remove whatever a failed install left behind
    pub cleanup_on_fail: bool,
    /// Values document (YAML)
    pub values: String,
    /// `--set key=value` overrides applied after `values`
    pub set_values: Vec<(String, String)>,
}

impl ReleaseSpec {
    #[must_use]
    pub fn new(
        release_name: impl Into<String>,
        chart: impl Into<PathBuf>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            release_name: release_name.into(),
            chart: chart.into(),
            namespace: namespace.into(),
            create_namespace: false,
            wait: false,
            timeout: Duration::from_secs(300),
            cleanup_on_fail: false,
            values: String::new(),
            set_values: Vec::new(),
        }
    }

    #[must_use]
    pub fn create_namespace(mut self, create: bool) -> Self {
        self.create_namespace = create;
        self
    }

    #[must_use]
    pub fn wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn cleanup_on_fail(mut self, cleanup: bool) -> Self {
        self.cleanup_on_fail = cleanup;
        self
    }

    #[must_use]
    pub fn values(mut self, values: impl Into<String>) -> Self {
        self.values = values.into();
        self
    }

    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_values.push((key.into(), value.into()));
        self
    }

    /// Release this spec will produce, before the install has happened
    #[must_use]
    pub fn to_release(&self) -> Release {
        Release {
            name: self.release_name.clone(),
            namespace: self.namespace.clone(),
            chart: self.chart.clone(),
            revision: None,
            timeout: self.timeout,
        }
    }
}

/// One installed chart instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub name: String,
    pub namespace: String,
    pub chart: PathBuf,
    /// Revision reported by the package manager, if any
    pub revision: Option<u32>,
    /// Timeout reused for the uninstall call
    pub timeout: Duration,
}

/// Install/uninstall capability of a package manager
#[async_trait]
pub trait PackageManager: Send + Sync {
    /// Install a release
    async fn install(&self, spec: &ReleaseSpec) -> Result<Release, HelmError>;

    /// Uninstall a release
    async fn uninstall(&self, release: &Release) -> Result<(), HelmError>;

    /// Names of the releases currently installed in `namespace`
    async fn list_releases(&self, namespace: &str) -> Result<Vec<String>, HelmError>;

    /// Name for display
    fn name(&self) -> &'static str;
}
