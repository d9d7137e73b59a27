//! Install and uninstall of the chart under test
//!
//! [`DeploymentManager`] owns at most one release at a time and tracks it
//! through `Absent -> Installing -> Active -> Uninstalling -> Absent`.
//! A release whose install was interrupted stays recorded so that teardown
//! can still try to remove it.

use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::MAX_RELEASE_NAME_LEN;
use crate::helm::{HelmError, PackageManager, Release, ReleaseSpec};

/// Attempts at finding a release name not already in use
const NAME_ATTEMPTS: usize = 5;

/// Lifecycle of the managed release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseState {
    Absent,
    Installing,
    Active,
    Uninstalling,
}

impl fmt::Display for ReleaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Absent => "absent",
            Self::Installing => "installing",
            Self::Active => "active",
            Self::Uninstalling => "uninstalling",
        };
        f.write_str(s)
    }
}

/// Error type for deployment operations
#[derive(Debug, thiserror::Error)]
pub enum DeploymentError {
    #[error("release '{name}' is {state}; uninstall it before installing another")]
    ReleaseActive { name: String, state: ReleaseState },

    #[error("no unused release name for prefix '{prefix}' after {attempts} attempts")]
    NameExhausted { prefix: String, attempts: usize },

    #[error(transparent)]
    Install(HelmError),

    #[error(transparent)]
    Uninstall(HelmError),

    #[error("failed to list releases: {0}")]
    List(HelmError),
}

/// Random DNS-safe release name, e.g. `disc-3f9c2a1b`
#[must_use]
pub fn release_name(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    let prefix: String = prefix.chars().take(MAX_RELEASE_NAME_LEN - 9).collect();
    format!("{}-{}", prefix.trim_end_matches('-'), &id[..8])
}

/// Produces a candidate release name for a prefix
pub type NameSource = Box<dyn Fn(&str) -> String + Send + Sync>;

/// Wraps install/uninstall of a single release
pub struct DeploymentManager {
    charts: Arc<dyn PackageManager>,
    names: NameSource,
    state: ReleaseState,
    release: Option<Release>,
}

impl DeploymentManager {
    #[must_use]
    pub fn new(charts: Arc<dyn PackageManager>) -> Self {
        Self {
            charts,
            names: Box::new(release_name),
            state: ReleaseState::Absent,
            release: None,
        }
    }

    /// Replace the random `<prefix>-<suffix>` generator
    #[must_use]
    pub fn with_name_source(
        mut self,
        names: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Self {
        self.names = Box::new(names);
        self
    }

    #[must_use]
    pub fn state(&self) -> ReleaseState {
        self.state
    }

    /// The active release, if any
    #[must_use]
    pub fn active(&self) -> Option<&Release> {
        match self.state {
            ReleaseState::Active => self.release.as_ref(),
            _ => None,
        }
    }

    /// Pick a release name with `prefix` that is not installed in `namespace`
    ///
    /// Collisions are unlikely with a random suffix; this only guards
    /// against reruns in a namespace nobody cleaned up.
    pub async fn unique_release_name(
        &self,
        prefix: &str,
        namespace: &str,
    ) -> Result<String, DeploymentError> {
        let existing = self
            .charts
            .list_releases(namespace)
            .await
            .map_err(DeploymentError::List)?;

        for _ in 0..NAME_ATTEMPTS {
            let candidate = (self.names)(prefix);
            if !existing.contains(&candidate) {
                return Ok(candidate);
            }
            warn!(release = %candidate, "Release name already taken, picking another");
        }

        Err(DeploymentError::NameExhausted {
            prefix: prefix.to_string(),
            attempts: NAME_ATTEMPTS,
        })
    }

    /// Install a release
    ///
    /// Refused while another release is recorded. On failure the manager
    /// returns to `Absent`.
    pub async fn install(&mut self, spec: ReleaseSpec) -> Result<Release, DeploymentError> {
        if let (Some(release), state) = (&self.release, self.state) {
            return Err(DeploymentError::ReleaseActive {
                name: release.name.clone(),
                state,
            });
        }

        self.state = ReleaseState::Installing;
        self.release = Some(spec.to_release());

        match self.charts.install(&spec).await {
            Ok(release) => {
                info!(release = %release.name, namespace = %release.namespace, wait = spec.wait, "Release active");
                self.state = ReleaseState::Active;
                self.release = Some(release.clone());
                Ok(release)
            }
            Err(e) => {
                self.state = ReleaseState::Absent;
                self.release = None;
                Err(DeploymentError::Install(e))
            }
        }
    }

    /// Uninstall the recorded release
    ///
    /// Returns `Ok(None)` when there is nothing to remove. A failed uninstall
    /// keeps the release recorded as active. A release whose install never
    /// completed is dropped if the package manager does not know it.
    pub async fn uninstall(&mut self) -> Result<Option<Release>, DeploymentError> {
        let Some(release) = self.release.clone() else {
            return Ok(None);
        };
        let interrupted = self.state == ReleaseState::Installing;

        self.state = ReleaseState::Uninstalling;

        match self.charts.uninstall(&release).await {
            Ok(()) => {
                info!(release = %release.name, "Release removed");
                self.state = ReleaseState::Absent;
                self.release = None;
                Ok(Some(release))
            }
            Err(HelmError::ReleaseNotFound(_)) if interrupted => {
                info!(release = %release.name, "Interrupted install left no release behind");
                self.state = ReleaseState::Absent;
                self.release = None;
                Ok(None)
            }
            Err(e) => {
                self.state = ReleaseState::Active;
                Err(DeploymentError::Uninstall(e))
            }
        }
    }
}

impl fmt::Debug for DeploymentManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentManager")
            .field("state", &self.state)
            .field("release", &self.release.as_ref().map(|r| &r.name))
            .finish_non_exhaustive()
    }
}
