//! Removal of stale workloads before deploying
//!
//! A previous run that crashed mid-way can leave the daemon running, which
//! would make the precondition meaningless. The cleaner deletes such
//! workloads by name and treats "already gone" as success.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::info;

use crate::cluster::{ClusterApi, ClusterError, WorkloadKind};
use crate::eventually::eventually;

/// What a delete call found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The workload existed and was deleted
    Removed,
    /// Nothing to delete
    AlreadyAbsent,
}

impl fmt::Display for Removal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Removed => f.write_str("removed"),
            Self::AlreadyAbsent => f.write_str("already absent"),
        }
    }
}

/// Error type for cleanup operations
#[derive(Debug, thiserror::Error)]
pub enum CleanupError {
    #[error("failed to delete {kind} {namespace}/{name}: {source}")]
    Delete {
        kind: WorkloadKind,
        namespace: String,
        name: String,
        #[source]
        source: ClusterError,
    },

    #[error("failed to check {kind} {namespace}/{name} after delete: {source}")]
    Check {
        kind: WorkloadKind,
        namespace: String,
        name: String,
        #[source]
        source: ClusterError,
    },

    #[error("{kind} {namespace}/{name} still present {waited:?} after delete")]
    StillPresent {
        kind: WorkloadKind,
        namespace: String,
        name: String,
        waited: Duration,
    },
}

/// Deletes named workloads, tolerating absence
#[derive(Clone)]
pub struct ResourceCleaner {
    api: Arc<dyn ClusterApi>,
}

impl ResourceCleaner {
    #[must_use]
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self { api }
    }

    /// Delete a workload if it exists
    ///
    /// Not-found is success. Any other error is returned: the cluster is in
    /// an unknown state and the scenario should not continue.
    pub async fn delete_if_exists(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Removal, CleanupError> {
        match self.api.delete_workload(kind, namespace, name).await {
            Ok(()) => {
                info!(kind = %kind, namespace = %namespace, name = %name, "Stale workload deleted");
                Ok(Removal::Removed)
            }
            Err(e) if e.is_not_found() => {
                info!(kind = %kind, namespace = %namespace, name = %name, "No stale workload to delete");
                Ok(Removal::AlreadyAbsent)
            }
            Err(source) => Err(CleanupError::Delete {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
                source,
            }),
        }
    }

    /// Delete a workload and wait until the API no longer returns it
    pub async fn ensure_absent(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<Removal, CleanupError> {
        let removal = self.delete_if_exists(kind, namespace, name).await?;
        if removal == Removal::AlreadyAbsent {
            return Ok(removal);
        }

        // Only "still there" is retried; a failed lookup ends the wait
        let slot = Mutex::new(None);
        let check_error = &slot;
        let api = &self.api;
        let waited = eventually(move || async move {
            match api.workload_exists(kind, namespace, name).await {
                Ok(false) => Ok(()),
                Ok(true) => Err("still present"),
                Err(e) => {
                    *check_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(e);
                    Ok(())
                }
            }
        })
        .timeout(timeout)
        .interval(Duration::from_millis(500))
        .max_interval(Duration::from_secs(5))
        .await_condition()
        .await;

        if let Some(source) = slot.into_inner().unwrap_or_else(PoisonError::into_inner) {
            return Err(CleanupError::Check {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
                source,
            });
        }

        waited.map_err(|_| CleanupError::StillPresent {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
            waited: timeout,
        })?;

        Ok(removal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCluster;

    #[tokio::test]
    async fn test_delete_existing_workload() {
        let cluster = Arc::new(FakeCluster::new().with_workload(
            WorkloadKind::DaemonSet,
            "default",
            "feature-discovery",
        ));
        let cleaner = ResourceCleaner::new(cluster.clone());

        let removal = cleaner
            .delete_if_exists(WorkloadKind::DaemonSet, "default", "feature-discovery")
            .await
            .unwrap();

        assert_eq!(removal, Removal::Removed);
        assert!(!cluster.has_workload(WorkloadKind::DaemonSet, "default", "feature-discovery"));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let cluster = Arc::new(FakeCluster::new().with_workload(
            WorkloadKind::DaemonSet,
            "default",
            "feature-discovery",
        ));
        let cleaner = ResourceCleaner::new(cluster);

        let first = cleaner
            .delete_if_exists(WorkloadKind::DaemonSet, "default", "feature-discovery")
            .await
            .unwrap();
        let second = cleaner
            .delete_if_exists(WorkloadKind::DaemonSet, "default", "feature-discovery")
            .await
            .unwrap();

        assert_eq!(first, Removal::Removed);
        assert_eq!(second, Removal::AlreadyAbsent);
    }

    #[tokio::test]
    async fn test_kind_and_namespace_must_match() {
        let cluster = Arc::new(FakeCluster::new().with_workload(
            WorkloadKind::Deployment,
            "default",
            "feature-discovery",
        ));
        let cleaner = ResourceCleaner::new(cluster.clone());

        let removal = cleaner
            .delete_if_exists(WorkloadKind::DaemonSet, "default", "feature-discovery")
            .await
            .unwrap();
        assert_eq!(removal, Removal::AlreadyAbsent);

        let removal = cleaner
            .delete_if_exists(WorkloadKind::Deployment, "other", "feature-discovery")
            .await
            .unwrap();
        assert_eq!(removal, Removal::AlreadyAbsent);
        assert!(cluster.has_workload(WorkloadKind::Deployment, "default", "feature-discovery"));
    }

    #[tokio::test]
    async fn test_other_errors_are_surfaced() {
        let cluster = Arc::new(
            FakeCluster::new()
                .with_delete_error(ClusterError::Forbidden("daemonsets is forbidden".to_string())),
        );
        let cleaner = ResourceCleaner::new(cluster);

        let err = cleaner
            .delete_if_exists(WorkloadKind::DaemonSet, "default", "feature-discovery")
            .await
            .unwrap_err();

        match err {
            CleanupError::Delete { name, source, .. } => {
                assert_eq!(name, "feature-discovery");
                assert!(matches!(source, ClusterError::Forbidden(_)));
            }
            other => panic!("expected Delete error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_absent_waits_for_finalization() {
        let cluster = Arc::new(
            FakeCluster::new()
                .with_workload(WorkloadKind::DaemonSet, "default", "feature-discovery")
                .with_deletion_lag(2),
        );
        let cleaner = ResourceCleaner::new(cluster.clone());

        let removal = cleaner
            .ensure_absent(
                WorkloadKind::DaemonSet,
                "default",
                "feature-discovery",
                Duration::from_secs(30),
            )
            .await
            .unwrap();

        assert_eq!(removal, Removal::Removed);
        assert!(!cluster.has_workload(WorkloadKind::DaemonSet, "default", "feature-discovery"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_absent_reports_lingering_workload() {
        let cluster = Arc::new(
            FakeCluster::new()
                .with_workload(WorkloadKind::DaemonSet, "default", "feature-discovery")
                .with_deletion_lag(u32::MAX),
        );
        let cleaner = ResourceCleaner::new(cluster);

        let err = cleaner
            .ensure_absent(
                WorkloadKind::DaemonSet,
                "default",
                "feature-discovery",
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CleanupError::StillPresent { .. }));
        assert!(err.to_string().contains("still present"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_absent_surfaces_failed_check() {
        let cluster = Arc::new(
            FakeCluster::new()
                .with_workload(WorkloadKind::DaemonSet, "default", "feature-discovery")
                .with_deletion_lag(u32::MAX)
                .with_exists_error(ClusterError::Forbidden("daemonsets is forbidden".to_string())),
        );
        let cleaner = ResourceCleaner::new(cluster);

        let start = tokio::time::Instant::now();
        let err = cleaner
            .ensure_absent(
                WorkloadKind::DaemonSet,
                "default",
                "feature-discovery",
                Duration::from_secs(60),
            )
            .await
            .unwrap_err();

        match err {
            CleanupError::Check { name, source, .. } => {
                assert_eq!(name, "feature-discovery");
                assert!(matches!(source, ClusterError::Forbidden(_)));
            }
            other => panic!("expected Check error, got {other:?}"),
        }
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_removal_display() {
        assert_eq!(Removal::Removed.to_string(), "removed");
        assert_eq!(Removal::AlreadyAbsent.to_string(), "already absent");
    }
}
