//! discovery-e2e - acceptance scenario for node feature discovery
//!
//! Deploys a device-discovery Helm chart into a live cluster and checks that
//! every node ends up carrying the discovery label, then removes it again.
//! The cluster API and the package manager sit behind traits so the whole
//! scenario also runs against the in-memory fakes in [`testing`].
//!
//! # Example
//!
//! ```no_run
//! use discovery_e2e::{discovery_scenario, ClusterConfig, ClusterHandle, ScenarioConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let handle = ClusterHandle::connect(&ClusterConfig::new()).await?;
//!     let scenario = discovery_scenario(&handle, &ScenarioConfig::new("charts/feature-discovery"))?;
//!
//!     let report = scenario.run(&CancellationToken::new()).await;
//!     println!("{report}");
//!     std::process::exit(i32::from(report.outcome().exit_code()));
//! }
//! ```
//!
//! # CLI Usage
//!
//! ```bash
//! # Default fixed 120s wait
//! discovery-e2e --chart ./charts/feature-discovery
//!
//! # Poll instead, and check the label goes away after uninstall
//! discovery-e2e --chart ./charts/feature-discovery --poll --check-label-removal
//! ```

pub mod cleanup;
pub mod cluster;
pub mod config;
pub mod deploy;
pub mod discovery;
pub mod eventually;
pub mod helm;
pub mod report;
pub mod scenario;
pub mod telemetry;
pub mod testing;
pub mod verify;
pub mod wait;

// Re-export commonly used types
pub use cleanup::{CleanupError, Removal, ResourceCleaner};
pub use cluster::{ClusterApi, ClusterError, ClusterHandle, ConnectivityError, NodeSnapshot, WorkloadKind};
pub use config::{ClusterConfig, ConfigError, ImageConfig, ScenarioConfig, StaleWorkload};
pub use deploy::{DeploymentError, DeploymentManager, ReleaseState};
pub use discovery::discovery_scenario;
pub use eventually::{eventually, ConditionError};
pub use helm::{HelmCli, HelmError, PackageManager, Release, ReleaseSpec};
pub use report::{Outcome, ScenarioReport, StepRecord, StepStatus};
pub use scenario::{Phase, Scenario, StepError};
pub use telemetry::init_logging;
pub use verify::{ConditionVerifier, LabelExpectation, VerifyError};
pub use wait::{WaitError, WaitOutcome, WaitPolicy};
