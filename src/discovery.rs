//! The feature-discovery acceptance scenario
//!
//! Deploying the discovery chart must label every (matched) node with the
//! configured key, and the label must not be there beforehand. Steps:
//!
//! 1. optional settle pause
//! 2. label absent on all nodes
//! 3. delete stale daemon workloads from earlier runs
//! 4. install the chart under a fresh `<prefix>-<random>` release name
//! 5. wait for reconciliation
//! 6. label present on all nodes
//!
//! Teardown uninstalls the release and, when enabled, checks the label is
//! gone again.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::cleanup::ResourceCleaner;
use crate::cluster::ClusterHandle;
use crate::config::{ConfigError, ScenarioConfig};
use crate::deploy::DeploymentManager;
use crate::helm::ReleaseSpec;
use crate::scenario::{Phase, Scenario, StepError};
use crate::verify::{ConditionVerifier, LabelExpectation, VerifyError};

/// Build the scenario for `config` against `handle`
///
/// Nothing touches the cluster until the returned scenario is run.
pub fn discovery_scenario(
    handle: &ClusterHandle,
    config: &ScenarioConfig,
) -> Result<Scenario, ConfigError> {
    config.validate()?;

    let namespace = handle.namespace().to_string();
    let values = config.values_yaml(&namespace)?;
    let key = config.label_key.clone();

    let deployer = Arc::new(Mutex::new(DeploymentManager::new(handle.charts().clone())));
    let verifier = Arc::new(
        ConditionVerifier::new(handle.api().clone()).with_selector(config.node_selector.clone()),
    );
    let cleaner = ResourceCleaner::new(handle.api().clone());

    let mut scenario = Scenario::new(&config.name)
        .debug_hint(format!("kubectl get nodes -L {key}"))
        .debug_hint(format!("kubectl get daemonsets -n {namespace}"))
        .debug_hint(format!("helm list -n {namespace} --all"));

    if let Some(pause) = config.settle {
        scenario = scenario.step("settle", Phase::Wait, move || async move {
            info!(pause = ?pause, "Settling before precheck");
            tokio::time::sleep(pause).await;
            Ok(())
        });
    }

    scenario = scenario.step("check label absent", Phase::Precheck, {
        let verifier = verifier.clone();
        let key = key.clone();
        move || async move {
            match verifier
                .assert_label_on_all_nodes(&LabelExpectation::absent(&key))
                .await
            {
                Err(VerifyError::Mismatch { node, .. }) => Err(StepError::Precondition(format!(
                    "node '{node}' already carries label '{key}'; is the daemon still deployed?"
                ))),
                other => other.map_err(StepError::from),
            }
        }
    });

    for stale in &config.stale_workloads {
        let cleaner = cleaner.clone();
        let kind = stale.kind;
        let name = stale.name.clone();
        let stale_ns = stale.namespace.clone().unwrap_or_else(|| namespace.clone());
        let timeout = config.cleanup_timeout;

        scenario = scenario.step(
            &format!("delete stale {kind} {name}"),
            Phase::Cleanup,
            move || async move {
                cleaner
                    .ensure_absent(kind, &stale_ns, &name, timeout)
                    .await?;
                Ok(())
            },
        );
    }

    scenario = scenario.step("install chart", Phase::Deploy, {
        let deployer = deployer.clone();
        let prefix = config.release_prefix.clone();
        let chart = config.chart.clone();
        let namespace = namespace.clone();
        let wait = config.install_wait;
        let timeout = config.install_timeout;
        let set_values = config.set_values.clone();
        move || async move {
            let mut manager = deployer.lock().await;
            let name = manager.unique_release_name(&prefix, &namespace).await?;

            let spec = set_values.into_iter().fold(
                ReleaseSpec::new(name, chart, namespace)
                    .wait(wait)
                    .timeout(timeout)
                    .cleanup_on_fail(true)
                    .values(values),
                |spec, (k, v)| spec.set(k, v),
            );

            manager.install(spec).await?;
            Ok(())
        }
    });

    scenario = scenario.step("wait for label", Phase::Wait, {
        let verifier = verifier.clone();
        let policy = config.wait;
        let expectation = LabelExpectation::present(&key);
        move || async move {
            policy
                .settle(&expectation.to_string(), || {
                    verifier.assert_label_on_all_nodes(&expectation)
                })
                .await?;
            Ok(())
        }
    });

    scenario = scenario.step("verify label on all nodes", Phase::Verify, {
        let verifier = verifier.clone();
        let expectation = LabelExpectation::present(&key);
        move || async move {
            verifier.assert_label_on_all_nodes(&expectation).await?;
            Ok(())
        }
    });

    scenario = scenario.teardown("uninstall chart", Phase::Teardown, {
        let deployer = deployer.clone();
        move || async move {
            let mut manager = deployer.lock().await;
            if manager.uninstall().await?.is_none() {
                info!("No release to uninstall");
            }
            Ok(())
        }
    });

    if config.check_label_removal {
        let policy = config.wait;
        let expectation = LabelExpectation::absent(&key);
        scenario = scenario.teardown("verify label removed", Phase::Verify, move || async move {
            policy
                .settle(&expectation.to_string(), || {
                    verifier.assert_label_on_all_nodes(&expectation)
                })
                .await?;
            verifier.assert_label_on_all_nodes(&expectation).await?;
            Ok(())
        });
    }

    Ok(scenario)
}
