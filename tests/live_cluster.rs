//! Runs against the cluster in the current kubeconfig
//!
//! Needs a reachable cluster, the `helm` binary and a chart at `$E2E_CHART`:
//!
//! ```bash
//! E2E_CHART=./charts/feature-discovery cargo test --test live_cluster -- --ignored
//! ```

use std::time::Duration;

use discovery_e2e::{
    discovery_scenario, init_logging, ClusterConfig, ClusterHandle, ConditionVerifier,
    LabelExpectation, ScenarioConfig, WaitPolicy,
};
use tokio_util::sync::CancellationToken;

fn chart() -> String {
    std::env::var("E2E_CHART").unwrap_or_else(|_| "./charts/feature-discovery".to_string())
}

#[tokio::test]
#[ignore] // Requires real cluster
async fn test_cluster_has_nodes() {
    init_logging();
    let handle = ClusterHandle::connect(&ClusterConfig::new())
        .await
        .expect("Should connect to cluster");

    let nodes = handle.api().list_nodes(None).await.expect("Should list nodes");
    assert!(!nodes.is_empty(), "Cluster should have at least one node");
}

#[tokio::test]
#[ignore] // Requires real cluster
async fn test_discovery_scenario_end_to_end() {
    init_logging();
    let handle = ClusterHandle::connect(&ClusterConfig::new())
        .await
        .expect("Should connect to cluster");

    let config = ScenarioConfig::new(chart())
        .wait(WaitPolicy::poll(Duration::from_secs(180)))
        .check_label_removal(true);
    let report = discovery_scenario(&handle, &config)
        .expect("Config should be valid")
        .run(&CancellationToken::new())
        .await;

    println!("{report}");
    assert!(report.outcome().passed(), "{}", report.outcome());

    // Teardown left no label behind
    ConditionVerifier::new(handle.api().clone())
        .assert_label_on_all_nodes(&LabelExpectation::absent(&config.label_key))
        .await
        .expect("Label should be gone after uninstall");
}
