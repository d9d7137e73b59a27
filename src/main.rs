//! discovery-e2e - run the feature discovery acceptance scenario against a live cluster

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use discovery_e2e::{
    discovery_scenario, init_logging, ClusterConfig, ClusterHandle, ImageConfig, ScenarioConfig,
    StaleWorkload, WaitPolicy,
};

/// Exit code when the cluster cannot be reached or the configuration is unusable
const EXIT_SETUP_FAILURE: u8 = 3;

/// Check that deploying the discovery chart labels every node, then remove it
#[derive(Parser, Debug)]
#[command(name = "discovery-e2e", version, about, long_about = None)]
struct Cli {
    /// Local chart directory or archive to install
    #[arg(long, env = "E2E_CHART")]
    chart: PathBuf,

    /// Kubeconfig path; defaults to $KUBECONFIG, then ~/.kube/config
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long)]
    context: Option<String>,

    /// Namespace to install the chart into
    #[arg(short, long, env = "E2E_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Release names are <prefix>-<random>
    #[arg(long, default_value = "disc")]
    release_prefix: String,

    /// Node label the daemon must publish
    #[arg(long, default_value = discovery_e2e::config::DEFAULT_LABEL_KEY)]
    label: String,

    /// Only verify nodes matching this label selector
    #[arg(long)]
    node_selector: Option<String>,

    /// Image registry (overrides E2E_IMAGE_REGISTRY)
    #[arg(long)]
    image_registry: Option<String>,

    /// Image name (overrides E2E_IMAGE_NAME)
    #[arg(long)]
    image_name: Option<String>,

    /// Image tag (overrides E2E_IMAGE_TAG)
    #[arg(long)]
    image_tag: Option<String>,

    /// Extra chart values as key=value, may be repeated
    #[arg(long = "set", value_parser = parse_key_value)]
    set_values: Vec<(String, String)>,

    /// Block the install on workload readiness
    #[arg(long)]
    install_wait: bool,

    /// Install timeout in seconds
    #[arg(long, default_value = "300")]
    install_timeout_secs: u64,

    /// Fixed pause after install in seconds
    #[arg(long, default_value = "120")]
    wait_secs: u64,

    /// Poll for the label instead of pausing; --wait-secs becomes the deadline
    #[arg(long)]
    poll: bool,

    /// Pause before the precheck in seconds
    #[arg(long)]
    settle_secs: Option<u64>,

    /// Stale daemonset to delete before installing, may be repeated
    #[arg(long = "stale-daemonset")]
    stale_daemonsets: Vec<String>,

    /// Also check the label is removed after uninstall
    #[arg(long)]
    check_label_removal: bool,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .filter(|(k, _)| !k.is_empty())
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{s}'"))
}

impl Cli {
    fn cluster_config(&self) -> ClusterConfig {
        let mut config = ClusterConfig::new().namespace(&self.namespace);
        if let Some(path) = &self.kubeconfig {
            config = config.kubeconfig(path);
        }
        if let Some(context) = &self.context {
            config = config.context(context);
        }
        config
    }

    fn scenario_config(&self) -> ScenarioConfig {
        let mut image = ImageConfig::from_env();
        if let Some(registry) = &self.image_registry {
            image = image.registry(registry);
        }
        if let Some(name) = &self.image_name {
            image = image.name(name);
        }
        if let Some(tag) = &self.image_tag {
            image = image.tag(tag);
        }

        let wait = Duration::from_secs(self.wait_secs);
        let policy = if self.poll {
            WaitPolicy::poll(wait)
        } else {
            WaitPolicy::Fixed(wait)
        };

        let mut config = ScenarioConfig::new(&self.chart)
            .release_prefix(&self.release_prefix)
            .label_key(&self.label)
            .image(image)
            .install_wait(self.install_wait)
            .install_timeout(Duration::from_secs(self.install_timeout_secs))
            .wait(policy)
            .check_label_removal(self.check_label_removal);

        if let Some(selector) = &self.node_selector {
            config = config.node_selector(selector);
        }
        if let Some(secs) = self.settle_secs {
            config = config.settle(Duration::from_secs(secs));
        }
        if !self.stale_daemonsets.is_empty() {
            config = config.stale_workloads(
                self.stale_daemonsets
                    .iter()
                    .map(StaleWorkload::daemon_set),
            );
        }
        for (key, value) in &self.set_values {
            config = config.set_value(key, value);
        }
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(&cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %format!("{e:#}"), "Setup failed");
            eprintln!("discovery-e2e: {e:#}");
            ExitCode::from(EXIT_SETUP_FAILURE)
        }
    }
}

async fn run(cli: &Cli) -> anyhow::Result<u8> {
    let scenario_config = cli.scenario_config();
    info!(
        chart = %scenario_config.chart.display(),
        image = %scenario_config.image.reference(),
        label = %scenario_config.label_key,
        "Starting discovery e2e"
    );

    let handle = ClusterHandle::connect(&cli.cluster_config())
        .await
        .context("failed to connect to cluster")?;
    let scenario =
        discovery_scenario(&handle, &scenario_config).context("invalid scenario configuration")?;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, tearing down");
            trigger.cancel();
        }
    });

    let report = scenario.run(&cancel).await;
    println!("{report}");

    Ok(report.outcome().exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["discovery-e2e", "--chart", "./charts/fd"]).unwrap();
        let config = cli.scenario_config();

        assert_eq!(config.release_prefix, "disc");
        assert_eq!(config.wait, WaitPolicy::Fixed(Duration::from_secs(120)));
        assert!(!config.install_wait);
        assert!(!config.check_label_removal);
        assert_eq!(config.stale_workloads.len(), 2);
        assert_eq!(cli.cluster_config().namespace, "default");
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::try_parse_from([
            "discovery-e2e",
            "--chart",
            "./charts/fd",
            "--namespace",
            "e2e",
            "--poll",
            "--wait-secs",
            "60",
            "--image-tag",
            "v1.2.3",
            "--stale-daemonset",
            "old-fd",
            "--set",
            "daemonSet.logLevel=debug",
            "--node-selector",
            "npu=true",
        ])
        .unwrap();
        let config = cli.scenario_config();

        assert_eq!(config.wait, WaitPolicy::poll(Duration::from_secs(60)));
        assert_eq!(config.image.tag, "v1.2.3");
        assert_eq!(config.stale_workloads, vec![StaleWorkload::daemon_set("old-fd")]);
        assert_eq!(
            config.set_values,
            vec![("daemonSet.logLevel".to_string(), "debug".to_string())]
        );
        assert_eq!(config.node_selector.as_deref(), Some("npu=true"));
        assert_eq!(cli.cluster_config().namespace, "e2e");
    }

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("a.b=c=d").unwrap(),
            ("a.b".to_string(), "c=d".to_string())
        );
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
    }
}
