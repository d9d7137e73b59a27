//! `helm` binary driver

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use super::{HelmError, PackageManager, Release, ReleaseSpec};

/// [`PackageManager`] that shells out to `helm`
///
/// Child processes are killed when the calling future is dropped, so a
/// cancelled step does not leave a helm process behind.
#[derive(Debug, Clone)]
pub struct HelmCli {
    binary: String,
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
}

impl Default for HelmCli {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct InstalledRelease {
    #[serde(default)]
    version: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ListedRelease {
    name: String,
}

impl HelmCli {
    #[must_use]
    pub fn new() -> Self {
        Self {
            binary: "helm".to_string(),
            kubeconfig: None,
            context: None,
        }
    }

    /// Use a different helm executable
    #[must_use]
    pub fn binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    #[must_use]
    pub fn kubeconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig = Some(path.into());
        self
    }

    #[must_use]
    pub fn context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.kill_on_drop(true);

        if let Some(ref kubeconfig) = self.kubeconfig {
            cmd.arg("--kubeconfig").arg(kubeconfig);
        }
        if let Some(ref context) = self.context {
            cmd.args(["--kube-context", context]);
        }

        cmd
    }

    /// Arguments for `helm install`, minus the global connection flags
    fn install_args(spec: &ReleaseSpec, values_file: Option<&str>) -> Vec<String> {
        let mut args = vec![
            "install".to_string(),
            spec.release_name.clone(),
            spec.chart.display().to_string(),
            "--namespace".to_string(),
            spec.namespace.clone(),
            "--timeout".to_string(),
            duration_arg(spec.timeout),
            "--output".to_string(),
            "json".to_string(),
        ];

        if spec.create_namespace {
            args.push("--create-namespace".to_string());
        }
        if spec.wait {
            args.push("--wait".to_string());
        }
        if let Some(path) = values_file {
            args.push("--values".to_string());
            args.push(path.to_string());
        }
        for (key, value) in &spec.set_values {
            args.push("--set".to_string());
            args.push(format!("{key}={value}"));
        }

        args
    }

    fn write_values(values: &str) -> Result<tempfile::NamedTempFile, HelmError> {
        let mut file = tempfile::Builder::new()
            .prefix("discovery-values-")
            .suffix(".yaml")
            .tempfile()
            .map_err(|e| HelmError::Values(e.to_string()))?;
        file.write_all(values.as_bytes())
            .map_err(|e| HelmError::Values(e.to_string()))?;
        Ok(file)
    }

    async fn run(&self, args: &[String]) -> Result<std::process::Output, HelmError> {
        debug!(binary = %self.binary, args = ?args, "Running helm");
        self.command()
            .args(args)
            .output()
            .await
            .map_err(|e| HelmError::CommandFailed(format!("{}: {e}", self.binary)))
    }

    async fn uninstall_quietly(&self, name: &str, namespace: &str) {
        let args = [
            "uninstall".to_string(),
            name.to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
        ];
        match self.run(&args).await {
            Ok(output) if output.status.success() => {
                info!(release = %name, "Removed leftovers of failed install");
            }
            Ok(output) => warn!(
                release = %name,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "Cleanup after failed install did not succeed"
            ),
            Err(e) => warn!(release = %name, error = %e, "Cleanup after failed install did not run"),
        }
    }
}

#[async_trait]
impl PackageManager for HelmCli {
    #[instrument(skip(self, spec), fields(release = %spec.release_name, namespace = %spec.namespace))]
    async fn install(&self, spec: &ReleaseSpec) -> Result<Release, HelmError> {
        if !spec.chart.exists() {
            return Err(HelmError::ChartNotFound(spec.chart.display().to_string()));
        }

        // Kept alive until helm has read it
        let values_file = if spec.values.is_empty() {
            None
        } else {
            Some(Self::write_values(&spec.values)?)
        };
        let values_path = values_file
            .as_ref()
            .map(|f| f.path().display().to_string());

        let args = Self::install_args(spec, values_path.as_deref());
        let output = self.run(&args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            // A name clash means the release belongs to someone else
            if spec.cleanup_on_fail && !name_in_use(&stderr) {
                self.uninstall_quietly(&spec.release_name, &spec.namespace)
                    .await;
            }
            return Err(classify_install_failure(spec, stderr));
        }

        let revision = serde_json::from_slice::<InstalledRelease>(&output.stdout)
            .ok()
            .and_then(|r| r.version);

        info!(chart = %spec.chart.display(), revision = ?revision, "Installed release");

        Ok(Release {
            revision,
            ..spec.to_release()
        })
    }

    #[instrument(skip(self, release), fields(release = %release.name, namespace = %release.namespace))]
    async fn uninstall(&self, release: &Release) -> Result<(), HelmError> {
        let args = [
            "uninstall".to_string(),
            release.name.clone(),
            "--namespace".to_string(),
            release.namespace.clone(),
            "--timeout".to_string(),
            duration_arg(release.timeout),
        ];
        let output = self.run(&args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("not found") {
                return Err(HelmError::ReleaseNotFound(release.name.clone()));
            }
            return Err(HelmError::UninstallFailed {
                release: release.name.clone(),
                reason: stderr,
            });
        }

        info!("Uninstalled release");
        Ok(())
    }

    async fn list_releases(&self, namespace: &str) -> Result<Vec<String>, HelmError> {
        let args = [
            "list".to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
            "--all".to_string(),
            "--output".to_string(),
            "json".to_string(),
        ];
        let output = self.run(&args).await?;

        if !output.status.success() {
            return Err(HelmError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        parse_release_list(&output.stdout)
    }

    fn name(&self) -> &'static str {
        "helm"
    }
}

fn name_in_use(stderr: &str) -> bool {
    stderr.contains("cannot re-use a name that is still in use")
}

fn classify_install_failure(spec: &ReleaseSpec, stderr: String) -> HelmError {
    if stderr.contains("timed out waiting for the condition")
        || stderr.contains("context deadline exceeded")
    {
        return HelmError::Timeout {
            release: spec.release_name.clone(),
            timeout: spec.timeout,
        };
    }

    if stderr.contains("path") && stderr.contains("not found") {
        return HelmError::ChartNotFound(spec.chart.display().to_string());
    }

    HelmError::InstallFailed {
        release: spec.release_name.clone(),
        reason: stderr,
    }
}

fn parse_release_list(stdout: &[u8]) -> Result<Vec<String>, HelmError> {
    // helm prints nothing at all for an empty namespace on some versions
    if stdout.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    let releases: Vec<ListedRelease> = serde_json::from_slice(stdout)
        .map_err(|e| HelmError::CommandFailed(format!("unexpected helm list output: {e}")))?;
    Ok(releases.into_iter().map(|r| r.name).collect())
}

/// Helm duration flag, e.g. `300s`, rounded up to whole seconds
fn duration_arg(timeout: Duration) -> String {
    let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    format!("{secs}s")
}
