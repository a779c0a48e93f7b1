use super::{ClusterError, JobCluster, Launcher, RoundOutcome};
use crate::{
    config::{ClusterConfig, ConfigErrors, ContainerConfig},
    job::Registry,
};
use std::{
    ops::{Deref, DerefMut},
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
    time::Duration,
};
use tracing::{debug, error, info, warn};
use wait_timeout::ChildExt;

/// Resolved container settings
#[derive(Debug, Clone, PartialEq)]
pub struct Container {
    runtime: PathBuf,
    image: String,
    mounts: Vec<String>,
    args: String,
    prepull: bool,
    pull_timeout: Duration,
}

impl Container {
    pub fn load(config: &ContainerConfig) -> Result<Self, ConfigErrors> {
        if config.image.trim().is_empty() {
            error!("A container image is required to run jobs in a container");

            return Err(ConfigErrors::MissingImage);
        }

        Ok(Self {
            runtime: config.resolve_runtime()?,
            image: config.image.clone(),
            mounts: config.resolved_mounts(),
            args: config.args.trim().to_owned(),
            prepull: config.prepull,
            pull_timeout: config.pull_timeout(),
        })
    }

    pub fn runtime(&self) -> &Path {
        &self.runtime
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn mounts(&self) -> &[String] {
        &self.mounts
    }

    /// `exec -B <mount>.. <args> <image> <interpreter> <runner>`
    pub fn arguments(&self, interpreter: &Path, runner: &Path) -> Vec<String> {
        let mut arguments = vec!["exec".to_owned()];

        for mount in self.mounts.iter() {
            arguments.push("-B".to_owned());
            arguments.push(mount.clone());
        }

        arguments.extend(self.args.split_whitespace().map(str::to_owned));
        arguments.push(self.image.clone());
        arguments.push(interpreter.to_string_lossy().into_owned());
        arguments.push(runner.to_string_lossy().into_owned());

        arguments
    }

    /// Pull the image into a scratch directory and throw it away
    ///
    /// This only warms the shared cache so hundreds of array tasks don't all pull at once.
    /// Returns whether the pull succeeded, a failed pull never stops a submission.
    pub fn prepull_image(&self) -> bool {
        let scratch = match tempfile::tempdir() {
            Ok(scratch) => scratch,
            Err(error) => {
                warn!(error = %error, "Failed to create scratch directory for image pull");

                return false;
            }
        };

        info!(image = %self.image, "Pre-pulling container image");

        let mut child = match Command::new(&self.runtime)
            .arg("pull")
            .arg(scratch.path().join("tmp.sif"))
            .arg(&self.image)
            .spawn()
        {
            Ok(child) => child,
            Err(error) => {
                warn!(runtime = ?self.runtime, error = %error, "Failed to start image pull");

                return false;
            }
        };

        match child.wait_timeout(self.pull_timeout) {
            Ok(Some(status)) if status.success() => {
                debug!(image = %self.image, "Image pulled");

                true
            }
            Ok(Some(status)) => {
                warn!(image = %self.image, status = %status, "Image pull failed, submitting anyway");

                false
            }
            Ok(None) => {
                warn!(
                    image = %self.image,
                    timeout = ?self.pull_timeout,
                    "Image pull timed out, submitting anyway"
                );

                if let Err(error) = child.kill() {
                    error!(error = %error, "Failed to stop image pull");
                } else if let Err(error) = child.wait() {
                    error!(error = %error, "Failed to reap image pull");
                }

                false
            }
            Err(error) => {
                warn!(error = %error, "Failed to wait for image pull");

                false
            }
        }
    }
}

/// A `JobCluster` whose tasks run inside an apptainer/singularity container
///
/// Everything but `submit` is the plain cluster, reachable through `Deref`.
#[derive(Debug)]
pub struct ContainerJobCluster {
    cluster: JobCluster,
    container: Container,
}

impl ContainerJobCluster {
    pub fn new(
        config: &ClusterConfig,
        container: &ContainerConfig,
        registry: Arc<Registry>,
    ) -> Result<Self, ClusterError> {
        let container = Container::load(container)?;
        let cluster =
            JobCluster::with_launcher(config, registry, Launcher::Container(container.clone()))?;

        Ok(Self { cluster, container })
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    /// like `JobCluster::submit`, pulling the image first if configured
    pub fn submit(&mut self, do_submit: bool) -> Result<Vec<RoundOutcome>, ClusterError> {
        if self.container.prepull {
            self.container.prepull_image();
        }

        self.cluster.submit(do_submit)
    }

    pub fn into_inner(self) -> JobCluster {
        self.cluster
    }
}

impl Deref for ContainerJobCluster {
    type Target = JobCluster;

    fn deref(&self) -> &Self::Target {
        &self.cluster
    }
}

impl DerefMut for ContainerJobCluster {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.cluster
    }
}
