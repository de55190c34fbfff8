//! Cluster lifecycle orchestration.
//!
//! Sequences install → configure → start → wait over the status classifier,
//! talking to everything stateful through narrow collaborator traits so the
//! whole state machine is drivable against in-memory doubles:
//!
//! - `status`: the pure classifier and the live status query
//! - `readiness`: the workload convergence poller
//! - the [`Lifecycle`] driver in this module

pub mod readiness;
pub mod status;

use std::path::PathBuf;

use async_trait::async_trait;

use crate::errors::{KubenestError, KubenestResult};
use crate::machine::MachinePlatform;

pub use status::{ClusterStatus, classify, cluster_status};

/// Provisions the root filesystem image and per-machine state.
#[async_trait]
pub trait ImageProvisioner: Send + Sync {
    /// Make sure a current image exists locally; returns its path.
    async fn ensure_image(&self) -> KubenestResult<PathBuf>;
    /// Per-machine state directory, created on demand.
    fn machine_dir(&self, name: &str) -> KubenestResult<PathBuf>;
    /// Drop per-machine state. Must be idempotent.
    fn remove_state(&self, name: &str) -> KubenestResult<()>;
}

/// Applies host/machine configuration after registration (may require
/// elevation internally).
#[async_trait]
pub trait HostConfigurator: Send + Sync {
    async fn apply(&self, name: &str) -> KubenestResult<()>;
}

/// Manages the cluster credentials generated inside the machine.
#[async_trait]
pub trait CredentialsStore: Send + Sync {
    async fn merge(&self, name: &str) -> KubenestResult<()>;
    fn remove(&self, name: &str) -> KubenestResult<()>;
}

fn start_command(name: &str, log_level: &str) -> String {
    format!("/sbin/nestd --json -v {log_level} --cluster-name {name} start")
}

const STOP_COMMAND: &str = "/sbin/rc-service nestd stop";

/// Drives the lifecycle state machine.
pub struct Lifecycle<'a> {
    pub platform: &'a dyn MachinePlatform,
    pub images: &'a dyn ImageProvisioner,
    pub configurator: &'a dyn HostConfigurator,
    pub credentials: &'a dyn CredentialsStore,
}

impl Lifecycle<'_> {
    /// Current lifecycle status, derived from live platform state.
    pub async fn status(&self, name: &str) -> KubenestResult<ClusterStatus> {
        cluster_status(self.platform, name).await
    }

    /// Install the machine: image, registration, configuration. Requires
    /// `Uninstalled`.
    pub async fn install(&self, name: &str) -> KubenestResult<()> {
        let status = self.status(name).await?;
        if status != ClusterStatus::Uninstalled {
            return Err(KubenestError::InvalidState(format!(
                "cannot install {name}: status is {status}, expected uninstalled"
            )));
        }
        self.install_unchecked(name).await
    }

    async fn install_unchecked(&self, name: &str) -> KubenestResult<()> {
        let image = self.images.ensure_image().await?;
        let install_dir = self.images.machine_dir(name)?;
        self.platform.register(name, &image, &install_dir).await?;
        self.configurator.apply(name).await?;
        Ok(())
    }

    /// Start the cluster, installing first when needed. Already-started is
    /// a no-op; any other status is a fatal inconsistency.
    pub async fn start(&self, name: &str, log_level: &str) -> KubenestResult<()> {
        let mut status = self.status(name).await?;
        if status == ClusterStatus::Started {
            tracing::info!(machine = %name, "cluster already started");
            return Ok(());
        }
        if status == ClusterStatus::Uninstalled {
            self.install_unchecked(name).await?;
            status = ClusterStatus::Installed;
        }
        if status != ClusterStatus::Installed {
            return Err(KubenestError::InvalidState(format!(
                "cluster {name} in bad status: {status}"
            )));
        }

        let command = start_command(name, log_level);
        tracing::info!(machine = %name, command = %command, "starting kubernetes");
        let code = self
            .platform
            .launch_and_pipe(name, &command, "start cluster")
            .await?;
        if code != 0 {
            return Err(KubenestError::Command {
                command,
                code,
                output: String::new(),
            });
        }
        tracing::info!(machine = %name, "kubernetes started");

        self.credentials.merge(name).await?;
        Ok(())
    }

    /// Stop the cluster: orderly in-machine shutdown, then terminate the
    /// machine regardless — if the shutdown command fails the machine is
    /// still forced off.
    pub async fn stop(&self, name: &str) -> KubenestResult<()> {
        let status = self.status(name).await?;
        if status != ClusterStatus::Started {
            return Err(KubenestError::InvalidState(format!(
                "cannot stop {name}: status is {status}, expected started"
            )));
        }

        tracing::info!(machine = %name, "stopping kubernetes");
        match self
            .platform
            .launch_and_pipe(name, STOP_COMMAND, "stop cluster")
            .await
        {
            Ok(0) => {}
            Ok(code) => {
                tracing::warn!(machine = %name, code, "in-machine shutdown exited non-zero")
            }
            Err(err) => tracing::warn!(machine = %name, error = %err, "in-machine shutdown failed"),
        }
        self.platform.terminate(name).await?;
        tracing::info!(machine = %name, "kubernetes stopped");
        Ok(())
    }

    /// Remove the machine, its credentials and local state. Idempotent:
    /// safe to run whatever the current status is.
    pub async fn uninstall(&self, name: &str) -> KubenestResult<()> {
        if self.platform.is_registered(name).await? {
            if self.status(name).await? == ClusterStatus::Started {
                if let Err(err) = self.platform.terminate(name).await {
                    tracing::warn!(machine = %name, error = %err, "terminate before unregister failed");
                }
            }
            tracing::info!(machine = %name, "unregistering machine");
            self.platform.unregister(name).await?;
        }
        self.credentials.remove(name)?;
        self.images.remove_state(name)?;
        Ok(())
    }
}
