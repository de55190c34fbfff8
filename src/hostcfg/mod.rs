//! Host and machine configuration.
//!
//! Everything `configure` can do: binding domains to the cluster address,
//! routing, seeding secrets/ssh material into the machine, and the
//! bootstrap configuration file entries the in-machine supervisor reads.
//! Operations that require administrative rights branch on the current
//! privilege level — in-process when already elevated, through the
//! [`ElevationBridge`] otherwise.

pub mod hosts;
pub mod route;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cluster::HostConfigurator;
use crate::elevation::{self, ElevationBridge};
use crate::errors::{KubenestError, KubenestResult};
use crate::machine::{self, MachinePlatform};

use hosts::HostsFile;

/// Configuration file of the in-machine supervisor.
pub const MACHINE_CONF_PATH: &str = "/etc/conf.d/nestd";
/// Where secrets keys land inside the machine.
pub const MACHINE_AGE_KEY_PATH: &str = "/root/.config/sops/age/keys.txt";
pub const MACHINE_SSH_KEY_PATH: &str = "/root/.ssh/id_rsa";

pub const DEFAULT_ADDRESS: &str = "192.168.67.2";

/// User-facing configuration knobs, flag- and file-settable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigureOptions {
    /// Stable address of the cluster on the machine NAT network.
    pub address: String,
    pub age_key_file: Option<PathBuf>,
    pub ssh_key_file: Option<PathBuf>,
    pub kustomize_url: Option<String>,
    pub domains: Vec<String>,
    pub ssh_hosts: Vec<String>,
}

impl Default for ConfigureOptions {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            age_key_file: None,
            ssh_key_file: None,
            kustomize_url: None,
            domains: Vec::new(),
            ssh_hosts: vec!["github.com".to_string(), "gitlab.com".to_string()],
        }
    }
}

/// Replace any previous `export key=...` line and append the new one.
pub(crate) fn replace_export(content: &str, key: &str, value: &str) -> String {
    let prefix = format!("export {key}=");
    let mut kept: String = content
        .lines()
        .filter(|line| !line.starts_with(&prefix))
        .collect::<Vec<_>>()
        .join("\n");
    if !kept.is_empty() {
        kept.push('\n');
    }
    kept.push_str(&format!("export {key}=\"{value}\"\n"));
    kept
}

async fn set_machine_export(
    platform: &dyn MachinePlatform,
    name: &str,
    key: &str,
    value: &str,
) -> KubenestResult<()> {
    let current = machine::read_file(platform, name, MACHINE_CONF_PATH)
        .await
        .unwrap_or_default();
    let updated = replace_export(&current, key, value);
    platform
        .write_file(name, MACHINE_CONF_PATH, updated.as_bytes(), &[])
        .await
}

/// Point the in-machine supervisor at a kustomization to apply on start.
pub async fn configure_kustomize(
    platform: &dyn MachinePlatform,
    name: &str,
    url: &str,
) -> KubenestResult<()> {
    tracing::info!(machine = %name, kustomize_url = url, "setting kustomize url");
    set_machine_export(platform, name, "NESTD_KUSTOMIZE_DIRECTORY", url).await
}

/// Copy a sops age key into the machine and point the supervisor at it.
pub async fn configure_age_key(
    platform: &dyn MachinePlatform,
    name: &str,
    key_file: &Path,
) -> KubenestResult<()> {
    if !key_file.exists() {
        tracing::warn!(age_key_file = %key_file.display(), "age key file does not exist");
        return Ok(());
    }
    machine::copy_file(platform, name, key_file, MACHINE_AGE_KEY_PATH, &[]).await?;
    set_machine_export(platform, name, "SOPS_AGE_KEY_FILE", MACHINE_AGE_KEY_PATH).await
}

/// Copy an ssh private key into the machine root account.
pub async fn configure_ssh_key(
    platform: &dyn MachinePlatform,
    name: &str,
    key_file: &Path,
) -> KubenestResult<()> {
    if !key_file.exists() {
        tracing::warn!(ssh_key_file = %key_file.display(), "ssh key file does not exist");
        return Ok(());
    }
    machine::copy_file(
        platform,
        name,
        key_file,
        MACHINE_SSH_KEY_PATH,
        &[
            "chmod 600 /root/.ssh/id_rsa",
            "chmod 700 /root/.ssh",
        ],
    )
    .await
}

/// Seed the machine root's known_hosts so in-machine git operations don't
/// stall on first contact.
pub async fn add_ssh_hosts(
    platform: &dyn MachinePlatform,
    name: &str,
    ssh_hosts: &[String],
) -> KubenestResult<()> {
    if ssh_hosts.is_empty() {
        return Ok(());
    }
    let script = format!(
        "mkdir -p /root/.ssh; chmod 700 /root/.ssh; ssh-keyscan {} >> /root/.ssh/known_hosts 2>/dev/null",
        ssh_hosts.join(" ")
    );
    let code = platform.launch_and_pipe(name, &script, "ssh hosts").await?;
    if code != 0 {
        return Err(KubenestError::Machine {
            machine: name.into(),
            message: format!("ssh-keyscan exited with code {code}"),
        });
    }
    Ok(())
}

/// Bind (or unbind) domain names to the cluster address in the host's
/// hosts file, in-process when elevated, through the bridge otherwise.
/// Returns the names bound to the address afterwards.
pub async fn configure_domains(
    bridge: &ElevationBridge,
    name: &str,
    address: &str,
    domains: &[String],
    remove: bool,
) -> KubenestResult<Vec<String>> {
    let result = if elevation::is_elevated() {
        let mut file = HostsFile::load(Path::new(hosts::HOSTS_PATH))?;
        hosts::apply_domains(&mut file, address, domains, remove)?
    } else {
        bridge
            .configure_domains(name, address, domains, remove)
            .await?
    };

    if result.is_empty() {
        tracing::info!(address, "no domains bound");
    } else {
        tracing::info!(address, domains = %result.join(" "), "updated domains");
    }
    Ok(result)
}

/// Apply the full configuration set to an installed machine, in the fixed
/// order the original lifecycle uses: secrets first, then routing, then
/// naming.
pub async fn configure(
    platform: &dyn MachinePlatform,
    bridge: &ElevationBridge,
    name: &str,
    options: &ConfigureOptions,
) -> KubenestResult<()> {
    if let Some(key_file) = &options.age_key_file {
        configure_age_key(platform, name, key_file)
            .await
            .map_err(|e| KubenestError::Machine {
                machine: name.into(),
                message: format!("configuring age key: {e}"),
            })?;
    }
    if let Some(key_file) = &options.ssh_key_file {
        configure_ssh_key(platform, name, key_file)
            .await
            .map_err(|e| KubenestError::Machine {
                machine: name.into(),
                message: format!("configuring ssh key: {e}"),
            })?;
    }
    if let Some(url) = &options.kustomize_url {
        configure_kustomize(platform, name, url)
            .await
            .map_err(|e| KubenestError::Machine {
                machine: name.into(),
                message: format!("configuring kustomize url: {e}"),
            })?;
    }

    route::route_to_machine(platform, bridge, name, &options.address, false).await?;

    if !options.domains.is_empty() {
        configure_domains(bridge, name, &options.address, &options.domains, false).await?;
    }
    Ok(())
}

/// The configurator the CLI wires into the lifecycle driver.
pub struct StandardConfigurator<'a> {
    pub platform: &'a dyn MachinePlatform,
    pub bridge: &'a ElevationBridge,
    pub options: ConfigureOptions,
}

#[async_trait]
impl HostConfigurator for StandardConfigurator<'_> {
    async fn apply(&self, name: &str) -> KubenestResult<()> {
        configure(self.platform, self.bridge, name, &self.options).await
    }
}
