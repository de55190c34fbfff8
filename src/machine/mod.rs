//! Container machine platform access.
//!
//! Everything the rest of the crate needs from the virtualization platform
//! goes through the [`MachinePlatform`] trait: registration, state, running
//! commands inside the machine, and moving files in. The concrete
//! implementation drives `machinectl` (registration, lifecycle) and
//! `systemd-run --machine` (in-machine commands); tests substitute an
//! in-memory double.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::errors::{KubenestError, KubenestResult};
use crate::logging;

/// Observed state of a registered machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Stopped,
    Running,
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            MachineState::Stopped => "stopped",
            MachineState::Running => "running",
        };
        f.write_str(label)
    }
}

impl MachineState {
    /// Parse the value of machinectl's `State` property.
    pub fn parse(label: &str) -> KubenestResult<MachineState> {
        match label.trim() {
            "running" => Ok(MachineState::Running),
            "" | "stopped" | "closing" => Ok(MachineState::Stopped),
            other => Err(KubenestError::Machine {
                machine: String::new(),
                message: format!("unknown machine state: {other}"),
            }),
        }
    }
}

/// Narrow interface to the machine runtime.
#[async_trait]
pub trait MachinePlatform: Send + Sync {
    /// Whether an image/machine with this name is registered.
    async fn is_registered(&self, name: &str) -> KubenestResult<bool>;

    /// Live state of the machine.
    async fn state(&self, name: &str) -> KubenestResult<MachineState>;

    /// Register a machine by importing a root filesystem tarball.
    async fn register(&self, name: &str, image: &Path, install_dir: &Path) -> KubenestResult<()>;

    /// Force the machine off.
    async fn terminate(&self, name: &str) -> KubenestResult<()>;

    /// Remove the machine registration and its image.
    async fn unregister(&self, name: &str) -> KubenestResult<()>;

    /// Run a command inside the machine and capture stdout.
    async fn command(&self, name: &str, argv: &[&str]) -> KubenestResult<String>;

    /// Run a shell command inside the machine, piping its JSON log output
    /// through the host logger. Returns the command's exit code.
    async fn launch_and_pipe(&self, name: &str, command: &str, task: &str) -> KubenestResult<i32>;

    /// Write `content` to `dest` inside the machine, then run any follow-up
    /// shell commands (e.g. chmod) in the same invocation.
    async fn write_file(
        &self,
        name: &str,
        dest: &str,
        content: &[u8],
        followup: &[&str],
    ) -> KubenestResult<()>;
}

/// Read a file from inside the machine.
pub async fn read_file(
    platform: &dyn MachinePlatform,
    name: &str,
    path: &str,
) -> KubenestResult<String> {
    platform.command(name, &["cat", path]).await
}

/// Copy a host file into the machine.
pub async fn copy_file(
    platform: &dyn MachinePlatform,
    name: &str,
    source: &Path,
    dest: &str,
    followup: &[&str],
) -> KubenestResult<()> {
    let content = tokio::fs::read(source).await.map_err(|e| {
        KubenestError::Machine {
            machine: name.into(),
            message: format!("reading {}: {e}", source.display()),
        }
    })?;
    platform.write_file(name, dest, &content, followup).await
}

/// The NAT gateway address seen from inside the machine, taken from the
/// first nameserver in its resolver configuration.
pub async fn nat_gateway_address(
    platform: &dyn MachinePlatform,
    name: &str,
) -> KubenestResult<String> {
    let resolv = read_file(platform, name, "/etc/resolv.conf").await?;
    parse_nameserver(&resolv).ok_or_else(|| KubenestError::Machine {
        machine: name.into(),
        message: "no nameserver found in /etc/resolv.conf".into(),
    })
}

pub(crate) fn parse_nameserver(resolv: &str) -> Option<String> {
    resolv
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("nameserver"))
        .find_map(|line| line.split_whitespace().nth(1).map(str::to_string))
}

/// `machinectl`-backed platform implementation.
pub struct Machinectl;

static MACHINECTL_PATH: OnceLock<PathBuf> = OnceLock::new();

/// Locate machinectl once. `/usr/bin` is the common location; fall back to
/// a bare name resolved through PATH.
fn find_machinectl() -> &'static Path {
    MACHINECTL_PATH.get_or_init(|| {
        for candidate in ["/usr/bin/machinectl", "/bin/machinectl"] {
            let path = PathBuf::from(candidate);
            if path.exists() {
                return path;
            }
        }
        PathBuf::from("machinectl")
    })
}

async fn run_host_command(mut cmd: Command, display: String) -> KubenestResult<String> {
    let output = cmd.output().await.map_err(|e| KubenestError::Machine {
        machine: String::new(),
        message: format!("spawning `{display}`: {e}"),
    })?;
    if !output.status.success() {
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        return Err(KubenestError::Command {
            command: display,
            code: output.status.code().unwrap_or(-1),
            output: combined.trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

impl Machinectl {
    fn ctl(&self, args: &[&str]) -> (Command, String) {
        let path = find_machinectl();
        let mut cmd = Command::new(path);
        cmd.args(args);
        (cmd, format!("{} {}", path.display(), args.join(" ")))
    }

    fn in_machine(&self, name: &str, argv: &[&str]) -> (Command, String) {
        let mut cmd = Command::new("systemd-run");
        let machine_arg = format!("--machine={name}");
        cmd.arg(&machine_arg)
            .arg("--quiet")
            .arg("--pipe")
            .arg("--wait")
            .args(argv);
        (
            cmd,
            format!("systemd-run {machine_arg} --quiet --pipe --wait {}", argv.join(" ")),
        )
    }
}

#[async_trait]
impl MachinePlatform for Machinectl {
    async fn is_registered(&self, name: &str) -> KubenestResult<bool> {
        let (mut cmd, display) = self.ctl(&["show-image", name, "--property=Name"]);
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
        let status = cmd.status().await.map_err(|e| KubenestError::Machine {
            machine: name.into(),
            message: format!("spawning `{display}`: {e}"),
        })?;
        Ok(status.success())
    }

    async fn state(&self, name: &str) -> KubenestResult<MachineState> {
        // `machinectl show` only resolves running machines; a registered but
        // stopped machine fails the lookup.
        let (mut cmd, _display) = self.ctl(&["show", name, "--property=State", "--value"]);
        cmd.stderr(Stdio::null());
        let output = cmd.output().await.map_err(|e| KubenestError::Machine {
            machine: name.into(),
            message: format!("querying state: {e}"),
        })?;
        if !output.status.success() {
            return Ok(MachineState::Stopped);
        }
        let value = String::from_utf8_lossy(&output.stdout);
        MachineState::parse(&value).map_err(|_| KubenestError::Machine {
            machine: name.into(),
            message: format!("unknown machine state: {}", value.trim()),
        })
    }

    async fn register(&self, name: &str, image: &Path, install_dir: &Path) -> KubenestResult<()> {
        tracing::info!(
            machine = %name,
            image = %image.display(),
            install_dir = %install_dir.display(),
            "registering machine"
        );
        let image_str = image.to_string_lossy();
        let (cmd, display) = self.ctl(&["import-tar", image_str.as_ref(), name]);
        run_host_command(cmd, display).await.map_err(|e| {
            KubenestError::Machine {
                machine: name.into(),
                message: format!("importing {}: {e}", image.display()),
            }
        })?;
        tracing::info!(machine = %name, "registration done");
        Ok(())
    }

    async fn terminate(&self, name: &str) -> KubenestResult<()> {
        let (cmd, display) = self.ctl(&["terminate", name]);
        run_host_command(cmd, display).await?;
        Ok(())
    }

    async fn unregister(&self, name: &str) -> KubenestResult<()> {
        let (cmd, display) = self.ctl(&["remove", name]);
        run_host_command(cmd, display).await?;
        Ok(())
    }

    async fn command(&self, name: &str, argv: &[&str]) -> KubenestResult<String> {
        let (cmd, display) = self.in_machine(name, argv);
        run_host_command(cmd, display).await
    }

    async fn launch_and_pipe(&self, name: &str, command: &str, task: &str) -> KubenestResult<i32> {
        tracing::debug!(machine = %name, command, "start machine command");
        let (mut cmd, display) = self.in_machine(name, &["/bin/sh", "-c", command]);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| KubenestError::Machine {
            machine: name.into(),
            message: format!("spawning `{display}`: {e}"),
        })?;

        if let Some(stderr) = child.stderr.take() {
            logging::pipe_lines(BufReader::new(stderr), task).await;
        }

        let status = child.wait().await.map_err(|e| KubenestError::Machine {
            machine: name.into(),
            message: format!("waiting for `{display}`: {e}"),
        })?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn write_file(
        &self,
        name: &str,
        dest: &str,
        content: &[u8],
        followup: &[&str],
    ) -> KubenestResult<()> {
        let mut script = format!("mkdir -p \"$(dirname '{dest}')\"; cat > '{dest}'");
        for extra in followup {
            script.push_str("; ");
            script.push_str(extra);
        }
        let (mut cmd, display) = self.in_machine(name, &["/bin/sh", "-c", &script]);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| KubenestError::Machine {
            machine: name.into(),
            message: format!("spawning `{display}`: {e}"),
        })?;
        let mut stdin = child.stdin.take().ok_or_else(|| KubenestError::Machine {
            machine: name.into(),
            message: "no stdin handle for file copy".into(),
        })?;
        stdin.write_all(content).await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(KubenestError::Machine {
                machine: name.into(),
                message: format!(
                    "writing {dest}: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        tracing::info!(machine = %name, dest, "file written into machine");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_machine_states() {
        assert_eq!(MachineState::parse("running").unwrap(), MachineState::Running);
        assert_eq!(MachineState::parse("stopped").unwrap(), MachineState::Stopped);
        assert_eq!(MachineState::parse("").unwrap(), MachineState::Stopped);
        assert!(MachineState::parse("degraded").is_err());
    }

    #[test]
    fn extracts_first_nameserver() {
        let resolv = "# generated\nsearch local\nnameserver 192.168.67.1\nnameserver 8.8.8.8\n";
        assert_eq!(parse_nameserver(resolv).as_deref(), Some("192.168.67.1"));
        assert_eq!(parse_nameserver("search local\n"), None);
    }
}
