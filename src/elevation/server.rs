//! Elevated server side of the privilege bridge.
//!
//! Runs in the separately spawned root process (`configure elevate
//! <socket-path>`). It refuses to start without elevation, binds the
//! rendezvous socket, verifies that connecting peers belong to the user who
//! requested elevation, and dispatches the privileged operations. `Stop`
//! acknowledges first and only then signals shutdown, so the client always
//! sees the ack before the channel goes away.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::errors::{KubenestError, KubenestResult};
use crate::hostcfg::hosts::{self, HostsFile};

use super::is_elevated;
use super::protocol::{ElevationRequest, ElevationResponse};

/// Privileged operations the server can perform. Split out as a trait so
/// the protocol loop can be exercised in-process without root.
#[async_trait]
pub trait PrivilegedOps: Send + Sync {
    async fn add_route(&self, destination: &str, prefix: u8, gateway: &str) -> KubenestResult<()>;
    async fn remove_route(&self, destination: &str) -> KubenestResult<()>;
    async fn configure_domains(
        &self,
        machine: &str,
        address: &str,
        domains: &[String],
        remove: bool,
    ) -> KubenestResult<Vec<String>>;
}

/// Real implementation: `ip route` for the route table, the system hosts
/// file for domains.
pub struct HostOps;

async fn run_ip_route(args: &[&str]) -> KubenestResult<()> {
    let output = Command::new("ip")
        .arg("route")
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await?;
    if !output.status.success() {
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        return Err(KubenestError::Command {
            command: format!("ip route {}", args.join(" ")),
            code: output.status.code().unwrap_or(-1),
            output: combined.trim().to_string(),
        });
    }
    Ok(())
}

#[async_trait]
impl PrivilegedOps for HostOps {
    async fn add_route(&self, destination: &str, prefix: u8, gateway: &str) -> KubenestResult<()> {
        // `replace` keeps re-adding an existing route idempotent.
        let target = format!("{destination}/{prefix}");
        run_ip_route(&["replace", &target, "via", gateway]).await?;
        tracing::info!(destination, gateway, "route added");
        Ok(())
    }

    async fn remove_route(&self, destination: &str) -> KubenestResult<()> {
        match run_ip_route(&["del", destination]).await {
            Ok(()) => {
                tracing::info!(destination, "route removed");
                Ok(())
            }
            // Removing a route that was never added is a silent success.
            Err(KubenestError::Command { output, .. }) if output.contains("No such process") => {
                tracing::debug!(destination, "route was not present");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn configure_domains(
        &self,
        machine: &str,
        address: &str,
        domains: &[String],
        remove: bool,
    ) -> KubenestResult<Vec<String>> {
        tracing::info!(
            machine,
            address,
            domains = %domains.join(" "),
            remove,
            "received domain request"
        );
        let mut file = HostsFile::load(Path::new(hosts::HOSTS_PATH))?;
        let result = hosts::apply_domains(&mut file, address, domains, remove)?;
        tracing::info!(domains = %result.join(" "), "returning updated domains");
        Ok(result)
    }
}

async fn dispatch(ops: &dyn PrivilegedOps, request: &ElevationRequest) -> ElevationResponse {
    let outcome = match request {
        ElevationRequest::AddRoute {
            destination,
            prefix,
            gateway,
        } => ops
            .add_route(destination, *prefix, gateway)
            .await
            .map(|()| ElevationResponse::Ack),
        ElevationRequest::RemoveRoute { destination } => ops
            .remove_route(destination)
            .await
            .map(|()| ElevationResponse::Ack),
        ElevationRequest::ConfigureDomains {
            machine,
            address,
            domains,
            remove,
        } => ops
            .configure_domains(machine, address, domains, *remove)
            .await
            .map(|domains| ElevationResponse::Domains { domains }),
        ElevationRequest::Stop => Ok(ElevationResponse::Ack),
    };
    outcome.unwrap_or_else(|err| ElevationResponse::Error {
        message: err.to_string(),
    })
}

/// Serve one client connection until it closes or sends Stop.
///
/// The Stop ack is written and flushed before the shutdown signal fires;
/// tearing the transport down without that handshake risks the peer never
/// exiting.
pub(crate) async fn serve_connection(
    stream: UnixStream,
    ops: &dyn PrivilegedOps,
    shutdown: mpsc::Sender<()>,
) -> KubenestResult<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            return Ok(());
        }
        let request: ElevationRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(error = %err, "invalid request on elevation channel");
                continue;
            }
        };

        let stopping = matches!(request, ElevationRequest::Stop);
        let response = dispatch(ops, &request).await;
        let mut payload = serde_json::to_string(&response)?;
        payload.push('\n');
        write_half.write_all(payload.as_bytes()).await?;
        write_half.flush().await?;

        if stopping {
            tracing::info!("asked to stop, signalling shutdown");
            let _ = shutdown.send(()).await;
            return Ok(());
        }
    }
}

/// Uid of the user the elevation was requested for, taken from the
/// environment the elevation mechanism sets up.
fn expected_peer_uid() -> Option<u32> {
    for key in ["PKEXEC_UID", "SUDO_UID"] {
        if let Ok(value) = std::env::var(key) {
            if let Ok(uid) = value.parse() {
                return Some(uid);
            }
        }
    }
    None
}

fn peer_allowed(stream: &UnixStream, expected: Option<u32>) -> bool {
    let Ok(cred) = stream.peer_cred() else {
        return false;
    };
    let uid = cred.uid();
    uid == 0 || expected.is_some_and(|e| e == uid)
}

/// Run the elevated server on `socket_path` until a Stop handshake.
///
/// Fatal unless the process already holds administrative rights; the
/// unprivileged entry points never reach this.
pub async fn run(socket_path: &Path) -> KubenestResult<()> {
    if !is_elevated() {
        return Err(KubenestError::NotElevated);
    }

    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)?;
    // The parent directory is user-private; widen the socket itself so the
    // unprivileged requester can connect to the root-owned node.
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o666))?;
    }
    let expected = expected_peer_uid();
    if expected.is_none() {
        tracing::warn!("no requesting uid in environment; only root peers will be served");
    }
    tracing::info!(socket = %socket_path.display(), "elevated server listening");

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _addr) = accepted?;
                if !peer_allowed(&stream, expected) {
                    tracing::warn!("rejecting peer with foreign credentials");
                    continue;
                }
                if let Err(err) = serve_connection(stream, &HostOps, shutdown_tx.clone()).await {
                    tracing::warn!(error = %err, "connection handler failed");
                }
            }
        }
    }

    let _ = std::fs::remove_file(socket_path);
    tracing::info!("elevated server stopped");
    Ok(())
}
