//! Elevated peer channel establishment.
//!
//! The channel is a Unix socket with a freshly generated unguessable name
//! inside a user-private runtime directory. The peer process does not exist
//! when the client starts connecting, so connection races its startup: a
//! short grace period, then bounded-interval retries with no overall
//! deadline (the peer may be parked on a human-interactive authorization
//! prompt). A peer that dies before the channel comes up turns the race
//! into a fatal spawn error.

use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;
use rand::distr::Alphanumeric;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::process::Child;

use crate::errors::{KubenestError, KubenestResult};

use super::protocol::{ElevationRequest, ElevationResponse};

/// 62^16 ≈ 95 bits of entropy.
const CHANNEL_ID_LEN: usize = 16;
/// Time given to the peer to begin listening before the first attempt.
const CONNECT_GRACE: Duration = Duration::from_secs(2);
/// Backoff between connection attempts.
const CONNECT_BACKOFF: Duration = Duration::from_millis(200);

/// A named rendezvous point for one elevation session.
#[derive(Debug, Clone)]
pub struct ChannelEndpoint {
    pub id: String,
    pub path: PathBuf,
}

fn channel_dir() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("kubenest")
}

/// Create a fresh endpoint. The socket directory is created user-private
/// (0700) so no other local user can reach the channel; the identifier is
/// never reused across sessions.
pub fn new_endpoint() -> KubenestResult<ChannelEndpoint> {
    let id: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(CHANNEL_ID_LEN)
        .map(char::from)
        .collect();

    let dir = channel_dir();
    match std::fs::DirBuilder::new().mode(0o700).create(&dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
        }
        Err(e) => return Err(e.into()),
    }

    let path = dir.join(format!("elev-{id}.sock"));
    Ok(ChannelEndpoint { id, path })
}

/// Client end of an established elevation session. Owns the peer process
/// handle; requests are strictly sequential over the single duplex stream.
pub struct ElevationClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer: Option<Child>,
}

impl ElevationClient {
    pub(crate) fn from_stream(stream: UnixStream, peer: Option<Child>) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            peer,
        }
    }

    /// Send one request and wait for its response. A server-reported error
    /// is surfaced as a failed privileged operation carrying the op name.
    pub async fn call(&mut self, request: &ElevationRequest) -> KubenestResult<ElevationResponse> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;

        let mut response_line = String::new();
        let read = self.reader.read_line(&mut response_line).await?;
        if read == 0 {
            return Err(KubenestError::Elevation(format!(
                "channel closed while waiting for {} response",
                request.op_name()
            )));
        }
        let response: ElevationResponse = serde_json::from_str(&response_line)?;
        match response {
            ElevationResponse::Error { message } => Err(KubenestError::Rpc {
                op: request.op_name(),
                message,
            }),
            other => Ok(other),
        }
    }
}

/// Connect to the peer listening (or about to listen) on `endpoint`.
///
/// Retries indefinitely; callers wanting a bound layer their own deadline
/// around the whole bridge call. When a `peer` handle is given, its early
/// exit — authorization declined, policy denial, crash — aborts the loop
/// with a fatal error.
pub async fn connect(
    endpoint: &ChannelEndpoint,
    mut peer: Option<Child>,
) -> KubenestResult<ElevationClient> {
    tokio::time::sleep(CONNECT_GRACE).await;
    loop {
        if let Some(child) = peer.as_mut() {
            if let Some(status) = child.try_wait()? {
                return Err(KubenestError::Elevation(format!(
                    "elevated peer exited before the channel connected ({status}); \
                     was the authorization prompt declined?"
                )));
            }
        }
        match UnixStream::connect(&endpoint.path).await {
            Ok(stream) => {
                tracing::info!(channel = %endpoint.id, "connected to elevated peer");
                return Ok(ElevationClient::from_stream(stream, peer));
            }
            Err(_) => tokio::time::sleep(CONNECT_BACKOFF).await,
        }
    }
}

impl Drop for ElevationClient {
    fn drop(&mut self) {
        // The peer exits through the Stop handshake; the handle is only kept
        // so an abandoned session doesn't leave a zombie entry.
        if let Some(peer) = self.peer.as_mut() {
            let _ = peer.try_wait();
        }
    }
}
