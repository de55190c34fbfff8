//! Client-side privilege bridge.
//!
//! One bridge instance lives at the composition root and is handed to the
//! configuration paths that may need elevation. The elevated session is
//! created lazily on the first privileged call and at most once per process:
//! the state mutex is held across spawn-and-connect, so concurrent first
//! callers block on the in-flight attempt and share the resulting client.
//! After `stop`, further privileged calls are a programming error — the
//! bridge never silently respawns a peer.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::errors::{KubenestError, KubenestResult};

use super::channel::{self, ChannelEndpoint, ElevationClient};
use super::protocol::{ElevationRequest, ElevationResponse};

/// Spawns the elevated peer and establishes the channel to it. The real
/// launcher asks the platform for elevation; tests substitute an in-process
/// server to count spawns.
#[async_trait]
pub trait PeerLauncher: Send + Sync {
    async fn launch(&self, endpoint: &ChannelEndpoint) -> KubenestResult<ElevationClient>;
}

/// Launches the current executable through `pkexec` as
/// `<exe> configure elevate <socket-path>`.
pub struct PkexecLauncher;

#[async_trait]
impl PeerLauncher for PkexecLauncher {
    async fn launch(&self, endpoint: &ChannelEndpoint) -> KubenestResult<ElevationClient> {
        let exe = std::env::current_exe()?;
        tracing::info!(channel = %endpoint.id, "starting elevated server");

        let child = Command::new("pkexec")
            .arg(&exe)
            .arg("configure")
            .arg("elevate")
            .arg(&endpoint.path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                KubenestError::Elevation(format!("failed to run elevated server: {e}"))
            })?;

        channel::connect(endpoint, Some(child)).await
    }
}

enum BridgeState {
    NotStarted,
    Ready(ElevationClient),
    Stopped,
}

/// Process-wide singleton client for the privileged operations.
pub struct ElevationBridge {
    state: Mutex<BridgeState>,
    launcher: Box<dyn PeerLauncher>,
}

impl ElevationBridge {
    pub fn new(launcher: Box<dyn PeerLauncher>) -> Self {
        Self {
            state: Mutex::new(BridgeState::NotStarted),
            launcher,
        }
    }

    pub fn with_default_launcher() -> Self {
        Self::new(Box::new(PkexecLauncher))
    }

    /// Run one request against the session, establishing it first if this is
    /// the initial privileged call.
    async fn call(&self, request: ElevationRequest) -> KubenestResult<ElevationResponse> {
        let mut state = self.state.lock().await;
        loop {
            match &mut *state {
                BridgeState::Stopped => {
                    return Err(KubenestError::Internal(
                        "elevation bridge used after stop".into(),
                    ));
                }
                BridgeState::Ready(client) => return client.call(&request).await,
                BridgeState::NotStarted => {
                    let endpoint = channel::new_endpoint()?;
                    let client = self.launcher.launch(&endpoint).await.map_err(|e| {
                        KubenestError::Elevation(format!("while starting elevated server: {e}"))
                    })?;
                    *state = BridgeState::Ready(client);
                }
            }
        }
    }

    pub async fn add_route(
        &self,
        destination: &str,
        prefix: u8,
        gateway: &str,
    ) -> KubenestResult<()> {
        self.call(ElevationRequest::AddRoute {
            destination: destination.to_string(),
            prefix,
            gateway: gateway.to_string(),
        })
        .await?;
        Ok(())
    }

    pub async fn remove_route(&self, destination: &str) -> KubenestResult<()> {
        self.call(ElevationRequest::RemoveRoute {
            destination: destination.to_string(),
        })
        .await?;
        Ok(())
    }

    pub async fn configure_domains(
        &self,
        machine: &str,
        address: &str,
        domains: &[String],
        remove: bool,
    ) -> KubenestResult<Vec<String>> {
        let response = self
            .call(ElevationRequest::ConfigureDomains {
                machine: machine.to_string(),
                address: address.to_string(),
                domains: domains.to_vec(),
                remove,
            })
            .await?;
        match response {
            ElevationResponse::Domains { domains } => Ok(domains),
            other => Err(KubenestError::Internal(format!(
                "unexpected configure_domains response: {other:?}"
            ))),
        }
    }

    /// Orderly teardown: Stop handshake over the channel, then the session
    /// is gone for good. Idempotent; a bridge that never started just moves
    /// to stopped.
    pub async fn stop(&self) -> KubenestResult<()> {
        let mut state = self.state.lock().await;
        let previous = std::mem::replace(&mut *state, BridgeState::Stopped);
        match previous {
            BridgeState::Ready(mut client) => {
                client.call(&ElevationRequest::Stop).await?;
                tracing::info!("stopped elevated server");
                Ok(())
            }
            BridgeState::NotStarted | BridgeState::Stopped => Ok(()),
        }
    }

    /// Best-effort teardown for process exit: failures are logged, never
    /// propagated — the host process is exiting regardless.
    pub async fn shutdown(&self) {
        if let Err(err) = self.stop().await {
            tracing::warn!(error = %err, "error stopping elevated server");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elevation::server::{self, PrivilegedOps};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::{UnixListener, UnixStream};
    use tokio::sync::mpsc;

    /// Records privileged calls instead of touching the host.
    #[derive(Default)]
    struct RecordingOps {
        routes_added: AtomicUsize,
        domain_calls: AtomicUsize,
    }

    #[async_trait]
    impl PrivilegedOps for RecordingOps {
        async fn add_route(&self, _d: &str, _p: u8, _g: &str) -> KubenestResult<()> {
            self.routes_added.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn remove_route(&self, _d: &str) -> KubenestResult<()> {
            Ok(())
        }

        async fn configure_domains(
            &self,
            _machine: &str,
            _address: &str,
            domains: &[String],
            _remove: bool,
        ) -> KubenestResult<Vec<String>> {
            self.domain_calls.fetch_add(1, Ordering::SeqCst);
            Ok(domains.to_vec())
        }
    }

    /// Serves the real protocol loop in-process instead of spawning an
    /// elevated peer, counting how many peers were "spawned".
    struct InProcessLauncher {
        ops: Arc<RecordingOps>,
        launches: AtomicUsize,
    }

    impl InProcessLauncher {
        fn new(ops: Arc<RecordingOps>) -> Self {
            Self {
                ops,
                launches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PeerLauncher for InProcessLauncher {
        async fn launch(&self, endpoint: &ChannelEndpoint) -> KubenestResult<ElevationClient> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            let listener = UnixListener::bind(&endpoint.path)?;
            let ops = Arc::clone(&self.ops);
            tokio::spawn(async move {
                let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        accepted = listener.accept() => {
                            let Ok((stream, _)) = accepted else { break };
                            let _ = server::serve_connection(stream, ops.as_ref(), shutdown_tx.clone()).await;
                        }
                    }
                }
            });
            let stream = UnixStream::connect(&endpoint.path).await?;
            Ok(ElevationClient::from_stream(stream, None))
        }
    }

    fn bridge_with_recorder() -> (Arc<ElevationBridge>, Arc<RecordingOps>) {
        let ops = Arc::new(RecordingOps::default());
        let bridge = Arc::new(ElevationBridge::new(Box::new(InProcessLauncher::new(
            Arc::clone(&ops),
        ))));
        (bridge, ops)
    }

    #[tokio::test]
    async fn concurrent_first_calls_share_one_session() {
        let ops = Arc::new(RecordingOps::default());
        let launcher = Arc::new(InProcessLauncher::new(Arc::clone(&ops)));

        struct SharedLauncher(Arc<InProcessLauncher>);
        #[async_trait]
        impl PeerLauncher for SharedLauncher {
            async fn launch(&self, endpoint: &ChannelEndpoint) -> KubenestResult<ElevationClient> {
                self.0.launch(endpoint).await
            }
        }

        let bridge = Arc::new(ElevationBridge::new(Box::new(SharedLauncher(Arc::clone(
            &launcher,
        )))));
        let (a, b) = tokio::join!(
            {
                let bridge = Arc::clone(&bridge);
                async move { bridge.add_route("192.168.67.2", 32, "192.168.67.1").await }
            },
            {
                let bridge = Arc::clone(&bridge);
                async move { bridge.add_route("192.168.67.3", 32, "192.168.67.1").await }
            }
        );
        a.expect("first call");
        b.expect("second call");
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert_eq!(ops.routes_added.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn domains_round_trip_through_the_channel() {
        let (bridge, ops) = bridge_with_recorder();
        let domains = vec!["nest.local".to_string()];
        let result = bridge
            .configure_domains("nest", "192.168.67.2", &domains, false)
            .await
            .expect("domains");
        assert_eq!(result, domains);
        assert_eq!(ops.domain_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_acks_and_bars_further_calls() {
        let (bridge, _ops) = bridge_with_recorder();
        bridge
            .add_route("192.168.67.2", 32, "192.168.67.1")
            .await
            .expect("call");
        bridge.stop().await.expect("ack before teardown");

        let err = bridge
            .add_route("192.168.67.2", 32, "192.168.67.1")
            .await
            .unwrap_err();
        assert!(matches!(err, KubenestError::Internal(_)));

        // Stopping again stays quiet.
        bridge.stop().await.expect("idempotent stop");
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let (bridge, _ops) = bridge_with_recorder();
        bridge.stop().await.expect("no session to stop");
    }
}
