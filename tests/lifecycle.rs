//! Lifecycle round-trip against an in-memory platform.
//!
//! Drives install → start → stop → uninstall through the real lifecycle
//! driver, with every external collaborator replaced by a double, and
//! checks the observed status after each transition.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use kubenest::cluster::{
    ClusterStatus, CredentialsStore, HostConfigurator, ImageProvisioner, Lifecycle,
};
use kubenest::errors::{KubenestError, KubenestResult};
use kubenest::machine::{MachinePlatform, MachineState};

#[derive(Default)]
struct FakeMachineState {
    registered: bool,
    running: bool,
}

/// Platform double: registration and run state live in memory; the start
/// and stop bootstrap commands flip the running flag.
#[derive(Default)]
struct FakePlatform {
    state: Mutex<FakeMachineState>,
    fail_start: bool,
}

#[async_trait]
impl MachinePlatform for FakePlatform {
    async fn is_registered(&self, _name: &str) -> KubenestResult<bool> {
        Ok(self.state.lock().unwrap().registered)
    }

    async fn state(&self, _name: &str) -> KubenestResult<MachineState> {
        let state = self.state.lock().unwrap();
        Ok(if state.running {
            MachineState::Running
        } else {
            MachineState::Stopped
        })
    }

    async fn register(&self, name: &str, image: &Path, _dir: &Path) -> KubenestResult<()> {
        assert!(image.to_string_lossy().contains("rootfs"), "unexpected image path");
        let mut state = self.state.lock().unwrap();
        if state.registered {
            return Err(KubenestError::Machine {
                machine: name.into(),
                message: "already registered".into(),
            });
        }
        state.registered = true;
        Ok(())
    }

    async fn terminate(&self, _name: &str) -> KubenestResult<()> {
        self.state.lock().unwrap().running = false;
        Ok(())
    }

    async fn unregister(&self, name: &str) -> KubenestResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.registered {
            return Err(KubenestError::Machine {
                machine: name.into(),
                message: "not registered".into(),
            });
        }
        state.registered = false;
        Ok(())
    }

    async fn command(&self, _name: &str, _argv: &[&str]) -> KubenestResult<String> {
        Ok(String::new())
    }

    async fn launch_and_pipe(&self, name: &str, command: &str, _task: &str) -> KubenestResult<i32> {
        let mut state = self.state.lock().unwrap();
        if !state.registered {
            return Err(KubenestError::Machine {
                machine: name.into(),
                message: "not registered".into(),
            });
        }
        if command.contains("start") {
            if self.fail_start {
                return Ok(1);
            }
            state.running = true;
        } else if command.contains("stop") {
            state.running = false;
        }
        Ok(0)
    }

    async fn write_file(
        &self,
        _name: &str,
        _dest: &str,
        _content: &[u8],
        _followup: &[&str],
    ) -> KubenestResult<()> {
        Ok(())
    }
}

#[derive(Default)]
struct FakeImages {
    removals: AtomicUsize,
}

#[async_trait]
impl ImageProvisioner for FakeImages {
    async fn ensure_image(&self) -> KubenestResult<PathBuf> {
        Ok(PathBuf::from("/tmp/fake/rootfs.tar.gz"))
    }

    fn machine_dir(&self, name: &str) -> KubenestResult<PathBuf> {
        Ok(PathBuf::from("/tmp/fake").join(name))
    }

    fn remove_state(&self, _name: &str) -> KubenestResult<()> {
        self.removals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct FakeConfigurator {
    applied: AtomicUsize,
}

#[async_trait]
impl HostConfigurator for FakeConfigurator {
    async fn apply(&self, _name: &str) -> KubenestResult<()> {
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct FakeCredentials {
    merged: AtomicUsize,
    removed: AtomicUsize,
}

#[async_trait]
impl CredentialsStore for FakeCredentials {
    async fn merge(&self, _name: &str) -> KubenestResult<()> {
        self.merged.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, _name: &str) -> KubenestResult<()> {
        self.removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Fixture {
    platform: FakePlatform,
    images: FakeImages,
    configurator: FakeConfigurator,
    credentials: FakeCredentials,
}

impl Fixture {
    fn new() -> Self {
        Self {
            platform: FakePlatform::default(),
            images: FakeImages::default(),
            configurator: FakeConfigurator::default(),
            credentials: FakeCredentials::default(),
        }
    }

    fn lifecycle(&self) -> Lifecycle<'_> {
        Lifecycle {
            platform: &self.platform,
            images: &self.images,
            configurator: &self.configurator,
            credentials: &self.credentials,
        }
    }
}

const NAME: &str = "nest";

#[tokio::test]
async fn full_round_trip_walks_every_status() {
    let fixture = Fixture::new();
    let lifecycle = fixture.lifecycle();

    assert_eq!(lifecycle.status(NAME).await.unwrap(), ClusterStatus::Uninstalled);

    lifecycle.install(NAME).await.expect("install");
    assert_eq!(lifecycle.status(NAME).await.unwrap(), ClusterStatus::Installed);
    assert_eq!(fixture.configurator.applied.load(Ordering::SeqCst), 1);

    lifecycle.start(NAME, "info").await.expect("start");
    assert_eq!(lifecycle.status(NAME).await.unwrap(), ClusterStatus::Started);
    assert_eq!(fixture.credentials.merged.load(Ordering::SeqCst), 1);

    lifecycle.stop(NAME).await.expect("stop");
    assert_eq!(lifecycle.status(NAME).await.unwrap(), ClusterStatus::Installed);

    lifecycle.uninstall(NAME).await.expect("uninstall");
    assert_eq!(lifecycle.status(NAME).await.unwrap(), ClusterStatus::Uninstalled);
    assert_eq!(fixture.credentials.removed.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.images.removals.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn start_installs_first_when_uninstalled() {
    let fixture = Fixture::new();
    let lifecycle = fixture.lifecycle();

    lifecycle.start(NAME, "info").await.expect("start from scratch");
    assert_eq!(lifecycle.status(NAME).await.unwrap(), ClusterStatus::Started);
    assert_eq!(fixture.configurator.applied.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn start_is_a_no_op_when_already_started() {
    let fixture = Fixture::new();
    let lifecycle = fixture.lifecycle();
    lifecycle.start(NAME, "info").await.expect("first start");
    assert_eq!(fixture.credentials.merged.load(Ordering::SeqCst), 1);

    lifecycle.start(NAME, "info").await.expect("second start");
    // No second boot, no second merge.
    assert_eq!(fixture.credentials.merged.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn install_refuses_non_uninstalled_status() {
    let fixture = Fixture::new();
    let lifecycle = fixture.lifecycle();
    lifecycle.install(NAME).await.expect("install");

    let err = lifecycle.install(NAME).await.unwrap_err();
    assert!(matches!(err, KubenestError::InvalidState(_)));
}

#[tokio::test]
async fn stop_requires_started() {
    let fixture = Fixture::new();
    let lifecycle = fixture.lifecycle();
    lifecycle.install(NAME).await.expect("install");

    let err = lifecycle.stop(NAME).await.unwrap_err();
    assert!(matches!(err, KubenestError::InvalidState(_)));
}

#[tokio::test]
async fn failed_boot_command_is_fatal() {
    let fixture = Fixture {
        platform: FakePlatform {
            fail_start: true,
            ..FakePlatform::default()
        },
        ..Fixture::new()
    };
    let lifecycle = fixture.lifecycle();

    let err = lifecycle.start(NAME, "info").await.unwrap_err();
    assert!(matches!(err, KubenestError::Command { code: 1, .. }));
    // Credentials are only merged after a successful boot.
    assert_eq!(fixture.credentials.merged.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn uninstall_is_idempotent() {
    let fixture = Fixture::new();
    let lifecycle = fixture.lifecycle();

    lifecycle.uninstall(NAME).await.expect("uninstall of nothing");
    lifecycle.install(NAME).await.expect("install");
    lifecycle.uninstall(NAME).await.expect("uninstall");
    lifecycle.uninstall(NAME).await.expect("uninstall again");
}
