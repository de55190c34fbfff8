//! Privilege elevation bridge.
//!
//! Route-table and hosts-file mutations need administrative rights the CLI
//! usually doesn't have. Instead of asking users to run everything as root,
//! the first privileged operation spawns this same executable as an elevated
//! peer (`configure elevate <socket-path>`) and delegates to it over an
//! authenticated, freshly named Unix socket:
//!
//! - `channel`: endpoint naming, spawn/connect race, request framing
//! - `bridge`: lazy singleton client with the NotStarted→Ready→Stopped
//!   state machine
//! - `server`: the elevated peer's accept loop and operation handlers
//! - `protocol`: the four request/response pairs
//!
//! Callers that already hold administrative rights bypass the bridge
//! entirely and perform the operations in-process; the branch lives at the
//! call sites, never in here.

pub mod bridge;
pub mod channel;
pub mod protocol;
pub mod server;

pub use bridge::{ElevationBridge, PeerLauncher, PkexecLauncher};
pub use channel::{ChannelEndpoint, ElevationClient};
pub use protocol::{ElevationRequest, ElevationResponse};

/// Whether the current process holds administrative rights.
pub fn is_elevated() -> bool {
    // Safety: geteuid has no failure modes.
    unsafe { libc::geteuid() == 0 }
}
