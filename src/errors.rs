//! Error types shared across the crate.

use thiserror::Error;

/// Result alias used throughout kubenest.
pub type KubenestResult<T> = std::result::Result<T, KubenestError>;

/// All errors produced by kubenest operations.
///
/// Low-level failures (I/O, command exits, parse errors) are wrapped with
/// the operation they occurred in at each layer boundary, so a top-level
/// message names the lifecycle step and target that failed.
#[derive(Error, Debug)]
pub enum KubenestError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("command `{command}` exited with code {code}: {output}")]
    Command {
        command: String,
        code: i32,
        output: String,
    },

    #[error("machine {machine}: {message}")]
    Machine { machine: String, message: String },

    #[error("image provisioning: {0}")]
    Image(String),

    #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
    Checksum {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("kubeconfig: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("settings: {0}")]
    Settings(String),

    #[error("cluster access: {0}")]
    Kube(String),

    #[error("cluster in unexpected state: {0}")]
    InvalidState(String),

    #[error("elevation: {0}")]
    Elevation(String),

    #[error("privileged operation {op} failed: {message}")]
    Rpc { op: &'static str, message: String },

    #[error("not running from an elevated process")]
    NotElevated,

    #[error("{failed} workload(s) in terminal state: {detail}")]
    WorkloadFailed { failed: usize, detail: String },

    #[error("timed out after {seconds}s waiting for {what}")]
    Timeout { what: String, seconds: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}
