//! kubenest - single-node Kubernetes clusters in lightweight container
//! machines.
//!
//! The CLI registers a published root filesystem as a `machinectl` machine,
//! boots the in-machine supervisor that brings up Kubernetes, and keeps the
//! host wired to it (route to the cluster address, hosts-file domains,
//! merged kubeconfig).
//!
//! ## Architecture
//!
//! - `cluster`: lifecycle state machine, status classification, readiness
//!   polling
//! - `machine`: the container-machine platform behind a narrow trait
//! - `elevation`: delegation of privileged host mutations to a separately
//!   spawned elevated peer over an authenticated Unix socket
//! - `hostcfg`: route/hosts/bootstrap configuration on both sides of the
//!   privilege boundary
//! - `image`: root filesystem download and checksum tracking
//! - `kube`: kubeconfig management and workload observation via kubectl
//! - `cli`, `settings`, `logging`: the thin outer shell

pub mod cli;
pub mod cluster;
pub mod elevation;
pub mod errors;
pub mod hostcfg;
pub mod image;
pub mod kube;
pub mod logging;
pub mod machine;
pub mod settings;

pub use errors::{KubenestError, KubenestResult};
