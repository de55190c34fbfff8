//! Lifecycle status classification.

use crate::errors::KubenestResult;
use crate::machine::{MachinePlatform, MachineState};

/// Lifecycle status of the cluster, derived from live platform state on
/// every query. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterStatus {
    /// Classification failed; callers must treat this as an inconsistency,
    /// never as any of the other states.
    Undefined,
    Uninstalled,
    Installed,
    Started,
}

impl std::fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ClusterStatus::Undefined => "undefined",
            ClusterStatus::Uninstalled => "uninstalled",
            ClusterStatus::Installed => "installed",
            ClusterStatus::Started => "started",
        };
        f.write_str(label)
    }
}

/// Classify a raw registration/running observation.
pub fn classify(registered: bool, running: bool) -> ClusterStatus {
    match (registered, running) {
        (false, _) => ClusterStatus::Uninstalled,
        (true, false) => ClusterStatus::Installed,
        (true, true) => ClusterStatus::Started,
    }
}

/// Query the platform and classify the machine's current status.
///
/// A failing state query on a registered machine yields `Undefined` rather
/// than guessing between installed and started.
pub async fn cluster_status(
    platform: &dyn MachinePlatform,
    name: &str,
) -> KubenestResult<ClusterStatus> {
    if !platform.is_registered(name).await? {
        return Ok(ClusterStatus::Uninstalled);
    }
    match platform.state(name).await {
        Ok(state) => Ok(classify(true, state == MachineState::Running)),
        Err(err) => {
            tracing::warn!(machine = %name, error = %err, "couldn't query machine state");
            Ok(ClusterStatus::Undefined)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_is_uninstalled_regardless_of_running() {
        assert_eq!(classify(false, false), ClusterStatus::Uninstalled);
        assert_eq!(classify(false, true), ClusterStatus::Uninstalled);
    }

    #[test]
    fn registered_not_running_is_installed() {
        assert_eq!(classify(true, false), ClusterStatus::Installed);
    }

    #[test]
    fn registered_and_running_is_started() {
        assert_eq!(classify(true, true), ClusterStatus::Started);
    }
}
