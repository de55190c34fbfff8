//! Host route to the cluster address.
//!
//! The machine gets a stable address on its NAT network; reaching it from
//! the host needs a /32 route via the NAT gateway. The current routing is
//! probed first (unprivileged), so adding an existing route or removing an
//! absent one never touches the table at all — both directions stay
//! idempotent without an elevation round trip.

use std::process::Stdio;

use tokio::process::Command;

use crate::elevation::{self, ElevationBridge};
use crate::errors::KubenestResult;
use crate::machine::{self, MachinePlatform};

/// Cluster addresses are routed host-by-host.
pub const HOST_PREFIX: u8 = 32;

/// Gateway of the host's current route to `address`, if any.
async fn host_route_via(address: &str) -> KubenestResult<Option<String>> {
    let output = Command::new("ip")
        .args(["route", "get", address])
        .stdin(Stdio::null())
        .output()
        .await?;
    if !output.status.success() {
        // Unroutable destination; not an error for our purposes.
        return Ok(None);
    }
    Ok(parse_route_via(&String::from_utf8_lossy(&output.stdout)))
}

pub(crate) fn parse_route_via(output: &str) -> Option<String> {
    let mut parts = output.split_whitespace();
    while let Some(token) = parts.next() {
        if token == "via" {
            return parts.next().map(str::to_string);
        }
    }
    None
}

/// Ensure (or tear down) the host route to the cluster address.
///
/// Already-elevated processes mutate the table in-process with the same
/// commands the elevated peer runs; everything else goes through the bridge.
pub async fn route_to_machine(
    platform: &dyn MachinePlatform,
    bridge: &ElevationBridge,
    name: &str,
    address: &str,
    remove: bool,
) -> KubenestResult<()> {
    let gateway = machine::nat_gateway_address(platform, name).await?;
    let elevated = elevation::is_elevated();
    let via = host_route_via(address).await?;
    let routed = via.as_deref() == Some(gateway.as_str());

    if routed && !remove {
        tracing::info!(address, gateway = %gateway, "route already exists");
        return Ok(());
    }
    if !routed && remove {
        tracing::info!(address, gateway = %gateway, "route does not exist");
        return Ok(());
    }

    tracing::info!(machine = %name, address, gateway = %gateway, elevated, remove, "updating host route");
    use crate::elevation::server::{HostOps, PrivilegedOps};
    if elevated {
        if remove {
            HostOps.remove_route(address).await
        } else {
            HostOps.add_route(address, HOST_PREFIX, &gateway).await
        }
    } else if remove {
        bridge.remove_route(address).await
    } else {
        bridge.add_route(address, HOST_PREFIX, &gateway).await
    }
}
