//! Wire protocol of the elevation channel.
//!
//! Line-delimited JSON, one tagged request per line, one tagged response
//! back. The surface is deliberately tiny: the two route-table mutations,
//! the hosts-file mutation, and the shutdown handshake.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ElevationRequest {
    AddRoute {
        destination: String,
        prefix: u8,
        gateway: String,
    },
    RemoveRoute {
        destination: String,
    },
    ConfigureDomains {
        machine: String,
        address: String,
        domains: Vec<String>,
        remove: bool,
    },
    Stop,
}

impl ElevationRequest {
    pub fn op_name(&self) -> &'static str {
        match self {
            ElevationRequest::AddRoute { .. } => "add_route",
            ElevationRequest::RemoveRoute { .. } => "remove_route",
            ElevationRequest::ConfigureDomains { .. } => "configure_domains",
            ElevationRequest::Stop => "stop",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ElevationResponse {
    Ack,
    Domains { domains: Vec<String> },
    Error { message: String },
}
