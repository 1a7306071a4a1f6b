//! Mapping set
//!
//! Turns the configured mapping entries into the concrete specs handed to the
//! gateway client. Entries without a local address are pinned to the address
//! this host uses to reach the gateway.

use crate::config::MappingConfig;
use crate::gateway::IpProtocol;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Description prefix stored on the gateway alongside each mapping
pub const DESCRIPTION_PREFIX: &str = "portforwarded";

/// One public-to-private port mapping, fully resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MappingSpec {
    /// Transport protocol
    pub protocol: IpProtocol,
    /// Address of the host receiving forwarded traffic
    pub local_address: IpAddr,
    /// Port on the local host
    pub local_port: u16,
    /// Port opened on the gateway's public side
    pub public_port: u16,
}

impl MappingSpec {
    /// Socket address the gateway forwards to
    pub fn local_socket(&self) -> SocketAddr {
        SocketAddr::new(self.local_address, self.local_port)
    }

    /// Gateways key their table by public port and protocol
    pub fn same_slot(&self, other: &MappingSpec) -> bool {
        self.protocol == other.protocol && self.public_port == other.public_port
    }

    /// Description written to the gateway for this mapping
    pub fn description(&self) -> String {
        format!(
            "{} ({}->{})",
            DESCRIPTION_PREFIX, self.local_port, self.public_port
        )
    }
}

impl fmt::Display for MappingSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (local port: {}, public port: {})",
            self.protocol, self.local_address, self.local_port, self.public_port
        )
    }
}

/// Build the mapping set from configuration
///
/// `gateway_local_address` fills entries that do not name a local address.
/// Fails with [`Error::ConfigInvalid`] when there is nothing to map.
pub fn build_mappings(
    entries: &[MappingConfig],
    gateway_local_address: IpAddr,
) -> Result<Vec<MappingSpec>> {
    if entries.is_empty() {
        return Err(Error::ConfigInvalid(
            "Missing mapping configuration, needed for port forwarding".to_string(),
        ));
    }

    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            if entry.local_port == 0 || entry.public_port == 0 {
                return Err(Error::ConfigInvalid(format!(
                    "Mapping #{} has a zero port (ports must be 1-65535)",
                    index
                )));
            }
            Ok(MappingSpec {
                protocol: entry.protocol,
                local_address: entry.local_address.unwrap_or(gateway_local_address),
                local_port: entry.local_port,
                public_port: entry.public_port,
            })
        })
        .collect()
}
