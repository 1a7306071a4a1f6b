//! Common types for the gateway module

use crate::mapping::MappingSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// IP protocol numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum IpProtocol {
    /// TCP protocol
    #[serde(alias = "tcp", alias = "Tcp")]
    TCP = 6,
    /// UDP protocol
    #[serde(alias = "udp", alias = "Udp")]
    UDP = 17,
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpProtocol::TCP => write!(f, "TCP"),
            IpProtocol::UDP => write!(f, "UDP"),
        }
    }
}

impl FromStr for IpProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(IpProtocol::TCP),
            "udp" => Ok(IpProtocol::UDP),
            other => Err(format!("unknown protocol '{}' (expected tcp or udp)", other)),
        }
    }
}

/// A mapping currently held by the gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveMapping {
    /// The spec that produced this mapping
    pub spec: MappingSpec,
    /// Lease reported or requested; `None` means it lasts until removed
    pub lease: Option<Duration>,
    /// Description stored on the gateway
    pub description: String,
    /// When this process observed the mapping being created
    pub created_at: DateTime<Utc>,
}

impl ActiveMapping {
    /// Build from a spec and the lease the gateway was asked for
    pub fn new(spec: MappingSpec, lease_secs: u32, description: String) -> Self {
        Self {
            spec,
            lease: (lease_secs > 0).then(|| Duration::from_secs(u64::from(lease_secs))),
            description,
            created_at: Utc::now(),
        }
    }

    /// When the lease runs out, if it does
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let lease = chrono::Duration::from_std(self.lease?).ok()?;
        Some(self.created_at + lease)
    }
}

impl fmt::Display for ActiveMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.spec)?;
        match self.lease {
            Some(lease) => write!(f, " lease: {}s", lease.as_secs()),
            None => write!(f, " lease: permanent"),
        }
    }
}

/// Errors that can occur talking to a gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Gateway did not answer within the call timeout
    #[error("Gateway request timed out")]
    Timeout,

    /// Gateway could not be reached or answered garbage
    #[error("Gateway unreachable: {0}")]
    Unreachable(String),

    /// Gateway refused a specific mapping (conflict, unsupported protocol)
    #[error("Mapping rejected: {0}")]
    MappingRejected(String),

    /// IO error during communication
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
