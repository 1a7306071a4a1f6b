//! UPnP IGD (Internet Gateway Device) client
//!
//! Discovery uses SSDP to find an IGD device on the local network; mapping
//! calls then go to the device over SOAP. `igd-next`'s blocking API does the
//! protocol work, so every call runs on the blocking pool and is bounded by
//! the client's call timeout.

use super::types::{ActiveMapping, GatewayError, IpProtocol};
use super::GatewayClient;
use crate::mapping::MappingSpec;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for UPnP operations
pub const UPNP_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on table entries read by `list_mappings`
const MAX_TABLE_ENTRIES: u32 = 256;

/// A discovered IGD device
#[derive(Debug, Clone)]
pub struct UpnpGateway {
    gateway: igd_next::Gateway,
}

impl UpnpGateway {
    /// Control endpoint of the device
    pub fn addr(&self) -> SocketAddr {
        self.gateway.addr
    }
}

/// [`GatewayClient`] over UPnP IGD
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpnpClient {
    call_timeout: Duration,
    lease_secs: u32,
}

impl Default for UpnpClient {
    fn default() -> Self {
        Self::new(UPNP_TIMEOUT, 0)
    }
}

impl UpnpClient {
    /// Create a client
    ///
    /// * `call_timeout` - bound on each create/delete/list call
    /// * `lease_secs` - lease requested for new mappings (0 = until removed)
    pub fn new(call_timeout: Duration, lease_secs: u32) -> Self {
        Self {
            call_timeout,
            lease_secs,
        }
    }

    /// Run a blocking igd-next call on the blocking pool, bounded by `limit`
    async fn blocking<T, F>(&self, op: &'static str, limit: Duration, f: F) -> Result<T, GatewayError>
    where
        F: FnOnce() -> Result<T, GatewayError> + Send + 'static,
        T: Send + 'static,
    {
        let task = tokio::task::spawn_blocking(f);
        match tokio::time::timeout(limit, task).await {
            Ok(joined) => {
                joined.map_err(|e| GatewayError::Internal(format!("Task join error: {}", e)))?
            }
            Err(_) => {
                warn!("UPnP {} timed out after {:?}", op, limit);
                Err(GatewayError::Timeout)
            }
        }
    }
}

/// Convert to the igd-next protocol enum
pub(crate) fn to_igd_protocol(protocol: IpProtocol) -> igd_next::PortMappingProtocol {
    match protocol {
        IpProtocol::TCP => igd_next::PortMappingProtocol::TCP,
        IpProtocol::UDP => igd_next::PortMappingProtocol::UDP,
    }
}

fn from_igd_protocol(protocol: igd_next::PortMappingProtocol) -> IpProtocol {
    match protocol {
        igd_next::PortMappingProtocol::TCP => IpProtocol::TCP,
        igd_next::PortMappingProtocol::UDP => IpProtocol::UDP,
    }
}

/// Local address the OS would use to send to `target`
///
/// Connecting a UDP socket sends nothing; it only makes the kernel pick a
/// route and with it a source address.
pub fn local_address_toward(target: SocketAddr) -> Result<IpAddr, GatewayError> {
    let bind_addr = match target {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };

    let socket = UdpSocket::bind(bind_addr)
        .map_err(|e| GatewayError::Internal(format!("Failed to create socket: {}", e)))?;

    socket
        .connect(target)
        .map_err(|e| GatewayError::Unreachable(format!("No route to {}: {}", target, e)))?;

    let local_addr = socket
        .local_addr()
        .map_err(|e| GatewayError::Internal(format!("Failed to get local address: {}", e)))?;

    Ok(local_addr.ip())
}

/// Transport failures mean the gateway is unreachable; anything else is a
/// refusal of this particular mapping
pub(crate) fn classify_add_error(error: igd_next::AddPortError) -> GatewayError {
    match error {
        igd_next::AddPortError::RequestError(e) => {
            GatewayError::Unreachable(format!("AddPortMapping failed: {}", e))
        }
        other => GatewayError::MappingRejected(format!("AddPortMapping failed: {}", other)),
    }
}

/// A mapping the gateway no longer has counts as removed
pub(crate) fn classify_remove_error(
    spec: &MappingSpec,
    error: igd_next::RemovePortError,
) -> Result<(), GatewayError> {
    match error {
        igd_next::RemovePortError::NoSuchPortMapping => {
            debug!("Mapping {} was already gone", spec);
            Ok(())
        }
        igd_next::RemovePortError::RequestError(e) => Err(GatewayError::Unreachable(format!(
            "DeletePortMapping failed: {}",
            e
        ))),
        other => Err(GatewayError::MappingRejected(format!(
            "DeletePortMapping failed: {}",
            other
        ))),
    }
}

/// Convert one row of the gateway's table; rows with an unparsable client are skipped
fn entry_to_mapping(entry: igd_next::PortMappingEntry) -> Option<ActiveMapping> {
    let local_address = match entry.internal_client.parse::<IpAddr>() {
        Ok(ip) => ip,
        Err(_) => {
            debug!(
                "Skipping table entry with internal client '{}'",
                entry.internal_client
            );
            return None;
        }
    };

    let spec = MappingSpec {
        protocol: from_igd_protocol(entry.protocol),
        local_address,
        local_port: entry.internal_port,
        public_port: entry.external_port,
    };

    Some(ActiveMapping::new(
        spec,
        entry.lease_duration,
        entry.port_mapping_description,
    ))
}

impl GatewayClient for UpnpClient {
    type Handle = UpnpGateway;

    async fn discover(&self, timeout: Duration) -> Result<Option<UpnpGateway>, GatewayError> {
        info!("Searching for UPnP IGD gateway (timeout: {:?})", timeout);

        let search = self.blocking("discovery", timeout + Duration::from_secs(1), move || {
            match igd_next::search_gateway(igd_next::SearchOptions {
                timeout: Some(timeout),
                ..Default::default()
            }) {
                Ok(gateway) => Ok(Some(gateway)),
                Err(e) => {
                    debug!("UPnP gateway search failed: {}", e);
                    Ok(None)
                }
            }
        });

        match search.await {
            Ok(Some(gateway)) => {
                info!("Found UPnP gateway at {}", gateway.addr);
                Ok(Some(UpnpGateway { gateway }))
            }
            Ok(None) | Err(GatewayError::Timeout) => {
                info!("No UPnP gateway answered");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn create_mapping(
        &self,
        handle: &UpnpGateway,
        spec: &MappingSpec,
    ) -> Result<ActiveMapping, GatewayError> {
        let gateway = handle.gateway.clone();
        let spec = *spec;
        let lease_secs = self.lease_secs;
        let description = spec.description();

        debug!("Adding port mapping: {} ({}s)", spec, lease_secs);

        let desc = description.clone();
        self.blocking("AddPortMapping", self.call_timeout, move || {
            gateway
                .add_port(
                    to_igd_protocol(spec.protocol),
                    spec.public_port,
                    spec.local_socket(),
                    lease_secs,
                    &desc,
                )
                .map_err(classify_add_error)
        })
        .await?;

        Ok(ActiveMapping::new(spec, lease_secs, description))
    }

    async fn delete_mapping(
        &self,
        handle: &UpnpGateway,
        spec: &MappingSpec,
    ) -> Result<(), GatewayError> {
        let gateway = handle.gateway.clone();
        let spec = *spec;

        debug!("Removing port mapping: {}", spec);

        self.blocking("DeletePortMapping", self.call_timeout, move || {
            gateway
                .remove_port(to_igd_protocol(spec.protocol), spec.public_port)
                .or_else(|e| classify_remove_error(&spec, e))
        })
        .await
    }

    async fn list_mappings(&self, handle: &UpnpGateway) -> Result<Vec<ActiveMapping>, GatewayError> {
        let gateway = handle.gateway.clone();

        self.blocking("GetGenericPortMappingEntry", self.call_timeout, move || {
            let mut mappings = Vec::new();
            for index in 0..MAX_TABLE_ENTRIES {
                match gateway.get_generic_port_mapping_entry(index) {
                    Ok(entry) => mappings.extend(entry_to_mapping(entry)),
                    // The table is read until the gateway reports an invalid index
                    Err(e) => {
                        debug!("Stopped reading mapping table at index {}: {}", index, e);
                        break;
                    }
                }
            }
            Ok(mappings)
        })
        .await
    }

    async fn resolve_local_address(&self, handle: &UpnpGateway) -> Result<IpAddr, GatewayError> {
        local_address_toward(handle.addr())
    }
}
