//! Gateway module for port mapping on a NAT device
//!
//! [`GatewayClient`] is the capability the coordinator depends on: discover a
//! device, then create, delete and list entries in its port-mapping table.
//! [`UpnpClient`] implements it over UPnP IGD.

pub mod types;
pub mod upnp;

use crate::mapping::MappingSpec;
use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;

pub use types::{ActiveMapping, GatewayError, IpProtocol};
pub use upnp::{UpnpClient, UpnpGateway};

/// Port-mapping capability of a NAT gateway
///
/// Calls are request/response; the only state is the handle returned from
/// [`GatewayClient::discover`], which the caller owns and passes back in.
pub trait GatewayClient: Send + Sync {
    /// Opaque reference to a discovered device
    type Handle: Send + Sync;

    /// Search the local network for a port-mapping device
    ///
    /// Returns `Ok(None)` when nothing answered within `timeout`. When several
    /// devices answer, the first responder wins.
    fn discover(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<Self::Handle>, GatewayError>> + Send;

    /// Create (or refresh) a mapping
    fn create_mapping(
        &self,
        handle: &Self::Handle,
        spec: &MappingSpec,
    ) -> impl Future<Output = Result<ActiveMapping, GatewayError>> + Send;

    /// Remove a mapping; a mapping that is already gone counts as removed
    fn delete_mapping(
        &self,
        handle: &Self::Handle,
        spec: &MappingSpec,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send;

    /// Read the gateway's mapping table (diagnostics only)
    fn list_mappings(
        &self,
        handle: &Self::Handle,
    ) -> impl Future<Output = Result<Vec<ActiveMapping>, GatewayError>> + Send;

    /// Address of this host on the route toward the gateway
    fn resolve_local_address(
        &self,
        handle: &Self::Handle,
    ) -> impl Future<Output = Result<IpAddr, GatewayError>> + Send;
}
