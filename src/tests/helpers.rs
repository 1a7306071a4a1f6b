//! Shared test helpers: an in-memory gateway and settings builders

use crate::config::{MappingConfig, Parameters, Settings};
use crate::coordinator::Timings;
use crate::gateway::{ActiveMapping, GatewayClient, GatewayError, IpProtocol};
use crate::mapping::MappingSpec;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Address the mock gateway reports for this host
pub const MOCK_LOCAL_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50));

#[derive(Default)]
struct MockState {
    table: Mutex<Vec<MappingSpec>>,
    snapshots: Mutex<Vec<Vec<MappingSpec>>>,
    discover_calls: AtomicUsize,
    create_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

/// Gateway whose mapping table lives in memory
#[derive(Clone)]
pub struct MockGateway {
    state: Arc<MockState>,
    device_present: bool,
    reject_index: Option<usize>,
    late_index: Option<usize>,
    failing_delete_ports: Vec<u16>,
    discover_delay: Duration,
    create_delay: Duration,
    delete_delay: Duration,
}

/// Handle returned by [`MockGateway::discover`]
pub struct MockHandle;

impl MockGateway {
    /// A gateway that answers discovery and accepts everything
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState::default()),
            device_present: true,
            reject_index: None,
            late_index: None,
            failing_delete_ports: Vec::new(),
            discover_delay: Duration::ZERO,
            create_delay: Duration::ZERO,
            delete_delay: Duration::ZERO,
        }
    }

    /// Discovery finds nothing
    pub fn without_device(mut self) -> Self {
        self.device_present = false;
        self
    }

    /// Reject the create call with this zero-based index
    pub fn rejecting_at(mut self, index: usize) -> Self {
        self.reject_index = Some(index);
        self
    }

    /// The create call with this index lands on the table but reports a timeout
    pub fn timing_out_at(mut self, index: usize) -> Self {
        self.late_index = Some(index);
        self
    }

    /// Deleting the mapping on this public port fails
    pub fn failing_delete_of(mut self, public_port: u16) -> Self {
        self.failing_delete_ports.push(public_port);
        self
    }

    pub fn with_discover_delay(mut self, delay: Duration) -> Self {
        self.discover_delay = delay;
        self
    }

    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    pub fn with_delete_delay(mut self, delay: Duration) -> Self {
        self.delete_delay = delay;
        self
    }

    /// Current mapping table
    pub fn table(&self) -> Vec<MappingSpec> {
        self.state.table.lock().unwrap().clone()
    }

    /// Table contents at each `list_mappings` call
    pub fn snapshots(&self) -> Vec<Vec<MappingSpec>> {
        self.state.snapshots.lock().unwrap().clone()
    }

    pub fn discover_calls(&self) -> usize {
        self.state.discover_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.state.create_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.state.delete_calls.load(Ordering::SeqCst)
    }
}

impl GatewayClient for MockGateway {
    type Handle = MockHandle;

    async fn discover(&self, _timeout: Duration) -> Result<Option<MockHandle>, GatewayError> {
        self.state.discover_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.discover_delay).await;
        Ok(self.device_present.then_some(MockHandle))
    }

    async fn create_mapping(
        &self,
        _handle: &MockHandle,
        spec: &MappingSpec,
    ) -> Result<ActiveMapping, GatewayError> {
        let index = self.state.create_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.create_delay).await;

        if self.reject_index == Some(index) {
            return Err(GatewayError::MappingRejected(format!(
                "ConflictInMappingEntry for public port {}",
                spec.public_port
            )));
        }

        let mut table = self.state.table.lock().unwrap();
        table.retain(|existing| !existing.same_slot(spec));
        table.push(*spec);
        if self.late_index == Some(index) {
            return Err(GatewayError::Timeout);
        }
        Ok(ActiveMapping::new(*spec, 0, spec.description()))
    }

    async fn delete_mapping(&self, _handle: &MockHandle, spec: &MappingSpec) -> Result<(), GatewayError> {
        self.state.delete_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delete_delay).await;

        if self.failing_delete_ports.contains(&spec.public_port) {
            return Err(GatewayError::Unreachable("connection reset".to_string()));
        }

        self.state
            .table
            .lock()
            .unwrap()
            .retain(|existing| !existing.same_slot(spec));
        Ok(())
    }

    async fn list_mappings(&self, _handle: &MockHandle) -> Result<Vec<ActiveMapping>, GatewayError> {
        let table = self.table();
        self.state.snapshots.lock().unwrap().push(table.clone());
        Ok(table
            .into_iter()
            .map(|spec| ActiveMapping::new(spec, 0, spec.description()))
            .collect())
    }

    async fn resolve_local_address(&self, _handle: &MockHandle) -> Result<IpAddr, GatewayError> {
        Ok(MOCK_LOCAL_ADDRESS)
    }
}

/// A mapping entry without an explicit local address
pub fn mapping(protocol: IpProtocol, local_port: u16, public_port: u16) -> MappingConfig {
    MappingConfig {
        protocol,
        local_address: None,
        local_port,
        public_port,
    }
}

/// Settings launching `program` with `args` in `dir`
pub fn launch_settings(
    mappings: Vec<MappingConfig>,
    program: &str,
    args: &[&str],
    dir: &Path,
) -> Settings {
    let mut settings = Settings {
        mappings,
        ..Settings::default()
    };
    settings.executable.file = Some(program.to_string());
    settings.executable.working_directory = Some(dir.to_path_buf());
    settings.executable.parameters = Some(Parameters::List(
        args.iter().map(|a| a.to_string()).collect(),
    ));
    settings
}

/// Settings in no-launch mode
pub fn no_launch_settings(mappings: Vec<MappingConfig>) -> Settings {
    Settings {
        mappings,
        no_launch_mode: true,
        ..Settings::default()
    }
}

/// Short time bounds for tests
pub fn fast_timings(grace: Duration, hold: Duration) -> Timings {
    Timings {
        discovery_timeout: Duration::from_secs(1),
        shutdown_grace: grace,
        no_launch_hold: hold,
    }
}
