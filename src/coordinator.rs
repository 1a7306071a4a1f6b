//! Lifecycle coordinator
//!
//! Drives one run through
//! `Initializing -> MappingUp -> Running -> TearingDown -> Stopped`, or into
//! `Failed(reason)`. Whatever ends the run, every mapping this run created is
//! deleted before the final report, and a launched process is stopped before
//! its mappings go away.
//!
//! Interrupts arrive through the run's [`Cancellation`]:
//! - during discovery: the run fails as interrupted, nothing to tear down
//! - during mapping setup: the in-flight call is abandoned and the mappings
//!   created so far (plus the in-flight one) are deleted
//! - while running: the process gets a close request and the grace period;
//!   a second interrupt inside the grace period kills it immediately
//! - during teardown: logged and ignored

use crate::cancel::Cancellation;
use crate::config::Settings;
use crate::gateway::{GatewayClient, GatewayError};
use crate::mapping::{build_mappings, MappingSpec};
use crate::supervisor::{OutputSink, ProcessSupervisor, SinkTask};
use std::fmt;
use std::process::ExitStatus;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Why a run ended in `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Settings missing or malformed
    ConfigInvalid,
    /// Discovery found no gateway
    NoGateway,
    /// Gateway refused a mapping
    MappingRejected,
    /// Executable or working directory unusable
    LaunchFailed,
    /// Child exited unsuccessfully (`None`: killed by a signal)
    ChildFailed(Option<i32>),
    /// Operator interrupt before the run reached `Running`
    Interrupted,
    /// Anything else that stopped the run
    Internal,
}

/// Run state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Validating settings and discovering the gateway
    Initializing,
    /// Creating mappings
    MappingUp,
    /// Mappings up, process running (or holding in no-launch mode)
    Running,
    /// Deleting mappings
    TearingDown,
    /// Finished cleanly
    Stopped,
    /// Finished with a failure
    Failed(FailureReason),
}

impl RunState {
    /// Whether the run is over
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Stopped | RunState::Failed(_))
    }
}

/// Process-level outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Clean shutdown
    Clean,
    /// Unexpected failure during the run
    Unhandled,
    /// Settings missing or malformed
    ConfigInvalid,
    /// No gateway found
    NoGateway,
    /// Gateway refused a mapping
    MappingRejected,
    /// Executable or working directory unusable
    LaunchFailed,
    /// Child exited unsuccessfully
    ChildFailed,
    /// Interrupted before the process could run
    Interrupted,
}

impl ExitReason {
    /// Exit code reported to the OS
    pub fn code(self) -> u8 {
        match self {
            ExitReason::Clean => 0,
            ExitReason::Unhandled => 1,
            ExitReason::ConfigInvalid => 2,
            ExitReason::NoGateway => 3,
            ExitReason::MappingRejected => 4,
            ExitReason::LaunchFailed => 5,
            ExitReason::ChildFailed => 6,
            ExitReason::Interrupted => 130,
        }
    }

    fn from_state(state: RunState) -> Self {
        match state {
            RunState::Stopped => ExitReason::Clean,
            RunState::Failed(FailureReason::ConfigInvalid) => ExitReason::ConfigInvalid,
            RunState::Failed(FailureReason::NoGateway) => ExitReason::NoGateway,
            RunState::Failed(FailureReason::MappingRejected) => ExitReason::MappingRejected,
            RunState::Failed(FailureReason::LaunchFailed) => ExitReason::LaunchFailed,
            RunState::Failed(FailureReason::ChildFailed(_)) => ExitReason::ChildFailed,
            RunState::Failed(FailureReason::Interrupted) => ExitReason::Interrupted,
            _ => ExitReason::Unhandled,
        }
    }
}

/// A deletion that failed during teardown
#[derive(Debug, Clone, PartialEq)]
pub struct TeardownFailure {
    /// Mapping left on the gateway
    pub spec: MappingSpec,
    /// Gateway error text
    pub error: String,
}

/// Terminal summary of a run
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// Terminal state (`Stopped` or `Failed`)
    pub state: RunState,
    /// Exit classification
    pub exit: ExitReason,
    /// Human-readable reason
    pub message: String,
    /// Whether a process was launched
    pub launched: bool,
    /// Child exit code, when a child ran and exited with one
    pub child_exit_code: Option<i32>,
    /// Deletions that failed; reported, never fatal
    pub teardown_failures: Vec<TeardownFailure>,
}

impl RunReport {
    /// Exit code reported to the OS
    pub fn exit_code(&self) -> u8 {
        self.exit.code()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (exit code {})", self.message, self.exit_code())?;
        if !self.teardown_failures.is_empty() {
            write!(
                f,
                ", {} mapping(s) could not be removed",
                self.teardown_failures.len()
            )?;
        }
        Ok(())
    }
}

/// Time bounds for one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Bound on gateway discovery
    pub discovery_timeout: Duration,
    /// Close request to kill
    pub shutdown_grace: Duration,
    /// Hold interval in no-launch mode
    pub no_launch_hold: Duration,
}

impl From<&Settings> for Timings {
    fn from(settings: &Settings) -> Self {
        Self {
            discovery_timeout: settings.discovery_timeout(),
            shutdown_grace: settings.shutdown_grace(),
            no_launch_hold: settings.no_launch_hold(),
        }
    }
}

/// Everything one run owns, passed to each stage
struct RunContext<H> {
    state: RunState,
    handle: Option<H>,
    mappings: Vec<MappingSpec>,
    /// Specs this run may have created on the gateway, in creation order
    owned: Vec<MappingSpec>,
    cancel: Cancellation,
    launched: bool,
    child_exit_code: Option<i32>,
    teardown_failures: Vec<TeardownFailure>,
}

impl<H> RunContext<H> {
    fn new(cancel: Cancellation) -> Self {
        Self {
            state: RunState::Initializing,
            handle: None,
            mappings: Vec::new(),
            owned: Vec::new(),
            cancel,
            launched: false,
            child_exit_code: None,
            teardown_failures: Vec::new(),
        }
    }
}

/// Move the state machine forward; terminal states are final
fn transition(state: &mut RunState, next: RunState) {
    if state.is_terminal() {
        warn!("Ignoring transition {:?} -> {:?}", state, next);
        return;
    }
    info!("Run state {:?} -> {:?}", state, next);
    *state = next;
}

/// How the running phase ended
enum RunOutcome {
    Clean(String),
    Failed(FailureReason, String),
}

/// Coordinates discovery, mappings, the child process and teardown
pub struct Coordinator<C: GatewayClient> {
    client: C,
    settings: Settings,
    timings: Timings,
    sink: Option<OutputSink>,
}

impl<C: GatewayClient> Coordinator<C> {
    /// Create a coordinator; timings come from `settings`
    pub fn new(client: C, settings: Settings) -> Self {
        let timings = Timings::from(&settings);
        Self {
            client,
            settings,
            timings,
            sink: None,
        }
    }

    /// Override the time bounds
    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    /// Send child output to `sink` instead of the log
    pub fn with_output(mut self, sink: OutputSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Execute one run to its terminal state
    pub async fn run(self, cancel: Cancellation) -> RunReport {
        let Coordinator {
            client,
            settings,
            timings,
            sink,
        } = self;

        let (sink, sink_task): (OutputSink, Option<SinkTask>) = match sink {
            Some(sink) => (sink, None),
            None => {
                let (sink, task) = OutputSink::to_log();
                (sink, Some(task))
            }
        };

        let stages = Stages {
            client: &client,
            settings: &settings,
            timings,
            sink: &sink,
        };
        let mut ctx = RunContext::new(cancel);
        let report = stages.execute(&mut ctx).await;

        // All child output is written before the final report
        drop(sink);
        if let Some(task) = sink_task {
            task.flushed().await;
        }

        if report.exit == ExitReason::Clean {
            info!("Run finished: {}", report);
        } else {
            error!("Run failed: {}", report);
        }
        report
    }
}

/// Borrowed view of the coordinator used by the run stages
struct Stages<'a, C: GatewayClient> {
    client: &'a C,
    settings: &'a Settings,
    timings: Timings,
    sink: &'a OutputSink,
}

impl<C: GatewayClient> Stages<'_, C> {
    async fn execute(&self, ctx: &mut RunContext<C::Handle>) -> RunReport {
        // Initializing: no network access until the settings are usable
        if let Err(problems) = self.settings.validate() {
            error!("Configuration not valid, reasons stated below:");
            for problem in &problems {
                error!("{}", problem);
            }
            return self.finish(
                ctx,
                RunState::Failed(FailureReason::ConfigInvalid),
                format!("Configuration invalid: {}", problems.join("; ")),
            );
        }

        if let Err((reason, message)) = self.discover(ctx).await {
            return self.finish(ctx, RunState::Failed(reason), message);
        }

        let outcome = match self.set_up(ctx).await {
            Ok(()) => self.run_workload(ctx).await,
            Err((reason, message)) => RunOutcome::Failed(reason, message),
        };

        self.tear_down(ctx).await;

        match outcome {
            RunOutcome::Clean(message) => self.finish(ctx, RunState::Stopped, message),
            RunOutcome::Failed(reason, message) => {
                self.finish(ctx, RunState::Failed(reason), message)
            }
        }
    }

    /// Find the gateway; the run owns the handle from here on
    async fn discover(
        &self,
        ctx: &mut RunContext<C::Handle>,
    ) -> Result<(), (FailureReason, String)> {
        info!("Discovering port-mapping gateway");

        let discovered = tokio::select! {
            found = self.client.discover(self.timings.discovery_timeout) => Some(found),
            _ = ctx.cancel.next() => None,
        };

        match discovered {
            None => {
                warn!("Interrupted during gateway discovery");
                Err((
                    FailureReason::Interrupted,
                    "Interrupted during gateway discovery".to_string(),
                ))
            }
            Some(Ok(Some(handle))) => {
                info!("Gateway found");
                ctx.handle = Some(handle);
                Ok(())
            }
            Some(Ok(None)) => {
                error!("No UPnP device found, exiting.");
                Err((FailureReason::NoGateway, "No gateway found".to_string()))
            }
            Some(Err(e)) => {
                error!("Gateway discovery failed: {}", e);
                Err((
                    FailureReason::NoGateway,
                    format!("Gateway discovery failed: {}", e),
                ))
            }
        }
    }

    /// Build the mapping set and create every mapping, compensating on failure
    async fn set_up(&self, ctx: &mut RunContext<C::Handle>) -> Result<(), (FailureReason, String)> {
        let Some(handle) = ctx.handle.as_ref() else {
            return Err((FailureReason::Internal, "No gateway handle".to_string()));
        };

        let needs_local = self.settings.mappings.iter().any(|m| m.local_address.is_none());
        let local_address = if needs_local {
            match self.client.resolve_local_address(handle).await {
                Ok(ip) => {
                    info!("Local address toward gateway: {}", ip);
                    ip
                }
                Err(e) => {
                    error!("Could not resolve the local address: {}", e);
                    return Err((
                        FailureReason::Internal,
                        format!("Could not resolve the local address: {}", e),
                    ));
                }
            }
        } else {
            std::net::Ipv4Addr::UNSPECIFIED.into()
        };

        ctx.mappings = match build_mappings(&self.settings.mappings, local_address) {
            Ok(mappings) => mappings,
            Err(e) => return Err((FailureReason::ConfigInvalid, e.to_string())),
        };

        transition(&mut ctx.state, RunState::MappingUp);
        info!("Setting up port forwarding");

        let mappings = ctx.mappings.clone();
        for spec in &mappings {
            let created = tokio::select! {
                created = self.client.create_mapping(handle, spec) => Some(created),
                _ = ctx.cancel.next() => None,
            };

            match created {
                Some(Ok(active)) => {
                    info!("Created map for {}", active);
                    ctx.owned.push(*spec);
                }
                Some(Err(e)) => {
                    // A timed-out request may still land on the gateway; a
                    // rejected slot may belong to someone else and is left alone
                    if matches!(e, GatewayError::Timeout) {
                        ctx.owned.push(*spec);
                    }
                    error!("Failed to create map for {}: {}", spec, e);
                    return Err((
                        FailureReason::MappingRejected,
                        format!("Mapping {} rejected: {}", spec, e),
                    ));
                }
                None => {
                    // The abandoned request may still land on the gateway
                    warn!("Interrupted while creating map for {}", spec);
                    ctx.owned.push(*spec);
                    return Err((
                        FailureReason::Interrupted,
                        "Interrupted during mapping setup".to_string(),
                    ));
                }
            }
        }

        self.log_current_mappings(handle).await;
        Ok(())
    }

    /// Run the process (or hold in no-launch mode) until exit or interrupt
    async fn run_workload(&self, ctx: &mut RunContext<C::Handle>) -> RunOutcome {
        transition(&mut ctx.state, RunState::Running);

        if ctx.cancel.pending() > 0 {
            ctx.cancel.absorb();
            warn!("Interrupted before launch");
            return RunOutcome::Failed(
                FailureReason::Interrupted,
                "Interrupted before launch".to_string(),
            );
        }

        let Some(launch) = self.settings.launch_spec() else {
            return self.hold_without_launch(ctx).await;
        };

        let mut process = match ProcessSupervisor::start(&launch, self.sink) {
            Ok(process) => process,
            Err(e) => {
                error!("{}", e);
                return RunOutcome::Failed(FailureReason::LaunchFailed, e.to_string());
            }
        };
        ctx.launched = true;

        let exited = tokio::select! {
            status = process.wait_for_exit() => Some(status),
            _ = ctx.cancel.next() => None,
        };

        let outcome = match exited {
            Some(Ok(status)) => {
                ctx.child_exit_code = status.code();
                child_outcome(status)
            }
            Some(Err(e)) => {
                error!("Waiting for the process failed: {}", e);
                RunOutcome::Failed(
                    FailureReason::Internal,
                    format!("Waiting for the process failed: {}", e),
                )
            }
            None => {
                info!("Interrupt received, stopping process");
                let grace = self.timings.shutdown_grace;
                match process.terminate_with(grace, ctx.cancel.next()).await {
                    Ok(status) => {
                        ctx.child_exit_code = status.code();
                        RunOutcome::Clean("Stopped by operator interrupt".to_string())
                    }
                    Err(e) => {
                        error!("Stopping the process failed: {}", e);
                        RunOutcome::Failed(
                            FailureReason::Internal,
                            format!("Stopping the process failed: {}", e),
                        )
                    }
                }
            }
        };

        process.finish().await;
        outcome
    }

    /// No-launch mode: keep the mappings up for the hold interval
    async fn hold_without_launch(&self, ctx: &mut RunContext<C::Handle>) -> RunOutcome {
        let hold = self.timings.no_launch_hold;
        info!("Running in no-launch mode, skipping process launch ({:?} hold)", hold);

        let elapsed = tokio::select! {
            _ = tokio::time::sleep(hold) => true,
            _ = ctx.cancel.next() => false,
        };

        if elapsed {
            info!("No-launch hold elapsed");
            RunOutcome::Clean("No-launch hold elapsed".to_string())
        } else {
            info!("Interrupt received, ending no-launch hold");
            RunOutcome::Clean("Interrupted during no-launch hold".to_string())
        }
    }

    /// Delete every owned mapping; failures are collected, never fatal
    async fn tear_down(&self, ctx: &mut RunContext<C::Handle>) {
        let Some(handle) = ctx.handle.as_ref() else {
            return;
        };

        transition(&mut ctx.state, RunState::TearingDown);
        info!("Tearing down port forwarding");

        let owned = std::mem::take(&mut ctx.owned);
        for spec in &owned {
            match self.client.delete_mapping(handle, spec).await {
                Ok(()) => info!("Removed map for {}", spec),
                Err(e) => {
                    warn!("Failed to remove map for {}: {}", spec, e);
                    ctx.teardown_failures.push(TeardownFailure {
                        spec: *spec,
                        error: e.to_string(),
                    });
                }
            }
        }

        let ignored = ctx.cancel.absorb();
        if ignored > 0 {
            info!("Ignored {} interrupt(s) received during teardown", ignored);
        }

        self.log_current_mappings(handle).await;
        info!("Teardown complete");
    }

    async fn log_current_mappings(&self, handle: &C::Handle) {
        match self.client.list_mappings(handle).await {
            Ok(mappings) => {
                info!("Currently mapped ports and IP addresses");
                for mapping in &mappings {
                    match mapping.expires_at() {
                        Some(expiry) => info!("Map: {} Expiration: {}", mapping.spec, expiry),
                        None => info!("Map: {} Expiration: never", mapping.spec),
                    }
                }
            }
            Err(e) => debug!("Could not read the mapping table: {}", e),
        }
    }

    fn finish(&self, ctx: &mut RunContext<C::Handle>, terminal: RunState, message: String) -> RunReport {
        transition(&mut ctx.state, terminal);
        RunReport {
            state: ctx.state,
            exit: ExitReason::from_state(ctx.state),
            message,
            launched: ctx.launched,
            child_exit_code: ctx.child_exit_code,
            teardown_failures: std::mem::take(&mut ctx.teardown_failures),
        }
    }
}

fn child_outcome(status: ExitStatus) -> RunOutcome {
    if status.success() {
        RunOutcome::Clean("Process exited successfully".to_string())
    } else {
        let message = match status.code() {
            Some(code) => format!("Process exited with code {}", code),
            None => format!("Process terminated abnormally ({})", status),
        };
        RunOutcome::Failed(FailureReason::ChildFailed(status.code()), message)
    }
}
