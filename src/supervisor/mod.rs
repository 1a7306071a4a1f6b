//! Process supervisor
//!
//! Launches the configured program, streams its stdout and stderr into the
//! [`OutputSink`] line by line, and stops it on request: first a close request
//! to its process group, then a kill once the grace period is over.
//!
//! State machine: `Running -> Exited(code)` on natural exit, and
//! `Running -> Terminating -> Exited(code)` when stopped.

pub mod sink;

use crate::{Error, Result};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use sink::{OutputLine, OutputSink, SinkTask, Stream};

/// Bound on draining the output readers after the process is gone
///
/// A grandchild that inherited the pipes can keep them open after the
/// supervised process has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Longest line forwarded in one piece; longer output is split at this size
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// What to launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Program name (looked up on `PATH`) or path; relative paths with a
    /// separator are taken relative to the working directory
    pub program: String,
    /// Directory the program runs in
    pub working_directory: PathBuf,
    /// Program arguments
    pub args: Vec<String>,
}

impl LaunchSpec {
    fn resolved_program(&self) -> PathBuf {
        let program = Path::new(&self.program);
        if program.is_relative() && program.components().count() > 1 {
            self.working_directory.join(program)
        } else {
            program.to_path_buf()
        }
    }
}

/// Lifecycle of the supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Started, not yet asked to stop
    Running,
    /// Close requested, waiting for exit
    Terminating,
    /// Exited; `None` when ended by a signal
    Exited(Option<i32>),
}

/// Handle to the supervised child process
pub struct ProcessSupervisor {
    child: Child,
    pid: Option<u32>,
    state: ProcessState,
    status: Option<ExitStatus>,
    readers: Vec<JoinHandle<()>>,
    kill_sent: bool,
}

impl ProcessSupervisor {
    /// Launch the program and start streaming its output
    ///
    /// Fails with [`Error::LaunchFailed`] when the working directory does not
    /// exist or the program cannot be executed.
    pub fn start(spec: &LaunchSpec, sink: &OutputSink) -> Result<Self> {
        if !spec.working_directory.is_dir() {
            return Err(Error::LaunchFailed(format!(
                "Working directory {} does not exist",
                spec.working_directory.display()
            )));
        }

        let program = spec.resolved_program();
        info!("Launching process {}", program.display());
        if !spec.args.is_empty() {
            info!("Using parameters: {}", spec.args.join(" "));
        }

        let mut command = Command::new(&program);
        command
            .args(&spec.args)
            .current_dir(&spec.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group: terminal interrupts reach only the supervisor,
        // and the whole group can be signalled at once
        #[cfg(unix)]
        {
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|e| {
            Error::LaunchFailed(format!("Failed to launch {}: {}", program.display(), e))
        })?;

        let pid = child.id();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, Stream::Stdout, sink.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, Stream::Stderr, sink.clone()));
        }

        info!("Process started (pid: {:?})", pid);

        Ok(Self {
            child,
            pid,
            state: ProcessState::Running,
            status: None,
            readers,
            kill_sent: false,
        })
    }

    /// OS process id, while known
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current lifecycle state
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Wait for the process to exit on its own
    pub async fn wait_for_exit(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.record_exit(status);
        Ok(status)
    }

    /// Stop the process, killing it if it outlives `grace`
    ///
    /// No-op returning the recorded status once the process has exited.
    pub async fn terminate(&mut self, grace: Duration) -> Result<ExitStatus> {
        self.terminate_with(grace, std::future::pending::<()>()).await
    }

    /// Like [`ProcessSupervisor::terminate`], but `escalate` completing
    /// before the grace period ends forces the kill immediately
    pub async fn terminate_with<F>(&mut self, grace: Duration, escalate: F) -> Result<ExitStatus>
    where
        F: Future<Output = ()>,
    {
        if let Some(status) = self.status {
            debug!("Process already exited, nothing to terminate");
            return Ok(status);
        }

        self.state = ProcessState::Terminating;
        info!(
            "Asking process {:?} to close (grace period: {:?})",
            self.pid, grace
        );
        self.request_close();

        let exited = tokio::select! {
            waited = tokio::time::timeout(grace, self.child.wait()) => waited.ok(),
            _ = escalate => {
                warn!("Interrupted again, killing process without waiting");
                None
            }
        };

        let status = match exited {
            Some(status) => status?,
            None => {
                self.force_kill();
                self.child.wait().await?
            }
        };
        self.record_exit(status);
        Ok(status)
    }

    /// Release the process after draining both output streams
    pub async fn finish(mut self) {
        for mut reader in self.readers.drain(..) {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut reader).await.is_err() {
                debug!("Output stream still open after process exit, detaching reader");
                reader.abort();
            }
        }
    }

    fn record_exit(&mut self, status: ExitStatus) {
        self.status = Some(status);
        self.state = ProcessState::Exited(status.code());
        match status.code() {
            Some(code) => info!("Process exited with code {}", code),
            None => info!("Process exited by signal ({})", status),
        }
    }

    /// Ask the process group to close
    fn request_close(&mut self) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                signal_group(pid, nix::sys::signal::Signal::SIGTERM);
                return;
            }
        }
        // No close request available, fall through to a kill
        self.force_kill();
    }

    /// Kill the process group, at most once
    fn force_kill(&mut self) {
        if self.kill_sent {
            return;
        }
        self.kill_sent = true;
        warn!("Killing process {:?}", self.pid);

        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                signal_group(pid, nix::sys::signal::Signal::SIGKILL);
            }
        }

        if let Err(e) = self.child.start_kill() {
            debug!("Kill failed (process probably gone): {}", e);
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(raw), signal) {
        // ESRCH: group already gone
        debug!("Failed to send {:?} to process group {}: {}", signal, pid, e);
    }
}

/// Forward one pipe into the sink until it closes
///
/// Lines longer than [`MAX_LINE_BYTES`] are forwarded in pieces.
fn spawn_reader<R>(reader: R, stream: Stream, sink: OutputSink) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut sink_open = true;

        loop {
            buf.clear();
            let mut limited = (&mut reader).take(MAX_LINE_BYTES as u64);
            match limited.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    while matches!(buf.last(), Some(b'\n' | b'\r')) {
                        buf.pop();
                    }
                    // Keep draining after the consumer is gone so the child never blocks
                    if sink_open {
                        let line = String::from_utf8_lossy(&buf).into_owned();
                        sink_open = sink.send(stream, line).await;
                    }
                }
                Err(e) => {
                    warn!("Failed reading process {}: {}", stream, e);
                    break;
                }
            }
        }
    })
}
