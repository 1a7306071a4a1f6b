//! Child output sink
//!
//! Both stream readers push lines into one bounded channel; a single consumer
//! writes them out, so lines from stdout and stderr never interleave within a
//! line. A full channel makes the readers wait, which in turn makes the child
//! block on its pipe instead of growing a buffer.

use std::fmt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Lines buffered between the readers and the consumer
pub const SINK_CAPACITY: usize = 256;

/// Which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Stdout => write!(f, "stdout"),
            Stream::Stderr => write!(f, "stderr"),
        }
    }
}

/// One line of child output, without its line terminator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    /// Source pipe
    pub stream: Stream,
    /// Line text (lossily decoded)
    pub line: String,
}

/// Producer side of the sink, cloned into each stream reader
#[derive(Debug, Clone)]
pub struct OutputSink {
    tx: mpsc::Sender<OutputLine>,
}

/// Consumer task writing lines to the log
#[derive(Debug)]
pub struct SinkTask {
    handle: JoinHandle<()>,
}

impl SinkTask {
    /// Wait until every line sent before the last sender dropped is written
    pub async fn flushed(self) {
        let _ = self.handle.await;
    }
}

impl OutputSink {
    /// Sink that forwards each line to the log, tagged by stream
    ///
    /// Must be called inside a tokio runtime.
    pub fn to_log() -> (Self, SinkTask) {
        let (sink, mut rx) = Self::channel(SINK_CAPACITY);
        let handle = tokio::spawn(async move {
            while let Some(OutputLine { stream, line }) = rx.recv().await {
                match stream {
                    Stream::Stdout => info!(stream = %stream, "{}", line),
                    Stream::Stderr => warn!(stream = %stream, "{}", line),
                }
            }
        });
        (sink, SinkTask { handle })
    }

    /// Sink whose lines are handed to the caller
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutputLine>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Deliver a line, waiting for room; false once the consumer is gone
    pub async fn send(&self, stream: Stream, line: String) -> bool {
        self.tx.send(OutputLine { stream, line }).await.is_ok()
    }
}
