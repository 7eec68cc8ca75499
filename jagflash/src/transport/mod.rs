//! Line transport over a serial connection.
//!
//! [`LineReader`] turns the raw byte sub-streams of a [`Connection`] into
//! CRLF-delimited text lines. It survives recoverable line faults and
//! sub-stream ends by reopening the stream after a short pause, and it can
//! be shut down from any task through a [`StopHandle`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use jagflash::port::Connection;
//! use jagflash::transport::{LineReader, ReadResult};
//!
//! async fn dump<C: Connection>(port: C) -> jagflash::Result<()> {
//!     let mut reader = LineReader::new(port)?;
//!     reader.set_timeout(Duration::from_secs(5));
//!     while let ReadResult::Line(line) = reader.read().await? {
//!         println!("{line}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod lines;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, trace};
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::error::Result;
use crate::port::{ByteStream, Connection};

pub use lines::{LineDecoder, LineSplitter, Utf8Decoder};

/// Pause before a dropped sub-stream is reopened.
pub const REOPEN_DELAY: Duration = Duration::from_millis(1);

/// Outcome of [`LineReader::read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult {
    /// A complete, non-empty line without its delimiter.
    Line(String),
    /// The reader was stopped.
    Closed,
}

impl ReadResult {
    /// The line, if any.
    pub fn into_line(self) -> Option<String> {
        match self {
            Self::Line(line) => Some(line),
            Self::Closed => None,
        }
    }
}

struct Control {
    closing: watch::Sender<bool>,
    reading: watch::Sender<bool>,
    timer: Mutex<Option<AbortHandle>>,
}

impl Control {
    fn new() -> Self {
        Self {
            closing: watch::Sender::new(false),
            reading: watch::Sender::new(false),
            timer: Mutex::new(None),
        }
    }

    fn disarm(&self) -> Option<AbortHandle> {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn arm(&self, timer: AbortHandle) {
        let previous = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(timer);
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

/// Cloneable handle that stops a [`LineReader`] from another task.
#[derive(Clone)]
pub struct StopHandle {
    control: Arc<Control>,
}

impl StopHandle {
    /// Stop the reader.
    ///
    /// Cancels a pending timeout, marks the reader as closing and waits until
    /// any in-flight [`LineReader::read`] has returned. Idempotent.
    pub async fn stop(&self) {
        if let Some(timer) = self
            .control
            .disarm()
        {
            timer.abort();
        }
        self.control
            .closing
            .send_replace(true);

        let mut reading = self
            .control
            .reading
            .subscribe();
        // The sender lives in `control`, so this cannot fail.
        let _ = reading
            .wait_for(|busy| !*busy)
            .await;
    }

    /// Whether [`StopHandle::stop`] has been requested.
    pub fn is_closing(&self) -> bool {
        *self
            .control
            .closing
            .borrow()
    }
}

/// Clears the in-flight flag when a read finishes or is dropped.
struct ReadGuard<'a> {
    control: &'a Control,
}

impl<'a> ReadGuard<'a> {
    fn enter(control: &'a Control) -> Self {
        control
            .reading
            .send_replace(true);
        Self { control }
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.control
            .reading
            .send_replace(false);
    }
}

/// Reads CRLF-delimited lines from a connection.
pub struct LineReader<C: Connection> {
    connection: C,
    stream: Option<C::Stream>,
    decoder: LineDecoder,
    ready: VecDeque<String>,
    control: Arc<Control>,
}

impl<C: Connection> LineReader<C> {
    /// Create a reader and open its first sub-stream.
    ///
    /// Fails with [`Error::ReadableUnavailable`](crate::Error::ReadableUnavailable)
    /// when the connection has no readable side.
    pub fn new(connection: C) -> Result<Self> {
        let stream = connection.readable()?;
        Ok(Self {
            connection,
            stream: Some(stream),
            decoder: LineDecoder::new(),
            ready: VecDeque::new(),
            control: Arc::new(Control::new()),
        })
    }

    /// The underlying connection.
    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// Handle for stopping this reader from elsewhere.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            control: Arc::clone(&self.control),
        }
    }

    /// Whether the reader has been stopped.
    pub fn is_closing(&self) -> bool {
        *self
            .control
            .closing
            .borrow()
    }

    /// Stop the reader after `duration`. Replaces a previously armed timeout.
    pub fn set_timeout(&self, duration: Duration) {
        let handle = self.stop_handle();
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            debug!("Line reader timed out after {duration:?}");
            // Clear the slot first so `stop` does not abort this task.
            handle
                .control
                .disarm();
            handle
                .stop()
                .await;
        });
        self.control
            .arm(task.abort_handle());
    }

    /// Read the next non-empty line.
    ///
    /// Returns [`ReadResult::Closed`] once the reader is stopped. Recoverable
    /// faults and sub-stream ends reopen the stream; other errors propagate.
    pub async fn read(&mut self) -> Result<ReadResult> {
        let control = Arc::clone(&self.control);
        let _guard = ReadGuard::enter(&control);
        let mut closing = control
            .closing
            .subscribe();

        loop {
            if *closing.borrow_and_update() {
                self.release_stream()
                    .await;
                return Ok(ReadResult::Closed);
            }

            if let Some(line) = self
                .ready
                .pop_front()
            {
                if line.is_empty() {
                    continue;
                }
                return Ok(ReadResult::Line(line));
            }

            if self
                .stream
                .is_none()
            {
                self.stream = Some(
                    self.connection
                        .readable()?,
                );
            }
            let Some(stream) = self
                .stream
                .as_mut()
            else {
                continue;
            };

            let chunk = tokio::select! {
                biased;
                _ = closing.wait_for(|closing| *closing) => continue,
                chunk = stream.read_chunk() => chunk,
            };

            match chunk {
                Ok(Some(bytes)) => {
                    trace!("Read {} bytes", bytes.len());
                    let lines = self
                        .decoder
                        .feed(&bytes);
                    self.ready
                        .extend(lines);
                },
                Ok(None) => {
                    trace!("Sub-stream ended, reopening");
                    let residue = self
                        .decoder
                        .finish();
                    self.ready
                        .push_back(residue);
                    self.stream = None;
                    tokio::time::sleep(REOPEN_DELAY).await;
                },
                Err(e) if e.is_transient() => {
                    debug!("Recoverable read error: {e}");
                    self.release_stream()
                        .await;
                    tokio::time::sleep(REOPEN_DELAY).await;
                },
                Err(e) => {
                    self.release_stream()
                        .await;
                    return Err(e);
                },
            }
        }
    }

    /// Stop the reader and release its sub-stream.
    pub async fn stop(&mut self) {
        self.stop_handle()
            .stop()
            .await;
        self.release_stream()
            .await;
    }

    async fn release_stream(&mut self) {
        if let Some(mut stream) = self
            .stream
            .take()
        {
            if let Err(e) = stream
                .cancel()
                .await
            {
                trace!("Ignoring cancel error: {e}");
            }
        }
        self.decoder = LineDecoder::new();
    }
}

impl<C: Connection> Drop for LineReader<C> {
    fn drop(&mut self) {
        if let Some(timer) = self
            .control
            .disarm()
        {
            timer.abort();
        }
    }
}
