//! Scripted in-memory connection for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, LineFault, Result};
use crate::port::{ByteStream, Connection, Signals};

/// Route `log` output through the test harness; repeat calls are no-ops.
pub(crate) fn init_logger() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Trace)
        .is_test(true)
        .try_init();
}

/// One step of a scripted sub-stream.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    /// Deliver these bytes.
    Data(Vec<u8>),
    /// Fail with a recoverable line fault.
    Fault(LineFault),
    /// Fail with a non-recoverable error.
    Fatal,
    /// Wait before the next step.
    Delay(Duration),
    /// Never produce anything again.
    Hang,
}

#[derive(Default)]
struct State {
    streams: VecDeque<Vec<Step>>,
    open: bool,
    fail_open: bool,
    signals: Vec<Signals>,
    written: Vec<u8>,
    opens: usize,
    closes: usize,
    readables: usize,
    cancels: usize,
    cancel_delay: Duration,
}

/// In-memory [`Connection`] that replays scripted sub-streams.
///
/// Each call to [`Connection::readable`] takes the next script; once the
/// scripts run out the returned stream hangs until cancelled.
#[derive(Clone, Default)]
pub(crate) struct MockPort {
    state: Arc<Mutex<State>>,
}

impl MockPort {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue a sub-stream script.
    pub(crate) fn push_stream(&self, steps: Vec<Step>) -> &Self {
        self.state
            .lock()
            .unwrap()
            .streams
            .push_back(steps);
        self
    }

    /// Queue a sub-stream delivering the given text chunks and then ending.
    pub(crate) fn push_text(&self, chunks: &[&str]) -> &Self {
        self.push_stream(
            chunks
                .iter()
                .map(|c| Step::Data(c.as_bytes().to_vec()))
                .collect(),
        )
    }

    pub(crate) fn fail_open(&self) {
        self.state
            .lock()
            .unwrap()
            .fail_open = true;
    }

    pub(crate) fn set_cancel_delay(&self, delay: Duration) {
        self.state
            .lock()
            .unwrap()
            .cancel_delay = delay;
    }

    pub(crate) fn signals(&self) -> Vec<Signals> {
        self.state
            .lock()
            .unwrap()
            .signals
            .clone()
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        self.state
            .lock()
            .unwrap()
            .written
            .clone()
    }

    pub(crate) fn opens(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .opens
    }

    pub(crate) fn closes(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .closes
    }

    pub(crate) fn readables(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .readables
    }

    pub(crate) fn cancels(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .cancels
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .open
    }
}

impl Connection for MockPort {
    type Stream = MockStream;

    fn name(&self) -> &str {
        "mock"
    }

    async fn open(&self, _baud_rate: u32) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .unwrap();
        if state.fail_open {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "access denied",
            )));
        }
        state.opens += 1;
        if state.open {
            return Err(Error::PortAlreadyOpen);
        }
        state.open = true;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .unwrap();
        state.closes += 1;
        if !state.open {
            return Err(Error::PortAlreadyClosed);
        }
        state.open = false;
        Ok(())
    }

    async fn set_signals(&self, signals: Signals) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .signals
            .push(signals);
        Ok(())
    }

    fn readable(&self) -> Result<MockStream> {
        let mut state = self
            .state
            .lock()
            .unwrap();
        state.readables += 1;
        let steps = state
            .streams
            .pop_front()
            .unwrap_or_else(|| vec![Step::Hang]);
        Ok(MockStream {
            steps: steps.into(),
            port: self.clone(),
        })
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .written
            .extend_from_slice(data);
        Ok(())
    }
}

pub(crate) struct MockStream {
    steps: VecDeque<Step>,
    port: MockPort,
}

impl ByteStream for MockStream {
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self
                .steps
                .pop_front()
            {
                None => return Ok(None),
                Some(Step::Data(bytes)) => return Ok(Some(bytes)),
                Some(Step::Fault(fault)) => return Err(Error::LineFault(fault)),
                Some(Step::Fatal) => {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "device lost",
                    )));
                },
                Some(Step::Delay(delay)) => tokio::time::sleep(delay).await,
                Some(Step::Hang) => std::future::pending::<()>().await,
            }
        }
    }

    async fn cancel(&mut self) -> Result<()> {
        let delay = {
            let mut state = self
                .port
                .state
                .lock()
                .unwrap();
            state.cancels += 1;
            state.cancel_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.steps
            .clear();
        Ok(())
    }
}
