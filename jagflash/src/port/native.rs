//! Native serial port implementation using the `serialport` crate.
//!
//! `serialport` is blocking, so every readable sub-stream owns a reader
//! thread on a cloned handle that forwards chunks into a tokio channel.

use {
    crate::{
        error::{Error, Result},
        port::{ByteStream, Connection, PortEnumerator, PortInfo, SerialConfig, Signals},
    },
    log::{debug, trace},
    std::{
        io::{self, Read, Write},
        sync::{
            Arc, Mutex, MutexGuard, PoisonError,
            atomic::{AtomicBool, Ordering},
        },
        thread,
        time::Duration,
    },
    tokio::sync::mpsc,
};

/// Capacity of the chunk channel between reader thread and stream.
const CHUNK_QUEUE: usize = 64;

/// Size of a single blocking read.
const READ_BUFFER: usize = 1024;

type BoxedPort = Box<dyn serialport::SerialPort>;

struct Shared {
    name: String,
    timeout: Duration,
    port: Mutex<Option<BoxedPort>>,
}

/// Native serial port connection.
///
/// The handle is created closed; [`Connection::open`] opens the device.
#[derive(Clone)]
pub struct NativePort {
    shared: Arc<Shared>,
}

impl NativePort {
    /// Create a closed handle for the configured port.
    pub fn new(config: &SerialConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: config
                    .port_name
                    .clone(),
                timeout: config.timeout,
                port: Mutex::new(None),
            }),
        }
    }

    /// Create a closed handle with default settings.
    pub fn with_name(port_name: &str) -> Self {
        Self::new(&SerialConfig::new(port_name, super::ROM_BAUD))
    }

    /// Whether the port is currently open.
    pub fn is_open(&self) -> bool {
        self.lock()
            .is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<BoxedPort>> {
        self.shared
            .port
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn with_port<T>(&self, f: impl FnOnce(&mut BoxedPort) -> Result<T>) -> Result<T> {
        let mut guard = self.lock();
        let port = guard
            .as_mut()
            .ok_or_else(|| Error::Io(io::Error::new(io::ErrorKind::NotConnected, "port closed")))?;
        f(port)
    }
}

impl Connection for NativePort {
    type Stream = NativeStream;

    fn name(&self) -> &str {
        &self
            .shared
            .name
    }

    async fn open(&self, baud_rate: u32) -> Result<()> {
        let mut guard = self.lock();
        if guard.is_some() {
            return Err(Error::PortAlreadyOpen);
        }
        debug!("Opening {} at {baud_rate} baud", self.shared.name);
        let port = serialport::new(&self.shared.name, baud_rate)
            .timeout(self.shared.timeout)
            .open()?;
        *guard = Some(port);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        match self
            .lock()
            .take()
        {
            Some(_) => {
                debug!("Closed {}", self.shared.name);
                Ok(())
            },
            None => Err(Error::PortAlreadyClosed),
        }
    }

    async fn set_signals(&self, signals: Signals) -> Result<()> {
        self.with_port(|port| {
            if let Some(level) = signals.data_terminal_ready {
                trace!("Setting DTR to {level}");
                port.write_data_terminal_ready(level)?;
            }
            if let Some(level) = signals.request_to_send {
                trace!("Setting RTS to {level}");
                port.write_request_to_send(level)?;
            }
            Ok(())
        })
    }

    fn readable(&self) -> Result<NativeStream> {
        let reader = {
            let guard = self.lock();
            let port = guard
                .as_ref()
                .ok_or(Error::ReadableUnavailable)?;
            port.try_clone()?
        };
        Ok(NativeStream::spawn(reader))
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        self.with_port(|port| {
            port.write_all(data)?;
            port.flush()?;
            Ok(())
        })
    }
}

/// Readable sub-stream backed by a reader thread.
pub struct NativeStream {
    rx: mpsc::Receiver<Result<Vec<u8>>>,
    stop: Arc<AtomicBool>,
}

impl NativeStream {
    fn spawn(mut reader: BoxedPort) -> Self {
        let (tx, rx) = mpsc::channel(CHUNK_QUEUE);
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        thread::spawn(move || {
            let mut buf = [0u8; READ_BUFFER];
            while !flag.load(Ordering::Relaxed) {
                match reader.read(&mut buf) {
                    Ok(0) => {},
                    Ok(n) => {
                        if tx
                            .blocking_send(Ok(buf[..n].to_vec()))
                            .is_err()
                        {
                            break;
                        }
                    },
                    Err(e) => {
                        if let Some(err) = read_failure(e) {
                            let _ = tx.blocking_send(Err(err));
                            break;
                        }
                    },
                }
            }
            trace!("Reader thread finished");
        });

        Self { rx, stop }
    }
}

/// Error to end the sub-stream with, or `None` when the read is retried.
///
/// `serialport` keeps parity and framing errors in-band (no abort-on-error,
/// `IGNPAR`), so only timeouts and interrupted reads are recoverable here.
fn read_failure(e: io::Error) -> Option<Error> {
    let err = Error::Io(e);
    if err.is_transient() {
        None
    } else {
        Some(err)
    }
}

impl ByteStream for NativeStream {
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        self.rx
            .recv()
            .await
            .transpose()
    }

    async fn cancel(&mut self) -> Result<()> {
        self.stop
            .store(true, Ordering::Relaxed);
        self.rx
            .close();
        Ok(())
    }
}

impl Drop for NativeStream {
    fn drop(&mut self) {
        self.stop
            .store(true, Ordering::Relaxed);
    }
}

/// Native port enumerator.
pub struct NativePortEnumerator;

impl PortEnumerator for NativePortEnumerator {
    fn list_ports() -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports().map_err(Error::Serial)?;

        Ok(ports
            .into_iter()
            .map(|p| {
                let (vid, pid, manufacturer, product, serial_number) = match &p.port_type {
                    serialport::SerialPortType::UsbPort(info) => (
                        Some(info.vid),
                        Some(info.pid),
                        info.manufacturer
                            .clone(),
                        info.product
                            .clone(),
                        info.serial_number
                            .clone(),
                    ),
                    _ => (None, None, None, None, None),
                };

                PortInfo {
                    name: p.port_name,
                    vid,
                    pid,
                    manufacturer,
                    product,
                    serial_number,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_ports() {
        // Only checks that enumeration does not panic on this host
        let _ = NativePortEnumerator::list_ports();
    }

    #[test]
    fn test_read_failure_retries_transient_errors() {
        for kind in [
            io::ErrorKind::TimedOut,
            io::ErrorKind::Interrupted,
            io::ErrorKind::WouldBlock,
        ] {
            assert!(read_failure(io::Error::from(kind)).is_none(), "{kind:?}");
        }
    }

    #[test]
    fn test_read_failure_ends_stream_on_unplug() {
        let err = read_failure(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(matches!(err, Some(Error::Io(e)) if e.kind() == io::ErrorKind::BrokenPipe));
    }

    #[test]
    fn test_new_handle_is_closed() {
        let port = NativePort::with_name("/dev/does-not-exist");
        assert!(!port.is_open());
        assert_eq!(port.name(), "/dev/does-not-exist");
    }

    #[test]
    fn test_readable_on_closed_port() {
        let port = NativePort::with_name("/dev/does-not-exist");
        assert!(matches!(port.readable(), Err(Error::ReadableUnavailable)));
    }

    #[tokio::test]
    async fn test_close_on_closed_port_is_benign() {
        let port = NativePort::with_name("/dev/does-not-exist");
        let err = port
            .close()
            .await
            .unwrap_err();
        assert!(err.is_benign_race());
    }

    #[tokio::test]
    async fn test_open_missing_device_fails() {
        let port = NativePort::with_name("/dev/does-not-exist");
        assert!(
            port.open(115200)
                .await
                .is_err()
        );
        assert!(!port.is_open());
    }
}
