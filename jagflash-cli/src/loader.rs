//! [`ChipLoader`] backed by the `espflash` crate.
//!
//! espflash owns the serial line while it talks to the ROM, so
//! [`EspLoader::connect`] closes the jagflash handle first and opens its own
//! native port by name. Every espflash call is blocking and runs on the
//! tokio blocking pool.

use {
    espflash::{
        connection::{Connection as EspConnection, ResetAfterOperation, ResetBeforeOperation},
        flasher::Flasher,
        image_format::Segment,
        target::ProgressCallbacks,
    },
    jagflash::{ChipFamily, ChipLoader, Connection, Error, NativePort, Result},
    log::debug,
    std::{borrow::Cow, fmt::Display, time::Duration},
    tokio::sync::mpsc,
};

/// Read timeout of the port espflash opens.
const LOADER_TIMEOUT: Duration = Duration::from_secs(3);

fn loader_error(e: impl Display) -> Error {
    Error::Loader(e.to_string())
}

async fn blocking<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> Result<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Loader(format!("loader task failed: {e}")))
}

/// USB details espflash uses to pick a reset strategy.
fn usb_info(port_name: &str) -> serialport::UsbPortInfo {
    let usb = serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .find(|p| p.port_name == port_name)
        .and_then(|p| match p.port_type {
            serialport::SerialPortType::UsbPort(info) => Some(info),
            _ => None,
        });
    usb.unwrap_or(serialport::UsbPortInfo {
        vid: 0,
        pid: 0,
        serial_number: None,
        manufacturer: None,
        product: None,
    })
}

/// Bridges espflash block progress to the `(idx, total)` chunk callback.
struct ChunkProgress {
    total: usize,
    tx: mpsc::UnboundedSender<(usize, usize)>,
}

impl ProgressCallbacks for ChunkProgress {
    fn init(&mut self, addr: u32, total: usize) {
        debug!("Writing {total} blocks at {addr:#x}");
        self.total = total;
        let _ = self
            .tx
            .send((0, total));
    }

    fn update(&mut self, current: usize) {
        let _ = self
            .tx
            .send((current, self.total));
    }

    fn verifying(&mut self) {
        debug!("Verifying written blocks");
    }

    fn finish(&mut self, skipped: bool) {
        if skipped {
            debug!("Region already up to date");
        }
        let _ = self
            .tx
            .send((self.total, self.total));
    }
}

/// Chip loader driving the ESP ROM and stub through espflash.
pub(crate) struct EspLoader {
    port: NativePort,
    baud: u32,
    debug: bool,
    flasher: Option<Flasher>,
}

impl EspLoader {
    /// Loader for the device behind `port`, syncing at `baud`.
    pub(crate) fn new(port: NativePort, baud: u32) -> Self {
        Self {
            port,
            baud,
            debug: false,
            flasher: None,
        }
    }

    /// Log chip details after connecting.
    #[must_use]
    pub(crate) fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    fn flasher(&self) -> Result<&Flasher> {
        self.flasher
            .as_ref()
            .ok_or_else(|| Error::Loader("not connected".to_string()))
    }

    /// Run `f` on the connected flasher off the async runtime.
    async fn with_flasher<T: Send + 'static>(
        &mut self,
        f: impl FnOnce(&mut Flasher) -> Result<T> + Send + 'static,
    ) -> Result<T> {
        let mut flasher = self
            .flasher
            .take()
            .ok_or_else(|| Error::Loader("not connected".to_string()))?;
        let (flasher, result) = blocking(move || {
            let result = f(&mut flasher);
            (flasher, result)
        })
        .await?;
        self.flasher = Some(flasher);
        result
    }
}

impl ChipLoader for EspLoader {
    async fn connect(&mut self) -> Result<()> {
        match self
            .port
            .close()
            .await
        {
            Ok(()) => debug!("Handed {} over to the loader", self.port.name()),
            Err(e) if e.is_benign_race() => {},
            Err(e) => return Err(e),
        }

        let name = self
            .port
            .name()
            .to_string();
        let baud = self.baud;
        let flasher = blocking(move || -> Result<Flasher> {
            let serial = serialport::new(&name, baud)
                .timeout(LOADER_TIMEOUT)
                .open_native()?;
            let connection = EspConnection::new(
                serial,
                usb_info(&name),
                ResetAfterOperation::HardReset,
                ResetBeforeOperation::DefaultReset,
                baud,
            );
            Flasher::connect(connection, true, true, true, None, None).map_err(loader_error)
        })
        .await??;
        self.flasher = Some(flasher);

        if self.debug {
            let info = self
                .with_flasher(|flasher| {
                    flasher
                        .device_info()
                        .map_err(loader_error)
                })
                .await?;
            debug!(
                "{} rev {:?}, flash {}, features: {}",
                info.chip,
                info.revision,
                info.flash_size,
                info.features
                    .join(", ")
            );
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self
            .flasher
            .take()
            .is_some()
        {
            debug!("Released {}", self.port.name());
        }
        Ok(())
    }

    async fn load_stub(&mut self) -> Result<()> {
        // Flasher::connect already uploaded the stub.
        self.flasher()
            .map(|_| ())
    }

    async fn set_baud_rate(&mut self, current: u32, target: u32) -> Result<()> {
        if current == target {
            return Ok(());
        }
        debug!("Switching from {current} to {target} baud");
        self.with_flasher(move |flasher| {
            flasher
                .change_baud(target)
                .map_err(loader_error)
        })
        .await
    }

    async fn erase_flash(&mut self) -> Result<()> {
        self.with_flasher(|flasher| {
            flasher
                .erase_flash()
                .map_err(loader_error)
        })
        .await
    }

    async fn flash_data(
        &mut self,
        data: &[u8],
        offset: u32,
        on_chunk: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let data = data.to_vec();
        let write = self.with_flasher(move |flasher| {
            let mut progress = ChunkProgress { total: 0, tx };
            let segment = Segment {
                addr: offset,
                data: Cow::Owned(data),
            };
            flasher
                .write_bins_to_flash(&[segment], &mut progress)
                .map_err(loader_error)
        });
        tokio::pin!(write);

        loop {
            tokio::select! {
                result = &mut write => {
                    while let Ok((idx, total)) = rx.try_recv() {
                        on_chunk(idx, total);
                    }
                    return result;
                },
                Some((idx, total)) = rx.recv() => on_chunk(idx, total),
            }
        }
    }

    async fn chip_name(&mut self) -> Result<String> {
        Ok(self
            .flasher()?
            .chip()
            .to_string())
    }

    async fn chip_family(&mut self) -> Result<ChipFamily> {
        let name = self
            .chip_name()
            .await?;
        Ok(ChipFamily::from_name(&name))
    }

    async fn mac_addr(&mut self) -> Result<String> {
        self.with_flasher(|flasher| {
            let info = flasher
                .device_info()
                .map_err(loader_error)?;
            Ok(info
                .mac_address
                .map_or_else(|| "unknown".to_string(), |mac| mac.to_string()))
        })
        .await
    }
}
