//! Flash orchestration.
//!
//! [`flash`] drives a [`ChipLoader`] through the full write sequence and
//! reports progress:
//!
//! ```text
//!  open port ─► Connecting ─► connect ─► Connected ─► load stub ─► baud up
//!                                                                    │
//!         ┌──────────────── erase requested? ────────────────────────┤
//!         ▼                                                          ▼
//!  Erasing ─► erase ─► Erased ─────────────────────────► write partitions
//!                                                                    │
//!                                      Success ◄─────────────────────┘
//!
//!  any fault ─► Failed;  always: disconnect, close port
//! ```

pub mod chip;
pub mod progress;

use std::time::Duration;

use log::{debug, info, warn};

use crate::error::Result;
use crate::port::{Connection, ROM_BAUD};

pub use chip::{ChipFamily, ChipLoader, LoaderOptions};
pub use progress::{FlashDetails, FlashProgress, FlashState};

/// Flash offset of the second-stage bootloader.
pub const BOOTLOADER_OFFSET: u32 = 0x1000;

/// Flash offset of the partition table.
pub const PARTITION_TABLE_OFFSET: u32 = 0x8000;

/// Flash offset of the application.
pub const APP_OFFSET: u32 = 0x10000;

/// Baud rate requested from the stub for data transfer.
pub const HIGH_SPEED_BAUD: u32 = 921_600;

/// Pause after each partition is written.
pub const PARTITION_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// One region to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Name used in progress reports.
    pub name: String,
    /// Bytes to write.
    pub data: Vec<u8>,
    /// Flash offset.
    pub offset: u32,
}

impl Partition {
    /// Create a partition.
    pub fn new(name: impl Into<String>, data: Vec<u8>, offset: u32) -> Self {
        Self {
            name: name.into(),
            data,
            offset,
        }
    }
}

/// Structured progress callback.
pub type ProgressCallback = Box<dyn FnMut(&FlashProgress) + Send>;

/// Per-block callback taking `(partition, idx, total)`.
pub type SerialProgressCallback = Box<dyn FnMut(&str, usize, usize) + Send>;

/// Options for [`flash`].
pub struct FlashOptions {
    /// Baud rate the port is opened at.
    pub baud_rate: u32,
    /// Baud rate switched to after the stub is loaded.
    pub high_speed_baud: u32,
    /// Enable loader protocol tracing.
    pub debug: bool,
    /// Erase the whole flash before writing.
    pub erase: bool,
    /// Receives every state change and block write.
    pub progress: Option<ProgressCallback>,
    /// Receives block writes only.
    pub serial_progress: Option<SerialProgressCallback>,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            baud_rate: ROM_BAUD,
            high_speed_baud: HIGH_SPEED_BAUD,
            debug: false,
            erase: false,
            progress: None,
            serial_progress: None,
        }
    }
}

impl FlashOptions {
    /// Set the structured progress callback.
    #[must_use]
    pub fn with_progress(mut self, callback: impl FnMut(&FlashProgress) + Send + 'static) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    /// Set the per-block callback.
    #[must_use]
    pub fn with_serial_progress(
        mut self,
        callback: impl FnMut(&str, usize, usize) + Send + 'static,
    ) -> Self {
        self.serial_progress = Some(Box::new(callback));
        self
    }

    /// Erase before writing.
    #[must_use]
    pub fn with_erase(mut self, erase: bool) -> Self {
        self.erase = erase;
        self
    }

    fn report(&mut self, state: FlashState) {
        if let Some(callback) = self
            .progress
            .as_mut()
        {
            callback(&FlashProgress::state(state));
        }
    }
}

/// Write `partitions` to the device behind `connection`.
///
/// The loader is built by `make_loader` once the port is open. A port that is
/// already open is reused. On failure the progress callback sees
/// [`FlashState::Failed`] and the error is returned; the loader is always
/// disconnected and the port closed.
pub async fn flash<C, L, F>(
    connection: &C,
    make_loader: F,
    partitions: &[Partition],
    mut options: FlashOptions,
) -> Result<()>
where
    C: Connection,
    L: ChipLoader,
    F: FnOnce(C, &LoaderOptions) -> L,
{
    match connection
        .open(options.baud_rate)
        .await
    {
        Ok(()) => {},
        Err(e) if e.is_benign_race() => debug!("Port {} already open", connection.name()),
        Err(e) => return Err(e),
    }

    let mut loader = make_loader(
        connection.clone(),
        &LoaderOptions {
            debug: options.debug,
        },
    );
    options.report(FlashState::Connecting);
    let mut result = write_partitions(&mut loader, partitions, &mut options).await;
    if let Err(e) = loader
        .disconnect()
        .await
    {
        warn!("Disconnect error: {e}");
    }

    if let Err(e) = &result {
        warn!("Flashing failed: {e}");
        options.report(FlashState::Failed);
    }

    match connection
        .close()
        .await
    {
        Ok(()) => {},
        Err(e) if e.is_benign_race() => debug!("Port {} already closed", connection.name()),
        Err(e) => {
            if result.is_ok() {
                result = Err(e);
            } else {
                warn!("Failed to close port: {e}");
            }
        },
    }
    result
}

async fn write_partitions<L: ChipLoader>(
    loader: &mut L,
    partitions: &[Partition],
    options: &mut FlashOptions,
) -> Result<()> {
    loader
        .connect()
        .await?;
    options.report(FlashState::Connected);
    info!("Writing device partitions");
    loader
        .load_stub()
        .await?;
    loader
        .set_baud_rate(options.baud_rate, options.high_speed_baud)
        .await?;

    if options.erase {
        options.report(FlashState::Erasing);
        loader
            .erase_flash()
            .await?;
        options.report(FlashState::Erased);
    }

    for partition in partitions {
        info!(
            "Writing partition: {} ({} bytes at {:#x})",
            partition.name,
            partition
                .data
                .len(),
            partition.offset
        );
        let name = partition
            .name
            .as_str();
        let progress = &mut options.progress;
        let serial_progress = &mut options.serial_progress;
        let mut on_chunk = |idx: usize, total: usize| {
            if let Some(callback) = progress.as_mut() {
                callback(&FlashProgress::writing(name, idx, total));
            }
            if let Some(callback) = serial_progress.as_mut() {
                callback(name, idx, total);
            }
        };
        loader
            .flash_data(&partition.data, partition.offset, &mut on_chunk)
            .await?;
        tokio::time::sleep(PARTITION_SETTLE_DELAY).await;
    }

    options.report(FlashState::Success);
    Ok(())
}

/// Whether the attached chip is an ESP32.
///
/// Connection failures count as "no". The loader is always disconnected.
pub async fn check_hardware<L: ChipLoader>(loader: &mut L) -> bool {
    let family = identify(loader).await;
    if let Err(e) = loader
        .disconnect()
        .await
    {
        warn!("Disconnect error: {e}");
    }
    match family {
        Ok(family) => family.is_supported(),
        Err(e) => {
            debug!("Failed to connect: {e}");
            false
        },
    }
}

async fn identify<L: ChipLoader>(loader: &mut L) -> Result<ChipFamily> {
    loader
        .connect()
        .await?;
    let name = loader
        .chip_name()
        .await?;
    let family = loader
        .chip_family()
        .await?;
    let mac = loader
        .mac_addr()
        .await?;
    debug!("Chip {name}, family {family}, MAC {mac}");
    Ok(family)
}
