//! Firmware images: config injection, release archives and the UBJSON
//! encoding of the injected config.

pub mod archive;
pub mod patch;
pub mod ubjson;

pub use archive::{APP_ENTRY, BOOTLOADER_ENTRY, FirmwareImages, PARTITIONS_ENTRY, archive_url};
pub use patch::{
    ConfigRegion, ImageLayout, RegionSource, inject_config, locate_config_region, xor_checksum,
};
