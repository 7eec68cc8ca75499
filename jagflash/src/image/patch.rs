//! Config injection into an ESP32 application image.
//!
//! Jaguar application images reserve a fixed-size region for device
//! configuration. Current SDKs bracket it with two magic words; images from
//! older SDKs keep it at a fixed offset.
//!
//! ## Region layout
//!
//! ```text
//!  word i          word i+1                      word i+j
//! +-------------+-----------------------------+-------------+
//! | 0x7017DA7A  |  config ...  0  | unique id | 0x00C09F19  |
//! +-------------+-----------------------------+-------------+
//!               |<------ (j - 1) * 4 bytes -->|
//! ```
//!
//! `j` is probed at `0x81, 0x101, ..., 0x401` words, so the region is a
//! multiple of 512 bytes up to 4 KiB.
//!
//! ## Checksums
//!
//! The ESP-IDF image format ends with a one-byte XOR checksum, optionally
//! followed by a 32-byte SHA-256 digest (flag byte 23 set to 1). Patching
//! keeps the checksum valid by XOR-ing the old region out and the new region
//! in, then recomputes the digest over everything before it.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Magic word immediately before the config region.
pub const IMAGE_DATA_MAGIC_1: u32 = 0x7017_DA7A;

/// Magic word immediately after the config region.
pub const IMAGE_DATA_MAGIC_2: u32 = 0x00C0_9F19;

/// Region offset in images from SDKs without magic markers.
pub const LEGACY_IMAGE_DATA_OFFSET: usize = 69888;

/// Region size in images from SDKs without magic markers.
pub const LEGACY_IMAGE_DATA_SIZE: usize = 1024;

/// Offset of the hash-appended flag in the image header.
pub const HASH_APPEND_FLAG_OFFSET: usize = 23;

/// Length of the appended SHA-256 digest.
pub const DIGEST_LEN: usize = 32;

const WORD_SIZE: usize = 4;
const PROBE_FIRST: usize = 0x80 + 1;
const PROBE_LAST: usize = 0x400 + 1;
const PROBE_STEP: usize = 0x80;

/// How the config region was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RegionSource {
    /// Bracketed by the two magic words.
    Markers,
    /// Fixed legacy offset.
    Legacy,
}

impl fmt::Display for RegionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Markers => write!(f, "markers"),
            Self::Legacy => write!(f, "legacy offset"),
        }
    }
}

/// Location of the config region inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConfigRegion {
    /// Byte offset of the first config byte.
    pub offset: usize,
    /// Region size in bytes, unique id included.
    pub size: usize,
    /// How the region was found.
    pub source: RegionSource,
}

impl ConfigRegion {
    /// One past the last byte of the region.
    pub fn end(&self) -> usize {
        self.offset + self.size
    }

    /// Bytes left for the serialized config once `unique_id_len` is reserved.
    pub fn capacity(&self, unique_id_len: usize) -> usize {
        self.size
            .saturating_sub(unique_id_len)
    }
}

/// Find the config region, falling back to the legacy location.
pub fn locate_config_region(image: &[u8]) -> ConfigRegion {
    let words: Vec<u32> = image
        .chunks_exact(WORD_SIZE)
        .map(LittleEndian::read_u32)
        .collect();

    for (i, &word) in words
        .iter()
        .enumerate()
    {
        if word != IMAGE_DATA_MAGIC_1 {
            continue;
        }
        for j in (PROBE_FIRST..=PROBE_LAST)
            .step_by(PROBE_STEP)
            .take_while(|j| i + j < words.len())
        {
            if words[i + j] == IMAGE_DATA_MAGIC_2 {
                return ConfigRegion {
                    offset: (i + 1) * WORD_SIZE,
                    size: (j - 1) * WORD_SIZE,
                    source: RegionSource::Markers,
                };
            }
        }
    }

    ConfigRegion {
        offset: LEGACY_IMAGE_DATA_OFFSET,
        size: LEGACY_IMAGE_DATA_SIZE,
        source: RegionSource::Legacy,
    }
}

/// Parsed, unmodified view of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ImageLayout {
    /// Config region.
    pub region: ConfigRegion,
    /// Whether a SHA-256 digest follows the checksum byte.
    pub hash_appended: bool,
    /// Offset of the XOR checksum byte.
    pub checksum_offset: usize,
}

impl ImageLayout {
    /// Validate an image and describe where its patchable parts are.
    pub fn parse(image: &[u8]) -> Result<Self> {
        if image.len() <= HASH_APPEND_FLAG_OFFSET {
            return Err(Error::InvalidImage(format!(
                "image too short ({} bytes)",
                image.len()
            )));
        }
        let hash_appended = image[HASH_APPEND_FLAG_OFFSET] == 1;
        let trailer = if hash_appended { 1 + DIGEST_LEN } else { 1 };
        let checksum_offset = image
            .len()
            .checked_sub(trailer)
            .ok_or_else(|| {
                Error::InvalidImage(format!(
                    "image too short for its trailer ({} bytes)",
                    image.len()
                ))
            })?;

        let region = locate_config_region(image);
        if region.end() > checksum_offset {
            return Err(Error::InvalidImage(format!(
                "config region {:#x}..{:#x} ({}) overlaps the image trailer at {checksum_offset:#x}",
                region.offset,
                region.end(),
                region.source
            )));
        }

        Ok(Self {
            region,
            hash_appended,
            checksum_offset,
        })
    }

    /// Current checksum byte.
    pub fn checksum(&self, image: &[u8]) -> u8 {
        image[self.checksum_offset]
    }

    /// Bytes currently stored in the config region.
    pub fn region_bytes<'a>(&self, image: &'a [u8]) -> &'a [u8] {
        &image[self.region.offset..self.region.end()]
    }

    /// Whether the trailing digest matches the image. `None` without one.
    pub fn digest_matches(&self, image: &[u8]) -> Option<bool> {
        if !self.hash_appended {
            return None;
        }
        let boundary = image.len() - DIGEST_LEN;
        Some(Sha256::digest(&image[..boundary]).as_slice() == &image[boundary..])
    }
}

/// XOR of all bytes.
pub fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0, |acc, b| acc ^ b)
}

/// Write `config` and `unique_id` into the image's config region.
///
/// The region is zeroed, `config` goes to its start and `unique_id` to its
/// last bytes. The XOR checksum is updated by difference and the SHA-256
/// digest is recomputed when the image carries one. Nothing is modified when
/// an error is returned.
pub fn inject_config<'a>(
    image: &'a mut [u8],
    config: &[u8],
    unique_id: &[u8],
) -> Result<&'a mut [u8]> {
    let layout = ImageLayout::parse(image)?;
    let region = layout.region;
    let capacity = region.capacity(unique_id.len());
    if config.len() > capacity || unique_id.len() > region.size {
        return Err(Error::ConfigTooLarge {
            len: config.len(),
            capacity,
        });
    }
    debug!(
        "Injecting {} config bytes at {:#x} (region {} bytes, {})",
        config.len(),
        region.offset,
        region.size,
        region.source
    );

    let data = &mut image[region.offset..region.end()];
    let mut checksum = xor_checksum(data);
    data.fill(0);
    data[..config.len()].copy_from_slice(config);
    data[capacity..].copy_from_slice(unique_id);
    checksum ^= xor_checksum(data);
    image[layout.checksum_offset] ^= checksum;

    if layout.hash_appended {
        let boundary = image.len() - DIGEST_LEN;
        let digest = Sha256::digest(&image[..boundary]);
        image[boundary..].copy_from_slice(&digest);
    }

    Ok(image)
}
