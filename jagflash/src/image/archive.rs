//! Jaguar firmware archives.
//!
//! Releases ship as `image.tar.gz`; only three entries matter for flashing.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use log::{debug, trace};

use crate::error::{Error, Result};

/// Base URL of the release archive.
pub const ARCHIVE_BASE_URL: &str = "https://archive.toit.io/jaguar";

/// Archive entry holding the second-stage bootloader.
pub const BOOTLOADER_ENTRY: &str = "image/bootloader/bootloader.bin";

/// Archive entry holding the partition table.
pub const PARTITIONS_ENTRY: &str = "image/partitions.bin";

/// Archive entry holding the application image.
pub const APP_ENTRY: &str = "image/toit.bin";

/// Largest entry accepted; the biggest ESP32 flash is 16 MiB.
pub const MAX_ENTRY_SIZE: u64 = 16 * 1024 * 1024;

/// Download location of the firmware archive for a Jaguar version.
pub fn archive_url(version: &str) -> String {
    format!("{ARCHIVE_BASE_URL}/{version}/image.tar.gz")
}

/// Images extracted from a firmware archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareImages {
    /// Second-stage bootloader.
    pub bootloader: Option<Vec<u8>>,
    /// Partition table.
    pub partitions: Option<Vec<u8>>,
    /// Application image.
    pub app: Option<Vec<u8>>,
}

impl FirmwareImages {
    /// Read a gzip-compressed tar archive.
    pub fn from_tar_gz<R: Read>(reader: R) -> Result<Self> {
        Self::from_tar(GzDecoder::new(reader))
    }

    /// Read an uncompressed tar archive.
    pub fn from_tar<R: Read>(reader: R) -> Result<Self> {
        let mut archive = tar::Archive::new(reader);
        let mut images = Self::default();

        for entry in archive
            .entries()
            .map_err(invalid)?
        {
            let mut entry = entry.map_err(invalid)?;
            let path = entry
                .path()
                .map_err(invalid)?
                .to_string_lossy()
                .into_owned();
            let name = path
                .strip_prefix("./")
                .unwrap_or(&path);

            let slot = match name {
                BOOTLOADER_ENTRY => &mut images.bootloader,
                PARTITIONS_ENTRY => &mut images.partitions,
                APP_ENTRY => &mut images.app,
                _ => {
                    trace!("Skipping archive entry {name}");
                    continue;
                },
            };

            if entry.size() > MAX_ENTRY_SIZE {
                return Err(Error::InvalidArchive(format!(
                    "{name} declares {} bytes, more than fits in flash",
                    entry.size()
                )));
            }

            let mut data = Vec::new();
            entry
                .by_ref()
                .take(MAX_ENTRY_SIZE)
                .read_to_end(&mut data)
                .map_err(invalid)?;
            debug!("Extracted {name} ({} bytes)", data.len());
            *slot = Some(data);
        }

        Ok(images)
    }

    /// Read an archive file from disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_tar_gz(BufReader::new(file))
    }

    /// Fail with the name of the first missing entry.
    pub fn require_all(&self) -> Result<()> {
        for (entry, data) in self.entries() {
            if data.is_none() {
                return Err(Error::InvalidArchive(format!("missing {entry}")));
            }
        }
        Ok(())
    }

    /// Archive entry names paired with their contents.
    pub fn entries(&self) -> [(&'static str, Option<&[u8]>); 3] {
        [
            (BOOTLOADER_ENTRY, self.bootloader.as_deref()),
            (PARTITIONS_ENTRY, self.partitions.as_deref()),
            (APP_ENTRY, self.app.as_deref()),
        ]
    }
}

fn invalid(e: std::io::Error) -> Error {
    Error::InvalidArchive(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    fn tar_gz(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, path, *data)
                .unwrap();
        }
        builder
            .into_inner()
            .unwrap()
            .finish()
            .unwrap()
    }

    #[test]
    fn test_archive_url() {
        assert_eq!(
            archive_url("v1.8.0"),
            "https://archive.toit.io/jaguar/v1.8.0/image.tar.gz"
        );
    }

    #[test]
    fn test_extracts_known_entries_and_skips_others() {
        let archive = tar_gz(&[
            ("image/README", b"ignore me"),
            (BOOTLOADER_ENTRY, b"boot"),
            (PARTITIONS_ENTRY, b"table"),
            ("image/ota_data_initial.bin", b"ota"),
            (APP_ENTRY, b"app"),
        ]);

        let images = FirmwareImages::from_tar_gz(archive.as_slice()).unwrap();
        assert_eq!(images.bootloader.as_deref(), Some(&b"boot"[..]));
        assert_eq!(images.partitions.as_deref(), Some(&b"table"[..]));
        assert_eq!(images.app.as_deref(), Some(&b"app"[..]));
        assert!(
            images
                .require_all()
                .is_ok()
        );
    }

    #[test]
    fn test_require_all_names_missing_entry() {
        let archive = tar_gz(&[(BOOTLOADER_ENTRY, b"boot"), (APP_ENTRY, b"app")]);
        let images = FirmwareImages::from_tar_gz(archive.as_slice()).unwrap();

        let err = images
            .require_all()
            .unwrap_err();
        assert!(
            err.to_string()
                .contains(PARTITIONS_ENTRY)
        );
    }

    #[test]
    fn test_garbage_is_invalid_archive() {
        let err = FirmwareImages::from_tar_gz(&b"definitely not gzip"[..]).unwrap_err();
        assert!(matches!(err, Error::InvalidArchive(_)));
    }

    #[test]
    fn test_huge_declared_size_is_rejected() {
        let mut header = tar::Header::new_gnu();
        header
            .set_path(APP_ENTRY)
            .unwrap();
        header.set_size(u64::MAX - 4096);
        header.set_mode(0o644);
        header.set_cksum();

        let mut raw = header
            .as_bytes()
            .to_vec();
        raw.extend_from_slice(&[0u8; 1024]);

        let err = FirmwareImages::from_tar(raw.as_slice()).unwrap_err();
        assert!(matches!(err, Error::InvalidArchive(_)));
    }

    #[test]
    fn test_entry_just_over_the_limit_is_rejected() {
        let mut header = tar::Header::new_gnu();
        header
            .set_path(BOOTLOADER_ENTRY)
            .unwrap();
        header.set_size(MAX_ENTRY_SIZE + 1);
        header.set_mode(0o644);
        header.set_cksum();

        let raw = header
            .as_bytes()
            .to_vec();
        let err = FirmwareImages::from_tar(raw.as_slice()).unwrap_err();
        assert!(
            err.to_string()
                .contains(BOOTLOADER_ENTRY)
        );
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir
            .path()
            .join("image.tar.gz");
        std::fs::write(&path, tar_gz(&[(APP_ENTRY, b"app")])).unwrap();

        let images = FirmwareImages::from_file(&path).unwrap();
        assert!(
            images
                .bootloader
                .is_none()
        );
        assert_eq!(images.app.as_deref(), Some(&b"app"[..]));
    }
}
