//! Image commands: config injection, archive extraction and inspection.

use {
    anyhow::{Context, Result},
    console::style,
    dialoguer::{Password, theme::ColorfulTheme},
    jagflash::{
        flasher::{APP_OFFSET, BOOTLOADER_OFFSET, PARTITION_TABLE_OFFSET, Partition},
        image::{FirmwareImages, ImageLayout},
        provision::{
            ProvisionedIds, ProvisioningConfig, new_unique_id, plan_partitions,
            plan_partitions_with, provision_app_image_with,
        },
    },
    std::{
        fs,
        io::{BufReader, IsTerminal},
        path::{Path, PathBuf},
    },
    uuid::Uuid,
};

use crate::config::Config;
use crate::{Cli, CliError, ProvisionArgs};

const UNIQUE_ID_LEN: usize = 16;

impl ProvisionArgs {
    /// Whether any provisioning flag was given.
    fn is_requested(&self) -> bool {
        self.name.is_some()
            || self.ssid.is_some()
            || self.password.is_some()
            || self.device_id.is_some()
            || self.unique_id.is_some()
    }

    fn ids(&self) -> ProvisionedIds {
        ProvisionedIds {
            device_id: self
                .device_id
                .unwrap_or_else(Uuid::new_v4),
            unique_id: self
                .unique_id
                .unwrap_or_else(new_unique_id),
        }
    }
}

/// Resolve the provisioning settings from flags, config and prompts.
pub(crate) fn provisioning_config(cli: &Cli, config: &Config, args: &ProvisionArgs) -> Result<ProvisioningConfig> {
    let name = args
        .name
        .clone()
        .or_else(|| {
            config
                .provision
                .name
                .clone()
        })
        .ok_or_else(|| CliError::Usage("a device name is required (--name)".to_string()))?;
    let ssid = args
        .ssid
        .clone()
        .or_else(|| {
            config
                .provision
                .ssid
                .clone()
        })
        .ok_or_else(|| CliError::Usage("a Wi-Fi network is required (--ssid)".to_string()))?;

    let password = match &args.password {
        Some(password) => password.clone(),
        None if cli.non_interactive || !std::io::stdin().is_terminal() => String::new(),
        None => Password::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("Wi-Fi password for {ssid}"))
            .allow_empty_password(true)
            .interact()
            .map_err(|e| CliError::Cancelled(format!("password prompt aborted: {e}")))?,
    };

    Ok(ProvisioningConfig::new(name, ssid, password))
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data).with_context(|| format!("Failed to write {}", path.display()))
}

pub(crate) fn print_ids(ids: &ProvisionedIds) {
    eprintln!("  Device ID: {}", style(ids.device_id).cyan());
    eprintln!("  Unique ID: {}", style(ids.unique_id).cyan());
}

/// Patch command implementation.
pub(crate) fn cmd_patch(
    cli: &Cli,
    config: &Config,
    image: &Path,
    output: &Path,
    args: &ProvisionArgs,
) -> Result<()> {
    let settings = provisioning_config(cli, config, args)?;
    let mut data = read_file(image)?;
    let ids = args.ids();

    provision_app_image_with(&mut data, &settings, ids)
        .with_context(|| format!("Cannot patch {}", image.display()))?;
    write_file(output, &data)?;

    if !cli.quiet {
        eprintln!(
            "{} Wrote {} for {} on {}",
            style("✓").green(),
            output.display(),
            style(&settings.name).bold(),
            settings.ssid
        );
        print_ids(&ids);
    }
    Ok(())
}

/// Partitions for `images`, with fresh ids unless the flags pin them.
pub(crate) fn plan(
    images: FirmwareImages,
    settings: &ProvisioningConfig,
    args: &ProvisionArgs,
) -> jagflash::Result<(Vec<Partition>, ProvisionedIds)> {
    if args.device_id.is_none() && args.unique_id.is_none() {
        plan_partitions(images, settings)
    } else {
        plan_partitions_with(images, settings, args.ids())
    }
}

/// Open and unpack a firmware archive.
pub(crate) fn load_archive(archive: &Path) -> Result<FirmwareImages> {
    let file = fs::File::open(archive)
        .with_context(|| format!("Failed to open {}", archive.display()))?;
    FirmwareImages::from_tar_gz(BufReader::new(file))
        .with_context(|| format!("Failed to load firmware archive {}", archive.display()))
}

/// Conventional flash offset of an archive entry, by output file name.
fn offset_for(file_name: &str) -> Option<u32> {
    match file_name {
        "bootloader.bin" => Some(BOOTLOADER_OFFSET),
        "partitions.bin" => Some(PARTITION_TABLE_OFFSET),
        "toit.bin" | "jaguar.bin" => Some(APP_OFFSET),
        _ => None,
    }
}

fn write_partitions(output: &Path, partitions: &[Partition]) -> Result<Vec<(PathBuf, u32, usize)>> {
    partitions
        .iter()
        .map(|partition| {
            let path = output.join(format!("{}.bin", partition.name));
            write_file(&path, &partition.data)?;
            Ok((path, partition.offset, partition.data.len()))
        })
        .collect()
}

fn write_entries(output: &Path, images: &FirmwareImages) -> Result<Vec<(PathBuf, u32, usize)>> {
    let mut written = Vec::new();
    for (entry, data) in images.entries() {
        let file_name = Path::new(entry)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(entry);
        let Some(data) = data else {
            log::warn!("Archive has no {entry}");
            continue;
        };
        let path = output.join(file_name);
        write_file(&path, data)?;
        written.push((path, offset_for(file_name).unwrap_or_default(), data.len()));
    }
    Ok(written)
}

/// Extract command implementation.
pub(crate) fn cmd_extract(
    cli: &Cli,
    config: &Config,
    archive: &Path,
    output: &Path,
    args: &ProvisionArgs,
) -> Result<()> {
    let images = load_archive(archive)?;
    fs::create_dir_all(output)
        .with_context(|| format!("Failed to create {}", output.display()))?;

    let (written, ids) = if args.is_requested() {
        let settings = provisioning_config(cli, config, args)?;
        let (partitions, ids) = plan(images, &settings, args)
            .with_context(|| format!("Cannot provision {}", archive.display()))?;
        (write_partitions(output, &partitions)?, Some(ids))
    } else {
        (write_entries(output, &images)?, None)
    };

    if !cli.quiet {
        eprintln!("{} Extracted {} images", style("✓").green(), written.len());
        for (path, offset, len) in &written {
            eprintln!(
                "    {} {} @ 0x{offset:08X} ({len} bytes)",
                style("•").dim(),
                path.display()
            );
        }
        if let Some(ids) = &ids {
            print_ids(ids);
        }
    }
    Ok(())
}

/// What `info` reports about an application image.
#[derive(Debug)]
struct ImageReport {
    len: usize,
    layout: ImageLayout,
    checksum: u8,
    digest_valid: Option<bool>,
    provisioned: bool,
    unique_id: Option<Uuid>,
}

impl ImageReport {
    fn new(image: &[u8]) -> jagflash::Result<Self> {
        let layout = ImageLayout::parse(image)?;
        let region = layout.region_bytes(image);
        // A provisioned region starts with a UBJSON object.
        let provisioned = region.first() == Some(&b'{');
        let unique_id = provisioned
            .then(|| region.get(region.len().saturating_sub(UNIQUE_ID_LEN)..))
            .flatten()
            .and_then(|bytes| Uuid::from_slice(bytes).ok());
        Ok(Self {
            len: image.len(),
            layout,
            checksum: layout.checksum(image),
            digest_valid: layout.digest_matches(image),
            provisioned,
            unique_id,
        })
    }

    fn to_json(&self) -> serde_json::Value {
        let region = self.layout.region;
        serde_json::json!({
            "size": self.len,
            "config_region": {
                "offset": format!("0x{:X}", region.offset),
                "size": region.size,
                "capacity": region.capacity(UNIQUE_ID_LEN),
                "source": region.source.to_string(),
            },
            "checksum": format!("0x{:02X}", self.checksum),
            "hash_appended": self.layout.hash_appended,
            "digest_valid": self.digest_valid,
            "provisioned": self.provisioned,
            "unique_id": self.unique_id.map(|id| id.to_string()),
        })
    }
}

/// Info command implementation.
pub(crate) fn cmd_info(image: &Path, json: bool) -> Result<()> {
    let data = read_file(image)?;
    let report =
        ImageReport::new(&data).with_context(|| format!("Cannot inspect {}", image.display()))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report.to_json())?
        );
        return Ok(());
    }

    let region = report.layout.region;
    let yes_no = |v: bool| if v { "yes" } else { "no" };
    eprintln!(
        "{}",
        style("Application image")
            .bold()
            .underlined()
    );
    eprintln!("  Size:          {} bytes", report.len);
    eprintln!(
        "  Config region: 0x{:X}..0x{:X} ({} bytes, {})",
        region.offset,
        region.end(),
        region.size,
        region.source
    );
    eprintln!(
        "  Capacity:      {} bytes",
        region.capacity(UNIQUE_ID_LEN)
    );
    eprintln!("  Checksum:      0x{:02X}", report.checksum);
    eprintln!(
        "  SHA-256:       {}",
        match report.digest_valid {
            Some(true) => style("valid").green().to_string(),
            Some(false) => style("mismatch").red().to_string(),
            None => "not appended".to_string(),
        }
    );
    eprintln!("  Provisioned:   {}", yes_no(report.provisioned));
    if let Some(id) = report.unique_id {
        eprintln!("  Unique ID:     {}", style(id).cyan());
    }

    Ok(())
}
