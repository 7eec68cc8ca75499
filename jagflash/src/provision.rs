//! Device provisioning: config documents, unique ids and the partition plan.
//!
//! A device is provisioned by flashing the three release images with the
//! application image patched to carry its Wi-Fi credentials and identity.

use log::debug;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::flasher::{APP_OFFSET, BOOTLOADER_OFFSET, PARTITION_TABLE_OFFSET, Partition};
use crate::image::{FirmwareImages, inject_config, ubjson};

/// Partition name of the bootloader.
pub const BOOTLOADER_PARTITION: &str = "bootloader";

/// Partition name of the partition table.
pub const PARTITIONS_PARTITION: &str = "partitions";

/// Partition name of the application.
pub const APP_PARTITION: &str = "jaguar";

/// Settings baked into the application image.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProvisioningConfig {
    /// Device name.
    pub name: String,
    /// Wi-Fi network name.
    pub ssid: String,
    /// Wi-Fi password.
    pub password: String,
}

impl ProvisioningConfig {
    /// Create a config.
    pub fn new(
        name: impl Into<String>,
        ssid: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            ssid: ssid.into(),
            password: password.into(),
        }
    }

    /// The config document as the device reads it.
    pub fn to_document(&self, id: &Uuid) -> Value {
        json!({
            "name": self.name,
            "id": id.to_string(),
            "wifi": {
                "password": self.password,
                "ssid": self.ssid,
            },
        })
    }

    /// UBJSON encoding of [`ProvisioningConfig::to_document`].
    pub fn encode(&self, id: &Uuid) -> Vec<u8> {
        ubjson::to_vec(&self.to_document(id))
    }
}

/// Random unique id written at the end of the config region.
pub fn new_unique_id() -> Uuid {
    Uuid::new_v4()
}

/// Ids assigned to a provisioned image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionedIds {
    /// `id` field of the config document.
    pub device_id: Uuid,
    /// Raw unique id stored after the document.
    pub unique_id: Uuid,
}

/// Patch an application image in place with explicit ids.
pub fn provision_app_image_with(
    app: &mut [u8],
    config: &ProvisioningConfig,
    ids: ProvisionedIds,
) -> Result<()> {
    let document = config.encode(&ids.device_id);
    debug!(
        "Provisioning {} (id {}, unique id {})",
        config.name, ids.device_id, ids.unique_id
    );
    inject_config(app, &document, ids.unique_id.as_bytes())?;
    Ok(())
}

/// Patch an application image in place with fresh ids.
pub fn provision_app_image(app: &mut [u8], config: &ProvisioningConfig) -> Result<ProvisionedIds> {
    let ids = ProvisionedIds {
        device_id: Uuid::new_v4(),
        unique_id: new_unique_id(),
    };
    provision_app_image_with(app, config, ids)?;
    Ok(ids)
}

/// Turn release images into the partitions to flash.
///
/// Every entry must be present. The application image is patched with
/// `config` and fresh ids.
pub fn plan_partitions(
    images: FirmwareImages,
    config: &ProvisioningConfig,
) -> Result<(Vec<Partition>, ProvisionedIds)> {
    let ids = ProvisionedIds {
        device_id: Uuid::new_v4(),
        unique_id: new_unique_id(),
    };
    plan_partitions_with(images, config, ids)
}

/// [`plan_partitions`] with explicit ids.
pub fn plan_partitions_with(
    images: FirmwareImages,
    config: &ProvisioningConfig,
    ids: ProvisionedIds,
) -> Result<(Vec<Partition>, ProvisionedIds)> {
    images.require_all()?;
    let (Some(bootloader), Some(table), Some(mut app)) =
        (images.bootloader, images.partitions, images.app)
    else {
        return Err(Error::InvalidArchive("incomplete firmware images".into()));
    };

    provision_app_image_with(&mut app, config, ids)?;
    Ok((
        vec![
            Partition::new(BOOTLOADER_PARTITION, bootloader, BOOTLOADER_OFFSET),
            Partition::new(PARTITIONS_PARTITION, table, PARTITION_TABLE_OFFSET),
            Partition::new(APP_PARTITION, app, APP_OFFSET),
        ],
        ids,
    ))
}
