use std::path::PathBuf;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    constants::{
        BIOS_GRUB_FLAG, BOOT_FLAG, BOOT_PART_NAME, BOOT_PART_SIZE_MIB, EFI_LABEL,
        EFI_MOUNT_POINT, EFI_PART_NAME, EFI_PART_SIZE_MIB, ESP_FLAG, OEM_LABEL, OEM_PART_NAME,
        PERSISTENT_LABEL, PERSISTENT_PART_NAME, RECOVERY_LABEL, RECOVERY_PART_NAME, STATE_LABEL,
        STATE_PART_NAME,
    },
    error::ValidationError,
    primitives::{FileSystem, Firmware, FsUuid, TableLabel},
};

/// A partition, either as requested by configuration or as discovered on a
/// device. Discovery fills in the skipped fields; configuration leaves
/// them empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Partition {
    /// Name in the partition table (the GPT partition label).
    #[serde(default)]
    pub name: String,

    /// Filesystem label.
    #[serde(default)]
    pub filesystem_label: String,

    /// Size in MiB; 0 means "consume all remaining space".
    #[serde(default)]
    pub size_mib: u64,

    /// Filesystem to create; `None` for boot-firmware partitions, which
    /// carry no filesystem at all.
    #[serde(default)]
    pub fs: Option<FileSystem>,

    #[serde(default)]
    pub mount_point: Option<PathBuf>,

    #[serde(default)]
    pub flags: Vec<String>,

    /// Device node, filled in by discovery.
    #[serde(skip)]
    pub path: Option<PathBuf>,

    /// Owning disk, filled in by discovery.
    #[serde(skip)]
    pub disk: Option<PathBuf>,

    /// Number in the partition table, filled in by discovery.
    #[serde(skip)]
    pub number: u32,

    /// Filesystem UUID, filled in by discovery.
    #[serde(skip)]
    pub uuid: Option<FsUuid>,
}

impl Partition {
    pub fn is_mounted(&self) -> bool {
        self.mount_point.is_some()
    }

    /// Boot-firmware partitions have no filesystem and must never be
    /// formatted.
    pub fn is_boot_firmware(&self) -> bool {
        self.fs.is_none() || self.flags.iter().any(|f| f == BIOS_GRUB_FLAG)
    }
}

/// Where a system image comes from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ImageSource {
    /// No source configured.
    #[default]
    Empty,
    /// A local image file.
    File(PathBuf),
    /// A local directory tree.
    Dir(PathBuf),
    /// A container image reference.
    Oci(String),
}

impl ImageSource {
    pub fn is_empty(&self) -> bool {
        matches!(self, ImageSource::Empty)
    }
}

/// A system image to deploy onto a partition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Image {
    #[serde(default)]
    pub source: ImageSource,

    /// On-disk image file. For the recovery image this is derived during
    /// sanitation from the image's filesystem kind.
    #[serde(default)]
    pub file: PathBuf,

    #[serde(default)]
    pub label: String,

    #[serde(default)]
    pub size_mib: u64,

    #[serde(default)]
    pub fs: FileSystem,

    #[serde(default)]
    pub mount_point: Option<PathBuf>,
}

/// The fixed set of role partitions. Unbound slots mean "not present on
/// this system", not an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PartitionSet {
    /// BIOS boot-support partition; only exists on GPT disks booted by
    /// legacy firmware.
    #[serde(default)]
    pub boot: Option<Partition>,

    #[serde(default)]
    pub efi: Option<Partition>,

    #[serde(default)]
    pub oem: Option<Partition>,

    #[serde(default)]
    pub recovery: Option<Partition>,

    #[serde(default)]
    pub state: Option<Partition>,

    #[serde(default)]
    pub persistent: Option<Partition>,
}

impl PartitionSet {
    /// Binds each role from a flat partition list: exact name match first,
    /// then filesystem label, preferring a mounted partition among label
    /// matches.
    pub fn from_list(partitions: &[Partition]) -> Self {
        Self {
            boot: find_role(partitions, BOOT_PART_NAME, None),
            efi: find_role(partitions, EFI_PART_NAME, Some(EFI_LABEL)),
            oem: find_role(partitions, OEM_PART_NAME, Some(OEM_LABEL)),
            recovery: find_role(partitions, RECOVERY_PART_NAME, Some(RECOVERY_LABEL)),
            state: find_role(partitions, STATE_PART_NAME, Some(STATE_LABEL)),
            persistent: find_role(partitions, PERSISTENT_PART_NAME, Some(PERSISTENT_LABEL)),
        }
    }

    /// Partitions in the order they are created on disk: boot-firmware,
    /// EFI, OEM, recovery, state, the extra partitions, persistent. A
    /// size-0 entry consumes the remaining space, so at most one survives
    /// and it always ends up last; when persistent itself is size-0 it
    /// wins that slot and size-0 extras are dropped.
    pub fn install_order(&self, extra_partitions: &[Partition]) -> Vec<Partition> {
        let mut ordered: Vec<Partition> =
            [&self.boot, &self.efi, &self.oem, &self.recovery, &self.state]
                .into_iter()
                .flatten()
                .cloned()
                .collect();

        let mut fill: Option<Partition> = None;
        for part in extra_partitions {
            if part.size_mib == 0 {
                if fill.is_some() {
                    debug!("Dropping extra partition '{}': the remaining space is already spoken for", part.name);
                } else {
                    fill = Some(part.clone());
                }
                continue;
            }
            ordered.push(part.clone());
        }

        if let Some(persistent) = &self.persistent {
            if persistent.size_mib == 0 {
                if let Some(dropped) = fill.take() {
                    debug!(
                        "Dropping extra partition '{}': persistent consumes the remaining space",
                        dropped.name
                    );
                }
                fill = Some(persistent.clone());
            } else {
                ordered.push(persistent.clone());
            }
        }

        if let Some(fill) = fill {
            ordered.push(fill);
        }
        ordered
    }

    /// Role partitions that get mounted, ordered by mount-path depth
    /// (shallow first). `reverse` flips the order for unmount safety.
    pub fn mount_order(&self, reverse: bool) -> Vec<Partition> {
        let mut mounted: Vec<Partition> = [&self.oem, &self.persistent]
            .into_iter()
            .flatten()
            .filter(|p| p.mount_point.is_some())
            .cloned()
            .collect();
        mounted.sort_by_key(|p| {
            let mount_point = p.mount_point.clone().unwrap_or_default();
            (mount_point.components().count(), mount_point)
        });
        if reverse {
            mounted.reverse();
        }
        mounted
    }

    /// Installs the boot-support partition matching the firmware and table
    /// kind. On MSDOS tables no extra partition is created; the state
    /// partition takes the boot flag instead and must therefore exist.
    pub fn set_firmware_partitions(
        &mut self,
        firmware: Firmware,
        table: TableLabel,
    ) -> Result<(), ValidationError> {
        match (firmware, table) {
            (Firmware::Uefi, TableLabel::Gpt) => {
                self.efi = Some(Partition {
                    name: EFI_PART_NAME.to_string(),
                    filesystem_label: EFI_LABEL.to_string(),
                    size_mib: EFI_PART_SIZE_MIB,
                    fs: Some(FileSystem::Vfat),
                    mount_point: Some(EFI_MOUNT_POINT.into()),
                    flags: vec![ESP_FLAG.to_string(), BOOT_FLAG.to_string()],
                    ..Default::default()
                });
                self.boot = None;
            }
            (Firmware::Bios, TableLabel::Gpt) => {
                self.boot = Some(Partition {
                    name: BOOT_PART_NAME.to_string(),
                    size_mib: BOOT_PART_SIZE_MIB,
                    flags: vec![BIOS_GRUB_FLAG.to_string()],
                    ..Default::default()
                });
                self.efi = None;
            }
            (_, TableLabel::Msdos) => {
                let state = self
                    .state
                    .as_mut()
                    .ok_or(ValidationError::MsdosRequiresState)?;
                state.flags = vec![BOOT_FLAG.to_string()];
                self.boot = None;
                self.efi = None;
            }
        }
        Ok(())
    }

    /// Fills in default names, filesystem labels and filesystems for every
    /// bound role. Firmware partitions are handled by
    /// [`PartitionSet::set_firmware_partitions`].
    pub fn apply_role_defaults(&mut self) {
        for (slot, name, label) in [
            (&mut self.oem, OEM_PART_NAME, OEM_LABEL),
            (&mut self.recovery, RECOVERY_PART_NAME, RECOVERY_LABEL),
            (&mut self.state, STATE_PART_NAME, STATE_LABEL),
            (&mut self.persistent, PERSISTENT_PART_NAME, PERSISTENT_LABEL),
        ] {
            if let Some(part) = slot {
                if part.name.is_empty() {
                    part.name = name.to_string();
                }
                if part.filesystem_label.is_empty() {
                    part.filesystem_label = label.to_string();
                }
                if part.fs.is_none() {
                    part.fs = Some(FileSystem::Ext4);
                }
            }
        }
    }
}

fn find_role(partitions: &[Partition], name: &str, label: Option<&str>) -> Option<Partition> {
    if let Some(by_name) = partitions.iter().find(|p| p.name == name) {
        return Some(by_name.clone());
    }
    let label = label?;
    let by_label: Vec<&Partition> = partitions
        .iter()
        .filter(|p| p.filesystem_label == label)
        .collect();
    by_label
        .iter()
        .find(|p| p.is_mounted())
        .or_else(|| by_label.first())
        .map(|p| (*p).clone())
}

/// A clean-install request; consumed once, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InstallSpec {
    /// Target block device.
    pub target: PathBuf,

    #[serde(default)]
    pub firmware: Firmware,

    #[serde(default)]
    pub part_table: TableLabel,

    #[serde(default)]
    pub partitions: PartitionSet,

    /// User-defined partitions appended after the role partitions.
    #[serde(default)]
    pub extra_partitions: Vec<Partition>,

    /// Alternate bootable image to install from when no active image
    /// source is configured.
    #[serde(default)]
    pub iso: Option<PathBuf>,

    #[serde(default)]
    pub active: Image,

    #[serde(default)]
    pub recovery: Image,

    #[serde(default)]
    pub passive: Image,

    #[serde(default)]
    pub no_format: bool,

    #[serde(default)]
    pub reboot: bool,

    #[serde(default)]
    pub poweroff: bool,

    /// Paths excluded when the system tree is copied into place.
    #[serde(default)]
    pub exclude_paths: Vec<PathBuf>,
}

/// A factory-reset request against an already-installed system.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResetSpec {
    #[serde(default)]
    pub active: Image,

    #[serde(default)]
    pub passive: Image,

    /// Role partitions as discovered on the running system.
    #[serde(default)]
    pub partitions: PartitionSet,

    #[serde(default)]
    pub reset_persistent: bool,

    #[serde(default)]
    pub reset_oem: bool,

    #[serde(default)]
    pub reboot: bool,

    #[serde(default)]
    pub poweroff: bool,

    #[serde(default)]
    pub exclude_paths: Vec<PathBuf>,
}

/// An upgrade request, targeting either the active system or the recovery
/// system.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpgradeSpec {
    /// Upgrade the recovery system instead of the active one.
    #[serde(default)]
    pub recovery_upgrade: bool,

    #[serde(default)]
    pub active: Image,

    #[serde(default)]
    pub recovery: Image,

    #[serde(default)]
    pub passive: Image,

    /// Role partitions as discovered on the running system.
    #[serde(default)]
    pub partitions: PartitionSet,

    #[serde(default)]
    pub reboot: bool,

    #[serde(default)]
    pub poweroff: bool,
}
