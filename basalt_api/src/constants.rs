use const_format::concatcp;

/// Runtime directory used for transient mounts owned by the installer.
pub const RUN_DIR: &str = "/run/basalt";

/// Role partition names, as written into the partition table.
pub const BOOT_PART_NAME: &str = "bios";
pub const EFI_PART_NAME: &str = "efi";
pub const OEM_PART_NAME: &str = "oem";
pub const RECOVERY_PART_NAME: &str = "recovery";
pub const STATE_PART_NAME: &str = "state";
pub const PERSISTENT_PART_NAME: &str = "persistent";

/// Names of the two interchangeable system partitions on A/B capable
/// boards; exactly one carries the active name at a time.
pub const ACTIVE_PART_NAME: &str = "active";
pub const PASSIVE_PART_NAME: &str = "passive";

/// Default filesystem labels for the role partitions. The EFI label must
/// stay within the 11 characters vfat allows.
pub const EFI_LABEL: &str = "BASALT_EFI";
pub const OEM_LABEL: &str = "BASALT_OEM";
pub const RECOVERY_LABEL: &str = "BASALT_RECOVERY";
pub const STATE_LABEL: &str = "BASALT_STATE";
pub const PERSISTENT_LABEL: &str = "BASALT_PERSIST";

/// Default role partition sizes in MiB; persistent defaults to 0, meaning
/// "consume all remaining space".
pub const BOOT_PART_SIZE_MIB: u64 = 1;
pub const EFI_PART_SIZE_MIB: u64 = 64;
pub const OEM_PART_SIZE_MIB: u64 = 64;
pub const RECOVERY_PART_SIZE_MIB: u64 = 4096;
pub const STATE_PART_SIZE_MIB: u64 = 8192;

/// Default mount points.
pub const EFI_MOUNT_POINT: &str = "/boot/efi";
pub const OEM_MOUNT_POINT: &str = "/oem";
pub const PERSISTENT_MOUNT_POINT: &str = "/usr/local";
pub const STATE_MOUNT_POINT: &str = concatcp!(RUN_DIR, "/state");
pub const RECOVERY_MOUNT_POINT: &str = concatcp!(RUN_DIR, "/recovery");

/// Recovery image file names; which one applies depends on the image's
/// filesystem kind.
pub const RECOVERY_IMG_FILE: &str = "recovery.img";
pub const RECOVERY_SQUASH_FILE: &str = "recovery.squashfs";

/// Partition flags understood by the partitioning tool.
pub const BOOT_FLAG: &str = "boot";
pub const ESP_FLAG: &str = "esp";
pub const BIOS_GRUB_FLAG: &str = "bios_grub";

/// Filesystem type udev reports for a locked encrypted volume; such
/// partitions are only usable through their device-mapper counterpart.
pub const ENCRYPTED_FS_MARKER: &str = "crypto_LUKS";

/// System metadata locations, relative to the scanner root so discovery
/// can be pointed at a replica tree.
pub const SYS_BLOCK_DIR: &str = "sys/block";
pub const UDEV_DATA_DIR: &str = "run/udev/data";
pub const PROC_MOUNTS_FILE: &str = "proc/mounts";
pub const DEV_DIR: &str = "dev";
pub const DEV_MAPPER_DIR: &str = "dev/mapper";
pub const DEV_BY_LABEL_DIR: &str = "dev/disk/by-label";

pub const MIB: u64 = 1024 * 1024;

/// The first partition is aligned to this offset.
pub const PART_ALIGN_BYTES: u64 = MIB;

/// Expansion is refused when a disk has less free space than this, so a
/// grown system does not retry a pointless expansion on every boot.
pub const EXPANSION_MARGIN_MIB: u64 = 10;
