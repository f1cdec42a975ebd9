pub mod ab;
pub mod disk;

use log::info;

use basalt_api::{
    config::{Partition, PartitionSet},
    error::StorageError,
    primitives::TableLabel,
};
use osutils::{dependencies::CommandRunner, mkfs};

use self::disk::Disk;

/// Creates the full install layout on `disk`: a fresh partition table,
/// then every role and extra partition in install order, formatting
/// everything except boot-firmware partitions.
pub fn partition_and_format<R: CommandRunner>(
    disk: &mut Disk<R>,
    table: TableLabel,
    set: &PartitionSet,
    extra_partitions: &[Partition],
) -> Result<(), StorageError> {
    disk.new_partition_table(table)?;

    for part in set.install_order(extra_partitions) {
        let number = disk.add_partition(part.size_mib, part.fs.as_ref(), &part.name, &part.flags)?;
        if part.is_boot_firmware() {
            info!("Skipping format of boot-firmware partition '{}'", part.name);
            continue;
        }
        let Some(fs) = &part.fs else {
            continue;
        };
        let device = disk.find_partition_device(number)?;
        mkfs::format_device(disk.runner(), &device, fs, &part.filesystem_label, &[])?;
    }
    Ok(())
}
