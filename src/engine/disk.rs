use std::path::{Path, PathBuf};

use anyhow::anyhow;
use log::{debug, info, warn};

use basalt_api::{
    constants::{EXPANSION_MARGIN_MIB, MIB, PART_ALIGN_BYTES},
    error::StorageError,
    primitives::{FileSystem, TableLabel},
};
use osutils::{
    dependencies::{CommandRunner, Dependency},
    e2fsck, lsblk, mount,
    parted::{self, PartedBatch, PartedTable, TablePartition},
    resize2fs,
    retry::RetryPolicy,
    udevadm, xfs_growfs,
};

/// Handle on a physical disk. The cached partition table is a snapshot
/// substituted atomically by [`Disk::reload`]; every mutating operation
/// leaves the handle unloaded on failure, forcing a reload before the
/// cached fields can be trusted again.
#[derive(Debug)]
pub struct Disk<R> {
    device: PathBuf,
    runner: R,
    retry: RetryPolicy,
    dev_root: PathBuf,
    table: Option<PartedTable>,
}

impl<R: CommandRunner> Disk<R> {
    pub fn new(device: impl Into<PathBuf>, runner: R) -> Self {
        Self {
            device: device.into(),
            runner,
            retry: RetryPolicy::default(),
            dev_root: PathBuf::from("/"),
            table: None,
        }
    }

    /// Overrides the partition-device polling policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Points device-node existence checks at an alternate filesystem
    /// root.
    pub fn with_dev_root(mut self, dev_root: impl Into<PathBuf>) -> Self {
        self.dev_root = dev_root.into();
        self
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    fn table(&self) -> Result<&PartedTable, StorageError> {
        self.table.as_ref().ok_or_else(|| StorageError::NotLoaded {
            path: self.device.clone(),
        })
    }

    pub fn sector_size(&self) -> Result<u64, StorageError> {
        Ok(self.table()?.sector_size)
    }

    pub fn last_sector(&self) -> Result<u64, StorageError> {
        Ok(self.table()?.last_sector)
    }

    pub fn label(&self) -> Result<TableLabel, StorageError> {
        Ok(self.table()?.label)
    }

    pub fn partitions(&self) -> Result<&[TablePartition], StorageError> {
        Ok(&self.table()?.partitions)
    }

    /// Prints and caches the partition table. When the tool warns about
    /// unallocated space (the table geometry no longer covers a resized
    /// disk) the GPT headers are repaired first and the table re-printed.
    pub fn reload(&mut self) -> Result<(), StorageError> {
        self.table = None;

        let mut output = parted::print_raw(&self.runner, &self.device)?;
        let combined = format!("{}{}", output.output(), output.error_output());
        if combined.contains(parted::UNALLOCATED_SPACE_MARKER) {
            info!(
                "Partition table on '{}' does not span the whole device, repairing GPT headers",
                self.device.display()
            );
            self.repair_gpt_headers()?;
            output = parted::print_raw(&self.runner, &self.device)?;
        }

        self.table = Some(parted::parse_print(&output.check_output()?)?);
        Ok(())
    }

    /// Moves the backup GPT header to the end of the device.
    fn repair_gpt_headers(&self) -> Result<(), StorageError> {
        let cmd = Dependency::Sgdisk.cmd().with_arg("-e").with_arg(&self.device);
        self.runner.output(&cmd)?.check()?;
        Ok(())
    }

    /// Writes a fresh, empty partition table.
    pub fn new_partition_table(&mut self, label: TableLabel) -> Result<(), StorageError> {
        info!(
            "Creating new {label} partition table on '{}'",
            self.device.display()
        );
        self.table = None;
        PartedBatch::new(&self.device, label)
            .mklabel()
            .commit(&self.runner)?;
        self.reload()
    }

    /// Sectors between the end of the last partition (or the 1 MiB
    /// alignment offset on an empty disk) and the last addressable
    /// sector.
    pub fn get_free_space(&self) -> Result<u64, StorageError> {
        Ok(free_sectors(self.table()?))
    }

    /// Creates a partition of `size_mib` MiB at the end of the current
    /// layout; 0 consumes all remaining space. Returns the number the
    /// tool assigned. Validation failures leave the table untouched.
    pub fn add_partition(
        &mut self,
        size_mib: u64,
        fs: Option<&FileSystem>,
        name: &str,
        flags: &[String],
    ) -> Result<u32, StorageError> {
        let (label, sector_size, free, start, number) = {
            let table = self.table()?;
            (
                table.label,
                table.sector_size,
                free_sectors(table),
                table
                    .partitions
                    .last()
                    .map(|last| last.start + last.size)
                    .unwrap_or(PART_ALIGN_BYTES / table.sector_size),
                table.partitions.last().map(|last| last.number).unwrap_or(0) + 1,
            )
        };

        let size = if size_mib == 0 {
            free
        } else {
            size_mib * MIB / sector_size
        };
        if size == 0 || size > free {
            return Err(StorageError::InsufficientSpace {
                disk: self.device.clone(),
                requested: size,
                available: free,
            });
        }

        debug!(
            "Creating partition {number} ('{name}') on '{}' at sectors [{start}, {}]",
            self.device.display(),
            start + size - 1,
        );
        let mut batch =
            PartedBatch::new(&self.device, label).mkpart(name, fs, start, start + size - 1);
        for flag in flags {
            batch = batch.set_flag(number, flag, true);
        }

        self.table = None;
        batch.commit(&self.runner)?;
        self.reload()?;
        Ok(number)
    }

    /// Grows the last partition to `size_mib` MiB (0 fills the disk),
    /// then grows its filesystem in place. Shrinking is rejected. Returns
    /// the partition device path.
    ///
    /// A failure after the table write leaves the partition grown but the
    /// filesystem untouched; re-running the expansion completes it.
    pub fn expand_last_partition(&mut self, size_mib: u64) -> Result<PathBuf, StorageError> {
        let (last, label, sector_size, last_sector, free) = {
            let table = self.table()?;
            let last = table.partitions.last().cloned().ok_or_else(|| {
                StorageError::Other(anyhow!(
                    "There is no partition to expand on '{}'",
                    self.device.display()
                ))
            })?;
            (
                last,
                table.label,
                table.sector_size,
                table.last_sector,
                free_sectors(table),
            )
        };

        let margin = EXPANSION_MARGIN_MIB * MIB / sector_size;
        if free < margin {
            return Err(StorageError::InsufficientSpace {
                disk: self.device.clone(),
                requested: margin,
                available: free,
            });
        }

        let new_size = if size_mib == 0 {
            last_sector - last.start + 1
        } else {
            let requested = size_mib * MIB / sector_size;
            if requested < last.size {
                return Err(StorageError::Other(anyhow!(
                    "Partition {} on '{}' cannot shrink from {} to {requested} sectors",
                    last.number,
                    self.device.display(),
                    last.size,
                )));
            }
            // The second-to-last partition's end is the allocation floor:
            // the grown partition may span its own sectors plus the free
            // tail, nothing more.
            if requested > last.size + free {
                return Err(StorageError::InsufficientSpace {
                    disk: self.device.clone(),
                    requested,
                    available: last.size + free,
                });
            }
            requested
        };

        info!(
            "Expanding partition {} on '{}' from {} to {new_size} sectors",
            last.number,
            self.device.display(),
            last.size,
        );
        let fs = last.fs.as_deref().map(FileSystem::from);
        self.table = None;
        PartedBatch::new(&self.device, label)
            .rm(last.number)
            .mkpart(
                last.name.as_deref().unwrap_or(""),
                fs.as_ref(),
                last.start,
                last.start + new_size - 1,
            )
            .commit(&self.runner)?;
        self.reload()?;

        let device = self.find_partition_device(last.number)?;
        self.grow_filesystem(&device)?;
        Ok(device)
    }

    /// Device node for partition `number`. Partition rescan after a table
    /// write is asynchronous, so the node is polled with a udev settle
    /// per attempt.
    pub fn find_partition_device(&self, number: u32) -> Result<PathBuf, StorageError> {
        let device = partition_device_path(&self.device, number);
        let probe = self.probe_path(&device);
        self.retry
            .run(&format!("partition device '{}'", device.display()), |_| {
                if let Err(e) = udevadm::settle(&self.runner) {
                    warn!(
                        "udev settle failed while waiting for '{}': {e:#}",
                        device.display()
                    );
                }
                probe.exists().then(|| device.clone())
            })
            .ok_or_else(|| StorageError::PartitionDeviceNotFound {
                disk: self.device.clone(),
                number,
                attempts: self.retry.max_attempts,
            })
    }

    fn probe_path(&self, device: &Path) -> PathBuf {
        match device.strip_prefix("/") {
            Ok(relative) => self.dev_root.join(relative),
            Err(_) => device.to_path_buf(),
        }
    }

    /// Grows the filesystem on `device` to fill it, dispatching on the
    /// detected type. Unknown filesystems are an explicit error rather
    /// than a silent skip.
    fn grow_filesystem(&self, device: &Path) -> Result<(), StorageError> {
        let fs = lsblk::fs_type(&self.runner, device)?.unwrap_or_default();
        debug!("Growing {fs} filesystem on '{}'", device.display());
        match fs.as_str() {
            "ext2" | "ext3" | "ext4" => {
                e2fsck::run(&self.runner, device)?;
                resize2fs::run(&self.runner, device)?;
                Ok(())
            }
            "xfs" => self.grow_xfs(device),
            _ => Err(StorageError::ResizeUnsupported {
                device: device.to_path_buf(),
                filesystem: fs,
            }),
        }
    }

    /// xfs only grows while mounted, so the partition is mounted on a
    /// scratch directory for the duration. The unmount is attempted even
    /// when the grow fails, with the grow error taking precedence.
    fn grow_xfs(&self, device: &Path) -> Result<(), StorageError> {
        let scratch = tempfile::tempdir().map_err(|source| StorageError::Open {
            path: std::env::temp_dir(),
            source,
        })?;
        mount::mount(
            &self.runner,
            device,
            scratch.path(),
            Some(&FileSystem::Xfs),
            &[],
        )?;

        let grow = xfs_growfs::run(&self.runner, scratch.path());
        let unmount = mount::umount(&self.runner, scratch.path());
        if unmount.is_ok() {
            if let Err(e) = scratch.close() {
                warn!("Failed to remove scratch mount directory: {e}");
            }
        }
        grow?;
        unmount?;
        Ok(())
    }
}

fn free_sectors(table: &PartedTable) -> u64 {
    match table.partitions.last() {
        Some(last) => table.last_sector.saturating_sub(last.start + last.size - 1),
        None => table
            .last_sector
            .saturating_sub(PART_ALIGN_BYTES / table.sector_size - 1),
    }
}

/// `/dev/sda` -> `/dev/sda1`, `/dev/nvme0n1` -> `/dev/nvme0n1p1`.
pub fn partition_device_path(disk: &Path, number: u32) -> PathBuf {
    let base = disk.to_string_lossy();
    if base.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{base}p{number}"))
    } else {
        PathBuf::from(format!("{base}{number}"))
    }
}
