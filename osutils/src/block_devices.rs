use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use log::{debug, warn};

use basalt_api::{
    config::Partition,
    constants::{
        DEV_BY_LABEL_DIR, DEV_DIR, DEV_MAPPER_DIR, EFI_LABEL, ENCRYPTED_FS_MARKER, MIB,
        PROC_MOUNTS_FILE, SYS_BLOCK_DIR, UDEV_DATA_DIR,
    },
    error::StorageError,
    primitives::{FileSystem, FsUuid},
};

use crate::{
    dependencies::CommandRunner,
    mounts::{self, MountEntry},
    retry::RetryPolicy,
    udevadm,
};

/// Read-only view over the system's block-device metadata: the sysfs tree,
/// the udev event database and the live mount table. The root is
/// injectable so tests can run against a replica assembled in a temporary
/// directory.
#[derive(Debug, Clone)]
pub struct BlockDeviceScanner {
    root: PathBuf,
}

impl Default for BlockDeviceScanner {
    fn default() -> Self {
        Self::new("/")
    }
}

impl BlockDeviceScanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn sys_block(&self) -> PathBuf {
        self.root.join(SYS_BLOCK_DIR)
    }

    fn dev_path(&self, name: &str) -> PathBuf {
        self.root.join(DEV_DIR).join(name)
    }

    fn mount_table(&self) -> Result<Vec<MountEntry>, StorageError> {
        mounts::read_mount_table(&self.root.join(PROC_MOUNTS_FILE))
    }

    /// Enumerates every partition the kernel knows about. Results can be
    /// stale if queried while udev is still processing events. Locked
    /// encrypted partitions are excluded; their unlocked device-mapper
    /// counterpart is resolved separately.
    pub fn list_partitions(&self) -> Result<Vec<Partition>, StorageError> {
        let mount_table = self.mount_table()?;
        let block_dir = self.sys_block();
        let entries = fs::read_dir(&block_dir).map_err(|source| StorageError::Open {
            path: block_dir.clone(),
            source,
        })?;
        let mut disks: Vec<String> = entries
            .flatten()
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        disks.sort();

        let mut partitions = Vec::new();
        for disk in disks {
            let disk_dir = block_dir.join(&disk);
            let Ok(children) = fs::read_dir(&disk_dir) else {
                continue;
            };

            let mut on_disk = Vec::new();
            for child in children.flatten() {
                let name = child.file_name().to_string_lossy().into_owned();
                let child_dir = disk_dir.join(&name);
                if !name.starts_with(&disk) || !child_dir.join("partition").is_file() {
                    continue;
                }
                match self.read_partition(&disk, &name, &child_dir, &mount_table) {
                    Ok(Some(partition)) => on_disk.push(partition),
                    Ok(None) => {}
                    Err(e) => warn!("Skipping partition '{name}': {e}"),
                }
            }
            on_disk.sort_by_key(|partition| partition.number);
            partitions.extend(on_disk);
        }
        Ok(partitions)
    }

    fn read_partition(
        &self,
        disk: &str,
        name: &str,
        part_dir: &Path,
        mount_table: &[MountEntry],
    ) -> Result<Option<Partition>, StorageError> {
        let number: u32 = read_trimmed(&part_dir.join("partition"))?
            .parse()
            .map_err(|_| StorageError::Parse {
                line: part_dir.join("partition").display().to_string(),
                reason: "invalid partition number".to_string(),
            })?;
        let size_sectors: u64 = read_trimmed(&part_dir.join("size"))?
            .parse()
            .map_err(|_| StorageError::Parse {
                line: part_dir.join("size").display().to_string(),
                reason: "invalid partition size".to_string(),
            })?;
        let major_minor = read_trimmed(&part_dir.join("dev"))?;
        let udev = self.read_udev_record(&major_minor);

        let path = self.dev_path(name);
        let mount = mounts::entry_for_device(mount_table, &path);

        let fs = mount
            .map(|entry| entry.fs_type.clone())
            .or_else(|| udev.get("ID_FS_TYPE").cloned());
        if fs.as_deref() == Some(ENCRYPTED_FS_MARKER) {
            debug!("Excluding locked encrypted partition '{}'", path.display());
            return Ok(None);
        }

        // The sysfs size file counts 512-byte units regardless of the
        // device's logical sector size.
        Ok(Some(Partition {
            name: udev.get("ID_PART_ENTRY_NAME").cloned().unwrap_or_default(),
            filesystem_label: udev.get("ID_FS_LABEL").cloned().unwrap_or_default(),
            size_mib: size_sectors * 512 / MIB,
            fs: fs.map(FileSystem::from),
            mount_point: mount.map(|entry| entry.mount_point.clone()),
            flags: Vec::new(),
            path: Some(path),
            disk: Some(self.dev_path(disk)),
            number,
            uuid: udev.get("ID_FS_UUID").map(|uuid| FsUuid::from(uuid.as_str())),
        }))
    }

    /// Resolves an unlocked encrypted volume by the filesystem label
    /// recorded in the udev database. The returned path is the mapper
    /// node: the by-label link may still point at the locked ciphertext
    /// device. Read failures are logged and treated as no-match.
    pub fn resolve_via_device_mapper(&self, label: &str) -> Option<Partition> {
        let block_dir = self.sys_block();
        let entries = match fs::read_dir(&block_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot read '{}': {e}", block_dir.display());
                return None;
            }
        };
        let mount_table = self.mount_table().unwrap_or_else(|e| {
            warn!("Cannot read mount table: {e}");
            Vec::new()
        });

        for entry in entries.flatten() {
            let node = entry.file_name().to_string_lossy().into_owned();
            if !node.starts_with("dm-") {
                continue;
            }
            let dm_dir = block_dir.join(&node);
            let Ok(major_minor) = read_trimmed(&dm_dir.join("dev")) else {
                continue;
            };
            let udev = self.read_udev_record(&major_minor);
            if udev.get("ID_FS_LABEL").map(String::as_str) != Some(label) {
                continue;
            }
            let Ok(mapper_name) = read_trimmed(&dm_dir.join("dm/name")) else {
                warn!("Device-mapper node '{node}' has no name");
                continue;
            };
            let size_sectors: u64 = read_trimmed(&dm_dir.join("size"))
                .ok()
                .and_then(|size| size.parse().ok())
                .unwrap_or(0);

            // The slave is the ciphertext partition; its name points back
            // at the parent disk.
            let disk = first_dir_entry(&dm_dir.join("slaves"))
                .map(|slave| self.dev_path(parent_disk_name(&slave)));

            let path = self.root.join(DEV_MAPPER_DIR).join(&mapper_name);
            let mount = mounts::entry_for_device(&mount_table, &path)
                .or_else(|| mounts::entry_for_device(&mount_table, &self.dev_path(&node)));

            return Some(Partition {
                name: mapper_name,
                filesystem_label: label.to_string(),
                size_mib: size_sectors * 512 / MIB,
                fs: udev.get("ID_FS_TYPE").cloned().map(FileSystem::from),
                mount_point: mount.map(|entry| entry.mount_point.clone()),
                flags: Vec::new(),
                path: Some(path),
                disk,
                number: 0,
                uuid: udev.get("ID_FS_UUID").map(|uuid| FsUuid::from(uuid.as_str())),
            });
        }
        None
    }

    /// The partition carrying the EFI filesystem label.
    pub fn find_efi_partition(&self) -> Result<Partition, StorageError> {
        self.list_partitions()?
            .into_iter()
            .find(|partition| partition.filesystem_label == EFI_LABEL)
            .ok_or_else(|| StorageError::LabelNotFound {
                label: EFI_LABEL.to_string(),
            })
    }

    /// Bounded-retry lookup of a device node by filesystem label. Label
    /// links appear asynchronously, so the udev queue is settled before
    /// every attempt.
    pub fn get_device_by_label<R: CommandRunner>(
        &self,
        runner: &R,
        label: &str,
        policy: RetryPolicy,
    ) -> Result<PathBuf, StorageError> {
        let link = self.root.join(DEV_BY_LABEL_DIR).join(label);
        policy
            .run(&format!("device for label '{label}'"), |_| {
                if let Err(e) = udevadm::settle(runner) {
                    warn!("udev settle failed while waiting for label '{label}': {e:#}");
                }
                link.exists().then(|| link.clone())
            })
            .ok_or_else(|| StorageError::LabelNotFound {
                label: label.to_string(),
            })
    }

    fn read_udev_record(&self, major_minor: &str) -> HashMap<String, String> {
        let path = self.root.join(UDEV_DATA_DIR).join(format!("b{major_minor}"));
        match fs::read_to_string(&path) {
            Ok(contents) => parse_udev_record(&contents),
            Err(_) => {
                debug!("No udev record at '{}'", path.display());
                HashMap::new()
            }
        }
    }
}

/// Parses a udev event-database record: `E:`-prefixed `KEY=VALUE` lines,
/// everything else is ignored.
fn parse_udev_record(contents: &str) -> HashMap<String, String> {
    contents
        .lines()
        .filter_map(|line| line.strip_prefix("E:"))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

fn read_trimmed(path: &Path) -> Result<String, StorageError> {
    Ok(fs::read_to_string(path)
        .map_err(|source| StorageError::Open {
            path: path.to_path_buf(),
            source,
        })?
        .trim()
        .to_string())
}

fn first_dir_entry(dir: &Path) -> Option<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names.into_iter().next()
}

/// `sda2` -> `sda`, `nvme0n1p2` -> `nvme0n1`.
fn parent_disk_name(partition: &str) -> &str {
    let trimmed = partition.trim_end_matches(|c: char| c.is_ascii_digit());
    match trimmed.strip_suffix('p') {
        Some(base) if base.ends_with(|c: char| c.is_ascii_digit()) => base,
        _ => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tempfile::TempDir;

    use crate::testutils::FakeRunner;

    /// Assembles a minimal replica of the kernel's block-device metadata.
    struct Replica {
        root: TempDir,
    }

    impl Replica {
        fn new() -> Self {
            let root = TempDir::new().unwrap();
            fs::create_dir_all(root.path().join(SYS_BLOCK_DIR)).unwrap();
            fs::create_dir_all(root.path().join(UDEV_DATA_DIR)).unwrap();
            fs::create_dir_all(root.path().join("proc")).unwrap();
            fs::write(root.path().join(PROC_MOUNTS_FILE), "").unwrap();
            Self { root }
        }

        fn scanner(&self) -> BlockDeviceScanner {
            BlockDeviceScanner::new(self.root.path())
        }

        fn add_disk(&self, disk: &str) {
            fs::create_dir_all(self.root.path().join(SYS_BLOCK_DIR).join(disk)).unwrap();
        }

        fn add_partition(
            &self,
            disk: &str,
            name: &str,
            number: u32,
            size_sectors: u64,
            major_minor: &str,
            udev_record: &str,
        ) {
            let dir = self.root.path().join(SYS_BLOCK_DIR).join(disk).join(name);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("partition"), format!("{number}\n")).unwrap();
            fs::write(dir.join("size"), format!("{size_sectors}\n")).unwrap();
            fs::write(dir.join("dev"), format!("{major_minor}\n")).unwrap();
            fs::write(
                self.root
                    .path()
                    .join(UDEV_DATA_DIR)
                    .join(format!("b{major_minor}")),
                udev_record,
            )
            .unwrap();
        }

        fn set_mounts(&self, contents: &str) {
            fs::write(self.root.path().join(PROC_MOUNTS_FILE), contents).unwrap();
        }
    }

    #[test]
    fn test_list_partitions() {
        let replica = Replica::new();
        replica.add_disk("sda");
        replica.add_partition(
            "sda",
            "sda1",
            1,
            131072,
            "8:1",
            "E:ID_FS_TYPE=vfat\nE:ID_FS_LABEL=BASALT_EFI\nE:ID_FS_UUID=84A0-088E\nE:ID_PART_ENTRY_NAME=efi\n",
        );
        replica.add_partition(
            "sda",
            "sda2",
            2,
            16777216,
            "8:2",
            "E:ID_FS_TYPE=ext4\nE:ID_FS_LABEL=BASALT_STATE\nE:ID_PART_ENTRY_NAME=state\n",
        );
        let mount_point = replica
            .root
            .path()
            .join(DEV_DIR)
            .join("sda2")
            .display()
            .to_string();
        replica.set_mounts(&format!("{mount_point} /run/basalt/state ext4 rw 0 0\n"));

        let partitions = replica.scanner().list_partitions().unwrap();
        assert_eq!(partitions.len(), 2);

        let efi = &partitions[0];
        assert_eq!(efi.name, "efi");
        assert_eq!(efi.filesystem_label, "BASALT_EFI");
        assert_eq!(efi.fs, Some(FileSystem::Vfat));
        assert_eq!(efi.size_mib, 64);
        assert_eq!(efi.number, 1);
        assert_eq!(efi.mount_point, None);
        assert_eq!(efi.uuid, Some(FsUuid::Relaxed("84A0-088E".into())));

        let state = &partitions[1];
        assert_eq!(state.name, "state");
        assert_eq!(state.size_mib, 8192);
        assert_eq!(
            state.mount_point,
            Some(PathBuf::from("/run/basalt/state"))
        );
        assert!(state
            .disk
            .as_ref()
            .unwrap()
            .ends_with(Path::new("dev/sda")));
    }

    #[test]
    fn test_list_partitions_excludes_locked_encrypted() {
        let replica = Replica::new();
        replica.add_disk("sda");
        replica.add_partition(
            "sda",
            "sda1",
            1,
            2048,
            "8:1",
            "E:ID_FS_TYPE=crypto_LUKS\nE:ID_FS_LABEL=SECRETS\n",
        );
        replica.add_partition("sda", "sda2", 2, 2048, "8:2", "E:ID_FS_TYPE=ext4\n");

        let partitions = replica.scanner().list_partitions().unwrap();
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].number, 2);
    }

    #[test]
    fn test_list_partitions_without_udev_record() {
        let replica = Replica::new();
        replica.add_disk("sdb");
        let dir = replica.root.path().join(SYS_BLOCK_DIR).join("sdb/sdb1");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("partition"), "1\n").unwrap();
        fs::write(dir.join("size"), "2048\n").unwrap();
        fs::write(dir.join("dev"), "8:17\n").unwrap();

        let partitions = replica.scanner().list_partitions().unwrap();
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].name, "");
        assert_eq!(partitions[0].fs, None);
        assert_eq!(partitions[0].size_mib, 1);
    }

    #[test]
    fn test_find_efi_partition() {
        let replica = Replica::new();
        replica.add_disk("sda");
        replica.add_partition(
            "sda",
            "sda1",
            1,
            131072,
            "8:1",
            "E:ID_FS_TYPE=vfat\nE:ID_FS_LABEL=BASALT_EFI\n",
        );
        let efi = replica.scanner().find_efi_partition().unwrap();
        assert_eq!(efi.filesystem_label, EFI_LABEL);

        let empty = Replica::new();
        match empty.scanner().find_efi_partition().unwrap_err() {
            StorageError::LabelNotFound { label } => assert_eq!(label, EFI_LABEL),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_resolve_via_device_mapper() {
        let replica = Replica::new();
        replica.add_disk("sda");
        let dm_dir = replica.root.path().join(SYS_BLOCK_DIR).join("dm-0");
        fs::create_dir_all(dm_dir.join("dm")).unwrap();
        fs::create_dir_all(dm_dir.join("slaves/sda2")).unwrap();
        fs::write(dm_dir.join("dev"), "254:0\n").unwrap();
        fs::write(dm_dir.join("dm/name"), "persistent_unlocked\n").unwrap();
        fs::write(dm_dir.join("size"), "4194304\n").unwrap();
        fs::write(
            replica.root.path().join(UDEV_DATA_DIR).join("b254:0"),
            "E:ID_FS_TYPE=ext4\nE:ID_FS_LABEL=BASALT_PERSIST\n",
        )
        .unwrap();
        let mapper_path = replica
            .root
            .path()
            .join(DEV_MAPPER_DIR)
            .join("persistent_unlocked");
        replica.set_mounts(&format!("{} /usr/local ext4 rw 0 0\n", mapper_path.display()));

        let partition = replica
            .scanner()
            .resolve_via_device_mapper("BASALT_PERSIST")
            .unwrap();
        assert_eq!(partition.name, "persistent_unlocked");
        assert_eq!(partition.size_mib, 2048);
        assert_eq!(partition.fs, Some(FileSystem::Ext4));
        assert_eq!(partition.path, Some(mapper_path));
        assert_eq!(partition.mount_point, Some(PathBuf::from("/usr/local")));
        assert!(partition
            .disk
            .as_ref()
            .unwrap()
            .ends_with(Path::new("dev/sda")));

        assert!(replica
            .scanner()
            .resolve_via_device_mapper("NO_SUCH_LABEL")
            .is_none());
    }

    #[test]
    fn test_get_device_by_label() {
        let replica = Replica::new();
        let by_label = replica.root.path().join(DEV_BY_LABEL_DIR);
        fs::create_dir_all(&by_label).unwrap();
        fs::write(by_label.join("BASALT_STATE"), "").unwrap();

        let runner = FakeRunner::new();
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let path = replica
            .scanner()
            .get_device_by_label(&runner, "BASALT_STATE", policy)
            .unwrap();
        assert!(path.ends_with(Path::new("dev/disk/by-label/BASALT_STATE")));
        assert_eq!(runner.calls(), ["udevadm settle"]);

        let err = replica
            .scanner()
            .get_device_by_label(&runner, "MISSING", policy)
            .unwrap_err();
        assert!(matches!(err, StorageError::LabelNotFound { .. }));
        // One settle per attempt.
        assert_eq!(runner.calls().len(), 4);
    }

    #[test]
    fn test_parent_disk_name() {
        assert_eq!(parent_disk_name("sda2"), "sda");
        assert_eq!(parent_disk_name("nvme0n1p2"), "nvme0n1");
        assert_eq!(parent_disk_name("mmcblk0p1"), "mmcblk0");
        assert_eq!(parent_disk_name("sda"), "sda");
    }

    #[test]
    fn test_parse_udev_record() {
        let record = "S:disk/by-label/DATA\nE:ID_FS_TYPE=ext4\nE:ID_FS_LABEL=DATA\nG:systemd\n";
        let parsed = parse_udev_record(record);
        assert_eq!(parsed.get("ID_FS_TYPE").unwrap(), "ext4");
        assert_eq!(parsed.get("ID_FS_LABEL").unwrap(), "DATA");
        assert_eq!(parsed.len(), 2);
    }
}
