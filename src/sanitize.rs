use std::path::PathBuf;

use log::debug;

use basalt_api::{
    config::{InstallSpec, Partition, ResetSpec, UpgradeSpec},
    constants::{RECOVERY_IMG_FILE, RECOVERY_MOUNT_POINT, RECOVERY_SQUASH_FILE},
    error::{StorageError, ValidationError},
    primitives::FileSystem,
};
use osutils::block_devices::BlockDeviceScanner;

/// Validates and completes an install request. Rejection happens before
/// any destructive action; on success the spec carries derived defaults
/// (role labels and names, recovery image path, firmware partitions).
pub fn sanitize_install(
    spec: &mut InstallSpec,
    scanner: &BlockDeviceScanner,
) -> Result<(), StorageError> {
    // Repartitioning a disk with live mounts would pull the rug out from
    // under the running system.
    for partition in scanner.list_partitions()? {
        if partition.disk.as_deref() != Some(spec.target.as_path()) {
            continue;
        }
        if let (Some(path), Some(mount_point)) = (&partition.path, &partition.mount_point) {
            return Err(StorageError::MountedDeviceConflict {
                device: spec.target.clone(),
                partition: path.clone(),
                mount_point: mount_point.clone(),
            });
        }
    }

    if spec.active.source.is_empty() && spec.iso.is_none() {
        return Err(ValidationError::MissingSystemSource.into());
    }
    if !spec
        .partitions
        .state
        .as_ref()
        .is_some_and(Partition::is_mounted)
    {
        return Err(ValidationError::UndefinedStatePartition.into());
    }

    check_fill_conflicts(&spec.extra_partitions, spec.partitions.persistent.as_ref())?;

    spec.recovery.file = recovery_image_path(spec.partitions.recovery.as_ref(), &spec.recovery.fs);
    debug!("Recovery image will live at '{}'", spec.recovery.file.display());

    spec.partitions.apply_role_defaults();
    spec.partitions
        .set_firmware_partitions(spec.firmware, spec.part_table)?;
    Ok(())
}

/// Validates a reset request against the discovered role partitions.
pub fn sanitize_reset(spec: &mut ResetSpec) -> Result<(), StorageError> {
    if spec.active.source.is_empty() {
        return Err(ValidationError::MissingResetSource.into());
    }
    if !spec
        .partitions
        .state
        .as_ref()
        .is_some_and(Partition::is_mounted)
    {
        return Err(ValidationError::UndefinedStatePartition.into());
    }
    Ok(())
}

/// Validates an upgrade request; the recovery branch swaps which image
/// source and role partition are required.
pub fn sanitize_upgrade(spec: &mut UpgradeSpec) -> Result<(), StorageError> {
    if spec.recovery_upgrade {
        if spec.recovery.source.is_empty() {
            return Err(ValidationError::MissingRecoverySource.into());
        }
        if !spec
            .partitions
            .recovery
            .as_ref()
            .is_some_and(Partition::is_mounted)
        {
            return Err(ValidationError::UndefinedRecoveryPartition.into());
        }
    } else {
        if spec.active.source.is_empty() {
            return Err(ValidationError::MissingSystemSource.into());
        }
        if !spec
            .partitions
            .state
            .as_ref()
            .is_some_and(Partition::is_mounted)
        {
            return Err(ValidationError::UndefinedStatePartition.into());
        }
    }
    Ok(())
}

/// At most one partition may consume the remaining space: more than one
/// size-0 request is unsatisfiable.
fn check_fill_conflicts(
    extra_partitions: &[Partition],
    persistent: Option<&Partition>,
) -> Result<(), ValidationError> {
    let fill_extras = extra_partitions
        .iter()
        .filter(|partition| partition.size_mib == 0)
        .count();
    if fill_extras > 1 {
        return Err(ValidationError::MultipleFillPartitions);
    }
    if fill_extras == 1 && persistent.is_some_and(|partition| partition.size_mib == 0) {
        return Err(ValidationError::PersistentFillConflict);
    }
    Ok(())
}

/// On-disk location of the recovery image: the compressed file name for
/// squash-type images, the raw one otherwise, under the recovery mount
/// point or the constant fallback when no recovery partition exists.
fn recovery_image_path(recovery: Option<&Partition>, fs: &FileSystem) -> PathBuf {
    let mount = recovery
        .and_then(|partition| partition.mount_point.clone())
        .unwrap_or_else(|| PathBuf::from(RECOVERY_MOUNT_POINT));
    let file = if *fs == FileSystem::Squashfs {
        RECOVERY_SQUASH_FILE
    } else {
        RECOVERY_IMG_FILE
    };
    mount.join(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    use tempfile::TempDir;

    use basalt_api::{
        config::{ImageSource, PartitionSet},
        constants::{EFI_LABEL, PROC_MOUNTS_FILE, STATE_LABEL, SYS_BLOCK_DIR, UDEV_DATA_DIR},
        primitives::{Firmware, TableLabel},
    };

    fn empty_root() -> TempDir {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join(SYS_BLOCK_DIR)).unwrap();
        fs::create_dir_all(root.path().join(UDEV_DATA_DIR)).unwrap();
        fs::create_dir_all(root.path().join("proc")).unwrap();
        fs::write(root.path().join(PROC_MOUNTS_FILE), "").unwrap();
        root
    }

    fn state_partition() -> Partition {
        Partition {
            name: "state".to_string(),
            filesystem_label: STATE_LABEL.to_string(),
            size_mib: 8192,
            fs: Some(FileSystem::Ext4),
            mount_point: Some("/run/basalt/state".into()),
            ..Default::default()
        }
    }

    fn install_spec() -> InstallSpec {
        InstallSpec {
            target: "/dev/sda".into(),
            firmware: Firmware::Uefi,
            part_table: TableLabel::Gpt,
            partitions: PartitionSet {
                state: Some(state_partition()),
                persistent: Some(Partition {
                    size_mib: 0,
                    ..Default::default()
                }),
                ..Default::default()
            },
            active: basalt_api::config::Image {
                source: ImageSource::File("/run/media/system.img".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_install_happy_path_completes_the_spec() {
        let root = empty_root();
        let mut spec = install_spec();
        sanitize_install(&mut spec, &BlockDeviceScanner::new(root.path())).unwrap();

        // Role defaults and firmware partitions were assigned.
        let efi = spec.partitions.efi.unwrap();
        assert_eq!(efi.filesystem_label, EFI_LABEL);
        let persistent = spec.partitions.persistent.unwrap();
        assert_eq!(persistent.name, "persistent");
        assert_eq!(persistent.fs, Some(FileSystem::Ext4));

        // The recovery image path falls back to the constant location.
        assert_eq!(
            spec.recovery.file,
            PathBuf::from("/run/basalt/recovery/recovery.img")
        );
    }

    #[test]
    fn test_install_derives_squash_recovery_path_from_mount_point() {
        let root = empty_root();
        let mut spec = install_spec();
        spec.partitions.recovery = Some(Partition {
            mount_point: Some("/run/recovery".into()),
            ..Default::default()
        });
        spec.recovery.fs = FileSystem::Squashfs;
        sanitize_install(&mut spec, &BlockDeviceScanner::new(root.path())).unwrap();
        assert_eq!(
            spec.recovery.file,
            PathBuf::from("/run/recovery/recovery.squashfs")
        );
    }

    #[test]
    fn test_install_rejects_mounted_target() {
        let root = empty_root();
        let part_dir = root.path().join(SYS_BLOCK_DIR).join("sda/sda1");
        fs::create_dir_all(&part_dir).unwrap();
        fs::write(part_dir.join("partition"), "1\n").unwrap();
        fs::write(part_dir.join("size"), "2048\n").unwrap();
        fs::write(part_dir.join("dev"), "8:1\n").unwrap();
        let device = root.path().join("dev/sda1");
        fs::write(
            root.path().join(PROC_MOUNTS_FILE),
            format!("{} /home ext4 rw 0 0\n", device.display()),
        )
        .unwrap();

        let mut spec = install_spec();
        spec.target = root.path().join("dev/sda");
        let err = sanitize_install(&mut spec, &BlockDeviceScanner::new(root.path())).unwrap_err();
        match err {
            StorageError::MountedDeviceConflict { mount_point, .. } => {
                assert_eq!(mount_point, PathBuf::from("/home"))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_install_requires_a_system_source() {
        let root = empty_root();
        let mut spec = install_spec();
        spec.active.source = ImageSource::Empty;
        let err = sanitize_install(&mut spec, &BlockDeviceScanner::new(root.path())).unwrap_err();
        assert_eq!(err.to_string(), "Undefined system source to install");

        // An alternate boot image satisfies the requirement.
        spec.iso = Some("/run/media/install.iso".into());
        sanitize_install(&mut spec, &BlockDeviceScanner::new(root.path())).unwrap();
    }

    #[test]
    fn test_install_requires_state_partition() {
        let root = empty_root();
        let mut spec = install_spec();
        spec.partitions.state = None;
        let err = sanitize_install(&mut spec, &BlockDeviceScanner::new(root.path())).unwrap_err();
        assert_eq!(
            err.to_string(),
            "State partition is not defined or has no mount point"
        );
    }

    #[test]
    fn test_install_rejects_two_fill_extras() {
        let root = empty_root();
        let mut spec = install_spec();
        spec.partitions.persistent = None;
        spec.extra_partitions = vec![
            Partition {
                name: "a".to_string(),
                size_mib: 0,
                ..Default::default()
            },
            Partition {
                name: "b".to_string(),
                size_mib: 0,
                ..Default::default()
            },
        ];
        let err = sanitize_install(&mut spec, &BlockDeviceScanner::new(root.path())).unwrap_err();
        assert_eq!(
            err.to_string(),
            "More than one extra partition has its size set to 0"
        );
    }

    #[test]
    fn test_install_rejects_fill_extra_with_fill_persistent() {
        let root = empty_root();
        let mut spec = install_spec();
        spec.extra_partitions = vec![Partition {
            name: "data".to_string(),
            size_mib: 0,
            ..Default::default()
        }];
        let err = sanitize_install(&mut spec, &BlockDeviceScanner::new(root.path())).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Both the persistent partition and an extra partition have their size set to 0"
        );
    }

    #[test]
    fn test_install_msdos_requires_state() {
        let root = empty_root();
        let mut spec = install_spec();
        spec.firmware = Firmware::Bios;
        spec.part_table = TableLabel::Msdos;
        sanitize_install(&mut spec, &BlockDeviceScanner::new(root.path())).unwrap();
        assert_eq!(spec.partitions.state.as_ref().unwrap().flags, ["boot"]);
        assert!(spec.partitions.efi.is_none());
        assert!(spec.partitions.boot.is_none());
    }

    #[test]
    fn test_reset_requirements() {
        let mut spec = ResetSpec {
            active: basalt_api::config::Image {
                source: ImageSource::File("/run/initramfs/system.img".into()),
                ..Default::default()
            },
            partitions: PartitionSet {
                state: Some(state_partition()),
                ..Default::default()
            },
            ..Default::default()
        };
        sanitize_reset(&mut spec).unwrap();

        spec.active.source = ImageSource::Empty;
        assert_eq!(
            sanitize_reset(&mut spec).unwrap_err().to_string(),
            "Undefined system source to reset to"
        );

        spec.active.source = ImageSource::File("/run/initramfs/system.img".into());
        spec.partitions.state.as_mut().unwrap().mount_point = None;
        assert_eq!(
            sanitize_reset(&mut spec).unwrap_err().to_string(),
            "State partition is not defined or has no mount point"
        );
    }

    #[test]
    fn test_upgrade_active_branch() {
        let mut spec = UpgradeSpec {
            active: basalt_api::config::Image {
                source: ImageSource::Oci("registry.example.com/os:latest".into()),
                ..Default::default()
            },
            partitions: PartitionSet {
                state: Some(state_partition()),
                ..Default::default()
            },
            ..Default::default()
        };
        sanitize_upgrade(&mut spec).unwrap();

        spec.active.source = ImageSource::Empty;
        assert_eq!(
            sanitize_upgrade(&mut spec).unwrap_err().to_string(),
            "Undefined system source to install"
        );
    }

    #[test]
    fn test_upgrade_recovery_branch() {
        let mut spec = UpgradeSpec {
            recovery_upgrade: true,
            recovery: basalt_api::config::Image {
                source: ImageSource::File("/run/media/recovery.img".into()),
                ..Default::default()
            },
            partitions: PartitionSet {
                recovery: Some(Partition {
                    name: "recovery".to_string(),
                    mount_point: Some("/run/basalt/recovery".into()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        sanitize_upgrade(&mut spec).unwrap();

        spec.recovery.source = ImageSource::Empty;
        assert_eq!(
            sanitize_upgrade(&mut spec).unwrap_err().to_string(),
            "Undefined recovery source to upgrade"
        );

        spec.recovery.source = ImageSource::File("/run/media/recovery.img".into());
        spec.partitions.recovery = None;
        assert_eq!(
            sanitize_upgrade(&mut spec).unwrap_err().to_string(),
            "Recovery partition is not defined or has no mount point"
        );
    }
}
