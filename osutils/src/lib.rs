pub mod block_devices;
pub mod boot_assessment;
pub mod dependencies;
pub mod e2fsck;
pub mod lsblk;
pub mod mkfs;
pub mod mount;
pub mod mounts;
pub mod parted;
pub mod resize2fs;
pub mod retry;
pub mod udevadm;
pub mod xfs_growfs;

#[cfg(any(test, feature = "test-utilities"))]
pub mod testutils;
