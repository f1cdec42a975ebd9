use std::{
    fs::{File, OpenOptions},
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use log::{debug, info};

use basalt_api::error::StorageError;

const LOOP_CONTROL: &str = "/dev/loop-control";

// Raw control requests for the loop driver; see <linux/loop.h>.
mod ioctl {
    use nix::{ioctl_none_bad, ioctl_write_int_bad, ioctl_write_ptr_bad};

    // Kernel loop-device ABI (see <linux/loop.h>). Not exposed by this
    // version of `libc`, so the fixed kernel layout/values are declared
    // here for the `loop_set_status64` control operation.
    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct loop_info64 {
        pub lo_device: u64,
        pub lo_inode: u64,
        pub lo_rdevice: u64,
        pub lo_offset: u64,
        pub lo_sizelimit: u64,
        pub lo_number: u32,
        pub lo_encrypt_type: u32,
        pub lo_encrypt_key_size: u32,
        pub lo_flags: u32,
        pub lo_file_name: [u8; 64],
        pub lo_crypt_name: [u8; 64],
        pub lo_encrypt_key: [u8; 32],
        pub lo_init: [u64; 2],
    }

    pub const LO_FLAGS_READ_ONLY: u32 = 1;
    pub const LO_FLAGS_PARTSCAN: u32 = 8;

    ioctl_write_int_bad!(loop_set_fd, 0x4C00);
    ioctl_none_bad!(loop_clr_fd, 0x4C01);
    ioctl_write_ptr_bad!(loop_set_status64, 0x4C04, loop_info64);
    ioctl_none_bad!(loop_ctl_get_free, 0x4C82);
}

/// Gateway to the kernel's loop-control device. Free-device allocation is
/// a global kernel resource, so every bind and release in the process
/// goes through one handle — clones share it — and the internal mutex is
/// held for whole operations. Two concurrent binds can therefore never be
/// handed the same free index.
#[derive(Debug, Clone)]
pub struct LoopManager {
    control: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl Default for LoopManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopManager {
    pub fn new() -> Self {
        Self {
            control: PathBuf::from(LOOP_CONTROL),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Points the manager at an alternate control device.
    pub fn with_control_device(mut self, control: impl Into<PathBuf>) -> Self {
        self.control = control.into();
        self
    }

    /// Binds `image` to a free loop device, with partition-table scanning
    /// enabled and the read-only flag explicitly cleared. Returns the
    /// loop device path. All handles are closed on every path.
    pub fn attach(&self, image: &Path) -> Result<PathBuf, StorageError> {
        let _serialized = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        let control = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.control)
            .map_err(|source| StorageError::Open {
                path: self.control.clone(),
                source,
            })?;
        let index = unsafe { ioctl::loop_ctl_get_free(control.as_raw_fd()) }
            .map_err(|errno| control_error("LOOP_CTL_GET_FREE", &self.control, errno))?;
        let device = PathBuf::from(format!("/dev/loop{index}"));
        debug!("Next free loop device: '{}'", device.display());

        let loop_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&device)
            .map_err(|source| StorageError::Open {
                path: device.clone(),
                source,
            })?;
        let image_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(image)
            .map_err(|source| StorageError::Open {
                path: image.to_path_buf(),
                source,
            })?;

        unsafe { ioctl::loop_set_fd(loop_file.as_raw_fd(), image_file.as_raw_fd() as _) }
            .map_err(|errno| control_error("LOOP_SET_FD", &device, errno))?;

        let mut status: ioctl::loop_info64 = unsafe { std::mem::zeroed() };
        status.lo_flags |= ioctl::LO_FLAGS_PARTSCAN as u32;
        status.lo_flags &= !(ioctl::LO_FLAGS_READ_ONLY as u32);
        if let Err(errno) = unsafe { ioctl::loop_set_status64(loop_file.as_raw_fd(), &status) } {
            // Do not leave a half-bound device behind.
            let _ = unsafe { ioctl::loop_clr_fd(loop_file.as_raw_fd()) };
            return Err(control_error("LOOP_SET_STATUS64", &device, errno));
        }

        info!("Bound '{}' to '{}'", image.display(), device.display());
        Ok(device)
    }

    /// Releases a loop device. Releasing an already-clear device surfaces
    /// the driver's error; idempotency is the caller's concern.
    pub fn detach(&self, device: &Path) -> Result<(), StorageError> {
        let _serialized = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        let loop_file = File::open(device).map_err(|source| StorageError::Open {
            path: device.to_path_buf(),
            source,
        })?;
        unsafe { ioctl::loop_clr_fd(loop_file.as_raw_fd()) }
            .map_err(|errno| control_error("LOOP_CLR_FD", device, errno))?;

        info!("Released loop device '{}'", device.display());
        Ok(())
    }
}

fn control_error(
    operation: &'static str,
    device: impl Into<PathBuf>,
    errno: nix::errno::Errno,
) -> StorageError {
    StorageError::LoopControl {
        operation,
        device: device.into(),
        source: std::io::Error::from_raw_os_error(errno as i32),
    }
}
