use std::path::Path;

use anyhow::{Context, Error};

use basalt_api::primitives::FileSystem;

use crate::dependencies::{CommandRunner, Dependency};

/// Mounts a block device at `mount_dir`.
pub fn mount<R: CommandRunner>(
    runner: &R,
    device: &Path,
    mount_dir: &Path,
    fs: Option<&FileSystem>,
    options: &[String],
) -> Result<(), Error> {
    let mut cmd = Dependency::Mount.cmd();
    if let Some(fs) = fs {
        cmd.arg("-t").arg(fs.name());
    }
    if !options.is_empty() {
        cmd.arg("-o").arg(options.join(","));
    }
    cmd.arg(device).arg(mount_dir);

    runner.output(&cmd)?.check().with_context(|| {
        format!(
            "Failed to mount '{}' at '{}'",
            device.display(),
            mount_dir.display()
        )
    })?;
    Ok(())
}

/// Unmounts `mount_dir`.
pub fn umount<R: CommandRunner>(runner: &R, mount_dir: &Path) -> Result<(), Error> {
    let cmd = Dependency::Umount.cmd().with_arg(mount_dir);
    runner
        .output(&cmd)?
        .check()
        .with_context(|| format!("Failed to unmount '{}'", mount_dir.display()))?;
    Ok(())
}
