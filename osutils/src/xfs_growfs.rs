use std::path::Path;

use anyhow::{Context, Error};

use crate::dependencies::{CommandRunner, Dependency};

/// Grows the xfs filesystem mounted at `mount_point` to fill its device.
/// xfs can only grow while mounted, so callers are responsible for the
/// surrounding mount and unmount.
pub fn run<R: CommandRunner>(runner: &R, mount_point: &Path) -> Result<(), Error> {
    let cmd = Dependency::XfsGrowfs.cmd().with_arg(mount_point);
    runner
        .output(&cmd)?
        .check()
        .context("Failed to execute xfs_growfs")?;
    Ok(())
}
