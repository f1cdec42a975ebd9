use std::path::Path;

use anyhow::{Context, Error};

use crate::dependencies::{CommandRunner, Dependency};

/// Resizes the ext filesystem on the block device to fill the whole
/// device.
pub fn run<R: CommandRunner>(runner: &R, device: &Path) -> Result<(), Error> {
    let cmd = Dependency::Resize2fs.cmd().with_arg(device);
    runner
        .output(&cmd)?
        .check()
        .context("Failed to execute resize2fs")?;
    Ok(())
}
