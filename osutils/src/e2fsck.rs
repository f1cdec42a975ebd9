use std::path::Path;

use anyhow::{Context, Error};

use crate::dependencies::{CommandRunner, Dependency};

/// Checks the ext filesystem on the block device, fixing what can be fixed
/// without questions. Resizing requires a clean filesystem first.
pub fn run<R: CommandRunner>(runner: &R, device: &Path) -> Result<(), Error> {
    let cmd = Dependency::E2fsck
        .cmd()
        .with_arg("-f")
        .with_arg("-y")
        .with_arg(device);
    runner
        .output(&cmd)?
        .check()
        .context("Failed to execute e2fsck")?;
    Ok(())
}
