use anyhow::{Context, Error};

use crate::dependencies::{CommandRunner, Dependency};

/// Waits for the udev event queue to drain. Device nodes for freshly
/// written partition tables appear asynchronously, so callers settle
/// before checking for them.
pub fn settle<R: CommandRunner>(runner: &R) -> Result<(), Error> {
    let cmd = Dependency::Udevadm.cmd().with_arg("settle");
    runner
        .output(&cmd)?
        .check()
        .context("Failed to settle udev queue")?;
    Ok(())
}

/// Requests a replay of kernel device events.
pub fn trigger<R: CommandRunner>(runner: &R) -> Result<(), Error> {
    let cmd = Dependency::Udevadm.cmd().with_arg("trigger");
    runner
        .output(&cmd)?
        .check()
        .context("Failed to trigger udev")?;
    Ok(())
}
