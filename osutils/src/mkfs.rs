use std::path::Path;

use anyhow::{bail, Context, Error};

use basalt_api::primitives::FileSystem;

use crate::dependencies::{CommandRunner, Dependency};

/// Creates a filesystem on `device` with the given label and pass-through
/// options; returns the tool's output. Boot-firmware partitions carry no
/// filesystem and must be skipped by the caller.
pub fn format_device<R: CommandRunner>(
    runner: &R,
    device: &Path,
    fs: &FileSystem,
    label: &str,
    extra_opts: &[String],
) -> Result<String, Error> {
    let mut cmd = Dependency::Mkfs.cmd();
    cmd.arg("--type").arg(creatable_name(fs)?);
    if !label.is_empty() {
        // mkfs.vfat spells the label flag differently.
        cmd.arg(if *fs == FileSystem::Vfat { "-n" } else { "-L" });
        cmd.arg(label);
    }
    cmd.args(extra_opts);
    cmd.arg(device);

    runner
        .output(&cmd)?
        .check_output()
        .with_context(|| format!("Failed to format '{}' as {fs}", device.display()))
}

fn creatable_name(fs: &FileSystem) -> Result<&str, Error> {
    match fs {
        FileSystem::Ext2
        | FileSystem::Ext3
        | FileSystem::Ext4
        | FileSystem::Xfs
        | FileSystem::Vfat => Ok(fs.name()),
        other => bail!("'{other}' filesystem type cannot be used for creating new filesystems"),
    }
}
