use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by the partitioning and block-device engine. Every
/// variant carries enough context (device path, requested versus available
/// sectors, offending line) for the caller to act on.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Device '{path}' not found")]
    DeviceNotFound { path: PathBuf },

    #[error("Partition {number} on '{disk}' did not show up after {attempts} attempts")]
    PartitionDeviceNotFound {
        disk: PathBuf,
        number: u32,
        attempts: u32,
    },

    #[error("No partition with label '{label}' found")]
    LabelNotFound { label: String },

    #[error(
        "Insufficient space on '{disk}': requested {requested} sectors but only {available} are free"
    )]
    InsufficientSpace {
        disk: PathBuf,
        requested: u64,
        available: u64,
    },

    #[error("Unsupported partition table label '{label}'")]
    UnsupportedTableLabel { label: String },

    #[error("Failed to parse partitioning tool output: {reason} in line '{line}'")]
    Parse { line: String, reason: String },

    #[error("Device '{device}' is in use: '{partition}' is mounted at '{mount_point}'")]
    MountedDeviceConflict {
        device: PathBuf,
        partition: PathBuf,
        mount_point: PathBuf,
    },

    #[error("Cannot resize '{filesystem}' filesystem on '{device}'")]
    ResizeUnsupported { device: PathBuf, filesystem: String },

    #[error("Command '{binary}' failed: {explanation}\n{output}")]
    ToolExecution {
        binary: &'static str,
        explanation: String,
        output: String,
    },

    #[error("Disk '{path}' must be reloaded before it can be used")]
    NotLoaded { path: PathBuf },

    #[error("Failed to open '{path}'")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Loop control operation {operation} failed on '{device}'")]
    LoopControl {
        operation: &'static str,
        device: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "Label swap incomplete on '{disk}': partition {relabeled} now carries '{label}' but \
         relabeling partition {failed} failed"
    )]
    AbSwapIncomplete {
        disk: PathBuf,
        relabeled: u32,
        label: String,
        failed: u32,
        #[source]
        source: Box<StorageError>,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A request was rejected before any destructive action; one variant per
/// violated invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Undefined system source to install")]
    MissingSystemSource,

    #[error("Undefined system source to reset to")]
    MissingResetSource,

    #[error("Undefined recovery source to upgrade")]
    MissingRecoverySource,

    #[error("State partition is not defined or has no mount point")]
    UndefinedStatePartition,

    #[error("Recovery partition is not defined or has no mount point")]
    UndefinedRecoveryPartition,

    #[error("More than one extra partition has its size set to 0")]
    MultipleFillPartitions,

    #[error("Both the persistent partition and an extra partition have their size set to 0")]
    PersistentFillConflict,

    #[error("A BIOS install on an MSDOS table requires a pre-existing state partition")]
    MsdosRequiresState,
}
