use std::path::PathBuf;

use log::info;

use basalt_api::{
    config::Partition,
    constants::{ACTIVE_PART_NAME, PASSIVE_PART_NAME},
    error::StorageError,
    primitives::TableLabel,
};
use osutils::{
    block_devices::BlockDeviceScanner,
    dependencies::{CommandRunner, Dependency},
    parted::{self, PartedBatch},
};

/// Swaps the active and passive partition labels on boards that boot by
/// GPT name. Relabeling is two independent tool invocations, so a failure
/// of the second leaves both partitions labeled active; the returned
/// error names the side that succeeded to make that state diagnosable.
pub fn swap_active_passive<R: CommandRunner>(
    runner: &R,
    scanner: &BlockDeviceScanner,
) -> Result<(), StorageError> {
    let partitions = scanner.list_partitions()?;
    let active = named(&partitions, ACTIVE_PART_NAME)?;
    let disk = active
        .disk
        .clone()
        .ok_or_else(|| StorageError::DeviceNotFound {
            path: active.path.clone().unwrap_or_default(),
        })?;
    named(&partitions, PASSIVE_PART_NAME)?;

    // The table is authoritative for partition numbers; discovery only
    // told us which disk to look at.
    let table = parted::parse_print(&parted::print_raw(runner, &disk)?.check_output()?)?;
    let active_number = table_number(&table, &disk, ACTIVE_PART_NAME)?;
    let passive_number = table_number(&table, &disk, PASSIVE_PART_NAME)?;

    info!(
        "Swapping active/passive labels on '{}' (partitions {active_number} and {passive_number})",
        disk.display()
    );
    PartedBatch::new(&disk, TableLabel::Gpt)
        .name(passive_number, ACTIVE_PART_NAME)
        .commit(runner)?;
    if let Err(e) = PartedBatch::new(&disk, TableLabel::Gpt)
        .name(active_number, PASSIVE_PART_NAME)
        .commit(runner)
    {
        return Err(StorageError::AbSwapIncomplete {
            disk,
            relabeled: passive_number,
            label: ACTIVE_PART_NAME.to_string(),
            failed: active_number,
            source: Box::new(e),
        });
    }

    let sync = Dependency::Sync.cmd();
    runner.output(&sync)?.check()?;
    Ok(())
}

fn named<'a>(partitions: &'a [Partition], name: &str) -> Result<&'a Partition, StorageError> {
    partitions
        .iter()
        .find(|partition| partition.name == name)
        .ok_or_else(|| StorageError::LabelNotFound {
            label: name.to_string(),
        })
}

fn table_number(
    table: &parted::PartedTable,
    disk: &PathBuf,
    name: &str,
) -> Result<u32, StorageError> {
    table
        .partitions
        .iter()
        .find(|partition| partition.name.as_deref() == Some(name))
        .map(|partition| partition.number)
        .ok_or_else(|| StorageError::LabelNotFound {
            label: format!("{name} on {}", disk.display()),
        })
}
