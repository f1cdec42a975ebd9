use std::path::{Path, PathBuf};

use log::debug;

use basalt_api::{
    error::StorageError,
    primitives::{FileSystem, TableLabel},
};

use crate::dependencies::{Command, CommandOutput, CommandRunner, Dependency};

/// Warning the partitioning tool emits when the table geometry no longer
/// covers the whole device, typical after the disk itself was resized.
/// The GPT headers must be repaired before the table can be trusted.
pub const UNALLOCATED_SPACE_MARKER: &str = "unallocated space";

/// A partition as printed by the partitioning tool, positions in sectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePartition {
    /// 1-based number assigned by the tool.
    pub number: u32,
    pub start: u64,
    pub size: u64,
    pub fs: Option<String>,
    pub name: Option<String>,
    pub flags: Vec<String>,
}

impl TablePartition {
    /// Last sector occupied by this partition.
    pub fn end(&self) -> u64 {
        self.start + self.size - 1
    }
}

/// Snapshot of a disk's partition table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartedTable {
    /// Logical sector size in bytes.
    pub sector_size: u64,
    /// Last addressable sector.
    pub last_sector: u64,
    pub label: TableLabel,
    /// Partitions ordered by number.
    pub partitions: Vec<TablePartition>,
}

fn base_command(device: &Path) -> Command {
    Dependency::Parted
        .cmd()
        .with_arg("--script")
        .with_arg("--machine")
        .with_arg("--")
        .with_arg(device)
        .with_arg("unit")
        .with_arg("s")
}

/// Prints the partition table without checking the exit status; callers
/// inspect the raw output for repairable warnings before parsing.
pub fn print_raw<R: CommandRunner>(
    runner: &R,
    device: &Path,
) -> Result<CommandOutput, StorageError> {
    let cmd = base_command(device).with_arg("print");
    Ok(runner.output(&cmd)?)
}

/// Parses the machine-readable print format: a `BYT;` header, one
/// `:`-delimited disk summary line and one `;`-terminated line per
/// partition. All sector fields carry the `s` unit suffix.
pub fn parse_print(output: &str) -> Result<PartedTable, StorageError> {
    let mut lines = output.lines().map(str::trim).filter(|line| !line.is_empty());

    match lines.next() {
        Some(header) if header.starts_with("BYT") => {}
        other => {
            return Err(parse_error(
                other.unwrap_or_default(),
                "expected the 'BYT;' header",
            ))
        }
    }

    let disk_line = lines
        .next()
        .ok_or_else(|| parse_error("", "missing disk summary line"))?;
    let (last_sector, sector_size, label) = parse_disk_line(disk_line)?;

    let mut partitions = lines
        .map(parse_partition_line)
        .collect::<Result<Vec<_>, _>>()?;
    partitions.sort_by_key(|partition| partition.number);

    Ok(PartedTable {
        sector_size,
        last_sector,
        label,
        partitions,
    })
}

fn parse_disk_line(line: &str) -> Result<(u64, u64, TableLabel), StorageError> {
    let fields: Vec<&str> = line.trim_end_matches(';').split(':').collect();
    if fields.len() < 7 {
        return Err(parse_error(line, "disk summary line has fewer than 7 fields"));
    }

    let last_sector = parse_sectors(fields[1], "last sector", line)?;
    let sector_size: u64 = fields[3].parse().map_err(|_| {
        parse_error(
            line,
            &format!("invalid logical sector size '{}'", fields[3]),
        )
    })?;
    if sector_size == 0 {
        return Err(parse_error(line, "logical sector size is zero"));
    }
    let label = fields[5]
        .parse::<TableLabel>()
        .map_err(|_| StorageError::UnsupportedTableLabel {
            label: fields[5].to_string(),
        })?;

    Ok((last_sector, sector_size, label))
}

fn parse_partition_line(line: &str) -> Result<TablePartition, StorageError> {
    let fields: Vec<&str> = line.trim_end_matches(';').split(':').collect();
    if fields.len() < 7 {
        return Err(parse_error(line, "partition line has fewer than 7 fields"));
    }

    let number = fields[0].parse().map_err(|_| {
        parse_error(line, &format!("invalid partition number '{}'", fields[0]))
    })?;
    let start = parse_sectors(fields[1], "start", line)?;
    let size = parse_sectors(fields[3], "size", line)?;
    // Field 2 is the end sector, redundant with start + size.
    parse_sectors(fields[2], "end", line)?;

    Ok(TablePartition {
        number,
        start,
        size,
        fs: non_empty(fields[4]),
        name: non_empty(fields[5]),
        flags: fields[6]
            .split(',')
            .map(str::trim)
            .filter(|flag| !flag.is_empty())
            .map(str::to_string)
            .collect(),
    })
}

fn parse_sectors(field: &str, what: &str, line: &str) -> Result<u64, StorageError> {
    field
        .strip_suffix('s')
        .ok_or_else(|| {
            parse_error(
                line,
                &format!("{what} field '{field}' is missing the sector suffix"),
            )
        })?
        .parse()
        .map_err(|_| parse_error(line, &format!("invalid {what} sector value '{field}'")))
}

fn parse_error(line: &str, reason: &str) -> StorageError {
    StorageError::Parse {
        line: line.to_string(),
        reason: reason.to_string(),
    }
}

fn non_empty(field: &str) -> Option<String> {
    let trimmed = field.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Accumulates table mutations and commits them as a single scripted
/// invocation; nothing touches the disk until [`PartedBatch::commit`].
#[derive(Debug)]
pub struct PartedBatch {
    device: PathBuf,
    label: TableLabel,
    ops: Vec<String>,
}

impl PartedBatch {
    pub fn new(device: impl AsRef<Path>, label: TableLabel) -> Self {
        Self {
            device: device.as_ref().to_path_buf(),
            label,
            ops: Vec::new(),
        }
    }

    /// Writes a fresh, empty partition table.
    pub fn mklabel(mut self) -> Self {
        self.ops.push("mklabel".to_string());
        self.ops.push(self.label.to_string());
        self
    }

    /// Creates a partition spanning `[start, end]` sectors. MSDOS tables
    /// carry no partition names; everything is a primary partition there.
    pub fn mkpart(mut self, name: &str, fs: Option<&FileSystem>, start: u64, end: u64) -> Self {
        self.ops.push("mkpart".to_string());
        match self.label {
            TableLabel::Gpt => self.ops.push(name.to_string()),
            TableLabel::Msdos => self.ops.push("primary".to_string()),
        }
        if let Some(fs) = fs {
            self.ops.push(fs.parted_name().to_string());
        }
        self.ops.push(format!("{start}s"));
        self.ops.push(format!("{end}s"));
        self
    }

    /// Renames partition `number`; GPT only.
    pub fn name(mut self, number: u32, name: &str) -> Self {
        self.ops.push("name".to_string());
        self.ops.push(number.to_string());
        self.ops.push(name.to_string());
        self
    }

    /// Deletes partition `number`.
    pub fn rm(mut self, number: u32) -> Self {
        self.ops.push("rm".to_string());
        self.ops.push(number.to_string());
        self
    }

    /// Sets or clears a flag on partition `number`.
    pub fn set_flag(mut self, number: u32, flag: &str, on: bool) -> Self {
        self.ops.push("set".to_string());
        self.ops.push(number.to_string());
        self.ops.push(flag.to_string());
        self.ops.push(if on { "on" } else { "off" }.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn commit<R: CommandRunner>(self, runner: &R) -> Result<(), StorageError> {
        if self.ops.is_empty() {
            return Ok(());
        }
        let mut cmd = base_command(&self.device);
        cmd.args(&self.ops);
        debug!("Writing partition table changes: {}", cmd.render_command());
        runner.output(&cmd)?.check()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use indoc::indoc;

    use crate::testutils::FakeRunner;

    const GPT_PRINT: &str = indoc! {r"
        BYT;
        /dev/sda:62914559s:scsi:512:512:gpt:QEMU HARDDISK:;
        1:2048s:4095s:2048s::bios:bios_grub;
        2:4096s:135167s:131072s:fat32:efi:boot, esp;
        3:135168s:16912383s:16777216s:ext4:state:;
    "};

    #[test]
    fn test_parse_print() {
        let table = parse_print(GPT_PRINT).unwrap();
        assert_eq!(table.sector_size, 512);
        assert_eq!(table.last_sector, 62914559);
        assert_eq!(table.label, TableLabel::Gpt);
        assert_eq!(table.partitions.len(), 3);

        let bios = &table.partitions[0];
        assert_eq!(bios.number, 1);
        assert_eq!(bios.start, 2048);
        assert_eq!(bios.size, 2048);
        assert_eq!(bios.end(), 4095);
        assert_eq!(bios.fs, None);
        assert_eq!(bios.name.as_deref(), Some("bios"));
        assert_eq!(bios.flags, ["bios_grub"]);

        let efi = &table.partitions[1];
        assert_eq!(efi.fs.as_deref(), Some("fat32"));
        assert_eq!(efi.flags, ["boot", "esp"]);

        let state = &table.partitions[2];
        assert_eq!(state.start, 135168);
        assert_eq!(state.size, 16777216);
        assert!(state.flags.is_empty());
    }

    #[test]
    fn test_parse_print_msdos() {
        let output = indoc! {r"
            BYT;
            /dev/sdb:1953125s:scsi:512:512:msdos:QEMU HARDDISK:;
            1:2048s:1050623s:1048576s:ext4::boot;
        "};
        let table = parse_print(output).unwrap();
        assert_eq!(table.label, TableLabel::Msdos);
        assert_eq!(table.partitions[0].name, None);
        assert_eq!(table.partitions[0].flags, ["boot"]);
    }

    #[test]
    fn test_parse_print_empty_table() {
        let output = indoc! {r"
            BYT;
            /dev/sda:62914559s:scsi:512:512:gpt::;
        "};
        let table = parse_print(output).unwrap();
        assert!(table.partitions.is_empty());
    }

    #[test]
    fn test_parse_print_unsupported_label() {
        let output = indoc! {r"
            BYT;
            /dev/sda:62914559s:scsi:512:512:aix::;
        "};
        match parse_print(output).unwrap_err() {
            StorageError::UnsupportedTableLabel { label } => assert_eq!(label, "aix"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_parse_print_malformed_fields() {
        // Missing the sector suffix on the last-sector field.
        let output = "BYT;\n/dev/sda:62914559:scsi:512:512:gpt::;\n";
        let err = parse_print(output).unwrap_err();
        assert!(
            err.to_string().contains("missing the sector suffix"),
            "unexpected error: {err}"
        );

        // Garbage start sector in a partition line.
        let output = "BYT;\n/dev/sda:62914559s:scsi:512:512:gpt::;\n1:xyzs:4095s:2048s:ext4:p:;\n";
        let err = parse_print(output).unwrap_err();
        assert!(
            err.to_string().contains("invalid start sector value 'xyzs'"),
            "unexpected error: {err}"
        );

        // Truncated partition line.
        let output = "BYT;\n/dev/sda:62914559s:scsi:512:512:gpt::;\n1:2048s:4095s;\n";
        let err = parse_print(output).unwrap_err();
        assert!(err.to_string().contains("fewer than 7 fields"));

        // No header at all.
        let err = parse_print("/dev/sda:62914559s:scsi:512:512:gpt::;\n").unwrap_err();
        assert!(err.to_string().contains("expected the 'BYT;' header"));
    }

    #[test]
    fn test_print_raw_invocation() {
        let runner = FakeRunner::new();
        runner.push_ok(GPT_PRINT);
        let output = print_raw(&runner, Path::new("/dev/sda")).unwrap();
        assert!(output.success());
        assert_eq!(
            runner.calls(),
            ["parted --script --machine -- /dev/sda unit s print"]
        );
    }

    #[test]
    fn test_batch_mkpart_gpt() {
        let runner = FakeRunner::new();
        PartedBatch::new("/dev/sda", TableLabel::Gpt)
            .mkpart("oem", Some(&FileSystem::Ext4), 2048, 133119)
            .set_flag(1, "boot", true)
            .commit(&runner)
            .unwrap();
        assert_eq!(
            runner.calls(),
            ["parted --script --machine -- /dev/sda unit s mkpart oem ext4 2048s 133119s set 1 boot on"]
        );
    }

    #[test]
    fn test_batch_mkpart_msdos_uses_primary() {
        let runner = FakeRunner::new();
        PartedBatch::new("/dev/sdb", TableLabel::Msdos)
            .mklabel()
            .mkpart("state", Some(&FileSystem::Vfat), 2048, 4095)
            .commit(&runner)
            .unwrap();
        assert_eq!(
            runner.calls(),
            ["parted --script --machine -- /dev/sdb unit s mklabel msdos mkpart primary fat32 2048s 4095s"]
        );
    }

    #[test]
    fn test_batch_rm_and_name() {
        let runner = FakeRunner::new();
        PartedBatch::new("/dev/sda", TableLabel::Gpt)
            .rm(4)
            .name(3, "active")
            .commit(&runner)
            .unwrap();
        assert_eq!(
            runner.calls(),
            ["parted --script --machine -- /dev/sda unit s rm 4 name 3 active"]
        );
    }

    #[test]
    fn test_empty_batch_is_a_no_op() {
        let runner = FakeRunner::new();
        let batch = PartedBatch::new("/dev/sda", TableLabel::Gpt);
        assert!(batch.is_empty());
        batch.commit(&runner).unwrap();
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_commit_failure_carries_tool_output() {
        let runner = FakeRunner::new();
        runner.push(1, "", "Error: unable to satisfy all constraints");
        let err = PartedBatch::new("/dev/sda", TableLabel::Gpt)
            .rm(1)
            .commit(&runner)
            .unwrap_err();
        match err {
            StorageError::ToolExecution { binary, output, .. } => {
                assert_eq!(binary, "parted");
                assert!(output.contains("unable to satisfy all constraints"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
