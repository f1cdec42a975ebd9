use std::{
    fs,
    path::{Path, PathBuf},
};

use basalt_api::error::StorageError;

/// One entry of a `/proc`-style mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: PathBuf,
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub options: Vec<String>,
}

/// Reads and parses a mount table file.
pub fn read_mount_table(path: &Path) -> Result<Vec<MountEntry>, StorageError> {
    let contents = fs::read_to_string(path).map_err(|source| StorageError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    parse_mount_table(&contents)
}

pub fn parse_mount_table(contents: &str) -> Result<Vec<MountEntry>, StorageError> {
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_entry)
        .collect()
}

/// The entry mounting `device`, if any.
pub fn entry_for_device<'a>(entries: &'a [MountEntry], device: &Path) -> Option<&'a MountEntry> {
    entries.iter().find(|entry| entry.device == device)
}

fn parse_entry(line: &str) -> Result<MountEntry, StorageError> {
    let mut fields = line.split_ascii_whitespace();
    let (device, mount_point, fs_type) = match (fields.next(), fields.next(), fields.next()) {
        (Some(device), Some(mount_point), Some(fs_type)) => (device, mount_point, fs_type),
        _ => {
            return Err(StorageError::Parse {
                line: line.to_string(),
                reason: "expected at least device, mount point and filesystem fields".to_string(),
            })
        }
    };
    let options = fields
        .next()
        .map(|field| field.split(',').map(str::to_string).collect())
        .unwrap_or_default();

    Ok(MountEntry {
        device: PathBuf::from(decode_escapes(device, line)?),
        mount_point: PathBuf::from(decode_escapes(mount_point, line)?),
        fs_type: fs_type.to_string(),
        options,
    })
}

/// The kernel escapes whitespace and backslashes in mount-table fields as
/// `\040`-style octal sequences; decoding them is required for mount-point
/// matching to work on paths containing spaces.
fn decode_escapes(field: &str, line: &str) -> Result<String, StorageError> {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some(first) => {
                let digits = [Some(first), chars.next(), chars.next()];
                let mut code = 0u32;
                for digit in digits {
                    match digit.and_then(|d| d.to_digit(8)) {
                        Some(d) => code = code * 8 + d,
                        None => {
                            return Err(StorageError::Parse {
                                line: line.to_string(),
                                reason: format!("invalid octal escape in field '{field}'"),
                            })
                        }
                    }
                }
                match char::from_u32(code) {
                    Some(decoded) => out.push(decoded),
                    None => {
                        return Err(StorageError::Parse {
                            line: line.to_string(),
                            reason: format!("octal escape out of range in field '{field}'"),
                        })
                    }
                }
            }
            None => {
                return Err(StorageError::Parse {
                    line: line.to_string(),
                    reason: format!("trailing backslash in field '{field}'"),
                })
            }
        }
    }
    Ok(out)
}
