use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Error};
use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;

/// Matches a boot-attempt counter embedded right before the file
/// extension: `entry+3.efi` means 3 tries left, `entry+1-2.efi` means 1
/// left and 2 already spent.
static COUNTER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<stem>.+?)(?:\+(?P<left>\d+)(?:-(?P<done>\d+))?)?(?P<ext>\.[^.]+)$")
        .expect("static pattern")
});

/// Boot-attempt counter parsed from a file name. The bootloader decrements
/// `tries_left` on every boot attempt; an exhausted counter marks a
/// deployment that never booted successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootCounter {
    pub tries_left: u32,
    pub tries_done: u32,
}

/// Splits a file name into stem, optional counter and extension.
pub fn parse_file_name(file_name: &str) -> Option<(String, Option<BootCounter>, String)> {
    let captures = COUNTER.captures(file_name)?;
    let counter = captures.name("left").map(|left| BootCounter {
        tries_left: left.as_str().parse().unwrap_or(0),
        tries_done: captures
            .name("done")
            .and_then(|done| done.as_str().parse().ok())
            .unwrap_or(0),
    });
    Some((
        captures["stem"].to_string(),
        counter,
        captures["ext"].to_string(),
    ))
}

/// Renames a boot entry so its name carries a fresh attempt counter,
/// replacing any counter already present. Returns the new path.
pub fn add_boot_assessment(entry: &Path, tries: u32) -> Result<PathBuf, Error> {
    let file_name = entry
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("Invalid boot entry path '{}'", entry.display()))?;
    let (stem, _, ext) = parse_file_name(file_name)
        .with_context(|| format!("Boot entry '{file_name}' has no file extension"))?;

    let renamed = entry.with_file_name(format!("{stem}+{tries}{ext}"));
    if renamed != entry {
        fs::rename(entry, &renamed)
            .with_context(|| format!("Failed to rename boot entry '{}'", entry.display()))?;
    }
    Ok(renamed)
}

/// Removes entries in `dir` whose counter is exhausted. Removal is best
/// effort: entries that cannot be removed are logged and skipped.
pub fn remove_exhausted(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read boot entry directory '{}'", dir.display()))?;

    let mut removed = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let Some((_, Some(counter), _)) = parse_file_name(name) else {
            continue;
        };
        if counter.tries_left > 0 {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => removed.push(path),
            Err(e) => warn!(
                "Could not remove exhausted boot entry '{}': {e}",
                path.display()
            ),
        }
    }
    removed.sort();
    Ok(removed)
}
