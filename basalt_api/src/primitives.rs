use std::fmt::Display;

use serde::{Deserialize, Serialize, Serializer};
use strum_macros::{Display as StrumDisplay, EnumString};
use uuid::Uuid;

/// Partition table kinds understood by the engine. Anything else is
/// rejected before a destructive command is issued.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, StrumDisplay, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "lowercase")]
pub enum TableLabel {
    #[default]
    Gpt,
    Msdos,
}

/// Firmware flavor of the target machine, deciding which boot-support
/// partition the installer creates.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, StrumDisplay, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "lowercase")]
pub enum Firmware {
    #[default]
    Uefi,
    Bios,
}

/// Filesystem kinds. Kinds this engine does not know by name are carried
/// verbatim so discovery never loses information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FileSystem {
    Ext2,
    Ext3,
    Ext4,
    Xfs,
    Vfat,
    Squashfs,
    Other(String),
}

impl FileSystem {
    pub fn name(&self) -> &str {
        match self {
            FileSystem::Ext2 => "ext2",
            FileSystem::Ext3 => "ext3",
            FileSystem::Ext4 => "ext4",
            FileSystem::Xfs => "xfs",
            FileSystem::Vfat => "vfat",
            FileSystem::Squashfs => "squashfs",
            FileSystem::Other(name) => name,
        }
    }

    /// The fs-type argument the partitioning tool expects; it spells vfat
    /// as fat32.
    pub fn parted_name(&self) -> &str {
        match self {
            FileSystem::Vfat => "fat32",
            other => other.name(),
        }
    }

    pub fn is_ext(&self) -> bool {
        matches!(self, FileSystem::Ext2 | FileSystem::Ext3 | FileSystem::Ext4)
    }
}

impl Default for FileSystem {
    fn default() -> Self {
        FileSystem::Ext4
    }
}

impl From<&str> for FileSystem {
    fn from(value: &str) -> Self {
        match value {
            "ext2" => FileSystem::Ext2,
            "ext3" => FileSystem::Ext3,
            "ext4" => FileSystem::Ext4,
            "xfs" => FileSystem::Xfs,
            "vfat" => FileSystem::Vfat,
            "squashfs" => FileSystem::Squashfs,
            other => FileSystem::Other(other.to_string()),
        }
    }
}

impl From<String> for FileSystem {
    fn from(value: String) -> Self {
        value.as_str().into()
    }
}

impl From<FileSystem> for String {
    fn from(value: FileSystem) -> Self {
        value.name().to_string()
    }
}

impl Display for FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A filesystem identifier that may be a proper UUID or some other unique
/// string. vfat volume serials, for instance, do not conform to the UUID
/// format but still identify the filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FsUuid {
    Uuid(Uuid),
    Relaxed(String),
}

impl FsUuid {
    /// The proper UUID, when there is one.
    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            FsUuid::Uuid(uuid) => Some(*uuid),
            FsUuid::Relaxed(_) => None,
        }
    }
}

impl From<&str> for FsUuid {
    fn from(value: &str) -> Self {
        Uuid::parse_str(value)
            .map(FsUuid::Uuid)
            .unwrap_or_else(|_| FsUuid::Relaxed(value.to_string()))
    }
}

impl From<Uuid> for FsUuid {
    fn from(value: Uuid) -> Self {
        FsUuid::Uuid(value)
    }
}

impl Display for FsUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FsUuid::Uuid(uuid) => write!(f, "{}", uuid.hyphenated()),
            FsUuid::Relaxed(s) => f.write_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for FsUuid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(String::deserialize(deserializer)?.as_str().into())
    }
}

impl Serialize for FsUuid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_string().serialize(serializer)
    }
}
