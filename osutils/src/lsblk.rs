use std::path::Path;

use anyhow::{Context, Error};
use log::warn;
use serde::Deserialize;

use crate::dependencies::{CommandRunner, Dependency};

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
pub struct LsblkOutput {
    pub blockdevices: Vec<LsblkDevice>,
}

/// Subset of the `lsblk --json` fields this crate reads.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
pub struct LsblkDevice {
    pub name: String,
    pub fstype: Option<String>,
    pub label: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(rename = "pkname")]
    pub parent_kernel_name: Option<String>,
}

/// Queries a single block device.
pub fn get<R: CommandRunner>(runner: &R, device: impl AsRef<Path>) -> Result<LsblkDevice, Error> {
    let cmd = Dependency::Lsblk
        .cmd()
        .with_arg("--json")
        .with_arg("--bytes")
        .with_arg("--nodeps")
        .with_arg("--output")
        .with_arg("NAME,FSTYPE,LABEL,SIZE,PKNAME")
        .with_arg(device.as_ref());
    let output = runner
        .output(&cmd)?
        .check_output()
        .context("Failed to execute lsblk")?;

    let parsed = parse(&output);
    if parsed.is_err() {
        warn!("lsblk output: {output}");
    }
    parsed
}

/// Filesystem type on a block device, if any.
pub fn fs_type<R: CommandRunner>(
    runner: &R,
    device: impl AsRef<Path>,
) -> Result<Option<String>, Error> {
    Ok(get(runner, device)?.fstype.filter(|fstype| !fstype.is_empty()))
}

fn parse(output: &str) -> Result<LsblkDevice, Error> {
    serde_json::from_str::<LsblkOutput>(output)
        .context("Failed to parse lsblk output")?
        .blockdevices
        .into_iter()
        .next()
        .context("lsblk returned no devices")
}

#[cfg(test)]
mod tests {
    use super::*;

    use indoc::indoc;

    use crate::testutils::FakeRunner;

    const OUTPUT: &str = indoc! {r#"
        {
            "blockdevices": [
                {
                    "name": "sda3",
                    "fstype": "ext4",
                    "label": "BASALT_STATE",
                    "size": 8589934592,
                    "pkname": "sda"
                }
            ]
        }
    "#};

    #[test]
    fn test_parse() {
        let device = parse(OUTPUT).unwrap();
        assert_eq!(
            device,
            LsblkDevice {
                name: "sda3".to_string(),
                fstype: Some("ext4".to_string()),
                label: Some("BASALT_STATE".to_string()),
                size: 8589934592,
                parent_kernel_name: Some("sda".to_string()),
            }
        );

        parse("bad output").unwrap_err();
        parse(r#"{"blockdevices": []}"#).unwrap_err();
    }

    #[test]
    fn test_fs_type() {
        let runner = FakeRunner::new();
        runner.push_ok(OUTPUT);
        assert_eq!(
            fs_type(&runner, "/dev/sda3").unwrap(),
            Some("ext4".to_string())
        );
        assert_eq!(
            runner.calls(),
            ["lsblk --json --bytes --nodeps --output NAME,FSTYPE,LABEL,SIZE,PKNAME /dev/sda3"]
        );

        runner.push_ok(r#"{"blockdevices": [{"name": "sdb", "fstype": null, "size": 0}]}"#);
        assert_eq!(fs_type(&runner, "/dev/sdb").unwrap(), None);
    }
}
