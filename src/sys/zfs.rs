use crate::core::Snapshot;
use crate::parsing::{parse_key_value_pair_lines, StringPair};
use crate::sys::shell::Shell;
use anyhow::{Context as AnyhowContext, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ZfsError {
    #[error("dataset does not exist: {0}")]
    DatasetDoesNotExist(String),
}

/// Dataset properties consulted before touching an existing destination.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct EncryptionStatus {
    pub encryption: String,
    #[serde(rename = "encryptionroot")]
    pub encryption_root: Option<String>,
    pub mounted: Option<String>,
    pub mountpoint: Option<String>,
}

fn zfs_args(args: &[&str]) -> Vec<String> {
    std::iter::once("zfs").chain(args.iter().copied()).map(String::from).collect()
}

fn map_missing_dataset(error: anyhow::Error, dataset: &str) -> anyhow::Error {
    if format!("{:#}", error).contains("dataset does not exist") {
        anyhow::Error::new(ZfsError::DatasetDoesNotExist(dataset.to_string()))
    } else {
        error
    }
}

pub fn is_missing_dataset(error: &anyhow::Error) -> bool {
    error
        .chain()
        .any(|cause| cause.downcast_ref::<ZfsError>().map_or(false, |e| matches!(e, ZfsError::DatasetDoesNotExist(_))))
}

pub fn list_datasets(shell: &dyn Shell, root: &str, recursive: bool) -> Result<Vec<String>> {
    let mut args = vec!["list", "-H", "-p", "-t", "filesystem,volume", "-o", "name"];
    if recursive {
        args.push("-r");
    } else {
        args.extend_from_slice(&["-d", "0"]);
    }
    args.push(root);
    let output = shell.exec(&zfs_args(&args)).map_err(|e| map_missing_dataset(e, root))?;
    Ok(output.lines().map(str::to_string).collect())
}

/// Snapshots for a dataset tree, in ZFS creation order per dataset.
pub fn list_snapshots(shell: &dyn Shell, root: &str, recursive: bool) -> Result<Vec<Snapshot>> {
    let mut args = vec!["list", "-H", "-p", "-t", "snapshot", "-o", "name", "-s", "createtxg"];
    if recursive {
        args.push("-r");
    } else {
        args.extend_from_slice(&["-d", "1"]);
    }
    args.push(root);
    let output = shell.exec(&zfs_args(&args)).map_err(|e| map_missing_dataset(e, root))?;
    output
        .lines()
        .map(|line| {
            let mut parts = line.splitn(2, '@');
            match (parts.next(), parts.next()) {
                (Some(dataset), Some(name)) => Ok(Snapshot::new(dataset, name)),
                _ => Err(anyhow::anyhow!("unparseable snapshot name: {}", line)),
            }
        })
        .collect()
}

/// Same tree walk keyed by dataset. Datasets without snapshots are
/// absent; callers that need existence should list datasets as well.
pub fn list_snapshot_names_by_dataset(
    shell: &dyn Shell,
    root: &str,
    recursive: bool,
) -> Result<BTreeMap<String, Vec<String>>> {
    let mut by_dataset: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for snapshot in list_snapshots(shell, root, recursive)? {
        by_dataset.entry(snapshot.dataset).or_default().push(snapshot.name);
    }
    Ok(by_dataset)
}

/// Values of `-` are treated as unset and omitted from the map.
pub fn list_datasets_with_properties(
    shell: &dyn Shell,
    root: &str,
    recursive: bool,
    properties: &[&str],
) -> Result<Vec<(String, HashMap<String, String>)>> {
    let columns = format!("name,{}", properties.join(","));
    let mut args = vec!["list", "-H", "-p", "-t", "filesystem,volume", "-o", columns.as_str()];
    if recursive {
        args.push("-r");
    } else {
        args.extend_from_slice(&["-d", "0"]);
    }
    args.push(root);
    let output = shell.exec(&zfs_args(&args)).map_err(|e| map_missing_dataset(e, root))?;
    output
        .lines()
        .map(|line| {
            let mut values = line.split('\t');
            let name = values
                .next()
                .map(str::to_string)
                .context("empty line in zfs list output")?;
            let values = properties
                .iter()
                .zip(values)
                .filter(|(_, value)| *value != "-")
                .map(|(property, value)| (property.to_string(), value.to_string()))
                .collect();
            Ok((name, values))
        })
        .collect()
}

pub fn get_property(shell: &dyn Shell, dataset: &str, property: &str) -> Result<String> {
    let output = shell
        .exec(&zfs_args(&["get", "-H", "-p", "-o", "value", property, dataset]))
        .map_err(|e| map_missing_dataset(e, dataset))?;
    Ok(output.trim_end().to_string())
}

pub fn get_properties<T: DeserializeOwned>(shell: &dyn Shell, dataset: &str, properties: &[&str]) -> Result<T> {
    let columns = properties.join(",");
    let output = shell
        .exec(&zfs_args(&["get", "-H", "-p", "-o", "property,value", columns.as_str(), dataset]))
        .map_err(|e| map_missing_dataset(e, dataset))?;
    let kvps = parse_key_value_pair_lines::<_, Vec<StringPair>>(output.lines(), "\t")
        .context("Failed to parse output of zfs get.")?;

    envy::from_iter::<_, T>(kvps.into_iter().filter_map(|x| {
        if x.1 != "-" {
            Some((x.0.to_uppercase(), x.1))
        } else {
            None
        }
    }))
    .context("Failed loading properties from zfs get output.")
}

pub fn dataset_used(shell: &dyn Shell, dataset: &str) -> Result<u64> {
    let value = get_property(shell, dataset, "used")?;
    value
        .parse::<u64>()
        .with_context(|| format!("unparseable used size '{}' for {}", value, dataset))
}

/// Idempotent over existing ancestors.
pub fn create_dataset(shell: &dyn Shell, name: &str) -> Result<()> {
    shell.exec(&zfs_args(&["create", "-p", name])).map(|_| ())
}

pub fn destroy_dataset(shell: &dyn Shell, name: &str) -> Result<()> {
    shell.exec(&zfs_args(&["destroy", name])).map(|_| ())
}

/// Bulk destroy, one `zfs destroy ds@a,b,c` per dataset.
pub fn destroy_snapshots(shell: &dyn Shell, snapshots: &[Snapshot]) -> Result<()> {
    let mut by_dataset: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for snapshot in snapshots {
        by_dataset
            .entry(snapshot.dataset.as_str())
            .or_default()
            .push(snapshot.name.as_str());
    }
    for (dataset, names) in by_dataset {
        let argument = format!("{}@{}", dataset, names.join(","));
        shell.exec(&zfs_args(&["destroy", argument.as_str()]))?;
    }
    Ok(())
}

/// Discard a partially received state so a fresh send can begin.
pub fn abort_receive(shell: &dyn Shell, dataset: &str) -> Result<()> {
    shell.exec(&zfs_args(&["receive", "-A", dataset])).map(|_| ())
}

pub fn unmount(shell: &dyn Shell, dataset: &str) -> Result<()> {
    shell.exec(&zfs_args(&["umount", dataset])).map(|_| ())
}

pub fn inherit_readonly(shell: &dyn Shell, dataset: &str) -> Result<()> {
    shell.exec(&zfs_args(&["inherit", "readonly", dataset])).map(|_| ())
}

pub fn set_readonly_on(shell: &dyn Shell, dataset: &str) -> Result<()> {
    shell.exec(&zfs_args(&["set", "readonly=on", dataset])).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::shell::MockShell;
    use crate::tests::prelude::*;
    use anyhow::anyhow;

    #[test]
    fn snapshots_parse_in_creation_order() {
        const ZFS_DATA: &str = indoc!(
            r#"
            tank/data@auto-2024-01-01
            tank/data@auto-2024-01-02
            tank/data/work@auto-2024-01-01"#
        );
        let mut shell = MockShell::new();
        shell
            .expect_exec()
            .withf(|argv: &[String]| argv.contains(&String::from("snapshot")) && argv.contains(&String::from("-r")))
            .returning(|_| Ok(ZFS_DATA.to_string()));

        let by_dataset = list_snapshot_names_by_dataset(&shell, "tank/data", true).unwrap();
        assert_eq!(
            by_dataset.get("tank/data").unwrap(),
            &vec![String::from("auto-2024-01-01"), String::from("auto-2024-01-02")]
        );
        assert_eq!(by_dataset.get("tank/data/work").unwrap().len(), 1);
    }

    #[test]
    fn dataset_properties_drop_unset_values() {
        const ZFS_DATA: &str = indoc!(
            r#"
            backup/data	off	-
            backup/data/work	on	1-abcd-efgh"#
        );
        let mut shell = MockShell::new();
        shell.expect_exec().returning(|_| Ok(ZFS_DATA.to_string()));

        let datasets =
            list_datasets_with_properties(&shell, "backup/data", true, &["readonly", "receive_resume_token"]).unwrap();
        assert_eq!(datasets.len(), 2);
        assert_eq!(datasets[0].1.get("readonly"), Some(&String::from("off")));
        assert_eq!(datasets[0].1.get("receive_resume_token"), None);
        assert_eq!(datasets[1].1.get("receive_resume_token"), Some(&String::from("1-abcd-efgh")));
    }

    #[test]
    fn encryption_status_deserializes() {
        const ZFS_DATA: &str = indoc!(
            r#"
            encryption	aes-256-gcm
            encryptionroot	backup
            mounted	yes
            mountpoint	/mnt/backup/data"#
        );
        let mut shell = MockShell::new();
        shell.expect_exec().returning(|_| Ok(ZFS_DATA.to_string()));

        let status: EncryptionStatus = get_properties(
            &shell,
            "backup/data",
            &["encryption", "encryptionroot", "mounted", "mountpoint"],
        )
        .unwrap();
        assert_eq!(status.encryption, "aes-256-gcm");
        assert_eq!(status.encryption_root.as_deref(), Some("backup"));
        assert_eq!(status.mounted.as_deref(), Some("yes"));
    }

    #[test]
    fn missing_dataset_maps_to_typed_error() {
        let mut shell = MockShell::new();
        shell
            .expect_exec()
            .returning(|_| Err(anyhow!("cannot open 'backup/data': dataset does not exist")));

        let error = list_datasets(&shell, "backup/data", false).unwrap_err();
        assert!(is_missing_dataset(&error));
    }

    #[test]
    fn destroy_snapshots_batches_per_dataset() {
        let mut shell = MockShell::new();
        shell
            .expect_exec()
            .withf(|argv: &[String]| argv == ["zfs", "destroy", "backup/data@auto-2024-01-01,auto-2024-01-02"])
            .times(1)
            .returning(|_| Ok(String::new()));
        shell
            .expect_exec()
            .withf(|argv: &[String]| argv == ["zfs", "destroy", "backup/data/work@auto-2024-01-01"])
            .times(1)
            .returning(|_| Ok(String::new()));

        destroy_snapshots(
            &shell,
            &[
                Snapshot::new("backup/data", "auto-2024-01-01"),
                Snapshot::new("backup/data", "auto-2024-01-02"),
                Snapshot::new("backup/data/work", "auto-2024-01-01"),
            ],
        )
        .unwrap();
    }
}
