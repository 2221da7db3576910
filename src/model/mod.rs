use anyhow::{anyhow, bail, Result};
use chrono::NaiveDateTime;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, convert::TryFrom, num::NonZeroU32, str::FromStr, time::Duration};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

#[derive(Display, EnumString, Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReplicationDirection {
    Push,
    Pull,
}

#[derive(Display, EnumString, Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReadonlyBehavior {
    Ignore,
    Set,
    Require,
}

impl Default for ReadonlyBehavior {
    fn default() -> Self {
        ReadonlyBehavior::Ignore
    }
}

#[derive(Display, EnumString, Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EncryptionKeyFormat {
    Hex,
    Passphrase,
    Raw,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EncryptionRecipe {
    pub key: String,
    pub key_format: EncryptionKeyFormat,
    #[serde(default = "default_encryption_scheme")]
    pub scheme: String,
    pub key_location: Option<String>,
}

fn default_encryption_scheme() -> String {
    String::from("aes-256-gcm")
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ReplicationTaskEntity {
    id: Uuid,
    name: String,
    pub direction: ReplicationDirection,
    pub source_datasets: Vec<String>,
    pub target_dataset: String,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub naming_schemas: Vec<String>,
    pub schedule: Option<ScheduleModel>,
    pub restrict_schedule: Option<ScheduleModel>,
    #[serde(default)]
    pub only_matching_schedule: bool,
    pub retention: Option<RetentionRuleset>,
    #[serde(default)]
    pub readonly: ReadonlyBehavior,
    #[serde(default)]
    pub allow_from_scratch: bool,
    #[serde(default)]
    pub replicate: bool,
    pub encryption: Option<EncryptionRecipe>,
    #[serde(default)]
    pub properties: bool,
    #[serde(default)]
    pub properties_exclude: Vec<String>,
    #[serde(default)]
    pub properties_override: BTreeMap<String, String>,
    #[serde(default = "default_retries")]
    pub retries: NonZeroU32,
    pub compression: Option<String>,
    pub speed_limit: Option<u64>,
    #[serde(default)]
    pub dedup: bool,
    #[serde(default)]
    pub large_block: bool,
    #[serde(default)]
    pub embed: bool,
    #[serde(default)]
    pub compressed: bool,
}

fn default_retries() -> NonZeroU32 {
    NonZeroU32::new(5).unwrap()
}

impl ReplicationTaskEntity {
    pub fn new(
        name: String,
        direction: ReplicationDirection,
        source_datasets: Vec<String>,
        target_dataset: String,
    ) -> Result<Self> {
        if source_datasets.is_empty() {
            bail!("Replication task requires at least one source dataset.");
        }

        Ok(Self {
            id: Uuid::new_v4(),
            name,
            direction,
            source_datasets,
            target_dataset,
            recursive: false,
            exclude: Vec::default(),
            naming_schemas: Vec::default(),
            schedule: None,
            restrict_schedule: None,
            only_matching_schedule: false,
            retention: None,
            readonly: ReadonlyBehavior::default(),
            allow_from_scratch: false,
            replicate: false,
            encryption: None,
            properties: false,
            properties_exclude: Vec::default(),
            properties_override: BTreeMap::default(),
            retries: default_retries(),
            compression: None,
            speed_limit: None,
            dedup: false,
            large_block: false,
            embed: false,
            compressed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ScheduleModel(String);

impl ScheduleModel {
    /// Whether a snapshot taken at this instant falls on the schedule.
    pub fn should_run(&self, datetime: NaiveDateTime) -> bool {
        let schedule = match Schedule::try_from(self) {
            Ok(schedule) => schedule,
            Err(_) => return false,
        };
        let instant = chrono::DateTime::<chrono::Utc>::from_utc(datetime, chrono::Utc);
        schedule.after(&(instant - chrono::Duration::seconds(1))).next() == Some(instant)
    }
}

impl TryFrom<&ScheduleModel> for Schedule {
    type Error = anyhow::Error;

    fn try_from(value: &ScheduleModel) -> Result<Self, Self::Error> {
        Schedule::from_str(&value.0).map_err(|e| anyhow!(e.to_string()))
    }
}

impl TryFrom<ScheduleModel> for Schedule {
    type Error = anyhow::Error;

    fn try_from(value: ScheduleModel) -> Result<Self, Self::Error> {
        Self::try_from(&value)
    }
}

impl FromStr for ScheduleModel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Schedule::from_str(s)
            .map(|_| ScheduleModel(s.to_owned()))
            .map_err(|e| anyhow!(e.to_string()))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RetentionRuleset {
    pub interval: Vec<IntervalSpec>,
    pub newest_count: NonZeroU32,
}

impl Default for RetentionRuleset {
    fn default() -> Self {
        Self {
            interval: Default::default(),
            newest_count: NonZeroU32::new(1).unwrap(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct IntervalSpec {
    pub repeat: NonZeroU32,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub keep: KeepSpec,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
#[serde(rename_all = "snake_case")]
pub enum KeepSpec {
    Newest(NonZeroU32),
    All,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn task_requires_source_datasets() {
        let result = ReplicationTaskEntity::new(
            String::from("tank-to-backup"),
            ReplicationDirection::Push,
            vec![],
            String::from("backup/tank"),
        );
        assert!(result.is_err());
    }

    #[test]
    fn schedule_model_rejects_invalid_expressions() {
        assert!("not a schedule".parse::<ScheduleModel>().is_err());
        assert!("0 0 0 * * * *".parse::<ScheduleModel>().is_ok());
    }

    #[test]
    fn schedule_should_run_matches_midnight_only() {
        let schedule: ScheduleModel = "0 0 0 * * * *".parse().unwrap();
        assert!(schedule.should_run(NaiveDate::from_ymd(2024, 1, 2).and_hms(0, 0, 0)));
        assert!(!schedule.should_run(NaiveDate::from_ymd(2024, 1, 2).and_hms(13, 30, 0)));
    }

    #[test]
    fn task_deserializes_with_defaults() {
        let task: ReplicationTaskEntity = serde_json::from_str(
            r#"{
                "id": "b99a584c-72c0-4cbe-9c6d-0c32274563f7",
                "name": "tank-to-backup",
                "direction": "push",
                "source_datasets": ["tank/data"],
                "target_dataset": "backup/data"
            }"#,
        )
        .unwrap();
        assert_eq!(task.direction, ReplicationDirection::Push);
        assert_eq!(task.readonly, ReadonlyBehavior::Ignore);
        assert_eq!(task.retries.get(), 5);
        assert!(!task.allow_from_scratch);
        assert!(task.encryption.is_none());
    }
}
