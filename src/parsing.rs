use anyhow::{anyhow, Result};
use chrono::{NaiveDate, NaiveDateTime};
use std::iter::FromIterator;

pub type StringPair = (String, String);

pub fn parse_key_value_pair_lines<'a, T, U>(lines: T, seperator: &str) -> Result<U>
where
    T: Iterator<Item = &'a str>,
    U: FromIterator<StringPair>,
{
    lines
        .map(|s| parse_key_value_pair_line(s, seperator))
        .collect::<Result<U>>()
}

fn parse_key_value_pair_line(line: &str, seperator: &str) -> Result<StringPair> {
    let parts: Vec<&str> = line.splitn(2, seperator).collect();
    match parts.len() {
        2 => Ok((parts[0].trim().to_string(), parts[1].trim().to_string())),
        _ => Err(anyhow!("Invalid line in key value pair data.")),
    }
}

/// A snapshot name matched against a naming schema. Two parsed names are
/// the same snapshot only if both name and schema agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParsedSnapshotName {
    pub name: String,
    pub schema: String,
    pub datetime: NaiveDateTime,
}

impl ParsedSnapshotName {
    /// Total order used everywhere snapshots are compared: datetime first,
    /// name lexicographic as the tie-break.
    pub fn sort_key(&self) -> (NaiveDateTime, &str) {
        (self.datetime, &self.name)
    }
}

pub fn parse_snapshot_name(name: &str, schema: &str) -> Option<ParsedSnapshotName> {
    NaiveDateTime::parse_from_str(name, schema)
        .or_else(|_| {
            // Schemas without time fields parse as a date at midnight.
            NaiveDate::parse_from_str(name, schema).map(|d| d.and_hms(0, 0, 0))
        })
        .ok()
        .map(|datetime| ParsedSnapshotName {
            name: name.to_string(),
            schema: schema.to_string(),
            datetime,
        })
}

/// Match every name against every schema. Names matching no schema are
/// dropped; a name matching two schemas yields two entries.
pub fn parse_snapshot_names(names: &[String], schemas: &[String]) -> Vec<ParsedSnapshotName> {
    names
        .iter()
        .flat_map(|name| schemas.iter().filter_map(move |schema| parse_snapshot_name(name, schema)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_date_only_schema() {
        let parsed = parse_snapshot_name("auto-2024-01-02", "auto-%Y-%m-%d").unwrap();
        assert_eq!(parsed.datetime, NaiveDate::from_ymd(2024, 1, 2).and_hms(0, 0, 0));
        assert_eq!(parsed.schema, "auto-%Y-%m-%d");
    }

    #[test]
    fn parses_datetime_schema() {
        let parsed = parse_snapshot_name("auto-2024-01-02_15-30", "auto-%Y-%m-%d_%H-%M").unwrap();
        assert_eq!(parsed.datetime, NaiveDate::from_ymd(2024, 1, 2).and_hms(15, 30, 0));
    }

    #[test]
    fn rejects_non_matching_names() {
        assert!(parse_snapshot_name("manual-backup", "auto-%Y-%m-%d").is_none());
        assert!(parse_snapshot_name("auto-2024-01-02-extra", "auto-%Y-%m-%d").is_none());
    }

    #[test]
    fn multiple_schemas_yield_multiple_entries() {
        let names = vec!["auto-2024-01-02".to_string(), "hourly-2024-01-02".to_string()];
        let schemas = vec!["auto-%Y-%m-%d".to_string(), "hourly-%Y-%m-%d".to_string()];
        let parsed = parse_snapshot_names(&names, &schemas);
        assert_eq!(parsed.len(), 2);
        assert!(parsed.iter().all(|p| p.name.contains("2024-01-02")));
    }

    #[test]
    fn key_value_lines() {
        let parsed: Vec<StringPair> =
            parse_key_value_pair_lines("encryption\toff\nreadonly\ton".lines(), "\t").unwrap();
        assert_eq!(
            parsed,
            vec![
                ("encryption".to_string(), "off".to_string()),
                ("readonly".to_string(), "on".to_string())
            ]
        );
    }
}
