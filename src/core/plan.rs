use super::retention::evaluate_retention;
use crate::model::ReplicationTaskEntity;
use crate::parsing::{parse_snapshot_names, ParsedSnapshotName};
use chrono::NaiveDateTime;
use std::collections::HashSet;

/// Given raw snapshot names from both sides of a dataset pair, decide the
/// incremental base and the ordered list of snapshots to send.
///
/// Snapshot lists are expected in ZFS creation order; within a schema that
/// order must agree with the `(datetime, name)` order of the parsed names.
pub fn plan_snapshots(
    src_snapshots: &[String],
    dst_snapshots: &[String],
    task: &ReplicationTaskEntity,
) -> (Option<String>, Vec<String>) {
    let parsed_src = parse_snapshot_names(src_snapshots, &task.naming_schemas);
    let parsed_dst = parse_snapshot_names(dst_snapshots, &task.naming_schemas);

    // Intersect by (name, schema) so the same name under two schemas does
    // not double-count.
    let dst_keys: HashSet<(&str, &str)> = parsed_dst
        .iter()
        .map(|p| (p.name.as_str(), p.schema.as_str()))
        .collect();
    let incremental_base = parsed_src
        .iter()
        .filter(|p| dst_keys.contains(&(p.name.as_str(), p.schema.as_str())))
        .max_by(|a, b| a.sort_key().cmp(&b.sort_key()));

    let mut candidates: Vec<ParsedSnapshotName> = parsed_src
        .iter()
        .filter(|p| match incremental_base {
            None => true,
            Some(base) => p.sort_key() > base.sort_key(),
        })
        .filter(|p| should_replicate_snapshot(task, p))
        .cloned()
        .collect();
    candidates.sort_unstable_by(|a, b| a.sort_key().cmp(&b.sort_key()));

    // Never transmit a snapshot the retention policy would immediately
    // destroy. The reference time is the newest parsed snapshot on the
    // source, so evaluation is stable regardless of when the task runs.
    if let Some(rules) = &task.retention {
        let reference_time = parsed_src
            .iter()
            .map(|p| p.datetime)
            .max()
            .unwrap_or_else(max_reference_time);
        let will_be_removed: HashSet<(String, String)> = evaluate_retention(&candidates, reference_time, rules)
            .drop_snapshots
            .iter()
            .map(|p| (p.name.clone(), p.schema.clone()))
            .collect();
        candidates.retain(|p| !will_be_removed.contains(&(p.name.clone(), p.schema.clone())));
    }

    let mut seen = HashSet::new();
    let snapshots_to_send = candidates
        .into_iter()
        .filter(|p| seen.insert(p.name.clone()))
        .map(|p| p.name)
        .collect();

    (incremental_base.map(|p| p.name.clone()), snapshots_to_send)
}

fn should_replicate_snapshot(task: &ReplicationTaskEntity, parsed: &ParsedSnapshotName) -> bool {
    if let Some(restrict) = &task.restrict_schedule {
        if !restrict.should_run(parsed.datetime) {
            return false;
        }
    }
    if task.only_matching_schedule {
        match &task.schedule {
            Some(schedule) if schedule.should_run(parsed.datetime) => {}
            _ => return false,
        }
    }
    true
}

fn max_reference_time() -> NaiveDateTime {
    chrono::naive::MAX_DATE.and_hms(23, 59, 59)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IntervalSpec, KeepSpec, ReplicationDirection, RetentionRuleset};
    use std::num::NonZeroU32;
    use std::time::Duration;

    fn task() -> ReplicationTaskEntity {
        let mut task = ReplicationTaskEntity::new(
            String::from("tank-to-backup"),
            ReplicationDirection::Push,
            vec![String::from("tank/data")],
            String::from("backup/data"),
        )
        .unwrap();
        task.naming_schemas = vec![String::from("auto-%Y-%m-%d")];
        task
    }

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn incremental_with_shared_base() {
        let src = names(&["auto-2024-01-01", "auto-2024-01-02", "auto-2024-01-03", "auto-2024-01-04"]);
        let dst = names(&["auto-2024-01-01", "auto-2024-01-02"]);
        let (base, to_send) = plan_snapshots(&src, &dst, &task());
        assert_eq!(base.as_deref(), Some("auto-2024-01-02"));
        assert_eq!(to_send, names(&["auto-2024-01-03", "auto-2024-01-04"]));
    }

    #[test]
    fn empty_source_plans_nothing() {
        let (base, to_send) = plan_snapshots(&[], &names(&["auto-2024-01-01"]), &task());
        assert_eq!(base, None);
        assert!(to_send.is_empty());
    }

    #[test]
    fn no_shared_base_returns_all_candidates() {
        let src = names(&["auto-2024-01-03", "auto-2024-01-04"]);
        let dst = names(&["auto-2024-01-01"]);
        let (base, to_send) = plan_snapshots(&src, &dst, &task());
        assert_eq!(base, None);
        assert_eq!(to_send, names(&["auto-2024-01-03", "auto-2024-01-04"]));
    }

    #[test]
    fn unparseable_names_are_dropped() {
        let src = names(&["manual-keep", "auto-2024-01-02"]);
        let (base, to_send) = plan_snapshots(&src, &[], &task());
        assert_eq!(base, None);
        assert_eq!(to_send, names(&["auto-2024-01-02"]));
    }

    #[test]
    fn base_tie_breaks_on_name() {
        let mut task = task();
        task.naming_schemas = vec![String::from("a-%Y-%m-%d"), String::from("b-%Y-%m-%d")];
        let src = names(&["a-2024-01-01", "b-2024-01-01"]);
        let dst = names(&["a-2024-01-01", "b-2024-01-01"]);
        let (base, to_send) = plan_snapshots(&src, &dst, &task);
        assert_eq!(base.as_deref(), Some("b-2024-01-01"));
        assert!(to_send.is_empty());
    }

    #[test]
    fn retention_prunes_send_list() {
        let mut task = task();
        task.retention = Some(RetentionRuleset {
            interval: vec![],
            newest_count: NonZeroU32::new(2).unwrap(),
        });
        let src = names(&[
            "auto-2024-01-01",
            "auto-2024-01-02",
            "auto-2024-01-03",
            "auto-2024-01-04",
            "auto-2024-01-05",
        ]);
        let (base, to_send) = plan_snapshots(&src, &[], &task);
        assert_eq!(base, None);
        assert_eq!(to_send, names(&["auto-2024-01-04", "auto-2024-01-05"]));
    }

    #[test]
    fn retention_interval_keeps_bucketed_snapshots() {
        let mut task = task();
        task.retention = Some(RetentionRuleset {
            interval: vec![IntervalSpec {
                repeat: NonZeroU32::new(4).unwrap(),
                duration: Duration::from_secs(24 * 3600),
                keep: KeepSpec::All,
            }],
            newest_count: NonZeroU32::new(1).unwrap(),
        });
        let src = names(&["auto-2024-01-01", "auto-2024-01-02", "auto-2024-01-03"]);
        let (_, to_send) = plan_snapshots(&src, &[], &task);
        assert_eq!(
            to_send,
            names(&["auto-2024-01-01", "auto-2024-01-02", "auto-2024-01-03"])
        );
    }

    #[test]
    fn restrict_schedule_filters_candidates() {
        let mut task = task();
        // 2024-01-01 is a Monday.
        task.restrict_schedule = Some("0 0 0 * * Mon *".parse().unwrap());
        let src = names(&["auto-2024-01-01", "auto-2024-01-02"]);
        let (_, to_send) = plan_snapshots(&src, &[], &task);
        assert_eq!(to_send, names(&["auto-2024-01-01"]));
    }

    #[test]
    fn only_matching_schedule_requires_task_schedule() {
        let mut task = task();
        task.only_matching_schedule = true;
        task.schedule = Some("0 0 0 * * Mon *".parse().unwrap());
        let src = names(&["auto-2024-01-01", "auto-2024-01-02"]);
        let (_, to_send) = plan_snapshots(&src, &[], &task);
        assert_eq!(to_send, names(&["auto-2024-01-01"]));
    }

    #[test]
    fn planner_is_idempotent() {
        let src = names(&["auto-2024-01-01", "auto-2024-01-02", "auto-2024-01-03"]);
        let dst = names(&["auto-2024-01-01"]);
        let first = plan_snapshots(&src, &dst, &task());
        let second = plan_snapshots(&src, &dst, &task());
        assert_eq!(first, second);
    }

    #[test]
    fn send_list_is_strictly_ascending_after_base() {
        let src = names(&[
            "auto-2024-01-03",
            "auto-2024-01-01",
            "auto-2024-01-05",
            "auto-2024-01-02",
            "auto-2024-01-04",
        ]);
        let dst = names(&["auto-2024-01-02"]);
        let (base, to_send) = plan_snapshots(&src, &dst, &task());
        assert_eq!(base.as_deref(), Some("auto-2024-01-02"));
        assert_eq!(to_send, names(&["auto-2024-01-03", "auto-2024-01-04", "auto-2024-01-05"]));
        let mut sorted = to_send.clone();
        sorted.sort();
        assert_eq!(to_send, sorted);
    }
}
