use crate::model::{KeepSpec, RetentionRuleset};
use crate::parsing::ParsedSnapshotName;
use chrono::NaiveDateTime;
use std::{cmp::Reverse, convert::TryFrom, iter::repeat, num::NonZeroUsize};

/// Evaluate a retention ruleset against parsed snapshots. The reference
/// time anchors the interval buckets and is supplied by the caller (the
/// planner uses the newest snapshot on the source, not the wall clock).
pub fn evaluate_retention<'a>(
    snapshots: &'a [ParsedSnapshotName],
    reference_time: NaiveDateTime,
    rules: &RetentionRuleset,
) -> RetentionEvaluation<'a> {
    let mut snapshots: Vec<&'a ParsedSnapshotName> = snapshots.iter().collect();
    snapshots.sort_unstable_by_key(|s| Reverse(s.sort_key()));
    let snapshots = snapshots;

    let mut keep_interval_buckets = rules
        .interval
        .iter()
        .flat_map(|m| repeat(m).take(usize::try_from(m.repeat.get()).unwrap()))
        .scan(reference_time, |end_time_state, sm| {
            *end_time_state = *end_time_state - chrono::Duration::from_std(sm.duration).unwrap();
            Some(RetainBucket::new(sm.keep, *end_time_state))
        })
        .collect::<Vec<_>>();

    let mut keep_minimum_snapshots = vec![];
    let mut drop_snapshots = vec![];
    let mut bucket_iter = keep_interval_buckets.iter_mut();
    let mut current_bucket = bucket_iter.next();
    for (index, snapshot) in snapshots.into_iter().enumerate() {
        while let Some(ref bucket) = current_bucket {
            if snapshot.datetime >= bucket.end_time {
                break;
            } else {
                current_bucket = bucket_iter.next();
            }
        }

        match current_bucket {
            Some(ref mut bucket) if bucket.snapshots.len() < bucket.max_fill.get() => bucket.snapshots.push(snapshot),
            _ if index < usize::try_from(rules.newest_count.get()).unwrap() => keep_minimum_snapshots.push(snapshot),
            _ => drop_snapshots.push(snapshot),
        }
    }

    RetentionEvaluation {
        drop_snapshots,
        keep_minimum_snapshots,
        keep_interval_buckets,
    }
}

pub struct RetentionEvaluation<'a> {
    pub drop_snapshots: Vec<&'a ParsedSnapshotName>,
    pub keep_minimum_snapshots: Vec<&'a ParsedSnapshotName>,
    pub keep_interval_buckets: Vec<RetainBucket<'a>>,
}

#[derive(Debug)]
pub struct RetainBucket<'a> {
    pub snapshots: Vec<&'a ParsedSnapshotName>,
    pub max_fill: NonZeroUsize,
    pub end_time: NaiveDateTime,
}

impl<'a> RetainBucket<'a> {
    fn new(keep: KeepSpec, end_time: NaiveDateTime) -> Self {
        Self {
            snapshots: Default::default(),
            max_fill: match keep {
                KeepSpec::Newest(n) => NonZeroUsize::new(usize::try_from(n.get()).unwrap()).unwrap(),
                KeepSpec::All => NonZeroUsize::new(usize::MAX).unwrap(),
            },
            end_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::IntervalSpec;
    use crate::parsing::parse_snapshot_name;
    use chrono::NaiveDate;
    use std::num::NonZeroU32;
    use std::time::Duration;

    fn daily_snapshots(days: u32) -> Vec<ParsedSnapshotName> {
        (1..=days)
            .map(|d| parse_snapshot_name(&format!("auto-2024-01-{:02}", d), "auto-%Y-%m-%d").unwrap())
            .collect()
    }

    fn rules(repeat: u32, newest_count: u32) -> RetentionRuleset {
        RetentionRuleset {
            interval: vec![IntervalSpec {
                repeat: NonZeroU32::new(repeat).unwrap(),
                duration: Duration::from_secs(24 * 3600),
                keep: KeepSpec::Newest(NonZeroU32::new(1).unwrap()),
            }],
            newest_count: NonZeroU32::new(newest_count).unwrap(),
        }
    }

    #[test]
    fn drops_outside_buckets_and_minimum() {
        let snapshots = daily_snapshots(10);
        let reference = NaiveDate::from_ymd(2024, 1, 10).and_hms(0, 0, 0);
        let evaluation = evaluate_retention(&snapshots, reference, &rules(3, 2));

        let dropped: Vec<&str> = evaluation.drop_snapshots.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            dropped,
            vec![
                "auto-2024-01-06",
                "auto-2024-01-05",
                "auto-2024-01-04",
                "auto-2024-01-03",
                "auto-2024-01-02",
                "auto-2024-01-01"
            ]
        );
        assert_eq!(evaluation.keep_minimum_snapshots.len(), 1);
        assert_eq!(evaluation.keep_minimum_snapshots[0].name, "auto-2024-01-09");
    }

    #[test]
    fn keeps_everything_with_all_spec() {
        let snapshots = daily_snapshots(5);
        let reference = NaiveDate::from_ymd(2024, 1, 5).and_hms(0, 0, 0);
        let ruleset = RetentionRuleset {
            interval: vec![IntervalSpec {
                repeat: NonZeroU32::new(1).unwrap(),
                duration: Duration::from_secs(30 * 24 * 3600),
                keep: KeepSpec::All,
            }],
            newest_count: NonZeroU32::new(1).unwrap(),
        };
        let evaluation = evaluate_retention(&snapshots, reference, &ruleset);
        assert!(evaluation.drop_snapshots.is_empty());
    }

    #[test]
    fn empty_input_evaluates_empty() {
        let reference = NaiveDate::from_ymd(2024, 1, 1).and_hms(0, 0, 0);
        let evaluation = evaluate_retention(&[], reference, &rules(2, 1));
        assert!(evaluation.drop_snapshots.is_empty());
        assert!(evaluation.keep_minimum_snapshots.is_empty());
    }
}
