//! Interval reconciliation.
//!
//! Given the open intervals stored for one (tag_type, entity, taxonomy) scope
//! and the tag set asserted by a new measurement, compute which intervals to
//! open, prolong, and end:
//!
//! | set | meaning |
//! |-----|---------|
//! | `insert = new − old` | asserted now, not open yet |
//! | `prolong = new ∩ old` | asserted now and already open |
//! | `end = old − new` | open but no longer asserted |
//!
//! Two guards run before any change set is returned, and either one voids the
//! whole measurement:
//!
//! - staleness: no touched open interval may have been measured at or after
//!   the new measurement.
//! - ownership: an interval owned by a producer can only be prolonged or
//!   ended by that same producer.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::models::{OpenInterval, TagChanges, TagState};
use crate::temporal::format_timestamp;

/// Pure set algebra; outputs are sorted by `(tag_id, value_id)`.
pub fn calc_changes(old: &BTreeSet<TagState>, new: &BTreeSet<TagState>) -> TagChanges {
    TagChanges {
        insert: new.difference(old).copied().collect(),
        prolong: new.intersection(old).copied().collect(),
        end: old.difference(new).copied().collect(),
    }
}

/// Fail if any open interval was measured at or after `measured_at`.
pub fn check_not_stale(open: &[OpenInterval], measured_at: DateTime<Utc>) -> Result<()> {
    if let Some(newer) = open.iter().find(|i| i.measured_at >= measured_at) {
        return Err(Error::StaleMeasurement(format!(
            "received measurement with timestamp {} and found tag that has an equal \
             or more recent measured_at with {}",
            format_timestamp(&measured_at),
            format_timestamp(&newer.measured_at)
        )));
    }
    Ok(())
}

/// Producer transition rule for a single existing interval.
///
/// | existing | incoming | result |
/// |----------|----------|--------|
/// | none | any | allowed |
/// | P | none | rejected |
/// | P | P | allowed |
/// | P | Q | rejected |
pub fn check_producer(existing: Option<&str>, incoming: Option<&str>) -> Result<()> {
    match (existing, incoming) {
        (None, _) => Ok(()),
        (Some(owner), None) => Err(Error::InvalidMeasurement(format!(
            "measurement produced by unnamed producer tried to modify intersection produced by {}",
            owner
        ))),
        (Some(owner), Some(producer)) if owner == producer => Ok(()),
        (Some(owner), Some(producer)) => Err(Error::InvalidMeasurement(format!(
            "measurement produced by {} tried to modify intersection produced by {}",
            producer, owner
        ))),
    }
}

/// Check ownership of every interval the change set prolongs or ends.
///
/// Inserted keys have no prior owner and are not checked.
pub fn authorize(
    changes: &TagChanges,
    open_by_state: &BTreeMap<TagState, &OpenInterval>,
    producer: Option<&str>,
) -> Result<()> {
    for state in changes.touched_existing() {
        let interval = open_by_state.get(state).ok_or_else(|| {
            Error::Internal(format!("touched interval {} is not open", state))
        })?;
        check_producer(interval.producer.as_deref(), producer)?;
    }
    Ok(())
}

/// Reconcile stored open intervals against a measurement's tag set.
///
/// Nothing is written here; the caller applies the returned changes.
pub fn reconcile(
    open: &[OpenInterval],
    new: &BTreeSet<TagState>,
    measured_at: DateTime<Utc>,
    producer: Option<&str>,
) -> Result<TagChanges> {
    check_not_stale(open, measured_at)?;

    let open_by_state: BTreeMap<TagState, &OpenInterval> =
        open.iter().map(|i| (i.state(), i)).collect();
    let old: BTreeSet<TagState> = open_by_state.keys().copied().collect();

    let changes = calc_changes(&old, new);
    authorize(&changes, &open_by_state, producer)?;

    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 5, 1, 12, 0, 0).unwrap()
    }

    fn open(tag_id: i64, value_id: Option<i64>, producer: Option<&str>) -> OpenInterval {
        OpenInterval {
            tag_id,
            value_id,
            measured_at: t0(),
            producer: producer.map(str::to_string),
        }
    }

    fn states(items: &[(i64, Option<i64>)]) -> BTreeSet<TagState> {
        items.iter().map(|&(t, v)| TagState::new(t, v)).collect()
    }

    fn vec_states(items: &[(i64, Option<i64>)]) -> Vec<TagState> {
        items.iter().map(|&(t, v)| TagState::new(t, v)).collect()
    }

    #[test]
    fn test_calc_changes_set_identities() {
        let cases = [
            (vec![], vec![]),
            (vec![(1, None)], vec![]),
            (vec![], vec![(1, None)]),
            (
                vec![(1, None), (2, Some(3)), (4, None)],
                vec![(2, Some(3)), (4, Some(1)), (5, None)],
            ),
            (vec![(1, None), (1, Some(2))], vec![(1, Some(2)), (1, None)]),
        ];

        for (a, b) in cases {
            let a = states(&a);
            let b = states(&b);
            let changes = calc_changes(&a, &b);

            let insert: BTreeSet<_> = changes.insert.iter().copied().collect();
            let prolong: BTreeSet<_> = changes.prolong.iter().copied().collect();
            let end: BTreeSet<_> = changes.end.iter().copied().collect();

            assert_eq!(insert, b.difference(&a).copied().collect());
            assert_eq!(prolong, a.intersection(&b).copied().collect());
            assert_eq!(end, a.difference(&b).copied().collect());
            assert_eq!(insert.union(&prolong).copied().collect::<BTreeSet<_>>(), b);
            assert_eq!(prolong.union(&end).copied().collect::<BTreeSet<_>>(), a);
            assert!(insert.is_disjoint(&end));
        }
    }

    #[test]
    fn test_calc_changes_output_is_sorted() {
        let old = states(&[(3, Some(1)), (3, None), (1, None)]);
        let new = states(&[(9, Some(2)), (9, None), (2, None)]);
        let changes = calc_changes(&old, &new);
        assert_eq!(changes.insert, vec_states(&[(2, None), (9, None), (9, Some(2))]));
        assert_eq!(changes.end, vec_states(&[(1, None), (3, None), (3, Some(1))]));
    }

    #[test]
    fn test_reconcile_insert_prolong_end() {
        let existing = vec![open(1, None, Some("P1")), open(2, None, Some("P1"))];
        let new = states(&[(1, None), (5, None)]);
        let changes = reconcile(&existing, &new, t0() + Duration::hours(1), Some("P1")).unwrap();

        assert_eq!(changes.insert, vec_states(&[(5, None)]));
        assert_eq!(changes.prolong, vec_states(&[(1, None)]));
        assert_eq!(changes.end, vec_states(&[(2, None)]));
    }

    #[test]
    fn test_reconcile_empty_measurement_ends_everything() {
        let existing = vec![open(1, None, Some("P1")), open(2, None, Some("P1"))];
        let changes =
            reconcile(&existing, &BTreeSet::new(), t0() + Duration::hours(1), Some("P1")).unwrap();

        assert!(changes.insert.is_empty());
        assert!(changes.prolong.is_empty());
        assert_eq!(changes.end, vec_states(&[(1, None), (2, None)]));
    }

    #[test]
    fn test_reconcile_value_change_ends_old_pair() {
        let existing = vec![open(1, Some(10), None)];
        let new = states(&[(1, Some(11))]);
        let changes = reconcile(&existing, &new, t0() + Duration::minutes(1), Some("P")).unwrap();
        assert_eq!(changes.insert, vec_states(&[(1, Some(11))]));
        assert_eq!(changes.end, vec_states(&[(1, Some(10))]));
    }

    #[test]
    fn test_reconcile_equal_timestamp_is_stale() {
        let existing = vec![open(1, None, Some("P1"))];
        let new = states(&[(1, None)]);
        let err = reconcile(&existing, &new, t0(), Some("P1")).unwrap_err();
        assert!(matches!(err, Error::StaleMeasurement(_)));
    }

    #[test]
    fn test_reconcile_one_stale_interval_voids_everything() {
        let mut newer = open(2, None, Some("P1"));
        newer.measured_at = t0() + Duration::hours(2);
        let existing = vec![open(1, None, Some("P1")), newer];
        let new = states(&[(1, None), (3, None)]);
        let err = reconcile(&existing, &new, t0() + Duration::hours(1), Some("P1")).unwrap_err();
        assert!(matches!(err, Error::StaleMeasurement(_)));
    }

    #[test]
    fn test_reconcile_rejects_anonymous_producer_on_owned_interval() {
        let existing = vec![open(1, None, Some("P1"))];
        let new = states(&[(1, None)]);
        let err = reconcile(&existing, &new, t0() + Duration::hours(1), None).unwrap_err();
        match err {
            Error::InvalidMeasurement(msg) => assert!(msg.contains("unnamed producer")),
            other => panic!("Expected InvalidMeasurement, got {:?}", other),
        }
    }

    #[test]
    fn test_reconcile_rejects_other_producer_ending_interval() {
        let existing = vec![open(1, None, Some("P1"))];
        let err =
            reconcile(&existing, &BTreeSet::new(), t0() + Duration::hours(1), Some("P2"))
                .unwrap_err();
        match err {
            Error::InvalidMeasurement(msg) => {
                assert!(msg.contains("P2"));
                assert!(msg.contains("P1"));
            }
            other => panic!("Expected InvalidMeasurement, got {:?}", other),
        }
    }

    #[test]
    fn test_reconcile_inserts_ignore_foreign_owners() {
        let existing = vec![open(1, None, Some("P1"))];
        let new = states(&[(1, None), (2, None)]);
        // (2, None) is new; only (1, None) is checked and it belongs to P1.
        assert!(reconcile(&existing, &new, t0() + Duration::hours(1), Some("P1")).is_ok());
    }

    #[test]
    fn test_check_producer_table() {
        assert!(check_producer(None, None).is_ok());
        assert!(check_producer(None, Some("P")).is_ok());
        assert!(check_producer(Some("P"), None).is_err());
        assert!(check_producer(Some("P"), Some("P")).is_ok());
        assert!(check_producer(Some("P"), Some("Q")).is_err());
    }

    #[test]
    fn test_unowned_interval_accepts_any_producer() {
        let existing = vec![open(1, None, None), open(2, Some(4), None)];
        let new = states(&[(1, None)]);
        let changes = reconcile(&existing, &new, t0() + Duration::hours(1), Some("P9")).unwrap();
        assert_eq!(changes.prolong, vec_states(&[(1, None)]));
        assert_eq!(changes.end, vec_states(&[(2, Some(4))]));
    }
}
