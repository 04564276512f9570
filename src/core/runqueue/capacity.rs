//! Worker capacity admission control.
//!
//! A pure predicate: scheduled dispatches may only consume worker slots
//! left over after reserving `reserve_for_workers` slots for direct
//! (non-scheduled) worker usage. Stateless; the dispatch loop re-evaluates
//! it on every attempt rather than caching the answer.

/// Whether a new background-job dispatch may consume a worker slot.
pub fn can_dispatch(
    running_count: i64,
    max_concurrent_workers: i64,
    reserve_for_workers: i64,
) -> bool {
    if max_concurrent_workers <= 0 {
        return false;
    }
    let reserve = reserve_for_workers.max(0);
    let usable = (max_concurrent_workers - reserve).max(0);
    running_count < usable
}

/// Advisory shown in `status()` warnings when scheduled load has consumed
/// every usable slot while work is still queued.
pub fn capacity_warning(
    queued_count: i64,
    running_count: i64,
    max_concurrent_workers: i64,
    reserve_for_workers: i64,
) -> Option<String> {
    if queued_count > 0 && !can_dispatch(running_count, max_concurrent_workers, reserve_for_workers)
    {
        Some(format!(
            "worker capacity exhausted ({} running, {} max, {} reserved); {} run(s) queued",
            running_count,
            max_concurrent_workers,
            reserve_for_workers.max(0),
            queued_count
        ))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_allowed_below_usable_slots() {
        assert!(can_dispatch(0, 4, 1));
        assert!(can_dispatch(2, 4, 1));
        assert!(!can_dispatch(3, 4, 1));
        assert!(!can_dispatch(4, 4, 1));
    }

    #[test]
    fn zero_or_negative_max_never_dispatches() {
        assert!(!can_dispatch(0, 0, 0));
        assert!(!can_dispatch(0, -1, 0));
    }

    #[test]
    fn negative_reserve_treated_as_zero() {
        assert!(can_dispatch(3, 4, -2));
        assert!(!can_dispatch(4, 4, -2));
    }

    #[test]
    fn reserve_larger_than_max_blocks_everything() {
        assert!(!can_dispatch(0, 2, 5));
    }

    #[test]
    fn predicate_matches_closed_form() {
        for max in -2..6i64 {
            for reserve in -2..6i64 {
                for running in 0..8i64 {
                    let usable = if max <= 0 {
                        0
                    } else {
                        (max - reserve.max(0)).max(0)
                    };
                    assert_eq!(
                        can_dispatch(running, max, reserve),
                        max > 0 && running < usable,
                        "running={} max={} reserve={}",
                        running,
                        max,
                        reserve
                    );
                }
            }
        }
    }

    #[test]
    fn warning_only_when_queued_and_saturated() {
        assert!(capacity_warning(2, 3, 4, 1).is_some());
        assert!(capacity_warning(0, 3, 4, 1).is_none());
        assert!(capacity_warning(2, 1, 4, 1).is_none());
    }
}
