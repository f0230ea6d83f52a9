//! Turns a global start position and message budget into per-partition
//! fetch windows. Pure, no I/O.

use std::collections::HashMap;

use crate::error::FetchError;
use crate::protocol::{
    FetchWindow, Offset, PartitionId, PartitionSelector, PartitionWatermark, StartPosition,
};
use crate::Result;

/// Windows to fetch plus the partitions that were left out because they
/// hold no records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPlan {
    pub windows: Vec<FetchWindow>,
    pub per_partition_count: i64,
    pub skipped: Vec<PartitionId>,
}

impl FetchPlan {
    /// Total number of records the windows can yield
    pub fn capacity(&self) -> usize {
        self.windows.iter().map(|w| w.len() as usize).sum()
    }
}

/// Pick the partitions a request addresses.
///
/// A single requested partition must lie in `[0, partition_count)` and be
/// known to the broker.
pub fn resolve_partitions(
    topic: &str,
    selector: PartitionSelector,
    available: &[PartitionId],
) -> Result<Vec<PartitionId>> {
    match selector {
        PartitionSelector::All => Ok(available.to_vec()),
        PartitionSelector::Partition(id) => {
            let in_range = id >= 0 && (id as usize) < available.len();
            if !in_range || !available.contains(&id) {
                return Err(FetchError::InvalidPartition {
                    topic: topic.to_string(),
                    partition: id,
                    partition_count: available.len(),
                });
            }
            Ok(vec![id])
        }
    }
}

/// Split `message_budget` evenly across the partitions that have records.
///
/// Windows come back in the order of `partitions`. Partitions without a
/// watermark entry are treated as empty.
pub fn plan(
    start: StartPosition,
    message_budget: u16,
    partitions: &[PartitionId],
    marks: &HashMap<PartitionId, PartitionWatermark>,
) -> FetchPlan {
    let (eligible, skipped): (Vec<PartitionWatermark>, Vec<PartitionId>) = partitions.iter().fold(
        (Vec::new(), Vec::new()),
        |(mut eligible, mut skipped), id| {
            match marks.get(id) {
                Some(mark) if !mark.is_empty() => eligible.push(*mark),
                _ => skipped.push(*id),
            }
            (eligible, skipped)
        },
    );

    if eligible.is_empty() || message_budget == 0 {
        return FetchPlan {
            windows: Vec::new(),
            per_partition_count: 0,
            skipped: partitions.to_vec(),
        };
    }

    let budget = i64::from(message_budget);
    let count = eligible.len() as i64;
    let per_partition_count = (budget + count - 1) / count;

    let mut windows = Vec::with_capacity(eligible.len());
    let mut skipped = skipped;
    for mark in eligible {
        let window = plan_window(start, per_partition_count, &mark);
        if window.is_empty() {
            // explicit offset at or beyond the high watermark
            skipped.push(mark.partition_id);
        } else {
            windows.push(window);
        }
    }

    FetchPlan {
        windows,
        per_partition_count,
        skipped,
    }
}

/// Compute a single partition's window.
///
/// Any computed start at or below the low watermark falls back to an
/// oldest-first window, and the end never passes the high watermark.
pub fn plan_window(
    start: StartPosition,
    per_partition_count: i64,
    mark: &PartitionWatermark,
) -> FetchWindow {
    let oldest = |low: Offset| (low, low.saturating_add(per_partition_count));

    let (start_offset, end_offset) = match start {
        StartPosition::Newest => (mark.high - per_partition_count, mark.high),
        // last included offset is low + count - 1
        StartPosition::Oldest => oldest(mark.low),
        StartPosition::Explicit(offset) => (offset, offset.saturating_add(per_partition_count)),
    };

    let (start_offset, end_offset) = if start_offset <= mark.low {
        oldest(mark.low)
    } else {
        (start_offset, end_offset)
    };

    let end_offset = end_offset.min(mark.high);
    FetchWindow {
        partition_id: mark.partition_id,
        start_offset: start_offset.min(end_offset),
        end_offset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mark(partition_id: PartitionId, low: Offset, high: Offset) -> PartitionWatermark {
        PartitionWatermark::new(partition_id, low, high).unwrap()
    }

    fn marks(list: &[PartitionWatermark]) -> HashMap<PartitionId, PartitionWatermark> {
        list.iter().map(|m| (m.partition_id, *m)).collect()
    }

    #[test]
    fn test_oldest_window_includes_low() {
        let window = plan_window(StartPosition::Oldest, 10, &mark(0, 0, 100));
        assert_eq!(window.start_offset, 0);
        assert_eq!(window.last_offset(), Some(9));
        assert_eq!(window.len(), 10);
    }

    #[test]
    fn test_newest_window() {
        let window = plan_window(StartPosition::Newest, 10, &mark(0, 0, 100));
        assert_eq!((window.start_offset, window.end_offset), (90, 100));
    }

    #[test]
    fn test_explicit_below_low_falls_back() {
        let window = plan_window(StartPosition::Explicit(5), 10, &mark(0, 10, 100));
        assert_eq!((window.start_offset, window.end_offset), (10, 20));
    }

    #[test]
    fn test_explicit_inside_range() {
        let window = plan_window(StartPosition::Explicit(40), 10, &mark(0, 10, 100));
        assert_eq!((window.start_offset, window.end_offset), (40, 50));
    }

    #[test]
    fn test_newest_on_short_partition_falls_back() {
        let window = plan_window(StartPosition::Newest, 10, &mark(0, 3, 7));
        assert_eq!((window.start_offset, window.end_offset), (3, 7));
    }

    #[test]
    fn test_explicit_beyond_high_is_empty() {
        let window = plan_window(StartPosition::Explicit(500), 10, &mark(0, 0, 100));
        assert!(window.is_empty());
    }

    #[test]
    fn test_budget_split_rounds_up() {
        let partitions = [0, 1, 2];
        let plan = plan(
            StartPosition::Newest,
            20,
            &partitions,
            &marks(&[mark(0, 0, 100), mark(1, 0, 100), mark(2, 0, 100)]),
        );
        assert_eq!(plan.per_partition_count, 7);
        assert_eq!(plan.windows.len(), 3);
        assert!(plan.windows.iter().all(|w| w.len() == 7));
        assert_eq!(plan.capacity(), 21);
    }

    #[test]
    fn test_empty_partitions_are_skipped() {
        let partitions = [0, 1, 2];
        let plan = plan(
            StartPosition::Oldest,
            10,
            &partitions,
            &marks(&[mark(0, 5, 5), mark(1, 0, 50), mark(2, 0, 0)]),
        );
        assert_eq!(plan.per_partition_count, 10);
        assert_eq!(plan.windows.len(), 1);
        assert_eq!(plan.windows[0].partition_id, 1);
        assert_eq!(plan.skipped, vec![0, 2]);
    }

    #[test]
    fn test_zero_budget_plans_nothing() {
        let plan = plan(StartPosition::Oldest, 0, &[0], &marks(&[mark(0, 0, 10)]));
        assert!(plan.windows.is_empty());
    }

    #[test]
    fn test_resolve_partitions() {
        let available = [0, 1, 2];
        assert_eq!(
            resolve_partitions("t", PartitionSelector::All, &available).unwrap(),
            vec![0, 1, 2]
        );
        assert_eq!(
            resolve_partitions("t", PartitionSelector::Partition(2), &available).unwrap(),
            vec![2]
        );

        let err = resolve_partitions("t", PartitionSelector::Partition(7), &available).unwrap_err();
        assert_eq!(
            err,
            FetchError::InvalidPartition {
                topic: "t".to_string(),
                partition: 7,
                partition_count: 3,
            }
        );
        assert!(resolve_partitions("t", PartitionSelector::Partition(3), &available).is_err());
        assert!(resolve_partitions("t", PartitionSelector::Partition(-2), &available).is_err());
    }
}
