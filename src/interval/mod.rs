//! Time-range arithmetic used by request validation and overlay alignment.
//!
//! All functions are pure. They accept degenerate ranges (`start == end`) because events without
//! an end time are stored that way and still have to be placed on a chart.
use time::{Duration, OffsetDateTime};

use crate::types::TimeRange;

/// True iff the two half-open ranges share at least one instant.
pub fn overlaps(a: &TimeRange, b: &TimeRange) -> bool {
    a.start < b.end && b.start < a.end
}

pub fn is_within(inner: &TimeRange, outer: &TimeRange) -> bool {
    inner.start >= outer.start && inner.end <= outer.end
}

/// Clamps `event` into `bounds`, padding the result to at least `min_duration` without ever
/// passing `bounds.end`. Returns `None` when the event does not touch `bounds`.
///
/// A zero-width event is the instant `event.start`, so it is kept when that instant lies in
/// `[bounds.start, bounds.end)`.
pub fn clamp(event: &TimeRange, bounds: &TimeRange, min_duration: Duration) -> Option<TimeRange> {
    let touches = if event.is_degenerate() {
        bounds.contains(event.start)
    } else {
        overlaps(event, bounds)
    };
    if !touches {
        return None;
    }

    let start = event.start.max(bounds.start);
    let padded = start
        .checked_add(min_duration.max(Duration::ZERO))
        .unwrap_or(bounds.end)
        .min(bounds.end);
    let end = event.end.min(bounds.end).max(padded);
    Some(TimeRange::new(start, end))
}

/// Preset windows offered next to the free-form range picker.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QuickRange {
    LastHour,
    LastDay,
    LastWeek,
}

impl QuickRange {
    pub fn length(&self) -> Duration {
        match self {
            QuickRange::LastHour => Duration::HOUR,
            QuickRange::LastDay => Duration::DAY,
            QuickRange::LastWeek => Duration::WEEK,
        }
    }

    pub fn ending_at(&self, now: OffsetDateTime) -> TimeRange {
        TimeRange::new(now - self.length(), now)
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;
    use time::{Duration, OffsetDateTime};

    use super::{clamp, is_within, overlaps, QuickRange};
    use crate::types::TimeRange;

    fn at(secs: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(secs).unwrap()
    }

    fn range(start: i64, end: i64) -> TimeRange {
        TimeRange::new(at(start), at(end))
    }

    #[test]
    fn test_that_adjacent_ranges_do_not_overlap() {
        assert!(!overlaps(&range(0, 10), &range(10, 20)));
        assert!(overlaps(&range(0, 11), &range(10, 20)));
        assert!(overlaps(&range(12, 15), &range(10, 20)));
    }

    #[test]
    fn test_that_containment_is_inclusive_of_edges() {
        assert!(is_within(&range(10, 20), &range(10, 20)));
        assert!(!is_within(&range(9, 20), &range(10, 20)));
        assert!(!is_within(&range(15, 21), &range(10, 20)));
    }

    #[test]
    fn test_that_clamp_discards_disjoint_event() {
        let bounds = range(100, 200);
        assert!(clamp(&range(10, 50), &bounds, Duration::seconds(5)).is_none());
        assert!(clamp(&range(200, 250), &bounds, Duration::seconds(5)).is_none());
    }

    #[test]
    fn test_that_clamp_pads_degenerate_event() {
        let bounds = range(0, 1000);
        let clamped = clamp(&range(500, 500), &bounds, Duration::seconds(5)).unwrap();
        assert_eq!(clamped.start, at(500));
        assert!(clamped.duration() >= Duration::seconds(5));
        assert!(clamped.end <= bounds.end);
    }

    #[test]
    fn test_that_padding_stops_at_bounds_end() {
        let bounds = range(0, 1000);
        let clamped = clamp(&range(998, 998), &bounds, Duration::seconds(5)).unwrap();
        assert_eq!(clamped.start, at(998));
        assert_eq!(clamped.end, at(1000));
    }

    #[test]
    fn test_that_clamp_trims_both_sides() {
        let bounds = range(100, 200);
        let clamped = clamp(&range(50, 500), &bounds, Duration::seconds(5)).unwrap();
        assert_eq!(clamped, bounds);
    }

    #[test]
    fn test_that_clamp_never_escapes_bounds() {
        let bounds = range(100, 200);
        let min = Duration::seconds(30);
        for start in (0..300).step_by(7) {
            for width in [0, 1, 13, 60, 150, 400] {
                let event = range(start, start + width);
                if let Some(clamped) = clamp(&event, &bounds, min) {
                    assert!(clamped.start >= bounds.start);
                    assert!(clamped.end <= bounds.end);
                    assert!(clamped.start <= clamped.end);
                }
            }
        }
    }

    #[test]
    fn test_that_quick_range_ends_now() {
        let now = datetime!(2024-01-08 00:00 UTC);
        let week = QuickRange::LastWeek.ending_at(now);
        assert_eq!(week.start, datetime!(2024-01-01 00:00 UTC));
        assert_eq!(week.end, now);
        assert_eq!(QuickRange::LastHour.ending_at(now).duration(), Duration::HOUR);
    }
}
