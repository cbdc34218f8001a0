use rand::thread_rng;
use rand_distr::{Distribution, Normal};
use time::{Duration, OffsetDateTime};

use crate::types::{MetricPoint, TimeRange};

/// Ordered samples of one signal.
#[derive(Clone, Debug, Default)]
pub struct MetricSource {
    points: Vec<MetricPoint>,
}

impl MetricSource {
    pub fn into_points(self) -> Vec<MetricPoint> {
        self.points
    }

    /// Number of samples [MetricSource::random] produces for `range` and `step`, or `None` when
    /// that does not fit in a `u64`.
    pub fn sample_count(range: &TimeRange, step: Duration) -> Option<u64> {
        if step <= Duration::ZERO || !range.is_valid() {
            return Some(0);
        }
        let span = (range.end - range.start).whole_nanoseconds();
        let step = step.whole_nanoseconds();
        u64::try_from((span + step - 1) / step).ok()
    }

    /// Normally distributed samples every `step` across `range`, each tagged with `threshold`.
    ///
    /// Stops early if a step would leave the representable date range.
    pub fn random(
        range: &TimeRange,
        step: Duration,
        mean: f64,
        std_dev: f64,
        threshold: f64,
    ) -> Self {
        let mut source = Self::default();
        if step <= Duration::ZERO || !range.is_valid() {
            return source;
        }

        let std_dev = if std_dev.is_finite() { std_dev.abs() } else { 1.0 };
        let Ok(dist) = Normal::new(mean, std_dev) else {
            return source;
        };
        let mut rng = thread_rng();

        let mut date: Option<OffsetDateTime> = Some(range.start);
        while let Some(timestamp) = date.filter(|date| *date < range.end) {
            source.points.push(MetricPoint {
                timestamp,
                value: dist.sample(&mut rng),
                threshold: Some(threshold),
                baseline: Some(mean),
            });
            date = timestamp.checked_add(step);
        }
        source
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;
    use time::Duration;

    use super::MetricSource;
    use crate::types::TimeRange;

    #[test]
    fn test_that_random_source_covers_range() {
        let range = TimeRange::new(
            datetime!(2024-01-01 00:00 UTC),
            datetime!(2024-01-02 00:00 UTC),
        );
        let points =
            MetricSource::random(&range, Duration::minutes(15), 60.0, 10.0, 80.0).into_points();
        assert_eq!(points.len(), 96);
        assert_eq!(
            MetricSource::sample_count(&range, Duration::minutes(15)),
            Some(96)
        );
        assert_eq!(points.first().unwrap().timestamp, range.start);
        assert!(points.last().unwrap().timestamp < range.end);
        assert!(points
            .windows(2)
            .all(|pair| pair[0].timestamp <= pair[1].timestamp));
    }

    #[test]
    fn test_that_partial_step_is_counted() {
        let range = TimeRange::new(
            datetime!(2024-01-01 00:00 UTC),
            datetime!(2024-01-01 00:20 UTC),
        );
        let points =
            MetricSource::random(&range, Duration::minutes(15), 60.0, 10.0, 80.0).into_points();
        assert_eq!(points.len(), 2);
        assert_eq!(
            MetricSource::sample_count(&range, Duration::minutes(15)),
            Some(2)
        );
        assert_eq!(MetricSource::sample_count(&range, Duration::ZERO), Some(0));
    }

    #[test]
    fn test_that_series_stops_at_the_last_representable_date() {
        let range = TimeRange::new(
            datetime!(9999-12-31 23:00 UTC),
            datetime!(9999-12-31 23:59:59 UTC),
        );
        let points =
            MetricSource::random(&range, Duration::minutes(15), 60.0, 10.0, 80.0).into_points();
        assert_eq!(points.len(), 4);
        assert_eq!(
            points.last().unwrap().timestamp,
            datetime!(9999-12-31 23:45 UTC)
        );
    }
}
