//! Projects a rule result and the working reference events into what a chart needs: overlay
//! intervals clamped to the plotted metric domain and summary statistics.
//!
//! Everything is recomputed from scratch on each call; nothing here holds state between results.
use derive_more::{Display, Error};
use log::warn;
use time::Duration;

use crate::interval::clamp;
use crate::types::{AnnotationStatus, MatchStatus, MetricPoint, ReferenceEvent, RuleResult, TimeRange};

/// Narrowest overlay drawn for an event, so instants still show up as a sliver.
pub const DEFAULT_MIN_OVERLAY_DURATION: Duration = Duration::minutes(5);

#[derive(Clone, Copy, Debug, Display, Error, Eq, PartialEq)]
pub enum AlignError {
    #[display("metric series is empty")]
    EmptySeries,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OverlayInterval {
    pub label: String,
    pub event_id: Option<String>,
    /// Clamped range, safe to draw.
    pub range: TimeRange,
    /// Range as entered by the user.
    pub original: TimeRange,
    pub annotation_status: AnnotationStatus,
    pub match_status: Option<MatchStatus>,
}

/// Server reported a trigger count that disagrees with the trigger points it sent.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CountSkew {
    pub reported: usize,
    pub observed: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RuleStats {
    pub point_count: usize,
    pub trigger_count: usize,
    pub trigger_rate: f64,
    pub skew: Option<CountSkew>,
    pub false_positive_rate: f64,
    pub false_negative_rate: f64,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Projection {
    pub bounds: TimeRange,
    pub overlays: Vec<OverlayInterval>,
    pub stats: RuleStats,
}

pub fn compute_bounds(points: &[MetricPoint]) -> Result<TimeRange, AlignError> {
    match (points.first(), points.last()) {
        (Some(first), Some(last)) => Ok(TimeRange::new(first.timestamp, last.timestamp)),
        _ => Err(AlignError::EmptySeries),
    }
}

pub fn align_events(
    events: &[ReferenceEvent],
    bounds: &TimeRange,
    min_duration: Duration,
) -> Vec<OverlayInterval> {
    events
        .iter()
        .filter_map(|event| {
            let range = clamp(&event.range, bounds, min_duration)?;
            Some(OverlayInterval {
                label: event.label.clone(),
                event_id: event.id.clone(),
                range,
                original: event.range,
                annotation_status: event.annotation_status,
                match_status: event.match_status,
            })
        })
        .collect()
}

/// The server's `triggered_count` is authoritative. A mismatch with the trigger points is
/// reported in [RuleStats::skew] and logged rather than corrected.
pub fn compute_stats(result: &RuleResult) -> RuleStats {
    let point_count = result.metric_series.len();
    let trigger_count = result.triggered_count;
    let observed = result.trigger_points.len();

    let skew = if observed != trigger_count {
        warn!(
            "Rule {} reported {trigger_count} triggers but sent {observed} trigger points",
            result.rule_id
        );
        Some(CountSkew {
            reported: trigger_count,
            observed,
        })
    } else {
        None
    };

    RuleStats {
        point_count,
        trigger_count,
        trigger_rate: ratio(trigger_count, point_count),
        skew,
        false_positive_rate: ratio(result.false_positive_count, trigger_count),
        false_negative_rate: ratio(result.false_negative_count, result.actual_events.len()),
        precision: result.precision,
        recall: result.recall,
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

pub fn project(
    result: &RuleResult,
    events: &[ReferenceEvent],
    min_duration: Duration,
) -> Result<Projection, AlignError> {
    let bounds = compute_bounds(&result.metric_series)?;
    Ok(Projection {
        bounds,
        overlays: align_events(events, &bounds, min_duration),
        stats: compute_stats(result),
    })
}
