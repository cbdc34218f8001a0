//! Gate run before any network activity for a submission.
use std::fmt;

use crate::types::{ReferenceEvent, TimeRange};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ValidationError {
    NoRuleSelected,
    InvalidRange,
    EventOutOfRange { index: usize, label: String },
}

impl std::error::Error for ValidationError {}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::NoRuleSelected => write!(f, "Select an alert rule before running"),
            ValidationError::InvalidRange => {
                write!(f, "The start of the range must be before its end")
            }
            ValidationError::EventOutOfRange { index, label } => write!(
                f,
                "Reference event {index} ({label}) must fall inside the simulation range"
            ),
        }
    }
}

/// Checks that a run can be submitted.
///
/// Events only need to overlap the range: an event that ends before `range.start` or starts after
/// `range.end` is rejected, one that straddles an edge is accepted and clamped later.
pub fn validate(
    rule_id: &str,
    range: &TimeRange,
    events: &[ReferenceEvent],
) -> Result<(), ValidationError> {
    if rule_id.trim().is_empty() {
        return Err(ValidationError::NoRuleSelected);
    }
    if range.start >= range.end {
        return Err(ValidationError::InvalidRange);
    }

    let out_of_range = events.iter().position(|event| {
        event.range.end < event.range.start
            || event.range.end < range.start
            || event.range.start > range.end
    });
    if let Some(index) = out_of_range {
        return Err(ValidationError::EventOutOfRange {
            index,
            label: events[index].label.clone(),
        });
    }
    Ok(())
}
