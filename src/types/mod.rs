//! Types shared by the orchestrator, the transport and the reference server.
//!
//! Everything here is a plain snapshot: values arrive over the wire, get replaced wholesale and
//! are never partially mutated by the client. Timestamps are UTC instants serialised as RFC 3339.
use derive_more::Display;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub type RuleId = String;
pub type TaskId = String;

/// Label given to reference events that were created without one.
pub const DEFAULT_EVENT_LABEL: &str = "Manual event";

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[display("critical")]
    Critical,
    #[display("warning")]
    Warning,
    #[display("info")]
    Info,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Rule {
    pub id: RuleId,
    pub name: String,
    pub condition_summary: String,
    pub severity: Severity,
    pub enabled: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Half-open interval `[start, end)`.
///
/// The constructor does not enforce `start < end` because ranges are edited by users and have to
/// be representable while invalid so that they can be rejected with a reason. Use
/// [TimeRange::checked] when an invalid range should never be built.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub struct TimeRange {
    #[serde(rename = "start_time", with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(rename = "end_time", with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
}

impl TimeRange {
    pub fn new(start: OffsetDateTime, end: OffsetDateTime) -> Self {
        Self { start, end }
    }

    pub fn checked(start: OffsetDateTime, end: OffsetDateTime) -> Option<Self> {
        if start < end {
            Some(Self { start, end })
        } else {
            None
        }
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    pub fn is_degenerate(&self) -> bool {
        self.start == self.end
    }

    pub fn duration(&self) -> time::Duration {
        self.end - self.start
    }

    pub fn contains(&self, instant: OffsetDateTime) -> bool {
        self.start <= instant && instant < self.end
    }
}

#[derive(Clone, Copy, Debug, Default, Display, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationStatus {
    #[default]
    #[display("pending")]
    Pending,
    #[display("confirmed")]
    Confirmed,
    #[display("dismissed")]
    Dismissed,
}

#[derive(Clone, Copy, Debug, Default, Display, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    #[display("true_positive")]
    TruePositive,
    #[display("false_positive")]
    FalsePositive,
    #[display("false_negative")]
    FalseNegative,
    #[default]
    #[display("unknown")]
    Unknown,
}

/// A user-asserted "this really happened here" marker.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(from = "WireEvent", into = "WireEvent")]
pub struct ReferenceEvent {
    pub id: Option<String>,
    pub label: String,
    pub range: TimeRange,
    pub notes: Option<String>,
    pub tags: Vec<String>,
    pub annotation_status: AnnotationStatus,
    pub match_status: Option<MatchStatus>,
    pub severity: Option<Severity>,
}

impl ReferenceEvent {
    pub fn new(label: impl Into<String>, range: TimeRange) -> Self {
        Self {
            id: None,
            label: normalise_label(label.into()),
            range,
            notes: None,
            tags: Vec::new(),
            annotation_status: AnnotationStatus::Pending,
            match_status: None,
            severity: None,
        }
        .with_generated_id()
    }

    /// Events that only have a start are zero width and rely on overlay padding to be visible.
    pub fn instant(label: impl Into<String>, at: OffsetDateTime) -> Self {
        Self::new(label, TimeRange::new(at, at))
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        let notes = notes.into();
        let trimmed = notes.trim();
        self.notes = if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        };
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.tags = tags
            .into_iter()
            .map(|tag| tag.as_ref().trim().to_string())
            .filter(|tag| !tag.is_empty())
            .collect();
        self
    }

    pub fn with_annotation(mut self, status: AnnotationStatus) -> Self {
        self.annotation_status = status;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// Assigns a local `manual-` id when the event has none, leaving existing ids untouched.
    pub fn with_generated_id(mut self) -> Self {
        if self.id.as_deref().map_or(true, str::is_empty) {
            let suffix: String = thread_rng()
                .sample_iter(&Alphanumeric)
                .take(6)
                .map(char::from)
                .collect();
            let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
            self.id = Some(format!("manual-{millis}-{}", suffix.to_lowercase()));
        }
        self
    }
}

fn normalise_label(label: String) -> String {
    let trimmed = label.trim();
    if trimmed.is_empty() {
        DEFAULT_EVENT_LABEL.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Wire shape of [ReferenceEvent]: `end_time` is optional and defaults to `start_time`. A missing
/// `annotation_status` is `confirmed` when the server matched the event and `pending` otherwise.
#[derive(Clone, Debug, Deserialize, Serialize)]
struct WireEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default)]
    label: String,
    #[serde(with = "time::serde::rfc3339")]
    start_time: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    end_time: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    notes: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    annotation_status: Option<AnnotationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    match_status: Option<MatchStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    severity: Option<Severity>,
}

impl From<WireEvent> for ReferenceEvent {
    fn from(value: WireEvent) -> Self {
        let end = value.end_time.unwrap_or(value.start_time);
        let annotation_status = value.annotation_status.unwrap_or(match value.match_status {
            Some(_) => AnnotationStatus::Confirmed,
            None => AnnotationStatus::Pending,
        });
        Self {
            id: value.id,
            label: normalise_label(value.label),
            range: TimeRange::new(value.start_time, end),
            notes: value.notes,
            tags: value.tags,
            annotation_status,
            match_status: value.match_status,
            severity: value.severity,
        }
    }
}

impl From<ReferenceEvent> for WireEvent {
    fn from(value: ReferenceEvent) -> Self {
        Self {
            id: value.id,
            label: value.label,
            start_time: value.range.start,
            end_time: Some(value.range.end),
            notes: value.notes,
            tags: value.tags,
            annotation_status: Some(value.annotation_status),
            match_status: value.match_status,
            severity: value.severity,
        }
    }
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[display("queued")]
    Queued,
    #[display("pending")]
    Pending,
    #[display("running")]
    Running,
    #[display("completed")]
    Completed,
    #[display("failed")]
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct MetricPoint {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TriggerPoint {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub value: f64,
    pub condition_summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_status: Option<MatchStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ground_truth_event_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detection_delay_seconds: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct RuleResult {
    pub rule_id: RuleId,
    #[serde(default)]
    pub rule_name: String,
    #[serde(default)]
    pub metric_series: Vec<MetricPoint>,
    #[serde(default)]
    pub trigger_points: Vec<TriggerPoint>,
    #[serde(default)]
    pub triggered_count: usize,
    #[serde(default)]
    pub actual_events: Vec<ReferenceEvent>,
    #[serde(default)]
    pub false_positive_count: usize,
    #[serde(default)]
    pub false_negative_count: usize,
    #[serde(default)]
    pub precision: Option<f64>,
    #[serde(default)]
    pub recall: Option<f64>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

/// Polled payload for one task. Replaced wholesale on every observation.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct SimulationResult {
    #[serde(default)]
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub rule_results: Vec<RuleResult>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub requested_at: Option<OffsetDateTime>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub completed_at: Option<OffsetDateTime>,
}

impl SimulationResult {
    /// First result for `rule_id`, falling back to the first result when unset or unmatched.
    pub fn rule_result(&self, rule_id: Option<&str>) -> Option<&RuleResult> {
        rule_id
            .and_then(|id| self.rule_results.iter().find(|rule| rule.rule_id == id))
            .or_else(|| self.rule_results.first())
    }
}
