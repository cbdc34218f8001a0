use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use anyhow::Result;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::input::metrics::MetricSource;
use crate::types::{
    MatchStatus, ReferenceEvent, Rule, RuleId, RuleResult, Severity, SimulationResult, TaskId,
    TaskStatus, TimeRange, TriggerPoint,
};

/// Number of result fetches a task answers with `running` before it completes.
pub const DEFAULT_POLLS_UNTIL_COMPLETE: u32 = 2;

const RUNNING_MESSAGE: &str = "Backtesting task is running. Results will be available shortly.";
const METRIC_MEAN: f64 = 60.0;
const METRIC_STD_DEV: f64 = 12.0;
/// Largest series the reference server will synthesise for one rule.
pub const MAX_SERIES_POINTS: u64 = 1_000_000;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    Strict,
    #[default]
    Balanced,
    Lenient,
}

impl Sensitivity {
    fn threshold_offset(&self) -> f64 {
        match self {
            Sensitivity::Strict => 5.0,
            Sensitivity::Balanced => 0.0,
            Sensitivity::Lenient => -5.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct RunOptions {
    pub evaluation_window_minutes: u32,
    pub sensitivity: Sensitivity,
    pub include_recommendations: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            evaluation_window_minutes: 15,
            sensitivity: Sensitivity::Balanced,
            include_recommendations: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct RunRequest {
    pub rule_ids: Vec<RuleId>,
    pub time_range: TimeRange,
    #[serde(default)]
    pub actual_events: Vec<ReferenceEvent>,
    #[serde(default)]
    pub options: RunOptions,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct RunResponse {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub submitted_at: OffsetDateTime,
    pub rule_count: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RuleFilters {
    pub page: usize,
    pub page_size: usize,
    pub include_disabled: bool,
}

impl Default for RuleFilters {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 100,
            include_disabled: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ListRulesResponse {
    pub items: Vec<Rule>,
    pub total: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum BacktestError {
    UnknownTask,
    UnknownRule(RuleId),
    InvalidRequest(String),
    Unavailable,
}

impl std::error::Error for BacktestError {}

impl core::fmt::Display for BacktestError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            BacktestError::UnknownTask => write!(f, "Backtesting task not found"),
            BacktestError::UnknownRule(id) => write!(f, "Unknown alert rule: {id}"),
            BacktestError::InvalidRequest(reason) => write!(f, "Invalid request: {reason}"),
            BacktestError::Unavailable => write!(f, "Backtesting state unavailable"),
        }
    }
}

impl actix_web::ResponseError for BacktestError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        match self {
            BacktestError::UnknownTask => actix_web::http::StatusCode::NOT_FOUND,
            BacktestError::UnknownRule(_) => actix_web::http::StatusCode::BAD_REQUEST,
            BacktestError::InvalidRequest(_) => actix_web::http::StatusCode::BAD_REQUEST,
            BacktestError::Unavailable => actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Transport used by the orchestrator. Futures are `Send` so that polling can run on a spawned
/// task.
pub trait Client {
    fn submit(&self, request: RunRequest) -> impl Future<Output = Result<RunResponse>> + Send;
    fn fetch_result(&self, task_id: TaskId)
        -> impl Future<Output = Result<SimulationResult>> + Send;
    fn list_rules(
        &self,
        filters: RuleFilters,
    ) -> impl Future<Output = Result<ListRulesResponse>> + Send;
}

pub struct TaskState {
    pub task_id: TaskId,
    pub request: RunRequest,
    pub requested_at: OffsetDateTime,
    pub polls: u32,
    pub result: Option<SimulationResult>,
}

/// In-memory evaluation backend. Tasks complete after `polls_until_complete` fetches, evaluating
/// each requested rule against a synthetic metric series.
pub struct AppState {
    pub rules: Vec<Rule>,
    pub tasks: HashMap<TaskId, TaskState>,
    pub last: u64,
    pub polls_until_complete: u32,
}

impl AppState {
    pub fn create(rules: &mut Vec<Rule>, polls_until_complete: u32) -> Self {
        Self {
            rules: std::mem::take(rules),
            tasks: HashMap::new(),
            last: 0,
            polls_until_complete,
        }
    }

    pub fn single(rule: Rule) -> Self {
        Self::create(&mut vec![rule], DEFAULT_POLLS_UNTIL_COMPLETE)
    }

    /// Small catalog covering every severity, used by the server binary.
    pub fn demo(now: OffsetDateTime) -> Self {
        let mut rules = vec![
            Rule {
                id: "rule-001".to_string(),
                name: "CPU usage too high".to_string(),
                condition_summary: "cpu_usage > 80% for 5m".to_string(),
                severity: Severity::Critical,
                enabled: true,
                updated_at: now,
            },
            Rule {
                id: "rule-002".to_string(),
                name: "Memory pressure".to_string(),
                condition_summary: "memory_usage > 85% for 10m".to_string(),
                severity: Severity::Warning,
                enabled: true,
                updated_at: now,
            },
            Rule {
                id: "rule-003".to_string(),
                name: "Disk latency drift".to_string(),
                condition_summary: "disk_latency_p95 > 40ms".to_string(),
                severity: Severity::Info,
                enabled: false,
                updated_at: now,
            },
        ];
        Self::create(&mut rules, DEFAULT_POLLS_UNTIL_COMPLETE)
    }

    pub fn remove_rule(&mut self, rule_id: &str) -> Option<Rule> {
        let pos = self.rules.iter().position(|rule| rule.id == rule_id)?;
        Some(self.rules.remove(pos))
    }

    pub fn list_rules(&self, filters: &RuleFilters) -> ListRulesResponse {
        let visible: Vec<&Rule> = self
            .rules
            .iter()
            .filter(|rule| filters.include_disabled || rule.enabled)
            .collect();
        let page_size = filters.page_size.max(1);
        let skip = filters.page.saturating_sub(1).saturating_mul(page_size);
        ListRulesResponse {
            total: visible.len(),
            items: visible
                .into_iter()
                .skip(skip)
                .take(page_size)
                .cloned()
                .collect(),
        }
    }

    pub fn run(
        &mut self,
        request: RunRequest,
        now: OffsetDateTime,
    ) -> Result<RunResponse, BacktestError> {
        if request.rule_ids.is_empty() {
            return Err(BacktestError::InvalidRequest(
                "at least one rule id is required".to_string(),
            ));
        }
        if !request.time_range.is_valid() {
            return Err(BacktestError::InvalidRequest(
                "start_time must be before end_time".to_string(),
            ));
        }
        let step = evaluation_step(&request.options);
        match MetricSource::sample_count(&request.time_range, step) {
            Some(count) if count <= MAX_SERIES_POINTS => {}
            _ => {
                return Err(BacktestError::InvalidRequest(format!(
                    "time range needs more than {MAX_SERIES_POINTS} points at a {} minute window",
                    request.options.evaluation_window_minutes.max(1)
                )));
            }
        }
        if let Some(missing) = request
            .rule_ids
            .iter()
            .find(|id| !self.rules.iter().any(|rule| &rule.id == *id))
        {
            return Err(BacktestError::UnknownRule(missing.clone()));
        }

        self.last += 1;
        let task_id = format!("task-{}", self.last);
        let rule_count = request.rule_ids.len();
        info!("Created backtesting task {task_id} for {rule_count} rule(s)");

        self.tasks.insert(
            task_id.clone(),
            TaskState {
                task_id: task_id.clone(),
                request,
                requested_at: now,
                polls: 0,
                result: None,
            },
        );

        Ok(RunResponse {
            task_id,
            status: TaskStatus::Pending,
            submitted_at: now,
            rule_count,
        })
    }

    pub fn results(&mut self, task_id: &str, now: OffsetDateTime) -> Option<SimulationResult> {
        let polls_until_complete = self.polls_until_complete;
        let rules = &self.rules;
        let task = self.tasks.get_mut(task_id)?;

        if let Some(result) = &task.result {
            return Some(result.clone());
        }

        task.polls += 1;
        if task.polls < polls_until_complete {
            debug!("Task {task_id} still running after {} poll(s)", task.polls);
            return Some(SimulationResult {
                task_id: task.task_id.clone(),
                status: TaskStatus::Running,
                message: Some(RUNNING_MESSAGE.to_string()),
                rule_results: Vec::new(),
                requested_at: Some(task.requested_at),
                completed_at: None,
            });
        }

        let mut rule_results = Vec::with_capacity(task.request.rule_ids.len());
        let mut failure = None;
        for rule_id in &task.request.rule_ids {
            match rules.iter().find(|rule| &rule.id == rule_id) {
                Some(rule) => rule_results.push(evaluate(rule, &task.request)),
                None => {
                    failure = Some(format!("Rule {rule_id} is no longer available"));
                    break;
                }
            }
        }

        let result = match failure {
            Some(message) => SimulationResult {
                task_id: task.task_id.clone(),
                status: TaskStatus::Failed,
                message: Some(message),
                rule_results: Vec::new(),
                requested_at: Some(task.requested_at),
                completed_at: Some(now),
            },
            None => SimulationResult {
                task_id: task.task_id.clone(),
                status: TaskStatus::Completed,
                message: None,
                rule_results,
                requested_at: Some(task.requested_at),
                completed_at: Some(now),
            },
        };
        info!("Task {task_id} finished with status {}", result.status);
        task.result = Some(result.clone());
        Some(result)
    }
}

fn evaluation_step(options: &RunOptions) -> Duration {
    Duration::minutes(i64::from(options.evaluation_window_minutes.max(1)))
}

/// Replays `rule` over a synthetic series. A trigger inside a reference event (allowing one
/// evaluation window of detection delay) is a true positive.
fn evaluate(rule: &Rule, request: &RunRequest) -> RuleResult {
    let options = &request.options;
    let step = evaluation_step(options);
    let threshold = 80.0 + options.sensitivity.threshold_offset();
    let series = MetricSource::random(
        &request.time_range,
        step,
        METRIC_MEAN,
        METRIC_STD_DEV,
        threshold,
    )
    .into_points();

    let mut detected = vec![false; request.actual_events.len()];
    let mut trigger_points = Vec::new();
    for point in series.iter().filter(|point| point.value > threshold) {
        let matched = request.actual_events.iter().position(|event| {
            event.range.start <= point.timestamp
                && event
                    .range
                    .end
                    .checked_add(step)
                    .map_or(true, |end| point.timestamp <= end)
        });
        let trigger = match matched {
            Some(pos) => {
                detected[pos] = true;
                let event = &request.actual_events[pos];
                TriggerPoint {
                    timestamp: point.timestamp,
                    value: point.value,
                    condition_summary: rule.condition_summary.clone(),
                    match_status: Some(MatchStatus::TruePositive),
                    ground_truth_event_label: Some(event.label.clone()),
                    detection_delay_seconds: Some(
                        (point.timestamp - event.range.start).whole_seconds(),
                    ),
                }
            }
            None => TriggerPoint {
                timestamp: point.timestamp,
                value: point.value,
                condition_summary: rule.condition_summary.clone(),
                match_status: Some(MatchStatus::FalsePositive),
                ground_truth_event_label: None,
                detection_delay_seconds: None,
            },
        };
        trigger_points.push(trigger);
    }

    let actual_events: Vec<ReferenceEvent> = request
        .actual_events
        .iter()
        .zip(&detected)
        .map(|(event, hit)| {
            let mut echoed = event.clone();
            echoed.match_status = Some(if *hit {
                MatchStatus::TruePositive
            } else {
                MatchStatus::FalseNegative
            });
            echoed
        })
        .collect();

    let true_positive_count = trigger_points
        .iter()
        .filter(|point| point.match_status == Some(MatchStatus::TruePositive))
        .count();
    let false_positive_count = trigger_points.len() - true_positive_count;
    let detected_count = detected.iter().filter(|hit| **hit).count();
    let false_negative_count = detected.len() - detected_count;

    let precision = (!trigger_points.is_empty())
        .then(|| true_positive_count as f64 / trigger_points.len() as f64);
    let recall = (!detected.is_empty()).then(|| detected_count as f64 / detected.len() as f64);

    let mut recommendations = Vec::new();
    if options.include_recommendations {
        if false_positive_count > true_positive_count {
            recommendations.push(format!(
                "{false_positive_count} trigger(s) fell outside reference events: consider raising the threshold or lengthening the evaluation window"
            ));
        }
        if false_negative_count > 0 {
            recommendations.push(format!(
                "{false_negative_count} reference event(s) were missed: consider lowering the threshold or a more lenient sensitivity"
            ));
        }
    }

    RuleResult {
        rule_id: rule.id.clone(),
        rule_name: rule.name.clone(),
        triggered_count: trigger_points.len(),
        metric_series: series,
        trigger_points,
        actual_events,
        false_positive_count,
        false_negative_count,
        precision,
        recall,
        recommendations,
    }
}

type BacktestState = Mutex<AppState>;

pub mod server {
    use actix_web::{get, post, web};
    use time::OffsetDateTime;

    use super::{
        BacktestError, BacktestState, ListRulesResponse, RuleFilters, RunRequest, RunResponse,
    };
    use crate::types::{SimulationResult, TaskId};

    #[post("/backtesting/run")]
    pub async fn run(
        app: web::Data<BacktestState>,
        request: web::Json<RunRequest>,
    ) -> Result<web::Json<RunResponse>, BacktestError> {
        let mut state = app.lock().map_err(|_| BacktestError::Unavailable)?;
        let response = state.run(request.into_inner(), OffsetDateTime::now_utc())?;
        Ok(web::Json(response))
    }

    #[get("/backtesting/results/{task_id}")]
    pub async fn results(
        app: web::Data<BacktestState>,
        path: web::Path<(TaskId,)>,
    ) -> Result<web::Json<SimulationResult>, BacktestError> {
        let mut state = app.lock().map_err(|_| BacktestError::Unavailable)?;
        let (task_id,) = path.into_inner();

        if let Some(result) = state.results(&task_id, OffsetDateTime::now_utc()) {
            Ok(web::Json(result))
        } else {
            Err(BacktestError::UnknownTask)
        }
    }

    #[get("/alert-rules")]
    pub async fn alert_rules(
        app: web::Data<BacktestState>,
        filters: web::Query<RuleFilters>,
    ) -> Result<web::Json<ListRulesResponse>, BacktestError> {
        let state = app.lock().map_err(|_| BacktestError::Unavailable)?;
        Ok(web::Json(state.list_rules(&filters)))
    }
}
