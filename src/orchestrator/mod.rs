//! Composition root: owns the working selection, range and reference events, drives validation,
//! submission and polling, and publishes a [Snapshot] after every transition.
//!
//! The snapshot is the only thing a presentation layer needs to read. It is re-sent over a
//! [tokio::sync::watch] channel, so slow consumers only ever see the latest state.
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use log::{debug, info, warn};
use time::{Duration, OffsetDateTime};
use tokio::sync::watch;

use crate::align::{project, OverlayInterval, RuleStats};
use crate::config::OrchestratorConfig;
use crate::http::backtest::{Client, RuleFilters, RunOptions, RunRequest};
use crate::interval::QuickRange;
use crate::poller::{Observer, PollError, PollEvent, PollerState, TaskHandle, TaskPoller};
use crate::types::{
    AnnotationStatus, ReferenceEvent, Rule, RuleId, RuleResult, SimulationResult, TaskId,
    TaskStatus, TimeRange,
};
use crate::validate::{validate, ValidationError};

const REMOTE_FAILURE_FALLBACK: &str = "The backtesting simulation failed. Please try again later.";

/// Why the last attempt did not produce a usable result. Every variant leaves the orchestrator
/// ready for another [Orchestrator::run].
#[derive(Clone, Debug, PartialEq)]
pub enum SnapshotError {
    Validation(ValidationError),
    Submission(String),
    LostContact(String),
    Remote(String),
    /// The rule catalog could not be loaded.
    Catalog(String),
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::Validation(err) => write!(f, "{err}"),
            SnapshotError::Submission(message) => write!(f, "{message}"),
            SnapshotError::LostContact(message) => write!(f, "{message}"),
            SnapshotError::Remote(message) => write!(f, "{message}"),
            SnapshotError::Catalog(message) => write!(f, "Failed to load alert rules: {message}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RunError {
    Validation(ValidationError),
    Poll(PollError),
}

impl std::error::Error for RunError {}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::Validation(err) => write!(f, "{err}"),
            RunError::Poll(err) => write!(f, "{err}"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    pub phase: PollerState,
    pub task_id: Option<TaskId>,
    pub task_status: Option<TaskStatus>,
    pub result: Option<SimulationResult>,
    pub active_rule_result: Option<RuleResult>,
    pub events: Vec<ReferenceEvent>,
    pub overlays: Vec<OverlayInterval>,
    pub stats: Option<RuleStats>,
    pub error: Option<SnapshotError>,
}

struct Session {
    rules: Vec<Rule>,
    rule_id: Option<RuleId>,
    focus: Option<RuleId>,
    range: TimeRange,
    events: Vec<ReferenceEvent>,
    active: Option<TaskHandle>,
    latest_generation: u64,
    runs: u64,
    seeded: bool,
    min_overlay_duration: Duration,
    snapshot: Snapshot,
}

impl Session {
    fn new(range: TimeRange, min_overlay_duration: Duration) -> Self {
        Self {
            rules: Vec::new(),
            rule_id: None,
            focus: None,
            range,
            events: Vec::new(),
            active: None,
            latest_generation: 0,
            runs: 0,
            seeded: false,
            min_overlay_duration,
            snapshot: Snapshot::default(),
        }
    }

    /// Forgets the active task and refuses any handle up to `generation`, including one whose
    /// submission is still being reported.
    fn fence(&mut self, generation: u64) {
        self.active = None;
        self.latest_generation = self.latest_generation.max(generation);
    }

    fn clear_result(&mut self) {
        self.snapshot.task_id = None;
        self.snapshot.task_status = None;
        self.snapshot.result = None;
        self.snapshot.active_rule_result = None;
        self.snapshot.overlays.clear();
        self.snapshot.stats = None;
        self.snapshot.error = None;
    }

    fn refresh_active_rule(&mut self) {
        self.snapshot.active_rule_result = self
            .snapshot
            .result
            .as_ref()
            .and_then(|result| result.rule_result(self.focus.as_deref()))
            .cloned();
    }

    /// Seeds the working events from the server's echo, at most once per task and only into an
    /// empty list so that user edits are never overwritten.
    fn seed_events(&mut self) {
        if self.seeded || !self.events.is_empty() {
            return;
        }
        let Some(rule) = self.snapshot.active_rule_result.as_ref() else {
            return;
        };
        if rule.actual_events.is_empty() {
            return;
        }
        self.events = imported_events(rule);
        self.seeded = true;
        debug!("Seeded {} reference events from result", self.events.len());
    }

    fn refresh_projection(&mut self) {
        self.snapshot.events = self.events.clone();
        self.snapshot.overlays.clear();
        self.snapshot.stats = None;

        let Some(rule) = self.snapshot.active_rule_result.as_ref() else {
            return;
        };
        // A running task may not have any points yet.
        if let Ok(projection) = project(rule, &self.events, self.min_overlay_duration) {
            self.snapshot.overlays = projection.overlays;
            self.snapshot.stats = Some(projection.stats);
        }
    }

    fn is_active(&self, handle: &TaskHandle) -> bool {
        self.active
            .as_ref()
            .map_or(false, |active| active.generation == handle.generation)
    }

    /// Applies one poller event. Returns false when the event belongs to a superseded task.
    fn apply(&mut self, event: PollEvent) -> bool {
        match event {
            PollEvent::Submitted { handle } => {
                if handle.generation <= self.latest_generation {
                    return false;
                }
                self.latest_generation = handle.generation;
                self.seeded = false;
                self.snapshot.phase = PollerState::Polling;
                self.snapshot.task_id = Some(handle.task_id.clone());
                self.snapshot.task_status = Some(handle.status);
                self.active = Some(handle);
            }
            PollEvent::Observed { handle, result } => {
                if !self.is_active(&handle) {
                    debug!("Discarding stale result for task {}", handle.task_id);
                    return false;
                }
                self.snapshot.phase = match result.status {
                    TaskStatus::Completed => PollerState::Completed,
                    TaskStatus::Failed => PollerState::Failed,
                    _ => PollerState::Polling,
                };
                self.snapshot.task_status = Some(result.status);
                if result.status == TaskStatus::Failed {
                    let message = result
                        .message
                        .clone()
                        .filter(|message| !message.trim().is_empty())
                        .unwrap_or_else(|| REMOTE_FAILURE_FALLBACK.to_string());
                    self.snapshot.error = Some(SnapshotError::Remote(message));
                }
                self.snapshot.result = Some(result);
                self.active = Some(handle);
                self.refresh_active_rule();
                self.seed_events();
                self.refresh_projection();
            }
            PollEvent::LostContact { handle, message } => {
                if !self.is_active(&handle) {
                    return false;
                }
                self.snapshot.phase = PollerState::Failed;
                self.snapshot.error = Some(SnapshotError::LostContact(message));
            }
        }
        true
    }
}

fn imported_events(rule: &RuleResult) -> Vec<ReferenceEvent> {
    rule.actual_events
        .iter()
        .cloned()
        .map(ReferenceEvent::with_generated_id)
        .collect()
}

fn lock_session(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Orchestrator<C: Client> {
    client: Arc<C>,
    poller: TaskPoller<C>,
    options: RunOptions,
    session: Arc<Mutex<Session>>,
    snapshots: Arc<watch::Sender<Snapshot>>,
}

impl<C> Orchestrator<C>
where
    C: Client + Send + Sync + 'static,
{
    pub fn new(client: C, config: OrchestratorConfig) -> Self {
        let client = Arc::new(client);
        let range = QuickRange::LastWeek.ending_at(OffsetDateTime::now_utc());
        let (sender, _) = watch::channel(Snapshot::default());
        Self {
            poller: TaskPoller::new(client.clone(), config.poll_interval),
            client,
            options: config.options,
            session: Arc::new(Mutex::new(Session::new(range, config.min_overlay_duration))),
            snapshots: Arc::new(sender),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        lock_session(&self.session)
    }

    fn publish(&self, session: &Session) {
        self.snapshots.send_replace(session.snapshot.clone());
    }

    pub fn snapshot(&self) -> Snapshot {
        self.lock().snapshot.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.subscribe()
    }

    pub fn range(&self) -> TimeRange {
        self.lock().range
    }

    pub fn events(&self) -> Vec<ReferenceEvent> {
        self.lock().events.clone()
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.lock().rules.clone()
    }

    /// Loads the rule catalog the user picks from. A failure is also published in the snapshot
    /// and cleared by the next successful load.
    pub async fn load_rules(&self, filters: RuleFilters) -> Result<Vec<Rule>> {
        let loaded = self.client.list_rules(filters).await;
        let mut session = self.lock();
        match loaded {
            Ok(response) => {
                info!("Loaded {} of {} alert rules", response.items.len(), response.total);
                session.rules = response.items.clone();
                if let Some(SnapshotError::Catalog(_)) = session.snapshot.error {
                    session.snapshot.error = None;
                    self.publish(&session);
                }
                Ok(response.items)
            }
            Err(err) => {
                warn!("Failed to load alert rules: {err}");
                session.snapshot.error = Some(SnapshotError::Catalog(err.to_string()));
                self.publish(&session);
                Err(err)
            }
        }
    }

    /// Switches rule. Reference events were asserted against the previous rule, so they are
    /// dropped, and any task for the previous rule stops being observed.
    pub fn select_rule(&self, rule_id: impl Into<RuleId>) {
        let generation = self.poller.cancel();
        let rule_id = rule_id.into();
        let mut session = self.lock();
        if session.snapshot.phase.is_active() {
            session.snapshot.phase = PollerState::Cancelled;
        }
        session.fence(generation);
        if session.rule_id.as_ref() != Some(&rule_id) {
            session.clear_result();
        }
        session.focus = Some(rule_id.clone());
        session.rule_id = Some(rule_id);
        session.events.clear();
        session.refresh_active_rule();
        session.refresh_projection();
        self.publish(&session);
    }

    /// Chooses which rule of a multi-rule result is shown.
    pub fn focus_rule(&self, rule_id: impl Into<RuleId>) {
        let mut session = self.lock();
        session.focus = Some(rule_id.into());
        session.refresh_active_rule();
        session.refresh_projection();
        self.publish(&session);
    }

    pub fn set_range(&self, range: TimeRange) {
        let mut session = self.lock();
        session.range = range;
        self.publish(&session);
    }

    pub fn set_quick_range(&self, quick: QuickRange) {
        self.set_range(quick.ending_at(OffsetDateTime::now_utc()));
    }

    pub fn add_event(&self, event: ReferenceEvent) {
        let mut session = self.lock();
        session.events.push(event.with_generated_id());
        session.refresh_projection();
        self.publish(&session);
    }

    pub fn remove_event(&self, index: usize) -> Option<ReferenceEvent> {
        let mut session = self.lock();
        if index >= session.events.len() {
            return None;
        }
        let removed = session.events.remove(index);
        session.refresh_projection();
        self.publish(&session);
        Some(removed)
    }

    /// Edits the event at `index`. The event keeps its id, and keeps its match status and
    /// severity unless the edit sets them. An edit that ends before it starts is refused.
    pub fn update_event(&self, index: usize, event: ReferenceEvent) -> bool {
        if event.range.end < event.range.start {
            return false;
        }
        let mut session = self.lock();
        let Some(slot) = session.events.get_mut(index) else {
            return false;
        };
        let previous = std::mem::replace(slot, event);
        slot.id = previous.id;
        slot.match_status = slot.match_status.or(previous.match_status);
        slot.severity = slot.severity.or(previous.severity);
        session.refresh_projection();
        self.publish(&session);
        true
    }

    pub fn update_annotation(&self, index: usize, status: AnnotationStatus) -> bool {
        let mut session = self.lock();
        let Some(event) = session.events.get_mut(index) else {
            return false;
        };
        event.annotation_status = status;
        session.refresh_projection();
        self.publish(&session);
        true
    }

    /// Replaces the working events with the ones the active result echoed back. Returns how many
    /// were imported; zero leaves the working list untouched.
    pub fn import_events_from_result(&self) -> usize {
        let mut session = self.lock();
        let imported = match session.snapshot.active_rule_result.as_ref() {
            Some(rule) if !rule.actual_events.is_empty() => imported_events(rule),
            _ => return 0,
        };
        let count = imported.len();
        session.events = imported;
        session.refresh_projection();
        self.publish(&session);
        count
    }

    fn observer(&self) -> Observer {
        let session = self.session.clone();
        let snapshots = self.snapshots.clone();
        Arc::new(move |event: PollEvent| {
            let mut session = lock_session(&session);
            if session.apply(event) {
                snapshots.send_replace(session.snapshot.clone());
            }
        })
    }

    /// Validates the current selection and, if it passes, submits it and starts polling.
    ///
    /// Validation failures are published in the snapshot without any network activity.
    pub async fn run(&self) -> Result<TaskHandle, RunError> {
        let (request, run) = {
            let mut session = self.lock();
            let rule_id = session.rule_id.clone().unwrap_or_default();
            if let Err(err) = validate(&rule_id, &session.range, &session.events) {
                warn!("Rejected backtesting run: {err}");
                session.snapshot.error = Some(SnapshotError::Validation(err.clone()));
                self.publish(&session);
                return Err(RunError::Validation(err));
            }

            session.runs += 1;
            session.active = None;
            session.clear_result();
            session.snapshot.phase = PollerState::Submitting;
            self.publish(&session);

            let request = RunRequest {
                rule_ids: vec![rule_id],
                time_range: session.range,
                actual_events: session.events.clone(),
                options: self.options.clone(),
            };
            (request, session.runs)
        };

        match self.poller.submit(request, self.observer()).await {
            Ok(handle) => Ok(handle),
            Err(err) => {
                let mut session = self.lock();
                if session.runs == run {
                    if let PollError::Submission(_) = &err {
                        session.snapshot.phase = PollerState::Failed;
                        session.snapshot.error = Some(SnapshotError::Submission(err.to_string()));
                    } else if session.snapshot.phase == PollerState::Submitting {
                        session.snapshot.phase = PollerState::Cancelled;
                    }
                    self.publish(&session);
                }
                Err(RunError::Poll(err))
            }
        }
    }

    /// Stops background polling. The orchestrator stays usable; a later [Orchestrator::run]
    /// starts a fresh task.
    pub fn dispose(&self) {
        let generation = self.poller.cancel();
        let mut session = self.lock();
        session.fence(generation);
        if session.snapshot.phase.is_active() {
            session.snapshot.phase = PollerState::Cancelled;
            self.publish(&session);
        }
    }
}
