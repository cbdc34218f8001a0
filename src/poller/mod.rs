//! Lifecycle of the one remote task the client is observing.
//!
//! ```text
//! Idle -> Submitting -> Polling -> Completed | Failed
//!            \             \
//!             +-------------+--> Cancelled
//! ```
//!
//! Submitting again cancels whatever is active, so at most one task is observed. Cancellation
//! only stops observation: the server is never told and may keep running the task.
//!
//! Every [PollEvent] carries the [TaskHandle] it belongs to. The poller stops delivering events
//! for a handle once it is cancelled, but a response can already be in the hands of the observer
//! when that happens, so consumers still compare the handle's generation with the one they
//! consider active.
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::http::backtest::{Client, RunRequest};
use crate::types::{SimulationResult, TaskId, TaskStatus};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PollerState {
    #[default]
    Idle,
    Submitting,
    Polling,
    Completed,
    Failed,
    Cancelled,
}

impl PollerState {
    pub fn is_active(&self) -> bool {
        matches!(self, PollerState::Submitting | PollerState::Polling)
    }
}

/// Remote task as seen by this client. `generation` increases with every submission and is what
/// distinguishes a fresh handle from a superseded one.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaskHandle {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub generation: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PollEvent {
    /// The server accepted the task. Always delivered before any observation of it.
    Submitted { handle: TaskHandle },
    Observed {
        handle: TaskHandle,
        result: SimulationResult,
    },
    /// A status fetch failed after the task had started. Polling has stopped.
    LostContact { handle: TaskHandle, message: String },
}

impl PollEvent {
    pub fn handle(&self) -> &TaskHandle {
        match self {
            PollEvent::Submitted { handle } => handle,
            PollEvent::Observed { handle, .. } => handle,
            PollEvent::LostContact { handle, .. } => handle,
        }
    }
}

pub type Observer = Arc<dyn Fn(PollEvent) + Send + Sync>;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PollError {
    /// The task never started.
    Submission(String),
    /// Another submission or a cancel arrived while this one was in flight.
    Superseded,
}

impl std::error::Error for PollError {}

impl fmt::Display for PollError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollError::Submission(reason) => {
                write!(f, "Failed to submit the backtesting task: {reason}")
            }
            PollError::Superseded => write!(f, "Submission superseded by a newer request"),
        }
    }
}

struct ActiveTask {
    generation: u64,
    handle: Option<TaskHandle>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct PollerInner {
    state: PollerState,
    generation: u64,
    active: Option<ActiveTask>,
}

impl PollerInner {
    fn cancel_active(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            if self.state.is_active() {
                debug!("Cancelled task generation {}", active.generation);
                self.state = PollerState::Cancelled;
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.active.as_ref().map_or(false, |active| {
            active.generation == generation && !active.cancel.is_cancelled()
        })
    }
}

pub struct TaskPoller<C: Client> {
    client: Arc<C>,
    period: Duration,
    inner: Arc<Mutex<PollerInner>>,
}

impl<C> TaskPoller<C>
where
    C: Client + Send + Sync + 'static,
{
    pub fn new(client: Arc<C>, period: Duration) -> Self {
        Self {
            client,
            period: period.max(Duration::from_millis(1)),
            inner: Arc::new(Mutex::new(PollerInner::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PollerInner> {
        lock_inner(&self.inner)
    }

    pub fn state(&self) -> PollerState {
        self.lock().state
    }

    pub fn active_handle(&self) -> Option<TaskHandle> {
        self.lock()
            .active
            .as_ref()
            .and_then(|active| active.handle.clone())
    }

    /// Starts a task and begins polling it, replacing any task already being observed.
    ///
    /// The first status fetch happens straight away on the polling task, then once per period.
    pub async fn submit(
        &self,
        request: RunRequest,
        observer: Observer,
    ) -> Result<TaskHandle, PollError> {
        let (generation, cancel) = {
            let mut inner = self.lock();
            inner.cancel_active();
            inner.generation += 1;
            let generation = inner.generation;
            let cancel = CancellationToken::new();
            inner.active = Some(ActiveTask {
                generation,
                handle: None,
                cancel: cancel.clone(),
            });
            inner.state = PollerState::Submitting;
            (generation, cancel)
        };

        let submitted = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PollError::Superseded),
            submitted = self.client.submit(request) => submitted,
        };

        let mut inner = self.lock();
        if !inner.is_current(generation) {
            return Err(PollError::Superseded);
        }

        let response = match submitted {
            Ok(response) => response,
            Err(err) => {
                warn!("Backtesting submission failed: {err}");
                inner.state = PollerState::Failed;
                inner.active = None;
                return Err(PollError::Submission(err.to_string()));
            }
        };

        let handle = TaskHandle {
            task_id: response.task_id,
            status: response.status,
            generation,
        };
        info!(
            "Submitted backtesting task {} ({})",
            handle.task_id, handle.status
        );
        if let Some(active) = inner.active.as_mut() {
            active.handle = Some(handle.clone());
        }
        inner.state = PollerState::Polling;
        drop(inner);

        observer(PollEvent::Submitted {
            handle: handle.clone(),
        });

        tokio::spawn(poll_loop(
            self.client.clone(),
            handle.clone(),
            cancel,
            self.period,
            self.inner.clone(),
            observer,
        ));
        Ok(handle)
    }

    /// Stops observing the active task. Safe to call at any time, including from an observer.
    ///
    /// Returns the newest generation handed out so far. No handle at or below it is observed
    /// after this returns, although a [PollEvent::Submitted] for it may still be in flight.
    pub fn cancel(&self) -> u64 {
        let mut inner = self.lock();
        inner.cancel_active();
        inner.generation
    }
}

impl<C: Client> Drop for TaskPoller<C> {
    fn drop(&mut self) {
        lock_inner(&self.inner).cancel_active();
    }
}

fn lock_inner(inner: &Mutex<PollerInner>) -> MutexGuard<'_, PollerInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Records a fetch outcome for `generation`. Returns false when the handle is no longer the one
/// being observed, in which case nothing must be delivered.
fn record(inner: &Mutex<PollerInner>, generation: u64, status: Option<TaskStatus>) -> bool {
    let mut inner = lock_inner(inner);
    if !inner.is_current(generation) {
        return false;
    }
    match status {
        Some(status) => {
            if let Some(handle) = inner.active.as_mut().and_then(|active| active.handle.as_mut()) {
                handle.status = status;
            }
            inner.state = match status {
                TaskStatus::Completed => PollerState::Completed,
                TaskStatus::Failed => PollerState::Failed,
                _ => PollerState::Polling,
            };
        }
        None => inner.state = PollerState::Failed,
    }
    true
}

async fn poll_loop<C>(
    client: Arc<C>,
    handle: TaskHandle,
    cancel: CancellationToken,
    period: Duration,
    inner: Arc<Mutex<PollerInner>>,
    observer: Observer,
) where
    C: Client + Send + Sync + 'static,
{
    // A fetch that outlasts the period delays the next tick instead of stacking requests.
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            fetched = client.fetch_result(handle.task_id.clone()) => fetched,
        };

        match fetched {
            Ok(result) => {
                let status = result.status;
                if !record(&inner, handle.generation, Some(status)) {
                    break;
                }
                debug!("Task {} is {status}", handle.task_id);
                observer(PollEvent::Observed {
                    handle: TaskHandle {
                        status,
                        ..handle.clone()
                    },
                    result,
                });
                if status.is_terminal() {
                    break;
                }
            }
            Err(err) => {
                if !record(&inner, handle.generation, None) {
                    break;
                }
                warn!("Stopped polling task {}: {err}", handle.task_id);
                observer(PollEvent::LostContact {
                    handle: handle.clone(),
                    message: format!(
                        "Lost contact with backtesting task {} and stopped polling: {err}",
                        handle.task_id
                    ),
                });
                break;
            }
        }
    }
    debug!("Polling loop for task {} finished", handle.task_id);
}
