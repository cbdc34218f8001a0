mod common;

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use time::macros::datetime;

use backtesting::http::backtest::{RunOptions, RunRequest};
use backtesting::poller::{Observer, PollError, PollEvent, PollerState, TaskPoller};
use backtesting::types::{TaskStatus, TimeRange};
use common::{rule, ScriptedClient};

const PERIOD: Duration = Duration::from_secs(5);

fn request() -> RunRequest {
    RunRequest {
        rule_ids: vec!["r1".to_string()],
        time_range: TimeRange::new(
            datetime!(2024-01-01 00:00 UTC),
            datetime!(2024-01-02 00:00 UTC),
        ),
        actual_events: Vec::new(),
        options: RunOptions::default(),
    }
}

fn recorder() -> (Observer, Arc<Mutex<Vec<PollEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let observer: Observer = Arc::new(move |event| sink.lock().unwrap().push(event));
    (observer, events)
}

fn statuses(events: &Mutex<Vec<PollEvent>>) -> Vec<TaskStatus> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            PollEvent::Observed { result, .. } => Some(result.status),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_that_first_fetch_is_immediate_and_terminal_stops_polling() {
    let client = ScriptedClient::new(vec![rule("r1")], 3);
    let poller = TaskPoller::new(Arc::new(client.clone()), PERIOD);
    let (observer, events) = recorder();

    let handle = poller.submit(request(), observer).await.unwrap();
    assert_eq!(handle.status, TaskStatus::Pending);
    assert_eq!(poller.state(), PollerState::Polling);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(client.fetch_count(&handle.task_id), 1);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(client.fetch_count(&handle.task_id), 3);
    assert_eq!(
        statuses(&events),
        vec![TaskStatus::Running, TaskStatus::Running, TaskStatus::Completed]
    );
    assert_eq!(poller.state(), PollerState::Completed);
    assert_eq!(
        poller.active_handle().unwrap().status,
        TaskStatus::Completed
    );

    let first = events.lock().unwrap().first().cloned().unwrap();
    assert!(matches!(first, PollEvent::Submitted { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_that_submission_failure_creates_no_handle() {
    let client = ScriptedClient::new(vec![rule("r1")], 2);
    client.fail_submit(true);
    let poller = TaskPoller::new(Arc::new(client.clone()), PERIOD);
    let (observer, events) = recorder();

    let err = poller.submit(request(), observer).await.unwrap_err();
    assert!(matches!(err, PollError::Submission(_)));
    assert_eq!(poller.state(), PollerState::Failed);
    assert!(poller.active_handle().is_none());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(client.fetches().is_empty());
    assert!(events.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_that_fetch_failure_stops_polling() {
    let client = ScriptedClient::new(vec![rule("r1")], 10);
    client.fail_fetch(true);
    let poller = TaskPoller::new(Arc::new(client.clone()), PERIOD);
    let (observer, events) = recorder();

    let handle = poller.submit(request(), observer).await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(client.fetch_count(&handle.task_id), 1);
    assert_eq!(poller.state(), PollerState::Failed);
    let last = events.lock().unwrap().last().cloned().unwrap();
    match last {
        PollEvent::LostContact { handle: lost, message } => {
            assert_eq!(lost.task_id, handle.task_id);
            assert!(message.contains("Lost contact"));
        }
        other => panic!("expected lost contact, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_that_slow_fetches_never_overlap() {
    let client = ScriptedClient::new(vec![rule("r1")], 100);
    client.delay_fetch("task-1", Duration::from_secs(12));
    let poller = TaskPoller::new(Arc::new(client.clone()), PERIOD);
    let (observer, _events) = recorder();

    poller.submit(request(), observer).await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(client.max_in_flight(), 1);
    let fetched = client.fetch_count("task-1");
    assert!((3..=5).contains(&fetched), "fetched {fetched} times");
}

#[tokio::test(start_paused = true)]
async fn test_that_resubmission_cancels_previous_task() {
    let client = ScriptedClient::new(vec![rule("r1")], 100);
    client.delay_fetch("task-1", Duration::from_secs(10));
    let poller = TaskPoller::new(Arc::new(client.clone()), PERIOD);
    let (observer, events) = recorder();

    let first = poller.submit(request(), observer.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let second = poller.submit(request(), observer).await.unwrap();
    assert!(second.generation > first.generation);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(client.fetch_count(&first.task_id), 1);
    assert!(events
        .lock()
        .unwrap()
        .iter()
        .filter(|event| matches!(event, PollEvent::Observed { .. }))
        .all(|event| event.handle().generation == second.generation));
    assert_eq!(poller.active_handle().unwrap().task_id, second.task_id);
}

#[tokio::test(start_paused = true)]
async fn test_that_cancel_is_safe_from_observer_and_when_idle() {
    let client = ScriptedClient::new(vec![rule("r1")], 100);
    let poller = Arc::new(TaskPoller::new(Arc::new(client.clone()), PERIOD));
    assert_eq!(poller.cancel(), 0);
    assert_eq!(poller.state(), PollerState::Idle);

    let weak: Weak<TaskPoller<ScriptedClient>> = Arc::downgrade(&poller);
    let observer: Observer = Arc::new(move |event| {
        if let PollEvent::Observed { .. } = event {
            if let Some(poller) = weak.upgrade() {
                poller.cancel();
                poller.cancel();
            }
        }
    });

    let handle = poller.submit(request(), observer).await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(client.fetch_count(&handle.task_id), 1);
    assert_eq!(poller.state(), PollerState::Cancelled);
    assert!(poller.active_handle().is_none());
    assert_eq!(poller.cancel(), handle.generation);
}
