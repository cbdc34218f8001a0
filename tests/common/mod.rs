#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use time::macros::datetime;
use time::OffsetDateTime;

use backtesting::http::backtest::{
    AppState, Client, ListRulesResponse, RuleFilters, RunRequest, RunResponse,
};
use backtesting::types::{Rule, Severity, SimulationResult, TaskId};

pub fn rule(id: &str) -> Rule {
    Rule {
        id: id.to_string(),
        name: format!("Rule {id}"),
        condition_summary: "cpu_usage > 80%".to_string(),
        severity: Severity::Warning,
        enabled: true,
        updated_at: datetime!(2024-01-01 00:00 UTC),
    }
}

#[derive(Default)]
struct Script {
    fail_submit: AtomicBool,
    fail_fetch: AtomicBool,
    fail_list: AtomicBool,
    strip_series: AtomicBool,
    fetch_delays: Mutex<HashMap<TaskId, Duration>>,
    fetches: Mutex<Vec<TaskId>>,
    submits: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Reference backend wrapped with knobs for transport failures and slow responses. Clones share
/// the backend so that a test can keep one after handing another to the orchestrator.
#[derive(Clone)]
pub struct ScriptedClient {
    state: Arc<Mutex<AppState>>,
    script: Arc<Script>,
}

impl ScriptedClient {
    pub fn new(rules: Vec<Rule>, polls_until_complete: u32) -> Self {
        let mut rules = rules;
        Self {
            state: Arc::new(Mutex::new(AppState::create(
                &mut rules,
                polls_until_complete,
            ))),
            script: Arc::new(Script::default()),
        }
    }

    pub fn fail_submit(&self, fail: bool) {
        self.script.fail_submit.store(fail, Ordering::SeqCst);
    }

    pub fn fail_fetch(&self, fail: bool) {
        self.script.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn fail_list(&self, fail: bool) {
        self.script.fail_list.store(fail, Ordering::SeqCst);
    }

    /// Drops the metric series from every rule result, as a server that has not sampled yet would.
    pub fn strip_series(&self, strip: bool) {
        self.script.strip_series.store(strip, Ordering::SeqCst);
    }

    pub fn delay_fetch(&self, task_id: &str, delay: Duration) {
        self.script
            .fetch_delays
            .lock()
            .unwrap()
            .insert(task_id.to_string(), delay);
    }

    pub fn fetches(&self) -> Vec<TaskId> {
        self.script.fetches.lock().unwrap().clone()
    }

    pub fn fetch_count(&self, task_id: &str) -> usize {
        self.fetches().iter().filter(|id| *id == task_id).count()
    }

    pub fn submit_count(&self) -> usize {
        self.script.submits.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.script.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn remove_rule(&self, rule_id: &str) {
        self.state.lock().unwrap().remove_rule(rule_id);
    }
}

impl Client for ScriptedClient {
    fn submit(&self, request: RunRequest) -> impl Future<Output = Result<RunResponse>> + Send {
        let state = self.state.clone();
        let script = self.script.clone();
        async move {
            script.submits.fetch_add(1, Ordering::SeqCst);
            if script.fail_submit.load(Ordering::SeqCst) {
                return Err(anyhow!("connection refused"));
            }
            let mut state = state.lock().unwrap();
            Ok(state.run(request, OffsetDateTime::now_utc())?)
        }
    }

    fn fetch_result(
        &self,
        task_id: TaskId,
    ) -> impl Future<Output = Result<SimulationResult>> + Send {
        let state = self.state.clone();
        let script = self.script.clone();
        async move {
            script.fetches.lock().unwrap().push(task_id.clone());
            let now = script.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            script.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let delay = script.fetch_delays.lock().unwrap().get(&task_id).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            script.in_flight.fetch_sub(1, Ordering::SeqCst);

            if script.fail_fetch.load(Ordering::SeqCst) {
                return Err(anyhow!("connection reset"));
            }
            let mut result = state
                .lock()
                .unwrap()
                .results(&task_id, OffsetDateTime::now_utc())
                .ok_or_else(|| anyhow!("Backtesting task not found"))?;
            if script.strip_series.load(Ordering::SeqCst) {
                for rule in &mut result.rule_results {
                    rule.metric_series.clear();
                }
            }
            Ok(result)
        }
    }

    fn list_rules(
        &self,
        filters: RuleFilters,
    ) -> impl Future<Output = Result<ListRulesResponse>> + Send {
        let state = self.state.clone();
        let script = self.script.clone();
        async move {
            if script.fail_list.load(Ordering::SeqCst) {
                return Err(anyhow!("service unavailable"));
            }
            Ok(state.lock().unwrap().list_rules(&filters))
        }
    }
}
