use std::future::{self, Future};
use std::sync::Mutex;

use anyhow::{anyhow, Error, Result};
use time::OffsetDateTime;

use crate::http::backtest::{
    AppState, BacktestError, Client, ListRulesResponse, RuleFilters, RunRequest, RunResponse,
};
use crate::types::{SimulationResult, TaskId};

#[derive(Debug, Clone)]
pub struct HttpClient {
    pub path: String,
    pub client: reqwest::Client,
}

impl Client for HttpClient {
    async fn submit(&self, request: RunRequest) -> Result<RunResponse> {
        Ok(self
            .client
            .post(self.path.clone() + "/backtesting/run")
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json::<RunResponse>()
            .await?)
    }

    async fn fetch_result(&self, task_id: TaskId) -> Result<SimulationResult> {
        Ok(self
            .client
            .get(self.path.clone() + format!("/backtesting/results/{task_id}").as_str())
            .send()
            .await?
            .error_for_status()?
            .json::<SimulationResult>()
            .await?)
    }

    async fn list_rules(&self, filters: RuleFilters) -> Result<ListRulesResponse> {
        Ok(self
            .client
            .get(self.path.clone() + "/alert-rules")
            .query(&filters)
            .send()
            .await?
            .error_for_status()?
            .json::<ListRulesResponse>()
            .await?)
    }
}

impl HttpClient {
    pub fn new(path: String) -> Self {
        Self {
            path: path.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

/// Runs the reference backend in-process, without a socket.
pub struct TestClient {
    state: Mutex<AppState>,
}

impl Client for TestClient {
    fn submit(&self, request: RunRequest) -> impl Future<Output = Result<RunResponse>> + Send {
        let resp = self
            .with_state(|state| state.run(request, OffsetDateTime::now_utc()).map_err(Error::new));
        future::ready(resp.and_then(|inner| inner))
    }

    fn fetch_result(
        &self,
        task_id: TaskId,
    ) -> impl Future<Output = Result<SimulationResult>> + Send {
        let resp = self.with_state(|state| {
            state
                .results(&task_id, OffsetDateTime::now_utc())
                .ok_or_else(|| Error::new(BacktestError::UnknownTask))
        });
        future::ready(resp.and_then(|inner| inner))
    }

    fn list_rules(
        &self,
        filters: RuleFilters,
    ) -> impl Future<Output = Result<ListRulesResponse>> + Send {
        future::ready(self.with_state(|state| state.list_rules(&filters)))
    }
}

impl TestClient {
    pub fn new(state: AppState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// Gives tests access to the backend, for example to remove a rule mid-task.
    pub fn with_state<T>(&self, f: impl FnOnce(&mut AppState) -> T) -> Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!(BacktestError::Unavailable))?;
        Ok(f(&mut state))
    }
}
