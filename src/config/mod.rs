//! Tunables for the orchestrator and the two binaries. Binaries take positional arguments, the
//! library takes these structs.
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Context, Result};
use time::Duration;

use crate::align::DEFAULT_MIN_OVERLAY_DURATION;
use crate::http::backtest::{RunOptions, DEFAULT_POLLS_UNTIL_COMPLETE};
use crate::poller::DEFAULT_POLL_INTERVAL;

#[derive(Clone, Debug, PartialEq)]
pub struct OrchestratorConfig {
    pub poll_interval: StdDuration,
    pub min_overlay_duration: Duration,
    pub options: RunOptions,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            min_overlay_duration: DEFAULT_MIN_OVERLAY_DURATION,
            options: RunOptions::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_poll_interval(mut self, poll_interval: StdDuration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_min_overlay_duration(mut self, min_overlay_duration: Duration) -> Self {
        self.min_overlay_duration = min_overlay_duration;
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }
}

/// `backtest_server <address> <port> [polls_until_complete]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    pub polls_until_complete: u32,
}

impl ServerConfig {
    pub fn from_args(args: &[String]) -> Result<Self> {
        let address = args
            .get(1)
            .cloned()
            .ok_or_else(|| anyhow!("usage: backtest_server <address> <port> [polls_until_complete]"))?;
        let port = args
            .get(2)
            .ok_or_else(|| anyhow!("missing port"))?
            .parse()
            .context("port must be a number between 0 and 65535")?;
        let polls_until_complete = match args.get(3) {
            Some(raw) => raw
                .parse()
                .context("polls_until_complete must be a positive number")?,
            None => DEFAULT_POLLS_UNTIL_COMPLETE,
        };
        Ok(Self {
            address,
            port,
            polls_until_complete,
        })
    }
}

/// `backtest_client <base_url> <rule_id> [days]`
#[derive(Clone, Debug, PartialEq)]
pub struct ClientConfig {
    pub base_url: String,
    pub rule_id: String,
    pub days: i64,
    pub orchestrator: OrchestratorConfig,
}

impl ClientConfig {
    pub fn from_args(args: &[String]) -> Result<Self> {
        let base_url = args
            .get(1)
            .cloned()
            .ok_or_else(|| anyhow!("usage: backtest_client <base_url> <rule_id> [days]"))?;
        let rule_id = args
            .get(2)
            .cloned()
            .ok_or_else(|| anyhow!("missing rule id"))?;
        let days = match args.get(3) {
            Some(raw) => raw.parse().context("days must be a whole number")?,
            None => 7,
        };
        if days <= 0 {
            return Err(anyhow!("days must be positive, got {days}"));
        }
        Ok(Self {
            base_url,
            rule_id,
            days,
            orchestrator: OrchestratorConfig::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{ClientConfig, ServerConfig};
    use crate::http::backtest::DEFAULT_POLLS_UNTIL_COMPLETE;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn test_that_server_args_parse() {
        let config = ServerConfig::from_args(&args(&["bin", "127.0.0.1", "8080"])).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.polls_until_complete, DEFAULT_POLLS_UNTIL_COMPLETE);

        let config = ServerConfig::from_args(&args(&["bin", "0.0.0.0", "80", "5"])).unwrap();
        assert_eq!(config.polls_until_complete, 5);
    }

    #[test]
    fn test_that_bad_args_are_errors() {
        assert!(ServerConfig::from_args(&args(&["bin"])).is_err());
        assert!(ServerConfig::from_args(&args(&["bin", "127.0.0.1", "port"])).is_err());
        assert!(ClientConfig::from_args(&args(&["bin", "http://localhost:8080"])).is_err());
        assert!(ClientConfig::from_args(&args(&["bin", "http://x", "r1", "-2"])).is_err());
    }

    #[test]
    fn test_that_client_defaults_to_a_week() {
        let config =
            ClientConfig::from_args(&args(&["bin", "http://localhost:8080", "rule-001"])).unwrap();
        assert_eq!(config.days, 7);
        assert_eq!(config.rule_id, "rule-001");
    }
}
