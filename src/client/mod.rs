//! Implementations of [Client](crate::http::backtest::Client): an HTTP client for a running
//! server and an in-process client that drives [AppState](crate::http::backtest::AppState)
//! directly.
pub mod backtest;
