//! JSON interface between the orchestrator and an evaluation server. Each module holds the wire
//! types, the [Client](crate::http::backtest::Client) trait that transports implement, the
//! in-memory state behind the reference server, and the actix handlers serving it.
pub mod backtest;
