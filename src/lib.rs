//! # What is this?
//!
//! A client-side orchestrator for backtesting alert rules. A user picks a rule, a historical time
//! range and, optionally, reference events ("this really happened here"). The orchestrator
//! submits a replay job to an evaluation server, polls it until it finishes and lines the returned
//! metric series up with the reference events so that a chart can show where the rule would have
//! fired against where it should have.
//!
//! A reference evaluation server is included. It is mostly useful for development and tests: it
//! evaluates rules against synthetic metrics and completes tasks after a fixed number of polls.
//!
//! # Implementation
//!
//! Leaf-first:
//! - [interval](crate::interval) has the time-range arithmetic: overlap, containment and clamping
//! with a minimum visible duration.
//! - [validate](crate::validate) gates a submission before any network call.
//! - [poller](crate::poller) owns the lifecycle of the single remote task being observed:
//! submission, periodic status fetches, terminal detection and cancellation.
//! - [align](crate::align) turns a rule result plus reference events into overlay intervals and
//! statistics. It is a pure projection recomputed on every observation.
//! - [orchestrator](crate::orchestrator) wires these together and publishes a snapshot after every
//! transition.
//!
//! The transport is abstracted by [Client](crate::http::backtest::Client).
//! [HttpClient](crate::client::backtest::HttpClient) talks JSON to a server,
//! [TestClient](crate::client::backtest::TestClient) runs the reference backend in-process.
//!
//! ```text
//! cargo run --bin backtest_server [ipv4_address] [port] [polls_until_complete]
//! cargo run --bin backtest_client [base_url] [rule_id] [days]
//! ```
//!
//! # Consistency
//!
//! Only one task is observed at a time. Submitting again, switching rule or disposing stops
//! observation of the previous task; the server is not told and may keep running it. Responses
//! are tagged with the handle they belong to and anything for a superseded handle is discarded,
//! so a slow response for an old task can never overwrite a newer one.
pub mod align;
pub mod client;
pub mod config;
pub mod http;
pub mod input;
pub mod interval;
pub mod orchestrator;
pub mod poller;
pub mod types;
pub mod validate;
