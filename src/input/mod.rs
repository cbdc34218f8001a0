//! Inputs produce the metric series that the reference server evaluates rules against. They stand
//! in for whatever metric store a real evaluation engine would read from.
pub mod metrics;
