//! The SQLGate daemon: an audited raw-SQL-over-HTTP gateway.
//!
//! Requests to `/query` run through a fixed stage pipeline (recovery,
//! authorization, expiration, audit capture, timeout) before reaching the
//! streaming executor; the remaining routes expose health and the live
//! database-target switch.

pub mod config;
pub mod models;
pub mod pipeline;
pub mod query;
pub mod server;
pub mod telemetry;
