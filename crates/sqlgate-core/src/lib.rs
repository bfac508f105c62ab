//! Core building blocks for the SQLGate daemon: the switchable database
//! target, the dual audit sinks (structured log + Splunk HEC), and the
//! environment-backed user/expiration state shared by the request pipeline.

pub mod audit;
pub mod db;
pub mod error;
pub mod user;

pub use audit::{AuditEntry, AuditError, AuditSink, LogAudit, SplunkAudit, SplunkConfig};
pub use db::{DatabaseConfig, DatabaseTarget, Driver, TargetError, TargetPool};
pub use error::EnvVarError;
pub use user::UserAccess;
