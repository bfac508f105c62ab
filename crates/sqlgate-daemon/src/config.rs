//! Daemon-level environment configuration. Database, user, and Splunk
//! settings live in sqlgate-core next to the types they build.

use std::{env, net::SocketAddr, time::Duration};

use anyhow::{Context, Result};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub request_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let listen_addr = env::var("SQLGATE_API_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .context("invalid SQLGATE_API_ADDR")?;

        let request_timeout = request_timeout(env::var("REQUEST_TIMEOUT").ok().as_deref());

        Ok(Self {
            listen_addr,
            request_timeout,
        })
    }
}

/// `REQUEST_TIMEOUT` is plain integer seconds. Anything unparsable or
/// non-positive falls back to the two-minute default.
pub fn request_timeout(raw: Option<&str>) -> Duration {
    match raw.map(str::trim) {
        None | Some("") => DEFAULT_REQUEST_TIMEOUT,
        Some(value) => match value.parse::<u64>() {
            Ok(seconds) if seconds > 0 => Duration::from_secs(seconds),
            _ => DEFAULT_REQUEST_TIMEOUT,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_defaults_to_two_minutes() {
        assert_eq!(request_timeout(None), Duration::from_secs(120));
        assert_eq!(request_timeout(Some("")), Duration::from_secs(120));
    }

    #[test]
    fn timeout_parses_integer_seconds() {
        assert_eq!(request_timeout(Some("30")), Duration::from_secs(30));
        assert_eq!(request_timeout(Some(" 600 ")), Duration::from_secs(600));
    }

    #[test]
    fn invalid_timeouts_fall_back() {
        assert_eq!(request_timeout(Some("0")), Duration::from_secs(120));
        assert_eq!(request_timeout(Some("-5")), Duration::from_secs(120));
        assert_eq!(request_timeout(Some("2m")), Duration::from_secs(120));
        assert_eq!(request_timeout(Some("1.5")), Duration::from_secs(120));
    }
}
