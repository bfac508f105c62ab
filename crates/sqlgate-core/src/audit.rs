//! Audit sinks: every authorized query is recorded before it executes.
//!
//! Two destinations exist. The structured-log sink is best effort; the
//! Splunk HTTP Event Collector sink is mandatory, and a failed remote
//! write vetoes query execution upstream.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::error::EnvVarError;

const SPLUNK_SOURCE: &str = "sqlgate";
const SPLUNK_SOURCE_TYPE: &str = "json";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One immutable audit record: what was asked, by whom, and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub query: String,
    pub user: String,
    /// Unix seconds, read from the audit stage's own clock.
    pub timestamp: i64,
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("unable to send audit record: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("audit endpoint rejected record: {text} ({code})")]
    Rejected { code: i64, text: String },
    #[error("unable to decode audit endpoint response: {0}")]
    MalformedResponse(#[from] serde_json::Error),
}

/// A destination that durably records an [`AuditEntry`].
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write(&self, entry: &AuditEntry) -> Result<(), AuditError>;
}

/// Local sink writing through the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAudit;

#[async_trait]
impl AuditSink for LogAudit {
    async fn write(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        info!(
            target: "audit",
            query = %entry.query,
            user = %entry.user,
            timestamp = entry.timestamp,
            "AUDIT"
        );
        Ok(())
    }
}

/// Static environment describing the Splunk ingestion endpoint and the
/// labels attached to every event from this instance.
#[derive(Debug, Clone)]
pub struct SplunkConfig {
    pub endpoint: String,
    pub index: String,
    pub token: String,
    pub host: String,
    pub namespace: String,
    pub pod: String,
}

impl SplunkConfig {
    pub fn from_env() -> Result<Self, EnvVarError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, EnvVarError> {
        let require = |name: &'static str| get(name).ok_or(EnvVarError::Missing(name));
        Ok(Self {
            endpoint: require("SPLUNK_ENDPOINT")?,
            index: require("SPLUNK_INDEX")?,
            token: require("SPLUNK_TOKEN")?,
            host: require("HOST")?,
            namespace: require("NAMESPACE")?,
            pod: require("POD_NAME")?,
        })
    }
}

#[derive(Debug, Serialize)]
struct HecEvent<'a> {
    query: &'a str,
    user: &'a str,
    namespace: &'a str,
    pod: &'a str,
}

#[derive(Debug, Serialize)]
struct HecPayload<'a> {
    event: HecEvent<'a>,
    index: &'a str,
    host: &'a str,
    source: &'a str,
    sourcetype: &'a str,
    time: i64,
}

/// Acknowledgement body returned by the collector. Missing fields default
/// to the zero values, as the legacy client tolerated.
#[derive(Debug, Deserialize)]
struct HecResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    code: i64,
}

/// Remote sink speaking the Splunk HTTP Event Collector protocol.
pub struct SplunkAudit {
    config: SplunkConfig,
    client: reqwest::Client,
}

impl SplunkAudit {
    pub fn new(config: SplunkConfig) -> Result<Self, AuditError> {
        // The collector endpoints this ships against present self-signed
        // certificates; certificate validation is disabled to match the
        // deployed client.
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self::with_client(config, client))
    }

    pub fn with_client(config: SplunkConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }
}

#[async_trait]
impl AuditSink for SplunkAudit {
    async fn write(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let payload = HecPayload {
            event: HecEvent {
                query: &entry.query,
                user: &entry.user,
                namespace: &self.config.namespace,
                pod: &self.config.pod,
            },
            index: &self.config.index,
            host: &self.config.host,
            source: SPLUNK_SOURCE,
            sourcetype: SPLUNK_SOURCE_TYPE,
            time: entry.timestamp,
        };

        let url = format!("{}/services/collector/event", self.config.endpoint);
        let response = self
            .client
            .post(&url)
            .header(header::ACCEPT, "application/json")
            .header(
                header::AUTHORIZATION,
                format!("Splunk {}", self.config.token),
            )
            .header(
                header::USER_AGENT,
                concat!("sqlgate/", env!("CARGO_PKG_VERSION")),
            )
            .json(&payload)
            .send()
            .await?;

        let body = response.bytes().await?;
        let ack: HecResponse = serde_json::from_slice(&body)?;
        if ack.code > 0 {
            return Err(AuditError::Rejected {
                code: ack.code,
                text: ack.text,
            });
        }

        Ok(())
    }
}
