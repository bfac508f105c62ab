//! Wire bodies shared by the router and the pipeline.

use serde::{Deserialize, Serialize};

/// Body of a `/query` request. The legacy clients send `Query`; accept both
/// spellings.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct QueryRequest {
    #[serde(default, alias = "Query")]
    pub query: String,
}

/// Error shape of a `/query` response. Success bodies are streamed row by
/// row and never pass through this struct.
#[derive(Debug, Serialize, Deserialize)]
pub struct QueryResponse {
    pub result: Option<Vec<Vec<String>>>,
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DbNameResponse {
    pub db_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SwitchDbNameRequest {
    pub db_name: String,
}
