// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Client for the Databricks SQL Statement Execution API.
//!
//! Covers the two calls the verifier needs: discovering a running SQL
//! warehouse and executing a single statement synchronously against it.

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// How long the Databricks API holds the request open waiting for the
/// statement to finish.
const STATEMENT_WAIT_TIMEOUT: &str = "50s";

/// Errors from the Databricks API client.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The workspace host is not a valid URL.
    #[error("invalid Databricks host: {0}")]
    Host(#[from] url::ParseError),
    /// A transport-level failure.
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    /// The workspace has no SQL warehouse in the `RUNNING` state.
    #[error("no running SQL warehouse found")]
    NoRunningWarehouse,
}

/// A SQL warehouse as reported by the workspace.
#[derive(Debug, Clone, Deserialize)]
pub struct Warehouse {
    /// The warehouse id used to address statements.
    pub id: String,
    /// Human-readable warehouse name.
    #[serde(default)]
    pub name: String,
    /// Lifecycle state, e.g. `RUNNING` or `STOPPED`.
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Deserialize)]
struct WarehouseList {
    #[serde(default)]
    warehouses: Vec<Warehouse>,
}

#[derive(Debug, Deserialize)]
struct StatementResponse {
    #[serde(default)]
    status: Option<StatementStatus>,
    #[serde(default)]
    result: Option<StatementData>,
}

#[derive(Debug, Deserialize)]
struct StatementStatus {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error: Option<StatementError>,
}

#[derive(Debug, Deserialize)]
struct StatementError {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatementData {
    #[serde(default)]
    data_array: Option<Vec<Vec<serde_json::Value>>>,
}

/// Outcome of one statement execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementResult {
    /// The terminal state the API reported, e.g. `SUCCEEDED` or `FAILED`.
    pub state: String,
    /// Result rows, if the statement produced any.
    pub rows: Vec<Vec<serde_json::Value>>,
    /// The error message for failed statements.
    pub error_message: Option<String>,
}

impl StatementResult {
    /// Whether the statement reached the `SUCCEEDED` state.
    pub fn succeeded(&self) -> bool {
        self.state == "SUCCEEDED"
    }
}

impl From<StatementResponse> for StatementResult {
    fn from(resp: StatementResponse) -> StatementResult {
        let status = resp.status.unwrap_or(StatementStatus {
            state: None,
            error: None,
        });
        StatementResult {
            state: status.state.unwrap_or_else(|| "UNKNOWN".into()),
            rows: resp.result.and_then(|r| r.data_array).unwrap_or_default(),
            error_message: status.error.and_then(|e| e.message),
        }
    }
}

/// A client bound to one Databricks workspace.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    host: Url,
    token: String,
}

impl Client {
    /// Constructs a client for the workspace at `host`, authenticating with
    /// a personal access token.
    pub fn new(host: &str, token: String) -> Result<Client, ApiError> {
        let host = Url::parse(host.trim_end_matches('/'))?;
        Ok(Client {
            http: reqwest::Client::new(),
            host,
            token,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.host.as_str().trim_end_matches('/'), path)
    }

    /// Lists the workspace's SQL warehouses.
    pub async fn list_warehouses(&self) -> Result<Vec<Warehouse>, ApiError> {
        let resp: WarehouseList = self
            .http
            .get(self.endpoint("/api/2.0/sql/warehouses"))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.warehouses)
    }

    /// Picks the first warehouse in the `RUNNING` state.
    pub async fn first_running_warehouse(&self) -> Result<Warehouse, ApiError> {
        self.list_warehouses()
            .await?
            .into_iter()
            .find(|w| w.state == "RUNNING")
            .ok_or(ApiError::NoRunningWarehouse)
    }

    /// Executes one statement on the given warehouse, waiting synchronously
    /// for its terminal state.
    pub async fn execute_statement(
        &self,
        warehouse_id: &str,
        sql: &str,
    ) -> Result<StatementResult, ApiError> {
        debug!("executing on warehouse {}: {}", warehouse_id, sql);
        let resp: StatementResponse = self
            .http
            .post(self.endpoint("/api/2.0/sql/statements"))
            .bearer_auth(&self.token)
            .json(&json!({
                "warehouse_id": warehouse_id,
                "statement": sql,
                "wait_timeout": STATEMENT_WAIT_TIMEOUT,
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn succeeded_statement_carries_rows() {
        let resp: StatementResponse = serde_json::from_value(json!({
            "status": { "state": "SUCCEEDED" },
            "result": { "data_array": [["1", "widget"], ["2", "gadget"]] },
        }))
        .unwrap();
        let result = StatementResult::from(resp);
        assert!(result.succeeded());
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.error_message, None);
    }

    #[test]
    fn failed_statement_surfaces_the_error_message() {
        let resp: StatementResponse = serde_json::from_value(json!({
            "status": {
                "state": "FAILED",
                "error": { "message": "[UNSUPPORTED_FEATURE] Iceberg deletion vectors" },
            },
        }))
        .unwrap();
        let result = StatementResult::from(resp);
        assert!(!result.succeeded());
        assert!(result.rows.is_empty());
        assert_eq!(
            result.error_message.as_deref(),
            Some("[UNSUPPORTED_FEATURE] Iceberg deletion vectors")
        );
    }

    #[test]
    fn statement_response_tolerates_missing_fields() {
        let resp: StatementResponse = serde_json::from_value(json!({})).unwrap();
        let result = StatementResult::from(resp);
        assert_eq!(result.state, "UNKNOWN");
        assert!(!result.succeeded());
    }
}
