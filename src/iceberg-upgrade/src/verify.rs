// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Read verification of upgraded tables from Databricks.
//!
//! Three probes run in fixed order: a structural describe, a bounded row
//! read, and a count. A table whose structure cannot be described is not
//! probed further. A read failure is classified as format-related when the
//! error text names the storage engine, which is the signature of a reader
//! that cannot handle the table's on-disk representation.

use async_trait::async_trait;
use databricks_client::{Client, StatementResult};
use tracing::{error, info, warn};

/// Case-insensitive marker that classifies a read error as an Iceberg
/// format problem rather than, say, a permissions issue.
const FORMAT_ERROR_MARKER: &str = "iceberg";

/// Runs one statement against the consuming engine.
///
/// The verifier consumes this seam rather than [`Client`] directly so the
/// probe sequencing can be tested without a workspace.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    /// Executes `sql` and returns its terminal result.
    async fn run(&self, sql: &str) -> Result<StatementResult, anyhow::Error>;
}

/// A [`QueryEngine`] bound to one Databricks SQL warehouse.
pub struct DatabricksEngine {
    /// The workspace client.
    pub client: Client,
    /// The warehouse statements are addressed to.
    pub warehouse_id: String,
}

#[async_trait]
impl QueryEngine for DatabricksEngine {
    async fn run(&self, sql: &str) -> Result<StatementResult, anyhow::Error> {
        Ok(self
            .client
            .execute_statement(&self.warehouse_id, sql)
            .await?)
    }
}

/// The verifier's judgment of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// All load-bearing probes succeeded. The count is best-effort.
    Passed {
        /// Total row count, when the count probe succeeded.
        total_rows: Option<i64>,
    },
    /// The table's structure could not be described; nothing else was
    /// probed.
    DescribeFailed {
        /// The error reported by the engine.
        error: String,
    },
    /// Rows could not be read.
    ReadFailed {
        /// The error reported by the engine.
        error: String,
        /// Whether the error text points at the table format itself.
        format_related: bool,
    },
}

impl VerifyOutcome {
    /// Whether the table is considered readable.
    pub fn passed(&self) -> bool {
        matches!(self, VerifyOutcome::Passed { .. })
    }
}

/// Collapses a probe result into success or an error message.
///
/// Transport failures and in-band statement failures are treated alike:
/// either way the probe did not demonstrate readability.
fn probe(result: Result<StatementResult, anyhow::Error>) -> Result<StatementResult, String> {
    match result {
        Ok(r) if r.succeeded() => Ok(r),
        Ok(r) => Err(r
            .error_message
            .unwrap_or_else(|| format!("statement ended in state {}", r.state))),
        Err(err) => Err(format!("{err:#}")),
    }
}

fn count_value(value: &serde_json::Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

/// Verifies that `catalog.database.table` is readable from the consuming
/// engine.
pub async fn verify_table(
    engine: &dyn QueryEngine,
    catalog: &str,
    database: &str,
    table: &str,
) -> VerifyOutcome {
    let full_name = format!("{catalog}.{database}.{table}");
    info!("verifying {}", full_name);

    info!("probe 1/3: DESCRIBE TABLE");
    if let Err(error) = probe(engine.run(&format!("DESCRIBE TABLE {full_name}")).await) {
        // No point reading rows from a table whose structure cannot even
        // be described.
        error!("DESCRIBE failed: {}", error);
        return VerifyOutcome::DescribeFailed { error };
    }

    info!("probe 2/3: bounded SELECT");
    let read_failure = match probe(
        engine
            .run(&format!("SELECT * FROM {full_name} LIMIT 5"))
            .await,
    ) {
        Ok(result) => {
            info!("SELECT returned {} row(s)", result.rows.len());
            None
        }
        Err(error) => {
            let format_related = error.to_lowercase().contains(FORMAT_ERROR_MARKER);
            error!("SELECT failed: {}", error);
            Some((error, format_related))
        }
    };

    info!("probe 3/3: COUNT");
    let total_rows = match probe(
        engine
            .run(&format!("SELECT COUNT(*) FROM {full_name}"))
            .await,
    ) {
        Ok(result) => {
            let count = result
                .rows
                .first()
                .and_then(|row| row.first())
                .and_then(count_value);
            if let Some(count) = count {
                info!("COUNT returned {} total row(s)", count);
            }
            count
        }
        Err(error) => {
            // The count is a nicety, not a correctness signal.
            warn!("COUNT failed (non-critical): {}", error);
            None
        }
    };

    match read_failure {
        Some((error, format_related)) => VerifyOutcome::ReadFailed {
            error,
            format_related,
        },
        None => VerifyOutcome::Passed { total_rows },
    }
}
