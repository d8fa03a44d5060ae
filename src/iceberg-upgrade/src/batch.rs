// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Batch orchestration of table upgrades.
//!
//! Tables are processed strictly sequentially, one remote round trip per
//! table. Remote compaction saturates the cluster, so running tables
//! concurrently would contend for the same resources, and Glue offers no
//! cross-table transactional scope that would make interleaving safe.
//!
//! Each table is an independent unit of work: a failure is recorded in the
//! ledger and the batch moves on. Only cluster-level preconditions (checked
//! before the batch starts) abort the whole run.

use emr_exec::{ExecutionResult, StatementExecutor};
use glue_catalog::{CatalogError, TableCatalog};
use tracing::{error, info, warn};

use crate::plan::{self, UpgradePlan, TARGET_FORMAT_VERSION};

/// Which tables one `upgrade` invocation covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableSelector {
    /// A single explicitly named table.
    One(String),
    /// An explicit ordered list; order is preserved and duplicates are
    /// processed independently.
    Many(Vec<String>),
    /// Every Iceberg table in the database not already at the target
    /// version.
    All,
}

/// What happened to one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableOutcome {
    /// Not eligible for upgrade; nothing was executed.
    Skipped {
        /// Why the table was skipped.
        reason: String,
    },
    /// The catalog has no entry for the table.
    NotFound,
    /// The execution channel failed before a remote exit status was
    /// observed.
    Failed {
        /// The channel error.
        error: String,
    },
    /// A statement was submitted and completed (successfully or not).
    Executed {
        /// Submission position, for report ordering.
        seq: usize,
        /// The remote outcome.
        result: ExecutionResult,
    },
}

impl TableOutcome {
    /// The marker rendered in the summary report.
    pub fn summary_marker(&self) -> &'static str {
        match self {
            TableOutcome::Skipped { .. } => "skip",
            TableOutcome::NotFound | TableOutcome::Failed { .. } => "FAILED",
            TableOutcome::Executed { result, .. } => {
                if result.ok {
                    "ok"
                } else {
                    "FAILED"
                }
            }
        }
    }
}

/// One ledger line: a table and what happened to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    /// The table name as submitted.
    pub table: String,
    /// The outcome.
    pub outcome: TableOutcome,
}

/// The ordered record of one batch run.
///
/// Owned exclusively by the orchestrating task for the duration of one
/// invocation; it exists only to render the final summary.
#[derive(Debug, Default)]
pub struct UpgradeLedger {
    entries: Vec<LedgerEntry>,
}

impl UpgradeLedger {
    /// The entries, in submission order.
    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    /// Whether the batch resolved to zero tables.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn record(&mut self, table: String, outcome: TableOutcome) {
        self.entries.push(LedgerEntry { table, outcome });
    }
}

/// Runs one upgrade batch and returns its ledger.
///
/// The `All` selector resolves to tables below the target version before
/// any remote call, so no-op alterations are never issued; explicitly
/// naming an already-upgraded table still compacts it (see
/// [`UpgradePlan::CompactOnly`]).
pub async fn run_batch(
    catalog: &dyn TableCatalog,
    executor: &dyn StatementExecutor,
    spark_catalog: &str,
    database: &str,
    selector: TableSelector,
    dry_run: bool,
) -> Result<UpgradeLedger, CatalogError> {
    let tables = match selector {
        TableSelector::One(table) => vec![table],
        TableSelector::Many(tables) => tables,
        TableSelector::All => {
            let candidates = catalog.list_iceberg_tables(database).await?;
            let below_target: Vec<String> = candidates
                .into_iter()
                .filter(|d| d.format_version.as_deref() != Some(TARGET_FORMAT_VERSION))
                .map(|d| d.name)
                .collect();
            info!(
                "found {} table(s) needing upgrade in {}",
                below_target.len(),
                database
            );
            below_target
        }
    };

    let mut ledger = UpgradeLedger::default();
    if tables.is_empty() {
        info!("no tables need upgrading in {}", database);
        return Ok(ledger);
    }

    let mut seq = 0;
    for table in tables {
        let outcome = upgrade_table(
            catalog,
            executor,
            spark_catalog,
            database,
            &table,
            dry_run,
            &mut seq,
        )
        .await;
        ledger.record(table, outcome);
    }
    Ok(ledger)
}

async fn upgrade_table(
    catalog: &dyn TableCatalog,
    executor: &dyn StatementExecutor,
    spark_catalog: &str,
    database: &str,
    table: &str,
    dry_run: bool,
    seq: &mut usize,
) -> TableOutcome {
    info!("upgrading {}.{}", database, table);

    let descriptor = match catalog.describe(database, table).await {
        Ok(descriptor) => descriptor,
        Err(CatalogError::NotFound { .. }) => {
            error!("table {}.{} not found in Glue", database, table);
            return TableOutcome::NotFound;
        }
        Err(err) => {
            error!("describing {}.{}: {}", database, table, err);
            return TableOutcome::Failed {
                error: err.to_string(),
            };
        }
    };

    info!(
        "  location: {}",
        descriptor.location.as_deref().unwrap_or("(none)")
    );
    info!(
        "  table type: {}",
        descriptor.table_type.as_deref().unwrap_or("UNKNOWN")
    );
    info!(
        "  current format version: {}",
        descriptor.format_version_or_unknown()
    );

    let statement = match plan::plan(&descriptor, spark_catalog) {
        UpgradePlan::Skip { reason } => {
            warn!("skipping {}.{}: {}", database, table, reason);
            return TableOutcome::Skipped { reason };
        }
        UpgradePlan::CompactOnly { statement } => {
            info!("already on v{TARGET_FORMAT_VERSION}; skipping alteration, compacting only");
            statement
        }
        UpgradePlan::AlterAndCompact { statement } => statement,
    };

    if dry_run {
        println!("would execute for {}.{}:", database, table);
        for line in statement.lines() {
            println!("  {}", line);
        }
    }

    match executor.execute(&plan::flatten_sql(&statement), dry_run).await {
        Ok(result) => {
            let assigned = *seq;
            *seq += 1;
            if result.ok {
                if dry_run {
                    info!("dry run: would upgrade {}.{}", database, table);
                } else {
                    info!("upgraded {}.{}", database, table);
                }
            } else {
                error!(
                    "upgrade of {}.{} failed: {}",
                    database,
                    table,
                    result.stderr.trim()
                );
            }
            TableOutcome::Executed {
                seq: assigned,
                result,
            }
        }
        Err(err) => {
            error!("executing upgrade of {}.{}: {}", database, table, err);
            TableOutcome::Failed {
                error: err.to_string(),
            }
        }
    }
}

/// Prints the deterministic table-by-table summary, in submission order.
pub fn print_summary(database: &str, ledger: &UpgradeLedger, dry_run: bool) {
    println!();
    println!("{:=<60}", "");
    if dry_run {
        println!("UPGRADE SUMMARY (dry run)");
    } else {
        println!("UPGRADE SUMMARY");
    }
    println!("{:=<60}", "");
    if ledger.is_empty() {
        println!("  no tables needed upgrading");
        return;
    }
    for entry in ledger.entries() {
        println!(
            "  {:<6} {}.{}",
            entry.outcome.summary_marker(),
            database,
            entry.table
        );
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use emr_exec::ExecError;
    use glue_catalog::TableDescriptor;

    use super::*;

    struct StaticCatalog {
        database: String,
        tables: BTreeMap<String, TableDescriptor>,
    }

    impl StaticCatalog {
        fn new(database: &str, tables: Vec<TableDescriptor>) -> StaticCatalog {
            StaticCatalog {
                database: database.to_string(),
                tables: tables.into_iter().map(|d| (d.name.clone(), d)).collect(),
            }
        }
    }

    #[async_trait]
    impl TableCatalog for StaticCatalog {
        async fn describe(
            &self,
            database: &str,
            table: &str,
        ) -> Result<TableDescriptor, CatalogError> {
            assert_eq!(database, self.database);
            self.tables
                .get(table)
                .cloned()
                .ok_or_else(|| CatalogError::NotFound {
                    database: database.to_string(),
                    table: table.to_string(),
                })
        }

        async fn list_iceberg_tables(
            &self,
            database: &str,
        ) -> Result<Vec<TableDescriptor>, CatalogError> {
            assert_eq!(database, self.database);
            Ok(self
                .tables
                .values()
                .filter(|d| d.is_iceberg())
                .cloned()
                .collect())
        }
    }

    struct RecordingExecutor {
        calls: Mutex<Vec<(String, bool)>>,
        fail_on: Vec<String>,
    }

    impl RecordingExecutor {
        fn new() -> RecordingExecutor {
            RecordingExecutor {
                calls: Mutex::new(Vec::new()),
                fail_on: Vec::new(),
            }
        }

        fn failing_on(table: &str) -> RecordingExecutor {
            RecordingExecutor {
                calls: Mutex::new(Vec::new()),
                fail_on: vec![table.to_string()],
            }
        }

        fn calls(&self) -> Vec<(String, bool)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StatementExecutor for RecordingExecutor {
        async fn execute(&self, sql: &str, dry_run: bool) -> Result<ExecutionResult, ExecError> {
            self.calls.lock().unwrap().push((sql.to_string(), dry_run));
            if dry_run {
                return Ok(ExecutionResult::dry_run());
            }
            if self.fail_on.iter().any(|t| sql.contains(t.as_str())) {
                Ok(ExecutionResult {
                    ok: false,
                    stdout: String::new(),
                    stderr: "remote: rewrite_data_files aborted".into(),
                })
            } else {
                Ok(ExecutionResult {
                    ok: true,
                    stdout: "Time taken: 4.2 seconds".into(),
                    stderr: String::new(),
                })
            }
        }
    }

    fn iceberg(name: &str, version: &str) -> TableDescriptor {
        TableDescriptor {
            database: "sales".into(),
            name: name.into(),
            location: Some(format!("s3://lake-bucket/warehouse/sales.db/{name}")),
            table_type: Some("ICEBERG".into()),
            format_version: Some(version.into()),
            metadata_location: None,
        }
    }

    fn hive(name: &str) -> TableDescriptor {
        TableDescriptor {
            database: "sales".into(),
            name: name.into(),
            location: None,
            table_type: Some("EXTERNAL_TABLE".into()),
            format_version: None,
            metadata_location: None,
        }
    }

    #[tokio::test]
    async fn explicit_list_preserves_order_and_isolates_not_found() {
        let catalog = StaticCatalog::new(
            "sales",
            vec![iceberg("orders", "2"), iceberg("customers", "2")],
        );
        let executor = RecordingExecutor::new();
        let ledger = run_batch(
            &catalog,
            &executor,
            "glue_catalog",
            "sales",
            TableSelector::Many(vec!["orders".into(), "ghost".into(), "customers".into()]),
            false,
        )
        .await
        .unwrap();

        let entries = ledger.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(
            entries.iter().map(|e| e.table.as_str()).collect::<Vec<_>>(),
            vec!["orders", "ghost", "customers"]
        );
        assert!(matches!(
            entries[0].outcome,
            TableOutcome::Executed { seq: 0, ref result } if result.ok
        ));
        assert_eq!(entries[1].outcome, TableOutcome::NotFound);
        assert!(matches!(
            entries[2].outcome,
            TableOutcome::Executed { seq: 1, ref result } if result.ok
        ));
    }

    #[tokio::test]
    async fn remote_failure_does_not_stop_the_batch() {
        let catalog = StaticCatalog::new(
            "sales",
            vec![iceberg("orders", "2"), iceberg("customers", "2")],
        );
        let executor = RecordingExecutor::failing_on("orders");
        let ledger = run_batch(
            &catalog,
            &executor,
            "glue_catalog",
            "sales",
            TableSelector::Many(vec!["orders".into(), "customers".into()]),
            false,
        )
        .await
        .unwrap();

        let entries = ledger.entries();
        assert_eq!(entries.len(), 2);
        assert!(matches!(
            entries[0].outcome,
            TableOutcome::Executed { ref result, .. } if !result.ok
        ));
        assert!(matches!(
            entries[1].outcome,
            TableOutcome::Executed { ref result, .. } if result.ok
        ));
        assert_eq!(executor.calls().len(), 2);
    }

    #[tokio::test]
    async fn dry_run_never_executes_for_real() {
        let catalog = StaticCatalog::new(
            "sales",
            vec![iceberg("orders", "2"), iceberg("customers", "3")],
        );
        let executor = RecordingExecutor::new();
        let ledger = run_batch(
            &catalog,
            &executor,
            "glue_catalog",
            "sales",
            TableSelector::Many(vec!["orders".into(), "customers".into()]),
            true,
        )
        .await
        .unwrap();

        for entry in ledger.entries() {
            assert!(matches!(
                entry.outcome,
                TableOutcome::Executed { ref result, .. } if result.ok
            ));
        }
        let calls = executor.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|(_, dry_run)| *dry_run));
    }

    #[tokio::test]
    async fn all_selector_filters_tables_already_at_target() {
        let catalog = StaticCatalog::new(
            "sales",
            vec![
                iceberg("orders", "2"),
                iceberg("customers", "3"),
                hive("legacy"),
            ],
        );
        let executor = RecordingExecutor::new();
        let ledger = run_batch(
            &catalog,
            &executor,
            "glue_catalog",
            "sales",
            TableSelector::All,
            false,
        )
        .await
        .unwrap();

        assert_eq!(ledger.entries().len(), 1);
        assert_eq!(ledger.entries()[0].table, "orders");
        let calls = executor.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0.contains("orders"));
    }

    #[tokio::test]
    async fn all_selector_with_nothing_below_target_is_a_clean_noop() {
        let catalog = StaticCatalog::new("sales", vec![iceberg("customers", "3")]);
        let executor = RecordingExecutor::new();
        let ledger = run_batch(
            &catalog,
            &executor,
            "glue_catalog",
            "sales",
            TableSelector::All,
            false,
        )
        .await
        .unwrap();

        assert!(ledger.is_empty());
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn upgraded_tables_are_never_realtered() {
        let catalog = StaticCatalog::new("sales", vec![iceberg("customers", "3")]);
        // Two sequential passes over the same already-upgraded table, as if
        // the operator ran the tool twice.
        for _ in 0..2 {
            let executor = RecordingExecutor::new();
            let ledger = run_batch(
                &catalog,
                &executor,
                "glue_catalog",
                "sales",
                TableSelector::One("customers".into()),
                false,
            )
            .await
            .unwrap();

            assert!(matches!(
                ledger.entries()[0].outcome,
                TableOutcome::Executed { ref result, .. } if result.ok
            ));
            let calls = executor.calls();
            assert_eq!(calls.len(), 1);
            assert!(calls[0].0.contains("rewrite_data_files"));
            assert!(!calls[0].0.contains("ALTER TABLE"));
        }
    }

    #[tokio::test]
    async fn non_iceberg_tables_are_skipped_without_execution() {
        let catalog = StaticCatalog::new("sales", vec![hive("legacy")]);
        let executor = RecordingExecutor::new();
        let ledger = run_batch(
            &catalog,
            &executor,
            "glue_catalog",
            "sales",
            TableSelector::One("legacy".into()),
            false,
        )
        .await
        .unwrap();

        assert!(matches!(
            ledger.entries()[0].outcome,
            TableOutcome::Skipped { .. }
        ));
        assert!(executor.calls().is_empty());
    }

    #[test]
    fn summary_markers() {
        assert_eq!(
            TableOutcome::Skipped {
                reason: "not an Iceberg table".into()
            }
            .summary_marker(),
            "skip"
        );
        assert_eq!(TableOutcome::NotFound.summary_marker(), "FAILED");
        assert_eq!(
            TableOutcome::Executed {
                seq: 0,
                result: ExecutionResult {
                    ok: true,
                    stdout: String::new(),
                    stderr: String::new(),
                }
            }
            .summary_marker(),
            "ok"
        );
    }
}
