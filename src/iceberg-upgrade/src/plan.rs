// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Per-table upgrade planning.
//!
//! Planning is pure: the variant is a function of the descriptor's
//! `(table_type, format_version)` pair and nothing else. All remote I/O
//! happens later, when the orchestrator hands a plan's statement to the
//! executor.

use glue_catalog::TableDescriptor;

/// The Iceberg format version this tool upgrades tables to.
pub const TARGET_FORMAT_VERSION: &str = "3";

/// What to do with one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradePlan {
    /// The table is not eligible; nothing to execute.
    Skip {
        /// Why the table was skipped.
        reason: String,
    },
    /// Pin the format version to the target, then rewrite all data files.
    ///
    /// The rewrite must follow the alteration: the property change alone
    /// leaves existing data and delete files in the old on-disk
    /// representation, which downstream readers may still reject.
    AlterAndCompact {
        /// The SQL to execute, alteration clause first.
        statement: String,
    },
    /// The table is already at the target version; rewrite data files only.
    CompactOnly {
        /// The SQL to execute.
        statement: String,
    },
}

impl UpgradePlan {
    /// The statement to execute, if the plan has one.
    pub fn statement(&self) -> Option<&str> {
        match self {
            UpgradePlan::Skip { .. } => None,
            UpgradePlan::AlterAndCompact { statement }
            | UpgradePlan::CompactOnly { statement } => Some(statement),
        }
    }
}

/// Decides the upgrade plan for one table.
pub fn plan(descriptor: &TableDescriptor, spark_catalog: &str) -> UpgradePlan {
    if !descriptor.is_iceberg() {
        return UpgradePlan::Skip {
            reason: format!(
                "not an Iceberg table (type: {})",
                descriptor.table_type.as_deref().unwrap_or("UNKNOWN")
            ),
        };
    }
    let at_target = descriptor.format_version.as_deref() == Some(TARGET_FORMAT_VERSION);
    let statement = upgrade_statement(
        spark_catalog,
        &descriptor.database,
        &descriptor.name,
        !at_target,
    );
    if at_target {
        UpgradePlan::CompactOnly { statement }
    } else {
        UpgradePlan::AlterAndCompact { statement }
    }
}

/// Builds the upgrade SQL for one table.
///
/// The rewrite-all compaction clause is rendered here and only here; the
/// two plan variants differ solely in whether the alteration clause is
/// prepended.
fn upgrade_statement(catalog: &str, database: &str, table: &str, also_alter: bool) -> String {
    let mut clauses = Vec::new();
    if also_alter {
        clauses.push(format!(
            "ALTER TABLE {catalog}.{database}.{table} \
             SET TBLPROPERTIES ('format-version' = '{TARGET_FORMAT_VERSION}');"
        ));
    }
    clauses.push(format!(
        "CALL {catalog}.system.rewrite_data_files(\
         table => '{database}.{table}', \
         options => map('rewrite-all', 'true'));"
    ));
    clauses.join("\n")
}

/// Flattens a statement to single-space-joined text.
///
/// The SSH channel runs one logical command per call, so embedded newlines
/// and indentation must be collapsed before submission.
pub fn flatten_sql(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(table_type: Option<&str>, format_version: Option<&str>) -> TableDescriptor {
        TableDescriptor {
            database: "sales".into(),
            name: "orders".into(),
            location: Some("s3://lake-bucket/warehouse/sales.db/orders".into()),
            table_type: table_type.map(|t| t.to_string()),
            format_version: format_version.map(|v| v.to_string()),
            metadata_location: None,
        }
    }

    #[test]
    fn non_iceberg_tables_are_skipped_regardless_of_version() {
        for table_type in [Some("EXTERNAL_TABLE"), Some("hive"), None] {
            for version in [Some("2"), Some("3"), None] {
                let p = plan(&descriptor(table_type, version), "glue_catalog");
                assert!(
                    matches!(p, UpgradePlan::Skip { .. }),
                    "{table_type:?}/{version:?} should be skipped"
                );
            }
        }
    }

    #[test]
    fn iceberg_marker_matches_any_case() {
        for table_type in ["ICEBERG", "iceberg", "Iceberg"] {
            let p = plan(&descriptor(Some(table_type), Some("2")), "glue_catalog");
            assert!(matches!(p, UpgradePlan::AlterAndCompact { .. }));
        }
    }

    #[test]
    fn tables_at_target_version_compact_only() {
        let p = plan(&descriptor(Some("ICEBERG"), Some("3")), "glue_catalog");
        let UpgradePlan::CompactOnly { statement } = p else {
            panic!("expected CompactOnly, got {p:?}");
        };
        assert!(statement.contains("rewrite_data_files"));
        assert!(statement.contains("'rewrite-all', 'true'"));
        assert!(!statement.contains("TBLPROPERTIES"));
    }

    #[test]
    fn tables_below_target_alter_then_compact() {
        for version in [Some("2"), Some("1"), None] {
            let p = plan(&descriptor(Some("ICEBERG"), version), "glue_catalog");
            let UpgradePlan::AlterAndCompact { statement } = p else {
                panic!("expected AlterAndCompact for {version:?}");
            };
            let alter = statement
                .find("ALTER TABLE glue_catalog.sales.orders")
                .expect("alteration clause present");
            let compact = statement
                .find("CALL glue_catalog.system.rewrite_data_files")
                .expect("compaction clause present");
            assert!(alter < compact, "alteration must precede compaction");
            assert!(statement.contains("('format-version' = '3')"));
        }
    }

    #[test]
    fn flattening_collapses_whitespace() {
        let flat = flatten_sql("ALTER TABLE t\n  SET TBLPROPERTIES ('a' = 'b');\nCALL p();");
        assert!(!flat.contains('\n'));
        assert_eq!(
            flat,
            "ALTER TABLE t SET TBLPROPERTIES ('a' = 'b'); CALL p();"
        );
    }
}
