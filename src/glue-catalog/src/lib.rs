// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Inspection of Iceberg table metadata in the AWS Glue Data Catalog.
//!
//! Glue is the source of truth for table format metadata. Nothing here is
//! cached: every call reads the catalog fresh, because table properties can
//! change between (and during) tool invocations.

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_glue::types::Table;
use thiserror::Error;
use tracing::debug;

/// The `table_type` parameter value that marks a Glue entry as an Iceberg
/// table. Compared case-insensitively; Glue preserves whatever casing the
/// writing engine used.
pub const ICEBERG_TABLE_TYPE: &str = "ICEBERG";

/// Table metadata as recorded in the Glue catalog.
///
/// All fields other than the identity are optional because Glue table
/// parameters are free-form: a table written by a non-Iceberg engine may
/// carry none of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    /// The Glue database the table lives in.
    pub database: String,
    /// The table name.
    pub name: String,
    /// The table's storage location URI.
    pub location: Option<String>,
    /// The declared table format kind (`table_type` parameter).
    pub table_type: Option<String>,
    /// The declared Iceberg format version (`format-version` parameter).
    pub format_version: Option<String>,
    /// Pointer to the current Iceberg metadata file.
    pub metadata_location: Option<String>,
}

impl TableDescriptor {
    /// Whether the descriptor names an Iceberg table.
    pub fn is_iceberg(&self) -> bool {
        self.table_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case(ICEBERG_TABLE_TYPE))
    }

    /// The declared format version, or `UNKNOWN` when the parameter is
    /// absent.
    pub fn format_version_or_unknown(&self) -> &str {
        self.format_version.as_deref().unwrap_or("UNKNOWN")
    }

    fn from_glue(database: &str, table: &Table) -> TableDescriptor {
        let parameter = |key: &str| {
            table
                .parameters()
                .and_then(|params| params.get(key))
                .cloned()
        };
        TableDescriptor {
            database: database.to_string(),
            name: table.name().to_string(),
            location: table
                .storage_descriptor()
                .and_then(|sd| sd.location())
                .map(|l| l.to_string()),
            table_type: parameter("table_type"),
            format_version: parameter("format-version"),
            metadata_location: parameter("metadata_location"),
        }
    }
}

/// Errors surfaced by catalog inspection.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The catalog has no entry for the table. Callers treat this as
    /// "cannot plan" rather than a hard error.
    #[error("table {database}.{table} not found in Glue")]
    NotFound {
        /// The database that was searched.
        database: String,
        /// The table that was not found.
        table: String,
    },
    /// Any other failure talking to Glue.
    #[error("Glue request failed: {0}")]
    Glue(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Read access to table metadata.
///
/// The batch orchestrator and the CLI consume this trait rather than the
/// Glue client directly so they can be exercised against in-memory catalogs
/// in tests.
#[async_trait]
pub trait TableCatalog: Send + Sync {
    /// Fetches the descriptor for a single table.
    async fn describe(&self, database: &str, table: &str)
    -> Result<TableDescriptor, CatalogError>;

    /// Lists every Iceberg table in a database.
    ///
    /// Non-Iceberg entries are filtered out; the result is a fresh catalog
    /// read each call.
    async fn list_iceberg_tables(
        &self,
        database: &str,
    ) -> Result<Vec<TableDescriptor>, CatalogError>;
}

/// A [`TableCatalog`] backed by the AWS Glue Data Catalog.
#[derive(Debug, Clone)]
pub struct GlueCatalog {
    client: aws_sdk_glue::Client,
}

impl GlueCatalog {
    /// Constructs a catalog from shared AWS configuration.
    pub fn new(config: &SdkConfig) -> GlueCatalog {
        GlueCatalog {
            client: aws_sdk_glue::Client::new(config),
        }
    }
}

#[async_trait]
impl TableCatalog for GlueCatalog {
    async fn describe(
        &self,
        database: &str,
        table: &str,
    ) -> Result<TableDescriptor, CatalogError> {
        debug!("fetching Glue metadata for {}.{}", database, table);
        let resp = self
            .client
            .get_table()
            .database_name(database)
            .name(table)
            .send()
            .await;
        match resp {
            Ok(out) => {
                let tbl = out.table().ok_or_else(|| CatalogError::NotFound {
                    database: database.to_string(),
                    table: table.to_string(),
                })?;
                Ok(TableDescriptor::from_glue(database, tbl))
            }
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_entity_not_found_exception())
                {
                    Err(CatalogError::NotFound {
                        database: database.to_string(),
                        table: table.to_string(),
                    })
                } else {
                    Err(CatalogError::Glue(Box::new(err)))
                }
            }
        }
    }

    async fn list_iceberg_tables(
        &self,
        database: &str,
    ) -> Result<Vec<TableDescriptor>, CatalogError> {
        debug!("listing Iceberg tables in Glue database {}", database);
        let mut tables = Vec::new();
        let mut pages = self
            .client
            .get_tables()
            .database_name(database)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|err| CatalogError::Glue(Box::new(err)))?;
            for tbl in page.table_list() {
                let descriptor = TableDescriptor::from_glue(database, tbl);
                if descriptor.is_iceberg() {
                    tables.push(descriptor);
                }
            }
        }
        Ok(tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(table_type: Option<&str>) -> TableDescriptor {
        TableDescriptor {
            database: "sales".into(),
            name: "orders".into(),
            location: Some("s3://bucket/warehouse/sales.db/orders".into()),
            table_type: table_type.map(|t| t.to_string()),
            format_version: Some("2".into()),
            metadata_location: None,
        }
    }

    #[test]
    fn iceberg_marker_is_case_insensitive() {
        for t in ["ICEBERG", "iceberg", "Iceberg"] {
            assert!(descriptor(Some(t)).is_iceberg(), "{t} should match");
        }
    }

    #[test]
    fn non_iceberg_kinds_do_not_match() {
        for t in [Some("EXTERNAL_TABLE"), Some("hive"), Some(""), None] {
            assert!(!descriptor(t).is_iceberg(), "{t:?} should not match");
        }
    }

    #[test]
    fn missing_format_version_reads_as_unknown() {
        let mut d = descriptor(Some("ICEBERG"));
        d.format_version = None;
        assert_eq!(d.format_version_or_unknown(), "UNKNOWN");
    }
}
