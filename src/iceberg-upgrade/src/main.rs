// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Operational tool that upgrades Iceberg tables from format version 2 to 3.
//!
//! The upgrade runs `ALTER TABLE ... SET TBLPROPERTIES` plus a rewrite-all
//! compaction as Spark SQL on an EMR cluster, driven by table metadata read
//! from the Glue Data Catalog. A separate `verify` mode checks that the
//! upgraded table is readable from Databricks.

use std::process;

use anyhow::bail;
use aws_config::BehaviorVersion;
use clap::{Parser, Subcommand};
use emr_exec::{EmrSparkSql, SparkCatalogConf};
use glue_catalog::{GlueCatalog, TableCatalog};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::batch::TableSelector;
use crate::plan::TARGET_FORMAT_VERSION;
use crate::verify::{DatabricksEngine, VerifyOutcome};

mod batch;
mod config;
mod grant;
mod plan;
mod verify;

static ENV_FILTER: &str =
    "iceberg_upgrade=info,glue_catalog=info,emr_exec=info,databricks_client=info";

#[derive(Debug, Parser)]
#[clap(name = "iceberg-upgrade", next_line_help = true)]
struct Cli {
    #[clap(flatten)]
    settings: config::ConfigArgs,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Upgrade Iceberg tables in a Glue database to format version 3.
    Upgrade(UpgradeArgs),
    /// Verify that a table is readable from Databricks.
    Verify(VerifyArgs),
    /// Grant Lake Formation permissions on catalog entries.
    Grant(grant::GrantArgs),
    /// Print the resolved configuration with secrets masked.
    Config,
}

#[derive(Debug, clap::Args)]
struct UpgradeArgs {
    /// The Glue database name.
    #[clap(short, long)]
    database: String,
    /// A single table to upgrade.
    #[clap(short, long, conflicts_with_all = ["tables", "all"])]
    table: Option<String>,
    /// A comma-separated list of tables to upgrade, in order.
    #[clap(long, value_delimiter = ',', conflicts_with = "all")]
    tables: Option<Vec<String>>,
    /// Upgrade every Iceberg table in the database not yet on the target
    /// version.
    #[clap(long)]
    all: bool,
    /// Print what would be executed without running anything remotely.
    #[clap(long)]
    dry_run: bool,
    /// List tables and their format versions instead of upgrading.
    #[clap(long)]
    list: bool,
}

impl UpgradeArgs {
    fn selector(&self) -> Result<TableSelector, anyhow::Error> {
        match (&self.table, &self.tables, self.all) {
            (Some(table), None, false) => Ok(TableSelector::One(table.clone())),
            (None, Some(tables), false) => Ok(TableSelector::Many(
                tables.iter().map(|t| t.trim().to_string()).collect(),
            )),
            (None, None, true) => Ok(TableSelector::All),
            _ => bail!("specify exactly one of --table, --tables, or --all"),
        }
    }
}

#[derive(Debug, clap::Args)]
struct VerifyArgs {
    /// The Databricks catalog name.
    #[clap(short, long)]
    catalog: String,
    /// The database (schema) name.
    #[clap(short, long)]
    database: String,
    /// The table name.
    #[clap(short, long)]
    table: String,
    /// The SQL warehouse to run the probes on; defaults to the first
    /// running warehouse in the workspace.
    #[clap(short, long)]
    warehouse: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .without_time();
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new(ENV_FILTER))
        .with(stdout_layer)
        .try_init();

    // Batch failures are reported in the summary, not the exit code:
    // partial success is the common case for an operational migration
    // tool, so the run itself completing is not an error.
    if let Err(err) = run(cli).await {
        error!("iceberg-upgrade: {:#}", err);
    }
}

async fn run(cli: Cli) -> Result<(), anyhow::Error> {
    match cli.command {
        Command::Upgrade(args) => upgrade(&cli.settings, &args).await,
        Command::Verify(args) => verify(&cli.settings, &args).await,
        Command::Grant(args) => {
            let aws = aws_config::load_defaults(BehaviorVersion::latest()).await;
            grant::run(&aws, &args).await
        }
        Command::Config => {
            config::print_settings(&cli.settings);
            Ok(())
        }
    }
}

async fn upgrade(settings: &config::ConfigArgs, args: &UpgradeArgs) -> Result<(), anyhow::Error> {
    let aws = aws_config::load_defaults(BehaviorVersion::latest()).await;
    let catalog = GlueCatalog::new(&aws);

    if args.list {
        return list_format_versions(&catalog, &args.database).await;
    }

    let selector = match args.selector() {
        Ok(selector) => selector,
        Err(err) => {
            eprintln!("error: {err}");
            eprintln!(
                "usage: iceberg-upgrade upgrade --database <DATABASE> \
                 <--table <TABLE>|--tables <TABLES>|--all>"
            );
            process::exit(2);
        }
    };

    let executor = if args.dry_run {
        EmrSparkSql::offline(SparkCatalogConf {
            catalog_name: settings.catalog_name.clone(),
            warehouse_bucket: settings.s3_bucket.clone().unwrap_or_default(),
        })
    } else {
        let emr = settings.emr()?;
        EmrSparkSql::connect(
            &aws,
            &emr.cluster_id,
            &emr.pem_path,
            SparkCatalogConf {
                catalog_name: settings.catalog_name.clone(),
                warehouse_bucket: emr.warehouse_bucket,
            },
        )
        .await?
    };

    let ledger = batch::run_batch(
        &catalog,
        &executor,
        &settings.catalog_name,
        &args.database,
        selector,
        args.dry_run,
    )
    .await?;
    batch::print_summary(&args.database, &ledger, args.dry_run);
    Ok(())
}

async fn list_format_versions(
    catalog: &dyn TableCatalog,
    database: &str,
) -> Result<(), anyhow::Error> {
    let tables = catalog.list_iceberg_tables(database).await?;
    if tables.is_empty() {
        println!("no Iceberg tables in {database}");
        return Ok(());
    }
    println!("Iceberg tables in {database}:");
    for descriptor in &tables {
        let marker = if descriptor.format_version.as_deref() == Some(TARGET_FORMAT_VERSION) {
            "ok"
        } else {
            "needs upgrade"
        };
        println!(
            "  {0: <40} format-version: {1: <8} {2}",
            descriptor.name,
            descriptor.format_version_or_unknown(),
            marker
        );
    }
    Ok(())
}

async fn verify(settings: &config::ConfigArgs, args: &VerifyArgs) -> Result<(), anyhow::Error> {
    let (host, token) = settings.databricks()?;
    let client = databricks_client::Client::new(&host, token)?;

    let warehouse_id = match &args.warehouse {
        Some(id) => id.clone(),
        None => {
            let warehouse = client.first_running_warehouse().await?;
            info!("using warehouse {} ({})", warehouse.name, warehouse.id);
            warehouse.id
        }
    };

    let engine = DatabricksEngine {
        client,
        warehouse_id,
    };
    let outcome =
        verify::verify_table(&engine, &args.catalog, &args.database, &args.table).await;

    let full_name = format!("{}.{}.{}", args.catalog, args.database, args.table);
    match &outcome {
        VerifyOutcome::Passed { total_rows } => {
            println!("verification passed: {full_name} is readable from Databricks");
            if let Some(total_rows) = total_rows {
                println!("  total rows: {total_rows}");
            }
        }
        VerifyOutcome::DescribeFailed { error } => {
            println!("verification failed: cannot describe {full_name}: {error}");
        }
        VerifyOutcome::ReadFailed {
            error,
            format_related,
        } => {
            println!("verification failed: cannot read {full_name}: {error}");
            if *format_related {
                println!(
                    "  the error names the table format; the table likely still \
                     carries old-format files. Re-run the upgrade against it."
                );
            }
        }
    }
    Ok(())
}
