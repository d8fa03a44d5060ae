// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Lake Formation permission grants.
//!
//! The EMR instance role needs catalog-level permissions before it can
//! alter table properties or rewrite data files. Grants are idempotent:
//! a grant that already exists is success, not an error.

use anyhow::{anyhow, Context};
use aws_config::SdkConfig;
use aws_sdk_lakeformation::error::DisplayErrorContext;
use aws_sdk_lakeformation::types::{
    DataLakePrincipal, DatabaseResource, Permission, Resource, TableResource, TableWildcard,
};
use tracing::info;

/// Arguments for the `grant` subcommand.
#[derive(Debug, clap::Args)]
pub struct GrantArgs {
    /// ARN of the principal (e.g. the EMR instance role) to grant to.
    #[clap(short, long)]
    principal: String,
    /// Glue database to grant on.
    #[clap(short, long)]
    database: String,
    /// Grant on a single table in addition to the database.
    #[clap(short, long, conflicts_with = "all_tables")]
    table: Option<String>,
    /// Grant on every table in the database in addition to the database.
    #[clap(long)]
    all_tables: bool,
}

const DATABASE_PERMISSIONS: &[Permission] = &[
    Permission::All,
    Permission::Alter,
    Permission::CreateTable,
    Permission::Describe,
    Permission::Drop,
];

const TABLE_PERMISSIONS: &[Permission] = &[
    Permission::All,
    Permission::Alter,
    Permission::Describe,
    Permission::Drop,
    Permission::Select,
    Permission::Insert,
    Permission::Delete,
];

/// Whether a grant failure means the permissions were already in place.
fn already_exists(message: &str) -> bool {
    message.contains("AlreadyExists")
}

/// Fetches the caller's AWS account id, which Lake Formation uses as the
/// catalog id.
async fn account_id(aws: &SdkConfig) -> Result<String, anyhow::Error> {
    let sts = aws_sdk_sts::Client::new(aws);
    let identity = sts
        .get_caller_identity()
        .send()
        .await
        .context("retrieving AWS account id from STS")?;
    identity
        .account()
        .map(|a| a.to_string())
        .ok_or_else(|| anyhow!("STS did not return an account id"))
}

async fn grant(
    client: &aws_sdk_lakeformation::Client,
    principal: &str,
    resource: Resource,
    permissions: &[Permission],
    what: &str,
) -> Result<(), anyhow::Error> {
    info!("granting permissions on {} to {}", what, principal);
    let result = client
        .grant_permissions()
        .principal(
            DataLakePrincipal::builder()
                .data_lake_principal_identifier(principal)
                .build(),
        )
        .resource(resource)
        .set_permissions(Some(permissions.to_vec()))
        .set_permissions_with_grant_option(Some(permissions.to_vec()))
        .send()
        .await;
    match result {
        Ok(_) => {
            info!("granted permissions on {}", what);
            Ok(())
        }
        Err(err) => {
            let message = format!("{}", DisplayErrorContext(&err));
            if already_exists(&message) {
                info!("permissions on {} already in place", what);
                Ok(())
            } else {
                Err(anyhow!("granting permissions on {what}: {message}"))
            }
        }
    }
}

/// Grants database-level (and optionally table-level) Lake Formation
/// permissions to a principal.
pub async fn run(aws: &SdkConfig, args: &GrantArgs) -> Result<(), anyhow::Error> {
    let account_id = account_id(aws).await?;
    let client = aws_sdk_lakeformation::Client::new(aws);

    let database_resource = Resource::builder()
        .database(
            DatabaseResource::builder()
                .catalog_id(&account_id)
                .name(&args.database)
                .build()
                .context("building database resource")?,
        )
        .build();
    grant(
        &client,
        &args.principal,
        database_resource,
        DATABASE_PERMISSIONS,
        &format!("database {}", args.database),
    )
    .await?;

    let table_resource = if let Some(table) = &args.table {
        let resource = Resource::builder()
            .table(
                TableResource::builder()
                    .catalog_id(&account_id)
                    .database_name(&args.database)
                    .name(table)
                    .build()
                    .context("building table resource")?,
            )
            .build();
        Some((resource, format!("table {}.{}", args.database, table)))
    } else if args.all_tables {
        let resource = Resource::builder()
            .table(
                TableResource::builder()
                    .catalog_id(&account_id)
                    .database_name(&args.database)
                    .table_wildcard(TableWildcard::builder().build())
                    .build()
                    .context("building table wildcard resource")?,
            )
            .build();
        Some((resource, format!("all tables in {}", args.database)))
    } else {
        None
    };

    if let Some((resource, what)) = table_resource {
        grant(&client, &args.principal, resource, TABLE_PERMISSIONS, &what).await?;
    }

    Ok(())
}
