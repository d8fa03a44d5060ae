// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Environment-sourced configuration.
//!
//! Every setting can be supplied as a flag or an environment variable;
//! nothing is persisted between runs. AWS region and credentials come from
//! the standard `aws-config` environment chain and are not duplicated here.

use std::path::PathBuf;

use anyhow::bail;

/// Settings shared across subcommands, each backed by an environment
/// variable. Validation of which settings are required happens per
/// subcommand, not here: a dry run or a listing needs far less than a real
/// upgrade.
#[derive(Debug, Clone, clap::Args)]
pub struct ConfigArgs {
    /// The EMR cluster that runs the Spark SQL statements.
    #[clap(long, env = "EMR_CLUSTER_ID", global = true)]
    pub emr_cluster_id: Option<String>,
    /// Path to the PEM key used to SSH into the EMR master node.
    #[clap(long, env = "EMR_PEM_PATH", global = true)]
    pub emr_pem_path: Option<PathBuf>,
    /// The S3 bucket holding the Iceberg warehouse.
    #[clap(long, env = "S3_BUCKET", global = true)]
    pub s3_bucket: Option<String>,
    /// The Spark catalog name bound to the Glue Data Catalog.
    #[clap(long, env = "CATALOG_NAME", default_value = "glue_catalog", global = true)]
    pub catalog_name: String,
    /// The Databricks workspace URL.
    #[clap(long, env = "DATABRICKS_HOST", global = true)]
    pub databricks_host: Option<String>,
    /// The Databricks personal access token.
    #[clap(long, env = "DATABRICKS_TOKEN", hide_env_values = true, global = true)]
    pub databricks_token: Option<String>,
}

/// The settings a real (non-dry-run) upgrade needs.
#[derive(Debug, Clone)]
pub struct EmrSettings {
    /// The cluster to execute on.
    pub cluster_id: String,
    /// SSH key for the master node.
    pub pem_path: PathBuf,
    /// The warehouse bucket wired into the Spark catalog configuration.
    pub warehouse_bucket: String,
}

impl ConfigArgs {
    /// Validates the settings required to execute statements on EMR.
    pub fn emr(&self) -> Result<EmrSettings, anyhow::Error> {
        if let (Some(cluster_id), Some(pem_path), Some(warehouse_bucket)) =
            (&self.emr_cluster_id, &self.emr_pem_path, &self.s3_bucket)
        {
            return Ok(EmrSettings {
                cluster_id: cluster_id.clone(),
                pem_path: pem_path.clone(),
                warehouse_bucket: warehouse_bucket.clone(),
            });
        }
        let mut missing = Vec::new();
        if self.emr_cluster_id.is_none() {
            missing.push("EMR_CLUSTER_ID");
        }
        if self.emr_pem_path.is_none() {
            missing.push("EMR_PEM_PATH");
        }
        if self.s3_bucket.is_none() {
            missing.push("S3_BUCKET");
        }
        bail!("missing required configuration: {}", missing.join(", "))
    }

    /// Validates the settings required to talk to Databricks.
    pub fn databricks(&self) -> Result<(String, String), anyhow::Error> {
        match (&self.databricks_host, &self.databricks_token) {
            (Some(host), Some(token)) => Ok((host.clone(), token.clone())),
            _ => bail!("missing required configuration: DATABRICKS_HOST and DATABRICKS_TOKEN"),
        }
    }

    fn settings(&self) -> Vec<(&'static str, Option<String>)> {
        vec![
            ("EMR_CLUSTER_ID", self.emr_cluster_id.clone()),
            (
                "EMR_PEM_PATH",
                self.emr_pem_path
                    .as_ref()
                    .map(|p| p.display().to_string()),
            ),
            ("S3_BUCKET", self.s3_bucket.clone()),
            ("CATALOG_NAME", Some(self.catalog_name.clone())),
            ("DATABRICKS_HOST", self.databricks_host.clone()),
            ("DATABRICKS_TOKEN", self.databricks_token.clone()),
        ]
    }
}

const SECRET_KEY_MARKERS: &[&str] = &["TOKEN", "SECRET", "PASSWORD", "KEY"];

/// Masks a setting's value when its key looks secret-bearing, keeping the
/// last four characters for recognizability.
pub fn mask_secret(key: &str, value: &str) -> String {
    let upper = key.to_uppercase();
    if SECRET_KEY_MARKERS.iter().any(|m| upper.contains(m)) {
        let tail: String = value
            .chars()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("********{tail}")
    } else {
        value.to_string()
    }
}

/// Prints the resolved configuration with secrets masked.
pub fn print_settings(args: &ConfigArgs) {
    println!("{:=<60}", "");
    println!("CONFIGURATION");
    println!("{:=<60}", "");
    for (key, value) in args.settings() {
        match value {
            Some(value) => println!("  {key}: {}", mask_secret(key, &value)),
            None => println!("  {key}: (not set)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> ConfigArgs {
        ConfigArgs {
            emr_cluster_id: Some("j-2AXXXXXXGAPLF".into()),
            emr_pem_path: Some("/home/op/emr.pem".into()),
            s3_bucket: Some("lake-bucket".into()),
            catalog_name: "glue_catalog".into(),
            databricks_host: Some("https://dbc-1234.cloud.databricks.com".into()),
            databricks_token: Some("dapi0123456789abcdef".into()),
        }
    }

    #[test]
    fn secret_bearing_keys_are_masked() {
        assert_eq!(
            mask_secret("DATABRICKS_TOKEN", "dapi0123456789abcdef"),
            "********cdef"
        );
        assert_eq!(
            mask_secret("AWS_SECRET_ACCESS_KEY", "abcdefgh"),
            "********efgh"
        );
        assert_eq!(mask_secret("S3_BUCKET", "lake-bucket"), "lake-bucket");
        assert_eq!(mask_secret("EMR_PEM_PATH", "/home/op/emr.pem"), "/home/op/emr.pem");
    }

    #[test]
    fn emr_validation_names_every_missing_setting() {
        let mut incomplete = args();
        incomplete.emr_cluster_id = None;
        incomplete.s3_bucket = None;
        let err = incomplete.emr().unwrap_err().to_string();
        assert!(err.contains("EMR_CLUSTER_ID"));
        assert!(err.contains("S3_BUCKET"));
        assert!(!err.contains("EMR_PEM_PATH"));
    }

    #[test]
    fn complete_settings_validate() {
        let settings = args().emr().unwrap();
        assert_eq!(settings.cluster_id, "j-2AXXXXXXGAPLF");
        assert_eq!(settings.warehouse_bucket, "lake-bucket");
        let (host, _token) = args().databricks().unwrap();
        assert_eq!(host, "https://dbc-1234.cloud.databricks.com");
    }
}
