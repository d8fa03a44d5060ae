// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Remote Spark SQL execution on an EMR cluster.
//!
//! Statements run as a single `spark-sql -e` invocation on the cluster's
//! master node over SSH. The channel is synchronous: one statement per round
//! trip, no internal retry, no cancellation once a statement is in flight.
//! Cluster readiness is checked exactly once, when the connection is
//! established; the master address does not change mid-run.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_emr::types::ClusterState;
use openssh::{KnownHosts, Session, SessionBuilder};
use thiserror::Error;
use tracing::{debug, info};

/// The login user on EMR master nodes.
const SSH_USER: &str = "hadoop";

const SSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of one remote statement execution.
///
/// `ok` reflects the remote exit status only; stdout is not parsed for
/// engine-level failure markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Whether the remote command exited zero.
    pub ok: bool,
    /// Captured remote standard output.
    pub stdout: String,
    /// Captured remote standard error.
    pub stderr: String,
}

impl ExecutionResult {
    /// The result reported for a dry run: nothing ran, nothing failed.
    pub fn dry_run() -> ExecutionResult {
        ExecutionResult {
            ok: true,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

/// Errors raised by the execution channel itself.
///
/// A statement that runs remotely but exits non-zero is *not* an error here;
/// that outcome lives in [`ExecutionResult::ok`].
#[derive(Debug, Error)]
pub enum ExecError {
    /// The cluster cannot accept work; nothing was sent.
    #[error("EMR cluster {cluster_id} is not ready (state: {state})")]
    ClusterNotReady {
        /// The cluster that was checked.
        cluster_id: String,
        /// The lifecycle state it reported.
        state: String,
    },
    /// The cluster has no resolvable master address.
    #[error("EMR cluster {cluster_id} has no master public DNS name")]
    NoMasterDns {
        /// The cluster that was checked.
        cluster_id: String,
    },
    /// A failure talking to the EMR control plane.
    #[error("EMR DescribeCluster failed: {0}")]
    Emr(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// A failure in the SSH transport.
    #[error("ssh channel failed: {0}")]
    Ssh(#[from] openssh::Error),
    /// Real execution was requested on an executor built for dry runs.
    #[error("executor is offline; connect to the cluster before executing")]
    Offline,
}

/// Returns an error unless the cluster's lifecycle state can accept work.
///
/// Only `WAITING` (idle, waiting for steps) and `RUNNING` (actively
/// executing) clusters have a usable master node.
pub fn ensure_cluster_ready(cluster_id: &str, state: &ClusterState) -> Result<(), ExecError> {
    if matches!(state, ClusterState::Waiting | ClusterState::Running) {
        Ok(())
    } else {
        Err(ExecError::ClusterNotReady {
            cluster_id: cluster_id.to_string(),
            state: state.as_str().to_string(),
        })
    }
}

/// Sends one SQL statement to the compute cluster.
///
/// With `dry_run` set, implementations must return `ok = true` without any
/// network I/O; the caller is responsible for printing what would have run.
#[async_trait]
pub trait StatementExecutor: Send + Sync {
    /// Executes `sql` remotely, blocking until completion.
    async fn execute(&self, sql: &str, dry_run: bool) -> Result<ExecutionResult, ExecError>;
}

/// The Iceberg-on-Glue Spark configuration attached to every `spark-sql`
/// invocation.
#[derive(Debug, Clone)]
pub struct SparkCatalogConf {
    /// The Spark catalog name the statements are written against.
    pub catalog_name: String,
    /// The S3 bucket holding the Iceberg warehouse.
    pub warehouse_bucket: String,
}

impl SparkCatalogConf {
    /// The `--conf` pairs wiring Spark to the Glue-backed Iceberg catalog.
    pub fn spark_confs(&self) -> Vec<(String, String)> {
        let c = &self.catalog_name;
        vec![
            (
                format!("spark.sql.catalog.{c}"),
                "org.apache.iceberg.spark.SparkCatalog".into(),
            ),
            (
                format!("spark.sql.catalog.{c}.warehouse"),
                format!("s3://{}/warehouse", self.warehouse_bucket),
            ),
            (
                format!("spark.sql.catalog.{c}.catalog-impl"),
                "org.apache.iceberg.aws.glue.GlueCatalog".into(),
            ),
            (
                format!("spark.sql.catalog.{c}.io-impl"),
                "org.apache.iceberg.aws.s3.S3FileIO".into(),
            ),
            (
                "spark.sql.extensions".into(),
                "org.apache.iceberg.spark.extensions.IcebergSparkSessionExtensions".into(),
            ),
        ]
    }
}

struct Connection {
    host: String,
    session: Session,
}

/// A [`StatementExecutor`] that runs `spark-sql` on an EMR master node.
pub struct EmrSparkSql {
    conf: SparkCatalogConf,
    connection: Option<Connection>,
}

impl EmrSparkSql {
    /// Builds an executor with no remote connection.
    ///
    /// Only usable for dry runs; [`StatementExecutor::execute`] with
    /// `dry_run = false` returns [`ExecError::Offline`].
    pub fn offline(conf: SparkCatalogConf) -> EmrSparkSql {
        EmrSparkSql {
            conf,
            connection: None,
        }
    }

    /// Resolves the cluster's master node and opens an SSH session to it.
    ///
    /// Fails fast with [`ExecError::ClusterNotReady`] before anything is
    /// sent when the cluster's lifecycle state cannot accept work.
    pub async fn connect(
        aws: &SdkConfig,
        cluster_id: &str,
        pem_path: &Path,
        conf: SparkCatalogConf,
    ) -> Result<EmrSparkSql, ExecError> {
        let client = aws_sdk_emr::Client::new(aws);
        let resp = client
            .describe_cluster()
            .cluster_id(cluster_id)
            .send()
            .await
            .map_err(|err| ExecError::Emr(Box::new(err)))?;
        let cluster = resp
            .cluster()
            .ok_or_else(|| ExecError::Emr("empty DescribeCluster response".into()))?;
        let state = cluster
            .status()
            .and_then(|status| status.state())
            .ok_or_else(|| ExecError::Emr("DescribeCluster returned no state".into()))?;
        ensure_cluster_ready(cluster_id, state)?;
        let host = cluster
            .master_public_dns_name()
            .ok_or_else(|| ExecError::NoMasterDns {
                cluster_id: cluster_id.to_string(),
            })?
            .to_string();

        info!("connecting to EMR master node {}", host);
        let mut builder = SessionBuilder::default();
        builder
            .user(SSH_USER.to_string())
            .keyfile(pem_path)
            .known_hosts_check(KnownHosts::Accept)
            .connect_timeout(SSH_CONNECT_TIMEOUT);
        let session = builder.connect_mux(&host).await?;

        Ok(EmrSparkSql {
            conf,
            connection: Some(Connection { host, session }),
        })
    }
}

#[async_trait]
impl StatementExecutor for EmrSparkSql {
    async fn execute(&self, sql: &str, dry_run: bool) -> Result<ExecutionResult, ExecError> {
        if dry_run {
            return Ok(ExecutionResult::dry_run());
        }
        let connection = self.connection.as_ref().ok_or(ExecError::Offline)?;

        info!("executing on EMR ({})", connection.host);
        debug!("spark-sql statement: {}", sql);
        let mut command = connection.session.command("spark-sql");
        for (key, value) in self.conf.spark_confs() {
            command.arg("--conf").arg(format!("{key}={value}"));
        }
        command.arg("-e").arg(sql);
        let output = command.output().await?;

        Ok(ExecutionResult {
            ok: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_waiting_and_running_clusters_are_ready() {
        for state in [ClusterState::Waiting, ClusterState::Running] {
            assert!(ensure_cluster_ready("j-CLUSTER", &state).is_ok());
        }
        for state in [
            ClusterState::Starting,
            ClusterState::Bootstrapping,
            ClusterState::Terminating,
            ClusterState::Terminated,
            ClusterState::TerminatedWithErrors,
        ] {
            let err = ensure_cluster_ready("j-CLUSTER", &state).unwrap_err();
            assert!(
                matches!(err, ExecError::ClusterNotReady { .. }),
                "{state:?} should not be ready"
            );
        }
    }

    #[test]
    fn spark_confs_wire_the_named_catalog_to_glue() {
        let conf = SparkCatalogConf {
            catalog_name: "glue_catalog".into(),
            warehouse_bucket: "lake-bucket".into(),
        };
        let confs = conf.spark_confs();
        assert!(confs.contains(&(
            "spark.sql.catalog.glue_catalog.warehouse".into(),
            "s3://lake-bucket/warehouse".into()
        )));
        assert!(confs
            .iter()
            .any(|(k, v)| k == "spark.sql.extensions" && v.contains("IcebergSparkSessionExtensions")));
    }

    #[tokio::test]
    async fn dry_run_needs_no_connection() {
        let executor = EmrSparkSql::offline(SparkCatalogConf {
            catalog_name: "glue_catalog".into(),
            warehouse_bucket: "lake-bucket".into(),
        });
        let result = executor.execute("SELECT 1", true).await.unwrap();
        assert!(result.ok);

        let err = executor.execute("SELECT 1", false).await.unwrap_err();
        assert!(matches!(err, ExecError::Offline));
    }
}
