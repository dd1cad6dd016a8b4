//! Management of the MySQL root account.
//!
//! The operator connects to the first pod of the MySQL Server StatefulSet
//! with a dedicated operator account (provisioned by the server init
//! scripts) and creates, renames or drops the root user to match the spec.

use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use mysql_async::prelude::Queryable;
use mysql_async::{Opts, OptsBuilder, Pool, PoolConstraints, PoolOpts};
use thiserror::Error;
use tracing::info;

use crate::crd::MYSQLD_PORT;

const NDB_OPERATOR_USER: &str = "ndb-operator-user";
const NDB_OPERATOR_PASSWORD: &str = "Operator@123";

/// Timeout for establishing a connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Maximum lifetime of a pooled connection.
const CONN_MAX_LIFETIME: Duration = Duration::from_secs(180);
/// Pool bounds, matching the recommended driver settings.
const POOL_MIN: usize = 10;
const POOL_MAX: usize = 10;

/// Errors from root account management.
#[derive(Error, Debug)]
pub enum SqlError {
    #[error("MySQL error: {0}")]
    Mysql(#[from] mysql_async::Error),

    #[error("timed out connecting to MySQL Server at {0}")]
    ConnectTimeout(String),
}

/// DNS name of the first MySQL Server pod governed by the StatefulSet.
fn mysqld_host(mysqld_sfset: &StatefulSet) -> String {
    let name = mysqld_sfset.metadata.name.clone().unwrap_or_default();
    let namespace = mysqld_sfset.metadata.namespace.clone().unwrap_or_default();
    let service = mysqld_sfset
        .spec
        .as_ref()
        .and_then(|s| s.service_name.clone())
        .unwrap_or_default();
    format!("{name}-0.{service}.{namespace}")
}

/// Escape a string for interpolation inside single quotes. Account names
/// cannot be bound as statement parameters.
fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn pool_for(host: &str) -> Pool {
    let constraints = PoolConstraints::new(POOL_MIN, POOL_MAX).unwrap_or_default();
    let opts: Opts = OptsBuilder::default()
        .ip_or_hostname(host)
        .tcp_port(MYSQLD_PORT as u16)
        .user(Some(NDB_OPERATOR_USER))
        .pass(Some(NDB_OPERATOR_PASSWORD))
        .pool_opts(
            PoolOpts::default()
                .with_constraints(constraints)
                .with_abs_conn_ttl(Some(CONN_MAX_LIFETIME)),
        )
        .into();
    Pool::new(opts)
}

/// Run the given statements against the first MySQL Server pod, releasing
/// the pool on every exit path.
async fn run_statements(mysqld_sfset: &StatefulSet, statements: &[String]) -> Result<(), SqlError> {
    let host = mysqld_host(mysqld_sfset);
    let pool = pool_for(&host);

    let result = async {
        let mut conn = tokio::time::timeout(CONNECT_TIMEOUT, pool.get_conn())
            .await
            .map_err(|_| SqlError::ConnectTimeout(host.clone()))??;
        for statement in statements {
            conn.query_drop(statement.as_str()).await?;
        }
        Ok(())
    }
    .await;

    pool.disconnect().await?;
    result
}

/// Create the root user, if it does not exist, with full privileges.
pub async fn create_root_user_if_not_exists(
    mysqld_sfset: &StatefulSet,
    root_host: &str,
    password: &str,
) -> Result<(), SqlError> {
    let host = escape(root_host);
    info!(root_host, "Creating MySQL root user");
    run_statements(
        mysqld_sfset,
        &[
            format!(
                "CREATE USER IF NOT EXISTS 'root'@'{host}' IDENTIFIED BY '{}'",
                escape(password)
            ),
            format!("GRANT ALL PRIVILEGES ON *.* TO 'root'@'{host}' WITH GRANT OPTION"),
            "FLUSH PRIVILEGES".to_string(),
        ],
    )
    .await
}

/// Move the root user to a new host.
pub async fn update_root_user(
    mysqld_sfset: &StatefulSet,
    existing_root_host: &str,
    new_root_host: &str,
) -> Result<(), SqlError> {
    info!(
        from = existing_root_host,
        to = new_root_host,
        "Updating MySQL root user host"
    );
    run_statements(
        mysqld_sfset,
        &[format!(
            "RENAME USER 'root'@'{}' TO 'root'@'{}'",
            escape(existing_root_host),
            escape(new_root_host)
        )],
    )
    .await
}

/// Drop the root user if it exists.
pub async fn delete_root_user_if_exists(
    mysqld_sfset: &StatefulSet,
    root_host: &str,
) -> Result<(), SqlError> {
    info!(root_host, "Dropping MySQL root user");
    run_statements(
        mysqld_sfset,
        &[format!("DROP USER IF EXISTS 'root'@'{}'", escape(root_host))],
    )
    .await
}
