//! Database connection facade.
//!
//! The bulk-insert operator only needs `execute(sql, params)`; keeping it
//! behind the [`Connection`] trait lets the operator run against a stub
//! in tests. The production [`PgPool`] renders parameters as SQL literals
//! and drives the statement over the simple query protocol, which is what
//! allows the trailing `FLUSH;` to ride in the same execution as the
//! INSERT.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::error::ConnectionError;
use crate::row::Datum;

/// Maximum pooled connections.
const MAX_POOL_SIZE: usize = 1000;
/// Readiness probe attempts before giving up on startup.
const CONNECT_RETRIES: usize = 10;
/// Delay between readiness probes.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Execute-only access to the database.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Executes `sql` with `params` bound to its `$n` placeholders.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] when a connection cannot be acquired
    /// or the database rejects the statement.
    async fn execute(&self, sql: &str, params: &[Datum]) -> Result<(), ConnectionError>;
}

/// Shared connection pool over the target database.
#[derive(Clone)]
pub struct PgPool {
    pool: deadpool_postgres::Pool,
}

impl PgPool {
    /// Builds a pool from a DSN without touching the network.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Pool`] for an invalid DSN.
    pub fn from_dsn(dsn: &str) -> Result<Self, ConnectionError> {
        let pg_config: tokio_postgres::Config = dsn
            .parse()
            .map_err(|e| ConnectionError::Pool(format!("invalid connection string: {e}")))?;

        let mgr_config = deadpool_postgres::ManagerConfig {
            recycling_method: deadpool_postgres::RecyclingMethod::Fast,
        };
        let mgr = deadpool_postgres::Manager::from_config(
            pg_config,
            tokio_postgres::NoTls,
            mgr_config,
        );

        let pool = deadpool_postgres::Pool::builder(mgr)
            .max_size(MAX_POOL_SIZE)
            .build()
            .map_err(|e| ConnectionError::Pool(format!("pool creation failed: {e}")))?;

        Ok(Self { pool })
    }

    /// Builds a pool and waits for the database to answer a ping,
    /// retrying a bounded number of times.
    ///
    /// # Errors
    ///
    /// Returns the last probe error if the database never becomes ready.
    pub async fn connect(dsn: &str) -> Result<Self, ConnectionError> {
        let pool = Self::from_dsn(dsn)?;
        let mut last_err = ConnectionError::Pool("database never became ready".into());
        for _ in 0..CONNECT_RETRIES {
            match pool.ping().await {
                Ok(()) => return Ok(pool),
                Err(e) => {
                    warn!(error = %e, "database not ready, retrying");
                    last_err = e;
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }
        Err(last_err)
    }

    /// Round-trips `SELECT 1`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] when the probe fails.
    pub async fn ping(&self) -> Result<(), ConnectionError> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| ConnectionError::Pool(e.to_string()))?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| ConnectionError::Exec(e.to_string()))?;
        Ok(())
    }

    /// The underlying deadpool handle, for catalog and ad-hoc queries.
    #[must_use]
    pub fn pool(&self) -> &deadpool_postgres::Pool {
        &self.pool
    }
}

#[async_trait]
impl Connection for PgPool {
    async fn execute(&self, sql: &str, params: &[Datum]) -> Result<(), ConnectionError> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| ConnectionError::Pool(e.to_string()))?;
        let rendered = interpolate(sql, params)?;
        client
            .batch_execute(&rendered)
            .await
            .map_err(|e| ConnectionError::Exec(e.to_string()))?;
        Ok(())
    }
}

/// Substitutes every `$n` placeholder with the rendered literal of
/// `params[n - 1]`. Placeholders only ever appear in builder-generated
/// text, never inside data (data travels in `params`), so a plain scan
/// is sufficient.
fn interpolate(sql: &str, params: &[Datum]) -> Result<String, ConnectionError> {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len() + params.len() * 8);
    let mut last = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1].is_ascii_digit() {
            out.push_str(&sql[last..i]);
            let mut end = i + 1;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            let n: usize = sql[i + 1..end]
                .parse()
                .map_err(|_| ConnectionError::Exec(format!("bad placeholder in: {sql}")))?;
            let datum = n
                .checked_sub(1)
                .and_then(|idx| params.get(idx))
                .ok_or_else(|| {
                    ConnectionError::Exec(format!("placeholder ${n} out of range"))
                })?;
            datum.write_sql_literal(&mut out);
            last = end;
            i = end;
        } else {
            i += 1;
        }
    }
    out.push_str(&sql[last..]);
    Ok(out)
}
