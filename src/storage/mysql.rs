use mysql_async::{Conn, Opts, OptsBuilder, Pool, PoolConstraints, PoolOpts};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::api::middleware::AppError;
use crate::config::DatabaseConfig;

/// Upper bound on pooled connections per process.
const POOL_MAX: usize = 10;

/// MySQL error codes the one-shot migration tolerates.
const ER_TABLEACCESS_DENIED: u16 = 1142;
const ER_DBACCESS_DENIED: u16 = 1044;
const ER_TABLE_EXISTS: u16 = 1050;

const CATALOG_DDL: &str = "\
CREATE TABLE IF NOT EXISTS `datasets` (\
 `name` VARCHAR(255) NOT NULL,\
 `version` VARCHAR(40) NOT NULL,\
 `is__default` BOOLEAN DEFAULT FALSE,\
 `definition` JSON,\
 `imported` DATETIME DEFAULT CURRENT_TIMESTAMP,\
 `password` VARCHAR(80) NULL,\
 PRIMARY KEY (`name`, `version`)\
)";

/// Owns the process-wide connection pool and the queued-acquisition gauge
/// the admission control reads.
#[derive(Clone)]
pub struct MySqlStorage {
    pool: Pool,
    acquire_timeout: Duration,
    queued: Arc<AtomicUsize>,
}

impl MySqlStorage {
    pub fn new(config: &DatabaseConfig) -> Self {
        let constraints = PoolConstraints::new(0, POOL_MAX).unwrap_or_default();
        let mut builder = OptsBuilder::default()
            .ip_or_hostname(config.host.clone())
            .user(Some(config.user.clone()))
            .pass(config.password.clone())
            .db_name(Some(config.name.clone()))
            .pool_opts(PoolOpts::default().with_constraints(constraints));
        if let Some(socket) = &config.socket_path {
            builder = builder.socket(Some(socket.clone()));
        }
        let opts: Opts = builder.into();

        tracing::info!(
            "connecting to {}@{}/{}",
            config.user,
            config.host,
            config.name
        );

        Self {
            pool: Pool::new(opts),
            acquire_timeout: Duration::from_secs(config.connection_timeout),
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Acquire a connection, waiting at most the configured timeout. The
    /// queued gauge covers the waiting interval only.
    pub async fn conn(&self) -> Result<Conn, AppError> {
        self.queued.fetch_add(1, Ordering::SeqCst);
        let acquired = tokio::time::timeout(self.acquire_timeout, self.pool.get_conn()).await;
        self.queued.fetch_sub(1, Ordering::SeqCst);

        match acquired {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(AppError::Internal(format!("connection failed: {e}"))),
            Err(_) => Err(AppError::Busy(format!(
                "no database connection available within {}s",
                self.acquire_timeout.as_secs()
            ))),
        }
    }

    /// Queries currently waiting on pool acquisition.
    pub fn queued_queries(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// One-shot idempotent catalog migration at startup. "Already exists"
    /// and "access denied" outcomes are ignored so read-only deployments
    /// still come up.
    pub async fn migrate(&self) -> Result<(), AppError> {
        use mysql_async::prelude::*;

        let mut conn = self.conn().await?;
        match conn.query_drop(CATALOG_DDL).await {
            Ok(()) => Ok(()),
            Err(mysql_async::Error::Server(server))
                if matches!(
                    server.code,
                    ER_TABLE_EXISTS | ER_TABLEACCESS_DENIED | ER_DBACCESS_DENIED
                ) =>
            {
                tracing::debug!("catalog migration skipped: {}", server);
                Ok(())
            }
            Err(e) => Err(AppError::Internal(format!("catalog migration failed: {e}"))),
        }
    }

    pub async fn disconnect(self) {
        if let Err(e) = self.pool.disconnect().await {
            tracing::warn!("pool shutdown error: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DatabaseConfig {
        DatabaseConfig {
            host: "localhost".into(),
            name: "ddf_test".into(),
            user: "ddf".into(),
            password: None,
            socket_path: None,
            connection_timeout: 1,
            max_columns: 1000,
        }
    }

    #[test]
    fn test_queued_gauge_starts_empty() {
        let storage = MySqlStorage::new(&config());
        assert_eq!(storage.queued_queries(), 0);
    }

    #[tokio::test]
    async fn test_acquire_timeout_maps_to_busy() {
        // No server listening: acquisition either fails fast (Internal) or
        // waits out the timeout (Busy). Both release the gauge.
        let storage = MySqlStorage::new(&config());
        let result = storage.conn().await;
        assert!(result.is_err());
        assert_eq!(storage.queued_queries(), 0);
    }
}
