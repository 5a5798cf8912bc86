//! DuckDB backend implementation.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::config::DuckDbConfig;
use crate::dialect::DuckDbDialect;
use crate::error::{CostViewError, Result};
use crate::executor::{ColumnMeta, QueryResult};

use super::BackendConnection;

type Pool = Arc<Mutex<Vec<duckdb::Connection>>>;

/// DuckDB connection implementing the unified backend trait.
///
/// All pooled connections are clones of one database handle, so concurrent
/// queries share a single file lock.
#[derive(Clone)]
pub struct DuckDbConnection {
    database_path: PathBuf,
    dialect: DuckDbDialect,
    limiter: Arc<Semaphore>,
    root: Arc<Mutex<Option<duckdb::Connection>>>,
    pool: Pool,
}

/// A connection checked out of the pool. Dropping it hands the connection
/// back, whether the query succeeded, failed or its task was abandoned.
struct PooledConnection {
    conn: Option<duckdb::Connection>,
    pool: Pool,
}

impl PooledConnection {
    fn get(&self) -> Result<&duckdb::Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| CostViewError::Execution("pooled connection released".to_string()))
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let mut guard = lock(&self.pool);
            guard.push(conn);
            tracing::trace!(pool_size = guard.len(), "returned DuckDB connection to pool");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DuckDbConnection {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self::with_config(path, &DuckDbConfig::default())
    }

    pub fn with_config<P: AsRef<Path>>(path: P, config: &DuckDbConfig) -> Self {
        let path = path.as_ref().to_path_buf();
        tracing::info!(
            path = %path.display(),
            max_concurrency = config.max_concurrency,
            "creating DuckDB connection"
        );
        Self {
            database_path: path,
            dialect: DuckDbDialect,
            limiter: Arc::new(Semaphore::new(config.max_concurrency)),
            root: Arc::new(Mutex::new(None)),
            pool: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Configure maximum concurrent executions; callers can tune based on hardware.
    pub fn with_max_concurrency(mut self, max_in_flight: usize) -> Self {
        tracing::debug!(max_concurrency = max_in_flight, "configuring DuckDB concurrency");
        self.limiter = Arc::new(Semaphore::new(max_in_flight));
        self
    }

    /// Run a batch of statements (DDL, seed data) on the shared database.
    pub async fn execute_batch(&self, sql: &str) -> Result<()> {
        let sql = sql.to_string();
        let _permit = self.acquire_slot().await?;
        let conn = self.checkout_connection()?;
        tokio::task::spawn_blocking(move || -> Result<()> {
            conn.get()?.execute_batch(&sql)?;
            Ok(())
        })
        .await
        .map_err(join_error)?
    }

    async fn acquire_slot(&self) -> Result<SemaphorePermit<'_>> {
        if self.limiter.available_permits() == 0 {
            tracing::debug!("all DuckDB slots in use, waiting for permit");
        }
        self.limiter
            .acquire()
            .await
            .map_err(|e| CostViewError::Execution(format!("limiter closed: {e}")))
    }

    fn checkout_connection(&self) -> Result<PooledConnection> {
        if let Some(conn) = lock(&self.pool).pop() {
            tracing::trace!("reusing pooled DuckDB connection");
            return Ok(PooledConnection {
                conn: Some(conn),
                pool: self.pool.clone(),
            });
        }

        let mut root = lock(&self.root);
        if root.is_none() {
            tracing::debug!(path = %self.database_path.display(), "opening DuckDB database");
            let conn = duckdb::Connection::open(&self.database_path)
                .map_err(|e| CostViewError::Execution(format!("open duckdb: {e}")))?;
            *root = Some(conn);
        }
        let conn = root
            .as_ref()
            .ok_or_else(|| CostViewError::Execution("duckdb database not open".to_string()))?
            .try_clone()
            .map_err(|e| CostViewError::Execution(format!("clone duckdb connection: {e}")))?;
        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.pool.clone(),
        })
    }
}

fn join_error(e: tokio::task::JoinError) -> CostViewError {
    if e.is_cancelled() {
        CostViewError::Cancelled(format!("duckdb task cancelled: {e}"))
    } else {
        CostViewError::Execution(format!("task join error: {e}"))
    }
}

#[async_trait]
impl BackendConnection for DuckDbConnection {
    fn dialect(&self) -> &(dyn crate::dialect::Dialect + Send + Sync) {
        &self.dialect
    }

    async fn execute_sql(&self, sql: &str) -> Result<QueryResult> {
        let sql = sql.to_string();
        let _permit = self.acquire_slot().await?;
        let conn = self.checkout_connection()?;
        tokio::task::spawn_blocking(move || -> Result<QueryResult> {
            let start = Instant::now();
            let mut stmt = conn.get()?.prepare(&sql)?;
            let mut rows_iter = stmt.query([])?;
            let stmt_ref = rows_iter
                .as_ref()
                .ok_or_else(|| CostViewError::Execution("statement missing".to_string()))?;
            let mut column_names = Vec::new();
            for idx in 0..stmt_ref.column_count() {
                let name = stmt_ref
                    .column_name(idx)
                    .map_err(|e| CostViewError::Execution(e.to_string()))?;
                column_names.push(name.to_string());
            }
            let mut rows = Vec::new();
            while let Some(row) = rows_iter.next()? {
                let mut map = serde_json::Map::new();
                for (idx, name) in column_names.iter().enumerate() {
                    let value = crate::executor::duck_value_to_json(row.get_ref(idx)?.to_owned());
                    map.insert(name.clone(), value);
                }
                rows.push(map);
            }

            let columns: Vec<_> = column_names
                .into_iter()
                .map(|name| ColumnMeta { name })
                .collect();
            tracing::debug!(
                rows = rows.len(),
                columns = columns.len(),
                ms = start.elapsed().as_millis(),
                "duckdb execute_sql"
            );
            Ok(QueryResult { columns, rows })
        })
        .await
        .map_err(join_error)?
    }
}
