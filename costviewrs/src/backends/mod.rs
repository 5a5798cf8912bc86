//! Warehouse backend implementations.
//!
//! Each backend is implemented in its own file and gated behind a feature flag.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{CostViewConfig, ResolvedDatasourceConfig};
use crate::dialect::Dialect;
use crate::error::Result;
use crate::executor::{QueryExecutor, QueryResult};

/// Unified interface for all warehouse backends.
///
/// Implementations own connection scoping: whatever they acquire for a call
/// is released before `execute_sql` returns or its future is dropped.
#[async_trait]
pub trait BackendConnection: Send + Sync {
    fn dialect(&self) -> &(dyn Dialect + Send + Sync);
    async fn execute_sql(&self, sql: &str) -> Result<QueryResult>;
}

/// Minimal connection manager keyed by data source name.
#[derive(Clone, Default)]
pub struct ConnectionManager {
    connections: HashMap<String, Arc<dyn BackendConnection>>,
    config: Option<CostViewConfig>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
            config: None,
        }
    }

    /// Create a connection manager with configuration.
    pub fn with_config(config: CostViewConfig) -> Self {
        Self {
            connections: HashMap::new(),
            config: Some(config),
        }
    }

    /// Get the configuration, if set.
    pub fn config(&self) -> Option<&CostViewConfig> {
        self.config.as_ref()
    }

    /// Get resolved configuration for a specific datasource.
    pub fn config_for(&self, name: &str) -> ResolvedDatasourceConfig {
        match &self.config {
            Some(cfg) => cfg.for_datasource(name),
            None => CostViewConfig::default().for_datasource(name),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, conn: Arc<dyn BackendConnection>) {
        self.connections.insert(name.into(), conn);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn BackendConnection>> {
        self.connections.get(name)
    }

    /// Executor for a datasource, capped at its configured row limit.
    pub fn executor(&self, name: &str) -> Option<QueryExecutor> {
        let conn = self.connections.get(name)?.clone();
        let max_rows = self.config_for(name).query.max_row_limit;
        Some(QueryExecutor::new(conn, max_rows))
    }
}

// Feature-gated backend implementations
#[cfg(feature = "duckdb")]
mod duckdb;
#[cfg(feature = "duckdb")]
pub use duckdb::DuckDbConnection;

#[cfg(feature = "bigquery")]
mod bigquery;
#[cfg(feature = "bigquery")]
pub use bigquery::BigQueryConnection;
