//! Cost view engine: turns saved or ad-hoc cost views into warehouse SQL,
//! runs it on BigQuery or DuckDB, and shapes the rows into grids, time
//! series and trend cards.

pub mod backends;
pub mod config;
pub mod dialect;
pub mod error;
pub mod executor;
pub mod preferences;
pub mod query_builder;
pub mod registry;
pub mod result_mapper;
pub mod service;
pub mod settings_cache;
pub mod shared_cost;
pub mod sql_ast;
pub mod trend;
pub mod views;

use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::backends::ConnectionManager;
use crate::error::Result;
use crate::registry::ViewRegistry;
use crate::settings_cache::SettingsProvider;

/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "COSTVIEW_LOG";

/// Install a fmt subscriber filtered by `COSTVIEW_LOG` (default `info`).
/// Does nothing when a global subscriber is already set.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Load views and mappings from `view_dir` and build a service over the
/// named datasource.
pub fn load_service<P: AsRef<Path>>(
    view_dir: P,
    connections: &ConnectionManager,
    datasource: &str,
    settings: Arc<dyn SettingsProvider>,
) -> Result<CostViewService> {
    let registry = ViewRegistry::load_from_dir(view_dir)?;
    CostViewService::for_datasource(connections, datasource, Arc::new(registry), settings)
}

pub use backends::BackendConnection;
#[cfg(feature = "bigquery")]
pub use backends::BigQueryConnection;
#[cfg(feature = "duckdb")]
pub use backends::DuckDbConnection;
pub use config::CostViewConfig;
pub use error::{CostViewError, Result as CostViewResult};
pub use executor::{QueryExecutor, QueryOutcome, QueryResult};
pub use query_builder::{QueryKind, QuerySpec, ViewQueryBuilder};
pub use registry::ViewStore;
pub use service::CostViewService;
pub use settings_cache::{Setting, SettingsCache};
pub use views::{CostView, ViewQueryRequest};
