//! Configuration system for the cost view engine.
//!
//! Supports TOML-based configuration with global defaults and per-datasource overrides.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CostViewError, Result};
use crate::views::OTHERS;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CostViewConfig {
    /// Global defaults applied to all datasources unless overridden.
    pub defaults: GlobalDefaults,

    /// Per-datasource configuration overrides (keyed by datasource name).
    #[serde(default)]
    pub datasources: HashMap<String, DatasourceConfig>,
}

/// Global default settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
#[derive(Default)]
pub struct GlobalDefaults {
    pub query: QueryConfig,
    pub settings_cache: SettingsCacheConfig,
    pub view: ViewConfig,
}

/// Query execution configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Query timeout in milliseconds (default: 30000).
    pub timeout_ms: u64,
    /// Hard cap on rows a single query may return (default: 10000).
    pub max_row_limit: u64,
    /// Row limit applied when a request does not set one.
    pub default_row_limit: u64,
}

/// Account settings cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SettingsCacheConfig {
    /// Entry TTL in seconds (default: 10).
    pub ttl_secs: u64,
    /// Maximum cached accounts (default: 50).
    pub max_size: u64,
}

/// Billing table and fallback view settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ViewConfig {
    /// Unified billing table queried by every view.
    pub table: String,
    /// Column grouped by when neither request nor view names one.
    pub default_group_by_field: String,
    /// Bucket name for null keys and unmatched business-mapping rows.
    pub unallocated_label: String,
}

/// Per-datasource configuration (can override globals).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DatasourceConfig {
    pub query: Option<QueryConfig>,
    pub view: Option<ViewConfig>,

    /// BigQuery-specific options.
    pub bigquery: Option<BigQueryConfig>,

    /// DuckDB-specific options.
    pub duckdb: Option<DuckDbConfig>,
}

/// BigQuery-specific configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BigQueryConfig {
    /// Enable query cache (default: true).
    pub use_query_cache: bool,
    /// Maximum bytes billed per query (0 = unlimited).
    pub maximum_bytes_billed: i64,
    /// Query timeout in milliseconds (overrides query.timeout_ms for BigQuery).
    pub query_timeout_ms: u64,
    /// Maximum concurrent queries to BigQuery.
    pub max_concurrent_queries: usize,
    /// Maximum time (ms) to wait in queue before rejecting.
    /// Set to 0 for unlimited wait.
    pub queue_timeout_ms: u64,
}

/// DuckDB-specific configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DuckDbConfig {
    /// Maximum concurrent queries (default: 16).
    pub max_concurrency: usize,
}

// Default implementations

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_row_limit: 10_000,
            default_row_limit: 1000,
        }
    }
}

impl Default for SettingsCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 10,
            max_size: 50,
        }
    }
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            table: "unifiedTable".to_string(),
            default_group_by_field: crate::views::columns::PRODUCT.to_string(),
            unallocated_label: OTHERS.to_string(),
        }
    }
}

impl Default for BigQueryConfig {
    fn default() -> Self {
        Self {
            use_query_cache: true,
            maximum_bytes_billed: 0, // 0 = unlimited
            query_timeout_ms: 30_000,
            max_concurrent_queries: 30,
            queue_timeout_ms: 1_500,
        }
    }
}

impl Default for DuckDbConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
        }
    }
}

impl CostViewConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| CostViewError::Config(format!("failed to read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(toml_str)
            .map_err(|e| CostViewError::Config(format!("failed to parse config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from default locations (env var, cwd, user config dir, or defaults).
    ///
    /// Search order:
    /// 1. `COSTVIEW_CONFIG` environment variable
    /// 2. `./costview.toml` (current directory)
    /// 3. `~/.config/costview/config.toml` (user config dir)
    /// 4. Built-in defaults
    pub fn load_default() -> Self {
        if let Ok(path) = std::env::var("COSTVIEW_CONFIG") {
            match Self::from_file(&path) {
                Ok(cfg) => {
                    tracing::info!(path = %path, "loaded config from COSTVIEW_CONFIG");
                    return cfg;
                }
                Err(e) => tracing::warn!(path = %path, error = %e, "ignoring COSTVIEW_CONFIG"),
            }
        }

        if let Ok(cfg) = Self::from_file("costview.toml") {
            tracing::info!("loaded config from ./costview.toml");
            return cfg;
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("costview").join("config.toml");
            if let Ok(cfg) = Self::from_file(&user_config) {
                tracing::info!(path = %user_config.display(), "loaded config from user config dir");
                return cfg;
            }
        }

        tracing::debug!("no config file found, using defaults");
        Self::default()
    }

    /// Get resolved config for a specific datasource (merges global defaults).
    pub fn for_datasource(&self, name: &str) -> ResolvedDatasourceConfig {
        let ds_config = self.datasources.get(name);
        ResolvedDatasourceConfig::merge(&self.defaults, ds_config)
    }

    fn validate(&self) -> Result<()> {
        let queries = std::iter::once(&self.defaults.query)
            .chain(self.datasources.values().filter_map(|d| d.query.as_ref()));
        for query in queries {
            if query.max_row_limit == 0 {
                return Err(CostViewError::Config(
                    "query.max_row_limit must be greater than zero".to_string(),
                ));
            }
        }
        if self.defaults.settings_cache.max_size == 0 {
            return Err(CostViewError::Config(
                "settings_cache.max_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Fully resolved configuration for a datasource (no Option fields).
#[derive(Debug, Clone, Default)]
pub struct ResolvedDatasourceConfig {
    pub query: QueryConfig,
    pub view: ViewConfig,
    pub bigquery: BigQueryConfig,
    pub duckdb: DuckDbConfig,
}

impl ResolvedDatasourceConfig {
    fn merge(defaults: &GlobalDefaults, override_cfg: Option<&DatasourceConfig>) -> Self {
        match override_cfg {
            Some(ds) => Self {
                query: ds.query.clone().unwrap_or_else(|| defaults.query.clone()),
                view: ds.view.clone().unwrap_or_else(|| defaults.view.clone()),
                bigquery: ds.bigquery.clone().unwrap_or_default(),
                duckdb: ds.duckdb.clone().unwrap_or_default(),
            },
            None => Self {
                query: defaults.query.clone(),
                view: defaults.view.clone(),
                bigquery: BigQueryConfig::default(),
                duckdb: DuckDbConfig::default(),
            },
        }
    }
}
