use thiserror::Error;

pub type Result<T> = std::result::Result<T, CostViewError>;

#[derive(Debug, Error)]
pub enum CostViewError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("sql generation error: {0}")]
    Sql(String),
    #[error("execution error: {0}")]
    Execution(String),
    #[error("query cancelled: {0}")]
    Cancelled(String),
    #[cfg(feature = "duckdb")]
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CostViewError {
    pub fn validation(msg: impl Into<String>) -> Self {
        CostViewError::Validation(msg.into())
    }
}
