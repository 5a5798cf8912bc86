//! BigQuery backend implementation using gcp-bigquery-client.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use gcp_bigquery_client::model::query_request::QueryRequest;
use gcp_bigquery_client::model::query_response::{QueryResponse, ResultSet};
use gcp_bigquery_client::Client;
use tokio::sync::Semaphore;

use crate::config::BigQueryConfig;
use crate::dialect::BigQueryDialect;
use crate::error::{CostViewError, Result};
use crate::executor::{ColumnMeta, QueryResult};

use super::BackendConnection;

pub struct BigQueryConnection {
    client: Client,
    project_id: String,
    dataset: String,
    dialect: BigQueryDialect,
    config: BigQueryConfig,
    /// Bounds concurrent jobs for backpressure.
    limiter: Arc<Semaphore>,
}

impl BigQueryConnection {
    /// Connect with a service account key file.
    pub async fn from_service_account_key_file(
        service_account_path: &str,
        project_id: &str,
        dataset: &str,
        config: BigQueryConfig,
    ) -> Result<Self> {
        tracing::info!(
            project_id = %project_id,
            dataset = %dataset,
            use_query_cache = config.use_query_cache,
            "creating BigQuery connection from service account"
        );
        let client = Client::from_service_account_key_file(service_account_path)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "failed to create BigQuery client");
                CostViewError::Execution(format!("create bigquery client: {e}"))
            })?;
        Ok(Self::from_client(client, project_id, dataset, config))
    }

    /// Connect with application default credentials
    /// (`GOOGLE_APPLICATION_CREDENTIALS` or the gcloud login).
    pub async fn from_application_default_credentials(
        project_id: &str,
        dataset: &str,
        config: BigQueryConfig,
    ) -> Result<Self> {
        tracing::info!(
            project_id = %project_id,
            dataset = %dataset,
            use_query_cache = config.use_query_cache,
            "creating BigQuery connection from application default credentials"
        );
        let client = Client::from_application_default_credentials()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "failed to create BigQuery client from ADC");
                CostViewError::Execution(format!("create bigquery client: {e}"))
            })?;
        Ok(Self::from_client(client, project_id, dataset, config))
    }

    fn from_client(client: Client, project_id: &str, dataset: &str, config: BigQueryConfig) -> Self {
        tracing::info!(
            project_id = %project_id,
            dataset = %dataset,
            max_concurrent = config.max_concurrent_queries,
            "BigQuery connection established"
        );
        Self {
            client,
            project_id: project_id.to_string(),
            dataset: dataset.to_string(),
            dialect: BigQueryDialect::new(project_id, dataset),
            limiter: Arc::new(Semaphore::new(config.max_concurrent_queries)),
            config,
        }
    }

    pub fn config(&self) -> &BigQueryConfig {
        &self.config
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Waits up to `queue_timeout_ms` for a slot; zero waits forever.
    async fn acquire_slot(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        if self.limiter.available_permits() == 0 {
            tracing::debug!(
                max_concurrent = self.config.max_concurrent_queries,
                queue_timeout_ms = self.config.queue_timeout_ms,
                "BigQuery slots exhausted, waiting for permit"
            );
        }

        let timeout_ms = self.config.queue_timeout_ms;
        if timeout_ms == 0 {
            return self
                .limiter
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| CostViewError::Execution(format!("limiter closed: {e}")));
        }
        let timeout = Duration::from_millis(timeout_ms);
        match tokio::time::timeout(timeout, self.limiter.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(e)) => Err(CostViewError::Execution(format!("limiter closed: {e}"))),
            Err(_) => {
                tracing::warn!(
                    max_concurrent = self.config.max_concurrent_queries,
                    timeout_ms,
                    "BigQuery request rejected: queue timeout exceeded"
                );
                Err(CostViewError::Execution(format!(
                    "BigQuery overloaded: queued for {timeout_ms}ms with {} queries in flight",
                    self.config.max_concurrent_queries
                )))
            }
        }
    }

    fn query_request(&self, sql: &str) -> QueryRequest {
        let mut request = QueryRequest::new(sql);
        request.use_query_cache = Some(self.config.use_query_cache);
        if self.config.maximum_bytes_billed > 0 {
            request.maximum_bytes_billed = Some(self.config.maximum_bytes_billed.to_string());
        }
        if self.config.query_timeout_ms > 0 {
            request.timeout_ms = i32::try_from(self.config.query_timeout_ms).ok();
        }
        request
    }
}

/// Column names in schema order. `ResultSet::column_names` iterates a map,
/// so the order has to come from the response schema.
fn schema_column_names(response: &QueryResponse) -> Option<Vec<String>> {
    response
        .schema
        .as_ref()
        .and_then(|s| s.fields.as_ref())
        .map(|fields| fields.iter().map(|f| f.name.clone()).collect())
}

#[async_trait]
impl BackendConnection for BigQueryConnection {
    fn dialect(&self) -> &(dyn crate::dialect::Dialect + Send + Sync) {
        &self.dialect
    }

    async fn execute_sql(&self, sql: &str) -> Result<QueryResult> {
        let _permit = self.acquire_slot().await?;

        let start = Instant::now();
        tracing::debug!(
            project = %self.project_id,
            sql_len = sql.len(),
            use_query_cache = self.config.use_query_cache,
            "executing BigQuery query"
        );
        tracing::trace!(sql = %sql, "BigQuery SQL");

        let response = self
            .client
            .job()
            .query(&self.project_id, self.query_request(sql))
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "BigQuery query execution failed");
                CostViewError::Execution(format!("bigquery query: {e}"))
            })?;

        let ordered = schema_column_names(&response);
        let mut rs = ResultSet::new_from_query_response(response);
        let col_names = ordered
            .unwrap_or_else(|| rs.column_names().iter().map(|s| s.to_string()).collect());

        // Values are looked up by name; positional access follows a different order.
        let mut rows = Vec::new();
        while rs.next_row() {
            let mut map = serde_json::Map::new();
            for name in &col_names {
                let value = rs
                    .get_json_value_by_name(name)
                    .ok()
                    .flatten()
                    .unwrap_or(serde_json::Value::Null);
                map.insert(name.clone(), value);
            }
            rows.push(map);
        }

        let columns: Vec<ColumnMeta> = col_names
            .into_iter()
            .map(|name| ColumnMeta { name })
            .collect();
        tracing::debug!(
            rows = rows.len(),
            columns = columns.len(),
            ms = start.elapsed().as_millis(),
            "bigquery execute_sql"
        );
        Ok(QueryResult { columns, rows })
    }
}
