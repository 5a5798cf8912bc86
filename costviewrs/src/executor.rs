use std::sync::Arc;
use std::time::Instant;

#[cfg(feature = "duckdb")]
use duckdb::types::Value as DuckValue;
use serde_json::{Map, Value};

use crate::backends::BackendConnection;
use crate::dialect::Dialect;
use crate::error::CostViewError;
use crate::query_builder::QuerySpec;

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMeta {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Map<String, Value>>,
}

/// Why a query produced no result.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendFailure {
    pub message: String,
    /// The backend task was cancelled rather than failing on its own.
    pub cancelled: bool,
}

/// Outcome of one backend round trip. Backend errors never escape this type;
/// callers tell "query failed" from "zero matching rows" by variant.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Rows(QueryResult),
    Empty,
    Failed(BackendFailure),
}

impl QueryOutcome {
    /// Rows of a successful query; an empty result for `Empty`; `None` on failure.
    pub fn into_result(self) -> Option<QueryResult> {
        match self {
            QueryOutcome::Rows(result) => Some(result),
            QueryOutcome::Empty => Some(QueryResult::default()),
            QueryOutcome::Failed(_) => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, QueryOutcome::Failed(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryOutcome::Failed(f) if f.cancelled)
    }
}

/// Runs query specs against one backend, enforcing the row cap.
#[derive(Clone)]
pub struct QueryExecutor {
    connection: Arc<dyn BackendConnection>,
    max_rows: u64,
}

impl QueryExecutor {
    pub fn new(connection: Arc<dyn BackendConnection>, max_rows: u64) -> Self {
        Self {
            connection,
            max_rows,
        }
    }

    pub fn dialect(&self) -> &(dyn Dialect + Send + Sync) {
        self.connection.dialect()
    }

    pub fn max_rows(&self) -> u64 {
        self.max_rows
    }

    /// Render the capped statement without running it.
    pub fn render(&self, spec: &QuerySpec) -> String {
        spec.capped(self.max_rows).render(self.dialect())
    }

    pub async fn execute(&self, spec: &QuerySpec) -> QueryOutcome {
        let sql = self.render(spec);
        let start = Instant::now();
        tracing::debug!(
            dialect = self.dialect().name(),
            sql_len = sql.len(),
            "executing view query"
        );
        tracing::trace!(sql = %sql, "view query SQL");

        match self.connection.execute_sql(&sql).await {
            Ok(result) if result.rows.is_empty() => {
                tracing::debug!(ms = start.elapsed().as_millis(), "view query returned no rows");
                QueryOutcome::Empty
            }
            Ok(result) => {
                tracing::debug!(
                    rows = result.rows.len(),
                    ms = start.elapsed().as_millis(),
                    "view query finished"
                );
                QueryOutcome::Rows(result)
            }
            Err(CostViewError::Cancelled(message)) => {
                tracing::warn!(sql = %sql, reason = %message, "view query cancelled");
                QueryOutcome::Failed(BackendFailure {
                    message,
                    cancelled: true,
                })
            }
            Err(e) => {
                tracing::error!(sql = %sql, error = %e, "view query failed");
                QueryOutcome::Failed(BackendFailure {
                    message: e.to_string(),
                    cancelled: false,
                })
            }
        }
    }
}

/// Timestamps become epoch milliseconds so both backends report time the same way.
#[cfg(feature = "duckdb")]
pub(crate) fn duck_value_to_json(value: DuckValue) -> Value {
    use duckdb::types::TimeUnit;

    match value {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(b) => Value::Bool(b),
        DuckValue::TinyInt(i) => Value::from(i),
        DuckValue::SmallInt(i) => Value::from(i),
        DuckValue::Int(i) => Value::from(i),
        DuckValue::BigInt(i) => Value::from(i),
        DuckValue::HugeInt(i) => Value::String(i.to_string()),
        DuckValue::UTinyInt(i) => Value::from(i),
        DuckValue::USmallInt(i) => Value::from(i),
        DuckValue::UInt(i) => Value::from(i),
        DuckValue::UBigInt(i) => Value::from(i),
        DuckValue::Float(f) => Value::from(f),
        DuckValue::Double(f) => Value::from(f),
        DuckValue::Decimal(d) => Value::String(d.to_string()),
        DuckValue::Timestamp(unit, t) => {
            let millis = match unit {
                TimeUnit::Second => t * 1_000,
                TimeUnit::Millisecond => t,
                TimeUnit::Microsecond => t / 1_000,
                TimeUnit::Nanosecond => t / 1_000_000,
            };
            Value::from(millis)
        }
        DuckValue::Text(s) => Value::String(s),
        DuckValue::Blob(bytes) => Value::String(hex::encode(bytes)),
        DuckValue::Date32(d) => Value::from(i64::from(d) * 86_400_000),
        DuckValue::Time64(unit, t) => Value::String(format!("{t} ({unit:?})")),
        DuckValue::Interval {
            months,
            days,
            nanos,
        } => Value::String(format!("{months} months {days} days {nanos} nanos")),
        DuckValue::List(items) | DuckValue::Array(items) => {
            Value::Array(items.into_iter().map(duck_value_to_json).collect())
        }
        DuckValue::Enum(s) => Value::String(s),
        DuckValue::Struct(fields) => {
            let mut map = Map::new();
            for (key, val) in fields.iter() {
                map.insert(key.clone(), duck_value_to_json(val.clone()));
            }
            Value::Object(map)
        }
        DuckValue::Map(entries) => {
            let mut map = Map::new();
            for (k, v) in entries.iter() {
                let key = match duck_value_to_json(k.clone()) {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                map.insert(key, duck_value_to_json(v.clone()));
            }
            Value::Object(map)
        }
        DuckValue::Union(inner) => duck_value_to_json(*inner),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::dialect::DuckDbDialect;
    use crate::error::Result;
    use crate::query_builder::OutputColumn;
    use crate::sql_ast::{SelectItem, SelectQuery, SqlExpr, TableRef};

    struct Recording {
        reply: fn() -> Result<QueryResult>,
        last_sql: Mutex<Option<String>>,
    }

    #[async_trait]
    impl BackendConnection for Recording {
        fn dialect(&self) -> &(dyn Dialect + Send + Sync) {
            &DuckDbDialect
        }

        async fn execute_sql(&self, sql: &str) -> Result<QueryResult> {
            *self.last_sql.lock().unwrap() = Some(sql.to_string());
            (self.reply)()
        }
    }

    fn executor(reply: fn() -> Result<QueryResult>) -> (Arc<Recording>, QueryExecutor) {
        let conn = Arc::new(Recording {
            reply,
            last_sql: Mutex::new(None),
        });
        (conn.clone(), QueryExecutor::new(conn, 100))
    }

    fn spec(limit: Option<u64>) -> QuerySpec {
        QuerySpec {
            query: SelectQuery {
                from: TableRef {
                    name: "t".into(),
                    alias: None,
                },
                select: vec![SelectItem {
                    expr: SqlExpr::column(None, "product"),
                    alias: None,
                }],
                ..Default::default()
            },
            columns: vec![OutputColumn::new("product", crate::query_builder::ColumnKind::GroupKey)],
        }
        .paginate(limit, None)
    }

    #[tokio::test]
    async fn row_cap_is_always_applied() {
        let (conn, exec) = executor(|| Ok(QueryResult::default()));
        assert_eq!(exec.execute(&spec(None)).await, QueryOutcome::Empty);
        assert!(conn.last_sql.lock().unwrap().as_deref().unwrap().ends_with("LIMIT 100"));

        exec.execute(&spec(Some(5000))).await;
        assert!(conn.last_sql.lock().unwrap().as_deref().unwrap().ends_with("LIMIT 100"));

        exec.execute(&spec(Some(7))).await;
        assert!(conn.last_sql.lock().unwrap().as_deref().unwrap().ends_with("LIMIT 7"));
    }

    #[tokio::test]
    async fn failures_are_absorbed_and_cancellation_flagged() {
        let (_, failing) = executor(|| Err(CostViewError::Execution("boom".into())));
        let outcome = failing.execute(&spec(None)).await;
        assert!(outcome.is_failed());
        assert!(!outcome.is_cancelled());
        assert_eq!(outcome.into_result(), None);

        let (_, cancelled) = executor(|| Err(CostViewError::Cancelled("dropped".into())));
        assert!(cancelled.execute(&spec(None)).await.is_cancelled());
    }
}
