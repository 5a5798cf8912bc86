//! SQL dialect abstractions for the two warehouse backends.
//!
//! Dialects are pure string rendering and compile regardless of which
//! backend features are enabled, so one query can be checked against both.

use crate::sql_ast::{Function, LabelMatchOp};
use crate::views::AggregationOperation;

/// Dialects render identifiers and primitive expression pieces.
/// Expression tree walking lives in the renderer; the dialect only maps
/// logical constructs, including the nested label structure, to SQL fragments.
pub trait Dialect {
    fn name(&self) -> &'static str;
    fn quote_ident(&self, ident: &str) -> String;
    fn qualify_table(&self, table: &str) -> String {
        self.quote_ident(table)
    }
    fn render_function(&self, func: &Function, args: Vec<String>) -> String;
    fn render_aggregation(&self, agg: &AggregationOperation, expr: &str) -> String {
        match agg {
            AggregationOperation::Sum => format!("SUM({expr})"),
            AggregationOperation::Min => format!("MIN({expr})"),
            AggregationOperation::Max => format!("MAX({expr})"),
        }
    }
    fn render_literal(&self, value: &serde_json::Value) -> String {
        match value {
            serde_json::Value::Null => "NULL".to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::String(s) => format!("'{}'", s.replace('\'', "''")),
            serde_json::Value::Array(items) => {
                let rendered: Vec<String> = items.iter().map(|v| self.render_literal(v)).collect();
                rendered.join(", ")
            }
            serde_json::Value::Object(_) => {
                format!("'{}'", value.to_string().replace('\'', "''"))
            }
        }
    }
    fn quote_string(&self, value: &str) -> String {
        self.render_literal(&serde_json::Value::String(value.to_string()))
    }

    /// Value of label `key` on the current row, NULL when absent.
    fn render_label_value(&self, labels: &str, key: &str) -> String;
    /// Label keys of the current row.
    fn render_label_key(&self, labels: &str) -> String;
    /// Row-level predicate over the labels of the current row.
    fn render_label_match(
        &self,
        labels: &str,
        key: &str,
        op: LabelMatchOp,
        values: &[String],
    ) -> String;
    /// Join clause flattening the labels, when the backend needs one.
    fn render_label_unnest(&self, _labels: &str) -> Option<String> {
        None
    }
    /// Predicate restricting flattened label rows to one key.
    fn render_label_key_predicate(&self, _key: &str) -> Option<String> {
        None
    }
}

mod bigquery;
mod duckdb;

pub use bigquery::BigQueryDialect;
pub use duckdb::DuckDbDialect;
