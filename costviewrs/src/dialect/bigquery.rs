//! BigQuery dialect implementation.

use crate::sql_ast::{Function, LabelMatchOp};
use crate::views::TimeGranularity;

use super::Dialect;

const LABELS_FLAT: &str = "labels_flat";

#[derive(Debug, Default, Clone)]
pub struct BigQueryDialect {
    project_id: Option<String>,
    dataset: Option<String>,
}

impl BigQueryDialect {
    /// Qualify bare table names with `project.dataset`.
    pub fn new(project_id: &str, dataset: &str) -> Self {
        Self {
            project_id: Some(project_id.to_string()),
            dataset: Some(dataset.to_string()),
        }
    }
}

impl Dialect for BigQueryDialect {
    fn name(&self) -> &'static str {
        "bigquery"
    }

    fn quote_ident(&self, ident: &str) -> String {
        // BigQuery uses backticks for identifiers
        format!("`{}`", ident.replace('`', "\\`"))
    }

    fn qualify_table(&self, table: &str) -> String {
        match (&self.project_id, &self.dataset) {
            (Some(project), Some(dataset)) if !table.contains('.') => {
                self.quote_ident(&format!("{project}.{dataset}.{table}"))
            }
            _ => self.quote_ident(table),
        }
    }

    fn render_literal(&self, value: &serde_json::Value) -> String {
        match value {
            // BigQuery escapes quotes with a backslash, doubling is not accepted
            serde_json::Value::String(s) => {
                format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
            }
            serde_json::Value::Array(items) => {
                let rendered: Vec<String> = items.iter().map(|v| self.render_literal(v)).collect();
                rendered.join(", ")
            }
            serde_json::Value::Null => "NULL".to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Object(_) => self.render_literal(&serde_json::Value::String(value.to_string())),
        }
    }

    fn render_function(&self, func: &Function, args: Vec<String>) -> String {
        match func {
            Function::DateTrunc(grain) => {
                format!("TIMESTAMP_TRUNC({}, {})", args.join(", "), bq_grain_to_str(grain))
            }
            Function::EpochMillis => format!("UNIX_MILLIS({})", args.join(", ")),
            Function::TimestampFromMillis => format!("TIMESTAMP_MILLIS({})", args.join(", ")),
            Function::Coalesce => format!("COALESCE({})", args.join(", ")),
            Function::Lower => format!("LOWER({})", args.join(", ")),
        }
    }

    fn render_label_value(&self, _labels: &str, _key: &str) -> String {
        // The key restriction is applied by `render_label_key_predicate`
        format!("{LABELS_FLAT}.value")
    }

    fn render_label_key(&self, _labels: &str) -> String {
        format!("{LABELS_FLAT}.key")
    }

    fn render_label_match(
        &self,
        labels: &str,
        key: &str,
        op: LabelMatchOp,
        values: &[String],
    ) -> String {
        let key_pred = format!("l.key = {}", self.quote_string(key));
        let exists = |extra: Option<String>| {
            let cond = match extra {
                Some(extra) => format!("{key_pred} AND {extra}"),
                None => key_pred.clone(),
            };
            format!("EXISTS (SELECT 1 FROM UNNEST({labels}) AS l WHERE {cond})")
        };
        match op {
            LabelMatchOp::In => exists(Some(format!("l.value IN ({})", values.join(", ")))),
            LabelMatchOp::NotIn => format!(
                "NOT {}",
                exists(Some(format!("l.value IN ({})", values.join(", "))))
            ),
            LabelMatchOp::Exists => exists(None),
            LabelMatchOp::NotExists => format!("NOT {}", exists(None)),
            LabelMatchOp::Like => {
                let likes: Vec<String> = values
                    .iter()
                    .map(|v| format!("LOWER(l.value) LIKE {v}"))
                    .collect();
                exists(Some(format!("({})", likes.join(" OR "))))
            }
        }
    }

    fn render_label_unnest(&self, labels: &str) -> Option<String> {
        Some(format!("LEFT JOIN UNNEST({labels}) AS {LABELS_FLAT}"))
    }

    fn render_label_key_predicate(&self, key: &str) -> Option<String> {
        Some(format!("{LABELS_FLAT}.key = {}", self.quote_string(key)))
    }
}

/// Convert a granularity to a BigQuery date part. Weeks start on Monday to
/// line up with the other dialect.
fn bq_grain_to_str(grain: &TimeGranularity) -> &'static str {
    match grain {
        TimeGranularity::Day => "DAY",
        TimeGranularity::Week => "ISOWEEK",
        TimeGranularity::Month => "MONTH",
    }
}
