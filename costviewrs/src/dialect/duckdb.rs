//! DuckDB dialect implementation. Labels are stored as `MAP(VARCHAR, VARCHAR)`.

use crate::sql_ast::{Function, LabelMatchOp};
use crate::views::TimeGranularity;

use super::Dialect;

#[derive(Debug, Default, Clone, Copy)]
pub struct DuckDbDialect;

impl Dialect for DuckDbDialect {
    fn name(&self) -> &'static str {
        "duckdb"
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn render_function(&self, func: &Function, args: Vec<String>) -> String {
        match func {
            Function::DateTrunc(grain) => {
                format!("date_trunc('{}', {})", grain_to_str(grain), args.join(", "))
            }
            Function::EpochMillis | Function::TimestampFromMillis => {
                format!("epoch_ms({})", args.join(", "))
            }
            Function::Coalesce => format!("coalesce({})", args.join(", ")),
            Function::Lower => format!("lower({})", args.join(", ")),
        }
    }

    fn render_label_value(&self, labels: &str, key: &str) -> String {
        format!("map_extract({labels}, {})[1]", self.quote_string(key))
    }

    fn render_label_key(&self, labels: &str) -> String {
        format!("unnest(map_keys({labels}))")
    }

    fn render_label_match(
        &self,
        labels: &str,
        key: &str,
        op: LabelMatchOp,
        values: &[String],
    ) -> String {
        let value = self.render_label_value(labels, key);
        let entries = format!("coalesce(len(map_extract({labels}, {})), 0)", self.quote_string(key));
        match op {
            LabelMatchOp::In => format!("coalesce({value} IN ({}), false)", values.join(", ")),
            LabelMatchOp::NotIn => {
                format!("NOT coalesce({value} IN ({}), false)", values.join(", "))
            }
            LabelMatchOp::Exists => format!("{entries} > 0"),
            LabelMatchOp::NotExists => format!("{entries} = 0"),
            LabelMatchOp::Like => {
                let likes: Vec<String> = values
                    .iter()
                    .map(|v| format!("lower({value}) LIKE {v}"))
                    .collect();
                format!("coalesce({}, false)", likes.join(" OR "))
            }
        }
    }
}

fn grain_to_str(grain: &TimeGranularity) -> &'static str {
    match grain {
        TimeGranularity::Day => "day",
        TimeGranularity::Week => "week",
        TimeGranularity::Month => "month",
    }
}
