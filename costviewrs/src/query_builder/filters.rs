use serde_json::Value;

use crate::error::{CostViewError, Result};
use crate::sql_ast::{Function, SqlBinaryOperator, SqlExpr};
use crate::views::{
    columns, ViewFilter, ViewIdCondition, ViewMetadataFilter, ViewRule, ViewTimeOperator,
};

/// Request filters split by kind, validated.
#[derive(Debug, Clone, Default)]
pub(crate) struct PartitionedFilters {
    pub metadata: Option<ViewMetadataFilter>,
    pub ids: Vec<ViewIdCondition>,
    pub after: Option<i64>,
    pub before: Option<i64>,
    pub rules: Vec<ViewRule>,
}

impl PartitionedFilters {
    /// Non-preview metadata filter naming a saved view.
    pub fn saved_view_id(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .filter(|m| !m.is_preview)
            .map(|m| m.view_id.as_str())
    }
}

pub(crate) fn partition(filters: &[ViewFilter]) -> Result<PartitionedFilters> {
    let mut parts = PartitionedFilters::default();
    for filter in filters {
        match filter {
            ViewFilter::Metadata(meta) => {
                if parts.metadata.is_some() {
                    return Err(CostViewError::validation(
                        "only one view metadata filter is allowed",
                    ));
                }
                parts.metadata = Some(meta.clone());
            }
            ViewFilter::Id(cond) => {
                validate_condition(cond)?;
                parts.ids.push(cond.clone());
            }
            ViewFilter::Time(time) => {
                if !time.field.is_start_time() {
                    return Err(CostViewError::validation(format!(
                        "time filters only apply to {}, got {}",
                        columns::START_TIME,
                        time.field.field_id
                    )));
                }
                match time.operator {
                    ViewTimeOperator::After => parts.after = Some(time.value),
                    ViewTimeOperator::Before => parts.before = Some(time.value),
                }
            }
            ViewFilter::Rule(rule) => {
                for cond in &rule.conditions {
                    validate_condition(cond)?;
                }
                parts.rules.push(rule.clone());
            }
        }
    }
    if let (Some(after), Some(before)) = (parts.after, parts.before) {
        if after > before {
            return Err(CostViewError::validation(format!(
                "time window is inverted: after {after} > before {before}"
            )));
        }
    }
    Ok(parts)
}

pub(crate) fn validate_condition(cond: &ViewIdCondition) -> Result<()> {
    if cond.field.is_start_time() {
        return Err(CostViewError::validation(
            "startTime must be filtered with a time filter",
        ));
    }
    if cond.operator.takes_values() && cond.values.is_empty() {
        return Err(CostViewError::validation(format!(
            "{:?} filter on {} needs at least one value",
            cond.operator, cond.field.field_id
        )));
    }
    if !cond.operator.takes_values() && !cond.values.is_empty() {
        return Err(CostViewError::validation(format!(
            "{:?} filter on {} takes no values",
            cond.operator, cond.field.field_id
        )));
    }
    Ok(())
}

pub(crate) fn time_predicates(after: Option<i64>, before: Option<i64>) -> Vec<SqlExpr> {
    let start = SqlExpr::column(None, columns::START_TIME);
    let bound = |millis: i64| SqlExpr::Function {
        func: Function::TimestampFromMillis,
        args: vec![SqlExpr::Literal(Value::from(millis))],
    };
    let mut preds = Vec::new();
    if let Some(after) = after {
        preds.push(SqlExpr::binary(SqlBinaryOperator::Gte, start.clone(), bound(after)));
    }
    if let Some(before) = before {
        preds.push(SqlExpr::binary(SqlBinaryOperator::Lte, start, bound(before)));
    }
    preds
}

/// `%term%`, lowercased, for case-insensitive substring search.
pub(crate) fn like_pattern(term: &str) -> SqlExpr {
    SqlExpr::string(&format!("%{}%", term.to_lowercase()))
}
