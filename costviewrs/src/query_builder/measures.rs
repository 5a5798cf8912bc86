use serde_json::Value;

use crate::error::{CostViewError, Result};
use crate::preferences::{CostOp, CostTerm, RowMatch};
use crate::sql_ast::{Function, SelectItem, SqlBinaryOperator, SqlExpr};
use crate::views::{columns, AggregationOperation, ViewAggregation};

use super::fields::{coalesce_empty, is_identifier};
use super::plan::{ColumnKind, OutputColumn};

pub(crate) fn default_aggregations() -> Vec<ViewAggregation> {
    vec![ViewAggregation::sum(columns::COST)]
}

/// Select items for the requested aggregations. `SUM(cost)` expands to the
/// preference-driven cost formula; duplicate aggregations collapse.
pub(crate) fn aggregation_items(
    aggregations: &[ViewAggregation],
    terms: &[CostTerm],
) -> Result<Vec<(SelectItem, OutputColumn)>> {
    let mut items: Vec<(SelectItem, OutputColumn)> = Vec::new();
    for agg in aggregations {
        let column = agg.column_name.as_str();
        if !is_identifier(column) {
            return Err(CostViewError::validation(format!(
                "invalid aggregation column {column:?}"
            )));
        }
        let (alias, kind, expr) = match agg.operation {
            AggregationOperation::Sum if column.eq_ignore_ascii_case(columns::COST) => {
                (columns::COST.to_string(), ColumnKind::Cost, cost_expr(terms))
            }
            AggregationOperation::Sum => (column.to_string(), ColumnKind::Cost, sum(column)),
            AggregationOperation::Min | AggregationOperation::Max => {
                let start_time = column.eq_ignore_ascii_case(columns::START_TIME);
                let kind = match (agg.operation, start_time) {
                    (AggregationOperation::Min, true) => ColumnKind::MinStartTime,
                    (AggregationOperation::Max, true) => ColumnKind::MaxStartTime,
                    _ => ColumnKind::Value,
                };
                let suffix = if agg.operation == AggregationOperation::Min { "min" } else { "max" };
                let aggregate = SqlExpr::Aggregate {
                    agg: agg.operation,
                    expr: Box::new(SqlExpr::column(None, column)),
                };
                let expr = if start_time {
                    SqlExpr::Function {
                        func: Function::EpochMillis,
                        args: vec![aggregate],
                    }
                } else {
                    aggregate
                };
                (format!("{column}_{suffix}"), kind, expr)
            }
        };
        if items.iter().any(|(_, c)| c.alias == alias) {
            continue;
        }
        items.push((
            SelectItem {
                expr,
                alias: Some(alias.clone()),
            },
            OutputColumn::new(alias, kind).with_source(column),
        ));
    }
    Ok(items)
}

/// `op_1 SUM(CASE WHEN filter_1 THEN col_1 ELSE 0 END) op_2 ...`.
pub(crate) fn cost_expr(terms: &[CostTerm]) -> SqlExpr {
    if let [only] = terms {
        if only.op == CostOp::Add && only.filter.is_empty() {
            return sum(&only.column);
        }
    }
    let mut acc: Option<SqlExpr> = None;
    for term in terms {
        let part = coalesce_zero(SqlExpr::Aggregate {
            agg: AggregationOperation::Sum,
            expr: Box::new(term_value(term)),
        });
        acc = Some(match (acc, term.op) {
            (None, CostOp::Add) => part,
            (None, CostOp::Subtract) => SqlExpr::binary(SqlBinaryOperator::Subtract, zero(), part),
            (Some(prev), CostOp::Add) => SqlExpr::binary(SqlBinaryOperator::Add, prev, part),
            (Some(prev), CostOp::Subtract) => {
                SqlExpr::binary(SqlBinaryOperator::Subtract, prev, part)
            }
        });
    }
    acc.unwrap_or_else(|| sum(columns::COST))
}

fn term_value(term: &CostTerm) -> SqlExpr {
    let column = SqlExpr::column(None, &term.column);
    let conds: Vec<SqlExpr> = term.filter.iter().map(row_match).collect();
    match SqlExpr::fold(SqlBinaryOperator::And, conds) {
        Some(when) => SqlExpr::Case {
            branches: vec![(when, column)],
            else_expr: Box::new(zero()),
        },
        None => column,
    }
}

fn row_match(m: &RowMatch) -> SqlExpr {
    SqlExpr::InList {
        expr: Box::new(coalesce_empty(SqlExpr::column(None, &m.column))),
        list: m.values.iter().map(|v| SqlExpr::string(v)).collect(),
        negated: m.negated,
    }
}

fn sum(column: &str) -> SqlExpr {
    SqlExpr::Aggregate {
        agg: AggregationOperation::Sum,
        expr: Box::new(SqlExpr::column(None, column)),
    }
}

fn coalesce_zero(expr: SqlExpr) -> SqlExpr {
    SqlExpr::Function {
        func: Function::Coalesce,
        args: vec![expr, zero()],
    }
}

fn zero() -> SqlExpr {
    SqlExpr::Literal(Value::from(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_cost_stays_plain() {
        let terms = vec![CostTerm::add(columns::COST)];
        assert_eq!(cost_expr(&terms), sum(columns::COST));
    }

    #[test]
    fn duplicate_aggregations_collapse() {
        let aggs = vec![
            ViewAggregation::sum("cost"),
            ViewAggregation::sum("COST"),
            ViewAggregation::sum("billingAmount"),
        ];
        let items = aggregation_items(&aggs, &[CostTerm::add(columns::COST)]).unwrap();
        let aliases: Vec<_> = items.iter().map(|(_, c)| c.alias.as_str()).collect();
        assert_eq!(aliases, vec!["cost", "billingAmount"]);
    }

    #[test]
    fn start_time_bounds_are_epoch_millis() {
        let aggs = vec![ViewAggregation {
            column_name: "startTime".into(),
            operation: AggregationOperation::Max,
        }];
        let items = aggregation_items(&aggs, &[]).unwrap();
        assert_eq!(items[0].1.kind, ColumnKind::MaxStartTime);
        assert!(matches!(
            items[0].0.expr,
            SqlExpr::Function {
                func: Function::EpochMillis,
                ..
            }
        ));
    }
}
