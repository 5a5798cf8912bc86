use crate::error::Result;
use crate::sql_ast::{Function, SqlBinaryOperator, SqlExpr};
use crate::views::BusinessMapping;

use super::fields::FieldContext;

/// `CASE WHEN <target rules> THEN '<target>' ... ELSE '<unallocated>' END`.
/// Targets are tried in declaration order; the first match wins.
pub(crate) fn cost_target_expr(mapping: &BusinessMapping, ctx: &FieldContext<'_>) -> Result<SqlExpr> {
    let nested = ctx.nested()?;
    let unallocated = mapping
        .unallocated_label
        .as_deref()
        .unwrap_or(ctx.unallocated_label);

    let mut branches = Vec::new();
    for target in &mapping.cost_targets {
        if let Some(when) = nested.rule_set(&target.rules)? {
            branches.push((when, SqlExpr::string(&target.name)));
        }
    }
    if branches.is_empty() {
        return Ok(SqlExpr::string(unallocated));
    }
    Ok(SqlExpr::Case {
        branches,
        else_expr: Box::new(SqlExpr::string(unallocated)),
    })
}

/// Rows matching any shared-cost rule of the mapping.
pub(crate) fn shared_cost_match(mapping: &BusinessMapping, ctx: &FieldContext<'_>) -> Result<Option<SqlExpr>> {
    let nested = ctx.nested()?;
    let mut exprs = Vec::new();
    for shared in &mapping.shared_costs {
        if let Some(expr) = nested.rule_set(&shared.rules)? {
            exprs.push(expr);
        }
    }
    Ok(SqlExpr::fold(SqlBinaryOperator::Or, exprs))
}

/// Predicate dropping shared rows from the grouped result. NULL rule
/// outcomes count as "not shared".
pub(crate) fn shared_cost_exclusion(
    mapping: &BusinessMapping,
    ctx: &FieldContext<'_>,
) -> Result<Option<SqlExpr>> {
    Ok(shared_cost_match(mapping, ctx)?.map(|matched| {
        SqlExpr::Not(Box::new(SqlExpr::Function {
            func: Function::Coalesce,
            args: vec![matched, SqlExpr::Literal(false.into())],
        }))
    }))
}
