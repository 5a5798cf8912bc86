//! Field-domain dispatch: every `FieldDomain` is resolved to SQL here and
//! nowhere else.

use crate::error::{CostViewError, Result};
use crate::registry::ViewStore;
use crate::sql_ast::{Function, LabelMatchOp, LabelUnnest, SqlBinaryOperator, SqlExpr};
use crate::views::{
    columns, FieldDomain, ViewField, ViewIdCondition, ViewIdOperator, ViewRule,
    CLUSTER_UNALLOCATED, LABEL_KEY_FIELD_ID,
};

use super::business_mapping;
use super::filters::like_pattern;

/// Nested business mappings deeper than this are treated as a cycle.
const MAX_MAPPING_DEPTH: usize = 4;

/// A group key in SQL form.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ResolvedField {
    pub expr: SqlExpr,
    /// Row predicates the field implies.
    pub predicates: Vec<SqlExpr>,
    pub label_unnest: Option<LabelUnnest>,
}

impl ResolvedField {
    fn plain(expr: SqlExpr) -> Self {
        Self {
            expr,
            predicates: Vec::new(),
            label_unnest: None,
        }
    }
}

pub(crate) struct FieldContext<'a> {
    pub store: &'a dyn ViewStore,
    pub include_unallocated_cost: bool,
    /// Bucket for rows no cost target claims, unless the mapping overrides it.
    pub unallocated_label: &'a str,
    depth: usize,
}

impl<'a> FieldContext<'a> {
    pub fn new(
        store: &'a dyn ViewStore,
        include_unallocated_cost: bool,
        unallocated_label: &'a str,
    ) -> Self {
        Self {
            store,
            include_unallocated_cost,
            unallocated_label,
            depth: 0,
        }
    }

    pub(crate) fn nested(&self) -> Result<FieldContext<'a>> {
        if self.depth >= MAX_MAPPING_DEPTH {
            return Err(CostViewError::validation(
                "business mappings nest too deeply (cycle?)",
            ));
        }
        Ok(FieldContext {
            store: self.store,
            include_unallocated_cost: self.include_unallocated_cost,
            unallocated_label: self.unallocated_label,
            depth: self.depth + 1,
        })
    }

    /// Resolve a field used as a group key.
    pub fn group_key(&self, field: &ViewField) -> Result<ResolvedField> {
        match field.identifier {
            FieldDomain::Label => {
                if field.field_id == LABEL_KEY_FIELD_ID {
                    return Ok(ResolvedField {
                        expr: SqlExpr::LabelKey { table: None },
                        predicates: Vec::new(),
                        label_unnest: Some(LabelUnnest { key: None }),
                    });
                }
                let key = label_key(field)?;
                Ok(ResolvedField {
                    expr: SqlExpr::LabelValue {
                        table: None,
                        key: key.to_string(),
                    },
                    predicates: Vec::new(),
                    label_unnest: Some(LabelUnnest {
                        key: Some(key.to_string()),
                    }),
                })
            }
            FieldDomain::BusinessMapping => {
                let mapping = self.mapping(&field.field_id)?;
                let mut resolved =
                    ResolvedField::plain(business_mapping::cost_target_expr(&mapping, self)?);
                if let Some(exclusion) = business_mapping::shared_cost_exclusion(&mapping, self)? {
                    resolved.predicates.push(exclusion);
                }
                Ok(resolved)
            }
            FieldDomain::Cluster => {
                let mut resolved = ResolvedField::plain(self.column(field)?);
                resolved.predicates = self.cluster_predicates();
                Ok(resolved)
            }
            _ => Ok(ResolvedField::plain(self.column(field)?)),
        }
    }

    /// Row predicate for one id condition, implied predicates included.
    pub fn condition(&self, cond: &ViewIdCondition) -> Result<SqlExpr> {
        let field = &cond.field;
        match field.identifier {
            FieldDomain::Label => label_condition(field, cond),
            FieldDomain::BusinessMapping => {
                let mapping = self.mapping(&field.field_id)?;
                let expr = business_mapping::cost_target_expr(&mapping, self)?;
                Ok(value_condition(expr, cond))
            }
            FieldDomain::Cluster => {
                let mut preds = self.cluster_predicates();
                preds.push(value_condition(self.column(field)?, cond));
                SqlExpr::fold(SqlBinaryOperator::And, preds)
                    .ok_or_else(|| CostViewError::Sql("empty cluster predicate".to_string()))
            }
            _ => Ok(value_condition(self.column(field)?, cond)),
        }
    }

    /// Conjunction of a rule's conditions; `None` for an empty rule.
    pub fn rule(&self, rule: &ViewRule) -> Result<Option<SqlExpr>> {
        let conds = rule
            .conditions
            .iter()
            .map(|c| self.condition(c))
            .collect::<Result<Vec<_>>>()?;
        Ok(SqlExpr::fold(SqlBinaryOperator::And, conds))
    }

    /// Disjunction of rules; `None` when no rule has conditions.
    pub fn rule_set(&self, rules: &[ViewRule]) -> Result<Option<SqlExpr>> {
        let mut exprs = Vec::new();
        for rule in rules {
            if let Some(expr) = self.rule(rule)? {
                exprs.push(expr);
            }
        }
        Ok(SqlExpr::fold(SqlBinaryOperator::Or, exprs))
    }

    fn mapping(&self, id: &str) -> Result<crate::views::BusinessMapping> {
        self.store
            .business_mapping(id)
            .ok_or_else(|| CostViewError::validation(format!("unknown business mapping {id}")))
    }

    fn column(&self, field: &ViewField) -> Result<SqlExpr> {
        let id = field.field_id.as_str();
        if !is_identifier(id) {
            return Err(CostViewError::validation(format!(
                "invalid field identifier {id:?}"
            )));
        }
        let prefix = match field.identifier {
            FieldDomain::Aws => Some("aws"),
            FieldDomain::Gcp => Some("gcp"),
            FieldDomain::Azure => Some("azure"),
            _ => None,
        };
        if let Some(prefix) = prefix {
            if !id.to_ascii_lowercase().starts_with(prefix) {
                return Err(CostViewError::validation(format!(
                    "field {id} does not belong to {:?}",
                    field.identifier
                )));
            }
        }
        Ok(SqlExpr::column(None, id))
    }

    fn cluster_predicates(&self) -> Vec<SqlExpr> {
        let mut preds = vec![SqlExpr::IsNull {
            expr: Box::new(SqlExpr::column(None, columns::CLUSTER_NAME)),
            negated: true,
        }];
        if !self.include_unallocated_cost {
            preds.push(SqlExpr::binary(
                SqlBinaryOperator::Neq,
                coalesce_empty(SqlExpr::column(None, columns::INSTANCE_TYPE)),
                SqlExpr::string(CLUSTER_UNALLOCATED),
            ));
        }
        preds
    }
}

/// `coalesce(expr, '')`, so comparisons against NULL evaluate to a boolean.
pub(crate) fn coalesce_empty(expr: SqlExpr) -> SqlExpr {
    SqlExpr::Function {
        func: Function::Coalesce,
        args: vec![expr, SqlExpr::string("")],
    }
}

fn label_key(field: &ViewField) -> Result<&str> {
    let key = field.field_name.trim();
    if key.is_empty() {
        return Err(CostViewError::validation("label field needs a label key"));
    }
    Ok(key)
}

fn label_condition(field: &ViewField, cond: &ViewIdCondition) -> Result<SqlExpr> {
    if field.field_id == LABEL_KEY_FIELD_ID {
        // Filtering on the key list: the row carries (or lacks) those keys.
        let (op, join) = match cond.operator {
            ViewIdOperator::In => (LabelMatchOp::Exists, SqlBinaryOperator::Or),
            ViewIdOperator::NotIn => (LabelMatchOp::NotExists, SqlBinaryOperator::And),
            other => {
                return Err(CostViewError::validation(format!(
                    "{other:?} is not supported on label keys"
                )))
            }
        };
        let matches = cond
            .values
            .iter()
            .map(|key| SqlExpr::LabelMatch {
                table: None,
                key: key.clone(),
                op,
                values: Vec::new(),
            })
            .collect();
        return SqlExpr::fold(join, matches)
            .ok_or_else(|| CostViewError::validation("label key filter needs values"));
    }

    let key = label_key(field)?.to_string();
    let (op, values) = match cond.operator {
        ViewIdOperator::In => (LabelMatchOp::In, literals(&cond.values)),
        ViewIdOperator::NotIn => (LabelMatchOp::NotIn, literals(&cond.values)),
        ViewIdOperator::Null => (LabelMatchOp::NotExists, Vec::new()),
        ViewIdOperator::NotNull => (LabelMatchOp::Exists, Vec::new()),
        ViewIdOperator::Like => (
            LabelMatchOp::Like,
            cond.values.iter().map(|v| like_pattern(v)).collect(),
        ),
    };
    Ok(SqlExpr::LabelMatch {
        table: None,
        key,
        op,
        values,
    })
}

fn value_condition(expr: SqlExpr, cond: &ViewIdCondition) -> SqlExpr {
    match cond.operator {
        ViewIdOperator::In | ViewIdOperator::NotIn => SqlExpr::InList {
            expr: Box::new(expr),
            list: literals(&cond.values),
            negated: cond.operator == ViewIdOperator::NotIn,
        },
        ViewIdOperator::Null | ViewIdOperator::NotNull => SqlExpr::IsNull {
            expr: Box::new(expr),
            negated: cond.operator == ViewIdOperator::NotNull,
        },
        ViewIdOperator::Like => {
            let lowered = SqlExpr::Function {
                func: Function::Lower,
                args: vec![expr],
            };
            let likes = cond
                .values
                .iter()
                .map(|v| SqlExpr::binary(SqlBinaryOperator::Like, lowered.clone(), like_pattern(v)))
                .collect();
            // Validation guarantees at least one value
            SqlExpr::fold(SqlBinaryOperator::Or, likes).unwrap_or(SqlExpr::Literal(false.into()))
        }
    }
}

fn literals(values: &[String]) -> Vec<SqlExpr> {
    values.iter().map(|v| SqlExpr::string(v)).collect()
}

pub(crate) fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
