use serde_json::Value;

use crate::dialect::Dialect;
use crate::views::{AggregationOperation, SortOrder, TimeGranularity};

#[derive(Debug, Clone, PartialEq)]
pub enum Function {
    DateTrunc(TimeGranularity),
    /// Timestamp → epoch milliseconds.
    EpochMillis,
    /// Epoch milliseconds → timestamp.
    TimestampFromMillis,
    Coalesce,
    Lower,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelMatchOp {
    In,
    NotIn,
    Exists,
    NotExists,
    Like,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlExpr {
    Column {
        table: Option<String>,
        name: String,
    },
    Literal(Value),
    Function {
        func: Function,
        args: Vec<SqlExpr>,
    },
    Case {
        branches: Vec<(SqlExpr, SqlExpr)>,
        else_expr: Box<SqlExpr>,
    },
    BinaryOp {
        op: SqlBinaryOperator,
        left: Box<SqlExpr>,
        right: Box<SqlExpr>,
    },
    Aggregate {
        agg: AggregationOperation,
        expr: Box<SqlExpr>,
    },
    InList {
        expr: Box<SqlExpr>,
        list: Vec<SqlExpr>,
        negated: bool,
    },
    IsNull {
        expr: Box<SqlExpr>,
        negated: bool,
    },
    Not(Box<SqlExpr>),
    /// Value of one label key on the current row.
    LabelValue {
        table: Option<String>,
        key: String,
    },
    /// Label keys of the current row (one output row per key).
    LabelKey {
        table: Option<String>,
    },
    LabelMatch {
        table: Option<String>,
        key: String,
        op: LabelMatchOp,
        values: Vec<SqlExpr>,
    },
}

impl SqlExpr {
    pub fn column(table: Option<&str>, name: &str) -> Self {
        SqlExpr::Column {
            table: table.map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn string(value: &str) -> Self {
        SqlExpr::Literal(Value::String(value.to_string()))
    }

    pub fn binary(op: SqlBinaryOperator, left: SqlExpr, right: SqlExpr) -> Self {
        SqlExpr::BinaryOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Fold expressions with `op`; `None` when `exprs` is empty.
    pub fn fold(op: SqlBinaryOperator, exprs: Vec<SqlExpr>) -> Option<SqlExpr> {
        exprs
            .into_iter()
            .reduce(|acc, next| SqlExpr::binary(op, acc, next))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlBinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    And,
    Or,
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub expr: SqlExpr,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableRef {
    pub name: String,
    pub alias: Option<String>,
}

/// Request to flatten the nested label structure of the base table.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelUnnest {
    /// Restrict flattened rows to this key; `None` keeps every key.
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    pub expr: SqlExpr,
    pub direction: SortOrder,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectQuery {
    pub distinct: bool,
    pub select: Vec<SelectItem>,
    pub from: TableRef,
    pub label_unnest: Option<LabelUnnest>,
    pub filters: Vec<SqlExpr>,
    pub group_by: Vec<SqlExpr>,
    pub order_by: Vec<OrderItem>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

pub struct SqlRenderer<'d> {
    dialect: &'d dyn Dialect,
}

impl<'d> SqlRenderer<'d> {
    pub fn new(dialect: &'d dyn Dialect) -> Self {
        Self { dialect }
    }

    pub fn render_select(&self, query: &SelectQuery) -> String {
        let select_items: Vec<String> = query
            .select
            .iter()
            .map(|item| {
                let expr_sql = self.render_expr(&item.expr);
                match &item.alias {
                    Some(alias) => format!("{expr_sql} AS {}", self.dialect.quote_ident(alias)),
                    None => expr_sql,
                }
            })
            .collect();

        let distinct_kw = if query.distinct { "DISTINCT " } else { "" };
        let mut sql = format!(
            "SELECT {distinct_kw}{} FROM {}",
            select_items.join(", "),
            self.render_table_ref(&query.from)
        );

        let labels = self.labels_column(query.from.alias.as_deref());
        let mut filters: Vec<String> = query.filters.iter().map(|f| self.render_expr(f)).collect();
        if let Some(unnest) = &query.label_unnest {
            if let Some(join) = self.dialect.render_label_unnest(&labels) {
                sql.push(' ');
                sql.push_str(&join);
            }
            if let Some(key) = &unnest.key {
                if let Some(pred) = self.dialect.render_label_key_predicate(key) {
                    filters.push(pred);
                }
            }
        }

        if !filters.is_empty() {
            sql.push_str(&format!(" WHERE {}", filters.join(" AND ")));
        }

        if !query.group_by.is_empty() {
            let groups: Vec<String> = query.group_by.iter().map(|g| self.render_expr(g)).collect();
            sql.push_str(&format!(" GROUP BY {}", groups.join(", ")));
        }

        if !query.order_by.is_empty() {
            let orders: Vec<String> = query
                .order_by
                .iter()
                .map(|o| {
                    let expr = self.render_expr(&o.expr);
                    let dir = match o.direction {
                        SortOrder::Asc => "ASC",
                        SortOrder::Desc => "DESC",
                    };
                    format!("{expr} {dir}")
                })
                .collect();
            sql.push_str(&format!(" ORDER BY {}", orders.join(", ")));
        }

        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        if let Some(offset) = query.offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }

        sql
    }

    fn render_table_ref(&self, table: &TableRef) -> String {
        match &table.alias {
            Some(alias) => format!(
                "{} {}",
                self.dialect.qualify_table(&table.name),
                self.dialect.quote_ident(alias)
            ),
            None => self.dialect.qualify_table(&table.name),
        }
    }

    fn labels_column(&self, table: Option<&str>) -> String {
        self.render_expr(&SqlExpr::column(table, crate::views::columns::LABELS))
    }

    fn render_expr(&self, expr: &SqlExpr) -> String {
        match expr {
            SqlExpr::Column { table, name } => match table {
                Some(t) => format!(
                    "{}.{}",
                    self.dialect.quote_ident(t),
                    self.dialect.quote_ident(name)
                ),
                None => self.dialect.quote_ident(name),
            },
            SqlExpr::Literal(v) => self.dialect.render_literal(v),
            SqlExpr::Function { func, args } => {
                let rendered_args: Vec<String> = args.iter().map(|a| self.render_expr(a)).collect();
                self.dialect.render_function(func, rendered_args)
            }
            SqlExpr::Case {
                branches,
                else_expr,
            } => {
                let mut parts = Vec::new();
                parts.push("CASE".to_string());
                for (when, then) in branches {
                    parts.push(format!(
                        " WHEN {} THEN {}",
                        self.render_expr(when),
                        self.render_expr(then)
                    ));
                }
                parts.push(format!(" ELSE {} END", self.render_expr(else_expr)));
                parts.join("")
            }
            SqlExpr::BinaryOp { op, left, right } => {
                let op_sql = match op {
                    SqlBinaryOperator::Add => "+",
                    SqlBinaryOperator::Subtract => "-",
                    SqlBinaryOperator::Multiply => "*",
                    SqlBinaryOperator::Divide => "/",
                    SqlBinaryOperator::And => "AND",
                    SqlBinaryOperator::Or => "OR",
                    SqlBinaryOperator::Eq => "=",
                    SqlBinaryOperator::Neq => "!=",
                    SqlBinaryOperator::Gt => ">",
                    SqlBinaryOperator::Gte => ">=",
                    SqlBinaryOperator::Lt => "<",
                    SqlBinaryOperator::Lte => "<=",
                    SqlBinaryOperator::Like => "LIKE",
                };
                format!(
                    "({} {} {})",
                    self.render_expr(left),
                    op_sql,
                    self.render_expr(right)
                )
            }
            SqlExpr::Aggregate { agg, expr } => self
                .dialect
                .render_aggregation(agg, &self.render_expr(expr)),
            SqlExpr::InList {
                expr,
                list,
                negated,
            } => {
                let rendered_values: Vec<String> =
                    list.iter().map(|v| self.render_expr(v)).collect();
                let not_kw = if *negated { "NOT " } else { "" };
                format!(
                    "{} {}IN ({})",
                    self.render_expr(expr),
                    not_kw,
                    rendered_values.join(", ")
                )
            }
            SqlExpr::IsNull { expr, negated } => {
                let not_kw = if *negated { "NOT " } else { "" };
                format!("{} IS {}NULL", self.render_expr(expr), not_kw)
            }
            SqlExpr::Not(inner) => format!("NOT ({})", self.render_expr(inner)),
            SqlExpr::LabelValue { table, key } => self
                .dialect
                .render_label_value(&self.labels_column(table.as_deref()), key),
            SqlExpr::LabelKey { table } => self
                .dialect
                .render_label_key(&self.labels_column(table.as_deref())),
            SqlExpr::LabelMatch {
                table,
                key,
                op,
                values,
            } => {
                let rendered_values: Vec<String> =
                    values.iter().map(|v| self.render_expr(v)).collect();
                self.dialect.render_label_match(
                    &self.labels_column(table.as_deref()),
                    key,
                    *op,
                    &rendered_values,
                )
            }
        }
    }
}
