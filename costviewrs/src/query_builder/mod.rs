//! Turns a `ViewQueryRequest` into a backend-neutral `SelectQuery`.
//!
//! The builder resolves saved-view rules, default group-bys, business
//! mappings and the preference-driven cost formula, then hands back a
//! `QuerySpec` that any dialect can render.

use crate::config::ViewConfig;
use crate::error::{CostViewError, Result};
use crate::preferences::CostFormula;
use crate::registry::ViewStore;
use crate::sql_ast::{
    Function, OrderItem, SelectItem, SelectQuery, SqlBinaryOperator, SqlExpr, TableRef,
};
use crate::views::{
    columns, AggregationOperation, BusinessMapping, CostView, FieldDomain, SharedCost, SortOrder, SortType,
    TimeGranularity, ViewAggregation, ViewField, ViewGroupBy, ViewIdCondition, ViewIdOperator,
    ViewQueryRequest, ViewRule, DEFAULT_GROUP_BY_FIELD, LABEL_KEY_FIELD_ID,
};

mod business_mapping;
mod fields;
mod filters;
mod measures;
mod plan;

pub use plan::{ColumnKind, OutputColumn, QuerySpec};

use fields::FieldContext;
use filters::PartitionedFilters;

pub const GROUP_KEY_ALIAS: &str = "group_key";
pub const TIME_BUCKET_ALIAS: &str = "time_bucket";
pub const FILTER_VALUE_ALIAS: &str = "filter_value";

/// Shape of the statement to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// One row per group key.
    Grid,
    /// One row per (group key, time bucket).
    TimeSeries,
    /// A single row: cost plus start-time bounds.
    CostData,
    /// Distinct values of the field named by the first id filter.
    FilterValues,
}

pub struct ViewQueryBuilder<'a> {
    store: &'a dyn ViewStore,
    config: &'a ViewConfig,
    default_limit: Option<u64>,
}

impl<'a> ViewQueryBuilder<'a> {
    pub fn new(store: &'a dyn ViewStore, config: &'a ViewConfig) -> Self {
        Self {
            store,
            config,
            default_limit: None,
        }
    }

    /// Limit for grids and filter values when the request sets none.
    pub fn with_default_limit(mut self, limit: u64) -> Self {
        self.default_limit = Some(limit);
        self
    }

    /// Saved view named by the request's metadata filter, if any.
    pub fn resolve_view(&self, request: &ViewQueryRequest) -> Result<Option<CostView>> {
        let parts = filters::partition(&request.filters)?;
        self.view_for(&parts)
    }

    /// Entity group key after defaults: request, then view, then the
    /// configured fallback field.
    pub fn entity_group_by(
        &self,
        request: &ViewQueryRequest,
        view: Option<&CostView>,
    ) -> Result<ViewField> {
        let mut entities = request.group_by.iter().filter_map(|g| match g {
            ViewGroupBy::Entity { field } => Some(field),
            ViewGroupBy::Time { .. } => None,
        });
        let first = entities.next();
        if entities.next().is_some() {
            return Err(CostViewError::validation(
                "at most one entity group-by is supported",
            ));
        }
        Ok(first
            .cloned()
            .or_else(|| view.and_then(|v| v.default_group_by.clone()))
            .unwrap_or_else(|| self.default_field()))
    }

    /// Business mapping the request groups by, if any.
    pub fn grouped_mapping(
        &self,
        request: &ViewQueryRequest,
        view: Option<&CostView>,
    ) -> Result<Option<BusinessMapping>> {
        let field = self.entity_group_by(request, view)?;
        if field.identifier != FieldDomain::BusinessMapping {
            return Ok(None);
        }
        self.store
            .business_mapping(&field.field_id)
            .map(Some)
            .ok_or_else(|| {
                CostViewError::validation(format!("unknown business mapping {}", field.field_id))
            })
    }

    pub fn build(
        &self,
        request: &ViewQueryRequest,
        kind: QueryKind,
        formula: &CostFormula,
    ) -> Result<QuerySpec> {
        let parts = filters::partition(&request.filters)?;
        let view = self.view_for(&parts)?;
        let ctx = self.context(formula);
        let spec = match kind {
            QueryKind::Grid | QueryKind::TimeSeries => {
                self.grouped(request, &parts, view.as_ref(), &ctx, formula, kind)?
            }
            QueryKind::CostData => self.cost_data(request, &parts, view.as_ref(), &ctx, formula)?,
            QueryKind::FilterValues => self.filter_values(request, parts, view.as_ref(), &ctx)?,
        };
        tracing::debug!(
            kind = ?kind,
            columns = spec.columns.len(),
            filters = spec.query.filters.len(),
            "built view query"
        );
        Ok(spec)
    }

    /// Total cost of rows matching `shared`'s rules under the request's
    /// filters, minus any filter on `mapping` itself. `None` when the shared
    /// cost has no rules.
    pub fn shared_cost_total(
        &self,
        request: &ViewQueryRequest,
        mapping: &BusinessMapping,
        shared: &SharedCost,
        formula: &CostFormula,
    ) -> Result<Option<QuerySpec>> {
        let parts = filters::partition(&request.filters)?;
        let view = self.view_for(&parts)?;
        let ctx = self.context(formula);
        let Some(shared_rows) = ctx.rule_set(&shared.rules)? else {
            return Ok(None);
        };
        let mut predicates = self.predicates(&parts, view.as_ref(), &ctx, Some(&mapping.id))?;
        predicates.push(shared_rows);

        let mut query = self.base_query(predicates);
        let mut columns = Vec::new();
        for (item, column) in measures::aggregation_items(&measures::default_aggregations(), &formula.terms)? {
            query.select.push(item);
            columns.push(column);
        }
        Ok(Some(QuerySpec { query, columns }))
    }

    /// Cost per declared cost target of `mapping`, shared rows excluded,
    /// under the request's filters minus any filter on `mapping`.
    pub fn cost_target_weights(
        &self,
        request: &ViewQueryRequest,
        mapping: &BusinessMapping,
        formula: &CostFormula,
    ) -> Result<QuerySpec> {
        let parts = filters::partition(&request.filters)?;
        let view = self.view_for(&parts)?;
        let ctx = self.context(formula);
        let mut predicates = self.predicates(&parts, view.as_ref(), &ctx, Some(&mapping.id))?;
        if let Some(exclusion) = business_mapping::shared_cost_exclusion(mapping, &ctx)? {
            predicates.push(exclusion);
        }

        let mut query = self.base_query(predicates);
        query.select.push(SelectItem {
            expr: business_mapping::cost_target_expr(mapping, &ctx)?,
            alias: Some(GROUP_KEY_ALIAS.to_string()),
        });
        query.group_by.push(alias_ref(GROUP_KEY_ALIAS));
        let mut columns =
            vec![OutputColumn::new(GROUP_KEY_ALIAS, ColumnKind::GroupKey).with_source(&mapping.id)];
        for (item, column) in measures::aggregation_items(&measures::default_aggregations(), &formula.terms)? {
            query.select.push(item);
            columns.push(column);
        }
        query.order_by.push(OrderItem {
            expr: alias_ref(GROUP_KEY_ALIAS),
            direction: SortOrder::Asc,
        });
        Ok(QuerySpec { query, columns })
    }

    /// `spec` additionally grouped by `grain` time buckets, oldest first.
    /// Used to split shared costs per bucket of a time series.
    pub fn per_time_bucket(&self, mut spec: QuerySpec, grain: TimeGranularity) -> QuerySpec {
        let at = spec
            .columns
            .iter()
            .take_while(|c| c.kind == ColumnKind::GroupKey)
            .count();
        spec.query.select.insert(
            at,
            SelectItem {
                expr: time_bucket(grain),
                alias: Some(TIME_BUCKET_ALIAS.to_string()),
            },
        );
        spec.columns.insert(
            at,
            OutputColumn::new(TIME_BUCKET_ALIAS, ColumnKind::TimeBucket)
                .with_source(columns::START_TIME),
        );
        spec.query.group_by.push(alias_ref(TIME_BUCKET_ALIAS));
        spec.query.order_by.insert(
            0,
            OrderItem {
                expr: alias_ref(TIME_BUCKET_ALIAS),
                direction: SortOrder::Asc,
            },
        );
        spec
    }

    fn view_for(&self, parts: &PartitionedFilters) -> Result<Option<CostView>> {
        let Some(meta) = &parts.metadata else {
            return Ok(None);
        };
        match self.store.view(&meta.view_id) {
            Some(view) => Ok(Some(view)),
            // Previews may reference a view that is not saved yet
            None if meta.is_preview => Ok(None),
            None => Err(CostViewError::validation(format!(
                "unknown view {}",
                meta.view_id
            ))),
        }
    }

    fn context(&self, formula: &CostFormula) -> FieldContext<'a> {
        FieldContext::new(
            self.store,
            formula.include_unallocated_cost,
            &self.config.unallocated_label,
        )
    }

    fn default_field(&self) -> ViewField {
        let id = self.config.default_group_by_field.as_str();
        if id == DEFAULT_GROUP_BY_FIELD.field_id {
            DEFAULT_GROUP_BY_FIELD.clone()
        } else {
            ViewField::common(id)
        }
    }

    /// Time-series grain: the request's, then the view's default, then `DAY`.
    pub fn granularity(
        &self,
        request: &ViewQueryRequest,
        view: Option<&CostView>,
    ) -> Result<TimeGranularity> {
        let mut grains = request.group_by.iter().filter_map(|g| match g {
            ViewGroupBy::Time { granularity } => Some(*granularity),
            ViewGroupBy::Entity { .. } => None,
        });
        let first = grains.next();
        if grains.next().is_some() {
            return Err(CostViewError::validation(
                "at most one time group-by is supported",
            ));
        }
        Ok(first
            .or_else(|| view.and_then(|v| v.default_granularity))
            .unwrap_or(TimeGranularity::Day))
    }

    fn base_query(&self, filters: Vec<SqlExpr>) -> SelectQuery {
        SelectQuery {
            from: TableRef {
                name: self.config.table.clone(),
                alias: None,
            },
            filters,
            ..Default::default()
        }
    }

    /// WHERE predicates from time, id and rule filters. A saved (non-preview)
    /// view's stored rules replace ad-hoc rule filters. Conditions on
    /// `skip_mapping` are dropped.
    fn predicates(
        &self,
        parts: &PartitionedFilters,
        view: Option<&CostView>,
        ctx: &FieldContext<'_>,
        skip_mapping: Option<&str>,
    ) -> Result<Vec<SqlExpr>> {
        let mut preds = filters::time_predicates(parts.after, parts.before);
        for cond in &parts.ids {
            if targets_mapping(cond, skip_mapping) {
                continue;
            }
            preds.push(ctx.condition(cond)?);
        }

        let rules = match (parts.saved_view_id(), view) {
            (Some(_), Some(view)) => &view.rules,
            _ => &parts.rules,
        };
        let rules = match skip_mapping {
            Some(id) => strip_mapping(rules, id),
            None => Some(rules.clone()),
        };
        if let Some(rules) = rules {
            if let Some(expr) = ctx.rule_set(&rules)? {
                preds.push(expr);
            }
        }
        Ok(preds)
    }

    fn grouped(
        &self,
        request: &ViewQueryRequest,
        parts: &PartitionedFilters,
        view: Option<&CostView>,
        ctx: &FieldContext<'_>,
        formula: &CostFormula,
        kind: QueryKind,
    ) -> Result<QuerySpec> {
        let field = self.entity_group_by(request, view)?;
        let key = ctx.group_key(&field)?;

        let mut query = self.base_query(self.predicates(parts, view, ctx, None)?);
        query.filters.extend(key.predicates);
        query.label_unnest = key.label_unnest;
        query.select.push(SelectItem {
            expr: key.expr,
            alias: Some(GROUP_KEY_ALIAS.to_string()),
        });
        query.group_by.push(alias_ref(GROUP_KEY_ALIAS));
        let mut columns = vec![
            OutputColumn::new(GROUP_KEY_ALIAS, ColumnKind::GroupKey).with_source(&field.field_id),
        ];

        let time_series = kind == QueryKind::TimeSeries;
        if time_series {
            let grain = self.granularity(request, view)?;
            query.select.push(SelectItem {
                expr: time_bucket(grain),
                alias: Some(TIME_BUCKET_ALIAS.to_string()),
            });
            query.group_by.push(alias_ref(TIME_BUCKET_ALIAS));
            columns.push(
                OutputColumn::new(TIME_BUCKET_ALIAS, ColumnKind::TimeBucket)
                    .with_source(columns::START_TIME),
            );
        }

        let aggregations = if request.aggregations.is_empty() {
            measures::default_aggregations()
        } else {
            request.aggregations.clone()
        };
        for (item, column) in measures::aggregation_items(&aggregations, &formula.terms)? {
            query.select.push(item);
            columns.push(column);
        }

        let mut spec = QuerySpec { query, columns };
        spec.query.order_by = order_by(request, &spec, time_series, GROUP_KEY_ALIAS);

        let limit = if time_series {
            request.limit
        } else {
            request.limit.or(self.default_limit)
        };
        Ok(spec.paginate(limit, request.offset))
    }

    fn cost_data(
        &self,
        request: &ViewQueryRequest,
        parts: &PartitionedFilters,
        view: Option<&CostView>,
        ctx: &FieldContext<'_>,
        formula: &CostFormula,
    ) -> Result<QuerySpec> {
        let mut query = self.base_query(self.predicates(parts, view, ctx, None)?);
        let mut aggregations: Vec<_> = request
            .aggregations
            .iter()
            .filter(|a| a.operation == AggregationOperation::Sum)
            .cloned()
            .collect();
        if aggregations.is_empty() {
            aggregations = measures::default_aggregations();
        }
        for operation in [AggregationOperation::Min, AggregationOperation::Max] {
            aggregations.push(ViewAggregation {
                column_name: columns::START_TIME.to_string(),
                operation,
            });
        }

        let mut columns = Vec::new();
        for (item, column) in measures::aggregation_items(&aggregations, &formula.terms)? {
            query.select.push(item);
            columns.push(column);
        }
        Ok(QuerySpec { query, columns })
    }

    fn filter_values(
        &self,
        request: &ViewQueryRequest,
        mut parts: PartitionedFilters,
        view: Option<&CostView>,
        ctx: &FieldContext<'_>,
    ) -> Result<QuerySpec> {
        if parts.ids.is_empty() {
            return Err(CostViewError::validation(
                "filter values need an id filter naming the field",
            ));
        }
        let target = parts.ids.remove(0);
        let field = &target.field;
        let key = ctx.group_key(field)?;
        let label_keys =
            field.identifier == FieldDomain::Label && field.field_id == LABEL_KEY_FIELD_ID;

        let mut query = self.base_query(self.predicates(&parts, view, ctx, None)?);
        query.distinct = true;
        query.filters.extend(key.predicates);
        query.label_unnest = key.label_unnest;
        // Label keys come out of a set-returning expression that WHERE cannot reference.
        if !label_keys {
            query.filters.push(SqlExpr::IsNull {
                expr: Box::new(key.expr.clone()),
                negated: true,
            });
            if let Some(search) = search_predicate(&key.expr, &target) {
                query.filters.push(search);
            }
        }
        query.select.push(SelectItem {
            expr: key.expr,
            alias: Some(FILTER_VALUE_ALIAS.to_string()),
        });
        query.order_by.push(OrderItem {
            expr: alias_ref(FILTER_VALUE_ALIAS),
            direction: SortOrder::Asc,
        });

        let columns = vec![
            OutputColumn::new(FILTER_VALUE_ALIAS, ColumnKind::GroupKey).with_source(&field.field_id),
        ];
        Ok(QuerySpec { query, columns }
            .paginate(request.limit.or(self.default_limit), request.offset))
    }
}

fn alias_ref(alias: &str) -> SqlExpr {
    SqlExpr::column(None, alias)
}

fn time_bucket(grain: TimeGranularity) -> SqlExpr {
    SqlExpr::Function {
        func: Function::EpochMillis,
        args: vec![SqlExpr::Function {
            func: Function::DateTrunc(grain),
            args: vec![SqlExpr::column(None, columns::START_TIME)],
        }],
    }
}

/// Case-insensitive substring search over the target filter's values.
fn search_predicate(expr: &SqlExpr, target: &ViewIdCondition) -> Option<SqlExpr> {
    if !matches!(target.operator, ViewIdOperator::In | ViewIdOperator::Like) {
        return None;
    }
    let lowered = SqlExpr::Function {
        func: Function::Lower,
        args: vec![expr.clone()],
    };
    let likes = target
        .values
        .iter()
        .filter(|v| !v.trim().is_empty())
        .map(|v| {
            SqlExpr::binary(
                SqlBinaryOperator::Like,
                lowered.clone(),
                filters::like_pattern(v.trim()),
            )
        })
        .collect();
    SqlExpr::fold(SqlBinaryOperator::Or, likes)
}

fn order_by(
    request: &ViewQueryRequest,
    spec: &QuerySpec,
    time_series: bool,
    key_alias: &str,
) -> Vec<OrderItem> {
    let cost_alias = spec.column(ColumnKind::Cost).map(|c| c.alias.clone());
    let by = |alias: &str, direction: SortOrder| OrderItem {
        expr: alias_ref(alias),
        direction,
    };

    let mut items = Vec::new();
    if request.sort.is_empty() {
        if time_series {
            items.push(by(TIME_BUCKET_ALIAS, SortOrder::Asc));
        }
        if let Some(cost) = &cost_alias {
            items.push(by(cost, SortOrder::Desc));
        }
    } else {
        for sort in &request.sort {
            match sort.sort_type {
                SortType::Cost => {
                    if let Some(cost) = &cost_alias {
                        items.push(by(cost, sort.order));
                    }
                }
                SortType::Name => items.push(by(key_alias, sort.order)),
                SortType::Time if time_series => items.push(by(TIME_BUCKET_ALIAS, sort.order)),
                SortType::Time => {}
            }
        }
    }
    // Stable tie-break so pagination is deterministic
    if !items.iter().any(|o| o.expr == alias_ref(key_alias)) {
        items.push(by(key_alias, SortOrder::Asc));
    }
    items
}

fn targets_mapping(cond: &ViewIdCondition, mapping_id: Option<&str>) -> bool {
    mapping_id.is_some_and(|id| {
        cond.field.identifier == FieldDomain::BusinessMapping && cond.field.field_id == id
    })
}

/// Rules with conditions on `mapping_id` removed. `None` when a rule loses
/// all its conditions, which leaves the rule set unrestricted.
fn strip_mapping(rules: &[ViewRule], mapping_id: &str) -> Option<Vec<ViewRule>> {
    let mut stripped = Vec::with_capacity(rules.len());
    for rule in rules {
        let conditions: Vec<_> = rule
            .conditions
            .iter()
            .filter(|c| !targets_mapping(c, Some(mapping_id)))
            .cloned()
            .collect();
        if conditions.is_empty() && !rule.conditions.is_empty() {
            return None;
        }
        stripped.push(ViewRule::new(conditions));
    }
    Some(stripped)
}
