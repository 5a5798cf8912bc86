//! Cost view operations: grids, time series, trend cards, filter values
//! and shared-cost buckets.
//!
//! Every operation returns `Err` for invalid requests and cancellation,
//! `Ok(None)` when the backend query failed, and `Ok(Some(..))` otherwise
//! (empty when nothing matched).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{TimeZone, Utc};

use crate::backends::ConnectionManager;
use crate::config::ResolvedDatasourceConfig;
use crate::error::{CostViewError, Result};
use crate::executor::{QueryExecutor, QueryOutcome, QueryResult};
use crate::preferences::{self, CostFormula};
use crate::query_builder::{QueryKind, QuerySpec, ViewQueryBuilder};
use crate::registry::ViewStore;
use crate::result_mapper::{round2, ResultMapper};
use crate::settings_cache::{SettingsCache, SettingsProvider};
use crate::shared_cost::SharedCostAllocator;
use crate::trend;
use crate::views::{
    BusinessMapping, CostBuckets, CostView, EntityStatsDataPoint, EntityStatsGrid, TimeSeries, TrendStats,
    ViewCostData, ViewField, ViewGroupBy, ViewQueryRequest, OTHERS,
};

pub const TOTAL_COST_LABEL: &str = "Total Cost";
pub const FORECAST_COST_LABEL: &str = "Forecasted Cost";

pub struct CostViewService {
    store: Arc<dyn ViewStore>,
    executor: QueryExecutor,
    settings: SettingsCache,
    config: ResolvedDatasourceConfig,
}

impl CostViewService {
    pub fn new(
        store: Arc<dyn ViewStore>,
        executor: QueryExecutor,
        settings: SettingsCache,
        config: ResolvedDatasourceConfig,
    ) -> Self {
        Self {
            store,
            executor,
            settings,
            config,
        }
    }

    /// Service over a registered datasource, using its resolved config.
    pub fn for_datasource(
        connections: &ConnectionManager,
        datasource: &str,
        store: Arc<dyn ViewStore>,
        provider: Arc<dyn SettingsProvider>,
    ) -> Result<Self> {
        let executor = connections.executor(datasource).ok_or_else(|| {
            CostViewError::Config(format!("data source {datasource} not registered"))
        })?;
        let config = connections.config_for(datasource);
        let cache_config = connections
            .config()
            .map(|c| c.defaults.settings_cache.clone())
            .unwrap_or_default();
        let settings = SettingsCache::new(provider, &cache_config);
        Ok(Self::new(store, executor, settings, config))
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    fn builder(&self) -> ViewQueryBuilder<'_> {
        ViewQueryBuilder::new(self.store.as_ref(), &self.config.view)
            .with_default_limit(self.config.query.default_row_limit)
    }

    /// Preferences folded into a cost formula. A failing settings lookup
    /// falls back to the built-in defaults.
    async fn formula(&self, request: &ViewQueryRequest, view: Option<&CostView>) -> CostFormula {
        let account = match self.settings.get(&request.account_id).await {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(
                    account_id = %request.account_id,
                    error = %e,
                    "account settings unavailable, using defaults"
                );
                Arc::new(HashMap::new())
            }
        };
        preferences::resolve(request.preferences.as_ref(), view, &account).cost_formula()
    }

    /// Run a spec; failures become `None`, cancellation becomes `Err`.
    async fn run(&self, spec: &QuerySpec) -> Result<Option<QueryResult>> {
        match self.executor.execute(spec).await {
            QueryOutcome::Failed(failure) if failure.cancelled => {
                Err(CostViewError::Cancelled(failure.message))
            }
            outcome => Ok(outcome.into_result()),
        }
    }

    pub async fn get_filter_value_stats(
        &self,
        request: &ViewQueryRequest,
    ) -> Result<Option<Vec<String>>> {
        let builder = self.builder();
        let view = builder.resolve_view(request)?;
        let formula = self.formula(request, view.as_ref()).await;
        let spec = builder.build(request, QueryKind::FilterValues, &formula)?;
        let Some(result) = self.run(&spec).await? else {
            return Ok(None);
        };
        Ok(Some(ResultMapper::default().filter_values(&spec, &result)))
    }

    pub async fn get_entity_stats_data_points(
        &self,
        request: &ViewQueryRequest,
    ) -> Result<Option<EntityStatsGrid>> {
        let builder = self.builder();
        let view = builder.resolve_view(request)?;
        let formula = self.formula(request, view.as_ref()).await;
        let mapping = builder.grouped_mapping(request, view.as_ref())?;
        let spec = builder.build(request, QueryKind::Grid, &formula)?;

        let Some(result) = self.run(&spec).await? else {
            return Ok(None);
        };
        // Costs stay unrounded until shares are added; display rounding happens once.
        let mut rows = ResultMapper::new(true).entity_costs(&spec, &result);

        let mut unresolved = Vec::new();
        let mut shared = mapping.filter(|m| m.has_shared_costs());
        if let Some(mapping) = &shared {
            let present: Vec<String> = rows.iter().map(|(name, _)| name.clone()).collect();
            let allocator = SharedCostAllocator::new(&builder, &self.executor);
            match allocator
                .allocate(request, mapping, &formula, &present, true)
                .await?
            {
                Some(shares) => add_buckets(&mut rows, &shares),
                None => {
                    tracing::warn!(mapping = %mapping.id, "shared cost unresolved, grid understated");
                    unresolved.push(mapping.id.clone());
                }
            }
        }
        if !unresolved.is_empty() {
            // Compare like with like: neither window carries shared cost.
            shared = None;
        }
        let previous = self
            .previous_entity_costs(&builder, request, &formula, shared.as_ref())
            .await?;

        let finish = ResultMapper::new(request.skip_round_off);
        let data = rows
            .into_iter()
            .filter(|(name, _)| formula.include_others || name != OTHERS)
            .map(|(name, cost)| {
                let previous_cost = previous.as_ref().map(|p| p.get(&name).copied().unwrap_or(0.0));
                EntityStatsDataPoint {
                    id: name.clone(),
                    cost_trend: trend::trend_percentage(cost, previous_cost),
                    name,
                    cost: finish.round(cost),
                }
            })
            .collect();
        Ok(Some(EntityStatsGrid {
            data,
            unresolved_shared_costs: unresolved,
        }))
    }

    /// Unrounded per-entity cost over the previous window, including the
    /// shared cost of `shared` when given. `None` without a full time window
    /// or when any query failed.
    async fn previous_entity_costs(
        &self,
        builder: &ViewQueryBuilder<'_>,
        request: &ViewQueryRequest,
        formula: &CostFormula,
        shared: Option<&BusinessMapping>,
    ) -> Result<Option<BTreeMap<String, f64>>> {
        let (Some(after), Some(before)) = request.time_bounds() else {
            return Ok(None);
        };
        let (prev_after, prev_before) = trend::previous_window(after, before);
        let mut previous = request.with_time_window(prev_after, prev_before);
        previous.limit = None;
        previous.offset = None;
        let spec = builder
            .build(&previous, QueryKind::Grid, formula)?
            .paginate(None, None);
        let Some(result) = self.run(&spec).await? else {
            tracing::warn!("previous-window query failed, trends omitted");
            return Ok(None);
        };
        let mut costs = ResultMapper::new(true).cost_buckets(&spec, &result);

        if let Some(mapping) = shared {
            let present: Vec<String> = costs.keys().cloned().collect();
            let allocator = SharedCostAllocator::new(builder, &self.executor);
            let Some(shares) = allocator
                .allocate(&previous, mapping, formula, &present, true)
                .await?
            else {
                tracing::warn!(mapping = %mapping.id, "previous-window shared cost unresolved, trends omitted");
                return Ok(None);
            };
            for (name, share) in shares {
                if let Some(cost) = costs.get_mut(&name) {
                    *cost += share;
                }
            }
        }
        Ok(Some(costs))
    }

    /// Cost per entity and time bucket. Business-mapping series receive
    /// their shared cost split within each bucket, so bucket totals match
    /// the grid of the same window.
    pub async fn get_time_series_stats(
        &self,
        request: &ViewQueryRequest,
    ) -> Result<Option<TimeSeries>> {
        let builder = self.builder();
        let view = builder.resolve_view(request)?;
        let formula = self.formula(request, view.as_ref()).await;
        let mapping = builder.grouped_mapping(request, view.as_ref())?;
        let spec = builder.build(request, QueryKind::TimeSeries, &formula)?;
        let Some(result) = self.run(&spec).await? else {
            return Ok(None);
        };
        let mut series = ResultMapper::new(true).time_series(&spec, &result);

        if let Some(mapping) = mapping.filter(|m| m.has_shared_costs()) {
            let grain = builder.granularity(request, view.as_ref())?;
            let present: BTreeMap<i64, Vec<String>> = series
                .buckets
                .iter()
                .map(|b| (b.time, b.values.iter().map(|p| p.name.clone()).collect()))
                .collect();
            let allocator = SharedCostAllocator::new(&builder, &self.executor);
            match allocator
                .allocate_by_time(request, &mapping, &formula, grain, &present)
                .await?
            {
                Some(shares) => {
                    for bucket in series.buckets.iter_mut() {
                        let Some(bucket_shares) = shares.get(&bucket.time) else {
                            continue;
                        };
                        for point in bucket.values.iter_mut() {
                            if let Some(share) = bucket_shares.get(&point.name) {
                                point.value += share;
                            }
                        }
                    }
                }
                None => {
                    tracing::warn!(mapping = %mapping.id, "shared cost unresolved, series understated");
                    series.unresolved_shared_costs.push(mapping.id.clone());
                }
            }
        }

        let finish = ResultMapper::new(request.skip_round_off);
        for bucket in series.buckets.iter_mut() {
            if !formula.include_others {
                bucket.values.retain(|p| p.name != OTHERS);
            }
            for point in bucket.values.iter_mut() {
                point.value = finish.round(point.value);
            }
        }
        Ok(Some(series))
    }

    pub async fn get_cost_data(&self, request: &ViewQueryRequest) -> Result<Option<ViewCostData>> {
        let builder = self.builder();
        let view = builder.resolve_view(request)?;
        let formula = self.formula(request, view.as_ref()).await;
        let data = self.cost_data(&builder, request, &formula).await?;
        Ok(data.map(|mut d| {
            if !request.skip_round_off {
                d.cost = round2(d.cost);
            }
            d
        }))
    }

    async fn cost_data(
        &self,
        builder: &ViewQueryBuilder<'_>,
        request: &ViewQueryRequest,
        formula: &CostFormula,
    ) -> Result<Option<ViewCostData>> {
        let spec = builder.build(request, QueryKind::CostData, formula)?;
        let Some(result) = self.run(&spec).await? else {
            return Ok(None);
        };
        Ok(Some(ResultMapper::new(true).cost_data(&spec, &result)))
    }

    /// Current and previous-window cost for a request with a full time window.
    async fn current_and_previous(
        &self,
        request: &ViewQueryRequest,
    ) -> Result<Option<(ViewCostData, Option<f64>, i64, i64)>> {
        let (Some(after), Some(before)) = request.time_bounds() else {
            return Err(CostViewError::validation(
                "trend and forecast need both AFTER and BEFORE time filters",
            ));
        };
        let builder = self.builder();
        let view = builder.resolve_view(request)?;
        let formula = self.formula(request, view.as_ref()).await;

        let Some(current) = self.cost_data(&builder, request, &formula).await? else {
            return Ok(None);
        };
        let (prev_after, prev_before) = trend::previous_window(after, before);
        let previous = self
            .cost_data(&builder, &request.with_time_window(prev_after, prev_before), &formula)
            .await?
            .map(|p| p.cost);
        Ok(Some((current, previous, after, before)))
    }

    pub async fn get_trend_stats_data(
        &self,
        request: &ViewQueryRequest,
    ) -> Result<Option<TrendStats>> {
        let Some((current, previous, after, before)) = self.current_and_previous(request).await?
        else {
            return Ok(None);
        };
        let value = round2(current.cost);
        tracing::debug!(
            cost = value,
            previous = ?previous,
            "computed trend stats"
        );
        Ok(Some(TrendStats {
            stats_label: TOTAL_COST_LABEL.to_string(),
            stats_description: describe_window(after, before),
            stats_value: trend::format_cost(value),
            stats_trend: trend::trend_percentage(current.cost, previous),
            value,
        }))
    }

    pub async fn get_forecast_cost_data(
        &self,
        request: &ViewQueryRequest,
    ) -> Result<Option<TrendStats>> {
        let Some((current, previous, after, before)) = self.current_and_previous(request).await?
        else {
            return Ok(None);
        };
        let forecast = trend::forecast(&current, after, before, trend::now_millis());
        let value = round2(forecast);
        Ok(Some(TrendStats {
            stats_label: FORECAST_COST_LABEL.to_string(),
            stats_description: describe_window(after, before),
            stats_value: trend::format_cost(value),
            stats_trend: trend::trend_percentage(forecast, previous),
            value,
        }))
    }

    /// Shared cost per cost target of `mapping_id`, for the targets present
    /// under the request's filters.
    pub async fn get_cost_bucket_entity_cost(
        &self,
        request: &ViewQueryRequest,
        mapping_id: &str,
    ) -> Result<Option<HashMap<String, f64>>> {
        let mapping = self.store.business_mapping(mapping_id).ok_or_else(|| {
            CostViewError::validation(format!("unknown business mapping {mapping_id}"))
        })?;
        if !mapping.has_shared_costs() {
            return Ok(Some(HashMap::new()));
        }

        let builder = self.builder();
        let view = builder.resolve_view(request)?;
        let formula = self.formula(request, view.as_ref()).await;

        let mut grouped = request.clone();
        grouped.group_by = vec![ViewGroupBy::entity(ViewField::business_mapping(
            mapping.id.clone(),
            mapping.name.clone(),
        ))];
        grouped.limit = None;
        grouped.offset = None;
        let spec = builder
            .build(&grouped, QueryKind::Grid, &formula)?
            .paginate(None, None);
        let Some(result) = self.run(&spec).await? else {
            return Ok(None);
        };
        let present: Vec<String> = ResultMapper::new(true)
            .entity_costs(&spec, &result)
            .into_iter()
            .map(|(name, _)| name)
            .collect();

        let allocator = SharedCostAllocator::new(&builder, &self.executor);
        let shares = allocator
            .allocate(request, &mapping, &formula, &present, request.skip_round_off)
            .await?;
        Ok(shares.map(|s| s.into_iter().collect()))
    }
}

fn describe_window(after: i64, before: i64) -> String {
    let day = |millis: i64| {
        Utc.timestamp_millis_opt(millis)
            .single()
            .map(|t| t.format("%d %B, %Y").to_string())
            .unwrap_or_else(|| millis.to_string())
    };
    format!("{} - {}", day(after), day(before))
}

fn add_buckets(rows: &mut [(String, f64)], shares: &CostBuckets) {
    for (name, cost) in rows.iter_mut() {
        if let Some(share) = shares.get(name.as_str()) {
            *cost += share;
        }
    }
}
