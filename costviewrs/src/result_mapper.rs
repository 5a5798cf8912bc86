//! Converts backend rows into typed cost results.
//!
//! Columns are matched to the query's output aliases case-insensitively,
//! since backends differ in how they report names.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::executor::QueryResult;
use crate::query_builder::{ColumnKind, QuerySpec};
use crate::views::{
    columns, CostBuckets, DataPoint, TimeSeries, TimeSeriesBucket, ViewCostData, OTHERS,
};

/// Round to cents.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Round each value to cents so the rounded values sum exactly to the
/// rounded total (largest remainder).
pub fn round_preserving_total(values: &[f64]) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }
    let target = (values.iter().sum::<f64>() * 100.0).round() as i64;
    let scaled: Vec<f64> = values.iter().map(|v| v * 100.0).collect();
    let mut cents: Vec<i64> = scaled.iter().map(|v| v.floor() as i64).collect();
    let shortfall = target - cents.iter().sum::<i64>();

    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| {
        let fa = scaled[a] - scaled[a].floor();
        let fb = scaled[b] - scaled[b].floor();
        fb.total_cmp(&fa).then(a.cmp(&b))
    });
    let bump = shortfall.clamp(0, values.len() as i64) as usize;
    for &idx in order.iter().take(bump) {
        cents[idx] += 1;
    }
    cents.into_iter().map(|c| c as f64 / 100.0).collect()
}

pub fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

pub fn parse_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
        }
        _ => None,
    }
}

/// Group key text; null and empty keys land in `Others`.
pub fn key_name(value: Option<&Value>) -> String {
    let name = match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    };
    match name {
        Some(n) if !n.trim().is_empty() => n,
        _ => OTHERS.to_string(),
    }
}

fn is_cost_synonym(alias: &str) -> bool {
    alias.eq_ignore_ascii_case(columns::COST) || alias.eq_ignore_ascii_case(columns::BILLING_AMOUNT)
}

/// Output columns resolved against one result's schema.
struct ColumnIndex {
    /// (kind, output alias, row key) in schema order.
    entries: Vec<(ColumnKind, String, String)>,
}

impl ColumnIndex {
    fn new(spec: &QuerySpec, result: &QueryResult) -> Self {
        let mut names: Vec<String> = result.columns.iter().map(|c| c.name.clone()).collect();
        if names.is_empty() {
            if let Some(first) = result.rows.first() {
                names = first.keys().cloned().collect();
            }
        }
        let mut entries = Vec::new();
        for name in names {
            if let Some(col) = spec
                .columns
                .iter()
                .find(|c| c.alias.eq_ignore_ascii_case(&name))
            {
                entries.push((col.kind, col.alias.clone(), name));
            }
        }
        Self { entries }
    }

    fn get<'r>(&self, row: &'r Map<String, Value>, kind: ColumnKind) -> Option<&'r Value> {
        self.entries
            .iter()
            .find(|(k, _, _)| *k == kind)
            .and_then(|(_, _, key)| row.get(key))
    }

    /// Sum of the row's cost columns. Of the `cost`/`billingAmount`
    /// synonyms only the last one in schema order counts.
    fn cost(&self, row: &Map<String, Value>) -> f64 {
        let mut total = 0.0;
        let mut synonym = None;
        for (kind, alias, key) in &self.entries {
            if *kind != ColumnKind::Cost {
                continue;
            }
            let value = row.get(key).and_then(parse_number);
            if is_cost_synonym(alias) {
                if value.is_some() {
                    synonym = value;
                }
            } else {
                total += value.unwrap_or(0.0);
            }
        }
        total + synonym.unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResultMapper {
    pub skip_round_off: bool,
}

impl ResultMapper {
    pub fn new(skip_round_off: bool) -> Self {
        Self { skip_round_off }
    }

    pub fn round(&self, value: f64) -> f64 {
        if self.skip_round_off {
            value
        } else {
            round2(value)
        }
    }

    /// Cost per group key, in first-seen order; repeated keys accumulate.
    pub fn entity_costs(&self, spec: &QuerySpec, result: &QueryResult) -> Vec<(String, f64)> {
        let index = ColumnIndex::new(spec, result);
        let mut order: Vec<String> = Vec::new();
        let mut totals: BTreeMap<String, f64> = BTreeMap::new();
        for row in &result.rows {
            let key = key_name(index.get(row, ColumnKind::GroupKey));
            let cost = index.cost(row);
            match totals.get_mut(&key) {
                Some(total) => *total += cost,
                None => {
                    order.push(key.clone());
                    totals.insert(key, cost);
                }
            }
        }
        order
            .into_iter()
            .map(|key| {
                let cost = totals.get(&key).copied().unwrap_or(0.0);
                (key, self.round(cost))
            })
            .collect()
    }

    pub fn cost_buckets(&self, spec: &QuerySpec, result: &QueryResult) -> CostBuckets {
        self.entity_costs(spec, result).into_iter().collect()
    }

    /// Distinct non-empty values, in row order.
    pub fn filter_values(&self, spec: &QuerySpec, result: &QueryResult) -> Vec<String> {
        let index = ColumnIndex::new(spec, result);
        let mut values: Vec<String> = Vec::new();
        for row in &result.rows {
            let value = match index.get(row, ColumnKind::GroupKey) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => continue,
                Some(other) => other.to_string(),
            };
            if !value.is_empty() && !values.contains(&value) {
                values.push(value);
            }
        }
        values
    }

    pub fn time_series(&self, spec: &QuerySpec, result: &QueryResult) -> TimeSeries {
        let index = ColumnIndex::new(spec, result);
        let mut buckets: BTreeMap<i64, Vec<DataPoint>> = BTreeMap::new();
        for row in &result.rows {
            let Some(time) = index.get(row, ColumnKind::TimeBucket).and_then(parse_millis) else {
                tracing::warn!("dropping time-series row without a time bucket");
                continue;
            };
            let name = key_name(index.get(row, ColumnKind::GroupKey));
            let cost = index.cost(row);
            let points = buckets.entry(time).or_default();
            match points.iter_mut().find(|p| p.name == name) {
                Some(point) => point.value += cost,
                None => points.push(DataPoint { name, value: cost }),
            }
        }
        TimeSeries {
            buckets: buckets
                .into_iter()
                .map(|(time, values)| TimeSeriesBucket {
                    time,
                    values: values
                        .into_iter()
                        .map(|p| DataPoint {
                            value: self.round(p.value),
                            ..p
                        })
                        .collect(),
                })
                .collect(),
            unresolved_shared_costs: Vec::new(),
        }
    }

    pub fn cost_data(&self, spec: &QuerySpec, result: &QueryResult) -> ViewCostData {
        let index = ColumnIndex::new(spec, result);
        let mut data = ViewCostData::default();
        for row in &result.rows {
            data.cost += index.cost(row);
            if let Some(min) = index.get(row, ColumnKind::MinStartTime).and_then(parse_millis) {
                data.min_start_time = Some(data.min_start_time.map_or(min, |m| m.min(min)));
            }
            if let Some(max) = index.get(row, ColumnKind::MaxStartTime).and_then(parse_millis) {
                data.max_start_time = Some(data.max_start_time.map_or(max, |m| m.max(max)));
            }
        }
        data.cost = self.round(data.cost);
        data
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::executor::ColumnMeta;
    use crate::query_builder::OutputColumn;
    use crate::sql_ast::SelectQuery;

    fn spec(columns: Vec<OutputColumn>) -> QuerySpec {
        QuerySpec {
            query: SelectQuery::default(),
            columns,
        }
    }

    fn result(names: &[&str], rows: Vec<Value>) -> QueryResult {
        QueryResult {
            columns: names
                .iter()
                .map(|n| ColumnMeta { name: n.to_string() })
                .collect(),
            rows: rows
                .into_iter()
                .map(|r| r.as_object().cloned().unwrap())
                .collect(),
        }
    }

    fn grid_spec() -> QuerySpec {
        spec(vec![
            OutputColumn::new("group_key", ColumnKind::GroupKey),
            OutputColumn::new("cost", ColumnKind::Cost),
        ])
    }

    #[test]
    fn repeated_keys_accumulate_then_round_once() {
        let rows = result(
            &["group_key", "cost"],
            vec![
                json!({"group_key": "A", "cost": 10.004}),
                json!({"group_key": "A", "cost": "5.006"}),
            ],
        );
        let costs = ResultMapper::default().entity_costs(&grid_spec(), &rows);
        assert_eq!(costs, vec![("A".to_string(), 15.01)]);
    }

    #[test]
    fn aliases_match_case_insensitively_and_null_keys_become_others() {
        let rows = result(
            &["GROUP_KEY", "COST"],
            vec![json!({"GROUP_KEY": null, "COST": 3}), json!({"GROUP_KEY": "", "COST": 2})],
        );
        let costs = ResultMapper::default().entity_costs(&grid_spec(), &rows);
        assert_eq!(costs, vec![(OTHERS.to_string(), 5.0)]);
    }

    #[test]
    fn last_cost_synonym_in_schema_order_wins() {
        let spec = spec(vec![
            OutputColumn::new("group_key", ColumnKind::GroupKey),
            OutputColumn::new("cost", ColumnKind::Cost),
            OutputColumn::new("billingAmount", ColumnKind::Cost),
            OutputColumn::new("awsBlendedCost", ColumnKind::Cost),
        ]);
        let rows = result(
            &["group_key", "billingAmount", "cost", "awsBlendedCost"],
            vec![json!({"group_key": "A", "cost": 7, "billingAmount": 9, "awsBlendedCost": 1})],
        );
        let costs = ResultMapper::default().entity_costs(&spec, &rows);
        assert_eq!(costs[0].1, 8.0);
    }

    #[test]
    fn skip_round_off_keeps_precision() {
        let rows = result(&["group_key", "cost"], vec![json!({"group_key": "A", "cost": 1.23456})]);
        let costs = ResultMapper::new(true).entity_costs(&grid_spec(), &rows);
        assert_eq!(costs[0].1, 1.23456);
    }

    #[test]
    fn largest_remainder_preserves_total() {
        let shares = round_preserving_total(&[33.333333, 33.333333, 33.333334]);
        let total: f64 = shares.iter().sum();
        assert!((total - 100.0).abs() < 1e-9);
        assert_eq!(shares.iter().filter(|v| **v == 33.34).count(), 1);
    }

    #[test]
    fn cost_data_reads_bounds() {
        let spec = spec(vec![
            OutputColumn::new("cost", ColumnKind::Cost),
            OutputColumn::new("startTime_min", ColumnKind::MinStartTime),
            OutputColumn::new("startTime_max", ColumnKind::MaxStartTime),
        ]);
        let rows = result(
            &["cost", "startTime_min", "startTime_max"],
            vec![json!({"cost": "12.345", "startTime_min": "1000", "startTime_max": 5000})],
        );
        let data = ResultMapper::default().cost_data(&spec, &rows);
        assert_eq!(data.cost, 12.35);
        assert_eq!(data.min_start_time, Some(1000));
        assert_eq!(data.max_start_time, Some(5000));
    }

    #[test]
    fn time_series_groups_by_bucket() {
        let spec = spec(vec![
            OutputColumn::new("group_key", ColumnKind::GroupKey),
            OutputColumn::new("time_bucket", ColumnKind::TimeBucket),
            OutputColumn::new("cost", ColumnKind::Cost),
        ]);
        let rows = result(
            &["group_key", "time_bucket", "cost"],
            vec![
                json!({"group_key": "A", "time_bucket": 2000, "cost": 1}),
                json!({"group_key": "B", "time_bucket": 1000, "cost": 2}),
                json!({"group_key": "A", "time_bucket": 1000, "cost": 3}),
            ],
        );
        let series = ResultMapper::default().time_series(&spec, &rows);
        assert_eq!(series.buckets.len(), 2);
        assert_eq!(series.buckets[0].time, 1000);
        assert_eq!(series.buckets[0].values.len(), 2);
        assert_eq!(series.buckets[1].values[0].value, 1.0);
    }
}
