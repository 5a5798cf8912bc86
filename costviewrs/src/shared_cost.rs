//! Distributes business-mapping shared costs across the cost targets that
//! appear in a primary result.

use std::collections::BTreeMap;

use futures::future::join_all;

use crate::error::{CostViewError, Result};
use crate::executor::{QueryExecutor, QueryOutcome, QueryResult};
use crate::preferences::CostFormula;
use crate::query_builder::{QuerySpec, ViewQueryBuilder};
use crate::result_mapper::{round_preserving_total, ResultMapper};
use crate::views::{
    BusinessMapping, CostBuckets, SharedCost, SharedCostStrategy, TimeGranularity,
    ViewQueryRequest,
};

/// Shared cost per bucket, keyed by time-bucket start.
pub type TimedCostBuckets = BTreeMap<i64, CostBuckets>;

/// Sub-query results for one mapping: target weights plus one total per
/// shared cost that has rules.
struct Fetched<'m> {
    weights: (QuerySpec, QueryResult),
    totals: Vec<(&'m SharedCost, QuerySpec, QueryResult)>,
}

pub struct SharedCostAllocator<'a> {
    builder: &'a ViewQueryBuilder<'a>,
    executor: &'a QueryExecutor,
}

impl<'a> SharedCostAllocator<'a> {
    pub fn new(builder: &'a ViewQueryBuilder<'a>, executor: &'a QueryExecutor) -> Self {
        Self { builder, executor }
    }

    /// Shared cost per bucket for the buckets in `present`.
    ///
    /// `Ok(None)` means a sub-query failed and the allocation is unknown;
    /// an empty map means there was nothing to share. Shares are summed over
    /// all shared costs unrounded; with `skip_round_off` unset the merged
    /// result is rounded once so it still sums to the rounded total.
    pub async fn allocate(
        &self,
        request: &ViewQueryRequest,
        mapping: &BusinessMapping,
        formula: &CostFormula,
        present: &[String],
        skip_round_off: bool,
    ) -> Result<Option<CostBuckets>> {
        let Some(fetched) = self.fetch(request, mapping, formula, None).await? else {
            return Ok(None);
        };
        let mapper = ResultMapper::new(true);
        let (weight_spec, weight_rows) = &fetched.weights;
        let weights: Vec<(String, f64)> = mapper
            .entity_costs(weight_spec, weight_rows)
            .into_iter()
            .filter(|(name, _)| mapping.is_cost_target(name))
            .collect();
        let targets: Vec<&str> = mapping
            .target_names()
            .filter(|name| present.iter().any(|p| p == name))
            .collect();

        let mut merged = CostBuckets::new();
        for (shared, spec, rows) in &fetched.totals {
            let total = mapper.cost_data(spec, rows).cost;
            add_shares(&mut merged, mapping, shared, total, &targets, &weights);
        }
        if !skip_round_off {
            merged = round_buckets(merged);
        }
        tracing::debug!(
            mapping = %mapping.id,
            buckets = merged.len(),
            "allocated shared costs"
        );
        Ok(Some(merged))
    }

    /// Shared cost split separately within each `grain` time bucket, for the
    /// names present in that bucket. Shares are unrounded.
    pub async fn allocate_by_time(
        &self,
        request: &ViewQueryRequest,
        mapping: &BusinessMapping,
        formula: &CostFormula,
        grain: TimeGranularity,
        present: &BTreeMap<i64, Vec<String>>,
    ) -> Result<Option<TimedCostBuckets>> {
        let Some(fetched) = self.fetch(request, mapping, formula, Some(grain)).await? else {
            return Ok(None);
        };
        let mapper = ResultMapper::new(true);
        let (weight_spec, weight_rows) = &fetched.weights;
        let weights: BTreeMap<i64, Vec<(String, f64)>> = mapper
            .time_series(weight_spec, weight_rows)
            .buckets
            .into_iter()
            .map(|bucket| {
                let points = bucket
                    .values
                    .into_iter()
                    .filter(|p| mapping.is_cost_target(&p.name))
                    .map(|p| (p.name, p.value))
                    .collect();
                (bucket.time, points)
            })
            .collect();

        let mut merged = TimedCostBuckets::new();
        for (shared, spec, rows) in &fetched.totals {
            for bucket in mapper.time_series(spec, rows).buckets {
                let total: f64 = bucket.values.iter().map(|p| p.value).sum();
                let Some(names) = present.get(&bucket.time) else {
                    continue;
                };
                let targets: Vec<&str> = mapping
                    .target_names()
                    .filter(|name| names.iter().any(|n| n == name))
                    .collect();
                let empty = Vec::new();
                let bucket_weights = weights.get(&bucket.time).unwrap_or(&empty);
                add_shares(
                    merged.entry(bucket.time).or_default(),
                    mapping,
                    shared,
                    total,
                    &targets,
                    bucket_weights,
                );
            }
        }
        merged.retain(|_, shares| !shares.is_empty());
        tracing::debug!(
            mapping = %mapping.id,
            buckets = merged.len(),
            "allocated shared costs per time bucket"
        );
        Ok(Some(merged))
    }

    /// Run the weight query and every shared-cost total concurrently.
    /// `Ok(None)` when any of them failed.
    async fn fetch<'m>(
        &self,
        request: &ViewQueryRequest,
        mapping: &'m BusinessMapping,
        formula: &CostFormula,
        grain: Option<TimeGranularity>,
    ) -> Result<Option<Fetched<'m>>> {
        let bucketed = |spec: QuerySpec| match grain {
            Some(grain) => self.builder.per_time_bucket(spec, grain),
            None => spec,
        };
        let mut totals = Vec::new();
        for shared in &mapping.shared_costs {
            if let Some(spec) = self
                .builder
                .shared_cost_total(request, mapping, shared, formula)?
            {
                totals.push((shared, bucketed(spec)));
            }
        }
        let weight_spec = bucketed(self.builder.cost_target_weights(request, mapping, formula)?);
        if totals.is_empty() {
            return Ok(Some(Fetched {
                weights: (weight_spec, QueryResult::default()),
                totals: Vec::new(),
            }));
        }

        let (weights, total_outcomes) = futures::join!(
            self.executor.execute(&weight_spec),
            join_all(totals.iter().map(|(_, spec)| self.executor.execute(spec)))
        );
        if let Some(failure) = std::iter::once(&weights)
            .chain(total_outcomes.iter())
            .find_map(cancelled)
        {
            return Err(CostViewError::Cancelled(failure));
        }

        let Some(weights) = weights.into_result() else {
            tracing::warn!(mapping = %mapping.id, "shared cost weights unavailable");
            return Ok(None);
        };
        let mut fetched = Fetched {
            weights: (weight_spec, weights),
            totals: Vec::with_capacity(totals.len()),
        };
        for ((shared, spec), outcome) in totals.into_iter().zip(total_outcomes) {
            let Some(rows) = outcome.into_result() else {
                tracing::warn!(
                    mapping = %mapping.id,
                    shared_cost = %shared.name,
                    "shared cost total unavailable"
                );
                return Ok(None);
            };
            fetched.totals.push((shared, spec, rows));
        }
        Ok(Some(fetched))
    }
}

fn add_shares(
    merged: &mut CostBuckets,
    mapping: &BusinessMapping,
    shared: &SharedCost,
    total: f64,
    targets: &[&str],
    weights: &[(String, f64)],
) {
    if total == 0.0 {
        return;
    }
    let shares = split(shared, total, targets, weights);
    if shares.is_empty() {
        tracing::warn!(
            mapping = %mapping.id,
            shared_cost = %shared.name,
            total,
            "no cost target present to receive shared cost"
        );
        return;
    }
    for (name, amount) in shares {
        *merged.entry(name.to_string()).or_insert(0.0) += amount;
    }
}

/// Cents per bucket, summing to the rounded total of the unrounded shares.
pub fn round_buckets(buckets: CostBuckets) -> CostBuckets {
    let amounts: Vec<f64> = buckets.values().copied().collect();
    buckets
        .into_keys()
        .zip(round_preserving_total(&amounts))
        .collect()
}

fn cancelled(outcome: &QueryOutcome) -> Option<String> {
    match outcome {
        QueryOutcome::Failed(f) if f.cancelled => Some(f.message.clone()),
        _ => None,
    }
}

/// Split `total` across `targets` by the shared cost's strategy.
/// Proportional splits with no weight fall back to equal shares.
pub fn split<'t>(
    shared: &SharedCost,
    total: f64,
    targets: &[&'t str],
    weights: &[(String, f64)],
) -> Vec<(&'t str, f64)> {
    if targets.is_empty() {
        return Vec::new();
    }
    let equal = || {
        let share = total / targets.len() as f64;
        targets.iter().map(|t| (*t, share)).collect::<Vec<_>>()
    };
    match shared.strategy {
        SharedCostStrategy::Equal => equal(),
        SharedCostStrategy::Proportional => {
            let weight_of = |target: &str| {
                weights
                    .iter()
                    .filter(|(name, _)| name == target)
                    .map(|(_, w)| *w)
                    .sum::<f64>()
            };
            let sum: f64 = targets.iter().map(|t| weight_of(t)).sum();
            if sum <= 0.0 {
                return equal();
            }
            targets
                .iter()
                .map(|t| (*t, total * weight_of(t) / sum))
                .collect()
        }
        SharedCostStrategy::Fixed => targets
            .iter()
            .filter_map(|t| {
                shared
                    .splits
                    .iter()
                    .find(|s| s.cost_target_name == *t)
                    .map(|s| (*t, total * s.percentage / 100.0))
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::views::SharedCostSplit;

    fn shared(strategy: SharedCostStrategy) -> SharedCost {
        SharedCost {
            name: "support".into(),
            rules: vec![],
            strategy,
            splits: vec![
                SharedCostSplit {
                    cost_target_name: "X".into(),
                    percentage: 70.0,
                },
                SharedCostSplit {
                    cost_target_name: "Y".into(),
                    percentage: 30.0,
                },
            ],
        }
    }

    fn weights() -> Vec<(String, f64)> {
        vec![("X".into(), 30.0), ("Y".into(), 10.0), ("Z".into(), 60.0)]
    }

    #[test]
    fn proportional_uses_present_weights_only() {
        let shares = split(&shared(SharedCostStrategy::Proportional), 100.0, &["X", "Y"], &weights());
        assert_eq!(shares, vec![("X", 75.0), ("Y", 25.0)]);
    }

    #[test]
    fn equal_and_fixed() {
        let equal = split(&shared(SharedCostStrategy::Equal), 100.0, &["X", "Y"], &weights());
        assert_eq!(equal, vec![("X", 50.0), ("Y", 50.0)]);
        let fixed = split(&shared(SharedCostStrategy::Fixed), 100.0, &["X", "Y"], &weights());
        assert_eq!(fixed, vec![("X", 70.0), ("Y", 30.0)]);
    }

    #[test]
    fn zero_weight_falls_back_to_equal() {
        let shares = split(&shared(SharedCostStrategy::Proportional), 9.0, &["X", "Y", "Q"], &[]);
        let sum: f64 = shares.iter().map(|(_, v)| v).sum();
        assert!((sum - 9.0).abs() < 1e-9);
        assert_eq!(shares.len(), 3);
    }

    #[test]
    fn merged_shares_round_once() {
        // Three shares of 0.0049 each round to zero individually
        let support = shared(SharedCostStrategy::Equal);
        let mut merged = CostBuckets::new();
        for _ in 0..3 {
            for (name, amount) in split(&support, 0.0049, &["X"], &[]) {
                *merged.entry(name.to_string()).or_insert(0.0) += amount;
            }
        }
        assert_eq!(round_buckets(merged).get("X"), Some(&0.01));
    }

    #[test]
    fn rounded_shares_sum_to_total() {
        let shares = split(&shared(SharedCostStrategy::Equal), 100.0, &["X", "Y", "Z"], &[]);
        let amounts: Vec<f64> = shares.iter().map(|(_, v)| *v).collect();
        let rounded = round_preserving_total(&amounts);
        let sum: f64 = rounded.iter().sum();
        assert!((sum - 100.0).abs() < 0.001);
    }
}
