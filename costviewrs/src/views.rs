//! Cost view request model: fields, filters, group-bys, aggregations and the
//! business-mapping definitions they reference, plus the typed responses the
//! service hands back.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Column names of the unified billing table.
pub mod columns {
    pub const START_TIME: &str = "startTime";
    pub const COST: &str = "cost";
    pub const BILLING_AMOUNT: &str = "billingAmount";
    pub const CLOUD_PROVIDER: &str = "cloudProvider";
    pub const PRODUCT: &str = "product";
    pub const CLUSTER_NAME: &str = "clusterName";
    pub const INSTANCE_TYPE: &str = "instanceType";
    pub const LABELS: &str = "labels";

    pub const AWS_LINE_ITEM_TYPE: &str = "awsLineItemType";
    pub const AWS_UNBLENDED_COST: &str = "awsUnblendedCost";
    pub const AWS_BLENDED_COST: &str = "awsBlendedCost";
    pub const AWS_AMORTISED_COST: &str = "awsAmortisedCost";
    pub const AWS_NET_AMORTISED_COST: &str = "awsNetAmortisedCost";
    pub const AWS_EFFECTIVE_COST: &str = "awsEffectiveCost";

    pub const GCP_DISCOUNT: &str = "discount";
    pub const GCP_COST_TYPE: &str = "gcpCostType";
}

/// Bucket name used for null group keys and unmatched business-mapping rows.
pub const OTHERS: &str = "Others";
/// Instance type tagging cluster capacity no workload claimed.
pub const CLUSTER_UNALLOCATED: &str = "CLUSTER_UNALLOCATED";
/// Pseudo field listing label keys in filter-value queries.
pub const LABEL_KEY_FIELD_ID: &str = "labels.key";
pub const LABEL_VALUE_FIELD_ID: &str = "labels.value";

pub static DEFAULT_GROUP_BY_FIELD: Lazy<ViewField> =
    Lazy::new(|| ViewField::new(columns::PRODUCT, "Product", FieldDomain::Common));

pub static START_TIME_FIELD: Lazy<ViewField> =
    Lazy::new(|| ViewField::new(columns::START_TIME, "Start Time", FieldDomain::Common));

// ============================================================================
// Fields
// ============================================================================

/// Which family a field belongs to. Column resolution and rendering are
/// dispatched on this once, at the query-builder boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldDomain {
    Common,
    Aws,
    Gcp,
    Azure,
    Cluster,
    Custom,
    BusinessMapping,
    Label,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewField {
    /// Column name for table fields, mapping id for business mappings.
    pub field_id: String,
    /// Display name; for labels this is the label key.
    pub field_name: String,
    pub identifier: FieldDomain,
    #[serde(default)]
    pub identifier_name: Option<String>,
}

impl ViewField {
    pub fn new(field_id: impl Into<String>, field_name: impl Into<String>, identifier: FieldDomain) -> Self {
        Self {
            field_id: field_id.into(),
            field_name: field_name.into(),
            identifier,
            identifier_name: None,
        }
    }

    pub fn common(field_id: impl Into<String>) -> Self {
        let id = field_id.into();
        Self::new(id.clone(), id, FieldDomain::Common)
    }

    pub fn label(key: impl Into<String>) -> Self {
        Self::new(LABEL_VALUE_FIELD_ID, key, FieldDomain::Label)
    }

    pub fn label_keys() -> Self {
        Self::new(LABEL_KEY_FIELD_ID, "Label Keys", FieldDomain::Label)
    }

    pub fn business_mapping(mapping_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(mapping_id, name, FieldDomain::BusinessMapping)
    }

    pub fn is_start_time(&self) -> bool {
        self.field_id.eq_ignore_ascii_case(columns::START_TIME)
    }
}

// ============================================================================
// Filters
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViewIdOperator {
    In,
    NotIn,
    Null,
    NotNull,
    Like,
}

impl ViewIdOperator {
    /// Whether the operator takes a value list.
    pub fn takes_values(&self) -> bool {
        matches!(self, ViewIdOperator::In | ViewIdOperator::NotIn | ViewIdOperator::Like)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewIdCondition {
    pub field: ViewField,
    pub operator: ViewIdOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl ViewIdCondition {
    pub fn new(field: ViewField, operator: ViewIdOperator, values: Vec<String>) -> Self {
        Self { field, operator, values }
    }

    pub fn is_in(field: ViewField, values: &[&str]) -> Self {
        Self::new(
            field,
            ViewIdOperator::In,
            values.iter().map(|v| v.to_string()).collect(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViewTimeOperator {
    After,
    Before,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewTimeFilter {
    pub field: ViewField,
    pub operator: ViewTimeOperator,
    /// Epoch milliseconds.
    pub value: i64,
}

impl ViewTimeFilter {
    pub fn after(value: i64) -> Self {
        Self {
            field: START_TIME_FIELD.clone(),
            operator: ViewTimeOperator::After,
            value,
        }
    }

    pub fn before(value: i64) -> Self {
        Self {
            field: START_TIME_FIELD.clone(),
            operator: ViewTimeOperator::Before,
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewMetadataFilter {
    pub view_id: String,
    #[serde(default)]
    pub is_preview: bool,
}

/// A conjunction of conditions. A rule set (`Vec<ViewRule>`) is their disjunction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewRule {
    #[serde(default)]
    pub conditions: Vec<ViewIdCondition>,
}

impl ViewRule {
    pub fn new(conditions: Vec<ViewIdCondition>) -> Self {
        Self { conditions }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewFilter {
    Metadata(ViewMetadataFilter),
    Id(ViewIdCondition),
    Time(ViewTimeFilter),
    Rule(ViewRule),
}

// ============================================================================
// Group-bys, aggregations and sorting
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeGranularity {
    Day,
    Week,
    Month,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewGroupBy {
    Entity { field: ViewField },
    Time { granularity: TimeGranularity },
}

impl ViewGroupBy {
    pub fn entity(field: ViewField) -> Self {
        ViewGroupBy::Entity { field }
    }

    pub fn time(granularity: TimeGranularity) -> Self {
        ViewGroupBy::Time { granularity }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregationOperation {
    Sum,
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewAggregation {
    pub column_name: String,
    pub operation: AggregationOperation,
}

impl ViewAggregation {
    pub fn sum(column: impl Into<String>) -> Self {
        Self {
            column_name: column.into(),
            operation: AggregationOperation::Sum,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SortType {
    Cost,
    Name,
    Time,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewSort {
    pub sort_type: SortType,
    pub order: SortOrder,
}

// ============================================================================
// Business mappings and saved views
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostTarget {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<ViewRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SharedCostStrategy {
    Proportional,
    Equal,
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedCostSplit {
    pub cost_target_name: String,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedCost {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<ViewRule>,
    pub strategy: SharedCostStrategy,
    /// Only read for `FIXED`.
    #[serde(default)]
    pub splits: Vec<SharedCostSplit>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessMapping {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub cost_targets: Vec<CostTarget>,
    #[serde(default)]
    pub shared_costs: Vec<SharedCost>,
    #[serde(default)]
    pub unallocated_label: Option<String>,
}

impl BusinessMapping {
    pub fn unallocated_label(&self) -> &str {
        self.unallocated_label.as_deref().unwrap_or(OTHERS)
    }

    pub fn has_shared_costs(&self) -> bool {
        !self.shared_costs.is_empty()
    }

    pub fn is_cost_target(&self, name: &str) -> bool {
        self.cost_targets.iter().any(|t| t.name == name)
    }

    pub fn target_names(&self) -> impl Iterator<Item = &str> {
        self.cost_targets.iter().map(|t| t.name.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AwsCostBasis {
    Unblended,
    Blended,
    Amortised,
    NetAmortised,
    Effective,
}

impl AwsCostBasis {
    pub fn column(&self) -> &'static str {
        match self {
            AwsCostBasis::Unblended => columns::AWS_UNBLENDED_COST,
            AwsCostBasis::Blended => columns::AWS_BLENDED_COST,
            AwsCostBasis::Amortised => columns::AWS_AMORTISED_COST,
            AwsCostBasis::NetAmortised => columns::AWS_NET_AMORTISED_COST,
            AwsCostBasis::Effective => columns::AWS_EFFECTIVE_COST,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "UNBLENDED" => Some(AwsCostBasis::Unblended),
            "BLENDED" => Some(AwsCostBasis::Blended),
            "AMORTISED" | "AMORTIZED" => Some(AwsCostBasis::Amortised),
            "NET_AMORTISED" | "NET_AMORTIZED" => Some(AwsCostBasis::NetAmortised),
            "EFFECTIVE" => Some(AwsCostBasis::Effective),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsPreferences {
    pub include_discounts: Option<bool>,
    pub include_credits: Option<bool>,
    pub include_refunds: Option<bool>,
    pub include_taxes: Option<bool>,
    pub cost_basis: Option<AwsCostBasis>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcpPreferences {
    pub include_discounts: Option<bool>,
    pub include_taxes: Option<bool>,
}

/// Per-view preference overrides. `None` means "use the account default".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewPreferences {
    pub include_others: Option<bool>,
    pub include_unallocated_cost: Option<bool>,
    pub aws: AwsPreferences,
    pub gcp: GcpPreferences,
}

impl ViewPreferences {
    /// Layer `top` over `self`: any flag set on `top` wins.
    pub fn overlay(&self, top: &ViewPreferences) -> ViewPreferences {
        ViewPreferences {
            include_others: top.include_others.or(self.include_others),
            include_unallocated_cost: top
                .include_unallocated_cost
                .or(self.include_unallocated_cost),
            aws: AwsPreferences {
                include_discounts: top.aws.include_discounts.or(self.aws.include_discounts),
                include_credits: top.aws.include_credits.or(self.aws.include_credits),
                include_refunds: top.aws.include_refunds.or(self.aws.include_refunds),
                include_taxes: top.aws.include_taxes.or(self.aws.include_taxes),
                cost_basis: top.aws.cost_basis.or(self.aws.cost_basis),
            },
            gcp: GcpPreferences {
                include_discounts: top.gcp.include_discounts.or(self.gcp.include_discounts),
                include_taxes: top.gcp.include_taxes.or(self.gcp.include_taxes),
            },
        }
    }
}

/// Read-only projection of a saved view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostView {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub rules: Vec<ViewRule>,
    #[serde(default)]
    pub default_group_by: Option<ViewField>,
    #[serde(default)]
    pub default_granularity: Option<TimeGranularity>,
    #[serde(default)]
    pub preferences: ViewPreferences,
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewQueryRequest {
    pub account_id: String,
    pub filters: Vec<ViewFilter>,
    pub group_by: Vec<ViewGroupBy>,
    pub aggregations: Vec<ViewAggregation>,
    pub sort: Vec<ViewSort>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub preferences: Option<ViewPreferences>,
    pub skip_round_off: bool,
}

impl ViewQueryRequest {
    pub fn for_account(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, filter: ViewFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_group_by(mut self, group_by: ViewGroupBy) -> Self {
        self.group_by.push(group_by);
        self
    }

    pub fn with_aggregation(mut self, aggregation: ViewAggregation) -> Self {
        self.aggregations.push(aggregation);
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// `(after, before)` bounds taken from the time filters, if present.
    pub fn time_bounds(&self) -> (Option<i64>, Option<i64>) {
        let mut after = None;
        let mut before = None;
        for filter in &self.filters {
            if let ViewFilter::Time(t) = filter {
                match t.operator {
                    ViewTimeOperator::After => after = Some(t.value),
                    ViewTimeOperator::Before => before = Some(t.value),
                }
            }
        }
        (after, before)
    }

    /// Copy of this request with its time window replaced.
    pub fn with_time_window(&self, after: i64, before: i64) -> Self {
        let mut shifted = self.clone();
        shifted.filters.retain(|f| !matches!(f, ViewFilter::Time(_)));
        shifted.filters.push(ViewFilter::Time(ViewTimeFilter::after(after)));
        shifted.filters.push(ViewFilter::Time(ViewTimeFilter::before(before)));
        shifted
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Total cost of a result set plus the observed start-time range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewCostData {
    pub cost: f64,
    pub min_start_time: Option<i64>,
    pub max_start_time: Option<i64>,
}

/// Bucket name → accumulated cost.
pub type CostBuckets = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityStatsDataPoint {
    pub id: String,
    pub name: String,
    pub cost: f64,
    pub cost_trend: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityStatsGrid {
    pub data: Vec<EntityStatsDataPoint>,
    /// Business mappings whose shared cost could not be computed; their
    /// buckets are understated by the missing share.
    pub unresolved_shared_costs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesBucket {
    /// Bucket start, epoch milliseconds.
    pub time: i64,
    pub values: Vec<DataPoint>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    pub buckets: Vec<TimeSeriesBucket>,
    /// Business mappings whose shared cost could not be split per bucket.
    #[serde(default)]
    pub unresolved_shared_costs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendStats {
    pub stats_label: String,
    pub stats_description: String,
    pub stats_value: String,
    pub stats_trend: Option<f64>,
    pub value: f64,
}
