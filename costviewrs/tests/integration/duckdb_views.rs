use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use costview::backends::{ConnectionManager, DuckDbConnection};
use costview::error::Result;
use costview::registry::ViewRegistry;
use costview::settings_cache::{Setting, SettingsProvider};
use costview::views::{
    BusinessMapping, CostTarget, FieldDomain, SharedCost, SharedCostStrategy, TimeGranularity,
    ViewField, ViewFilter, ViewGroupBy, ViewIdCondition, ViewQueryRequest, ViewRule,
    ViewTimeFilter,
};
use costview::CostViewService;

const DAY: i64 = 86_400_000;
// 2024-01-01T00:00:00Z
const T: i64 = 1_704_067_200_000;

const SCHEMA: &str = r#"
CREATE TABLE "unifiedTable" (
    "startTime" TIMESTAMP,
    "cost" DOUBLE,
    "billingAmount" DOUBLE,
    "cloudProvider" VARCHAR,
    "product" VARCHAR,
    "clusterName" VARCHAR,
    "instanceType" VARCHAR,
    "awsUnblendedCost" DOUBLE,
    "awsBlendedCost" DOUBLE,
    "awsAmortisedCost" DOUBLE,
    "awsNetAmortisedCost" DOUBLE,
    "awsEffectiveCost" DOUBLE,
    "awsLineItemType" VARCHAR,
    "discount" DOUBLE,
    "gcpCostType" VARCHAR,
    "labels" MAP(VARCHAR, VARCHAR)
);
"#;

// Current window: GCP compute 17 - 1 discount, AWS ec2 20 - 4 credit,
// AWS s3 6, cluster 8 + 3 unallocated. Previous window: compute 12.
const SEED: &str = r#"
INSERT INTO "unifiedTable" VALUES
    ('2024-01-01 10:00:00', 10.0, 10.0, 'GCP', 'compute', NULL, NULL, NULL, NULL, NULL, NULL, NULL, NULL, -1.0, 'regular', MAP {'team': 'core'}),
    ('2024-01-02 10:00:00', 5.0, 5.0, 'GCP', 'compute', NULL, NULL, NULL, NULL, NULL, NULL, NULL, NULL, 0.0, 'regular', NULL),
    ('2024-01-02 12:00:00', 2.0, 2.0, 'GCP', 'compute', NULL, NULL, NULL, NULL, NULL, NULL, NULL, NULL, 0.0, 'tax', NULL),
    ('2024-01-01 09:00:00', 100.0, 100.0, 'AWS', 'ec2', NULL, NULL, 20.0, 18.0, 15.0, 15.0, 15.0, 'Usage', NULL, NULL, MAP {'team': 'web'}),
    ('2024-01-03 09:00:00', 0.0, 0.0, 'AWS', 'ec2', NULL, NULL, -4.0, -4.0, -4.0, -4.0, -4.0, 'Credit', NULL, NULL, NULL),
    ('2024-01-03 10:00:00', 6.0, 6.0, 'AWS', 's3', NULL, NULL, 6.0, 6.0, 6.0, 6.0, 6.0, 'Usage', NULL, NULL, NULL),
    ('2024-01-04 00:00:00', 8.0, 8.0, 'CLUSTER', 'cluster', 'prod', 'K8S_NODE', NULL, NULL, NULL, NULL, NULL, NULL, NULL, NULL, NULL),
    ('2024-01-04 00:00:00', 3.0, 3.0, 'CLUSTER', 'cluster', 'prod', 'CLUSTER_UNALLOCATED', NULL, NULL, NULL, NULL, NULL, NULL, NULL, NULL, NULL),
    ('2023-12-25 00:00:00', 12.0, 12.0, 'GCP', 'compute', NULL, NULL, NULL, NULL, NULL, NULL, NULL, NULL, 0.0, 'regular', NULL);
"#;

struct Settings(Vec<Setting>);

#[async_trait]
impl SettingsProvider for Settings {
    async fn list_default_settings(&self, _account: &str, _category: &str) -> Result<Vec<Setting>> {
        Ok(self.0.clone())
    }
}

fn product_is(values: &[&str]) -> ViewRule {
    ViewRule::new(vec![ViewIdCondition::is_in(ViewField::common("product"), values)])
}

fn teams() -> BusinessMapping {
    BusinessMapping {
        id: "teams".into(),
        name: "Teams".into(),
        cost_targets: vec![
            CostTarget {
                name: "Platform".into(),
                rules: vec![product_is(&["ec2", "s3"])],
            },
            CostTarget {
                name: "Data".into(),
                rules: vec![product_is(&["compute"])],
            },
        ],
        shared_costs: vec![SharedCost {
            name: "cluster overhead".into(),
            rules: vec![product_is(&["cluster"])],
            strategy: SharedCostStrategy::Proportional,
            splits: vec![],
        }],
        unallocated_label: None,
    }
}

struct Fixture {
    _dir: TempDir,
    connections: ConnectionManager,
}

impl Fixture {
    async fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let conn = DuckDbConnection::new(dir.path().join("billing.duckdb"));
        conn.execute_batch(SCHEMA).await?;
        conn.execute_batch(SEED).await?;
        let mut connections = ConnectionManager::new();
        connections.insert("duck", Arc::new(conn));
        Ok(Self {
            _dir: dir,
            connections,
        })
    }

    fn service(&self, settings: Vec<Setting>) -> CostViewService {
        let registry = ViewRegistry::from_parts(vec![], vec![teams()]);
        CostViewService::for_datasource(
            &self.connections,
            "duck",
            Arc::new(registry),
            Arc::new(Settings(settings)),
        )
        .expect("datasource registered")
    }
}

fn in_window(request: ViewQueryRequest) -> ViewQueryRequest {
    request
        .with_filter(ViewFilter::Time(ViewTimeFilter::after(T)))
        .with_filter(ViewFilter::Time(ViewTimeFilter::before(T + 7 * DAY)))
}

fn grouped_by(field: ViewField) -> ViewQueryRequest {
    in_window(ViewQueryRequest::for_account("acc")).with_group_by(ViewGroupBy::entity(field))
}

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-6,
        "expected {expected}, got {actual}"
    );
}

#[tokio::test]
async fn product_grid_applies_cost_formula_and_trend() -> anyhow::Result<()> {
    let fixture = Fixture::new().await?;
    let grid = fixture
        .service(vec![])
        .get_entity_stats_data_points(&grouped_by(ViewField::common("product")))
        .await?
        .expect("query succeeded");

    let rows: Vec<(&str, f64)> = grid.data.iter().map(|p| (p.name.as_str(), p.cost)).collect();
    assert_eq!(
        rows,
        vec![("compute", 16.0), ("ec2", 16.0), ("cluster", 11.0), ("s3", 6.0)]
    );
    assert_eq!(grid.data[0].cost_trend, Some(33.33));
    assert_eq!(grid.data[1].cost_trend, None);
    Ok(())
}

#[tokio::test]
async fn account_settings_change_the_formula() -> anyhow::Result<()> {
    let fixture = Fixture::new().await?;
    let svc = fixture.service(vec![
        Setting::new("include_aws_credit", "false"),
        Setting::new("include_gcp_taxes", "false"),
    ]);
    let grid = svc
        .get_entity_stats_data_points(&grouped_by(ViewField::common("product")))
        .await?
        .expect("query succeeded");
    let cost = |name: &str| grid.data.iter().find(|p| p.name == name).map(|p| p.cost);
    assert_eq!(cost("ec2"), Some(20.0));
    assert_eq!(cost("compute"), Some(14.0));
    Ok(())
}

#[tokio::test]
async fn cluster_fields_hide_unallocated_unless_asked() -> anyhow::Result<()> {
    let fixture = Fixture::new().await?;
    let cluster = ViewField::new("clusterName", "Cluster Name", FieldDomain::Cluster);

    let default = fixture
        .service(vec![])
        .get_entity_stats_data_points(&grouped_by(cluster.clone()))
        .await?
        .expect("query succeeded");
    assert_eq!(default.data.len(), 1);
    assert_eq!(default.data[0].cost, 8.0);

    let with_unallocated = fixture
        .service(vec![Setting::new("include_unallocated_cost", "true")])
        .get_entity_stats_data_points(&grouped_by(cluster))
        .await?
        .expect("query succeeded");
    assert_eq!(with_unallocated.data[0].cost, 11.0);
    Ok(())
}

#[tokio::test]
async fn business_mapping_grid_absorbs_shared_cost() -> anyhow::Result<()> {
    let fixture = Fixture::new().await?;
    let grid = fixture
        .service(vec![])
        .get_entity_stats_data_points(&grouped_by(ViewField::business_mapping("teams", "Teams")))
        .await?
        .expect("query succeeded");

    assert!(grid.unresolved_shared_costs.is_empty());
    let cost = |name: &str| grid.data.iter().find(|p| p.name == name).map(|p| p.cost);
    // 11 of cluster overhead split 22:16
    assert_close(cost("Platform").unwrap_or_default(), 28.37);
    assert_close(cost("Data").unwrap_or_default(), 20.63);
    let total: f64 = grid.data.iter().map(|p| p.cost).sum();
    assert_close(total, 49.0);

    let shares = fixture
        .service(vec![])
        .get_cost_bucket_entity_cost(&in_window(ViewQueryRequest::for_account("acc")), "teams")
        .await?
        .expect("query succeeded");
    assert_close(shares["Platform"] + shares["Data"], 11.0);
    Ok(())
}

#[tokio::test]
async fn daily_time_series_for_one_product() -> anyhow::Result<()> {
    let fixture = Fixture::new().await?;
    let request = grouped_by(ViewField::common("product"))
        .with_filter(ViewFilter::Id(ViewIdCondition::is_in(
            ViewField::common("product"),
            &["ec2"],
        )))
        .with_group_by(ViewGroupBy::time(TimeGranularity::Day));
    let series = fixture
        .service(vec![])
        .get_time_series_stats(&request)
        .await?
        .expect("query succeeded");

    let points: Vec<(i64, f64)> = series
        .buckets
        .iter()
        .map(|b| (b.time, b.values[0].value))
        .collect();
    assert_eq!(points, vec![(T, 20.0), (T + 2 * DAY, -4.0)]);
    Ok(())
}

#[tokio::test]
async fn trend_forecast_and_cost_data() -> anyhow::Result<()> {
    let fixture = Fixture::new().await?;
    let svc = fixture.service(vec![]);
    let request = in_window(ViewQueryRequest::for_account("acc"));

    let data = svc.get_cost_data(&request).await?.expect("query succeeded");
    assert_eq!(data.cost, 49.0);
    assert_eq!(data.min_start_time, Some(T + 9 * 3_600_000));
    assert_eq!(data.max_start_time, Some(T + 3 * DAY));

    let trend = svc.get_trend_stats_data(&request).await?.expect("query succeeded");
    assert_eq!(trend.stats_value, "$49.00");
    assert_eq!(trend.stats_trend, Some(308.33));

    // Three of seven days observed
    let forecast = svc.get_forecast_cost_data(&request).await?.expect("query succeeded");
    assert_eq!(forecast.value, 114.33);
    Ok(())
}

#[tokio::test]
async fn filter_values_search_and_sort() -> anyhow::Result<()> {
    let fixture = Fixture::new().await?;
    let request = ViewQueryRequest::for_account("acc").with_filter(ViewFilter::Id(
        ViewIdCondition::is_in(ViewField::common("product"), &["C"]),
    ));
    let values = fixture
        .service(vec![])
        .get_filter_value_stats(&request)
        .await?
        .expect("query succeeded");
    assert_eq!(values, vec!["cluster", "compute", "ec2"]);
    Ok(())
}
