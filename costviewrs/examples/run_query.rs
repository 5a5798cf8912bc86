use std::sync::Arc;

use async_trait::async_trait;

use costview::{
    backends::{ConnectionManager, DuckDbConnection},
    error::Result,
    registry::ViewRegistry,
    settings_cache::{Setting, SettingsProvider},
    views::{ViewField, ViewFilter, ViewGroupBy, ViewTimeFilter},
    CostViewService, ViewQueryRequest,
};

const DAY: i64 = 86_400_000;
// 2024-01-01T00:00:00Z
const WINDOW_START: i64 = 1_704_067_200_000;

const BOOTSTRAP: &str = r#"
CREATE TABLE "unifiedTable" (
    "startTime" TIMESTAMP,
    "cost" DOUBLE,
    "cloudProvider" VARCHAR,
    "product" VARCHAR,
    "clusterName" VARCHAR,
    "instanceType" VARCHAR,
    "awsUnblendedCost" DOUBLE,
    "awsLineItemType" VARCHAR,
    "discount" DOUBLE,
    "gcpCostType" VARCHAR
);
INSERT INTO "unifiedTable" VALUES
    ('2023-12-28 08:00:00', 40.0, 'GCP', 'compute', NULL, NULL, NULL, NULL, 0.0, 'regular'),
    ('2024-01-01 08:00:00', 55.0, 'GCP', 'compute', NULL, NULL, NULL, NULL, -5.0, 'regular'),
    ('2024-01-02 08:00:00', 0.0, 'AWS', 'ec2', NULL, NULL, 30.0, 'Usage', NULL, NULL),
    ('2024-01-03 08:00:00', 0.0, 'AWS', 's3', NULL, NULL, 12.5, 'Usage', NULL, NULL);
"#;

/// Account defaults: show AWS cost unblended, keep the Others bucket.
struct DemoSettings;

#[async_trait]
impl SettingsProvider for DemoSettings {
    async fn list_default_settings(&self, _account: &str, _category: &str) -> Result<Vec<Setting>> {
        Ok(vec![
            Setting::new("show_aws_cost_as", "UNBLENDED"),
            Setting::new("include_others", "true"),
        ])
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    costview::init_tracing();

    let dir = tempfile::tempdir()?;
    let conn = DuckDbConnection::new(dir.path().join("demo.duckdb"));
    conn.execute_batch(BOOTSTRAP).await?;

    let mut connections = ConnectionManager::new();
    connections.insert("duckdb_local", Arc::new(conn));
    let service = CostViewService::for_datasource(
        &connections,
        "duckdb_local",
        Arc::new(ViewRegistry::new()),
        Arc::new(DemoSettings),
    )?;

    let request = ViewQueryRequest::for_account("demo")
        .with_filter(ViewFilter::Time(ViewTimeFilter::after(WINDOW_START)))
        .with_filter(ViewFilter::Time(ViewTimeFilter::before(WINDOW_START + 7 * DAY)))
        .with_group_by(ViewGroupBy::entity(ViewField::common("product")));

    match service.get_entity_stats_data_points(&request).await? {
        Some(grid) => println!("{}", serde_json::to_string_pretty(&grid)?),
        None => println!("grid query failed"),
    }
    if let Some(trend) = service.get_trend_stats_data(&request).await? {
        println!("{}", serde_json::to_string_pretty(&trend)?);
    }
    if let Some(forecast) = service.get_forecast_cost_data(&request).await? {
        println!("{}", serde_json::to_string_pretty(&forecast)?);
    }
    Ok(())
}
