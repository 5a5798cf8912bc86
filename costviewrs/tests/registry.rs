//! Integration tests for loading saved views and business mappings from disk.

use std::fs;

use costview::registry::{ViewRegistry, ViewStore};
use costview::views::{FieldDomain, SharedCostStrategy, TimeGranularity, ViewIdOperator};
use costview::CostViewError;

const VIEW_YAML: &str = r#"
id: compute
name: Compute spend
rules:
  - conditions:
      - field: { field_id: product, field_name: Product, identifier: COMMON }
        operator: IN
        values: [ec2, gce]
      - field: { field_id: env, field_name: env, identifier: LABEL }
        operator: NOT_NULL
default_group_by: { field_id: clusterName, field_name: Cluster, identifier: CLUSTER }
default_granularity: WEEK
preferences:
  include_others: false
  aws:
    cost_basis: AMORTISED
"#;

const MAPPING_YAML: &str = r#"
id: teams
name: Teams
cost_targets:
  - name: Platform
    rules:
      - conditions:
          - field: { field_id: product, field_name: Product, identifier: COMMON }
            operator: IN
            values: [ec2]
shared_costs:
  - name: support
    strategy: FIXED
    rules:
      - conditions:
          - field: { field_id: product, field_name: Product, identifier: COMMON }
            operator: IN
            values: [support]
    splits:
      - { cost_target_name: Platform, percentage: 100 }
"#;

#[test]
fn loads_views_and_mappings_from_subdirectories() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("views")).unwrap();
    fs::create_dir(dir.path().join("mappings")).unwrap();
    fs::write(dir.path().join("views/compute.yaml"), VIEW_YAML).unwrap();
    fs::write(dir.path().join("mappings/teams.yml"), MAPPING_YAML).unwrap();
    fs::write(dir.path().join("views/README.md"), "not a view").unwrap();

    let registry = ViewRegistry::load_from_dir(dir.path()).unwrap();

    let view = registry.view("compute").expect("view loaded");
    assert_eq!(view.rules[0].conditions.len(), 2);
    assert_eq!(view.rules[0].conditions[1].operator, ViewIdOperator::NotNull);
    assert!(view.rules[0].conditions[1].values.is_empty());
    assert_eq!(
        view.default_group_by.map(|f| f.identifier),
        Some(FieldDomain::Cluster)
    );
    assert_eq!(view.default_granularity, Some(TimeGranularity::Week));
    assert_eq!(view.preferences.include_others, Some(false));

    let mapping = registry.business_mapping("teams").expect("mapping loaded");
    assert_eq!(mapping.cost_targets[0].name, "Platform");
    assert_eq!(mapping.shared_costs[0].strategy, SharedCostStrategy::Fixed);
    assert_eq!(mapping.shared_costs[0].splits[0].percentage, 100.0);
    assert!(registry.view("teams").is_none());
}

#[test]
fn missing_subdirectories_are_empty() {
    let dir = tempfile::tempdir().unwrap();
    let registry = ViewRegistry::load_from_dir(dir.path()).unwrap();
    assert!(registry.view("anything").is_none());
}

#[test]
fn malformed_yaml_names_the_file() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("views")).unwrap();
    fs::write(dir.path().join("views/broken.yml"), "id: [unterminated").unwrap();
    match ViewRegistry::load_from_dir(dir.path()) {
        Err(CostViewError::Config(msg)) => assert!(msg.contains("broken.yml")),
        other => panic!("expected config error, got {other:?}"),
    }
}
