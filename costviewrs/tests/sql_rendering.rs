//! Integration tests for SQL AST rendering in both dialects.

use costview::dialect::{BigQueryDialect, DuckDbDialect};
use costview::sql_ast::{
    Function, LabelMatchOp, LabelUnnest, OrderItem, SelectItem, SelectQuery, SqlBinaryOperator,
    SqlExpr, SqlRenderer, TableRef,
};
use costview::views::{AggregationOperation, SortOrder, TimeGranularity};

fn col(name: &str) -> SqlExpr {
    SqlExpr::column(None, name)
}

fn daily_cost_query() -> SelectQuery {
    SelectQuery {
        from: TableRef {
            name: "unifiedTable".to_string(),
            alias: None,
        },
        select: vec![
            SelectItem {
                expr: col("product"),
                alias: Some("group_key".to_string()),
            },
            SelectItem {
                expr: SqlExpr::Function {
                    func: Function::EpochMillis,
                    args: vec![SqlExpr::Function {
                        func: Function::DateTrunc(TimeGranularity::Day),
                        args: vec![col("startTime")],
                    }],
                },
                alias: Some("time_bucket".to_string()),
            },
            SelectItem {
                expr: SqlExpr::Aggregate {
                    agg: AggregationOperation::Sum,
                    expr: Box::new(col("cost")),
                },
                alias: Some("cost".to_string()),
            },
        ],
        filters: vec![SqlExpr::binary(
            SqlBinaryOperator::Gte,
            col("startTime"),
            SqlExpr::Function {
                func: Function::TimestampFromMillis,
                args: vec![SqlExpr::Literal(1_700_000_000_000_i64.into())],
            },
        )],
        group_by: vec![col("group_key"), col("time_bucket")],
        order_by: vec![OrderItem {
            expr: col("time_bucket"),
            direction: SortOrder::Asc,
        }],
        limit: Some(50),
        offset: Some(100),
        ..Default::default()
    }
}

#[test]
fn duckdb_renders_group_order_and_pagination() {
    let sql = SqlRenderer::new(&DuckDbDialect).render_select(&daily_cost_query());
    assert_eq!(
        sql,
        "SELECT \"product\" AS \"group_key\", epoch_ms(date_trunc('day', \"startTime\")) AS \"time_bucket\", \
         SUM(\"cost\") AS \"cost\" FROM \"unifiedTable\" \
         WHERE (\"startTime\" >= epoch_ms(1700000000000)) \
         GROUP BY \"group_key\", \"time_bucket\" ORDER BY \"time_bucket\" ASC LIMIT 50 OFFSET 100"
    );
}

#[test]
fn bigquery_qualifies_table_and_uses_native_time_functions() {
    let dialect = BigQueryDialect::new("proj", "billing");
    let sql = SqlRenderer::new(&dialect).render_select(&daily_cost_query());
    assert!(sql.contains("FROM `proj.billing.unifiedTable`"));
    assert!(sql.contains("UNIX_MILLIS(TIMESTAMP_TRUNC(`startTime`, DAY)) AS `time_bucket`"));
    assert!(sql.contains("(`startTime` >= TIMESTAMP_MILLIS(1700000000000))"));
    assert!(sql.ends_with("LIMIT 50 OFFSET 100"));
}

#[test]
fn string_literals_escape_per_dialect() {
    let query = SelectQuery {
        from: TableRef {
            name: "t".to_string(),
            alias: None,
        },
        select: vec![SelectItem {
            expr: col("product"),
            alias: None,
        }],
        filters: vec![SqlExpr::InList {
            expr: Box::new(col("product")),
            list: vec![SqlExpr::string("it's")],
            negated: false,
        }],
        ..Default::default()
    };
    let duck = SqlRenderer::new(&DuckDbDialect).render_select(&query);
    assert!(duck.ends_with("WHERE \"product\" IN ('it''s')"));
    let bq = SqlRenderer::new(&BigQueryDialect::default()).render_select(&query);
    assert!(bq.ends_with("WHERE `product` IN ('it\\'s')"));
}

fn label_query() -> SelectQuery {
    SelectQuery {
        from: TableRef {
            name: "unifiedTable".to_string(),
            alias: None,
        },
        select: vec![SelectItem {
            expr: SqlExpr::LabelValue {
                table: None,
                key: "team".to_string(),
            },
            alias: Some("group_key".to_string()),
        }],
        filters: vec![SqlExpr::LabelMatch {
            table: None,
            key: "env".to_string(),
            op: LabelMatchOp::In,
            values: vec![SqlExpr::string("prod")],
        }],
        label_unnest: Some(LabelUnnest {
            key: Some("team".to_string()),
        }),
        ..Default::default()
    }
}

#[test]
fn bigquery_labels_flatten_with_key_predicate() {
    let sql = SqlRenderer::new(&BigQueryDialect::default()).render_select(&label_query());
    assert_eq!(
        sql,
        "SELECT labels_flat.value AS `group_key` FROM `unifiedTable` \
         LEFT JOIN UNNEST(`labels`) AS labels_flat \
         WHERE EXISTS (SELECT 1 FROM UNNEST(`labels`) AS l WHERE l.key = 'env' AND l.value IN ('prod')) \
         AND labels_flat.key = 'team'"
    );
}

#[test]
fn duckdb_labels_read_the_map_in_place() {
    let sql = SqlRenderer::new(&DuckDbDialect).render_select(&label_query());
    assert_eq!(
        sql,
        "SELECT map_extract(\"labels\", 'team')[1] AS \"group_key\" FROM \"unifiedTable\" \
         WHERE coalesce(map_extract(\"labels\", 'env')[1] IN ('prod'), false)"
    );
}

#[test]
fn case_and_not_render_nested() {
    let query = SelectQuery {
        from: TableRef {
            name: "t".to_string(),
            alias: None,
        },
        select: vec![SelectItem {
            expr: SqlExpr::Case {
                branches: vec![(
                    SqlExpr::InList {
                        expr: Box::new(col("product")),
                        list: vec![SqlExpr::string("ec2")],
                        negated: false,
                    },
                    SqlExpr::string("X"),
                )],
                else_expr: Box::new(SqlExpr::string("Others")),
            },
            alias: Some("group_key".to_string()),
        }],
        filters: vec![SqlExpr::Not(Box::new(SqlExpr::IsNull {
            expr: Box::new(col("clusterName")),
            negated: false,
        }))],
        distinct: true,
        ..Default::default()
    };
    let sql = SqlRenderer::new(&DuckDbDialect).render_select(&query);
    assert_eq!(
        sql,
        "SELECT DISTINCT CASE WHEN \"product\" IN ('ec2') THEN 'X' ELSE 'Others' END AS \"group_key\" \
         FROM \"t\" WHERE NOT (\"clusterName\" IS NULL)"
    );
}
