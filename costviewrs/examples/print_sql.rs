use std::{collections::HashMap, env, fs, path::PathBuf, sync::Arc};

use costview::{
    config::ViewConfig,
    dialect::{BigQueryDialect, Dialect, DuckDbDialect},
    preferences,
    query_builder::{QueryKind, ViewQueryBuilder},
    registry::ViewRegistry,
    ViewQueryRequest,
};

fn usage() {
    eprintln!("Usage: print_sql <view_dir> <request_json> [grid|series|cost|values] [duckdb|bigquery]");
    eprintln!("Example: cargo run --example print_sql -- demos/views demos/requests/by_product.json grid bigquery");
}

fn main() -> anyhow::Result<()> {
    let mut args = env::args().skip(1).collect::<Vec<_>>();
    if args.len() < 2 {
        usage();
        std::process::exit(1);
    }

    let view_dir = PathBuf::from(args.remove(0));
    let request_path = PathBuf::from(args.remove(0));
    let kind = match args.first().map(String::as_str).unwrap_or("grid") {
        "grid" => QueryKind::Grid,
        "series" => QueryKind::TimeSeries,
        "cost" => QueryKind::CostData,
        "values" => QueryKind::FilterValues,
        other => anyhow::bail!("unknown query kind {other}"),
    };
    let dialect: Box<dyn Dialect> = match args.get(1).map(String::as_str).unwrap_or("duckdb") {
        "duckdb" => Box::new(DuckDbDialect),
        "bigquery" => Box::new(BigQueryDialect::default()),
        other => anyhow::bail!("unknown dialect {other}"),
    };

    let registry = ViewRegistry::load_from_dir(view_dir)?;
    let request: ViewQueryRequest = serde_json::from_str(&fs::read_to_string(request_path)?)?;

    let config = ViewConfig::default();
    let builder = ViewQueryBuilder::new(&registry, &config);
    let view = builder.resolve_view(&request)?;
    let formula = preferences::resolve(
        request.preferences.as_ref(),
        view.as_ref(),
        &Arc::new(HashMap::new()),
    )
    .cost_formula();

    let spec = builder.build(&request, kind, &formula)?;
    println!("{}", spec.render(dialect.as_ref()));
    Ok(())
}
