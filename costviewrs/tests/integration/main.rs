//! End-to-end tests against a real DuckDB database.

#[cfg(feature = "duckdb")]
mod duckdb_views;
