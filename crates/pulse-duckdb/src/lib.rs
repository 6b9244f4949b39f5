pub mod backend;
pub mod pushdown;
pub mod registry;
pub mod schema;
pub mod store_impl;

pub use backend::DuckDbBackend;

/// Re-export the `duckdb` crate so tests can use `pulse_duckdb::duckdb::params!`
/// without an extra dependency.
pub use duckdb;
