//! Embedding API: the database handle, construction options, and the stats
//! snapshot consumed by an external admin endpoint.

pub mod database;

pub use database::{Database, DatabaseOptions, Stats};
