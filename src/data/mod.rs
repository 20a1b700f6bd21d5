//! Data layer module
//!
//! Handles all data persistence:
//! - SQLite connection pool and migrations
//! - Connection-scoped queries usable inside a transaction

mod database;
mod models;
pub mod store;

pub use database::Database;
#[cfg(test)]
pub(crate) use database::CountedTable;
pub use models::*;
