//! Database layer implementations.

pub mod postgres;

pub use postgres::{PostgresClient, PostgresConfig};
