//! Error handling
//!
//! Defines error types and handling for the connection pool.

pub mod types;

pub use types::PoolError;
