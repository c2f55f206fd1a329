//! FTP storage pool
//!
//! A bounded pool of authenticated FTP connections for storage backends.
//! Connections are leased out as exclusive single-use [`Session`]s, dead
//! connections are detected and replaced lazily at lease time, and a
//! saturated pool rejects callers immediately instead of queueing them.

pub mod config;
pub mod connection;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod session;

pub use config::PoolConfig;
pub use error::PoolError;
pub use pool::ConnectionPool;
pub use session::Session;
