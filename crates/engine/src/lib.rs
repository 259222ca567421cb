//! Backend boundary for the meridian connection API
//!
//! This crate defines the narrow interfaces the connection controller talks
//! through: the database client, the DDL admin client, the process-wide
//! session pool, and a scriptable mock backend used by tests.

mod client;
mod config;
mod mock;
mod pool;
mod result;

pub use client::{DatabaseClient, DdlClient, TxHandle};
pub use config::ConnectionConfig;
pub use mock::MockDatabase;
pub use pool::{Backend, SessionPool};
pub use result::ResultSet;
