//! Shared types for the meridian client stack
//!
//! This crate holds the types that cross crate boundaries: the tagged error
//! status, timestamps and staleness bounds, SQL values, statements, mutations
//! and the connection mode enums.

mod error;
mod modes;
mod mutation;
mod statement;
mod timestamp;
mod transaction_id;
mod value;

pub use error::{Error, ErrorCode, Result};
pub use modes::{AutocommitDmlMode, TransactionMode};
pub use mutation::Mutation;
pub use statement::{AnalyzeMode, QueryOptions, Statement};
pub use timestamp::{TimeUnit, Timestamp, TimestampBound};
pub use transaction_id::TransactionId;
pub use value::{Row, Value};
