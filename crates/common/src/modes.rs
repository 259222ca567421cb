//! Connection mode enums

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a DML statement is executed in autocommit mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AutocommitDmlMode {
    /// Wrap the statement in a one-statement read/write transaction.
    #[default]
    Transactional,
    /// Same, but a server abort triggers a single internal replay.
    TransactionalWithRetry,
    /// Execute as partitioned DML with non-atomic semantics; the result is a
    /// lower bound on the number of affected rows.
    PartitionedNonAtomic,
}

impl AutocommitDmlMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "TRANSACTIONAL" => Ok(AutocommitDmlMode::Transactional),
            "TRANSACTIONAL_WITH_RETRY" => Ok(AutocommitDmlMode::TransactionalWithRetry),
            "PARTITIONED_NON_ATOMIC" => Ok(AutocommitDmlMode::PartitionedNonAtomic),
            _ => Err(Error::invalid_argument(format!(
                "unknown autocommit DML mode: {}",
                s
            ))),
        }
    }
}

impl fmt::Display for AutocommitDmlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AutocommitDmlMode::Transactional => "TRANSACTIONAL",
            AutocommitDmlMode::TransactionalWithRetry => "TRANSACTIONAL_WITH_RETRY",
            AutocommitDmlMode::PartitionedNonAtomic => "PARTITIONED_NON_ATOMIC",
        };
        f.write_str(name)
    }
}

/// The mode of an explicit (multi-statement) transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

impl fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionMode::ReadOnly => f.write_str("READ ONLY"),
            TransactionMode::ReadWrite => f.write_str("READ WRITE"),
        }
    }
}
