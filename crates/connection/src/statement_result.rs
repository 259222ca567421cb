//! Result of a statement executed through the generic `execute` entry point

use meridian_common::{Error, Result};
use meridian_engine::ResultSet;

/// What a statement produced: rows, an affected-row count, or nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum StatementResult {
    ResultSet(ResultSet),
    UpdateCount(i64),
    NoResult,
}

impl StatementResult {
    pub fn result_set(&self) -> Option<&ResultSet> {
        match self {
            StatementResult::ResultSet(rs) => Some(rs),
            _ => None,
        }
    }

    pub fn into_result_set(self) -> Result<ResultSet> {
        match self {
            StatementResult::ResultSet(rs) => Ok(rs),
            _ => Err(Error::invalid_argument(
                "the statement did not return a result set",
            )),
        }
    }

    pub fn update_count(&self) -> Result<i64> {
        match self {
            StatementResult::UpdateCount(count) => Ok(*count),
            _ => Err(Error::invalid_argument(
                "the statement did not return an update count",
            )),
        }
    }

    pub fn is_no_result(&self) -> bool {
        matches!(self, StatementResult::NoResult)
    }
}
