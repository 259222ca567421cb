//! SQL statement text and per-query options

use serde::{Deserialize, Serialize};
use std::fmt;

/// A SQL statement as submitted by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Statement {
    sql: String,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into() }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Statement::new(sql)
    }
}

impl From<String> for Statement {
    fn from(sql: String) -> Self {
        Statement::new(sql)
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

/// Optimizer options attached to queries.
///
/// Connection-level defaults are merged with statement-level options; a set
/// field on the statement wins.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct QueryOptions {
    optimizer_version: Option<String>,
    optimizer_statistics_package: Option<String>,
}

impl QueryOptions {
    pub fn optimizer_version(&self) -> Option<&str> {
        self.optimizer_version.as_deref()
    }

    pub fn set_optimizer_version(&mut self, version: impl Into<String>) {
        self.optimizer_version = Some(version.into());
    }

    pub fn optimizer_statistics_package(&self) -> Option<&str> {
        self.optimizer_statistics_package.as_deref()
    }

    pub fn set_optimizer_statistics_package(&mut self, package: impl Into<String>) {
        self.optimizer_statistics_package = Some(package.into());
    }

    /// Merge `other` on top of `self`: fields set in `other` win.
    pub fn merged_with(&self, other: &QueryOptions) -> QueryOptions {
        QueryOptions {
            optimizer_version: other
                .optimizer_version
                .clone()
                .or_else(|| self.optimizer_version.clone()),
            optimizer_statistics_package: other
                .optimizer_statistics_package
                .clone()
                .or_else(|| self.optimizer_statistics_package.clone()),
        }
    }
}

/// Whether a query is executed, planned, or profiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AnalyzeMode {
    /// Execute the query and return its rows.
    #[default]
    None,
    /// Return the query plan without executing.
    Plan,
    /// Execute the query and return rows plus execution statistics.
    Profile,
}
