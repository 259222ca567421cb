//! Connection configuration

use meridian_common::QueryOptions;
use serde::{Deserialize, Serialize};

/// Configuration used to open a connection; also the key under which the
/// session pool shares backends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionConfig {
    database: String,
    autocommit: bool,
    read_only: bool,
    retry_aborts_internally: bool,
    query_options: QueryOptions,
}

impl ConnectionConfig {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            autocommit: true,
            read_only: false,
            retry_aborts_internally: true,
            query_options: QueryOptions::default(),
        }
    }

    pub fn with_autocommit(mut self, autocommit: bool) -> Self {
        self.autocommit = autocommit;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_retry_aborts_internally(mut self, retry: bool) -> Self {
        self.retry_aborts_internally = retry;
        self
    }

    pub fn with_query_options(mut self, query_options: QueryOptions) -> Self {
        self.query_options = query_options;
        self
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn autocommit(&self) -> bool {
        self.autocommit
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn retry_aborts_internally(&self) -> bool {
        self.retry_aborts_internally
    }

    pub fn query_options(&self) -> &QueryOptions {
        &self.query_options
    }
}
