//! Row mutations submitted outside of DML

use serde::{Deserialize, Serialize};

use crate::value::Row;

/// A buffered row mutation applied at commit time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    Insert {
        table: String,
        columns: Vec<String>,
        values: Row,
    },
    Update {
        table: String,
        columns: Vec<String>,
        values: Row,
    },
    InsertOrUpdate {
        table: String,
        columns: Vec<String>,
        values: Row,
    },
    Delete {
        table: String,
        key: Row,
    },
}

impl Mutation {
    pub fn table(&self) -> &str {
        match self {
            Mutation::Insert { table, .. }
            | Mutation::Update { table, .. }
            | Mutation::InsertOrUpdate { table, .. }
            | Mutation::Delete { table, .. } => table,
        }
    }
}
