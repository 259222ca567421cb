//! Result set container

use meridian_common::{Row, Value};
use serde::{Deserialize, Serialize};

/// The rows returned by a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResultSet {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    /// A result set with a single column and a single value.
    pub fn single_column(column: impl Into<String>, value: Value) -> Self {
        Self {
            columns: vec![column.into()],
            rows: vec![vec![value]],
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// The value in the first row and column, if any.
    pub fn single_value(&self) -> Option<&Value> {
        self.rows.first().and_then(|row| row.first())
    }

    /// All values of the named column.
    pub fn column_values(&self, column_name: &str) -> Vec<&Value> {
        match self.columns.iter().position(|c| c == column_name) {
            Some(index) => self
                .rows
                .iter()
                .filter_map(|row| row.get(index))
                .collect(),
            None => Vec::new(),
        }
    }
}
