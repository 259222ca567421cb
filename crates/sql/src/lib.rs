//! Statement classification for the meridian connection API
//!
//! This crate does not parse SQL. It classifies a statement just far enough
//! for the connection controller to route it: a client-side control
//! directive, a query, an update, a DDL statement, or unknown. The
//! client-side directive grammar (SET/SHOW/BEGIN/COMMIT/...) is a fixed
//! keyword language and is tokenized by hand.

mod client_side;
mod parser;

pub use client_side::ClientSideStatement;
pub use parser::{ParsedStatement, StatementKind, parse};
