//! Statement tokenization and classification

use meridian_common::{Error, QueryOptions, Result, Statement};
use serde::{Deserialize, Serialize};

use crate::client_side::{self, ClientSideStatement};

/// The classification of a submitted statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatementKind {
    /// A control directive handled by the connection itself.
    ClientSide,
    /// A statement that returns rows.
    Query,
    /// A DML statement that returns an affected-row count.
    Update,
    /// A schema change submitted to the admin service.
    Ddl,
    /// Not recognized; rejected at execution time.
    Unknown,
}

/// A classified statement, ready for dispatch by the connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedStatement {
    kind: StatementKind,
    statement: Statement,
    sql: String,
    client_side: Option<ClientSideStatement>,
    query_options: QueryOptions,
}

impl ParsedStatement {
    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    /// The statement as submitted by the caller.
    pub fn statement(&self) -> &Statement {
        &self.statement
    }

    /// The statement text with comments stripped and whitespace collapsed.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn client_side(&self) -> Option<&ClientSideStatement> {
        self.client_side.as_ref()
    }

    /// Query options in effect for this statement (connection defaults).
    pub fn query_options(&self) -> &QueryOptions {
        &self.query_options
    }

    pub fn is_query(&self) -> bool {
        self.kind == StatementKind::Query
    }

    pub fn is_update(&self) -> bool {
        self.kind == StatementKind::Update
    }

    pub fn is_ddl(&self) -> bool {
        self.kind == StatementKind::Ddl
    }
}

/// Classify a statement.
///
/// Fails with `InvalidArgument` when the statement is a recognized control
/// directive with a malformed value (e.g. `SET AUTOCOMMIT = MAYBE`).
pub fn parse(statement: &Statement, defaults: &QueryOptions) -> Result<ParsedStatement> {
    let tokens = tokenize(statement.sql())?;
    let sql = tokens
        .iter()
        .map(|t| t.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");

    let client_side = client_side::recognize(&tokens)?;
    let kind = if client_side.is_some() {
        StatementKind::ClientSide
    } else {
        classify(&tokens)
    };

    Ok(ParsedStatement {
        kind,
        statement: statement.clone(),
        sql,
        client_side,
        query_options: defaults.clone(),
    })
}

fn classify(tokens: &[Token]) -> StatementKind {
    let Some(first) = tokens.first() else {
        return StatementKind::Unknown;
    };
    if first.quoted {
        return StatementKind::Unknown;
    }
    if first.is_keyword("SELECT") || first.is_keyword("WITH") {
        StatementKind::Query
    } else if first.is_keyword("INSERT") || first.is_keyword("UPDATE") || first.is_keyword("DELETE")
    {
        StatementKind::Update
    } else if first.is_keyword("CREATE") || first.is_keyword("DROP") || first.is_keyword("ALTER") {
        StatementKind::Ddl
    } else {
        StatementKind::Unknown
    }
}

/// A single token of the statement text. Quoted strings are kept as one
/// token with the quotes removed.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub text: String,
    pub quoted: bool,
}

impl Token {
    pub fn is_keyword(&self, keyword: &str) -> bool {
        !self.quoted && self.text.eq_ignore_ascii_case(keyword)
    }

    /// The token's value, whether it was quoted or bare.
    pub fn value(&self) -> &str {
        &self.text
    }
}

/// Split the statement into tokens, stripping `--` and `/* */` comments.
fn tokenize(sql: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = sql.chars().peekable();
    let mut current = String::new();

    let flush = |current: &mut String, tokens: &mut Vec<Token>| {
        if !current.is_empty() {
            tokens.push(Token {
                text: std::mem::take(current),
                quoted: false,
            });
        }
    };

    while let Some(c) = chars.next() {
        match c {
            '-' if chars.peek() == Some(&'-') => {
                flush(&mut current, &mut tokens);
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                flush(&mut current, &mut tokens);
                chars.next();
                let mut prev = '\0';
                let mut terminated = false;
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        terminated = true;
                        break;
                    }
                    prev = c;
                }
                if !terminated {
                    return Err(Error::invalid_argument("unterminated block comment"));
                }
            }
            '\'' | '"' => {
                flush(&mut current, &mut tokens);
                let quote = c;
                let mut text = String::new();
                let mut terminated = false;
                while let Some(c) = chars.next() {
                    if c == quote {
                        // Doubled quote is an escaped quote character.
                        if chars.peek() == Some(&quote) {
                            chars.next();
                            text.push(quote);
                        } else {
                            terminated = true;
                            break;
                        }
                    } else {
                        text.push(c);
                    }
                }
                if !terminated {
                    return Err(Error::invalid_argument("unterminated string literal"));
                }
                tokens.push(Token { text, quoted: true });
            }
            '=' => {
                flush(&mut current, &mut tokens);
                tokens.push(Token {
                    text: "=".to_string(),
                    quoted: false,
                });
            }
            ';' => {
                flush(&mut current, &mut tokens);
            }
            c if c.is_whitespace() => flush(&mut current, &mut tokens),
            c => current.push(c),
        }
    }
    flush(&mut current, &mut tokens);
    Ok(tokens)
}
