//! The client-side control directive grammar

use meridian_common::{
    AutocommitDmlMode, Error, Result, TimeUnit, Timestamp, TimestampBound, TransactionMode,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::parser::Token;

/// A control directive recognized and handled by the connection itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientSideStatement {
    ShowAutocommit,
    SetAutocommit(bool),
    ShowReadOnly,
    SetReadOnly(bool),
    ShowAutocommitDmlMode,
    SetAutocommitDmlMode(AutocommitDmlMode),
    ShowStatementTimeout,
    SetStatementTimeout(Option<(u64, TimeUnit)>),
    ShowReadOnlyStaleness,
    SetReadOnlyStaleness(TimestampBound),
    ShowOptimizerVersion,
    SetOptimizerVersion(String),
    ShowRetryAbortsInternally,
    SetRetryAbortsInternally(bool),
    ShowReadTimestamp,
    ShowCommitTimestamp,
    Begin(Option<TransactionMode>),
    Commit,
    Rollback,
    SetTransactionMode(TransactionMode),
    StartBatchDdl,
    StartBatchDml,
    RunBatch,
    AbortBatch,
}

/// Try to recognize a control directive.
///
/// Returns `Ok(None)` for anything that is not a directive; fails with
/// `InvalidArgument` for a directive with a malformed value.
pub(crate) fn recognize(tokens: &[Token]) -> Result<Option<ClientSideStatement>> {
    let Some(first) = tokens.first() else {
        return Ok(None);
    };
    if first.quoted {
        return Ok(None);
    }
    if first.is_keyword("SHOW") {
        return recognize_show(&tokens[1..]);
    }
    if first.is_keyword("SET") {
        return recognize_set(&tokens[1..]);
    }
    if first.is_keyword("BEGIN") {
        return recognize_begin(&tokens[1..]);
    }
    if first.is_keyword("COMMIT") && matches_tail(&tokens[1..], &["TRANSACTION"]) {
        return Ok(Some(ClientSideStatement::Commit));
    }
    if first.is_keyword("ROLLBACK") && matches_tail(&tokens[1..], &["TRANSACTION"]) {
        return Ok(Some(ClientSideStatement::Rollback));
    }
    if first.is_keyword("START") {
        if keywords(tokens, &["START", "BATCH", "DDL"]) {
            return Ok(Some(ClientSideStatement::StartBatchDdl));
        }
        if keywords(tokens, &["START", "BATCH", "DML"]) {
            return Ok(Some(ClientSideStatement::StartBatchDml));
        }
        return Ok(None);
    }
    if keywords(tokens, &["RUN", "BATCH"]) {
        return Ok(Some(ClientSideStatement::RunBatch));
    }
    if keywords(tokens, &["ABORT", "BATCH"]) {
        return Ok(Some(ClientSideStatement::AbortBatch));
    }
    Ok(None)
}

fn recognize_show(tokens: &[Token]) -> Result<Option<ClientSideStatement>> {
    // Allow the explicit `SHOW VARIABLE <name>` form as well.
    let tokens = if tokens.first().is_some_and(|t| t.is_keyword("VARIABLE")) {
        &tokens[1..]
    } else {
        tokens
    };
    let [name] = tokens else {
        return Ok(None);
    };
    if name.quoted {
        return Ok(None);
    }
    let statement = match name.value().to_ascii_uppercase().as_str() {
        "AUTOCOMMIT" => ClientSideStatement::ShowAutocommit,
        "READ_ONLY" => ClientSideStatement::ShowReadOnly,
        "AUTOCOMMIT_DML_MODE" => ClientSideStatement::ShowAutocommitDmlMode,
        "STATEMENT_TIMEOUT" => ClientSideStatement::ShowStatementTimeout,
        "READ_ONLY_STALENESS" => ClientSideStatement::ShowReadOnlyStaleness,
        "OPTIMIZER_VERSION" => ClientSideStatement::ShowOptimizerVersion,
        "RETRY_ABORTS_INTERNALLY" => ClientSideStatement::ShowRetryAbortsInternally,
        "READ_TIMESTAMP" => ClientSideStatement::ShowReadTimestamp,
        "COMMIT_TIMESTAMP" => ClientSideStatement::ShowCommitTimestamp,
        _ => return Ok(None),
    };
    Ok(Some(statement))
}

fn recognize_set(tokens: &[Token]) -> Result<Option<ClientSideStatement>> {
    // SET TRANSACTION READ ONLY | READ WRITE
    if tokens.first().is_some_and(|t| t.is_keyword("TRANSACTION")) {
        let Some(mode) = transaction_mode(&tokens[1..]) else {
            return Err(Error::invalid_argument(
                "SET TRANSACTION must be followed by READ ONLY or READ WRITE",
            ));
        };
        return Ok(Some(ClientSideStatement::SetTransactionMode(mode)));
    }

    // SET <name> (= | TO) <value>
    let [name, separator, value @ ..] = tokens else {
        return Ok(None);
    };
    if name.quoted || !(separator.is_keyword("=") || separator.is_keyword("TO")) {
        return Ok(None);
    }
    let statement = match name.value().to_ascii_uppercase().as_str() {
        "AUTOCOMMIT" => ClientSideStatement::SetAutocommit(parse_bool(single(value, name)?)?),
        "READ_ONLY" => ClientSideStatement::SetReadOnly(parse_bool(single(value, name)?)?),
        "AUTOCOMMIT_DML_MODE" => ClientSideStatement::SetAutocommitDmlMode(
            AutocommitDmlMode::parse(single(value, name)?.value())?,
        ),
        "STATEMENT_TIMEOUT" => {
            let value = single(value, name)?;
            if value.is_keyword("NULL") {
                ClientSideStatement::SetStatementTimeout(None)
            } else {
                ClientSideStatement::SetStatementTimeout(Some(parse_timeout(value.value())?))
            }
        }
        "READ_ONLY_STALENESS" => {
            ClientSideStatement::SetReadOnlyStaleness(parse_staleness(single(value, name)?.value())?)
        }
        "OPTIMIZER_VERSION" => {
            ClientSideStatement::SetOptimizerVersion(single(value, name)?.value().to_string())
        }
        "RETRY_ABORTS_INTERNALLY" => {
            ClientSideStatement::SetRetryAbortsInternally(parse_bool(single(value, name)?)?)
        }
        _ => return Ok(None),
    };
    Ok(Some(statement))
}

fn recognize_begin(tokens: &[Token]) -> Result<Option<ClientSideStatement>> {
    let tokens = if tokens.first().is_some_and(|t| t.is_keyword("TRANSACTION")) {
        &tokens[1..]
    } else {
        tokens
    };
    if tokens.is_empty() {
        return Ok(Some(ClientSideStatement::Begin(None)));
    }
    match transaction_mode(tokens) {
        Some(mode) => Ok(Some(ClientSideStatement::Begin(Some(mode)))),
        None => Err(Error::invalid_argument(
            "BEGIN may only be followed by READ ONLY or READ WRITE",
        )),
    }
}

fn transaction_mode(tokens: &[Token]) -> Option<TransactionMode> {
    if keywords(tokens, &["READ", "ONLY"]) {
        Some(TransactionMode::ReadOnly)
    } else if keywords(tokens, &["READ", "WRITE"]) {
        Some(TransactionMode::ReadWrite)
    } else {
        None
    }
}

fn keywords(tokens: &[Token], expected: &[&str]) -> bool {
    tokens.len() == expected.len()
        && tokens
            .iter()
            .zip(expected)
            .all(|(token, keyword)| token.is_keyword(keyword))
}

/// True when `tokens` is empty or exactly the optional keywords given.
fn matches_tail(tokens: &[Token], optional: &[&str]) -> bool {
    tokens.is_empty() || keywords(tokens, optional)
}

fn single<'a>(value: &'a [Token], name: &Token) -> Result<&'a Token> {
    let [token] = value else {
        return Err(Error::invalid_argument(format!(
            "SET {} expects a single value",
            name.value().to_ascii_uppercase()
        )));
    };
    Ok(token)
}

fn parse_bool(token: &Token) -> Result<bool> {
    match token.value().to_ascii_uppercase().as_str() {
        "TRUE" | "ON" => Ok(true),
        "FALSE" | "OFF" => Ok(false),
        other => Err(Error::invalid_argument(format!(
            "expected TRUE or FALSE, got: {}",
            other
        ))),
    }
}

/// Parse a timeout literal such as `10s`, `250ms`, `5us` or `100ns`.
fn parse_timeout(s: &str) -> Result<(u64, TimeUnit)> {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    let suffix = &s[digits.len()..];
    let unit = match suffix {
        "s" => TimeUnit::Seconds,
        "ms" => TimeUnit::Milliseconds,
        "us" => TimeUnit::Microseconds,
        "ns" => TimeUnit::Nanoseconds,
        _ => {
            return Err(Error::invalid_argument(format!(
                "invalid timeout value '{}': expected <number><s|ms|us|ns>",
                s
            )));
        }
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| Error::invalid_argument(format!("invalid timeout value '{}'", s)))?;
    if value == 0 {
        return Err(Error::invalid_argument(
            "zero timeout values are not allowed",
        ));
    }
    Ok((value, unit))
}

fn parse_duration(s: &str) -> Result<Duration> {
    let (value, unit) = parse_timeout(s)?;
    Ok(unit.to_duration(value))
}

/// Parse a staleness literal: `STRONG`, `EXACT_STALENESS 10s`,
/// `MAX_STALENESS 5s`, `READ_TIMESTAMP <rfc3339>` or
/// `MIN_READ_TIMESTAMP <rfc3339>`.
fn parse_staleness(s: &str) -> Result<TimestampBound> {
    let mut parts = s.split_whitespace();
    let mode = parts.next().unwrap_or("").to_ascii_uppercase();
    let argument = parts.next();
    if parts.next().is_some() {
        return Err(Error::invalid_argument(format!(
            "invalid staleness value '{}'",
            s
        )));
    }
    fn require<'a>(argument: Option<&'a str>, mode: &str) -> Result<&'a str> {
        argument.ok_or_else(|| {
            Error::invalid_argument(format!("staleness mode {} requires a value", mode))
        })
    }
    match mode.as_str() {
        "STRONG" => {
            if argument.is_some() {
                return Err(Error::invalid_argument("STRONG does not take a value"));
            }
            Ok(TimestampBound::Strong)
        }
        "EXACT_STALENESS" => Ok(TimestampBound::ExactStaleness(parse_duration(require(
            argument, &mode,
        )?)?)),
        "MAX_STALENESS" => Ok(TimestampBound::MaxStaleness(parse_duration(require(
            argument, &mode,
        )?)?)),
        "READ_TIMESTAMP" => Ok(TimestampBound::ReadTimestamp(Timestamp::parse(require(
            argument, &mode,
        )?)?)),
        "MIN_READ_TIMESTAMP" => Ok(TimestampBound::MinReadTimestamp(Timestamp::parse(require(
            argument, &mode,
        )?)?)),
        _ => Err(Error::invalid_argument(format!(
            "unknown staleness mode '{}'",
            mode
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{StatementKind, parse};
    use meridian_common::{QueryOptions, Statement};

    fn directive(sql: &str) -> ClientSideStatement {
        let parsed = parse(&Statement::new(sql), &QueryOptions::default()).unwrap();
        assert_eq!(parsed.kind(), StatementKind::ClientSide, "sql: {}", sql);
        parsed.client_side().unwrap().clone()
    }

    #[test]
    fn test_set_autocommit() {
        assert_eq!(
            directive("SET AUTOCOMMIT = TRUE"),
            ClientSideStatement::SetAutocommit(true)
        );
        assert_eq!(
            directive("set autocommit to off"),
            ClientSideStatement::SetAutocommit(false)
        );
    }

    #[test]
    fn test_show_variants() {
        assert_eq!(directive("SHOW AUTOCOMMIT"), ClientSideStatement::ShowAutocommit);
        assert_eq!(
            directive("SHOW VARIABLE READ_ONLY_STALENESS"),
            ClientSideStatement::ShowReadOnlyStaleness
        );
        assert_eq!(
            directive("show commit_timestamp"),
            ClientSideStatement::ShowCommitTimestamp
        );
    }

    #[test]
    fn test_set_staleness() {
        assert_eq!(
            directive("SET READ_ONLY_STALENESS = 'MAX_STALENESS 5s'"),
            ClientSideStatement::SetReadOnlyStaleness(TimestampBound::MaxStaleness(
                Duration::from_secs(5)
            ))
        );
        assert_eq!(
            directive("SET READ_ONLY_STALENESS = 'STRONG'"),
            ClientSideStatement::SetReadOnlyStaleness(TimestampBound::Strong)
        );
    }

    #[test]
    fn test_set_statement_timeout() {
        assert_eq!(
            directive("SET STATEMENT_TIMEOUT = '250ms'"),
            ClientSideStatement::SetStatementTimeout(Some((250, TimeUnit::Milliseconds)))
        );
        assert_eq!(
            directive("SET STATEMENT_TIMEOUT = NULL"),
            ClientSideStatement::SetStatementTimeout(None)
        );
    }

    #[test]
    fn test_begin_forms() {
        assert_eq!(directive("BEGIN"), ClientSideStatement::Begin(None));
        assert_eq!(
            directive("BEGIN TRANSACTION READ ONLY"),
            ClientSideStatement::Begin(Some(TransactionMode::ReadOnly))
        );
        assert_eq!(
            directive("begin read write"),
            ClientSideStatement::Begin(Some(TransactionMode::ReadWrite))
        );
    }

    #[test]
    fn test_transaction_control() {
        assert_eq!(directive("COMMIT"), ClientSideStatement::Commit);
        assert_eq!(directive("ROLLBACK TRANSACTION"), ClientSideStatement::Rollback);
        assert_eq!(
            directive("SET TRANSACTION READ ONLY"),
            ClientSideStatement::SetTransactionMode(TransactionMode::ReadOnly)
        );
    }

    #[test]
    fn test_batch_control() {
        assert_eq!(directive("START BATCH DDL"), ClientSideStatement::StartBatchDdl);
        assert_eq!(directive("START BATCH DML"), ClientSideStatement::StartBatchDml);
        assert_eq!(directive("RUN BATCH"), ClientSideStatement::RunBatch);
        assert_eq!(directive("ABORT BATCH"), ClientSideStatement::AbortBatch);
    }

    #[test]
    fn test_malformed_directive_values() {
        let opts = QueryOptions::default();
        assert!(parse(&Statement::new("SET AUTOCOMMIT = MAYBE"), &opts).is_err());
        assert!(parse(&Statement::new("SET STATEMENT_TIMEOUT = '10 parsecs'"), &opts).is_err());
        assert!(parse(&Statement::new("SET READ_ONLY_STALENESS = 'FUZZY'"), &opts).is_err());
        assert!(parse(&Statement::new("BEGIN SIDEWAYS"), &opts).is_err());
    }

    #[test]
    fn test_unrecognized_set_is_not_client_side() {
        let parsed = parse(
            &Statement::new("SET SOMETHING_ELSE = TRUE"),
            &QueryOptions::default(),
        )
        .unwrap();
        assert_eq!(parsed.kind(), StatementKind::Unknown);
        assert!(parsed.client_side().is_none());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        assert!(
            parse(
                &Statement::new("SET STATEMENT_TIMEOUT = '0s'"),
                &QueryOptions::default()
            )
            .is_err()
        );
    }
}
