//! Query sandbox.
//!
//! Runs externally supplied SQL (typically written by an LLM agent) against
//! the store without any possibility of mutation. A query must pass the
//! textual checks in [`validate`], then runs on a read-only, `query_only`
//! connection whose prepared statement must also report itself read-only.
//! Results are capped in rows and wall-clock time.
//!
//! Every outcome is a [`QueryOutcome`]: either rows or a [`Rejection`] naming
//! the rule that failed. Rejections are answers for the caller, not errors of
//! the service.

pub mod lexer;
pub mod tool;
pub mod validate;

use crate::config::{Config, MAX_QUERY_ROWS};
use crate::store::{open_read_only, StoreError};
use rusqlite::types::ValueRef;
use rusqlite::ErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub use tool::{handle_tool_call, tool_definitions, SQL_QUERY_TOOL};

/// SQLite VM instructions between deadline checks.
const PROGRESS_INTERVAL: i32 = 1_000;

/// The check a query failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectRule {
    Empty,
    Syntax,
    MultipleStatements,
    NotSelect,
    ForbiddenKeyword,
    /// SQLite could not prepare the statement
    InvalidSql,
    /// The prepared statement would write
    ReadOnlyViolation,
    Timeout,
}

impl RejectRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectRule::Empty => "empty",
            RejectRule::Syntax => "syntax",
            RejectRule::MultipleStatements => "multiple_statements",
            RejectRule::NotSelect => "not_select",
            RejectRule::ForbiddenKeyword => "forbidden_keyword",
            RejectRule::InvalidSql => "invalid_sql",
            RejectRule::ReadOnlyViolation => "read_only_violation",
            RejectRule::Timeout => "timeout",
        }
    }
}

/// Structured refusal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub rule: RejectRule,
    pub detail: String,
}

impl Rejection {
    pub fn new(rule: RejectRule, detail: impl Into<String>) -> Self {
        Self {
            rule,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "query rejected ({}): {}", self.rule.as_str(), self.detail)
    }
}

/// Rows returned by an accepted query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
    /// More rows were available than the cap allowed
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueryOutcome {
    Accepted(QueryRows),
    Rejected(Rejection),
}

impl QueryOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, QueryOutcome::Accepted(_))
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            QueryOutcome::Rejected(r) => Some(r),
            QueryOutcome::Accepted(_) => None,
        }
    }
}

/// Read-only query executor for one database file.
#[derive(Debug, Clone)]
pub struct QuerySandbox {
    db_path: PathBuf,
    default_limit: usize,
    timeout: Duration,
}

impl QuerySandbox {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        let defaults = Config::default();
        Self {
            db_path: db_path.into(),
            default_limit: defaults.query_row_limit,
            timeout: defaults.query_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            db_path: config.db_path.clone(),
            default_limit: config.query_row_limit,
            timeout: config.query_timeout,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Validate and run `sql`, returning at most `limit` rows (clamped to
    /// `1..=10000`, default from configuration).
    ///
    /// `Err` is reserved for an unreachable store; anything wrong with the
    /// query itself is a [`QueryOutcome::Rejected`].
    pub fn execute(&self, sql: &str, limit: Option<usize>) -> Result<QueryOutcome, StoreError> {
        if let Err(rejection) = validate::validate(sql) {
            tracing::info!(rule = rejection.rule.as_str(), "query rejected by validation");
            return Ok(QueryOutcome::Rejected(rejection));
        }

        let limit = limit.unwrap_or(self.default_limit).clamp(1, MAX_QUERY_ROWS);
        let conn = open_read_only(&self.db_path)?;

        let outcome = run_query(&conn, sql, limit, self.timeout);
        if let QueryOutcome::Rejected(ref rejection) = outcome {
            tracing::info!(rule = rejection.rule.as_str(), detail = %rejection.detail, "query rejected");
        }
        Ok(outcome)
    }
}

fn run_query(
    conn: &rusqlite::Connection,
    sql: &str,
    limit: usize,
    timeout: Duration,
) -> QueryOutcome {
    let mut stmt = match conn.prepare(sql) {
        Ok(stmt) => stmt,
        Err(e) => return QueryOutcome::Rejected(Rejection::new(RejectRule::InvalidSql, e.to_string())),
    };
    if !stmt.readonly() {
        return QueryOutcome::Rejected(Rejection::new(
            RejectRule::ReadOnlyViolation,
            "statement would modify the database",
        ));
    }

    let deadline = Instant::now() + timeout;
    conn.progress_handler(PROGRESS_INTERVAL, Some(move || Instant::now() >= deadline));

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let result = collect_rows(&mut stmt, &columns, limit);
    drop(stmt);
    conn.progress_handler(PROGRESS_INTERVAL, None::<fn() -> bool>);

    match result {
        Ok((rows, truncated)) => QueryOutcome::Accepted(QueryRows {
            columns,
            rows,
            truncated,
        }),
        Err(e) if is_interrupt(&e) => QueryOutcome::Rejected(Rejection::new(
            RejectRule::Timeout,
            format!("query exceeded {} ms", timeout.as_millis()),
        )),
        Err(e) => QueryOutcome::Rejected(Rejection::new(RejectRule::InvalidSql, e.to_string())),
    }
}

fn collect_rows(
    stmt: &mut rusqlite::Statement<'_>,
    columns: &[String],
    limit: usize,
) -> rusqlite::Result<(Vec<Map<String, Value>>, bool)> {
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();

    while let Some(row) = rows.next()? {
        if out.len() == limit {
            return Ok((out, true));
        }
        let mut object = Map::with_capacity(columns.len());
        for (i, name) in columns.iter().enumerate() {
            object.insert(name.clone(), json_value(row.get_ref(i)?));
        }
        out.push(object);
    }
    Ok((out, false))
}

fn json_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(format!("<blob: {} bytes>", b.len())),
    }
}

fn is_interrupt(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::OperationInterrupted)
}
