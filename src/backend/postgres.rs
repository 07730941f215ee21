//! PostgreSQL: rows are pulled through a cursor, `max_rows + 1` at a time, so
//! the extra row tells whether the result was cut short.
//!
//! The cursor goes through the extended protocol, which refuses text holding
//! several statements. Such text is re-run through the simple protocol
//! without a cursor, and then the row cap does not apply.

use crate::backend::{
    close_quietly, ColumnMeta, Connector, CursorSession, Outcome, Phase, QueryResult, QueryRun,
    Row, RowOutcome,
};
use crate::config::ConnectionSpec;
use crate::error::DbcapError;
use futures_util::TryStreamExt;
use secrecy::ExposeSecret;
use serde_json::Value;
use sqlx::postgres::types::{Oid, PgInterval, PgTimeTz};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow, PgSslMode, PgValueFormat, Postgres};
use sqlx::types::chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::types::{Decimal, Uuid};
use sqlx::{Column, ConnectOptions, Connection, Decode, Row as _, Type, TypeInfo, ValueRef};
use std::time::Duration;
use tracing::debug;

/// SQLSTATE `syntax_error`, raised among others for
/// "cannot insert multiple commands into a prepared statement".
const SYNTAX_ERROR: &str = "42601";

pub async fn run<C>(
    connector: &C,
    sql: &str,
    spec: &ConnectionSpec,
    on_done: impl FnOnce(Outcome) + Send + 'static,
) where
    C: Connector,
    C::Session: CursorSession,
{
    let mut run = QueryRun::new(spec.max_rows, on_done);

    let mut session = match connector.connect(spec).await {
        Ok(session) => session,
        Err(err) => {
            run.fail(err);
            return;
        }
    };

    run.advance(Phase::Querying);
    match session.read(sql, spec.max_rows.saturating_add(1)).await {
        Ok(rows) => {
            run.advance(Phase::Streaming);
            for row in rows {
                if run.append_row(row) == RowOutcome::CapReached {
                    run.mark_incomplete();
                    break;
                }
            }
            run.finalize();
        }
        Err(err) if is_multi_statement_rejection(&err) => {
            debug!(%err, "cursor refused the query text, retrying without the row cap");
            match session.query_all(sql).await {
                Ok(result) => run.deliver(None, Some(result)),
                Err(err) => run.deliver(Some(err), None),
            };
        }
        Err(err) => {
            run.record_error(err);
            run.finalize();
        }
    }

    close_quietly(spec.backend, session.teardown()).await;
    run.close();
}

/// Whether a cursor read failed because the text holds more than one statement.
pub fn is_multi_statement_rejection(err: &DbcapError) -> bool {
    match err {
        DbcapError::Query { code, message } => {
            code.as_deref() == Some(SYNTAX_ERROR) && message.contains("multiple commands")
        }
        _ => false,
    }
}

pub struct PostgresConnector;

impl Connector for PostgresConnector {
    type Session = PostgresSession;

    async fn connect(&self, spec: &ConnectionSpec) -> Result<PostgresSession, DbcapError> {
        let conn = PgConnection::connect_with(&connect_options(spec))
            .await
            .map_err(|e| DbcapError::Connection {
                message: format!("postgres connection failed: {}", e),
            })?;
        Ok(PostgresSession {
            conn,
            tail_unread: false,
        })
    }
}

pub fn connect_options(spec: &ConnectionSpec) -> PgConnectOptions {
    let mut opts = PgConnectOptions::new()
        .host(&spec.host)
        .port(spec.port_or_default())
        .username(&spec.username)
        .password(spec.password.expose_secret())
        .ssl_mode(ssl_mode(spec.tls))
        .log_statements(log::LevelFilter::Debug)
        .log_slow_statements(log::LevelFilter::Warn, Duration::from_secs(1));
    if let Some(ref db) = spec.database {
        opts = opts.database(db);
    }
    opts
}

/// `tls = false` means a plain connection, never an opportunistic upgrade.
fn ssl_mode(tls: bool) -> PgSslMode {
    if tls {
        PgSslMode::Require
    } else {
        PgSslMode::Disable
    }
}

pub struct PostgresSession {
    conn: PgConnection,
    /// A read stopped before the portal was exhausted.
    tail_unread: bool,
}

impl CursorSession for PostgresSession {
    async fn read(&mut self, sql: &str, count: usize) -> Result<Vec<Row>, DbcapError> {
        let mut rows = Vec::new();
        {
            let mut stream = sqlx::query(sql).persistent(false).fetch(&mut self.conn);
            while rows.len() < count {
                match stream.try_next().await.map_err(query_error)? {
                    Some(row) => rows.push(to_row(&row)),
                    None => break,
                }
            }
        }
        self.tail_unread = rows.len() == count;
        Ok(rows)
    }

    async fn query_all(&mut self, sql: &str) -> Result<QueryResult, DbcapError> {
        self.tail_unread = false;
        // Row counts of non-SELECT statements are interleaved with the rows.
        let pg_rows: Vec<PgRow> = sqlx::raw_sql(sql)
            .fetch_many(&mut self.conn)
            .try_filter_map(|step| async move { Ok(step.right()) })
            .try_collect()
            .await
            .map_err(query_error)?;
        Ok(QueryResult {
            fields: pg_rows.first().map(columns),
            rows: pg_rows.iter().map(to_row).collect(),
            incomplete: false,
        })
    }

    async fn teardown(self) -> Result<(), DbcapError> {
        let closed = if self.tail_unread {
            // Rest of the portal is still streaming in; drop the socket instead.
            self.conn.close_hard().await
        } else {
            self.conn.close().await
        };
        closed.map_err(|e| DbcapError::Connection {
            message: format!("error closing postgres cursor: {}", e),
        })
    }
}

fn query_error(err: sqlx::Error) -> DbcapError {
    match err.as_database_error() {
        Some(db) => DbcapError::Query {
            code: db.code().map(|c| c.into_owned()),
            message: db.message().to_string(),
        },
        None => DbcapError::query(err.to_string()),
    }
}

fn columns(row: &PgRow) -> Vec<ColumnMeta> {
    row.columns()
        .iter()
        .map(|c| ColumnMeta {
            name: c.name().to_string(),
            type_name: c.type_info().name().to_string(),
        })
        .collect()
}

fn to_row(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .map(|c| {
            let value = cell(row, c.ordinal(), c.type_info().name());
            (c.name().to_string(), value)
        })
        .collect()
}

fn cell(row: &PgRow, idx: usize, type_name: &str) -> Value {
    let raw = match row.try_get_raw(idx) {
        Ok(raw) => raw,
        Err(_) => return Value::Null,
    };
    if raw.is_null() {
        return Value::Null;
    }
    let format = raw.format();
    if let Some(value) = typed(row, idx, type_name) {
        return value;
    }
    // Enums, domains, geometry and the like: keep what the server sent.
    match raw.as_bytes() {
        Ok(bytes) => raw_value(format, bytes),
        Err(_) => Value::Null,
    }
}

/// Decode by type name. `None` when the type is not mapped or the decode failed.
fn typed(row: &PgRow, idx: usize, type_name: &str) -> Option<Value> {
    match type_name {
        "BOOL" => scalar(row, idx, Value::Bool),
        "INT2" => scalar(row, idx, |v: i16| Value::from(v)),
        "INT4" => scalar(row, idx, |v: i32| Value::from(v)),
        "INT8" => scalar(row, idx, |v: i64| Value::from(v)),
        "OID" => scalar(row, idx, |v: Oid| Value::from(v.0)),
        "FLOAT4" => scalar(row, idx, |v: f32| float_value(f64::from(v))),
        "FLOAT8" => scalar(row, idx, float_value),
        "NUMERIC" => scalar(row, idx, |v: Decimal| Value::String(v.to_string())),
        "JSON" | "JSONB" => scalar(row, idx, |v: Value| v),
        "UUID" => scalar(row, idx, |v: Uuid| Value::String(v.to_string())),
        "DATE" => scalar(row, idx, |v: NaiveDate| Value::String(v.to_string())),
        "TIME" => scalar(row, idx, |v: NaiveTime| Value::String(v.to_string())),
        "TIMETZ" => scalar(row, idx, |v: PgTimeTz<NaiveTime, FixedOffset>| {
            Value::String(format!("{}{}", v.time, v.offset))
        }),
        "TIMESTAMP" => scalar(row, idx, |v: NaiveDateTime| {
            Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
        }),
        "TIMESTAMPTZ" => scalar(row, idx, |v: DateTime<Utc>| Value::String(v.to_rfc3339())),
        "INTERVAL" => scalar(row, idx, |v: PgInterval| Value::String(interval_text(&v))),
        "BYTEA" => scalar(row, idx, |v: Vec<u8>| Value::String(bytea_text(&v))),
        "TEXT" | "VARCHAR" | "CHAR" | "NAME" | "UNKNOWN" => scalar(row, idx, Value::String),
        "BOOL[]" => array(row, idx, Value::Bool),
        "INT2[]" => array(row, idx, |v: i16| Value::from(v)),
        "INT4[]" => array(row, idx, |v: i32| Value::from(v)),
        "INT8[]" => array(row, idx, |v: i64| Value::from(v)),
        "FLOAT4[]" => array(row, idx, |v: f32| float_value(f64::from(v))),
        "FLOAT8[]" => array(row, idx, float_value),
        "NUMERIC[]" => array(row, idx, |v: Decimal| Value::String(v.to_string())),
        "UUID[]" => array(row, idx, |v: Uuid| Value::String(v.to_string())),
        "TEXT[]" | "VARCHAR[]" | "CHAR[]" | "NAME[]" => array(row, idx, Value::String),
        _ => None,
    }
}

fn scalar<T>(row: &PgRow, idx: usize, to_value: impl FnOnce(T) -> Value) -> Option<Value>
where
    T: for<'r> Decode<'r, Postgres> + Type<Postgres>,
{
    row.try_get::<T, _>(idx).ok().map(to_value)
}

/// One-dimensional arrays; NULL elements stay `null`.
fn array<T>(row: &PgRow, idx: usize, to_value: impl Fn(T) -> Value) -> Option<Value>
where
    Vec<Option<T>>: for<'r> Decode<'r, Postgres> + Type<Postgres>,
{
    let items = row.try_get::<Vec<Option<T>>, _>(idx).ok()?;
    Some(Value::Array(
        items
            .into_iter()
            .map(|item| item.map_or(Value::Null, &to_value))
            .collect(),
    ))
}

/// NaN and the infinities have no JSON number, so they become text.
fn float_value(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(v.to_string()))
}

/// `bytea` in the server's default `hex` output format.
fn bytea_text(bytes: &[u8]) -> String {
    format!("\\x{}", hex::encode(bytes))
}

/// A value no decoder claimed. Text results are passed through. Binary results
/// that read as plain text (enum labels, for one) are kept as text, anything
/// else is rendered like `bytea`.
fn raw_value(format: PgValueFormat, bytes: &[u8]) -> Value {
    match (format, std::str::from_utf8(bytes)) {
        (PgValueFormat::Text, Ok(text)) => Value::String(text.to_string()),
        (PgValueFormat::Binary, Ok(text)) if !text.chars().any(char::is_control) => {
            Value::String(text.to_string())
        }
        _ => Value::String(bytea_text(bytes)),
    }
}

/// Interval in the server's default `postgres` style, e.g.
/// `1 year 2 mons 3 days 04:05:06` or `-1 days +02:00:00`.
fn interval_text(interval: &PgInterval) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut after_negative = false;
    for (value, unit) in [
        (interval.months / 12, "year"),
        (interval.months % 12, "mon"),
        (interval.days, "day"),
    ] {
        if value == 0 {
            continue;
        }
        let sign = if after_negative && value > 0 { "+" } else { "" };
        let plural = if value == 1 { "" } else { "s" };
        parts.push(format!("{sign}{value} {unit}{plural}"));
        after_negative = value < 0;
    }

    let micros = interval.microseconds;
    if micros != 0 || parts.is_empty() {
        let sign = if micros < 0 {
            "-"
        } else if after_negative {
            "+"
        } else {
            ""
        };
        let abs = micros.unsigned_abs();
        let secs = abs / 1_000_000;
        let mut time = format!(
            "{sign}{:02}:{:02}:{:02}",
            secs / 3600,
            secs / 60 % 60,
            secs % 60
        );
        let frac = abs % 1_000_000;
        if frac != 0 {
            time.push('.');
            time.push_str(format!("{frac:06}").trim_end_matches('0'));
        }
        parts.push(time);
    }
    parts.join(" ")
}
