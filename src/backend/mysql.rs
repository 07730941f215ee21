//! MySQL: the server pushes rows as they are produced.
//!
//! A running result cannot be abandoned on its own; once the cap is hit the
//! session stops reading and the whole connection is dropped.

use crate::backend::{
    close_quietly, ColumnMeta, Connector, EventSession, Outcome, Phase, QueryRun, Row,
    RowOutcome, SessionEvent,
};
use crate::config::ConnectionSpec;
use crate::error::DbcapError;
use futures_util::StreamExt;
use secrecy::ExposeSecret;
use serde_json::Value;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow, MySqlSslMode};
use sqlx::{Column, ConnectOptions, Connection, Either, Row as _, TypeInfo};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Rows buffered between the socket reader and the adapter. A full buffer
/// pauses reading.
const EVENT_BUFFER: usize = 256;

/// Drive one MySQL query through `connector`.
pub async fn run<C>(
    connector: &C,
    sql: &str,
    spec: &ConnectionSpec,
    on_done: impl FnOnce(Outcome) + Send + 'static,
) where
    C: Connector,
    C::Session: EventSession,
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
    if let Err(err) = session.query(sql).await {
        run.record_error(err);
    } else {
        run.advance(Phase::Streaming);
        while let Some(event) = session.next_event().await {
            match event {
                SessionEvent::Fields(fields) => run.set_fields(fields),
                SessionEvent::Row(row) => {
                    if run.append_row(row) == RowOutcome::CapReached {
                        // No end event follows a paused stream, so deliver now.
                        session.stop();
                        run.mark_incomplete();
                        info!(max_rows = run.max_rows(), "mysql row limit hit, closing connection");
                        break;
                    }
                }
                // An end event always follows an error.
                SessionEvent::Error(err) => {
                    warn!(%err, "mysql query error");
                    run.record_error(err);
                }
                SessionEvent::End => break,
            }
        }
    }

    run.finalize();
    close_quietly(spec.backend, session.teardown()).await;
    run.close();
}

pub struct MySqlConnector;

impl Connector for MySqlConnector {
    type Session = MySqlSession;

    async fn connect(&self, spec: &ConnectionSpec) -> Result<MySqlSession, DbcapError> {
        let conn = MySqlConnection::connect_with(&connect_options(spec))
            .await
            .map_err(|e| DbcapError::Connection {
                message: format!("mysql connection failed: {}", e),
            })?;
        Ok(MySqlSession::new(conn))
    }
}

pub fn connect_options(spec: &ConnectionSpec) -> MySqlConnectOptions {
    let mut opts = MySqlConnectOptions::new()
        .host(&spec.host)
        .port(spec.port_or_default())
        .username(&spec.username)
        .password(spec.password.expose_secret())
        .ssl_mode(ssl_mode(spec.tls))
        .enable_cleartext_plugin(spec.insecure_auth)
        .log_statements(log::LevelFilter::Debug)
        .log_slow_statements(log::LevelFilter::Warn, Duration::from_secs(1));
    if let Some(ref db) = spec.database {
        opts = opts.database(db);
    }
    opts
}

/// `tls = false` means a plain connection, never an opportunistic upgrade.
fn ssl_mode(tls: bool) -> MySqlSslMode {
    if tls {
        MySqlSslMode::Required
    } else {
        MySqlSslMode::Disabled
    }
}

/// What the reader task hands back when it finishes.
struct Pumped {
    conn: MySqlConnection,
    /// The server reported the end of the last result set.
    drained: bool,
}

enum Link {
    Idle(MySqlConnection),
    Running(JoinHandle<Pumped>),
}

pub struct MySqlSession {
    link: Option<Link>,
    events: Option<mpsc::Receiver<SessionEvent>>,
    stop: CancellationToken,
}

impl MySqlSession {
    fn new(conn: MySqlConnection) -> Self {
        Self {
            link: Some(Link::Idle(conn)),
            events: None,
            stop: CancellationToken::new(),
        }
    }
}

impl EventSession for MySqlSession {
    async fn query(&mut self, sql: &str) -> Result<(), DbcapError> {
        let Some(Link::Idle(conn)) = self.link.take() else {
            return Err(DbcapError::Internal {
                message: "mysql session already ran a query".to_string(),
            });
        };
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let handle = tokio::spawn(pump(conn, sql.to_string(), tx, self.stop.clone()));
        self.link = Some(Link::Running(handle));
        self.events = Some(rx);
        Ok(())
    }

    async fn next_event(&mut self) -> Option<SessionEvent> {
        match self.events.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    fn stop(&mut self) {
        self.stop.cancel();
    }

    async fn teardown(self) -> Result<(), DbcapError> {
        let Self { link, events, stop } = self;
        stop.cancel();
        drop(events);

        let closed = match link {
            Some(Link::Idle(conn)) => conn.close().await,
            Some(Link::Running(handle)) => {
                let pumped = handle.await.map_err(|e| DbcapError::Internal {
                    message: format!("mysql reader task failed: {}", e),
                })?;
                if pumped.drained {
                    pumped.conn.close().await
                } else {
                    // Unread rows are still on the wire; skip the graceful quit.
                    pumped.conn.close_hard().await
                }
            }
            None => Ok(()),
        };
        closed.map_err(|e| DbcapError::Connection {
            message: format!("error closing mysql connection: {}", e),
        })
    }
}

/// Read every result set of `sql`, forwarding them as events until the
/// server is done or `stop` fires.
async fn pump(
    mut conn: MySqlConnection,
    sql: String,
    events: mpsc::Sender<SessionEvent>,
    stop: CancellationToken,
) -> Pumped {
    let drained = {
        let mut stream = sqlx::raw_sql(&sql).fetch_many(&mut conn);
        let mut announced = false;
        loop {
            let item = tokio::select! {
                biased;
                () = stop.cancelled() => break false,
                item = stream.next() => item,
            };
            let event = match item {
                Some(Ok(Either::Left(_))) => {
                    // Result set finished; the next row starts a new one.
                    announced = false;
                    continue;
                }
                Some(Ok(Either::Right(row))) => {
                    if !announced {
                        announced = true;
                        if events.send(SessionEvent::Fields(columns(&row))).await.is_err() {
                            break false;
                        }
                    }
                    SessionEvent::Row(to_row(&row))
                }
                Some(Err(e)) => SessionEvent::Error(query_error(e)),
                None => break true,
            };
            if events.send(event).await.is_err() {
                break false;
            }
        }
    };
    if drained {
        let _ = events.send(SessionEvent::End).await;
    }
    Pumped { conn, drained }
}

pub(crate) fn query_error(err: sqlx::Error) -> DbcapError {
    match err.as_database_error() {
        Some(db) => DbcapError::Query {
            code: db.code().map(|c| c.into_owned()),
            message: db.message().to_string(),
        },
        None => DbcapError::query(err.to_string()),
    }
}

fn columns(row: &MySqlRow) -> Vec<ColumnMeta> {
    row.columns()
        .iter()
        .map(|c| ColumnMeta {
            name: c.name().to_string(),
            type_name: c.type_info().name().to_string(),
        })
        .collect()
}

fn to_row(row: &MySqlRow) -> Row {
    row.columns()
        .iter()
        .map(|c| {
            let value = cell(row, c.ordinal(), c.type_info().name());
            (c.name().to_string(), value)
        })
        .collect()
}

/// `raw_sql` runs over the text protocol, so every value arrives as its
/// textual rendering and is typed from there.
fn cell(row: &MySqlRow, idx: usize, type_name: &str) -> Value {
    match row.try_get_unchecked::<Option<Vec<u8>>, _>(idx) {
        Ok(Some(bytes)) => text_value(type_name, &bytes),
        _ => Value::Null,
    }
}

fn text_value(type_name: &str, bytes: &[u8]) -> Value {
    let Ok(text) = std::str::from_utf8(bytes) else {
        // Binary strings and blobs, as a hex literal.
        return Value::String(format!("0x{}", hex::encode_upper(bytes)));
    };
    let parsed = match type_name {
        "NULL" => Some(Value::Null),
        "BOOLEAN" => match text {
            "0" => Some(Value::Bool(false)),
            "1" => Some(Value::Bool(true)),
            _ => None,
        },
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
            text.parse::<i64>().ok().map(Value::from)
        }
        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
        | "BIGINT UNSIGNED" => text.parse::<u64>().ok().map(Value::from),
        "FLOAT" | "DOUBLE" => text
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
        "JSON" => serde_json::from_str(text).ok(),
        _ => None,
    };
    parsed.unwrap_or_else(|| Value::String(text.to_string()))
}
