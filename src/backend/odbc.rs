//! Event session over an ODBC connection, shared by the SQL Server, Vertica
//! and HANA adapters.
//!
//! odbc-api handles are blocking and tied to their environment, so the
//! connection lives on a `spawn_blocking` worker that streams the query's
//! result sets back as [`SessionEvent`]s.

use crate::backend::connstr::ConnectionString;
use crate::backend::{ColumnMeta, EventSession, Row, SessionEvent};
use crate::error::DbcapError;
use odbc_api::buffers::TextRowSet;
use odbc_api::handles::{AsStatementRef, Statement, StatementRef};
use odbc_api::{
    ColumnDescription, Connection, ConnectionOptions, Cursor, CursorImpl, Environment,
    ResultSetMetadata,
};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const LOGIN_TIMEOUT_SECS: u32 = 30;
const BATCH_SIZE: usize = 500;
/// Longest text value fetched per cell; longer values are truncated by the driver.
const MAX_STR_LEN: usize = 4096;
const EVENT_BUFFER: usize = 256;

pub struct OdbcSession {
    sql: Option<oneshot::Sender<String>>,
    events: mpsc::Receiver<SessionEvent>,
    stop: CancellationToken,
    worker: JoinHandle<()>,
}

impl OdbcSession {
    /// Connect on a blocking worker and wait until the login has gone through.
    pub async fn open(
        conn_str: ConnectionString,
        query_timeout_secs: Option<usize>,
    ) -> Result<Self, DbcapError> {
        debug!(connection = %conn_str.masked(), "opening odbc connection");

        let (ready_tx, ready_rx) = oneshot::channel();
        let (sql_tx, sql_rx) = oneshot::channel();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let stop = CancellationToken::new();

        let secret = conn_str.as_secret();
        let worker = tokio::task::spawn_blocking({
            let stop = stop.clone();
            move || {
                work(Job {
                    conn_str: secret,
                    query_timeout_secs,
                    ready: ready_tx,
                    sql: sql_rx,
                    events: events_tx,
                    stop,
                })
            }
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self {
                sql: Some(sql_tx),
                events: events_rx,
                stop,
                worker,
            }),
            Ok(Err(err)) => {
                let _ = worker.await;
                Err(err)
            }
            Err(_) => Err(DbcapError::Connection {
                message: "odbc worker exited before connecting".to_string(),
            }),
        }
    }
}

impl EventSession for OdbcSession {
    async fn query(&mut self, sql: &str) -> Result<(), DbcapError> {
        let sender = self.sql.take().ok_or_else(|| DbcapError::Internal {
            message: "odbc session already ran a query".to_string(),
        })?;
        sender
            .send(sql.to_string())
            .map_err(|_| DbcapError::Connection {
                message: "odbc connection closed before the query was sent".to_string(),
            })
    }

    async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    fn stop(&mut self) {
        self.stop.cancel();
    }

    async fn teardown(self) -> Result<(), DbcapError> {
        let Self {
            sql,
            events,
            stop,
            worker,
        } = self;
        stop.cancel();
        drop(events);
        drop(sql);
        // The worker drops the connection, which disconnects.
        worker.await.map_err(|e| DbcapError::Internal {
            message: format!("odbc worker failed: {}", e),
        })
    }
}

struct Job {
    conn_str: String,
    query_timeout_secs: Option<usize>,
    ready: oneshot::Sender<Result<(), DbcapError>>,
    sql: oneshot::Receiver<String>,
    events: mpsc::Sender<SessionEvent>,
    stop: CancellationToken,
}

fn work(job: Job) {
    let env = match Environment::new() {
        Ok(env) => env,
        Err(e) => {
            let _ = job.ready.send(Err(DbcapError::Connection {
                message: format!("ODBC environment error: {}", e),
            }));
            return;
        }
    };

    let conn = match env.connect_with_connection_string(
        &job.conn_str,
        ConnectionOptions {
            login_timeout_sec: Some(LOGIN_TIMEOUT_SECS),
            ..Default::default()
        },
    ) {
        Ok(conn) => conn,
        Err(e) => {
            let _ = job.ready.send(Err(DbcapError::Connection {
                message: format!("connection failed: {}", e),
            }));
            return;
        }
    };

    if job.ready.send(Ok(())).is_err() {
        return;
    }
    // Sender dropped: torn down without a query.
    let Ok(sql) = job.sql.blocking_recv() else {
        return;
    };

    let streamer = Streamer {
        events: &job.events,
        stop: &job.stop,
    };
    if let Err(err) = streamer.run(&conn, &sql, job.query_timeout_secs) {
        let _ = job.events.blocking_send(SessionEvent::Error(err));
    }
    let _ = job.events.blocking_send(SessionEvent::End);
}

struct Streamer<'a> {
    events: &'a mpsc::Sender<SessionEvent>,
    stop: &'a CancellationToken,
}

impl Streamer<'_> {
    fn run(
        &self,
        conn: &Connection<'_>,
        sql: &str,
        query_timeout_secs: Option<usize>,
    ) -> Result<(), DbcapError> {
        let mut statement = conn.preallocate().map_err(odbc_error)?;
        if let Some(secs) = query_timeout_secs {
            statement.set_query_timeout_sec(secs).map_err(odbc_error)?;
        }
        // `None` only means the first result has no columns (a row count);
        // later results of the batch are still on the statement.
        let _ = statement
            .execute(sql, ())
            .map_err(odbc_error)?
            .map(CursorImpl::into_stmt);

        let mut stmt = statement.as_stmt_ref();
        if !seek_result_set(&mut stmt)? {
            return Ok(());
        }
        // SAFETY: the statement is positioned on a result set with columns.
        let mut cursor = unsafe { CursorImpl::new(stmt) };

        loop {
            let fields = describe(&mut cursor)?;
            if !fields.is_empty() {
                let names: Vec<String> = fields.iter().map(|f| f.name.clone()).collect();
                self.send(SessionEvent::Fields(fields))?;

                let buffer = TextRowSet::for_cursor(BATCH_SIZE, &mut cursor, Some(MAX_STR_LEN))
                    .map_err(odbc_error)?;
                let mut block = cursor.bind_buffer(buffer).map_err(odbc_error)?;
                while let Some(batch) = block.fetch().map_err(odbc_error)? {
                    for row_idx in 0..batch.num_rows() {
                        if self.stop.is_cancelled() {
                            return Err(DbcapError::Canceled);
                        }
                        let row: Row = names
                            .iter()
                            .enumerate()
                            .map(|(col_idx, name)| {
                                let value = match batch.at(col_idx, row_idx) {
                                    Some(bytes) => {
                                        Value::String(String::from_utf8_lossy(bytes).into_owned())
                                    }
                                    None => Value::Null,
                                };
                                (name.clone(), value)
                            })
                            .collect();
                        self.send(SessionEvent::Row(row))?;
                    }
                }
                let (unbound, _) = block.unbind().map_err(odbc_error)?;
                cursor = unbound;
            }

            match cursor.more_results().map_err(odbc_error)? {
                Some(next) => cursor = next,
                None => return Ok(()),
            }
        }
    }

    fn send(&self, event: SessionEvent) -> Result<(), DbcapError> {
        // The receiver only goes away during teardown.
        self.events
            .blocking_send(event)
            .map_err(|_| DbcapError::Canceled)
    }
}

/// The results a statement produced, stepped through in order.
trait ResultSets {
    fn column_count(&mut self) -> Result<i16, DbcapError>;

    /// Move to the next result; `false` once none are left.
    fn advance(&mut self) -> Result<bool, DbcapError>;
}

impl ResultSets for StatementRef<'_> {
    fn column_count(&mut self) -> Result<i16, DbcapError> {
        self.num_result_cols()
            .into_result(&*self)
            .map_err(odbc_error)
    }

    fn advance(&mut self) -> Result<bool, DbcapError> {
        // SAFETY: no buffers are bound while results without columns are skipped.
        unsafe { self.more_results() }
            .into_result_bool(&*self)
            .map_err(odbc_error)
    }
}

/// Skip results without columns, such as the row counts of `INSERT` or
/// `UPDATE`. Returns whether a result set with columns is now current.
fn seek_result_set(results: &mut impl ResultSets) -> Result<bool, DbcapError> {
    loop {
        if results.column_count()? > 0 {
            return Ok(true);
        }
        if !results.advance()? {
            return Ok(false);
        }
    }
}

fn describe(cursor: &mut impl ResultSetMetadata) -> Result<Vec<ColumnMeta>, DbcapError> {
    let num_cols = cursor.num_result_cols().map_err(odbc_error)?;
    let mut columns = Vec::with_capacity(num_cols.max(0) as usize);
    for i in 1..=num_cols as u16 {
        let mut col_desc = ColumnDescription::default();
        cursor.describe_col(i, &mut col_desc).map_err(odbc_error)?;
        let name = col_desc.name_to_string().map_err(|e| DbcapError::Query {
            code: None,
            message: format!("failed to decode column name {}: {}", i, e),
        })?;
        columns.push(ColumnMeta {
            name,
            type_name: format!("{:?}", col_desc.data_type),
        });
    }
    Ok(columns)
}

/// Map a driver error, keeping the SQLSTATE from its diagnostic record.
pub(crate) fn odbc_error(err: odbc_api::Error) -> DbcapError {
    match &err {
        odbc_api::Error::Diagnostics { record, .. } => DbcapError::Query {
            code: Some(record.state.as_str().to_string()),
            message: err.to_string(),
        },
        _ => DbcapError::query(err.to_string()),
    }
}
