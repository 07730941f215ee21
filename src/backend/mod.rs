#[cfg(feature = "odbc")]
pub mod connstr;
pub mod hana;
pub mod mysql;
#[cfg(feature = "odbc")]
pub mod odbc;
pub mod postgres;
pub mod run;
pub mod sqlserver;
pub mod vertica;

use crate::config::{BackendKind, ConnectionSpec};
use crate::error::DbcapError;
use serde::Serialize;
use std::future::Future;
use std::time::Instant;
use tracing::{debug, info};

pub use run::{Phase, QueryRun, RowOutcome};

/// One result row, keyed by column name in backend delivery order.
///
/// Values are whatever the backend session decoded; there is no common type model.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Metadata for a single result column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnMeta {
    pub name: String,
    pub type_name: String,
}

/// The rows collected for one query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<ColumnMeta>>,
    pub incomplete: bool,
}

/// What the completion handler receives, exactly once per query.
///
/// `result` may be present alongside `error` when rows were collected before
/// the backend failed.
#[derive(Debug)]
pub struct Outcome {
    pub error: Option<DbcapError>,
    pub result: Option<QueryResult>,
}

impl Outcome {
    /// Collapse into a `Result`, dropping any partial rows that came with an error.
    pub fn into_result(self) -> Result<QueryResult, DbcapError> {
        match (self.error, self.result) {
            (Some(err), _) => Err(err),
            (None, Some(result)) => Ok(result),
            (None, None) => Ok(QueryResult::default()),
        }
    }
}

/// Something a push-style session delivers while a query runs.
#[derive(Debug)]
pub enum SessionEvent {
    /// Shape of the recordset that the following rows belong to.
    Fields(Vec<ColumnMeta>),
    Row(Row),
    Error(DbcapError),
    /// No more events will follow for this query.
    End,
}

/// Opens a backend-native session.
pub trait Connector: Send + Sync {
    type Session: Send;

    fn connect(
        &self,
        spec: &ConnectionSpec,
    ) -> impl Future<Output = Result<Self::Session, DbcapError>> + Send;
}

/// A session whose backend pushes row events as the query runs.
pub trait EventSession: Send {
    /// Issue the query. Its events are then read with [`EventSession::next_event`].
    fn query(&mut self, sql: &str) -> impl Future<Output = Result<(), DbcapError>> + Send;

    /// Next event, or `None` once the backend has nothing more to deliver.
    fn next_event(&mut self) -> impl Future<Output = Option<SessionEvent>> + Send;

    /// Ask the backend to stop producing rows. Events may still arrive afterwards.
    fn stop(&mut self);

    /// Close the backend connection.
    fn teardown(self) -> impl Future<Output = Result<(), DbcapError>> + Send;
}

/// A session that hands out rows on demand through a cursor.
pub trait CursorSession: Send {
    /// Run `sql` and read at most `count` rows from it.
    fn read(
        &mut self,
        sql: &str,
        count: usize,
    ) -> impl Future<Output = Result<Vec<Row>, DbcapError>> + Send;

    /// Run `sql` without a cursor and return every row it produces.
    fn query_all(
        &mut self,
        sql: &str,
    ) -> impl Future<Output = Result<QueryResult, DbcapError>> + Send;

    fn teardown(self) -> impl Future<Output = Result<(), DbcapError>> + Send;
}

/// Run `sql` on the backend named by `spec` and hand the outcome to `on_done`.
///
/// `on_done` fires exactly once, possibly before this future completes (the
/// row cap delivers early while the session is still being torn down).
pub async fn execute<F>(sql: &str, spec: &ConnectionSpec, on_done: F)
where
    F: FnOnce(Outcome) + Send + 'static,
{
    let backend = spec.backend;
    info!(%backend, target = %spec.describe(), "executing query");

    let started = Instant::now();
    let on_done = move |outcome: Outcome| {
        debug!(
            %backend,
            elapsed_ms = started.elapsed().as_millis() as u64,
            rows = outcome.result.as_ref().map_or(0, |r| r.rows.len()),
            incomplete = outcome.result.as_ref().is_some_and(|r| r.incomplete),
            failed = outcome.error.is_some(),
            "query complete"
        );
        on_done(outcome);
    };

    match backend {
        BackendKind::MySql => mysql::run(&mysql::MySqlConnector, sql, spec, on_done).await,
        BackendKind::Postgres => {
            postgres::run(&postgres::PostgresConnector, sql, spec, on_done).await
        }
        #[cfg(feature = "odbc")]
        BackendKind::SqlServer => {
            sqlserver::run(&sqlserver::SqlServerConnector, sql, spec, on_done).await
        }
        #[cfg(feature = "odbc")]
        BackendKind::Vertica => vertica::run(&vertica::VerticaConnector, sql, spec, on_done).await,
        #[cfg(feature = "odbc")]
        BackendKind::Hana => hana::run(&hana::HanaConnector, sql, spec, on_done).await,
        #[cfg(not(feature = "odbc"))]
        BackendKind::SqlServer | BackendKind::Vertica | BackendKind::Hana => {
            QueryRun::new(spec.max_rows, on_done).fail(DbcapError::Config {
                message: format!("{} backend requires the `odbc` feature", backend),
            });
        }
    }
}

/// [`execute`] for callers that prefer awaiting the outcome.
pub async fn run_query(sql: &str, spec: &ConnectionSpec) -> Outcome {
    let (tx, rx) = tokio::sync::oneshot::channel();
    execute(sql, spec, move |outcome| {
        let _ = tx.send(outcome);
    })
    .await;

    rx.await.unwrap_or_else(|_| Outcome {
        error: Some(DbcapError::Internal {
            message: "query finished without an outcome".to_string(),
        }),
        result: None,
    })
}

/// Tear a session down, logging instead of surfacing a failure: by now the
/// outcome has been (or is about to be) delivered.
pub(crate) async fn close_quietly<F>(backend: BackendKind, teardown: F)
where
    F: Future<Output = Result<(), DbcapError>>,
{
    if let Err(err) = teardown.await {
        tracing::warn!(%backend, %err, "error closing session");
    }
}
