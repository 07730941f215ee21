//! SAP HANA through the HDBODBC driver.
//!
//! Rows are collected until the stream ends, fails, or passes the cap; the
//! connection is closed before the outcome goes out, and a failure is
//! delivered together with whatever rows arrived before it.

#[cfg(feature = "odbc")]
use crate::backend::connstr::ConnectionString;
use crate::backend::{
    close_quietly, Connector, EventSession, Outcome, Phase, QueryRun, RowOutcome, SessionEvent,
};
use crate::config::ConnectionSpec;
#[cfg(feature = "odbc")]
use crate::error::DbcapError;
use tracing::{info, warn};

#[cfg(feature = "odbc")]
pub const DEFAULT_DRIVER: &str = "HDBODBC";

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
                        run.mark_incomplete();
                        info!(max_rows = run.max_rows(), "hana row limit hit, disconnecting");
                        break;
                    }
                }
                SessionEvent::Error(err) => {
                    warn!(%err, "hana query error");
                    run.record_error(err);
                    break;
                }
                SessionEvent::End => break,
            }
        }
    }

    close_quietly(spec.backend, session.teardown()).await;
    run.finalize();
    run.close();
}

#[cfg(feature = "odbc")]
pub fn connection_string(spec: &ConnectionSpec) -> ConnectionString {
    let driver = spec.odbc_driver.as_deref().unwrap_or(DEFAULT_DRIVER);
    let mut conn = ConnectionString::with_driver(driver);
    conn.push(
        "ServerNode",
        &format!("{}:{}", spec.host, spec.port_or_default()),
    )
    .push_opt("DatabaseName", spec.database.as_deref())
    .push("UID", &spec.username)
    .push_secret("PWD", &spec.password)
    .push_opt("CurrentSchema", spec.schema.as_deref());
    if spec.tls {
        conn.push("encrypt", "TRUE");
    }
    conn
}

/// SQL listing every table column, optionally restricted to one schema,
/// in column position order.
pub fn schema_sql(schema: Option<&str>) -> String {
    let where_sql = match schema.filter(|s| !s.is_empty()) {
        Some(schema) => format!(
            "WHERE tables.SCHEMA_NAME = '{}'\n",
            schema.replace('\'', "''")
        ),
        None => String::new(),
    };
    format!(
        "SELECT\n  \
           columns.SCHEMA_NAME AS table_schema,\n  \
           columns.TABLE_NAME AS table_name,\n  \
           columns.COLUMN_NAME AS column_name,\n  \
           columns.DATA_TYPE_NAME AS data_type\n\
         FROM SYS.TABLES tables\n\
         JOIN SYS.COLUMNS columns\n  \
           ON tables.SCHEMA_NAME = columns.SCHEMA_NAME\n  \
           AND tables.TABLE_NAME = columns.TABLE_NAME\n\
         {where_sql}\
         ORDER BY columns.POSITION"
    )
}

#[cfg(feature = "odbc")]
pub struct HanaConnector;

#[cfg(feature = "odbc")]
impl Connector for HanaConnector {
    type Session = super::odbc::OdbcSession;

    async fn connect(&self, spec: &ConnectionSpec) -> Result<Self::Session, DbcapError> {
        super::odbc::OdbcSession::open(connection_string(spec), None).await
    }
}
