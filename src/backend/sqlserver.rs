//! SQL Server through the Microsoft ODBC driver.
//!
//! Hitting the cap delivers the outcome right away and cancels the request.
//! The cancel is acknowledged with a [`DbcapError::Canceled`] error, which is
//! swallowed while the remaining events drain.

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
pub const DEFAULT_DRIVER: &str = "ODBC Driver 18 for SQL Server";
/// Requests running longer than an hour fail with a timeout error.
pub const REQUEST_TIMEOUT_SECS: usize = 3600;

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
    match session.query(sql).await {
        Err(err) => run.record_error(err),
        Ok(()) => {
            run.advance(Phase::Streaming);
            let mut canceled = false;
            while let Some(event) = session.next_event().await {
                match event {
                    SessionEvent::Fields(fields) => run.set_fields(fields),
                    SessionEvent::Row(row) => {
                        if run.append_row(row) == RowOutcome::CapReached && !canceled {
                            canceled = true;
                            run.mark_incomplete();
                            run.finalize();
                            info!(
                                max_rows = run.max_rows(),
                                "sqlserver row limit hit, canceling request"
                            );
                            session.stop();
                        }
                    }
                    SessionEvent::Error(err) if canceled && err.is_cancel_ack() => {
                        info!("sqlserver cancel acknowledged");
                    }
                    SessionEvent::Error(err) => {
                        warn!(%err, "sqlserver query error");
                        run.record_error(err);
                    }
                    SessionEvent::End => break,
                }
            }
        }
    }

    run.finalize();
    close_quietly(spec.backend, session.teardown()).await;
    run.close();
}

#[cfg(feature = "odbc")]
pub fn connection_string(spec: &ConnectionSpec) -> ConnectionString {
    let driver = spec.odbc_driver.as_deref().unwrap_or(DEFAULT_DRIVER);
    let mut conn = ConnectionString::with_driver(driver);
    conn.push(
        "Server",
        &format!("{},{}", spec.host, spec.port_or_default()),
    )
    .push_opt("Database", spec.database.as_deref())
    .push("UID", &spec.username)
    .push_secret("PWD", &spec.password)
    .push("Encrypt", if spec.tls { "yes" } else { "no" });
    if spec.trust_server_certificate {
        conn.push("TrustServerCertificate", "yes");
    }
    conn
}

#[cfg(feature = "odbc")]
pub struct SqlServerConnector;

#[cfg(feature = "odbc")]
impl Connector for SqlServerConnector {
    type Session = super::odbc::OdbcSession;

    async fn connect(&self, spec: &ConnectionSpec) -> Result<Self::Session, DbcapError> {
        super::odbc::OdbcSession::open(connection_string(spec), Some(REQUEST_TIMEOUT_SECS)).await
    }
}
