//! Vertica through its ODBC driver.
//!
//! The first terminal event (cap reached, end of stream, or an error) ends the
//! query: the connection is closed first and the outcome delivered after.
//! Recordset metadata is not part of the result.

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
pub const DEFAULT_DRIVER: &str = "Vertica";

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
            while let Some(event) = session.next_event().await {
                match event {
                    SessionEvent::Fields(_) => {}
                    SessionEvent::Row(row) => {
                        if run.append_row(row) == RowOutcome::CapReached {
                            run.mark_incomplete();
                            info!(
                                max_rows = run.max_rows(),
                                "vertica row limit hit, disconnecting"
                            );
                            break;
                        }
                    }
                    SessionEvent::Error(err) => {
                        warn!(%err, "vertica query error");
                        run.record_error(err);
                        break;
                    }
                    SessionEvent::End => break,
                }
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
    conn.push("Servername", &spec.host)
        .push("Port", &spec.port_or_default().to_string())
        .push_opt("Database", spec.database.as_deref())
        .push("UID", &spec.username)
        .push_secret("PWD", &spec.password);
    if spec.tls {
        conn.push("SSLMode", "require");
    }
    conn
}

#[cfg(feature = "odbc")]
pub struct VerticaConnector;

#[cfg(feature = "odbc")]
impl Connector for VerticaConnector {
    type Session = super::odbc::OdbcSession;

    async fn connect(&self, spec: &ConnectionSpec) -> Result<Self::Session, DbcapError> {
        super::odbc::OdbcSession::open(connection_string(spec), None).await
    }
}
