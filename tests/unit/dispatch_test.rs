mod support;

use dbcap::{execute, run_query, BackendKind, DbcapError};
use rstest::rstest;
use std::time::Duration;
use support::{spec, Recorder};

/// Nothing listens on port 1, so the connect fails fast.
fn unreachable(backend: BackendKind) -> dbcap::ConnectionSpec {
    let mut spec = spec(backend, 10);
    spec.host = "127.0.0.1".to_string();
    spec.port = Some(1);
    spec
}

#[rstest]
#[case::mysql(BackendKind::MySql)]
#[case::postgres(BackendKind::Postgres)]
#[tokio::test]
async fn test_connect_failure_is_single_outcome(#[case] backend: BackendKind) {
    let rec = Recorder::new();

    tokio::time::timeout(
        Duration::from_secs(30),
        execute("SELECT 1", &unreachable(backend), rec.callback()),
    )
    .await
    .expect("connect attempt should fail promptly");

    let outcome = rec.single();
    assert!(matches!(outcome.error, Some(DbcapError::Connection { .. })));
    assert!(outcome.result.is_none());
}

#[tokio::test]
async fn test_run_query_returns_outcome() {
    let outcome = run_query("SELECT 1", &unreachable(BackendKind::Postgres)).await;

    let err = outcome.into_result().unwrap_err();
    assert!(err.is_connection());
    assert!(err.to_string().starts_with("connection: postgres connection failed"));
}

#[cfg(not(feature = "odbc"))]
#[rstest]
#[case::sqlserver(BackendKind::SqlServer)]
#[case::vertica(BackendKind::Vertica)]
#[case::hana(BackendKind::Hana)]
#[tokio::test]
async fn test_odbc_backends_need_feature(#[case] backend: BackendKind) {
    let rec = Recorder::new();

    execute("SELECT 1", &unreachable(backend), rec.callback()).await;

    let outcome = rec.single();
    assert!(matches!(outcome.error, Some(DbcapError::Config { .. })));
}
