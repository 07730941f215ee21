mod support;

use dbcap::backend::{mysql, SessionEvent};
use dbcap::BackendKind;
use rstest::rstest;
use support::{
    fields, query_error, refused, row, row_events, rows, spec, Recorder, ScriptedConnector,
    ScriptedSession,
};

#[rstest]
#[case::under_cap(3, 5, 3, false)]
#[case::exactly_cap(5, 5, 5, false)]
#[case::over_cap(8, 5, 5, true)]
#[case::empty(0, 5, 0, false)]
#[tokio::test]
async fn test_cap_property(
    #[case] produced: usize,
    #[case] max_rows: usize,
    #[case] expected_rows: usize,
    #[case] incomplete: bool,
) {
    let rec = Recorder::new();
    let mut script = row_events(produced);
    script.push(SessionEvent::End);
    let connector = ScriptedConnector::ok(&rec, ScriptedSession::new(&rec, script));

    mysql::run(&connector, "SELECT 1", &spec(BackendKind::MySql, max_rows), rec.callback()).await;

    let outcome = rec.single();
    assert!(outcome.error.is_none());
    let result = outcome.result.unwrap();
    assert_eq!(result.rows, rows(expected_rows));
    assert_eq!(result.incomplete, incomplete);
    assert_eq!(rec.count("teardown"), 1);
}

#[tokio::test]
async fn test_cap_two_of_five_pauses_and_closes() {
    let rec = Recorder::new();
    // A paused stream never reports its end.
    let script = row_events(5);
    let session = ScriptedSession::new(&rec, script).on_stop(Vec::new());
    let connector = ScriptedConnector::ok(&rec, session);

    mysql::run(&connector, "SELECT * FROM t", &spec(BackendKind::MySql, 2), rec.callback()).await;

    let result = rec.single().result.unwrap();
    assert_eq!(result.rows, vec![row(0), row(1)]);
    assert!(result.incomplete);
    assert_eq!(result.fields, Some(fields()));
    assert_eq!(rec.count("stop"), 1);
    assert_eq!(rec.count("teardown"), 1);
    assert!(rec.position("callback") < rec.position("teardown"));
}

#[tokio::test]
async fn test_error_waits_for_end() {
    let rec = Recorder::new();
    let mut script = row_events(2);
    script.push(SessionEvent::Error(query_error("Deadlock found")));
    script.push(SessionEvent::End);
    let connector = ScriptedConnector::ok(&rec, ScriptedSession::new(&rec, script));

    mysql::run(&connector, "SELECT 1", &spec(BackendKind::MySql, 10), rec.callback()).await;

    let outcome = rec.single();
    assert_eq!(outcome.error.unwrap().to_string(), "query: Deadlock found");
    assert_eq!(outcome.result.unwrap().rows, rows(2));
    assert_eq!(rec.count("teardown"), 1);
}

#[tokio::test]
async fn test_connect_failure_skips_session() {
    let rec = Recorder::new();
    let connector = ScriptedConnector::<ScriptedSession>::failing(&rec, refused());

    mysql::run(&connector, "SELECT 1", &spec(BackendKind::MySql, 10), rec.callback()).await;

    let outcome = rec.single();
    assert!(outcome.error.unwrap().is_connection());
    assert!(outcome.result.is_none());
    assert_eq!(rec.count("query"), 0);
    assert_eq!(rec.count("teardown"), 0);
}

#[tokio::test]
async fn test_rejected_query_still_tears_down() {
    let rec = Recorder::new();
    let session = ScriptedSession::new(&rec, Vec::new()).failing_query(query_error("syntax"));
    let connector = ScriptedConnector::ok(&rec, session);

    mysql::run(&connector, "SELEC 1", &spec(BackendKind::MySql, 10), rec.callback()).await;

    let outcome = rec.single();
    assert!(outcome.error.is_some());
    assert_eq!(outcome.result.unwrap().rows.len(), 0);
    assert_eq!(rec.count("teardown"), 1);
}

#[tokio::test]
async fn test_teardown_error_is_not_surfaced() {
    let rec = Recorder::new();
    let mut script = row_events(1);
    script.push(SessionEvent::End);
    let session = ScriptedSession::new(&rec, script).failing_teardown(refused());
    let connector = ScriptedConnector::ok(&rec, session);

    mysql::run(&connector, "SELECT 1", &spec(BackendKind::MySql, 10), rec.callback()).await;

    let outcome = rec.single();
    assert!(outcome.error.is_none());
    assert_eq!(outcome.result.unwrap().rows, rows(1));
    assert_eq!(rec.count("teardown"), 1);
}

#[tokio::test]
async fn test_second_recordset_rows_are_appended() {
    let rec = Recorder::new();
    let mut script = row_events(1);
    script.push(SessionEvent::Fields(Vec::new()));
    script.push(SessionEvent::Row(row(1)));
    script.push(SessionEvent::End);
    let connector = ScriptedConnector::ok(&rec, ScriptedSession::new(&rec, script));

    let target = spec(BackendKind::MySql, 10);
    mysql::run(&connector, "SELECT 1; SELECT 2", &target, rec.callback()).await;

    let result = rec.single().result.unwrap();
    assert_eq!(result.rows, rows(2));
    assert_eq!(result.fields, Some(fields()));
}
