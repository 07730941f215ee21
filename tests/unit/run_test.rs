mod support;

use dbcap::backend::{Phase, QueryRun, RowOutcome};
use dbcap::DbcapError;
use support::{fields, query_error, row, Recorder};

#[test]
fn test_append_stops_at_cap() {
    let rec = Recorder::new();
    let mut run = QueryRun::new(2, rec.callback());

    assert_eq!(run.append_row(row(0)), RowOutcome::Appended);
    assert_eq!(run.append_row(row(1)), RowOutcome::Appended);
    assert_eq!(run.append_row(row(2)), RowOutcome::CapReached);
    run.mark_incomplete();
    run.mark_incomplete();
    assert!(run.finalize());

    let result = rec.single().result.unwrap();
    assert_eq!(result.rows, vec![row(0), row(1)]);
    assert!(result.incomplete);
}

#[test]
fn test_finalize_fires_once() {
    let rec = Recorder::new();
    let mut run = QueryRun::new(10, rec.callback());

    assert!(run.finalize());
    assert!(!run.finalize());
    assert!(!run.fail(query_error("late")));
    drop(run);

    assert_eq!(rec.callbacks(), 1);
    let outcome = rec.single();
    assert!(outcome.error.is_none());
    assert_eq!(outcome.result.unwrap().rows.len(), 0);
}

#[test]
fn test_rows_after_finalize_are_ignored() {
    let rec = Recorder::new();
    let mut run = QueryRun::new(10, rec.callback());
    run.append_row(row(0));
    run.finalize();

    assert_eq!(run.append_row(row(1)), RowOutcome::Ignored);
    assert_eq!(rec.single().result.unwrap().rows, vec![row(0)]);
}

#[test]
fn test_pending_error_travels_with_rows() {
    let rec = Recorder::new();
    let mut run = QueryRun::new(10, rec.callback());
    run.append_row(row(0));
    run.record_error(query_error("first"));
    run.record_error(query_error("second"));
    assert!(run.has_pending_error());
    run.finalize();

    let outcome = rec.single();
    assert_eq!(outcome.error.unwrap().to_string(), "query: second");
    assert_eq!(outcome.result.unwrap().rows, vec![row(0)]);
}

#[test]
fn test_first_recordset_fields_win() {
    let rec = Recorder::new();
    let mut run = QueryRun::new(10, rec.callback());
    run.set_fields(fields());
    run.set_fields(Vec::new());
    run.finalize();

    assert_eq!(rec.single().result.unwrap().fields, Some(fields()));
}

#[test]
fn test_fail_delivers_no_result() {
    let rec = Recorder::new();
    let mut run = QueryRun::new(10, rec.callback());
    assert!(run.fail(support::refused()));
    run.close();

    assert_eq!(run.phase(), Phase::Failed);
    let outcome = rec.single();
    assert!(outcome.error.unwrap().is_connection());
    assert!(outcome.result.is_none());
}

#[test]
fn test_phases_advance_until_delivery() {
    let rec = Recorder::new();
    let mut run = QueryRun::new(10, rec.callback());
    assert_eq!(run.phase(), Phase::Connecting);
    run.advance(Phase::Querying);
    run.advance(Phase::Streaming);
    assert_eq!(run.phase(), Phase::Streaming);

    run.finalize();
    assert_eq!(run.phase(), Phase::Finalizing);
    run.advance(Phase::Streaming);
    assert_eq!(run.phase(), Phase::Finalizing);
    run.close();
    assert_eq!(run.phase(), Phase::Closed);
}

#[test]
fn test_dropped_run_still_delivers() {
    let rec = Recorder::new();
    {
        let mut run = QueryRun::new(10, rec.callback());
        run.append_row(row(0));
    }

    let outcome = rec.single();
    assert!(matches!(outcome.error, Some(DbcapError::Internal { .. })));
    assert_eq!(outcome.result.unwrap().rows, vec![row(0)]);
}

#[test]
fn test_deliver_explicit_result() {
    let rec = Recorder::new();
    let mut run = QueryRun::new(1, rec.callback());
    let result = dbcap::QueryResult {
        rows: vec![row(0), row(1), row(2)],
        fields: None,
        incomplete: false,
    };
    assert!(run.deliver(None, Some(result.clone())));
    assert!(!run.finalize());

    assert_eq!(rec.single().result, Some(result));
}
