//! Per-query bookkeeping shared by every backend adapter.
//!
//! A [`QueryRun`] is created when an adapter starts, owned by that adapter
//! alone, and holds the accumulated rows, the pending error, and the
//! completion handler. Whatever order a backend emits its events in, the
//! handler is invoked at most once by [`QueryRun::finalize`] and friends, and
//! dropping a run that never delivered still invokes it.

use super::{ColumnMeta, Outcome, QueryResult, Row};
use crate::error::DbcapError;
use tracing::warn;

type OnDone = Box<dyn FnOnce(Outcome) + Send + 'static>;

/// Where a query is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Querying,
    Streaming,
    Finalizing,
    Closed,
    Failed,
}

/// What happened to a row handed to [`QueryRun::append_row`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    Appended,
    /// The cap was already reached; the row was dropped and the backend should
    /// be told to stop.
    CapReached,
    /// The outcome has already been delivered.
    Ignored,
}

pub struct QueryRun {
    result: QueryResult,
    max_rows: usize,
    pending_error: Option<DbcapError>,
    on_done: Option<OnDone>,
    phase: Phase,
}

impl QueryRun {
    pub fn new(max_rows: usize, on_done: impl FnOnce(Outcome) + Send + 'static) -> Self {
        Self {
            result: QueryResult::default(),
            max_rows,
            pending_error: None,
            on_done: Some(Box::new(on_done)),
            phase: Phase::Connecting,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn max_rows(&self) -> usize {
        self.max_rows
    }

    pub fn is_finalized(&self) -> bool {
        self.on_done.is_none()
    }

    /// Move to `Querying` / `Streaming`. Ignored once the outcome is out.
    pub fn advance(&mut self, phase: Phase) {
        if !self.is_finalized() {
            self.phase = phase;
        }
    }

    pub fn append_row(&mut self, row: Row) -> RowOutcome {
        if self.is_finalized() {
            return RowOutcome::Ignored;
        }
        if self.result.rows.len() >= self.max_rows {
            return RowOutcome::CapReached;
        }
        self.result.rows.push(row);
        RowOutcome::Appended
    }

    pub fn mark_incomplete(&mut self) {
        self.result.incomplete = true;
    }

    /// Record the recordset shape. The first recordset of a query wins.
    pub fn set_fields(&mut self, fields: Vec<ColumnMeta>) {
        if self.result.fields.is_none() && !self.is_finalized() {
            self.result.fields = Some(fields);
        }
    }

    /// Keep `err` for the next finalization. A later error replaces an earlier one.
    pub fn record_error(&mut self, err: DbcapError) {
        if self.is_finalized() {
            warn!(%err, "error after outcome delivery ignored");
            return;
        }
        self.pending_error = Some(err);
    }

    pub fn has_pending_error(&self) -> bool {
        self.pending_error.is_some()
    }

    /// Deliver (pending error, accumulated rows). Returns `false` if the outcome
    /// had already been delivered.
    pub fn finalize(&mut self) -> bool {
        let error = self.pending_error.take();
        let result = std::mem::take(&mut self.result);
        self.deliver(error, Some(result))
    }

    /// Connecting failed: deliver the error with no result.
    pub fn fail(&mut self, err: DbcapError) -> bool {
        let fired = self.deliver(Some(err), None);
        self.phase = Phase::Failed;
        fired
    }

    /// Deliver an outcome built outside the accumulator.
    pub fn deliver(&mut self, error: Option<DbcapError>, result: Option<QueryResult>) -> bool {
        let Some(on_done) = self.on_done.take() else {
            return false;
        };
        self.phase = Phase::Finalizing;
        on_done(Outcome { error, result });
        true
    }

    /// The session has been torn down.
    pub fn close(&mut self) {
        if self.phase != Phase::Failed {
            self.phase = Phase::Closed;
        }
    }
}

impl Drop for QueryRun {
    fn drop(&mut self) {
        if self.on_done.is_some() {
            warn!(phase = ?self.phase, "query run dropped before delivering an outcome");
            let rows = std::mem::take(&mut self.result);
            self.deliver(
                Some(DbcapError::Internal {
                    message: "query ended without an outcome".to_string(),
                }),
                Some(rows),
            );
        }
    }
}
