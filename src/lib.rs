//! Run one SQL query against MySQL, PostgreSQL, SQL Server, Vertica or SAP
//! HANA and get back a bounded, uniform result.

pub mod backend;
pub mod config;
pub mod error;
pub mod masking;

pub use backend::{execute, run_query, ColumnMeta, Outcome, QueryResult, Row};
pub use config::{BackendKind, ConnectionSpec};
pub use error::DbcapError;
