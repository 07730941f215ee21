use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbcapError {
    #[error("connection: {message}")]
    Connection { message: String },

    #[error("query: {message}")]
    Query {
        code: Option<String>,
        message: String,
    },

    /// Acknowledgment raised by a backend after this crate asked it to stop
    /// producing rows.
    #[error("query: statement canceled")]
    Canceled,

    #[error("config: {message}")]
    Config { message: String },

    #[error("internal: {message}")]
    Internal { message: String },
}

impl DbcapError {
    pub fn query(message: impl Into<String>) -> Self {
        DbcapError::Query {
            code: None,
            message: message.into(),
        }
    }

    /// Backend error code (SQLSTATE or vendor code) when the driver reported one.
    pub fn code(&self) -> Option<&str> {
        match self {
            DbcapError::Query { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, DbcapError::Connection { .. })
    }

    pub fn is_cancel_ack(&self) -> bool {
        matches!(self, DbcapError::Canceled)
    }
}
