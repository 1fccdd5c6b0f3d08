use crate::types::ErrorClass;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database {0:?} not found")]
    DatabaseNotFound(String),
    #[error("table {0:?} not found")]
    TableNotFound(String),
    #[error("row {0:?} not found")]
    RowNotFound(String),
    #[error("no in-cluster address discovered for RethinkDB service")]
    NoAddressDiscovered,
    #[error("backend error ({class:?}): {message}")]
    Backend {
        class: ErrorClass,
        message: String,
    },
    #[error("not connected")]
    NotConnected,
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    pub fn backend(message: impl Into<String>) -> Self {
        let message = message.into();
        let class = crate::types::classify_error(&message);
        Error::Backend { class, message }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Backend { class, .. } => *class,
            Error::DatabaseNotFound(_) | Error::TableNotFound(_) | Error::RowNotFound(_) => {
                ErrorClass::Schema
            }
            _ => ErrorClass::Fatal,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
