use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid proxy address: {0}")]
    InvalidAddress(String),
    #[error("server resolution failed: {0}")]
    ResolveFailed(String),
    #[error("upstream connection failed: {0}")]
    Upstream(#[from] std::io::Error),
    #[error("upstream request failed: {0}")]
    Hyper(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
