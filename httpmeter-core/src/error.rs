use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid route path {path:?}: {reason}")]
    InvalidRoutePath { path: String, reason: String },

    #[error("Invalid skip path pattern: {0}")]
    InvalidSkipPattern(#[from] regex::Error),

    #[error("Metric {name} already exists with a different schema (existing: {existing}, requested: {requested})")]
    LabelSchemaMismatch {
        name: String,
        existing: String,
        requested: String,
    },

    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Encoding error: {0}")]
    Encoding(String),
}

impl Error {
    pub(crate) fn invalid_route(path: &str, reason: impl Into<String>) -> Self {
        Self::InvalidRoutePath {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
