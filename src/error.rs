//! The crate-wide error taxonomy, used from the store and query
//! evaluator up through the HTTP layer. A single enum rather than a
//! per-layer type keeps the `?`-propagation from `store::Worker` through
//! `query::evaluate` to the HTTP handlers trivial.

use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    /// A request carried an empty key.
    #[error("no key provided")]
    MissingKey,

    /// A malformed argument: bad numeric literal, malformed JSON query, etc.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// A `size`/capacity argument that parsed but is out of range (zero).
    #[error("invalid size: {0}")]
    InvalidSize(String),

    /// A surface that requires presence found none.
    #[error("not found")]
    NotFound,

    /// Stored bytes did not decode into a valid sketch.
    #[error("malformed stored data: {0}")]
    Malformed(String),

    /// A query tree violated the query-language shape rules (exactly one
    /// of `keys`/`set` must be present, arity must match the method).
    #[error("invalid query shape: {0}")]
    QueryShape(String),

    /// The embedded key-value engine reported a failure.
    #[error("store error: {0}")]
    Store(String),

    /// A request was still pending when the worker pool shut down.
    #[error("shutting down")]
    Shutdown,
}

impl From<sled::Error> for Error {
    fn from(value: sled::Error) -> Self {
        Error::Store(value.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(value: std::num::ParseIntError) -> Self {
        Error::InvalidArg(value.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::InvalidArg(value.to_string())
    }
}

impl Error {
    /// Short machine-readable token for an error, used in HTTP responses
    /// in place of leaking internal error text.
    pub fn token(&self) -> &'static str {
        match self {
            Error::MissingKey => "MISSING_ARG_KEY",
            Error::InvalidArg(_) => "INVALID_ARG",
            Error::InvalidSize(_) => "INVALID_ARG_SIZE",
            Error::NotFound => "NOT_FOUND",
            Error::Malformed(_) => "MALFORMED_DATA",
            Error::QueryShape(_) => "INVALID_QUERY",
            Error::Store(_) => "SERVER_ERROR",
            Error::Shutdown => "SERVER_SHUTTING_DOWN",
        }
    }
}
