use thiserror::Error;

use crate::frame::FramingError;
use crate::sample::RunKind;
use crate::session::ConnState;

/// Errors surfaced by session operations.
///
/// A single lost probe or a single malformed chunk is *not* an error: those
/// are absorbed by the engines and recorded in the aggregate. Variants here
/// either reject an operation synchronously or are fatal to the connection.
#[derive(Debug, Error)]
pub enum Error {
    #[error("connection failed: {0}")]
    Connection(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("bad endpoint URL: {0}")]
    Endpoint(#[from] url::ParseError),
    #[error("framing: {0}")]
    Framing(#[from] FramingError),
    #[error("{op} rejected in state {state:?}")]
    InvalidState { op: &'static str, state: ConnState },
    #[error("a {0:?} run is already active")]
    RunActive(RunKind),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("connection closed")]
    Closed,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize/deserialize error: {0}")]
    Json(#[from] serde_json::Error),
}

// reducing size of Error by putting the large element in the Box
impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Connection(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
