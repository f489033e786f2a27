use std::{io::Error as IoError, result::Result as StdResult};

use thiserror::Error;

/// The main error type for bridge operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A request was issued while no Klippy connection exists.
    #[error("Klippy Disconnected")]
    NotConnected,

    /// The connection was torn down before a response arrived.
    #[error("Klippy Disconnected")]
    Disconnected,

    /// Klippy answered with an explicit `error` field.
    #[error("{message}")]
    Remote {
        /// Endpoint the request was sent to.
        method: String,
        /// Message reported by Klippy, verbatim.
        message: String,
    },

    /// Caller supplied arguments the bridge cannot use.
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// A subscribe request arrived without a subscriber to deliver to.
    #[error("Unable to subscribe: no subscriber attached to request")]
    NoSubscriber,

    /// Remote method names are unique for the life of the process.
    #[error("Remote method ({0}) already registered")]
    DuplicateMethod(String),

    /// Remote methods must be registered before the bridge starts.
    #[error("Remote method ({0}) registered after the bridge started")]
    AlreadyRunning(String),

    /// Klippy finished starting up in a state other than `ready`.
    #[error("Klippy not ready: {0}")]
    NotReady(String),

    /// The bridge has been closed.
    #[error("Klippy bridge closed")]
    Closed,

    /// IO-related errors
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Convenience type alias for Results using our Error type
pub type Result<T> = StdResult<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<klippy_protocol::codec::Error> for Error {
    fn from(err: klippy_protocol::codec::Error) -> Self {
        match err {
            klippy_protocol::codec::Error::Io(e) => Self::Io(e),
            klippy_protocol::codec::Error::Json(e) => Self::Serialization(e.to_string()),
        }
    }
}

impl Error {
    /// HTTP status a front end should answer with for this error.
    ///
    /// Connection loss maps to 503 so clients retry; errors Klippy reported
    /// map to 400 and carry its message.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotConnected | Self::Disconnected | Self::Closed | Self::NotReady(_) => 503,
            Self::Remote { .. } | Self::InvalidParams(_) | Self::NoSubscriber => 400,
            Self::DuplicateMethod(_)
            | Self::AlreadyRunning(_)
            | Self::Io(_)
            | Self::Serialization(_) => 500,
        }
    }

    /// True for errors caused by the connection going away.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Disconnected | Self::Closed)
    }
}
