//! Error handling for the moonbridge binary.

use std::{io, result};

use thiserror::Error;

/// Convenient result type for moonbridge commands.
pub type Result<T> = result::Result<T, Error>;

/// Errors that end a moonbridge command.
#[derive(Debug, Error)]
pub enum Error {
    /// Wrapper for standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Configuration parsing or validation errors.
    #[error("{}", .0.pretty())]
    Config(#[from] config::Error),
    /// Errors surfaced by the bridge.
    #[error("Klippy error: {0}")]
    Bridge(#[from] klippy_bridge::Error),
    /// Bad command-line input.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// Output rendering failed.
    #[error("Failed to render output: {0}")]
    Render(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Render(err.to_string())
    }
}
