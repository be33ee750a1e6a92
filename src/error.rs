use std::io;

use thiserror::Error;

/// Errors produced by map construction, mutation and persistence.
///
/// Queries never fail: a query for a coordinate outside the map extent
/// resolves to unknown space instead of returning an error.
#[derive(Error, Debug)]
pub enum MapError {
    /// The map was configured with invalid parameters.
    #[error("invalid map configuration: {0}")]
    Config(String),

    /// An underlying stream could not be read or written.
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),

    /// A map file had a missing or malformed header token, the wrong tree
    /// type, or an inconsistent body.
    #[error("malformed map file: {0}")]
    Format(String),

    /// An operation was called with an argument outside its domain.
    #[error("invalid argument: {0}")]
    Argument(String),
}
