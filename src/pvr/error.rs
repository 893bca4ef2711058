//! Error types for the recording catalog

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("unable to enumerate recordings folder {folder}: {source}")]
    Enumeration {
        folder: String,
        #[source]
        source: io::Error,
    },

    #[error("unable to read metadata for {path}: {source}")]
    Metadata {
        path: String,
        #[source]
        source: io::Error,
    },

    /// The row is already gone; only the file could not be removed
    #[error("recording {id} was removed but its file {path} could not be deleted")]
    FileDelete { id: String, path: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
