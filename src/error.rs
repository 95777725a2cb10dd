//! Error types for the log-shipping pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while aggregating and uploading build logs.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error with the path that produced it.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A log record that could not be decoded. Fatal for the run: the
    /// emitter stream is trusted to be well-formed, so a corrupt line
    /// means the producer is broken, not the record.
    #[error("malformed log record {line:?}: {source}")]
    MalformedRecord {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    /// Failed to serialize a record for storage.
    #[error("encoding stored record: {0}")]
    Encode(#[source] serde_json::Error),

    /// Structured error response from the store API.
    #[error("{status_code} {reason}: {message}")]
    Store {
        status_code: u16,
        reason: String,
        message: String,
    },

    /// Upload retry budget exhausted.
    #[error("uploading to {destination} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        destination: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// HTTP transport failure (connect, timeout, protocol).
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// A base URL that could not be parsed or joined.
    #[error("bad url {url}: {reason}")]
    Url { url: String, reason: String },

    /// Reporting the final line count for a step failed.
    #[error("reporting {lines} lines for step {step}: {source}")]
    Report {
        step: String,
        lines: usize,
        #[source]
        source: Box<Error>,
    },

    /// The emitter could not be opened within the startup bound.
    #[error("emitter {path} produced no data within {seconds}s")]
    StartupTimeout { path: PathBuf, seconds: u64 },
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
