use std::path::PathBuf;

use thiserror::Error;

use crate::buffer::BufferError;

/// The primary error type for all operations in the `archive-io` crate.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The caller broke the entry protocol (e.g. two open entries, a second
    /// output stream, or any call after `close()`). Never retried.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A read was attempted on an entry that does not exist.
    #[error("entry not found: '{name}'")]
    NotFound { name: String },

    /// An I/O error occurred, typically while reading or writing a file.
    /// Includes the path where the error happened, if known.
    #[error("I/O error on path '{}': {source}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// An error from the underlying `zip` crate (headers, inflate/deflate).
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// An error from an in-memory buffer.
    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// Invalid configuration, such as a parallel writer with zero threads.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A background compression task panicked while processing `entry`.
    #[error("compression task panicked while writing '{entry}'")]
    WorkerPanicked { entry: String },

    /// An earlier asynchronous failure aborted this archive; the original
    /// error is returned by `close()`.
    #[error("archive aborted by an earlier failure")]
    Aborted,

    /// The writer thread went away without reporting a result.
    #[error("archive writer thread terminated unexpectedly")]
    WriterThread,
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

impl ArchiveError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        ArchiveError::Protocol(msg.into())
    }

    pub(crate) fn not_found(name: &str) -> Self {
        ArchiveError::NotFound { name: name.to_string() }
    }

    pub(crate) fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        ArchiveError::Io { source, path: path.into() }
    }
}

// Generic IO error conversion that doesn't require a path
impl From<std::io::Error> for ArchiveError {
    fn from(err: std::io::Error) -> Self {
        ArchiveError::Io { source: err, path: PathBuf::new() }
    }
}

impl From<walkdir::Error> for ArchiveError {
    fn from(err: walkdir::Error) -> Self {
        let path = err.path().map(|p| p.to_path_buf()).unwrap_or_default();
        ArchiveError::Io { source: err.into(), path }
    }
}
