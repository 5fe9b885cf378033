//! # archive-io Core Library
//!
//! Entry-level reading and writing of archive containers (zip, tar, plain
//! directories, in-memory zips) behind one pair of traits, plus a parallel zip
//! writer that compresses entries on a thread pool while a single thread writes
//! the output.
//!
//! ## Key Modules
//!
//! - [`buffer`]: a growable, seekable in-memory buffer that never copies on growth.
//! - [`archive`]: the [`ArchiveReader`]/[`ArchiveWriter`] traits, their backends and
//!   the factory functions that pick a backend from a path.
//! - [`worker`]: the reusable per-entry compression unit.
//! - [`parallel`]: the pipelined [`ParallelArchiveWriter`].
//! - [`cli`]: argument parsing and the commands behind the `archive-io` binary.
//!
//! ## Examples
//!
//! ```no_run
//! use archive_io::{create_parallel_writer, ArchiveWriter, ParallelOptions};
//!
//! # fn main() -> archive_io::Result<()> {
//! let mut zip = create_parallel_writer("out.zip", ParallelOptions::with_threads(4))?;
//! zip.write_entry("hello.txt", b"hello")?;
//! zip.write_entry("data/", b"")?;
//! zip.close()?;
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod buffer;
pub mod cli;
pub mod error;
pub mod parallel;
pub mod worker;

pub use archive::{
    create_parallel_writer, create_writer, open_reader, ArchiveKind, ArchiveReader, ArchiveWriter, EntryCompression,
};
pub use buffer::SeekableMemoryBuffer;
pub use error::{ArchiveError, Result};
pub use parallel::{BlockingStats, ParallelArchiveWriter, ParallelOptions};
