//! # Archive Entry I/O
//!
//! This module defines the reading and writing abstraction over archive containers.
//! Each entry is a named file or directory; names use `/` separators, and a trailing
//! `/` marks a directory with no payload.
//!
//! Writers follow a strict sequential protocol:
//!
//! ```text
//! Idle --put_next_entry(name)--> EntryOpen --output_stream()--> EntryOpen --close_entry()--> Idle
//! ```
//!
//! and finish with `close()`. File-backed writers write into a working file
//! (`<destination>.tmp`) and only rename it over the destination once `close()`
//! succeeds, so a failed write never replaces a valid archive.
//!
//! Backends:
//! - [`zipfile`]: zip archives on disk or in memory, with raw (no re-compression) transfer.
//! - [`tarfile`]: uncompressed tar archives.
//! - [`directory`]: a plain directory tree.

pub mod directory;
pub mod tarfile;
pub mod zipfile;

pub use directory::{DirectoryReader, DirectoryWriter};
pub use tarfile::{TarArchiveReader, TarArchiveWriter};
pub use zipfile::{EntryCompression, RawEntryInfo, RawEntrySink, RawZipSource, ZipArchiveReader, ZipArchiveWriter, ZipOutput};

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{ArchiveError, Result};
use crate::parallel::{ParallelArchiveWriter, ParallelOptions};

/// Separator between path components of an entry name.
pub const SEPARATOR: char = '/';

/// Suffix appended to a destination path to form the default working path.
pub const WORKING_SUFFIX: &str = ".tmp";

/// Returns true if `name` denotes a directory entry (ends with [`SEPARATOR`]).
pub fn is_directory_name(name: &str) -> bool {
    name.ends_with(SEPARATOR)
}

/// The container format behind a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar,
    Directory,
}

/// Read access to the entries of an archive.
///
/// Readers are shared between threads (a parallel writer may hold on to one until a
/// raw transfer is drained), so implementations use interior locking where needed.
pub trait ArchiveReader: Send + Sync {
    fn kind(&self) -> ArchiveKind;

    /// Human-readable description, usually the archive path.
    fn name(&self) -> String;

    fn has_entry(&self, name: &str) -> bool;

    /// Opens an entry for reading. Directory entries yield no bytes.
    fn input_stream(&self, name: &str) -> Result<Box<dyn Read + Send>>;

    /// Lazily enumerates entry names.
    fn entry_names(&self) -> Box<dyn Iterator<Item = Result<String>> + Send + '_>;

    /// Raw (still-compressed) access, for backends that support it.
    fn as_raw_zip(&self) -> Option<&dyn RawZipSource> {
        None
    }

    /// Releases cached lookup state. The reader stays usable; file handles are
    /// released when it is dropped.
    fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Reads a whole entry into memory.
    fn read_entry(&self, name: &str) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.input_stream(name)?.read_to_end(&mut out)?;
        Ok(out)
    }
}

/// Sequential write access to an archive.
pub trait ArchiveWriter: Send {
    /// Human-readable description, usually the destination path.
    fn name(&self) -> String;

    /// Begins an entry. Names ending in `/` are directories and take no stream.
    fn put_next_entry(&mut self, name: &str) -> Result<()>;

    /// Returns the stream for the open entry. May be requested once per entry.
    ///
    /// Never close this stream; call [`ArchiveWriter::close_entry`] instead.
    fn output_stream(&mut self) -> Result<&mut dyn Write>;

    /// Closes the open entry.
    fn close_entry(&mut self) -> Result<()>;

    /// Copies entry `source` of `reader` into this archive as `dest`.
    ///
    /// Backends that understand the reader's encoding override this to skip
    /// decompression and recompression.
    fn transfer_from(&mut self, reader: &Arc<dyn ArchiveReader>, source: &str, dest: &str) -> Result<()> {
        copy_entry(self, reader.as_ref(), source, dest)
    }

    /// Writes everything `input` yields as entry `name` and returns the byte
    /// count. Directory names take no bytes, so `input` is not read for them.
    fn transfer_stream(&mut self, input: &mut dyn Read, name: &str) -> Result<u64> {
        self.put_next_entry(name)?;
        let copied = if is_directory_name(name) {
            0
        } else {
            io::copy(input, self.output_stream()?)?
        };
        self.close_entry()?;
        Ok(copied)
    }

    /// Writes a complete entry in one call.
    fn write_entry(&mut self, name: &str, data: &[u8]) -> Result<()> {
        self.put_next_entry(name)?;
        if is_directory_name(name) {
            if !data.is_empty() {
                return Err(ArchiveError::protocol(format!("directory entry '{name}' cannot hold data")));
            }
        } else {
            self.output_stream()?.write_all(data)?;
        }
        self.close_entry()
    }

    /// Finishes the archive. Calling it again after success is a no-op.
    fn close(&mut self) -> Result<()>;

    /// Opens the finished archive for reading. Only valid after [`ArchiveWriter::close`].
    fn completed_reader(&self) -> Result<Arc<dyn ArchiveReader>>;
}

/// Streams one entry through `input_stream` -> `output_stream`.
///
/// The source is opened before the entry is started, so a missing source
/// leaves `writer` idle and usable.
pub fn copy_entry<W: ArchiveWriter + ?Sized>(
    writer: &mut W,
    reader: &dyn ArchiveReader,
    source: &str,
    dest: &str,
) -> Result<()> {
    let mut input = reader.input_stream(source)?;
    writer.transfer_stream(&mut input, dest)?;
    Ok(())
}

/// Copies every entry of `reader` into `writer`, keeping names.
///
/// Returns the number of entries copied. Does not close the writer.
pub fn transfer_all(reader: &Arc<dyn ArchiveReader>, writer: &mut dyn ArchiveWriter) -> Result<u64> {
    let mut count = 0u64;
    for name in reader.entry_names() {
        let name = name?;
        writer.transfer_from(reader, &name, &name)?;
        count += 1;
    }
    tracing::debug!(source = %reader.name(), dest = %writer.name(), count, "transferred entries");
    Ok(count)
}

/// Bookkeeping for the sequential entry protocol, shared by all writers.
#[derive(Debug, Default)]
pub(crate) struct EntryState {
    current: Option<String>,
    stream_opened: bool,
    closed: bool,
}

impl EntryState {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(ArchiveError::protocol("archive has already been closed"))
        } else {
            Ok(())
        }
    }

    pub(crate) fn begin(&mut self, name: &str) -> Result<()> {
        self.ensure_open()?;
        if let Some(open) = &self.current {
            return Err(ArchiveError::protocol(format!(
                "put_next_entry('{name}') called while '{open}' is still open"
            )));
        }
        if name.is_empty() {
            return Err(ArchiveError::protocol("entry names cannot be empty"));
        }
        self.current = Some(name.to_string());
        self.stream_opened = false;
        Ok(())
    }

    pub(crate) fn open_stream(&mut self) -> Result<()> {
        self.ensure_open()?;
        let Some(name) = &self.current else {
            return Err(ArchiveError::protocol("output_stream called before put_next_entry"));
        };
        if self.stream_opened {
            return Err(ArchiveError::protocol(format!(
                "output_stream already requested for '{name}'; close_entry and put_next_entry first"
            )));
        }
        if is_directory_name(name) {
            return Err(ArchiveError::protocol(format!("directory entry '{name}' has no output stream")));
        }
        self.stream_opened = true;
        Ok(())
    }

    /// Ends the open entry, returning its name and whether a stream was requested.
    pub(crate) fn finish(&mut self) -> Result<(String, bool)> {
        self.ensure_open()?;
        let name = self
            .current
            .take()
            .ok_or_else(|| ArchiveError::protocol("close_entry called without an open entry"))?;
        Ok((name, std::mem::take(&mut self.stream_opened)))
    }

    /// Drops the open entry after a failed `put_next_entry`.
    pub(crate) fn abandon(&mut self) {
        self.current = None;
        self.stream_opened = false;
    }

    pub(crate) fn ensure_idle(&self, op: &str) -> Result<()> {
        self.ensure_open()?;
        match &self.current {
            Some(open) => Err(ArchiveError::protocol(format!("{op} called while '{open}' is still open"))),
            None => Ok(()),
        }
    }

    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }
}

/// A working path that is renamed onto the destination when writing succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingFile {
    working: PathBuf,
    destination: PathBuf,
}

impl WorkingFile {
    /// Uses `<destination>.tmp` as the working path.
    pub fn for_destination(destination: impl AsRef<Path>) -> Self {
        let destination = destination.as_ref().to_path_buf();
        let mut working: OsString = destination.clone().into_os_string();
        working.push(WORKING_SUFFIX);
        Self { working: PathBuf::from(working), destination }
    }

    pub fn new(destination: impl AsRef<Path>, working: impl AsRef<Path>) -> Self {
        Self {
            working: working.as_ref().to_path_buf(),
            destination: destination.as_ref().to_path_buf(),
        }
    }

    pub fn working_path(&self) -> &Path {
        &self.working
    }

    pub fn destination_path(&self) -> &Path {
        &self.destination
    }

    pub(crate) fn create(&self) -> Result<File> {
        File::create(&self.working).map_err(|e| ArchiveError::io(e, &self.working))
    }

    /// Atomically replaces the destination with the working file.
    pub(crate) fn commit(&self) -> Result<()> {
        if self.working != self.destination {
            fs::rename(&self.working, &self.destination).map_err(|e| ArchiveError::io(e, &self.destination))?;
        }
        tracing::debug!(destination = %self.destination.display(), "committed working file");
        Ok(())
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

fn names_a_directory(path: &Path) -> bool {
    let raw = path.as_os_str().to_string_lossy();
    raw.ends_with('/') || raw.ends_with(std::path::MAIN_SEPARATOR)
}

/// Opens the default reader for `path`: directories, `.tar`, and zip otherwise.
pub fn open_reader(path: impl AsRef<Path>) -> Result<Arc<dyn ArchiveReader>> {
    let path = path.as_ref();
    let reader: Arc<dyn ArchiveReader> = if path.is_dir() {
        Arc::new(DirectoryReader::open(path)?)
    } else if has_extension(path, "tar") {
        Arc::new(TarArchiveReader::open(path)?)
    } else {
        Arc::new(ZipArchiveReader::open(path)?)
    };
    Ok(reader)
}

/// Decides which backend [`create_writer`] uses for `path`.
///
/// Existing directories (or missing paths ending in a separator) are written as
/// directories, `.tar` as tar and `.zip` as zip. For other suffixes the paired
/// reader decides: tar input produces tar output, anything else zip, so
/// zip-to-zip copies stay raw.
pub fn output_kind(path: impl AsRef<Path>, paired: Option<&dyn ArchiveReader>) -> ArchiveKind {
    let path = path.as_ref();
    if path.is_dir() || (!path.exists() && names_a_directory(path)) {
        ArchiveKind::Directory
    } else if has_extension(path, "tar") {
        ArchiveKind::Tar
    } else if has_extension(path, "zip") {
        ArchiveKind::Zip
    } else {
        match paired.map(|r| r.kind()) {
            Some(ArchiveKind::Tar) => ArchiveKind::Tar,
            _ => ArchiveKind::Zip,
        }
    }
}

/// Creates the default writer for `path`, as chosen by [`output_kind`].
pub fn create_writer(path: impl AsRef<Path>, paired: Option<&dyn ArchiveReader>) -> Result<Box<dyn ArchiveWriter>> {
    let path = path.as_ref();
    let writer: Box<dyn ArchiveWriter> = match output_kind(path, paired) {
        ArchiveKind::Directory => Box::new(DirectoryWriter::create(path)?),
        ArchiveKind::Tar => Box::new(TarArchiveWriter::create(path)?),
        ArchiveKind::Zip => Box::new(ZipArchiveWriter::create(path, EntryCompression::Deflate)?),
    };
    Ok(writer)
}

/// Creates a parallel zip writer for `path`.
pub fn create_parallel_writer(
    path: impl AsRef<Path>,
    options: ParallelOptions,
) -> Result<ParallelArchiveWriter<io::BufWriter<File>>> {
    ParallelArchiveWriter::create(path, options)
}
