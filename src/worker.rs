//! # Compression Worker
//!
//! A worker owns two reusable buffers: the raw bytes of one entry, and that entry
//! compressed as a single-entry zip. Workers move by value through the pipeline:
//!
//! ```text
//! caller (fills) -> pool thread (compresses) -> writer thread (raw copy) -> idle
//! ```
//!
//! so a buffer is only ever touched by the thread currently holding the worker.

use std::io;
use std::sync::Arc;

use tracing::trace;
use zip::ZipWriter;

use crate::archive::{is_directory_name, ArchiveReader, ArchiveWriter, EntryCompression, RawZipSource, ZipArchiveReader, ZipArchiveWriter, ZipOutput};
use crate::buffer::SeekableMemoryBuffer;
use crate::error::{ArchiveError, Result};
use crate::parallel::Scheduler;

/// Initial size of the uncompressed entry buffer.
pub const UNCOMPRESSED_CAPACITY: usize = 32 * 1024 * 1024;

/// Initial size of the compressed entry buffer.
pub const COMPRESSED_CAPACITY: usize = 5 * 1024 * 1024;

/// What a worker will hand to the archive when drained.
enum Payload {
    None,
    Directory,
    EmptyFile,
    /// The compressed buffer, opened as a zip holding exactly one entry.
    Compressed(ZipArchiveReader<SeekableMemoryBuffer>),
    /// An entry of another zip, copied raw at write time.
    External { reader: Arc<dyn ArchiveReader>, source: String },
}

/// A worker handed back because it could not take on an entry.
pub(crate) struct Rejected {
    pub(crate) worker: CompressionWorker,
    pub(crate) error: ArchiveError,
}

/// Compresses one entry at a time for the parallel writer.
pub struct CompressionWorker {
    id: usize,
    name: Option<String>,
    uncompressed: SeekableMemoryBuffer,
    compressed: SeekableMemoryBuffer,
    compression: EntryCompression,
    payload: Payload,
}

impl CompressionWorker {
    pub fn new(id: usize, compression: EntryCompression) -> Self {
        Self::with_capacity(id, compression, UNCOMPRESSED_CAPACITY, COMPRESSED_CAPACITY)
    }

    pub fn with_capacity(id: usize, compression: EntryCompression, uncompressed: usize, compressed: usize) -> Self {
        // The pool owns these buffers; encoders must not close them.
        let mut uncompressed = SeekableMemoryBuffer::with_capacity(uncompressed);
        uncompressed.set_closeable(false);
        let mut compressed = SeekableMemoryBuffer::with_capacity(compressed);
        compressed.set_closeable(false);
        Self { id, name: None, uncompressed, compressed, compression, payload: Payload::None }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Name of the current entry, or `""` when idle.
    pub fn entry_name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    /// Clears the entry and empties both buffers, keeping their storage.
    pub fn reset(&mut self) {
        self.uncompressed.truncate(0);
        self.compressed.truncate(0);
        self.name = None;
        self.payload = Payload::None;
    }

    pub fn put_next_entry(&mut self, name: &str) {
        self.reset();
        self.name = Some(name.to_string());
    }

    pub fn output_stream(&mut self) -> &mut SeekableMemoryBuffer {
        &mut self.uncompressed
    }

    /// Hands the filled worker to `scheduler`.
    ///
    /// Directories and empty files need no compression and complete at once.
    pub(crate) fn close_entry(mut self, seq: u64, scheduler: &Scheduler) {
        if is_directory_name(self.entry_name()) {
            self.payload = Payload::Directory;
            scheduler.complete(seq, self, Ok(()));
        } else if self.uncompressed.is_empty() {
            self.payload = Payload::EmptyFile;
            scheduler.complete(seq, self, Ok(()));
        } else {
            scheduler.compress(seq, self);
        }
    }

    /// Queues entry `source` of `reader` as `dest`.
    ///
    /// Zip sources are recorded and copied raw by the writer thread; other
    /// sources are read into the uncompressed buffer and compressed as usual.
    pub(crate) fn transfer_from(
        mut self,
        reader: &Arc<dyn ArchiveReader>,
        source: &str,
        dest: &str,
        seq: u64,
        scheduler: &Scheduler,
    ) -> std::result::Result<(), Rejected> {
        self.put_next_entry(dest);
        if reader.as_raw_zip().is_some() {
            self.payload = Payload::External { reader: Arc::clone(reader), source: source.to_string() };
            scheduler.complete(seq, self, Ok(()));
            return Ok(());
        }
        if !is_directory_name(dest) {
            let copied = reader
                .input_stream(source)
                .and_then(|mut input| Ok(io::copy(&mut input, &mut self.uncompressed)?));
            if let Err(error) = copied {
                self.reset();
                return Err(Rejected { worker: self, error });
            }
        }
        self.close_entry(seq, scheduler);
        Ok(())
    }

    /// Compresses the uncompressed buffer into a single-entry zip.
    pub(crate) fn compress(&mut self) -> Result<()> {
        let name = self
            .name
            .as_deref()
            .ok_or_else(|| ArchiveError::protocol(format!("worker {} has no entry to compress", self.id)))?;
        let size = self.uncompressed.size();
        self.uncompressed.set_position(0)?;
        self.compressed.truncate(0);

        let options = self.compression.file_options(Some(size));
        let mut zip = ZipWriter::new(&mut self.compressed);
        zip.start_file(name, options)?;
        let consumed = io::copy(&mut self.uncompressed, &mut zip)?;
        zip.finish()?;
        drop(zip);

        if consumed != size {
            return Err(ArchiveError::protocol(format!(
                "compressed {consumed} of {size} bytes for '{name}'"
            )));
        }
        if self.compressed.is_empty() {
            return Err(ArchiveError::protocol(format!("no compressed output for '{name}'")));
        }
        trace!(worker = self.id, entry = name, size, compressed = self.compressed.size(), "compressed entry");
        self.payload = Payload::Compressed(ZipArchiveReader::from_buffer(self.compressed.copy())?);
        Ok(())
    }

    /// Writes the prepared entry into `sink` and drops the compressed view.
    pub(crate) fn write_to<W: ZipOutput>(&mut self, sink: &mut ZipArchiveWriter<W>) -> Result<()> {
        let name = self.name.as_deref().unwrap_or_default();
        match std::mem::replace(&mut self.payload, Payload::None) {
            Payload::Compressed(view) => view.copy_raw_entry(name, name, sink),
            Payload::External { reader, source } => match reader.as_raw_zip() {
                Some(raw) => raw.copy_raw_entry(&source, name, sink),
                None => Err(ArchiveError::protocol(format!("{} cannot be copied raw", reader.name()))),
            },
            Payload::Directory | Payload::EmptyFile => {
                sink.put_next_entry(name)?;
                sink.close_entry()
            }
            Payload::None => Err(ArchiveError::protocol(format!("worker {} has nothing to write", self.id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_worker() -> CompressionWorker {
        CompressionWorker::with_capacity(0, EntryCompression::Deflate, 1024, 1024)
    }

    #[test]
    fn compress_produces_single_entry_view() {
        let mut worker = small_worker();
        worker.put_next_entry("data.txt");
        let payload = b"abcdefgh".repeat(4096);
        io::Write::write_all(worker.output_stream(), &payload).unwrap();
        worker.compress().unwrap();
        assert!(worker.compressed.size() < payload.len() as u64);

        let mut sink = ZipArchiveWriter::in_memory(EntryCompression::Store);
        worker.write_to(&mut sink).unwrap();
        let reader = sink.into_reader().unwrap();
        assert_eq!(reader.read_entry("data.txt").unwrap(), payload);
        assert_eq!(reader.raw_entry("data.txt").unwrap().method, zip::CompressionMethod::Deflated);
    }

    #[test]
    fn reset_keeps_block_storage() {
        let mut worker = small_worker();
        worker.put_next_entry("a");
        io::Write::write_all(worker.output_stream(), &[1u8; 5000]).unwrap();
        let blocks = worker.uncompressed.block_count();
        worker.compress().unwrap();
        worker.reset();
        assert_eq!(worker.entry_name(), "");
        assert!(worker.uncompressed.is_empty());
        assert!(worker.compressed.is_empty());
        assert_eq!(worker.uncompressed.block_count(), blocks);
    }

    #[test]
    fn directory_payload_writes_marker() {
        let mut worker = small_worker();
        worker.put_next_entry("dir/");
        worker.payload = Payload::Directory;
        let mut sink = ZipArchiveWriter::in_memory(EntryCompression::Deflate);
        worker.write_to(&mut sink).unwrap();
        let reader = sink.into_reader().unwrap();
        assert!(reader.has_entry("dir/"));
    }

    #[test]
    fn write_without_payload_is_an_error() {
        let mut worker = small_worker();
        worker.put_next_entry("x");
        let mut sink = ZipArchiveWriter::in_memory(EntryCompression::Deflate);
        assert!(matches!(worker.write_to(&mut sink), Err(ArchiveError::Protocol(_))));
    }
}
