//! # Zip Backend
//!
//! Zip readers and writers over any `Read + Seek` / `Write + Seek` store, most
//! commonly a file (via a working path) or a [`SeekableMemoryBuffer`].
//!
//! Entries copied between zip archives are moved as raw compressed records
//! (`raw_copy_file_rename`), so the payload is never inflated and re-deflated and
//! the CRC, method and sizes survive unchanged.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};
use zip::read::ZipFile;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::{copy_entry, is_directory_name, ArchiveKind, ArchiveReader, ArchiveWriter, EntryState, WorkingFile};
use crate::buffer::SeekableMemoryBuffer;
use crate::error::{ArchiveError, Result};

/// Buffer placed between the zip encoder and the working file.
const FILE_WRITE_BUFFER: usize = 8 * 1024 * 1024;

/// Upper bound on the buffer reserved up front for an inflated entry.
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

/// Initial capacity of an in-memory zip.
const IN_MEMORY_INITIAL: usize = 8 * 1024 * 1024;

/// Entry size from which the classic 32-bit size fields no longer fit.
const ZIP64_THRESHOLD: u64 = u32::MAX as u64;

/// Whether an entry of `size` bytes must be written with Zip64 fields.
///
/// An unknown size (a streamed entry) always gets them: the encoder fails
/// once a non-Zip64 entry passes 4 GiB, and it cannot switch mid-entry.
pub(crate) fn needs_zip64(size: Option<u64>) -> bool {
    size.map_or(true, |size| size >= ZIP64_THRESHOLD)
}

/// How new zip entries are compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryCompression {
    #[default]
    Deflate,
    Store,
    Zstd,
}

impl EntryCompression {
    pub fn method(self) -> CompressionMethod {
        match self {
            EntryCompression::Deflate => CompressionMethod::Deflated,
            EntryCompression::Store => CompressionMethod::Stored,
            EntryCompression::Zstd => CompressionMethod::Zstd,
        }
    }

    /// Options for a new entry of `size` bytes, if known.
    pub(crate) fn file_options(self, size: Option<u64>) -> FileOptions {
        FileOptions::default()
            .compression_method(self.method())
            .large_file(needs_zip64(size))
    }
}

// --- Raw transfer ---

/// Header fields of a zip entry as stored, without decompressing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntryInfo {
    pub name: String,
    pub method: CompressionMethod,
    pub crc32: u32,
    pub compressed_size: u64,
    pub size: u64,
    pub extra_data: Vec<u8>,
    pub is_dir: bool,
}

impl RawEntryInfo {
    fn from_file(file: &ZipFile<'_>) -> Self {
        Self {
            name: file.name().to_string(),
            method: file.compression(),
            crc32: file.crc32(),
            compressed_size: file.compressed_size(),
            size: file.size(),
            extra_data: file.extra_data().to_vec(),
            is_dir: file.is_dir(),
        }
    }
}

/// A reader whose entries can be handed out as raw compressed records.
pub trait RawZipSource: Send + Sync {
    fn raw_entry(&self, name: &str) -> Result<RawEntryInfo>;

    /// Passes entry `source` to `sink` as a raw record to be stored under `dest`.
    fn copy_raw_entry(&self, source: &str, dest: &str, sink: &mut dyn RawEntrySink) -> Result<()>;
}

/// A writer that accepts raw compressed records.
pub trait RawEntrySink {
    fn write_raw_entry(&mut self, entry: ZipFile<'_>, dest: &str) -> Result<()>;
}

// --- Reader ---

struct ZipState<R> {
    archive: ZipArchive<R>,
    /// Most recently resolved entry.
    last: Option<(String, usize)>,
}

/// Reads entries from a zip archive.
///
/// Lookups remember the last resolved name, since callers typically ask
/// `has_entry` and then `input_stream` for the same entry.
pub struct ZipArchiveReader<R = BufReader<File>> {
    label: String,
    names: Vec<String>,
    index: HashMap<String, usize>,
    state: Mutex<ZipState<R>>,
}

impl ZipArchiveReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| ArchiveError::io(e, path))?;
        Self::from_reader(BufReader::new(file), path.display().to_string())
    }
}

impl ZipArchiveReader<SeekableMemoryBuffer> {
    /// Reads a zip held in memory. The buffer is rewound first.
    pub fn from_buffer(mut buffer: SeekableMemoryBuffer) -> Result<Self> {
        buffer.set_position(0)?;
        let label = format!("in-memory zip ({} bytes)", buffer.size());
        Self::from_reader(buffer, label)
    }
}

impl<R: Read + Seek> ZipArchiveReader<R> {
    pub fn from_reader(reader: R, label: impl Into<String>) -> Result<Self> {
        let mut archive = ZipArchive::new(reader)?;
        let mut names = Vec::with_capacity(archive.len());
        let mut index = HashMap::with_capacity(archive.len());
        for i in 0..archive.len() {
            let name = archive.by_index_raw(i)?.name().to_string();
            if index.insert(name.clone(), i).is_none() {
                names.push(name);
            }
        }
        let label = label.into();
        debug!(archive = %label, entries = names.len(), "opened zip archive");
        Ok(Self {
            label,
            names,
            index,
            state: Mutex::new(ZipState { archive, last: None }),
        })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ZipState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, state: &mut ZipState<R>, name: &str) -> Option<usize> {
        if let Some((last, idx)) = &state.last {
            if last == name {
                return Some(*idx);
            }
        }
        let idx = *self.index.get(name)?;
        state.last = Some((name.to_string(), idx));
        Some(idx)
    }
}

impl<R: Read + Seek + Send> ArchiveReader for ZipArchiveReader<R> {
    fn kind(&self) -> ArchiveKind {
        ArchiveKind::Zip
    }

    fn name(&self) -> String {
        self.label.clone()
    }

    fn has_entry(&self, name: &str) -> bool {
        let mut state = self.lock();
        self.resolve(&mut state, name).is_some()
    }

    fn input_stream(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        let mut state = self.lock();
        let idx = self.resolve(&mut state, name).ok_or_else(|| ArchiveError::not_found(name))?;
        let mut file = state.archive.by_index(idx)?;
        let mut data = SeekableMemoryBuffer::with_capacity(file.size().min(MAX_PREALLOCATION) as usize);
        io::copy(&mut file, &mut data)?;
        data.set_position(0)?;
        Ok(Box::new(data))
    }

    fn entry_names(&self) -> Box<dyn Iterator<Item = Result<String>> + Send + '_> {
        Box::new(self.names.iter().cloned().map(Ok))
    }

    fn as_raw_zip(&self) -> Option<&dyn RawZipSource> {
        Some(self)
    }

    fn close(&self) -> Result<()> {
        self.lock().last = None;
        Ok(())
    }
}

impl<R: Read + Seek + Send> RawZipSource for ZipArchiveReader<R> {
    fn raw_entry(&self, name: &str) -> Result<RawEntryInfo> {
        let mut state = self.lock();
        let idx = self.resolve(&mut state, name).ok_or_else(|| ArchiveError::not_found(name))?;
        let file = state.archive.by_index_raw(idx)?;
        Ok(RawEntryInfo::from_file(&file))
    }

    fn copy_raw_entry(&self, source: &str, dest: &str, sink: &mut dyn RawEntrySink) -> Result<()> {
        let mut state = self.lock();
        let idx = self.resolve(&mut state, source).ok_or_else(|| ArchiveError::not_found(source))?;
        let file = state.archive.by_index_raw(idx)?;
        sink.write_raw_entry(file, dest)
    }
}

// --- Writer ---

/// Stores a [`ZipArchiveWriter`] can write into.
pub trait ZipOutput: Write + Seek + Send + 'static {
    /// Opens the finished archive held by this store, if it can be read in place.
    fn reopen(&self) -> Option<Result<Arc<dyn ArchiveReader>>> {
        None
    }
}

impl ZipOutput for BufWriter<File> {}

impl ZipOutput for File {}

impl ZipOutput for SeekableMemoryBuffer {
    fn reopen(&self) -> Option<Result<Arc<dyn ArchiveReader>>> {
        Some(ZipArchiveReader::from_buffer(self.copy()).map(|r| Arc::new(r) as Arc<dyn ArchiveReader>))
    }
}

/// Writes a zip archive entry by entry.
pub struct ZipArchiveWriter<W: Write + Seek> {
    zip: Option<ZipWriter<W>>,
    state: EntryState,
    compression: EntryCompression,
    target: Option<WorkingFile>,
    finished: Option<W>,
    label: String,
    entries: u64,
}

impl ZipArchiveWriter<BufWriter<File>> {
    /// Writes to `<destination>.tmp` and renames it over `destination` on close.
    pub fn create(destination: impl AsRef<Path>, compression: EntryCompression) -> Result<Self> {
        Self::with_working_file(WorkingFile::for_destination(destination), compression)
    }

    /// Like [`ZipArchiveWriter::create`] with an explicit working path.
    pub fn create_with_working_path(
        destination: impl AsRef<Path>,
        working: impl AsRef<Path>,
        compression: EntryCompression,
    ) -> Result<Self> {
        Self::with_working_file(WorkingFile::new(destination, working), compression)
    }

    pub(crate) fn with_working_file(target: WorkingFile, compression: EntryCompression) -> Result<Self> {
        let file = target.create()?;
        let label = target.destination_path().display().to_string();
        let mut writer = Self::from_writer(BufWriter::with_capacity(FILE_WRITE_BUFFER, file), compression, label);
        writer.target = Some(target);
        Ok(writer)
    }
}

impl ZipArchiveWriter<SeekableMemoryBuffer> {
    pub fn in_memory(compression: EntryCompression) -> Self {
        Self::with_buffer(SeekableMemoryBuffer::with_capacity(IN_MEMORY_INITIAL), compression)
    }

    /// Writes into an existing buffer, which must not be closed by the zip encoder.
    pub fn with_buffer(mut buffer: SeekableMemoryBuffer, compression: EntryCompression) -> Self {
        buffer.set_closeable(false);
        let label = format!("in-memory zip ({compression:?})");
        Self::from_writer(buffer, compression, label)
    }

    /// Finishes the archive and reads it back without copying.
    pub fn into_reader(mut self) -> Result<ZipArchiveReader<SeekableMemoryBuffer>> {
        self.close()?;
        let buffer = self
            .finished
            .take()
            .ok_or_else(|| ArchiveError::protocol("in-memory zip has no finished buffer"))?;
        ZipArchiveReader::from_buffer(buffer)
    }
}

impl<W: ZipOutput> ZipArchiveWriter<W> {
    pub fn from_writer(inner: W, compression: EntryCompression, label: impl Into<String>) -> Self {
        Self {
            zip: Some(ZipWriter::new(inner)),
            state: EntryState::default(),
            compression,
            target: None,
            finished: None,
            label: label.into(),
            entries: 0,
        }
    }

    pub fn compression(&self) -> EntryCompression {
        self.compression
    }

    pub fn working_file(&self) -> Option<&WorkingFile> {
        self.target.as_ref()
    }

    /// Entries written so far, raw transfers included.
    pub fn entry_count(&self) -> u64 {
        self.entries
    }

    fn encoder(&mut self) -> Result<&mut ZipWriter<W>> {
        self.zip
            .as_mut()
            .ok_or_else(|| ArchiveError::protocol("zip writer is unusable after a failed close"))
    }

    /// Opens an entry; `size` is its uncompressed size when known up front.
    pub(crate) fn put_sized_entry(&mut self, name: &str, size: Option<u64>) -> Result<()> {
        self.state.begin(name)?;
        let size = if is_directory_name(name) { Some(0) } else { size };
        let options = self.compression.file_options(size);
        let started = self.start(name, options);
        if started.is_err() {
            self.state.abandon();
        }
        started
    }

    fn start(&mut self, name: &str, options: FileOptions) -> Result<()> {
        let zip = self.encoder()?;
        if is_directory_name(name) {
            zip.add_directory(name, options)?;
        } else {
            zip.start_file(name, options)?;
        }
        Ok(())
    }
}

impl<W: ZipOutput> ArchiveWriter for ZipArchiveWriter<W> {
    fn name(&self) -> String {
        self.label.clone()
    }

    /// Streamed entries have no size yet, so they are opened with Zip64 fields.
    fn put_next_entry(&mut self, name: &str) -> Result<()> {
        self.put_sized_entry(name, None)
    }

    fn output_stream(&mut self) -> Result<&mut dyn Write> {
        self.state.open_stream()?;
        Ok(self.encoder()? as &mut dyn Write)
    }

    fn close_entry(&mut self) -> Result<()> {
        let (name, opened) = self.state.finish()?;
        if opened {
            self.encoder()?.flush()?;
        }
        self.entries += 1;
        tracing::trace!(archive = %self.label, entry = %name, "closed zip entry");
        Ok(())
    }

    fn write_entry(&mut self, name: &str, data: &[u8]) -> Result<()> {
        if is_directory_name(name) && !data.is_empty() {
            return Err(ArchiveError::protocol(format!("directory entry '{name}' cannot hold data")));
        }
        self.put_sized_entry(name, Some(data.len() as u64))?;
        if !data.is_empty() {
            self.output_stream()?.write_all(data)?;
        }
        self.close_entry()
    }

    fn transfer_from(&mut self, reader: &Arc<dyn ArchiveReader>, source: &str, dest: &str) -> Result<()> {
        match reader.as_raw_zip() {
            Some(raw) => {
                self.state.ensure_idle("transfer_from")?;
                raw.copy_raw_entry(source, dest, self)
            }
            None => copy_entry(self, reader.as_ref(), source, dest),
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.state.is_closed() {
            return Ok(());
        }
        self.state.ensure_idle("close")?;
        let mut zip = self
            .zip
            .take()
            .ok_or_else(|| ArchiveError::protocol("zip writer is unusable after a failed close"))?;
        let mut inner = zip.finish()?;
        match &self.target {
            Some(target) => {
                inner.flush().map_err(|e| ArchiveError::io(e, target.working_path()))?;
                drop(inner);
                target.commit()?;
            }
            None => {
                inner.flush()?;
                self.finished = Some(inner);
            }
        }
        self.state.mark_closed();
        info!(archive = %self.label, entries = self.entries, "closed zip archive");
        Ok(())
    }

    fn completed_reader(&self) -> Result<Arc<dyn ArchiveReader>> {
        if !self.state.is_closed() {
            return Err(ArchiveError::protocol("completed_reader called before close"));
        }
        if let Some(target) = &self.target {
            return Ok(Arc::new(ZipArchiveReader::open(target.destination_path())?));
        }
        self.finished
            .as_ref()
            .and_then(|out| out.reopen())
            .unwrap_or_else(|| Err(ArchiveError::protocol(format!("{} cannot be reopened for reading", self.label))))
    }
}

impl<W: ZipOutput> RawEntrySink for ZipArchiveWriter<W> {
    fn write_raw_entry(&mut self, entry: ZipFile<'_>, dest: &str) -> Result<()> {
        self.state.ensure_idle("raw entry copy")?;
        self.encoder()?.raw_copy_file_rename(entry, dest)?;
        self.entries += 1;
        Ok(())
    }
}
