//! # Tar Backend
//!
//! Uncompressed tar archives. Tar headers carry the entry size up front, so each
//! file entry is staged in a reusable [`SeekableMemoryBuffer`] and appended when
//! the entry is closed.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tar::{Archive, Builder, EntryType, Header};
use tracing::{debug, info};

use super::{is_directory_name, ArchiveKind, ArchiveReader, ArchiveWriter, EntryState, WorkingFile, SEPARATOR};
use crate::buffer::SeekableMemoryBuffer;
use crate::error::{ArchiveError, Result};

const STAGING_CAPACITY: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy)]
struct TarEntry {
    offset: u64,
    size: u64,
    is_dir: bool,
}

/// Reads entries from a tar file.
///
/// The archive is indexed once on open; each `input_stream` opens its own file
/// handle positioned at the entry data.
#[derive(Debug)]
pub struct TarArchiveReader {
    path: PathBuf,
    order: Vec<String>,
    index: HashMap<String, TarEntry>,
}

impl TarArchiveReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| ArchiveError::io(e, &path))?;
        let mut archive = Archive::new(BufReader::new(file));

        let mut order = Vec::new();
        let mut index = HashMap::new();
        for entry in archive.entries().map_err(|e| ArchiveError::io(e, &path))? {
            let entry = entry.map_err(|e| ArchiveError::io(e, &path))?;
            let entry_type = entry.header().entry_type();
            let is_dir = entry_type.is_dir();
            if !is_dir && !entry_type.is_file() {
                continue;
            }
            let mut name = entry
                .path()
                .map_err(|e| ArchiveError::io(e, &path))?
                .to_string_lossy()
                .replace('\\', "/");
            if is_dir && !name.ends_with(SEPARATOR) {
                name.push(SEPARATOR);
            }
            let record = TarEntry { offset: entry.raw_file_position(), size: entry.size(), is_dir };
            if index.insert(name.clone(), record).is_none() {
                order.push(name);
            }
        }
        debug!(archive = %path.display(), entries = order.len(), "indexed tar archive");
        Ok(Self { path, order, index })
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl ArchiveReader for TarArchiveReader {
    fn kind(&self) -> ArchiveKind {
        ArchiveKind::Tar
    }

    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn has_entry(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    fn input_stream(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        let entry = *self.index.get(name).ok_or_else(|| ArchiveError::not_found(name))?;
        if entry.is_dir {
            return Ok(Box::new(io::empty()));
        }
        let mut file = File::open(&self.path).map_err(|e| ArchiveError::io(e, &self.path))?;
        file.seek(SeekFrom::Start(entry.offset))
            .map_err(|e| ArchiveError::io(e, &self.path))?;
        Ok(Box::new(BufReader::new(file).take(entry.size)))
    }

    fn entry_names(&self) -> Box<dyn Iterator<Item = Result<String>> + Send + '_> {
        Box::new(self.order.iter().cloned().map(Ok))
    }
}

/// Writes an uncompressed tar archive.
pub struct TarArchiveWriter<W: Write = BufWriter<File>> {
    builder: Option<Builder<W>>,
    state: EntryState,
    staging: SeekableMemoryBuffer,
    target: Option<WorkingFile>,
    label: String,
    entries: u64,
}

impl TarArchiveWriter<BufWriter<File>> {
    /// Writes to `<destination>.tmp` and renames it over `destination` on close.
    pub fn create(destination: impl AsRef<Path>) -> Result<Self> {
        Self::with_working_file(WorkingFile::for_destination(destination))
    }

    pub fn create_with_working_path(destination: impl AsRef<Path>, working: impl AsRef<Path>) -> Result<Self> {
        Self::with_working_file(WorkingFile::new(destination, working))
    }

    fn with_working_file(target: WorkingFile) -> Result<Self> {
        let file = target.create()?;
        let label = target.destination_path().display().to_string();
        let mut writer = Self::from_writer(BufWriter::new(file), label);
        writer.target = Some(target);
        Ok(writer)
    }
}

impl<W: Write + Send> TarArchiveWriter<W> {
    /// Writes to an arbitrary stream. Such a writer has no completed reader.
    pub fn from_writer(inner: W, label: impl Into<String>) -> Self {
        let mut staging = SeekableMemoryBuffer::with_capacity(STAGING_CAPACITY);
        staging.set_closeable(false);
        Self {
            builder: Some(Builder::new(inner)),
            state: EntryState::default(),
            staging,
            target: None,
            label: label.into(),
            entries: 0,
        }
    }

    fn builder(&mut self) -> Result<&mut Builder<W>> {
        self.builder
            .as_mut()
            .ok_or_else(|| ArchiveError::protocol("tar writer is unusable after a failed close"))
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl<W: Write + Send> ArchiveWriter for TarArchiveWriter<W> {
    fn name(&self) -> String {
        self.label.clone()
    }

    fn put_next_entry(&mut self, name: &str) -> Result<()> {
        self.state.begin(name)?;
        self.staging.truncate(0);
        Ok(())
    }

    fn output_stream(&mut self) -> Result<&mut dyn Write> {
        self.state.open_stream()?;
        Ok(&mut self.staging)
    }

    fn close_entry(&mut self) -> Result<()> {
        let (name, opened) = self.state.finish()?;
        let mut header = Header::new_gnu();
        header.set_mtime(now_secs());
        if is_directory_name(&name) {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            header.set_mode(0o755);
            self.builder()?.append_data(&mut header, &name, io::empty())?;
        } else if !opened {
            return Err(ArchiveError::protocol(format!(
                "no output stream was requested for '{name}', which is not a directory (no trailing '{SEPARATOR}')"
            )));
        } else {
            header.set_entry_type(EntryType::Regular);
            header.set_size(self.staging.size());
            header.set_mode(0o644);
            self.staging.set_position(0)?;
            let builder = self
                .builder
                .as_mut()
                .ok_or_else(|| ArchiveError::protocol("tar writer is unusable after a failed close"))?;
            builder.append_data(&mut header, &name, &mut self.staging)?;
        }
        self.entries += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.state.is_closed() {
            return Ok(());
        }
        self.state.ensure_idle("close")?;
        let builder = self
            .builder
            .take()
            .ok_or_else(|| ArchiveError::protocol("tar writer is unusable after a failed close"))?;
        let mut inner = builder.into_inner()?;
        inner.flush()?;
        drop(inner);
        if let Some(target) = &self.target {
            target.commit()?;
        }
        self.state.mark_closed();
        info!(archive = %self.label, entries = self.entries, "closed tar archive");
        Ok(())
    }

    fn completed_reader(&self) -> Result<Arc<dyn ArchiveReader>> {
        if !self.state.is_closed() {
            return Err(ArchiveError::protocol("completed_reader called before close"));
        }
        match &self.target {
            Some(target) => Ok(Arc::new(TarArchiveReader::open(target.destination_path())?)),
            None => Err(ArchiveError::protocol(format!("{} cannot be reopened for reading", self.label))),
        }
    }
}
