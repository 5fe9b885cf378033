//! # Directory Backend
//!
//! Treats a directory tree as an archive: entry names are paths relative to the
//! root, joined with `/`.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};
use walkdir::WalkDir;

use super::{is_directory_name, ArchiveKind, ArchiveReader, ArchiveWriter, EntryState, SEPARATOR};
use crate::error::{ArchiveError, Result};

/// Converts a path under `root` into an entry name.
pub(crate) fn entry_name(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| ArchiveError::protocol(format!("{} is outside {}", path.display(), root.display())))?;
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

/// Joins entry `name` onto `root`.
///
/// Names may only descend: `..`, absolute paths and drive prefixes are
/// rejected, so no entry can resolve outside `root`.
pub(crate) fn resolve_under(root: &Path, name: &str) -> Result<PathBuf> {
    let mut path = root.to_path_buf();
    for component in Path::new(name.trim_end_matches(SEPARATOR)).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ArchiveError::protocol(format!(
                    "entry name '{name}' points outside {}",
                    root.display()
                )))
            }
        }
    }
    Ok(path)
}

/// Reads files from a directory tree.
#[derive(Debug)]
pub struct DirectoryReader {
    root: PathBuf,
    /// Most recently resolved entry.
    last: Mutex<Option<(String, PathBuf)>>,
}

impl DirectoryReader {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(ArchiveError::io(
                io::Error::new(io::ErrorKind::NotFound, "not a directory"),
                root,
            ));
        }
        Ok(Self { root, last: Mutex::new(None) })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((cached, path)) = last.as_ref() {
            if cached == name {
                return Ok(path.clone());
            }
        }
        let path = resolve_under(&self.root, name)?;
        *last = Some((name.to_string(), path.clone()));
        Ok(path)
    }
}

impl ArchiveReader for DirectoryReader {
    fn kind(&self) -> ArchiveKind {
        ArchiveKind::Directory
    }

    fn name(&self) -> String {
        self.root.display().to_string()
    }

    fn has_entry(&self, name: &str) -> bool {
        match self.resolve(name) {
            Ok(path) if is_directory_name(name) => path.is_dir(),
            Ok(path) => path.is_file(),
            Err(_) => false,
        }
    }

    fn input_stream(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.resolve(name)?;
        if is_directory_name(name) {
            return if path.is_dir() {
                Ok(Box::new(io::empty()))
            } else {
                Err(ArchiveError::not_found(name))
            };
        }
        match File::open(&path) {
            Ok(file) if file.metadata().map(|m| m.is_file()).unwrap_or(false) => Ok(Box::new(file)),
            Ok(_) => Err(ArchiveError::not_found(name)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ArchiveError::not_found(name)),
            Err(e) => Err(ArchiveError::io(e, path)),
        }
    }

    fn close(&self) -> Result<()> {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }

    /// Lists files (not directories) below the root in file-name order.
    fn entry_names(&self) -> Box<dyn Iterator<Item = Result<String>> + Send + '_> {
        let walker = WalkDir::new(&self.root).min_depth(1).sort_by_file_name().into_iter();
        Box::new(walker.filter_map(move |entry| match entry {
            Ok(e) if e.file_type().is_dir() => None,
            Ok(e) => Some(entry_name(&self.root, e.path())),
            Err(e) => Some(Err(e.into())),
        }))
    }
}

/// Writes entries as files under a root directory.
pub struct DirectoryWriter {
    root: PathBuf,
    state: EntryState,
    current: Option<PathBuf>,
    stream: Option<BufWriter<File>>,
    entries: u64,
}

impl DirectoryWriter {
    /// Creates the root (and missing parents) if needed.
    pub fn create(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if root.exists() {
            if !root.is_dir() {
                return Err(ArchiveError::io(
                    io::Error::new(io::ErrorKind::AlreadyExists, "exists and is not a directory"),
                    root,
                ));
            }
        } else {
            fs::create_dir_all(&root).map_err(|e| ArchiveError::io(e, &root))?;
        }
        debug!(root = %root.display(), "writing into directory");
        Ok(Self { root, state: EntryState::default(), current: None, stream: None, entries: 0 })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn prepare(&self, name: &str) -> Result<PathBuf> {
        let path = resolve_under(&self.root, name)?;
        if is_directory_name(name) {
            if path.exists() && !path.is_dir() {
                return Err(ArchiveError::io(
                    io::Error::new(io::ErrorKind::AlreadyExists, "exists and is not a directory"),
                    path,
                ));
            }
            fs::create_dir_all(&path).map_err(|e| ArchiveError::io(e, &path))?;
        } else if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ArchiveError::io(e, parent))?;
        }
        Ok(path)
    }
}

impl ArchiveWriter for DirectoryWriter {
    fn name(&self) -> String {
        self.root.display().to_string()
    }

    fn put_next_entry(&mut self, name: &str) -> Result<()> {
        self.state.begin(name)?;
        match self.prepare(name) {
            Ok(path) => {
                self.current = Some(path);
                Ok(())
            }
            Err(e) => {
                self.state.abandon();
                Err(e)
            }
        }
    }

    fn output_stream(&mut self) -> Result<&mut dyn Write> {
        self.state.open_stream()?;
        let path = self
            .current
            .as_ref()
            .ok_or_else(|| ArchiveError::protocol("no entry path prepared"))?;
        let file = File::create(path).map_err(|e| ArchiveError::io(e, path))?;
        Ok(self.stream.insert(BufWriter::new(file)))
    }

    fn close_entry(&mut self) -> Result<()> {
        let (name, _) = self.state.finish()?;
        let path = self.current.take().unwrap_or_default();
        match self.stream.take() {
            Some(mut stream) => stream.flush().map_err(|e| ArchiveError::io(e, &path))?,
            None if is_directory_name(&name) => {}
            None => {
                return Err(ArchiveError::protocol(format!(
                    "no output stream was requested for '{name}', which is not a directory (no trailing '{SEPARATOR}')"
                )))
            }
        }
        self.entries += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.state.is_closed() {
            return Ok(());
        }
        self.state.ensure_idle("close")?;
        self.state.mark_closed();
        info!(root = %self.root.display(), entries = self.entries, "closed directory output");
        Ok(())
    }

    fn completed_reader(&self) -> Result<Arc<dyn ArchiveReader>> {
        if !self.state.is_closed() {
            return Err(ArchiveError::protocol("completed_reader called before close"));
        }
        Ok(Arc::new(DirectoryReader::open(&self.root)?))
    }
}
