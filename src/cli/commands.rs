//! # Commands
//!
//! The operations behind each `archive-io` subcommand, kept free of printing so
//! they can be tested directly.

use std::fs::File;
use std::io;
use std::path::Path;

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::archive::directory::entry_name;
use crate::archive::{
    create_parallel_writer, create_writer, open_reader, output_kind, transfer_all, ArchiveKind, ArchiveWriter,
    DirectoryWriter, SEPARATOR,
};
use crate::error::{ArchiveError, Result};
use crate::parallel::{BlockingStats, ParallelOptions};

/// Outcome of a `pack` run.
#[derive(Debug, Clone)]
pub struct PackSummary {
    pub entries: u64,
    /// Whether the parallel zip writer was used.
    pub parallel: bool,
    pub stats: Option<BlockingStats>,
}

/// Packs `input` into `output`. Zip outputs use the parallel writer.
pub fn pack(input: &Path, output: &Path, options: ParallelOptions) -> Result<PackSummary> {
    if !input.is_dir() {
        return Err(ArchiveError::io(
            io::Error::new(io::ErrorKind::NotFound, "input is not a directory"),
            input,
        ));
    }
    if output_kind(output, None) == ArchiveKind::Zip {
        let mut writer = create_parallel_writer(output, options)?;
        let entries = pack_into(input, &mut writer)?;
        writer.close()?;
        info!(output = %output.display(), entries, peak = writer.peak_concurrent_compressions(), "packed");
        Ok(PackSummary { entries, parallel: true, stats: writer.blocking_stats() })
    } else {
        let mut writer = create_writer(output, None)?;
        let entries = pack_into(input, writer.as_mut())?;
        writer.close()?;
        info!(output = %output.display(), entries, "packed");
        Ok(PackSummary { entries, parallel: false, stats: None })
    }
}

/// Writes every directory and regular file below `root` into `writer`, in
/// file-name order. Does not close the writer.
pub fn pack_into(root: &Path, writer: &mut dyn ArchiveWriter) -> Result<u64> {
    let mut count = 0u64;
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let mut name = entry_name(root, entry.path())?;
        let file_type = entry.file_type();
        if file_type.is_dir() {
            name.push(SEPARATOR);
            writer.put_next_entry(&name)?;
            writer.close_entry()?;
        } else if file_type.is_file() {
            let mut file = File::open(entry.path()).map_err(|e| ArchiveError::io(e, entry.path()))?;
            writer.transfer_stream(&mut file, &name)?;
        } else {
            debug!(path = %entry.path().display(), "skipping special file");
            continue;
        }
        count += 1;
    }
    Ok(count)
}

/// Entry names of `archive`, in archive order.
pub fn list(archive: &Path) -> Result<Vec<String>> {
    open_reader(archive)?.entry_names().collect()
}

/// Extracts every entry of `archive` below `output`.
pub fn extract(archive: &Path, output: &Path) -> Result<u64> {
    let reader = open_reader(archive)?;
    let mut writer = DirectoryWriter::create(output)?;
    let count = transfer_all(&reader, &mut writer)?;
    writer.close()?;
    Ok(count)
}

/// Copies every entry of `source` into `dest`.
pub fn convert(source: &Path, dest: &Path) -> Result<u64> {
    let reader = open_reader(source)?;
    let mut writer = create_writer(dest, Some(reader.as_ref()))?;
    let count = transfer_all(&reader, writer.as_mut())?;
    writer.close()?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn sample_tree(root: &Path) {
        fs::create_dir_all(root.join("docs/empty")).unwrap();
        fs::write(root.join("a.txt"), b"hello").unwrap();
        fs::write(root.join("docs/readme.md"), b"# readme").unwrap();
    }

    #[test]
    fn pack_zip_in_parallel_and_list() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in");
        sample_tree(&input);
        let output = dir.path().join("out.zip");

        let summary = pack(&input, &output, ParallelOptions { track_blocking: true, ..ParallelOptions::with_threads(2) }).unwrap();
        assert!(summary.parallel);
        assert_eq!(summary.entries, 4);
        assert!(summary.stats.is_some());
        assert_eq!(list(&output).unwrap(), ["a.txt", "docs/", "docs/empty/", "docs/readme.md"]);
    }

    #[test]
    fn pack_tar_then_extract_and_convert() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in");
        sample_tree(&input);
        let tar = dir.path().join("out.tar");

        let summary = pack(&input, &tar, ParallelOptions::with_threads(1)).unwrap();
        assert!(!summary.parallel);

        let extracted = dir.path().join("extracted");
        assert_eq!(extract(&tar, &extracted).unwrap(), 4);
        assert_eq!(fs::read(extracted.join("docs/readme.md")).unwrap(), b"# readme");
        assert!(extracted.join("docs/empty").is_dir());

        let zip = dir.path().join("converted.zip");
        assert_eq!(convert(&tar, &zip).unwrap(), 4);
        assert_eq!(open_reader(&zip).unwrap().read_entry("a.txt").unwrap(), b"hello");
    }

    #[test]
    fn extract_refuses_entries_outside_the_output() {
        use crate::archive::{EntryCompression, ZipArchiveWriter};

        let dir = tempdir().unwrap();
        let zip = dir.path().join("evil.zip");
        let mut writer = ZipArchiveWriter::create(&zip, EntryCompression::Deflate).unwrap();
        writer.write_entry("../escaped.txt", b"gotcha").unwrap();
        writer.close().unwrap();

        let output = dir.path().join("out");
        let err = extract(&zip, &output).unwrap_err();
        assert!(matches!(err, ArchiveError::Protocol(_)), "{err}");
        assert!(!dir.path().join("escaped.txt").exists());
    }

    #[test]
    fn pack_requires_a_directory() {
        let dir = tempdir().unwrap();
        let err = pack(&dir.path().join("missing"), &dir.path().join("o.zip"), ParallelOptions::default()).unwrap_err();
        assert!(matches!(err, ArchiveError::Io { .. }));
    }
}
