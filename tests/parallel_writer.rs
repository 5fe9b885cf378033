use archive_io::archive::{ZipArchiveReader, ZipArchiveWriter};
use archive_io::{
    open_reader, ArchiveError, ArchiveReader, ArchiveWriter, EntryCompression, ParallelArchiveWriter, ParallelOptions,
};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

/// Entries with a mix of sizes (including empty and multi-block ones) and
/// compressibility, so compression finishes out of submission order.
fn random_entries(count: usize, seed: u64) -> Vec<(String, Vec<u8>)> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|i| {
            let len = match rng.gen_range(0..4) {
                0 => 0,
                1 => rng.gen_range(1..2_000),
                2 => rng.gen_range(100_000..400_000),
                _ => rng.gen_range(1_000_000..3_000_000),
            };
            let mut data = vec![0u8; len];
            if rng.gen_bool(0.5) {
                rng.fill_bytes(&mut data);
            } else {
                data.iter_mut().enumerate().for_each(|(j, b)| *b = (j % 251) as u8);
            }
            (format!("entry-{i:03}.bin"), data)
        })
        .collect()
}

fn options(threads: usize, preserve_order: bool) -> ParallelOptions {
    ParallelOptions { threads, preserve_order, compression: EntryCompression::Deflate, track_blocking: true }
}

#[test]
fn preserve_order_writes_in_submission_order() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let path = dir.path().join("ordered.zip");
    let entries = random_entries(24, 0x5eed);

    let mut writer = ParallelArchiveWriter::create(&path, options(3, true))?;
    for (name, data) in &entries {
        writer.write_entry(name, data)?;
    }
    writer.close()?;
    assert_eq!(writer.workers_initialized(), 3);

    let reader = open_reader(&path)?;
    let names: Vec<String> = reader.entry_names().collect::<Result<_, _>>()?;
    let expected: Vec<String> = entries.iter().map(|(n, _)| n.clone()).collect();
    assert_eq!(names, expected);
    for (name, data) in &entries {
        assert_eq!(&reader.read_entry(name)?, data, "content of {name}");
    }
    Ok(())
}

#[test]
fn unordered_mode_writes_every_entry_exactly_once() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let path = dir.path().join("unordered.zip");
    let entries = random_entries(24, 0xface);

    let mut writer = ParallelArchiveWriter::create(&path, options(4, false))?;
    for (name, data) in &entries {
        writer.write_entry(name, data)?;
    }
    writer.close()?;

    let reader = open_reader(&path)?;
    let mut names: Vec<String> = reader.entry_names().collect::<Result<_, _>>()?;
    names.sort();
    let expected: BTreeMap<_, _> = entries.iter().map(|(n, d)| (n.clone(), d.clone())).collect();
    assert_eq!(names, expected.keys().cloned().collect::<Vec<_>>());
    for (name, data) in &expected {
        assert_eq!(&reader.read_entry(name)?, data, "content of {name}");
    }
    Ok(())
}

#[test]
fn concurrency_never_exceeds_thread_count() -> Result<(), Box<dyn std::error::Error>> {
    let mut writer = ParallelArchiveWriter::in_memory(options(2, true))?;
    let data: Vec<u8> = (0..1_500_000u32).map(|i| (i % 7) as u8).collect();
    for i in 0..12 {
        writer.write_entry(&format!("chunk-{i}.bin"), &data)?;
    }
    writer.close()?;
    let peak = writer.peak_concurrent_compressions();
    assert!((1..=2).contains(&peak), "peak was {peak}");
    assert!(writer.workers_initialized() <= 2);

    let stats = writer.blocking_stats().expect("tracking enabled");
    assert_eq!(stats.max_workers, 2);
    assert!(stats.to_string().contains("workers initialized"));
    Ok(())
}

#[test]
fn example_scenario_with_four_threads() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let path = dir.path().join("out.zip");
    let mut big = vec![0u8; 5 * 1024 * 1024];
    StdRng::seed_from_u64(42).fill_bytes(&mut big);

    let mut writer = ParallelArchiveWriter::create(&path, options(4, true))?;
    writer.put_next_entry("a.txt")?;
    writer.output_stream()?.write_all(b"hello")?;
    writer.close_entry()?;
    writer.put_next_entry("dir/")?;
    writer.close_entry()?;
    writer.put_next_entry("b.bin")?;
    writer.output_stream()?.write_all(&big)?;
    writer.close_entry()?;
    writer.close()?;

    assert!(!dir.path().join("out.zip.tmp").exists());
    let reader = open_reader(&path)?;
    let names: Vec<String> = reader.entry_names().collect::<Result<_, _>>()?;
    assert_eq!(names, ["a.txt", "dir/", "b.bin"]);
    assert!(reader.has_entry("dir/"));
    assert!(reader.read_entry("dir/")?.is_empty());
    assert_eq!(reader.read_entry("a.txt")?, b"hello");
    assert_eq!(reader.read_entry("b.bin")?, big);
    Ok(())
}

#[test]
fn failure_leaves_previous_destination_untouched() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let source_path = dir.path().join("source.zip");
    let mut source = ZipArchiveWriter::create(&source_path, EntryCompression::Deflate)?;
    source.write_entry("real.txt", b"real")?;
    source.close()?;
    let source = open_reader(&source_path)?;

    let dest = dir.path().join("dest.zip");
    fs::write(&dest, b"previous archive")?;

    let mut writer = ParallelArchiveWriter::create(&dest, options(2, true))?;
    writer.write_entry("first.txt", b"first")?;
    writer.transfer_from(&source, "real.txt", "copied.txt")?;
    // Raw transfers are resolved by the writer thread, so this only fails there.
    writer.transfer_from(&source, "ghost.txt", "ghost.txt")?;

    let mut aborted = false;
    for _ in 0..500 {
        match writer.write_entry("late.txt", b"late") {
            Err(ArchiveError::Aborted) => {
                aborted = true;
                break;
            }
            Ok(()) => thread::sleep(Duration::from_millis(10)),
            Err(e) => return Err(e.into()),
        }
    }
    assert!(aborted, "writer never reported the abort");

    let err = writer.close().unwrap_err();
    assert!(matches!(err, ArchiveError::NotFound { ref name } if name == "ghost.txt"), "{err}");
    assert!(matches!(writer.close(), Err(ArchiveError::Aborted)));
    assert!(writer.completed_reader().is_err());
    assert_eq!(fs::read(&dest)?, b"previous archive");
    Ok(())
}

#[test]
fn raw_transfer_into_parallel_writer_keeps_encoding() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let source_path = dir.path().join("zstd.zip");
    let payload = b"zstd compressed payload ".repeat(5000);
    let mut source = ZipArchiveWriter::create(&source_path, EntryCompression::Zstd)?;
    source.write_entry("z.txt", &payload)?;
    source.close()?;
    let source_zip = ZipArchiveReader::open(&source_path)?;
    let before = archive_io::archive::RawZipSource::raw_entry(&source_zip, "z.txt")?;
    let source: Arc<dyn ArchiveReader> = Arc::new(source_zip);

    let dest = dir.path().join("dest.zip");
    let mut writer = ParallelArchiveWriter::create(&dest, options(2, true))?;
    writer.transfer_from(&source, "z.txt", "moved/z.txt")?;
    writer.close()?;

    let copied = ZipArchiveReader::open(&dest)?;
    let after = archive_io::archive::RawZipSource::raw_entry(&copied, "moved/z.txt")?;
    assert_eq!(after.method, before.method);
    assert_eq!(after.crc32, before.crc32);
    assert_eq!(after.compressed_size, before.compressed_size);
    assert_eq!(after.size, payload.len() as u64);
    assert_eq!(copied.read_entry("moved/z.txt")?, payload);
    Ok(())
}

#[test]
fn transfer_from_non_zip_source_is_recompressed() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let tree = dir.path().join("tree");
    fs::create_dir_all(tree.join("sub"))?;
    fs::write(tree.join("sub/file.txt"), b"from a directory")?;
    let source = open_reader(&tree)?;

    let mut writer = ParallelArchiveWriter::in_memory(options(2, true))?;
    writer.transfer_from(&source, "sub/file.txt", "file.txt")?;
    let missing = writer.transfer_from(&source, "sub/nope.txt", "nope.txt");
    assert!(matches!(missing, Err(ArchiveError::NotFound { .. })));
    writer.write_entry("after.txt", b"still usable")?;
    writer.close()?;

    let reader = writer.completed_reader()?;
    assert_eq!(reader.read_entry("file.txt")?, b"from a directory");
    assert_eq!(reader.read_entry("after.txt")?, b"still usable");
    assert!(!reader.has_entry("nope.txt"));
    Ok(())
}

#[test]
fn missing_working_directory_fails_on_create() {
    let dir = tempdir().unwrap();
    let result = ParallelArchiveWriter::create_with_working_path(
        dir.path().join("out.zip"),
        dir.path().join("no-such-dir/out.zip.tmp"),
        options(1, true),
    );
    assert!(matches!(result, Err(ArchiveError::Io { .. })));
}
