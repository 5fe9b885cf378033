//! # Parallel Zip Writer
//!
//! Pipelines zip creation across three roles:
//!
//! 1. **Caller thread**: fills a [`CompressionWorker`] with one entry, then moves on.
//! 2. **Compression pool**: a `rayon` pool of `threads` threads compresses each worker's
//!    entry into a single-entry zip held in memory.
//! 3. **Writer thread**: the only thread that touches the output file. It receives
//!    completions over a `crossbeam` channel, raw-copies them into the archive (no
//!    recompression) and returns the workers to the idle channel.
//!
//! Only `threads` workers ever exist, so at most `threads` entries are in flight and
//! the caller blocks in [`ParallelArchiveWriter::put_next_entry`] once all of them are
//! busy. With `preserve_order` the writer thread holds early completions in a reorder
//! buffer until their predecessors have been written.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info, warn};

use crate::archive::{ArchiveReader, ArchiveWriter, EntryCompression, EntryState, WorkingFile, ZipArchiveWriter, ZipOutput};
use crate::buffer::SeekableMemoryBuffer;
use crate::error::{ArchiveError, Result};
use crate::worker::{CompressionWorker, Rejected};

/// Configuration for a [`ParallelArchiveWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelOptions {
    /// Compression threads, which is also the number of workers.
    pub threads: usize,
    /// Write entries in the order they were submitted.
    pub preserve_order: bool,
    pub compression: EntryCompression,
    /// Record time spent waiting for workers and for the final write.
    pub track_blocking: bool,
}

impl Default for ParallelOptions {
    fn default() -> Self {
        Self {
            threads: num_cpus::get(),
            preserve_order: true,
            compression: EntryCompression::Deflate,
            track_blocking: false,
        }
    }
}

impl ParallelOptions {
    pub fn with_threads(threads: usize) -> Self {
        Self { threads, ..Self::default() }
    }

    fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(ArchiveError::Config("parallel writer needs at least one thread".into()));
        }
        Ok(())
    }
}

/// Where the calling thread spent its time.
///
/// A blocked worker acquisition is split at the moment the awaited worker
/// finished compressing: before it the caller waited on compression, after it
/// on the writer thread. The final drain in `close()` counts as writing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockingStats {
    pub elapsed: Duration,
    /// Time blocked waiting for compression to finish.
    pub zip_wait: Duration,
    /// Time blocked waiting for the writer thread.
    pub write_wait: Duration,
    pub workers_initialized: usize,
    pub max_workers: usize,
}

impl BlockingStats {
    fn fraction(part: Duration, whole: Duration) -> f64 {
        if whole.is_zero() {
            0.0
        } else {
            part.as_secs_f64() / whole.as_secs_f64()
        }
    }

    pub fn zip_wait_fraction(&self) -> f64 {
        Self::fraction(self.zip_wait, self.elapsed)
    }

    pub fn write_wait_fraction(&self) -> f64 {
        Self::fraction(self.write_wait, self.elapsed)
    }
}

impl fmt::Display for BlockingStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.1}% blocking writes, {:.1}% blocking zips, {}/{} workers initialized",
            self.write_wait_fraction() * 100.0,
            self.zip_wait_fraction() * 100.0,
            self.workers_initialized,
            self.max_workers
        )
    }
}

/// Splits a wait from `started` to `ended` into (compression, writing) at
/// `ready_at`, when the awaited entry finished compressing.
fn split_wait(started: Instant, ready_at: Instant, ended: Instant) -> (Duration, Duration) {
    let total = ended.saturating_duration_since(started);
    let zipping = ready_at.saturating_duration_since(started).min(total);
    (zipping, total - zipping)
}

// --- Pipeline plumbing ---

/// Counts compression tasks running at once.
#[derive(Debug, Default)]
pub(crate) struct ConcurrencyGauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

pub(crate) struct GaugeGuard<'a>(&'a ConcurrencyGauge);

impl ConcurrencyGauge {
    pub(crate) fn enter(&self) -> GaugeGuard<'_> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        GaugeGuard(self)
    }

    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A finished (or failed) entry on its way to the writer thread.
pub(crate) struct Completed {
    seq: u64,
    worker: CompressionWorker,
    outcome: Result<()>,
    /// When compression ended (or was skipped).
    ready_at: Instant,
}

/// A drained worker travelling back to the caller.
struct Returned {
    worker: CompressionWorker,
    ready_at: Instant,
}

/// Runs before each compression with the entry name.
#[cfg(test)]
pub(crate) type CompressHook = Arc<dyn Fn(&str) -> Result<()> + Send + Sync>;

/// Routes filled workers either straight to the writer thread or through the pool.
pub(crate) struct Scheduler {
    pool: Arc<ThreadPool>,
    completions: Sender<Completed>,
    gauge: Arc<ConcurrencyGauge>,
    #[cfg(test)]
    hook: Option<CompressHook>,
}

impl Scheduler {
    pub(crate) fn complete(&self, seq: u64, worker: CompressionWorker, outcome: Result<()>) {
        let done = Completed { seq, worker, outcome, ready_at: Instant::now() };
        if self.completions.send(done).is_err() {
            warn!(seq, "archive writer thread is gone; dropping entry");
        }
    }

    pub(crate) fn compress(&self, seq: u64, mut worker: CompressionWorker) {
        let completions = self.completions.clone();
        let gauge = Arc::clone(&self.gauge);
        #[cfg(test)]
        let hook = self.hook.clone();
        self.pool.spawn(move || {
            let outcome = {
                let _running = gauge.enter();
                let task = AssertUnwindSafe(|| {
                    #[cfg(test)]
                    if let Some(hook) = &hook {
                        hook(worker.entry_name())?;
                    }
                    worker.compress()
                });
                match panic::catch_unwind(task) {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ArchiveError::WorkerPanicked { entry: worker.entry_name().to_string() }),
                }
            };
            let done = Completed { seq, worker, outcome, ready_at: Instant::now() };
            if completions.send(done).is_err() {
                warn!(seq, "archive writer thread is gone; dropping compressed entry");
            }
        });
    }
}

/// What the writer thread hands back when the completion channel closes.
struct Drained<W: ZipOutput> {
    writer: ZipArchiveWriter<W>,
    error: Option<ArchiveError>,
    written: u64,
}

struct WriterLoop<W: ZipOutput> {
    writer: ZipArchiveWriter<W>,
    idle: Sender<Returned>,
    aborted: Arc<AtomicBool>,
    preserve_order: bool,
    pending: BTreeMap<u64, Completed>,
    next_seq: u64,
    error: Option<ArchiveError>,
    written: u64,
}

impl<W: ZipOutput> WriterLoop<W> {
    fn run(mut self, completions: Receiver<Completed>) -> Drained<W> {
        while let Ok(done) = completions.recv() {
            self.pending.insert(done.seq, done);
            while let Ok(more) = completions.try_recv() {
                self.pending.insert(more.seq, more);
            }
            self.drain_ready();
        }
        // Every sender is gone, so nothing else will arrive.
        while let Some((_, done)) = self.pending.pop_first() {
            self.write(done);
        }
        Drained { writer: self.writer, error: self.error, written: self.written }
    }

    fn drain_ready(&mut self) {
        loop {
            let ready = if self.preserve_order {
                self.pending.remove(&self.next_seq)
            } else {
                // Earliest submission among those already finished.
                self.pending.pop_first().map(|(_, done)| done)
            };
            match ready {
                Some(done) => self.write(done),
                None => break,
            }
        }
    }

    fn write(&mut self, done: Completed) {
        let Completed { seq, mut worker, outcome, ready_at } = done;
        self.next_seq = self.next_seq.max(seq + 1);
        if self.error.is_none() {
            match outcome.and_then(|()| worker.write_to(&mut self.writer)) {
                Ok(()) => {
                    self.written += 1;
                    debug!(seq, entry = worker.entry_name(), worker = worker.id(), "wrote entry");
                }
                Err(e) => {
                    warn!(seq, entry = worker.entry_name(), error = %e, "aborting archive");
                    self.aborted.store(true, Ordering::SeqCst);
                    self.error = Some(e);
                }
            }
        } else {
            debug!(seq, entry = worker.entry_name(), "discarding entry after abort");
        }
        worker.reset();
        // The caller may already be gone; then the worker is simply dropped.
        let _ = self.idle.send(Returned { worker, ready_at });
    }
}

// --- Writer ---

/// A zip writer that compresses entries on a thread pool.
///
/// Implements [`ArchiveWriter`]; entries are raw-copied into an underlying
/// [`ZipArchiveWriter`] owned by a dedicated writer thread.
pub struct ParallelArchiveWriter<W: ZipOutput> {
    options: ParallelOptions,
    label: String,
    state: EntryState,
    current: Option<CompressionWorker>,
    spare: Vec<CompressionWorker>,
    created: usize,
    next_seq: u64,
    pool: Arc<ThreadPool>,
    scheduler: Option<Scheduler>,
    idle: Receiver<Returned>,
    aborted: Arc<AtomicBool>,
    gauge: Arc<ConcurrencyGauge>,
    writer_thread: Option<JoinHandle<Drained<W>>>,
    finished: Option<ZipArchiveWriter<W>>,
    started: Instant,
    elapsed: Option<Duration>,
    zip_wait: Duration,
    write_wait: Duration,
}

impl ParallelArchiveWriter<BufWriter<File>> {
    /// Writes to `<destination>.tmp` and renames it over `destination` on close.
    pub fn create(destination: impl AsRef<Path>, options: ParallelOptions) -> Result<Self> {
        options.validate()?;
        let writer = ZipArchiveWriter::with_working_file(WorkingFile::for_destination(destination), options.compression)?;
        Self::from_zip_writer(writer, options)
    }

    pub fn create_with_working_path(
        destination: impl AsRef<Path>,
        working: impl AsRef<Path>,
        options: ParallelOptions,
    ) -> Result<Self> {
        options.validate()?;
        let writer = ZipArchiveWriter::with_working_file(WorkingFile::new(destination, working), options.compression)?;
        Self::from_zip_writer(writer, options)
    }
}

impl ParallelArchiveWriter<SeekableMemoryBuffer> {
    pub fn in_memory(options: ParallelOptions) -> Result<Self> {
        Self::from_zip_writer(ZipArchiveWriter::in_memory(options.compression), options)
    }
}

impl<W: ZipOutput> ParallelArchiveWriter<W> {
    /// Starts the pool and the writer thread around `writer`.
    pub fn from_zip_writer(writer: ZipArchiveWriter<W>, options: ParallelOptions) -> Result<Self> {
        options.validate()?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(options.threads)
            .thread_name(|i| format!("archive-compress-{i}"))
            .build()
            .map_err(|e| ArchiveError::Config(format!("failed to build compression pool: {e}")))?;
        let pool = Arc::new(pool);

        let (completions_tx, completions_rx) = bounded::<Completed>(options.threads);
        let (idle_tx, idle_rx) = bounded::<Returned>(options.threads);
        let aborted = Arc::new(AtomicBool::new(false));
        let gauge = Arc::new(ConcurrencyGauge::default());
        let label = writer.name();

        let writer_loop = WriterLoop {
            writer,
            idle: idle_tx,
            aborted: Arc::clone(&aborted),
            preserve_order: options.preserve_order,
            pending: BTreeMap::new(),
            next_seq: 0,
            error: None,
            written: 0,
        };
        let writer_thread = thread::Builder::new()
            .name("archive-writer".into())
            .spawn(move || writer_loop.run(completions_rx))?;

        debug!(archive = %label, threads = options.threads, preserve_order = options.preserve_order, "started parallel zip writer");
        Ok(Self {
            options,
            label,
            state: EntryState::default(),
            current: None,
            spare: Vec::new(),
            created: 0,
            next_seq: 0,
            scheduler: Some(Scheduler {
                pool: Arc::clone(&pool),
                completions: completions_tx,
                gauge: Arc::clone(&gauge),
                #[cfg(test)]
                hook: None,
            }),
            pool,
            idle: idle_rx,
            aborted,
            gauge,
            writer_thread: Some(writer_thread),
            finished: None,
            started: Instant::now(),
            elapsed: None,
            zip_wait: Duration::ZERO,
            write_wait: Duration::ZERO,
        })
    }

    pub fn options(&self) -> &ParallelOptions {
        &self.options
    }

    /// Workers created so far (never more than `threads`).
    pub fn workers_initialized(&self) -> usize {
        self.created
    }

    /// Highest number of compression tasks seen running at the same time.
    pub fn peak_concurrent_compressions(&self) -> usize {
        self.gauge.peak()
    }

    /// Blocking statistics, when `track_blocking` is enabled.
    pub fn blocking_stats(&self) -> Option<BlockingStats> {
        self.options.track_blocking.then(|| BlockingStats {
            elapsed: self.elapsed.unwrap_or_else(|| self.started.elapsed()),
            zip_wait: self.zip_wait,
            write_wait: self.write_wait,
            workers_initialized: self.created,
            max_workers: self.options.threads,
        })
    }

    fn check_aborted(&self) -> Result<()> {
        if self.aborted.load(Ordering::SeqCst) {
            Err(ArchiveError::Aborted)
        } else {
            Ok(())
        }
    }

    fn scheduler(&self) -> Result<&Scheduler> {
        self.scheduler
            .as_ref()
            .ok_or_else(|| ArchiveError::protocol("archive has already been closed"))
    }

    /// Reclaims a returned worker, creates one while under the limit, or waits.
    ///
    /// The abort flag is checked again once a worker is in hand, since the
    /// writer thread raises it before returning the worker that failed.
    fn acquire(&mut self) -> Result<CompressionWorker> {
        self.check_aborted()?;
        let reclaimed = self.spare.pop().or_else(|| self.idle.try_recv().ok().map(|returned| returned.worker));
        let worker = match reclaimed {
            Some(worker) => worker,
            None if self.created < self.options.threads => {
                self.created += 1;
                debug!(archive = %self.label, worker = self.created - 1, "initializing worker");
                return Ok(CompressionWorker::new(self.created - 1, self.options.compression));
            }
            None => {
                let waiting = Instant::now();
                let Returned { worker, ready_at } = self.idle.recv().map_err(|_| ArchiveError::WriterThread)?;
                if self.options.track_blocking {
                    let (zipping, writing) = split_wait(waiting, ready_at, Instant::now());
                    self.zip_wait += zipping;
                    self.write_wait += writing;
                }
                worker
            }
        };
        if let Err(e) = self.check_aborted() {
            self.spare.push(worker);
            return Err(e);
        }
        Ok(worker)
    }

    #[cfg(test)]
    pub(crate) fn set_compress_hook(&mut self, hook: CompressHook) {
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.hook = Some(hook);
        }
    }
}

impl<W: ZipOutput> ArchiveWriter for ParallelArchiveWriter<W> {
    fn name(&self) -> String {
        self.label.clone()
    }

    fn put_next_entry(&mut self, name: &str) -> Result<()> {
        self.state.begin(name)?;
        match self.acquire() {
            Ok(mut worker) => {
                worker.put_next_entry(name);
                self.current = Some(worker);
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
        let worker = self
            .current
            .as_mut()
            .ok_or_else(|| ArchiveError::protocol("no worker holds the open entry"))?;
        Ok(worker.output_stream())
    }

    fn close_entry(&mut self) -> Result<()> {
        self.state.finish()?;
        let worker = self
            .current
            .take()
            .ok_or_else(|| ArchiveError::protocol("no worker holds the open entry"))?;
        let seq = self.next_seq;
        self.next_seq += 1;
        worker.close_entry(seq, self.scheduler()?);
        Ok(())
    }

    fn transfer_from(&mut self, reader: &Arc<dyn ArchiveReader>, source: &str, dest: &str) -> Result<()> {
        self.state.ensure_idle("transfer_from")?;
        let worker = self.acquire()?;
        let seq = self.next_seq;
        let queued = match self.scheduler.as_ref() {
            Some(scheduler) => worker.transfer_from(reader, source, dest, seq, scheduler),
            None => Err(Rejected { worker, error: ArchiveError::protocol("archive has already been closed") }),
        };
        match queued {
            Ok(()) => {
                self.next_seq += 1;
                Ok(())
            }
            Err(Rejected { worker, error }) => {
                self.spare.push(worker);
                Err(error)
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.state.is_closed() {
            return if self.finished.is_some() { Ok(()) } else { Err(ArchiveError::Aborted) };
        }
        self.state.ensure_idle("close")?;
        self.state.mark_closed();

        // In-flight tasks hold the remaining senders; the writer thread exits
        // once the last of them has delivered its completion.
        drop(self.scheduler.take());
        let handle = self.writer_thread.take().ok_or(ArchiveError::WriterThread)?;
        let waiting = Instant::now();
        let drained = handle.join().map_err(|_| ArchiveError::WriterThread)?;
        if self.options.track_blocking {
            self.write_wait += waiting.elapsed();
        }
        self.elapsed = Some(self.started.elapsed());
        self.spare.clear();

        if let Some(error) = drained.error {
            warn!(archive = %self.label, error = %error, "parallel zip failed; destination left untouched");
            return Err(error);
        }
        let mut writer = drained.writer;
        writer.close()?;
        match self.blocking_stats() {
            Some(stats) => info!(archive = %self.label, entries = drained.written, %stats, "closed parallel zip"),
            None => info!(archive = %self.label, entries = drained.written, "closed parallel zip"),
        }
        debug!(threads = self.pool.current_num_threads(), peak = self.gauge.peak(), "compression pool summary");
        self.finished = Some(writer);
        Ok(())
    }

    fn completed_reader(&self) -> Result<Arc<dyn ArchiveReader>> {
        self.finished
            .as_ref()
            .ok_or_else(|| ArchiveError::protocol("completed_reader called before a successful close"))?
            .completed_reader()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use std::collections::HashMap;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn options(threads: usize) -> ParallelOptions {
        ParallelOptions { threads, preserve_order: true, compression: EntryCompression::Deflate, track_blocking: true }
    }

    #[test]
    fn zero_threads_is_rejected() {
        let result = ParallelArchiveWriter::in_memory(options(0));
        assert!(matches!(result, Err(ArchiveError::Config(_))));
    }

    #[test]
    fn in_memory_round_trip() {
        let mut writer = ParallelArchiveWriter::in_memory(options(2)).unwrap();
        writer.write_entry("one.txt", b"first").unwrap();
        writer.write_entry("dir/", b"").unwrap();
        writer.write_entry("empty.txt", b"").unwrap();
        writer.write_entry("two.txt", &b"second ".repeat(1000)).unwrap();
        writer.close().unwrap();

        let reader = writer.completed_reader().unwrap();
        let names: Vec<String> = reader.entry_names().map(|n| n.unwrap()).collect();
        assert_eq!(names, ["one.txt", "dir/", "empty.txt", "two.txt"]);
        assert_eq!(reader.read_entry("two.txt").unwrap(), b"second ".repeat(1000));
        assert_eq!(reader.read_entry("empty.txt").unwrap(), b"");
        assert!(writer.workers_initialized() <= 2);
    }

    #[test]
    fn protocol_errors() {
        let mut writer = ParallelArchiveWriter::in_memory(options(1)).unwrap();
        assert!(matches!(writer.output_stream(), Err(ArchiveError::Protocol(_))));
        assert!(matches!(writer.close_entry(), Err(ArchiveError::Protocol(_))));
        assert!(matches!(writer.completed_reader(), Err(ArchiveError::Protocol(_))));
        writer.put_next_entry("a").unwrap();
        assert!(matches!(writer.put_next_entry("b"), Err(ArchiveError::Protocol(_))));
        writer.output_stream().unwrap();
        assert!(matches!(writer.output_stream(), Err(ArchiveError::Protocol(_))));
        assert!(matches!(writer.close(), Err(ArchiveError::Protocol(_))));
        writer.close_entry().unwrap();
        writer.close().unwrap();
        writer.close().unwrap();
        assert!(matches!(writer.put_next_entry("c"), Err(ArchiveError::Protocol(_))));
    }

    #[test]
    fn stats_display_mentions_workers() {
        let stats = BlockingStats {
            elapsed: Duration::from_secs(10),
            zip_wait: Duration::from_secs(1),
            write_wait: Duration::from_secs(5),
            workers_initialized: 3,
            max_workers: 4,
        };
        assert!((stats.write_wait_fraction() - 0.5).abs() < 1e-9);
        assert_eq!(stats.to_string(), "50.0% blocking writes, 10.0% blocking zips, 3/4 workers initialized");
    }

    #[test]
    fn blocked_time_is_split_at_compression_end() {
        let start = Instant::now();
        let end = start + Duration::from_millis(100);
        let ms = Duration::from_millis;
        assert_eq!(split_wait(start, start + ms(30), end), (ms(30), ms(70)));
        // Compressed before the wait began: the writer was the bottleneck.
        assert_eq!(split_wait(start + ms(10), start, end), (Duration::ZERO, ms(90)));
        // Clamped to the wait itself.
        assert_eq!(split_wait(start, end + ms(5), end), (ms(100), Duration::ZERO));
    }

    #[test]
    fn slow_compression_is_booked_as_zip_wait() {
        let mut writer = ParallelArchiveWriter::in_memory(options(1)).unwrap();
        let hook: CompressHook = Arc::new(|_: &str| {
            thread::sleep(Duration::from_millis(40));
            Ok(())
        });
        writer.set_compress_hook(hook);
        for i in 0..3 {
            writer.write_entry(&format!("slow-{i}.txt"), b"slow to compress").unwrap();
        }
        writer.close().unwrap();
        let stats = writer.blocking_stats().unwrap();
        assert!(stats.zip_wait >= Duration::from_millis(50), "{stats:?}");
        assert!(stats.zip_wait + stats.write_wait <= stats.elapsed, "{stats:?}");
    }

    /// Writes `count` entries whose compression is delayed by a shuffled
    /// amount, with the first entry finishing long after the second.
    /// Returns the written names and the order compression finished in.
    fn write_with_latency(preserve_order: bool, count: usize) -> (Vec<String>, Vec<String>) {
        let mut delays: Vec<u64> = (0..count as u64).map(|i| i * 4).collect();
        delays.shuffle(&mut StdRng::seed_from_u64(0xde1a7));
        delays[0] = 150;
        delays[1] = 0;
        let by_name: HashMap<String, u64> =
            delays.iter().enumerate().map(|(i, d)| (format!("e-{i:02}"), *d)).collect();
        let finished = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&finished);
        let hook: CompressHook = Arc::new(move |name: &str| {
            thread::sleep(Duration::from_millis(by_name.get(name).copied().unwrap_or(0)));
            log.lock().unwrap().push(name.to_string());
            Ok(())
        });

        let mut writer =
            ParallelArchiveWriter::in_memory(ParallelOptions { preserve_order, ..options(4) }).unwrap();
        writer.set_compress_hook(hook);
        for i in 0..count {
            writer.write_entry(&format!("e-{i:02}"), format!("payload {i} ").repeat(200).as_bytes()).unwrap();
        }
        writer.close().unwrap();
        assert!(writer.peak_concurrent_compressions() <= 4);

        let reader = writer.completed_reader().unwrap();
        let names: Vec<String> = reader.entry_names().map(|n| n.unwrap()).collect();
        for (i, name) in names.iter().enumerate() {
            let expected = format!("payload {} ", &name[2..].parse::<usize>().unwrap()).repeat(200);
            assert_eq!(reader.read_entry(name).unwrap(), expected.as_bytes(), "entry {i}");
        }
        let order = finished.lock().unwrap().clone();
        (names, order)
    }

    #[test]
    fn preserve_order_holds_under_shuffled_latency() {
        let (names, finished) = write_with_latency(true, 16);
        let submitted: Vec<String> = (0..16).map(|i| format!("e-{i:02}")).collect();
        assert_ne!(finished, submitted, "compression finished in order; nothing was reordered");
        assert_eq!(names, submitted);
    }

    #[test]
    fn unordered_mode_writes_in_completion_order() {
        let (mut names, _) = write_with_latency(false, 16);
        assert_ne!(names[0], "e-00");
        names.sort();
        let submitted: Vec<String> = (0..16).map(|i| format!("e-{i:02}")).collect();
        assert_eq!(names, submitted);
    }

    #[test]
    fn compression_error_aborts_the_archive() {
        let mut writer = ParallelArchiveWriter::in_memory(options(1)).unwrap();
        let hook: CompressHook = Arc::new(|name: &str| {
            if name == "bad.bin" {
                Err(ArchiveError::protocol("injected compression failure"))
            } else {
                Ok(())
            }
        });
        writer.set_compress_hook(hook);
        writer.write_entry("good.bin", b"good").unwrap();
        writer.write_entry("bad.bin", b"bad").unwrap();
        // The single worker only comes back after bad.bin has been drained.
        assert!(matches!(writer.write_entry("after.bin", b"after"), Err(ArchiveError::Aborted)));

        let err = writer.close().unwrap_err();
        assert!(matches!(err, ArchiveError::Protocol(ref msg) if msg.contains("injected")), "{err}");
        assert!(matches!(writer.close(), Err(ArchiveError::Aborted)));
    }

    #[test]
    fn panic_on_last_entry_leaves_destination_untouched() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.zip");
        fs::write(&dest, b"previous archive").unwrap();

        let mut writer = ParallelArchiveWriter::create(&dest, options(2)).unwrap();
        let hook: CompressHook = Arc::new(|name: &str| {
            if name == "last.bin" {
                panic!("compression blew up on {name}");
            }
            Ok(())
        });
        writer.set_compress_hook(hook);
        for i in 0..6u8 {
            writer.write_entry(&format!("entry-{i}.bin"), &[i; 4096]).unwrap();
        }
        writer.write_entry("last.bin", &[0xff; 4096]).unwrap();

        let err = writer.close().unwrap_err();
        assert!(matches!(err, ArchiveError::WorkerPanicked { ref entry } if entry == "last.bin"), "{err}");
        assert!(matches!(writer.close(), Err(ArchiveError::Aborted)));
        assert!(writer.completed_reader().is_err());
        assert_eq!(fs::read(&dest).unwrap(), b"previous archive");
    }

    #[test]
    fn gauge_tracks_peak() {
        let gauge = ConcurrencyGauge::default();
        {
            let _a = gauge.enter();
            let _b = gauge.enter();
        }
        let _c = gauge.enter();
        assert_eq!(gauge.peak(), 2);
    }
}
