//! Asynchronous event logger: multi-producer, single-consumer, timestamped
//! binary log with batched compression.
//!
//! Producers clone a [`LogHandle`] and submit [`LogPackage`]s; a single
//! background worker drains the bounded queue and appends per-source staging
//! files in submission order. After [`EventLogger::stop`], the staging files
//! compress into one archive per rig (see [`archive`]) with an integrity
//! index that [`compress_logs`](EventLogger::compress_logs) can re-verify.
//!
//! The first entry submitted for every source must be the onset stamp
//! (`time_stamp_us == 0`, payload = UTC microseconds); extraction depends on
//! it to anchor all later offsets.

pub mod archive;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use thiserror::Error;

use crate::archive::{compress_stream, scan_records, write_archive, Archive};

pub use crate::archive::{LogEntry, SourceIndex, ARCHIVE_EXT};

pub type LogResult<T> = Result<T, LogError>;

/// Source id reserved for process-wide onset bookkeeping; never assigned to
/// a controller.
pub const RESERVED_SOURCE: u8 = 0;
/// Source id reserved for the orchestrator's out-of-band annotations.
pub const ANNOTATION_SOURCE: u8 = 1;
/// Lowest source id a controller may claim.
pub const FIRST_CONTROLLER_SOURCE: u8 = 2;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("logger is stopped; submission refused")]
    Stopped,

    #[error("logger worker is not running")]
    NotRunning,

    #[error("logs can only be compressed after the logger is stopped")]
    StillRunning,

    #[error("archive integrity check failed: {0}")]
    Integrity(String),

    #[error("malformed log data for source {source_id}: {reason}")]
    Malformed { source_id: u8, reason: String },

    #[error("log i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

/// A timestamped byte blob bound for the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPackage {
    pub source_id: u8,
    pub time_stamp_us: u64,
    pub serialized_data: Vec<u8>,
}

impl LogPackage {
    /// The onset stamp a source must submit before any other entry.
    pub fn onset(source_id: u8) -> Self {
        Self {
            source_id,
            time_stamp_us: 0,
            serialized_data: timekit::utc_onset_bytes().to_vec(),
        }
    }
}

/// Logger construction parameters.
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Directory receiving staging files and the final archive.
    pub directory: PathBuf,
    /// Archive stem; the archive lands at `<stem>_log.slx`.
    pub archive_stem: String,
    /// Bounded queue capacity; producers block when it fills.
    pub queue_capacity: usize,
    /// Threads used to compress source streams in parallel.
    pub compression_threads: usize,
}

impl LoggerConfig {
    pub fn new(directory: impl Into<PathBuf>, archive_stem: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            archive_stem: archive_stem.into(),
            queue_capacity: 4096,
            compression_threads: 2,
        }
    }

    fn archive_path(&self) -> PathBuf {
        self.directory
            .join(format!("{}_log.{ARCHIVE_EXT}", self.archive_stem))
    }
}

enum QueueItem {
    Entry(LogPackage),
    Shutdown,
}

/// Cloneable producer handle.
#[derive(Clone)]
pub struct LogHandle {
    sender: Sender<QueueItem>,
    stopped: Arc<AtomicBool>,
}

impl LogHandle {
    /// True once the owning logger has stopped accepting submissions.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Appends a package. Blocks while the queue is full rather than
    /// dropping: acquisition prefers delay over data loss.
    pub fn submit(&self, package: LogPackage) -> LogResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(LogError::Stopped);
        }
        self.sender
            .send(QueueItem::Entry(package))
            .map_err(|_| LogError::Stopped)
    }

    /// Non-blocking submission attempt; the communication worker uses this
    /// before falling back to a blocking [`submit`](Self::submit).
    pub fn try_submit(&self, package: LogPackage) -> Result<(), LogPackage> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(package);
        }
        match self.sender.try_send(QueueItem::Entry(package)) {
            Ok(()) => Ok(()),
            Err(crossbeam_channel::TrySendError::Full(QueueItem::Entry(p)))
            | Err(crossbeam_channel::TrySendError::Disconnected(QueueItem::Entry(p))) => Err(p),
            Err(_) => unreachable!("only entries are pushed through handles"),
        }
    }
}

/// The logger: owns the queue, the worker thread, and the staging directory.
pub struct EventLogger {
    config: LoggerConfig,
    sender: Sender<QueueItem>,
    receiver: Receiver<QueueItem>,
    stopped: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<LogResult<HashMap<u8, SourceIndex>>>>>,
    live_index: Mutex<HashMap<u8, SourceIndex>>,
}

impl EventLogger {
    pub fn new(config: LoggerConfig) -> LogResult<Self> {
        std::fs::create_dir_all(&config.directory)?;
        let (sender, receiver) = bounded(config.queue_capacity.max(1));
        Ok(Self {
            config,
            sender,
            receiver,
            stopped: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            live_index: Mutex::new(HashMap::new()),
        })
    }

    /// Spawns the worker. Idempotent: a second call while running is a
    /// no-op.
    pub fn start(&self) -> LogResult<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        if self.stopped.load(Ordering::Acquire) {
            return Err(LogError::Stopped);
        }
        let receiver = self.receiver.clone();
        let directory = self.config.directory.clone();
        *worker = Some(
            std::thread::Builder::new()
                .name("eventlog-worker".into())
                .spawn(move || run_worker(receiver, directory))?,
        );
        Ok(())
    }

    /// Producer handle for this logger.
    pub fn handle(&self) -> LogHandle {
        LogHandle {
            sender: self.sender.clone(),
            stopped: Arc::clone(&self.stopped),
        }
    }

    /// True once [`start`](Self::start) has run and [`stop`](Self::stop) has
    /// not.
    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some() && !self.stopped.load(Ordering::Acquire)
    }

    /// Drains the queue, flushes staging files, and joins the worker.
    /// Submissions fail once this returns.
    pub fn stop(&self) -> LogResult<()> {
        let handle = {
            let mut worker = self.worker.lock();
            match worker.take() {
                Some(handle) => handle,
                None => return Ok(()),
            }
        };

        self.stopped.store(true, Ordering::Release);
        // The worker drains queued entries before honoring the shutdown
        // marker, preserving per-producer submission order.
        let _ = self.sender.send(QueueItem::Shutdown);
        let index = handle
            .join()
            .map_err(|_| LogError::NotRunning)
            .and_then(|result| result)?;
        *self.live_index.lock() = index;
        Ok(())
    }

    /// Per-source entry statistics captured when the worker stopped.
    pub fn source_index(&self, source_id: u8) -> Option<SourceIndex> {
        self.live_index.lock().get(&source_id).copied()
    }

    /// Groups staged entries by source, compresses each stream, and writes
    /// the archive. `verify_integrity` re-reads the archive and compares
    /// entry counts and first/last timestamps against the pre-compression
    /// index; failures leave staging files untouched regardless of
    /// `remove_sources`.
    pub fn compress_logs(
        &self,
        remove_sources: bool,
        memory_mapping: bool,
        verify_integrity: bool,
    ) -> LogResult<PathBuf> {
        if self.worker.lock().is_some() {
            return Err(LogError::StillRunning);
        }

        let staged = staged_sources(&self.config.directory)?;
        let mut streams = Vec::with_capacity(staged.len());
        let threads = self.config.compression_threads.max(1);

        std::thread::scope(|scope| -> LogResult<()> {
            let mut pending = Vec::new();
            for chunk in staged.chunks(threads.max(1)) {
                for (source_id, path) in chunk {
                    let source_id = *source_id;
                    let path = path.clone();
                    pending.push(scope.spawn(move || -> LogResult<_> {
                        let raw = std::fs::read(&path)?;
                        compress_stream(source_id, &raw)
                    }));
                }
                for task in pending.drain(..) {
                    let stream = task.join().map_err(|_| LogError::NotRunning)??;
                    streams.push(stream);
                }
            }
            Ok(())
        })?;

        streams.sort_by_key(|s| s.source_id);
        let archive_path = self.config.archive_path();
        write_archive(&archive_path, &streams)?;

        if verify_integrity {
            let expected: HashMap<u8, SourceIndex> =
                streams.iter().map(|s| (s.source_id, s.index)).collect();
            verify_archive(&archive_path, memory_mapping, &expected)?;
        }

        if remove_sources {
            for (_, path) in &staged {
                std::fs::remove_file(path)?;
            }
        }

        log::info!(
            "compressed {} log stream(s) into {}",
            streams.len(),
            archive_path.display()
        );
        Ok(archive_path)
    }
}

impl Drop for EventLogger {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Enumerates `source_<id>.dat` staging files in a logger directory.
fn staged_sources(directory: &Path) -> LogResult<Vec<(u8, PathBuf)>> {
    let mut sources = Vec::new();
    for entry in std::fs::read_dir(directory)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(id) = name
            .strip_prefix("source_")
            .and_then(|rest| rest.strip_suffix(".dat"))
            .and_then(|id| id.parse::<u8>().ok())
        {
            sources.push((id, entry.path()));
        }
    }
    sources.sort_by_key(|(id, _)| *id);
    Ok(sources)
}

fn staging_path(directory: &Path, source_id: u8) -> PathBuf {
    directory.join(format!("source_{source_id}.dat"))
}

fn run_worker(
    receiver: Receiver<QueueItem>,
    directory: PathBuf,
) -> LogResult<HashMap<u8, SourceIndex>> {
    let mut writers: HashMap<u8, BufWriter<File>> = HashMap::new();
    let mut index: HashMap<u8, SourceIndex> = HashMap::new();

    let mut persist = |package: LogPackage| -> LogResult<()> {
        let writer = match writers.entry(package.source_id) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(staging_path(&directory, package.source_id))?;
                entry.insert(BufWriter::new(file))
            }
        };

        let stats = index.entry(package.source_id).or_default();
        if stats.entry_count > 0 && package.time_stamp_us < stats.last_ts {
            log::warn!(
                "source {} submitted a regressed timestamp ({} < {})",
                package.source_id,
                package.time_stamp_us,
                stats.last_ts
            );
        }
        if stats.entry_count == 0 {
            stats.first_ts = package.time_stamp_us;
        }
        stats.last_ts = package.time_stamp_us;
        stats.entry_count += 1;

        let mut record = Vec::with_capacity(17 + package.serialized_data.len());
        archive::write_record(
            &mut record,
            package.source_id,
            package.time_stamp_us,
            &package.serialized_data,
        );
        writer.write_all(&record)?;
        Ok(())
    };

    loop {
        match receiver.recv() {
            Ok(QueueItem::Entry(package)) => persist(package)?,
            Ok(QueueItem::Shutdown) | Err(_) => break,
        }
    }
    // Producers are fenced off by the stopped flag before the shutdown
    // marker is queued; drain whatever raced in ahead of the fence.
    while let Ok(item) = receiver.try_recv() {
        if let QueueItem::Entry(package) = item {
            persist(package)?;
        }
    }

    for writer in writers.values_mut() {
        writer.flush()?;
    }
    Ok(index)
}

fn verify_archive(
    path: &Path,
    memory_mapping: bool,
    expected: &HashMap<u8, SourceIndex>,
) -> LogResult<()> {
    let archive = Archive::open(path, memory_mapping)?;
    if archive.streams.len() != expected.len() {
        return Err(LogError::Integrity(format!(
            "stream count mismatch: archived {}, staged {}",
            archive.streams.len(),
            expected.len()
        )));
    }
    for stream in &archive.streams {
        let want = expected.get(&stream.source_id).ok_or_else(|| {
            LogError::Integrity(format!("unexpected archived source {}", stream.source_id))
        })?;
        // Recompute from the inflated bytes rather than trusting the stream
        // header the writer produced.
        let mut raw = Vec::new();
        for entry in &stream.entries {
            archive::write_record(&mut raw, entry.source_id, entry.time_stamp_us, &entry.payload);
        }
        let found = scan_records(stream.source_id, &raw)?;
        if found != *want {
            return Err(LogError::Integrity(format!(
                "source {}: archived {:?}, staged {:?}",
                stream.source_id, found, want
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logger(dir: &Path) -> EventLogger {
        let mut config = LoggerConfig::new(dir, "rig");
        config.queue_capacity = 64;
        EventLogger::new(config).expect("logger")
    }

    fn package(source: u8, ts: u64, data: &[u8]) -> LogPackage {
        LogPackage {
            source_id: source,
            time_stamp_us: ts,
            serialized_data: data.to_vec(),
        }
    }

    #[test]
    fn start_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logger = logger(dir.path());
        logger.start().expect("start");
        logger.start().expect("second start is a no-op");
        logger.stop().expect("stop");
    }

    #[test]
    fn submissions_fail_after_stop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logger = logger(dir.path());
        logger.start().expect("start");
        let handle = logger.handle();
        handle.submit(LogPackage::onset(2)).expect("submit");
        logger.stop().expect("stop");
        assert!(matches!(
            handle.submit(package(2, 10, &[1])),
            Err(LogError::Stopped)
        ));
    }

    #[test]
    fn entries_persist_in_submission_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logger = logger(dir.path());
        logger.start().expect("start");
        let handle = logger.handle();

        handle.submit(LogPackage::onset(3)).expect("onset");
        for ts in [5u64, 9, 12, 40] {
            handle.submit(package(3, ts, &[ts as u8])).expect("submit");
        }
        logger.stop().expect("stop");

        let archive_path = logger
            .compress_logs(false, false, true)
            .expect("compress");
        let archive = Archive::open(&archive_path, false).expect("open");
        let stream = archive.stream(3).expect("stream");
        assert_eq!(stream.entries.len(), 5);
        assert_eq!(stream.entries[0].time_stamp_us, 0);
        let stamps: Vec<u64> = stream.entries[1..]
            .iter()
            .map(|e| e.time_stamp_us)
            .collect();
        assert_eq!(stamps, vec![5, 9, 12, 40]);
    }

    #[test]
    fn compress_refuses_while_running() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logger = logger(dir.path());
        logger.start().expect("start");
        assert!(matches!(
            logger.compress_logs(false, false, false),
            Err(LogError::StillRunning)
        ));
        logger.stop().expect("stop");
    }

    #[test]
    fn remove_sources_deletes_staging() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logger = logger(dir.path());
        logger.start().expect("start");
        let handle = logger.handle();
        handle.submit(LogPackage::onset(2)).expect("onset");
        handle.submit(package(2, 7, b"x")).expect("submit");
        logger.stop().expect("stop");

        logger.compress_logs(true, true, true).expect("compress");
        assert!(!staging_path(dir.path(), 2).exists());
    }

    #[test]
    fn sources_stay_isolated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logger = logger(dir.path());
        logger.start().expect("start");
        let handle = logger.handle();
        handle.submit(LogPackage::onset(2)).expect("onset");
        handle.submit(LogPackage::onset(9)).expect("onset");
        handle.submit(package(9, 3, b"b")).expect("submit");
        handle.submit(package(2, 4, b"a")).expect("submit");
        logger.stop().expect("stop");

        let path = logger.compress_logs(false, false, true).expect("compress");
        let archive = Archive::open(&path, false).expect("open");
        assert_eq!(archive.stream(2).expect("s2").entries.len(), 2);
        assert_eq!(archive.stream(9).expect("s9").entries.len(), 2);
        assert_eq!(archive.stream(9).expect("s9").entries[1].payload, b"b");
    }
}
