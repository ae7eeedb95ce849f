//! Drives an archive-creation run: captures in, one archive out.

use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::cancel::CancellationToken;
use crate::capture::{parse_capture_filename, CaptureRecord, Rejection};
use crate::capture_ids::{CaptureTable, CaptureTableLoader};
use crate::container::{ContainerWriter, EntryMeta};
use crate::error::{ArchiveError, InvalidTransition, RejectedFile};
use crate::sink::{ArchiveSink, SinkKind, SinkProvider};
use crate::source::{SourceEnumerator, SourceFile};
use crate::{Phase, Progress, ProgressCallback};

/// Lifecycle of the orchestrator. `Error` and `Done` are left by scanning again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum RunState {
    Idle,
    Scanning,
    Ready,
    LoadingTable,
    Processing,
    Done { archive: String },
    Error { message: String },
}

impl RunState {
    pub fn name(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Scanning => "scanning",
            RunState::Ready => "ready",
            RunState::LoadingTable => "loading-lookup-table",
            RunState::Processing => "processing",
            RunState::Done { .. } => "done",
            RunState::Error { .. } => "error",
        }
    }

    /// A run is between claiming the sources and reaching a terminal state.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, RunState::LoadingTable | RunState::Processing)
    }

    fn can_move_to(&self, next: &RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle | Ready | Done { .. } | Error { .. }, Scanning)
                | (Scanning, Ready | Error { .. })
                | (Ready, LoadingTable | Processing)
                | (LoadingTable, Processing | Ready | Error { .. })
                | (Processing, Done { .. } | Ready | Error { .. })
        )
    }
}

/// Parses one filename against an optional table.
pub type ParseFn<'a> =
    dyn Fn(&str, Option<&CaptureTable>) -> Result<CaptureRecord, Rejection> + Sync + 'a;

fn no_progress(_: &Progress) {}

/// Everything one `create_archive` call needs.
pub struct ArchiveRequest<'a> {
    pub sources: &'a [SourceFile],
    pub parse: &'a ParseFn<'a>,
    pub table: Option<&'a CaptureTableLoader>,
    pub sinks: &'a dyn SinkProvider,
    pub progress: &'a ProgressCallback<'a>,
    pub cancel: Option<&'a CancellationToken>,
}

impl<'a> ArchiveRequest<'a> {
    pub fn new(sources: &'a [SourceFile], sinks: &'a dyn SinkProvider) -> Self {
        Self {
            sources,
            parse: &parse_capture_filename,
            table: None,
            sinks,
            progress: &no_progress,
            cancel: None,
        }
    }

    pub fn with_parser(mut self, parse: &'a ParseFn<'a>) -> Self {
        self.parse = parse;
        self
    }

    pub fn with_table(mut self, table: &'a CaptureTableLoader) -> Self {
        self.table = Some(table);
        self
    }

    pub fn with_progress(mut self, progress: &'a ProgressCallback<'a>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancel(mut self, token: &'a CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// What a finished run produced.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveSummary {
    pub archive_name: String,
    pub sink: SinkKind,
    pub entries: usize,
    pub bytes_written: u64,
    #[serde(skip)]
    pub rejected: Vec<RejectedFile>,
    /// Largest amount of archive data held by the pipeline at once
    /// (current payload plus undrained chunks).
    pub peak_resident_bytes: usize,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Created(ArchiveSummary),
    /// Another run on this orchestrator was in flight; nothing was done.
    AlreadyInFlight,
}

struct StreamStats {
    entries: usize,
    bytes_written: u64,
    peak_resident_bytes: usize,
}

/// Owns the run state machine. The `processing` state is the single-flight guard.
pub struct Orchestrator {
    state: Mutex<RunState>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RunState::Idle),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> RunState {
        self.lock().clone()
    }

    fn transition(&self, next: RunState) -> Result<(), InvalidTransition> {
        let mut state = self.lock();
        if !state.can_move_to(&next) {
            return Err(InvalidTransition::new(&state, &next));
        }
        debug!(from = state.name(), to = next.name(), "state transition");
        *state = next;
        Ok(())
    }

    fn fail(&self, err: &ArchiveError) {
        let next = match err {
            ArchiveError::Cancelled | ArchiveError::NoCaptures { .. } => RunState::Ready,
            other => RunState::Error {
                message: other.to_string(),
            },
        };
        if let Err(e) = self.transition(next) {
            warn!(error = %e, "could not record run failure");
        }
    }

    /// Enumerate sources: `scanning`, then `ready` (or `error`).
    pub fn scan(&self, source: &dyn SourceEnumerator) -> Result<Vec<SourceFile>, ArchiveError> {
        self.transition(RunState::Scanning)?;
        match source.enumerate() {
            Ok(files) => {
                info!(files = files.len(), "scan complete");
                self.transition(RunState::Ready)?;
                Ok(files)
            }
            Err(e) => {
                let err = ArchiveError::Scan(e);
                self.fail(&err);
                Err(err)
            }
        }
    }

    /// Build one archive from `ready`.
    ///
    /// Returns [`RunOutcome::AlreadyInFlight`] without side effects while
    /// another run is loading the table or processing.
    pub fn create_archive(&self, req: ArchiveRequest<'_>) -> Result<RunOutcome, ArchiveError> {
        {
            let mut state = self.lock();
            if state.is_in_flight() {
                debug!("archive run already in flight, ignoring request");
                return Ok(RunOutcome::AlreadyInFlight);
            }
            let next = if req.table.is_some() {
                RunState::LoadingTable
            } else {
                RunState::Processing
            };
            if !state.can_move_to(&next) {
                return Err(InvalidTransition::new(&state, &next).into());
            }
            *state = next;
        }

        match self.run(&req) {
            Ok(summary) => {
                info!(
                    archive = %summary.archive_name,
                    entries = summary.entries,
                    bytes = summary.bytes_written,
                    "archive created"
                );
                self.transition(RunState::Done {
                    archive: summary.archive_name.clone(),
                })?;
                Ok(RunOutcome::Created(summary))
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    fn run(&self, req: &ArchiveRequest<'_>) -> Result<ArchiveSummary, ArchiveError> {
        let table = match req.table {
            Some(loader) => {
                let table = loader.load()?;
                self.transition(RunState::Processing)?;
                Some(table)
            }
            None => None,
        };

        let mut records = Vec::with_capacity(req.sources.len());
        let mut rejected = Vec::new();
        for source in req.sources {
            match (req.parse)(&source.filename, table.as_deref()) {
                Ok(record) => records.push((record, source)),
                Err(reason) => {
                    warn!(file = %source.filename, %reason, "skipping file");
                    rejected.push(RejectedFile {
                        filename: source.filename.clone(),
                        reason,
                    });
                }
            }
        }
        if records.is_empty() {
            return Err(ArchiveError::NoCaptures {
                rejected: rejected.len(),
            });
        }

        let Some(mut sink) = req.sinks.acquire().map_err(ArchiveError::Sink)? else {
            info!("destination selection cancelled");
            return Err(ArchiveError::Cancelled);
        };
        info!(entries = records.len(), sink = ?sink.kind(), "creating archive");

        let stats = match stream_entries(&records, sink.as_mut(), req) {
            Ok(stats) => stats,
            Err(err) => {
                error!(error = %err, "archive run failed, aborting output");
                sink.abort();
                return Err(err);
            }
        };
        let archive_name = sink.close().map_err(ArchiveError::Sink)?;

        Ok(ArchiveSummary {
            archive_name,
            sink: sink.kind(),
            entries: stats.entries,
            bytes_written: stats.bytes_written,
            rejected,
            peak_resident_bytes: stats.peak_resident_bytes,
        })
    }
}

/// Push every record through the container writer, draining to the sink after
/// each file, then finalize.
fn stream_entries(
    records: &[(CaptureRecord, &SourceFile)],
    sink: &mut dyn ArchiveSink,
    req: &ArchiveRequest<'_>,
) -> Result<StreamStats, ArchiveError> {
    let total = records.len() as u64;
    let mut writer = ContainerWriter::new();
    let mut peak = 0usize;

    for (i, (record, source)) in records.iter().enumerate() {
        if let Some(token) = req.cancel {
            token.check()?;
        }

        let data = source.payload.read().map_err(|e| ArchiveError::Read {
            filename: source.filename.clone(),
            source: e,
        })?;

        let path = record.archive_path();
        let meta = EntryMeta {
            path: path.clone(),
            modified: record.modification_time(),
        };
        writer
            .add_entry(meta)
            .and_then(|entry| entry.write(data))
            .map_err(|source| ArchiveError::Encode { path, source })?;

        peak = peak.max(writer.pending_bytes());
        drain_to_sink(&mut writer, sink)?;

        (req.progress)(&Progress {
            current: i as u64 + 1,
            total,
            phase: Phase::Processing,
        });
    }

    writer.finish().map_err(|source| ArchiveError::Encode {
        path: "<central directory>".to_string(),
        source,
    })?;
    peak = peak.max(writer.pending_bytes());
    drain_to_sink(&mut writer, sink)?;

    (req.progress)(&Progress {
        current: total,
        total,
        phase: Phase::Finalizing,
    });

    Ok(StreamStats {
        entries: records.len(),
        bytes_written: writer.bytes_emitted(),
        peak_resident_bytes: peak,
    })
}

fn drain_to_sink(writer: &mut ContainerWriter, sink: &mut dyn ArchiveSink) -> Result<(), ArchiveError> {
    for chunk in writer.drain() {
        sink.write(&chunk).map_err(ArchiveError::Sink)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::UNKNOWN_GAME;
    use crate::capture_ids::{StaticSource, TableSource};
    use crate::error::TableError;
    use crate::source::{InMemory, PayloadProvider};
    use chrono::{Datelike, Timelike};
    use std::collections::HashMap;
    use std::io::{self, Cursor, Read};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::sync::Arc;

    const ZELDA: &str = "0123456789ABCDEF0123456789ABCDEF";
    const ZELDA_JP: &str = "1111111111111111AAAAAAAAAAAAAAAA";
    const MARIO: &str = "22222222222222222222222222222222";

    fn capture(day: u32, second: u32, id: &str) -> String {
        format!("202305{day:02}1230{second:02}00-{id}.jpg")
    }

    #[derive(Default)]
    struct Journal {
        bytes: Mutex<Vec<u8>>,
        closes: AtomicUsize,
        aborts: AtomicUsize,
    }

    impl Journal {
        fn archive(&self) -> zip::ZipArchive<Cursor<Vec<u8>>> {
            let bytes = self.bytes.lock().unwrap().clone();
            zip::ZipArchive::new(Cursor::new(bytes)).unwrap()
        }
    }

    struct MemorySink(Arc<Journal>);

    impl ArchiveSink for MemorySink {
        fn kind(&self) -> SinkKind {
            SinkKind::Native
        }
        fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
            self.0.bytes.lock().unwrap().extend_from_slice(chunk);
            Ok(())
        }
        fn close(&mut self) -> io::Result<String> {
            self.0.closes.fetch_add(1, Ordering::SeqCst);
            Ok("memory.zip".to_string())
        }
        fn abort(&mut self) {
            self.0.aborts.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MemorySinks {
        journal: Arc<Journal>,
        acquired: AtomicUsize,
        cancel: bool,
    }

    impl SinkProvider for MemorySinks {
        fn acquire(&self) -> io::Result<Option<Box<dyn ArchiveSink>>> {
            self.acquired.fetch_add(1, Ordering::SeqCst);
            if self.cancel {
                return Ok(None);
            }
            Ok(Some(Box::new(MemorySink(Arc::clone(&self.journal)))))
        }
    }

    struct FailingRead;

    impl PayloadProvider for FailingRead {
        fn read(&self) -> io::Result<Vec<u8>> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "locked"))
        }
    }

    fn table() -> CaptureTableLoader {
        CaptureTableLoader::new(StaticSource(HashMap::from([
            (ZELDA.to_string(), "Zelda".to_string()),
            (ZELDA_JP.to_string(), "Zelda".to_string()),
            (MARIO.to_string(), "Mario".to_string()),
        ])))
    }

    fn ready(sources: &Vec<SourceFile>) -> (Orchestrator, Vec<SourceFile>) {
        let orch = Orchestrator::new();
        let files = orch.scan(sources).unwrap();
        (orch, files)
    }

    fn created(outcome: RunOutcome) -> ArchiveSummary {
        match outcome {
            RunOutcome::Created(summary) => summary,
            RunOutcome::AlreadyInFlight => panic!("run was skipped"),
        }
    }

    #[test]
    fn test_entries_grouped_with_bytes_and_mtime() {
        let f1 = capture(14, 10, ZELDA);
        let f2 = capture(15, 20, MARIO);
        let (orch, files) = ready(&vec![
            SourceFile::new(&f1, InMemory(b"zelda shot".to_vec())),
            SourceFile::new(&f2, InMemory(b"mario shot".to_vec())),
        ]);
        let sinks = MemorySinks::default();
        let table = table();

        let summary = created(
            orch.create_archive(ArchiveRequest::new(&files, &sinks).with_table(&table))
                .unwrap(),
        );
        assert_eq!(summary.archive_name, "memory.zip");
        assert_eq!(summary.entries, 2);
        assert_eq!(
            orch.state(),
            RunState::Done {
                archive: "memory.zip".to_string()
            }
        );
        assert_eq!(sinks.journal.closes.load(Ordering::SeqCst), 1);
        assert_eq!(sinks.journal.aborts.load(Ordering::SeqCst), 0);

        let mut zip = sinks.journal.archive();
        let names: Vec<String> = zip.file_names().map(str::to_string).collect();
        assert_eq!(names.len(), 2);

        let mut entry = zip.by_name(&format!("Zelda/{f1}")).unwrap();
        let mut body = Vec::new();
        entry.read_to_end(&mut body).unwrap();
        assert_eq!(body, b"zelda shot");
        let expected = parse_capture_filename(&f1, None).unwrap().timestamp;
        let mtime = entry.last_modified().unwrap();
        assert_eq!(mtime.year() as i32, expected.year());
        assert_eq!(mtime.month() as u32, expected.month());
        assert_eq!(mtime.day() as u32, expected.day());
        assert_eq!(mtime.hour() as u32, expected.hour());
        assert_eq!(mtime.minute() as u32, expected.minute());
        assert_eq!(mtime.second() as u32, expected.second());
        drop(entry);

        assert!(zip.by_name(&format!("Mario/{f2}")).is_ok());
    }

    #[test]
    fn test_same_display_name_merges_folders() {
        let a = capture(1, 0, ZELDA);
        let b = capture(2, 0, ZELDA_JP);
        let unknown = capture(3, 0, "FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF");
        let (orch, files) = ready(&vec![
            SourceFile::new(&a, InMemory(vec![1])),
            SourceFile::new(&b, InMemory(vec![2])),
            SourceFile::new(&unknown, InMemory(vec![3])),
        ]);
        let sinks = MemorySinks::default();
        let table = table();
        orch.create_archive(ArchiveRequest::new(&files, &sinks).with_table(&table))
            .unwrap();

        let zip = sinks.journal.archive();
        let mut names: Vec<&str> = zip.file_names().collect();
        names.sort();
        let expected = [
            format!("{UNKNOWN_GAME}/{unknown}"),
            format!("Zelda/{a}"),
            format!("Zelda/{b}"),
        ];
        assert_eq!(names, expected.iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[test]
    fn test_encoding_failure_aborts_once() {
        let files: Vec<SourceFile> = (1..=5)
            .map(|d| SourceFile::new(capture(d, 0, ZELDA), InMemory(vec![d as u8; 16])))
            .collect();
        let (orch, files) = ready(&files);
        let second = files[1].filename.clone();
        let parse = move |name: &str, table: Option<&CaptureTable>| -> Result<CaptureRecord, Rejection> {
            let mut record = parse_capture_filename(name, table)?;
            if name == second {
                record.display_name = "x".repeat(70_000);
            }
            Ok(record)
        };
        let sinks = MemorySinks::default();

        let result = orch.create_archive(ArchiveRequest::new(&files, &sinks).with_parser(&parse));
        assert!(matches!(result, Err(ArchiveError::Encode { .. })));
        assert_eq!(sinks.journal.aborts.load(Ordering::SeqCst), 1);
        assert_eq!(sinks.journal.closes.load(Ordering::SeqCst), 0);
        assert!(matches!(orch.state(), RunState::Error { .. }));
    }

    #[test]
    fn test_read_failure_aborts() {
        let (orch, files) = ready(&vec![
            SourceFile::new(capture(1, 0, ZELDA), InMemory(vec![1])),
            SourceFile::new(capture(2, 0, ZELDA), FailingRead),
        ]);
        let sinks = MemorySinks::default();
        let result = orch.create_archive(ArchiveRequest::new(&files, &sinks));
        assert!(matches!(result, Err(ArchiveError::Read { .. })));
        assert_eq!(sinks.journal.aborts.load(Ordering::SeqCst), 1);
        assert_eq!(sinks.journal.closes.load(Ordering::SeqCst), 0);

        // Recoverable: scan again and retry.
        assert!(orch.scan(&files).is_ok());
        assert_eq!(orch.state(), RunState::Ready);
    }

    #[test]
    fn test_progress_is_monotonic_and_ends_finalizing() {
        let (orch, files) = ready(
            &(1..=4)
                .map(|d| SourceFile::new(capture(d, 0, MARIO), InMemory(vec![0; 8])))
                .collect(),
        );
        let seen = Mutex::new(Vec::new());
        let progress = |p: &Progress| seen.lock().unwrap().push(p.clone());
        let sinks = MemorySinks::default();
        orch.create_archive(ArchiveRequest::new(&files, &sinks).with_progress(&progress))
            .unwrap();

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 5);
        assert!(seen.windows(2).all(|w| w[0].current <= w[1].current));
        let last = seen.last().unwrap();
        assert_eq!(last.current, 4);
        assert_eq!(last.total, 4);
        assert_eq!(last.phase, Phase::Finalizing);
        assert!(seen[..4].iter().all(|p| p.phase == Phase::Processing));
    }

    #[test]
    fn test_cancelled_picker_returns_to_ready() {
        let (orch, files) = ready(&vec![SourceFile::new(capture(1, 0, ZELDA), InMemory(vec![1]))]);
        let sinks = MemorySinks {
            cancel: true,
            ..Default::default()
        };
        let result = orch.create_archive(ArchiveRequest::new(&files, &sinks));
        assert!(matches!(result, Err(ArchiveError::Cancelled)));
        assert_eq!(orch.state(), RunState::Ready);
        assert_eq!(sinks.journal.aborts.load(Ordering::SeqCst), 0);
        assert!(sinks.journal.bytes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_cancel_mid_run_aborts() {
        let (orch, files) = ready(
            &(1..=3)
                .map(|d| SourceFile::new(capture(d, 0, ZELDA), InMemory(vec![0; 8])))
                .collect(),
        );
        let token = CancellationToken::new();
        let progress = |p: &Progress| {
            if p.current == 1 {
                token.cancel();
            }
        };
        let sinks = MemorySinks::default();
        let result = orch.create_archive(
            ArchiveRequest::new(&files, &sinks)
                .with_progress(&progress)
                .with_cancel(&token),
        );
        assert!(matches!(result, Err(ArchiveError::Cancelled)));
        assert_eq!(sinks.journal.aborts.load(Ordering::SeqCst), 1);
        assert_eq!(sinks.journal.closes.load(Ordering::SeqCst), 0);
        assert_eq!(orch.state(), RunState::Ready);
    }

    #[test]
    fn test_table_failure_blocks_processing() {
        struct Offline;
        impl TableSource for Offline {
            fn fetch(&self) -> Result<CaptureTable, TableError> {
                Err(TableError::Io("offline".to_string()))
            }
        }
        let (orch, files) = ready(&vec![SourceFile::new(capture(1, 0, ZELDA), InMemory(vec![1]))]);
        let loader = CaptureTableLoader::new(Offline);
        let sinks = MemorySinks::default();
        let result = orch.create_archive(ArchiveRequest::new(&files, &sinks).with_table(&loader));
        assert!(matches!(result, Err(ArchiveError::LookupTable(_))));
        assert_eq!(sinks.acquired.load(Ordering::SeqCst), 0);
        assert!(matches!(orch.state(), RunState::Error { .. }));
    }

    #[test]
    fn test_rejected_files_are_skipped() {
        let good = capture(1, 0, ZELDA);
        let bad = capture(31, 0, ZELDA).replace("202305", "202304");
        let (orch, files) = ready(&vec![
            SourceFile::new(&bad, InMemory(vec![1])),
            SourceFile::new(&good, InMemory(vec![2])),
        ]);
        let sinks = MemorySinks::default();
        let summary = created(orch.create_archive(ArchiveRequest::new(&files, &sinks)).unwrap());
        assert_eq!(summary.entries, 1);
        assert_eq!(summary.rejected.len(), 1);
        assert_eq!(summary.rejected[0].filename, bad);
        assert_eq!(summary.rejected[0].reason, Rejection::InvalidCalendarDate);
        assert_eq!(sinks.journal.archive().len(), 1);
    }

    #[test]
    fn test_no_valid_captures() {
        let (orch, files) = ready(&vec![SourceFile::new("bogus.jpg", InMemory(vec![1]))]);
        let sinks = MemorySinks::default();
        let result = orch.create_archive(ArchiveRequest::new(&files, &sinks));
        assert!(matches!(result, Err(ArchiveError::NoCaptures { rejected: 1 })));
        assert_eq!(sinks.acquired.load(Ordering::SeqCst), 0);
        assert_eq!(orch.state(), RunState::Ready);
    }

    #[test]
    fn test_requires_ready_state() {
        let orch = Orchestrator::new();
        let sinks = MemorySinks::default();
        let result = orch.create_archive(ArchiveRequest::new(&[], &sinks));
        assert!(matches!(result, Err(ArchiveError::Transition(_))));
        assert_eq!(orch.state(), RunState::Idle);
    }

    #[test]
    fn test_peak_memory_independent_of_total_size() {
        const FILE_SIZE: usize = 64 * 1024;
        const COUNT: u32 = 24;
        let (orch, files) = ready(
            &(1..=COUNT)
                .map(|d| SourceFile::new(capture(d, 0, MARIO), InMemory(vec![0xAB; FILE_SIZE])))
                .collect(),
        );
        let sinks = MemorySinks::default();
        let summary = created(orch.create_archive(ArchiveRequest::new(&files, &sinks)).unwrap());

        let total_payload = FILE_SIZE * COUNT as usize;
        // The finished entry waiting to drain plus the open one, or the
        // central directory at the end.
        assert!(summary.peak_resident_bytes < 2 * FILE_SIZE + 200 * COUNT as usize);
        assert!(summary.peak_resident_bytes * 4 < total_payload);
        assert!(summary.bytes_written > total_payload as u64);
    }

    struct GatedSink {
        started: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
        gated: bool,
        journal: Arc<Journal>,
    }

    impl ArchiveSink for GatedSink {
        fn kind(&self) -> SinkKind {
            SinkKind::StreamingDownload
        }
        fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
            if !self.gated {
                self.gated = true;
                self.started.send(()).ok();
                self.release.recv().ok();
            }
            self.journal.bytes.lock().unwrap().extend_from_slice(chunk);
            Ok(())
        }
        fn close(&mut self) -> io::Result<String> {
            self.journal.closes.fetch_add(1, Ordering::SeqCst);
            Ok("gated.zip".to_string())
        }
        fn abort(&mut self) {
            self.journal.aborts.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct GatedSinks {
        sink: Mutex<Option<GatedSink>>,
        acquired: AtomicUsize,
    }

    impl SinkProvider for GatedSinks {
        fn acquire(&self) -> io::Result<Option<Box<dyn ArchiveSink>>> {
            self.acquired.fetch_add(1, Ordering::SeqCst);
            let sink = self.sink.lock().unwrap().take();
            Ok(sink.map(|s| Box::new(s) as Box<dyn ArchiveSink>))
        }
    }

    #[test]
    fn test_second_run_while_processing_is_noop() {
        let (orch, files) = ready(&vec![
            SourceFile::new(capture(1, 0, ZELDA), InMemory(vec![1; 32])),
            SourceFile::new(capture(2, 0, ZELDA), InMemory(vec![2; 32])),
        ]);
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let journal = Arc::new(Journal::default());
        let sinks = GatedSinks {
            sink: Mutex::new(Some(GatedSink {
                started: started_tx,
                release: release_rx,
                gated: false,
                journal: Arc::clone(&journal),
            })),
            acquired: AtomicUsize::new(0),
        };

        std::thread::scope(|s| {
            let first = s.spawn(|| orch.create_archive(ArchiveRequest::new(&files, &sinks)));
            started_rx.recv().unwrap();
            assert_eq!(orch.state(), RunState::Processing);

            let second = orch.create_archive(ArchiveRequest::new(&files, &sinks)).unwrap();
            assert!(matches!(second, RunOutcome::AlreadyInFlight));

            release_tx.send(()).unwrap();
            let summary = created(first.join().unwrap().unwrap());
            assert_eq!(summary.archive_name, "gated.zip");
        });

        assert_eq!(sinks.acquired.load(Ordering::SeqCst), 1);
        assert_eq!(journal.closes.load(Ordering::SeqCst), 1);
        assert_eq!(journal.aborts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_transition_table() {
        assert!(RunState::Idle.can_move_to(&RunState::Scanning));
        assert!(!RunState::Idle.can_move_to(&RunState::Processing));
        assert!(!RunState::Processing.can_move_to(&RunState::Processing));
        assert!(RunState::Processing.can_move_to(&RunState::Ready));
        assert!(RunState::Error { message: String::new() }.can_move_to(&RunState::Scanning));
        assert!(!RunState::Done { archive: String::new() }.can_move_to(&RunState::Processing));
    }
}
