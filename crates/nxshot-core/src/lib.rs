pub mod cancel;
pub mod capture;
pub mod capture_ids;
pub mod container;
pub mod error;
pub mod orchestrator;
pub mod sink;
pub mod source;
pub mod title_ids;
pub mod verify;

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

pub use cancel::CancellationToken;
pub use capture::{parse_capture_filename, CaptureRecord, Rejection, UNKNOWN_GAME};
pub use capture_ids::{CaptureTable, CaptureTableLoader, JsonFileSource};
pub use error::{ArchiveError, TableError};
pub use orchestrator::{ArchiveRequest, ArchiveSummary, Orchestrator, RunOutcome, RunState};
pub use title_ids::{build_table, read_metadata, BuildOptions, CaptureIdKey, TableMetadata};
pub use sink::{DestinationPicker, FixedDestination, PlatformSinks, SinkKind, SUGGESTED_ARCHIVE_NAME};
pub use verify::{verify_archive, VerifyReport};

fn default_download_dir() -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_fallback_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_archive_name() -> String {
    SUGGESTED_ARCHIVE_NAME.to_string()
}

fn default_streaming() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveOptions {
    /// Capture folder (e.g. the SD card's `Nintendo/Album`) or an exported `.zip`
    pub source: PathBuf,
    /// Explicit destination; when set the archive streams straight there
    #[serde(default)]
    pub output: Option<PathBuf>,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Receives a buffered archive when `download_dir` cannot be streamed into
    #[serde(default = "default_fallback_dir")]
    pub fallback_dir: PathBuf,
    #[serde(default = "default_archive_name")]
    pub archive_name: String,
    /// `captureIds.json` mapping capture IDs to game names
    #[serde(default)]
    pub capture_ids: Option<PathBuf>,
    /// Allow streaming into the download directory; otherwise buffer in memory
    #[serde(default = "default_streaming")]
    pub streaming: bool,
}

impl ArchiveOptions {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            output: None,
            download_dir: default_download_dir(),
            fallback_dir: default_fallback_dir(),
            archive_name: default_archive_name(),
            capture_ids: None,
            streaming: default_streaming(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Processing,
    Finalizing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub current: u64,
    pub total: u64,
    pub phase: Phase,
}

/// Control options for a run (destination picker, cancellation).
#[derive(Default)]
pub struct ArchiveControl {
    /// Overrides the picker implied by `ArchiveOptions::output`.
    pub picker: Option<Box<dyn DestinationPicker>>,
    /// Cancellation token for Ctrl-C / UI cancel support.
    pub cancel_token: Option<CancellationToken>,
}

impl ArchiveControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_picker(mut self, picker: impl DestinationPicker + 'static) -> Self {
        self.picker = Some(Box::new(picker));
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }
}

/// Type alias for progress callback
pub type ProgressCallback<'a> = dyn Fn(&Progress) + Send + Sync + 'a;

/// Throttled progress reporter. Emits at most every 200ms, plus the last
/// processing step and every finalizing step.
pub struct ThrottledProgress<'a> {
    inner: &'a ProgressCallback<'a>,
    last_emit: Mutex<Instant>,
}

impl<'a> ThrottledProgress<'a> {
    pub fn new(inner: &'a ProgressCallback<'a>) -> Self {
        Self {
            inner,
            last_emit: Mutex::new(Instant::now() - Duration::from_secs(1)),
        }
    }

    pub fn report(&self, progress: &Progress) {
        let must_emit = progress.phase == Phase::Finalizing || progress.current >= progress.total;
        let mut last = self.last_emit.lock().unwrap_or_else(|e| e.into_inner());
        if !must_emit && last.elapsed() < Duration::from_millis(200) {
            return;
        }
        *last = Instant::now();
        drop(last);
        (self.inner)(progress);
    }
}

/// Scan `options.source` and write one archive, reporting progress.
pub fn run_archive(
    options: &ArchiveOptions,
    control: ArchiveControl,
    progress_callback: &ProgressCallback<'_>,
) -> anyhow::Result<ArchiveSummary> {
    let orchestrator = Orchestrator::new();
    let files = orchestrator.scan(source::open_source(&options.source).as_ref())?;

    let loader = options
        .capture_ids
        .as_ref()
        .map(|path| CaptureTableLoader::new(JsonFileSource::new(path)));

    let mut sinks = PlatformSinks::new(&options.download_dir)
        .with_fallback_dir(&options.fallback_dir)
        .with_suggested_name(&options.archive_name)
        .with_streaming(options.streaming);
    if let Some(picker) = control.picker {
        sinks.picker = Some(picker);
    } else if let Some(output) = &options.output {
        sinks = sinks.with_picker(FixedDestination(output.clone()));
    }

    let tp = ThrottledProgress::new(progress_callback);
    let report = |p: &Progress| tp.report(p);
    let mut request = ArchiveRequest::new(&files, &sinks).with_progress(&report);
    if let Some(loader) = &loader {
        request = request.with_table(loader);
    }
    if let Some(token) = &control.cancel_token {
        request = request.with_cancel(token);
    }

    match orchestrator.create_archive(request)? {
        RunOutcome::Created(summary) => Ok(summary),
        RunOutcome::AlreadyInFlight => anyhow::bail!("another archive run is already in progress"),
    }
}
