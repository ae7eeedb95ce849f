//! Output sinks: where archive bytes go.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

/// Default name offered for the archive.
pub const SUGGESTED_ARCHIVE_NAME: &str = "switch-captures.zip";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SinkKind {
    /// Streams to a destination the user picked.
    Native,
    /// Streams into the download directory under the suggested name.
    StreamingDownload,
    /// Collects everything in memory and delivers one blob at the end.
    Buffered,
}

/// A destination for archive chunks, owned by one run.
///
/// `close` and `abort` are terminal; whichever comes first wins and the other
/// becomes a no-op (`close` after `abort` reports an error instead of a name).
/// A `close` that fails discards the output as `abort` would.
pub trait ArchiveSink: Send {
    fn kind(&self) -> SinkKind;
    fn write(&mut self, chunk: &[u8]) -> io::Result<()>;
    fn close(&mut self) -> io::Result<String>;
    fn abort(&mut self);
}

enum Lifecycle {
    Open,
    Closed(String),
    Aborted,
}

impl Lifecycle {
    fn check_writable(&self) -> io::Result<()> {
        match self {
            Lifecycle::Open => Ok(()),
            Lifecycle::Closed(_) => Err(io::Error::other("sink already closed")),
            Lifecycle::Aborted => Err(io::Error::other("sink aborted")),
        }
    }

    /// `Some(result)` when the sink is already terminal.
    fn closed_result(&self) -> Option<io::Result<String>> {
        match self {
            Lifecycle::Open => None,
            Lifecycle::Closed(name) => Some(Ok(name.clone())),
            Lifecycle::Aborted => Some(Err(io::Error::other("sink aborted"))),
        }
    }
}

/// Streams straight to a user-chosen file. A failed run removes the partial file.
pub struct FileSink {
    path: PathBuf,
    out: Option<BufWriter<File>>,
    state: Lifecycle,
}

impl FileSink {
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = File::create(&path)?;
        debug!(path = %path.display(), "opened archive destination");
        Ok(Self {
            path,
            out: Some(BufWriter::new(file)),
            state: Lifecycle::Open,
        })
    }
}

impl ArchiveSink for FileSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Native
    }

    fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.state.check_writable()?;
        match self.out.as_mut() {
            Some(out) => out.write_all(chunk),
            None => Err(io::Error::other("sink already released")),
        }
    }

    fn close(&mut self) -> io::Result<String> {
        if let Some(done) = self.state.closed_result() {
            return done;
        }
        match finish_file(self.out.take()) {
            Ok(()) => {
                let name = file_name_of(&self.path);
                self.state = Lifecycle::Closed(name.clone());
                Ok(name)
            }
            Err(e) => {
                self.discard();
                Err(e)
            }
        }
    }

    fn abort(&mut self) {
        if matches!(self.state, Lifecycle::Open) {
            self.discard();
        }
    }
}

impl FileSink {
    fn discard(&mut self) {
        self.state = Lifecycle::Aborted;
        drop(self.out.take());
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "could not remove partial archive");
        }
    }
}

/// Streams into `<dir>/<name>.part`, renamed to a free name in `dir` on close.
pub struct DownloadSink {
    dir: PathBuf,
    suggested: String,
    part: PathBuf,
    out: Option<BufWriter<File>>,
    state: Lifecycle,
}

impl DownloadSink {
    pub fn create(dir: impl Into<PathBuf>, suggested: &str) -> io::Result<Self> {
        let dir = dir.into();
        let part = dir.join(format!("{suggested}.part"));
        let file = File::create(&part)?;
        debug!(path = %part.display(), "opened download stream");
        Ok(Self {
            dir,
            suggested: suggested.to_string(),
            part,
            out: Some(BufWriter::new(file)),
            state: Lifecycle::Open,
        })
    }
}

impl ArchiveSink for DownloadSink {
    fn kind(&self) -> SinkKind {
        SinkKind::StreamingDownload
    }

    fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.state.check_writable()?;
        match self.out.as_mut() {
            Some(out) => out.write_all(chunk),
            None => Err(io::Error::other("sink already released")),
        }
    }

    fn close(&mut self) -> io::Result<String> {
        if let Some(done) = self.state.closed_result() {
            return done;
        }
        let dest = unique_destination(&self.dir, &self.suggested);
        match finish_file(self.out.take()).and_then(|()| fs::rename(&self.part, &dest)) {
            Ok(()) => {
                info!(path = %dest.display(), "download complete");
                let name = file_name_of(&dest);
                self.state = Lifecycle::Closed(name.clone());
                Ok(name)
            }
            Err(e) => {
                self.discard();
                Err(e)
            }
        }
    }

    fn abort(&mut self) {
        if matches!(self.state, Lifecycle::Open) {
            self.discard();
        }
    }
}

impl DownloadSink {
    fn discard(&mut self) {
        self.state = Lifecycle::Aborted;
        drop(self.out.take());
        if let Err(e) = fs::remove_file(&self.part) {
            warn!(path = %self.part.display(), error = %e, "could not remove partial download");
        }
    }
}

/// Flush and sync a streamed archive.
fn finish_file(out: Option<BufWriter<File>>) -> io::Result<()> {
    match out {
        Some(out) => out.into_inner().map_err(|e| e.into_error())?.sync_all(),
        None => Err(io::Error::other("sink already released")),
    }
}

/// Hands a finished in-memory archive to the platform.
pub trait BlobDelivery: Send {
    fn deliver(&mut self, suggested: &str, blob: Vec<u8>) -> io::Result<String>;
}

/// Saves the blob under a free name in a directory.
pub struct DirectoryDelivery {
    pub dir: PathBuf,
}

impl BlobDelivery for DirectoryDelivery {
    fn deliver(&mut self, suggested: &str, blob: Vec<u8>) -> io::Result<String> {
        let dest = unique_destination(&self.dir, suggested);
        fs::write(&dest, blob)?;
        info!(path = %dest.display(), "archive saved");
        Ok(file_name_of(&dest))
    }
}

/// Last-resort sink: keeps every chunk until close.
pub struct BufferedSink {
    suggested: String,
    chunks: Vec<Vec<u8>>,
    buffered: usize,
    delivery: Box<dyn BlobDelivery>,
    state: Lifecycle,
}

impl BufferedSink {
    pub fn new(suggested: &str, delivery: impl BlobDelivery + 'static) -> Self {
        Self {
            suggested: suggested.to_string(),
            chunks: Vec::new(),
            buffered: 0,
            delivery: Box::new(delivery),
            state: Lifecycle::Open,
        }
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered
    }
}

impl ArchiveSink for BufferedSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Buffered
    }

    fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.state.check_writable()?;
        self.buffered += chunk.len();
        self.chunks.push(chunk.to_vec());
        Ok(())
    }

    fn close(&mut self) -> io::Result<String> {
        if let Some(done) = self.state.closed_result() {
            return done;
        }
        let mut blob = Vec::with_capacity(self.buffered);
        for chunk in self.chunks.drain(..) {
            blob.extend_from_slice(&chunk);
        }
        self.buffered = 0;
        match self.delivery.deliver(&self.suggested, blob) {
            Ok(name) => {
                self.state = Lifecycle::Closed(name.clone());
                Ok(name)
            }
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    fn abort(&mut self) {
        if !matches!(self.state, Lifecycle::Open) {
            return;
        }
        self.state = Lifecycle::Aborted;
        self.chunks = Vec::new();
        self.buffered = 0;
    }
}

/// What the platform can do, inspected once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlatformCapabilities {
    /// A destination picker with a writable stream behind it.
    pub save_picker: bool,
    /// Streaming into the download location.
    pub streaming_download: bool,
}

/// Pick the most capable sink variant the platform offers.
pub fn select_strategy(caps: &PlatformCapabilities) -> SinkKind {
    if caps.save_picker {
        SinkKind::Native
    } else if caps.streaming_download {
        SinkKind::StreamingDownload
    } else {
        SinkKind::Buffered
    }
}

/// Asks the user where to save. `Ok(None)` means the user backed out.
pub trait DestinationPicker: Send + Sync {
    fn pick(&self, suggested: &str) -> io::Result<Option<PathBuf>>;
}

/// A destination chosen up front (e.g. on the command line).
pub struct FixedDestination(pub PathBuf);

impl DestinationPicker for FixedDestination {
    fn pick(&self, _suggested: &str) -> io::Result<Option<PathBuf>> {
        Ok(Some(self.0.clone()))
    }
}

/// Produces the sink for one run. `Ok(None)` means the user cancelled.
pub trait SinkProvider: Sync {
    fn acquire(&self) -> io::Result<Option<Box<dyn ArchiveSink>>>;
}

/// The stock provider: native picker, then streaming download, then buffered.
pub struct PlatformSinks {
    pub picker: Option<Box<dyn DestinationPicker>>,
    pub download_dir: PathBuf,
    /// Where a buffered archive goes when no streaming download could be
    /// started in `download_dir`.
    pub fallback_dir: PathBuf,
    pub suggested_name: String,
    pub streaming: bool,
}

impl PlatformSinks {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            picker: None,
            download_dir: download_dir.into(),
            fallback_dir: std::env::temp_dir(),
            suggested_name: SUGGESTED_ARCHIVE_NAME.to_string(),
            streaming: true,
        }
    }

    pub fn with_picker(mut self, picker: impl DestinationPicker + 'static) -> Self {
        self.picker = Some(Box::new(picker));
        self
    }

    pub fn with_fallback_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.fallback_dir = dir.into();
        self
    }

    pub fn with_suggested_name(mut self, name: impl Into<String>) -> Self {
        self.suggested_name = name.into();
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn capabilities(&self) -> PlatformCapabilities {
        PlatformCapabilities {
            save_picker: self.picker.is_some(),
            streaming_download: self.streaming,
        }
    }

    fn buffered(&self, dir: &Path) -> Box<dyn ArchiveSink> {
        Box::new(BufferedSink::new(
            &self.suggested_name,
            DirectoryDelivery {
                dir: dir.to_path_buf(),
            },
        ))
    }
}

impl SinkProvider for PlatformSinks {
    fn acquire(&self) -> io::Result<Option<Box<dyn ArchiveSink>>> {
        let strategy = select_strategy(&self.capabilities());
        let sink: Box<dyn ArchiveSink> = match (strategy, self.picker.as_ref()) {
            (SinkKind::Native, Some(picker)) => match picker.pick(&self.suggested_name)? {
                Some(path) => Box::new(FileSink::create(path)?),
                None => return Ok(None),
            },
            (SinkKind::StreamingDownload, _) => {
                // Try to construct it; anything that fails falls back to buffering.
                match DownloadSink::create(&self.download_dir, &self.suggested_name) {
                    Ok(sink) => Box::new(sink),
                    Err(e) => {
                        warn!(
                            dir = %self.download_dir.display(),
                            fallback = %self.fallback_dir.display(),
                            error = %e,
                            "streaming download unavailable, buffering archive in memory"
                        );
                        self.buffered(&self.fallback_dir)
                    }
                }
            }
            _ => self.buffered(&self.download_dir),
        };
        info!(kind = ?sink.kind(), "archive sink ready");
        Ok(Some(sink))
    }
}

/// `dir/name`, or `dir/stem(n).ext` for the first free `n`.
pub fn unique_destination(dir: &Path, name: &str) -> PathBuf {
    let base = dir.join(name);
    if !base.exists() {
        return base;
    }
    let stem = Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("archive");
    let ext = Path::new(name)
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("");
    let mut counter = 1u32;
    loop {
        let new_name = if ext.is_empty() {
            format!("{}({})", stem, counter)
        } else {
            format!("{}({}).{}", stem, counter, ext)
        };
        let candidate = dir.join(&new_name);
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
