//! Streaming ZIP writer.
//!
//! Entries are stored (no compression) through `zip::ZipWriter`. The zip
//! writer patches each local header once the entry body is complete, so the
//! bytes of the entry being written stay in a seekable [`Spool`] window. When
//! the zip writer moves on to the next entry it flushes, and the window is
//! committed to an output queue. Drained in order, the queued chunks form a
//! valid archive.

use std::collections::VecDeque;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{Datelike, NaiveDateTime, Timelike};
use thiserror::Error;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

const U16_LIMIT: usize = 0xFFFF;
const U32_LIMIT: u64 = 0xFFFF_FFFF;
/// `-rw-r--r--`
const UNIX_FILE_MODE: u32 = 0o644;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("entry path is empty or absolute")]
    InvalidPath,
    #[error("entry path is {0} bytes, longer than 65535")]
    PathTooLong(usize),
    #[error("timestamp {0} is outside the DOS date range 1980-2107")]
    TimestampOutOfRange(NaiveDateTime),
    #[error("archive already finished")]
    Finished,
    #[error("previous entry was never written")]
    EntryInProgress,
    #[error("zip encoding failed: {0}")]
    Zip(#[from] ZipError),
    #[error("zip output failed: {0}")]
    Io(#[from] io::Error),
}

/// Name and mtime of one entry.
#[derive(Debug, Clone)]
pub struct EntryMeta {
    pub path: String,
    pub modified: NaiveDateTime,
}

#[derive(Default)]
struct SpoolState {
    queue: VecDeque<Vec<u8>>,
    queued: usize,
    /// Absolute offset of `window[0]`; everything before it is queued.
    committed: u64,
    window: Vec<u8>,
    pos: u64,
}

impl SpoolState {
    fn end(&self) -> u64 {
        self.committed + self.window.len() as u64
    }

    fn commit(&mut self) {
        let chunk = mem::take(&mut self.window);
        if chunk.is_empty() {
            return;
        }
        self.committed += chunk.len() as u64;
        self.queued += chunk.len();
        self.queue.push_back(chunk);
    }
}

/// `Write + Seek` target for the zip writer.
///
/// Seeking is allowed anywhere inside the uncommitted window. `flush` moves
/// the window to the output queue, after which those bytes are final.
#[derive(Clone, Default)]
struct Spool(Arc<Mutex<SpoolState>>);

impl Spool {
    fn lock(&self) -> MutexGuard<'_, SpoolState> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Write for Spool {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut s = self.lock();
        if s.pos < s.committed {
            return Err(io::Error::other("write into committed output"));
        }
        let start = (s.pos - s.committed) as usize;
        let end = start + buf.len();
        if end > s.window.len() {
            s.window.resize(end, 0);
        }
        s.window[start..end].copy_from_slice(buf);
        s.pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock().commit();
        Ok(())
    }
}

// Required by zip 2.x for `set_flush_on_finish_file`; the writer never reads
// back on the paths used here.
impl Read for Spool {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "spool is write-only",
        ))
    }
}

impl Seek for Spool {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let mut s = self.lock();
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(d) => s.end().checked_add_signed(d),
            SeekFrom::Current(d) => s.pos.checked_add_signed(d),
        };
        match target {
            Some(t) if t >= s.committed => {
                s.pos = t;
                Ok(t)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before committed output",
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    InEntry,
    Finished,
}

/// Incremental ZIP encoder with an explicit output queue.
pub struct ContainerWriter {
    zip: Option<ZipWriter<Spool>>,
    spool: Spool,
    entries: usize,
    state: State,
}

impl Default for ContainerWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerWriter {
    pub fn new() -> Self {
        let spool = Spool::default();
        let mut zip = ZipWriter::new(spool.clone());
        zip.set_flush_on_finish_file(true);
        Self {
            zip: Some(zip),
            spool,
            entries: 0,
            state: State::Open,
        }
    }

    /// Begin an entry. The returned [`Entry`] must be written before another
    /// entry can be started.
    pub fn add_entry(&mut self, meta: EntryMeta) -> Result<Entry<'_>, EncodeError> {
        match self.state {
            State::Open => {}
            State::InEntry => return Err(EncodeError::EntryInProgress),
            State::Finished => return Err(EncodeError::Finished),
        }
        if meta.path.is_empty() || meta.path.starts_with('/') {
            return Err(EncodeError::InvalidPath);
        }
        if meta.path.len() > U16_LIMIT {
            return Err(EncodeError::PathTooLong(meta.path.len()));
        }
        let modified = zip_datetime(&meta.modified)?;
        self.state = State::InEntry;
        Ok(Entry {
            writer: self,
            path: meta.path,
            modified,
        })
    }

    /// Emit the central directory and end records. Callable once.
    pub fn finish(&mut self) -> Result<(), EncodeError> {
        match self.state {
            State::Open => {}
            State::InEntry => return Err(EncodeError::EntryInProgress),
            State::Finished => return Err(EncodeError::Finished),
        }
        self.state = State::Finished;
        let zip = self.zip.take().ok_or(EncodeError::Finished)?;
        let mut spool = zip.finish()?;
        spool.flush()?;
        Ok(())
    }

    /// Take queued chunks in emission order.
    pub fn drain(&mut self) -> impl Iterator<Item = Vec<u8>> {
        let mut s = self.spool.lock();
        s.queued = 0;
        mem::take(&mut s.queue).into_iter()
    }

    /// Bytes held by the writer: queued chunks plus the open entry's window.
    pub fn pending_bytes(&self) -> usize {
        let s = self.spool.lock();
        s.queued + s.window.len()
    }

    /// Total bytes committed to the queue so far.
    pub fn bytes_emitted(&self) -> u64 {
        self.spool.lock().committed
    }

    pub fn entry_count(&self) -> usize {
        self.entries
    }

    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }
}

/// An entry that has been started but not written.
///
/// Dropping it without calling [`Entry::write`] leaves the writer unusable;
/// the run is expected to abort in that case.
pub struct Entry<'w> {
    writer: &'w mut ContainerWriter,
    path: String,
    modified: DateTime,
}

impl Entry<'_> {
    /// Push the entry's whole payload. The entry's bytes reach the queue once
    /// the next entry starts or the archive is finished.
    pub fn write(self, data: Vec<u8>) -> Result<(), EncodeError> {
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .last_modified_time(self.modified)
            .unix_permissions(UNIX_FILE_MODE)
            .large_file(data.len() as u64 >= U32_LIMIT);
        let zip = self.writer.zip.as_mut().ok_or(EncodeError::Finished)?;
        zip.start_file(self.path, options)?;
        zip.write_all(&data)?;
        self.writer.entries += 1;
        self.writer.state = State::Open;
        Ok(())
    }
}

/// Local calendar fields as a DOS timestamp; seconds keep 2-second resolution.
fn zip_datetime(dt: &NaiveDateTime) -> Result<DateTime, EncodeError> {
    let out_of_range = || EncodeError::TimestampOutOfRange(*dt);
    let year = u16::try_from(dt.year()).map_err(|_| out_of_range())?;
    DateTime::from_date_and_time(
        year,
        dt.month() as u8,
        dt.day() as u8,
        dt.hour() as u8,
        dt.minute() as u8,
        dt.second() as u8,
    )
    .map_err(|_| out_of_range())
}
