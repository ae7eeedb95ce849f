use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use encoding_rs::SHIFT_JIS;
use tracing::debug;
use walkdir::WalkDir;
use zip::ZipArchive;

use crate::capture::is_capture_filename;

/// Folder name of previously organized output; never scanned.
pub const OUTPUT_DIR_NAME: &str = "Organized";

/// Reads one source file's bytes on demand.
pub trait PayloadProvider: Send + Sync {
    fn read(&self) -> io::Result<Vec<u8>>;
}

/// A capture-shaped file found during scanning.
#[derive(Clone)]
pub struct SourceFile {
    pub filename: String,
    pub payload: Arc<dyn PayloadProvider>,
}

impl SourceFile {
    pub fn new(filename: impl Into<String>, payload: impl PayloadProvider + 'static) -> Self {
        Self {
            filename: filename.into(),
            payload: Arc::new(payload),
        }
    }
}

impl std::fmt::Debug for SourceFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceFile")
            .field("filename", &self.filename)
            .finish_non_exhaustive()
    }
}

/// Produces the ordered list of source files for a run.
pub trait SourceEnumerator {
    fn enumerate(&self) -> anyhow::Result<Vec<SourceFile>>;
}

impl SourceEnumerator for Vec<SourceFile> {
    fn enumerate(&self) -> anyhow::Result<Vec<SourceFile>> {
        Ok(self.clone())
    }
}

/// Bytes already in memory.
pub struct InMemory(pub Vec<u8>);

impl PayloadProvider for InMemory {
    fn read(&self) -> io::Result<Vec<u8>> {
        Ok(self.0.clone())
    }
}

/// A file on disk.
pub struct FsPayload(pub PathBuf);

impl PayloadProvider for FsPayload {
    fn read(&self) -> io::Result<Vec<u8>> {
        fs::read(&self.0)
    }
}

/// Recursive directory walk, file names sorted within each directory.
pub struct DirectorySource {
    root: PathBuf,
    exclude_dirs: Vec<String>,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            exclude_dirs: vec![OUTPUT_DIR_NAME.to_string()],
        }
    }

    pub fn exclude_dir(mut self, name: impl Into<String>) -> Self {
        self.exclude_dirs.push(name.into());
        self
    }
}

impl SourceEnumerator for DirectorySource {
    fn enumerate(&self) -> anyhow::Result<Vec<SourceFile>> {
        let mut files = Vec::new();
        let walker = WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0
                    || !e.file_type().is_dir()
                    || !self
                        .exclude_dirs
                        .iter()
                        .any(|x| e.file_name().to_str() == Some(x.as_str()))
            });
        for entry in walker {
            let entry = entry.with_context(|| format!("scanning {}", self.root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(filename) = entry.file_name().to_str() else {
                continue;
            };
            if !is_capture_filename(filename) {
                continue;
            }
            files.push(SourceFile::new(filename, FsPayload(entry.path().to_path_buf())));
        }
        debug!(root = %self.root.display(), found = files.len(), "directory scan complete");
        Ok(files)
    }
}

/// Decode a zip entry name, trying UTF-8 first, then Shift_JIS.
fn decode_entry_name(raw: &[u8]) -> String {
    if let Ok(s) = std::str::from_utf8(raw) {
        return s.to_string();
    }
    let (decoded, _, had_errors) = SHIFT_JIS.decode(raw);
    if !had_errors {
        return decoded.into_owned();
    }
    String::from_utf8_lossy(raw).into_owned()
}

/// Entries of an album exported as a zip file, in central-directory order.
pub struct ZipSource {
    path: PathBuf,
}

impl ZipSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

struct ZipEntryPayload {
    archive: Arc<Mutex<ZipArchive<File>>>,
    index: usize,
}

/// Cap on how much a zip header's declared size may preallocate.
const MAX_PREALLOC: u64 = 64 * 1024 * 1024;

fn preallocation(declared: u64) -> usize {
    declared.min(MAX_PREALLOC) as usize
}

impl PayloadProvider for ZipEntryPayload {
    fn read(&self) -> io::Result<Vec<u8>> {
        let mut archive = self.archive.lock().unwrap_or_else(|e| e.into_inner());
        let mut entry = archive.by_index(self.index).map_err(io::Error::other)?;
        let mut bytes = Vec::with_capacity(preallocation(entry.size()));
        entry.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

impl SourceEnumerator for ZipSource {
    fn enumerate(&self) -> anyhow::Result<Vec<SourceFile>> {
        let file = File::open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        let mut archive = ZipArchive::new(file)
            .with_context(|| format!("reading {}", self.path.display()))?;

        let mut found = Vec::new();
        for i in 0..archive.len() {
            let entry = archive.by_index_raw(i)?;
            if entry.is_dir() {
                continue;
            }
            let entry_path = decode_entry_name(entry.name_raw());
            if entry_path
                .split('/')
                .any(|component| component == OUTPUT_DIR_NAME)
            {
                continue;
            }
            let filename = entry_path.rsplit('/').next().unwrap_or("").to_string();
            if is_capture_filename(&filename) {
                found.push((i, filename));
            }
        }

        let shared = Arc::new(Mutex::new(archive));
        Ok(found
            .into_iter()
            .map(|(index, filename)| {
                SourceFile::new(
                    filename,
                    ZipEntryPayload {
                        archive: Arc::clone(&shared),
                        index,
                    },
                )
            })
            .collect())
    }
}

/// A directory or a `.zip` file.
pub fn open_source(path: &Path) -> Box<dyn SourceEnumerator> {
    let is_zip = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("zip"));
    if is_zip && path.is_file() {
        Box::new(ZipSource::new(path))
    } else {
        Box::new(DirectorySource::new(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    const ID: &str = "0123456789ABCDEF0123456789ABCDEF";

    fn capture(day: u32) -> String {
        format!("202301{day:02}12000000-{ID}.jpg")
    }

    #[test]
    fn test_directory_scan_order_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let album = dir.path().join("Nintendo/Album/2023/01");
        fs::create_dir_all(album.join("02")).unwrap();
        fs::create_dir_all(album.join("01")).unwrap();
        fs::create_dir_all(dir.path().join(OUTPUT_DIR_NAME).join("Game")).unwrap();

        fs::write(album.join("02").join(capture(2)), b"two").unwrap();
        fs::write(album.join("01").join(capture(1)), b"one").unwrap();
        fs::write(album.join("01").join("notes.txt"), b"skip").unwrap();
        fs::write(dir.path().join(OUTPUT_DIR_NAME).join("Game").join(capture(3)), b"old").unwrap();

        let files = DirectorySource::new(dir.path()).enumerate().unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(names, vec![capture(1), capture(2)]);
        assert_eq!(files[1].payload.read().unwrap(), b"two");
    }

    #[test]
    fn test_zip_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("album.zip");
        let mut zw = zip::ZipWriter::new(File::create(&path).unwrap());
        let opts = SimpleFileOptions::default();
        zw.add_directory("Album/", opts).unwrap();
        zw.start_file(format!("Album/{}", capture(5)), opts).unwrap();
        zw.write_all(b"five").unwrap();
        zw.start_file("Album/readme.txt", opts).unwrap();
        zw.write_all(b"-").unwrap();
        zw.start_file(format!("{}/{}", OUTPUT_DIR_NAME, capture(6)), opts).unwrap();
        zw.write_all(b"six").unwrap();
        zw.finish().unwrap();

        let files = open_source(&path).enumerate().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].filename, capture(5));
        assert_eq!(files[0].payload.read().unwrap(), b"five");
    }

    #[test]
    fn test_decode_shift_jis_name() {
        let (raw, _, _) = SHIFT_JIS.encode("スクリーンショット.jpg");
        assert_eq!(decode_entry_name(&raw), "スクリーンショット.jpg");
    }

    #[test]
    fn test_declared_zip_size_does_not_drive_allocation() {
        assert_eq!(preallocation(1234), 1234);
        assert_eq!(preallocation(u64::MAX), MAX_PREALLOC as usize);
    }
}
