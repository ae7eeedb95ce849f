use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;

use anyhow::Context;
use chrono::{Datelike, Timelike};
use serde::Serialize;
use zip::ZipArchive;

use crate::capture::parse_capture_filename;

/// Result of checking a produced archive.
#[derive(Debug, Default, Serialize)]
pub struct VerifyReport {
    pub entries: usize,
    /// Folder name -> number of captures in it
    pub folders: BTreeMap<String, usize>,
    pub problems: Vec<String>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Check that every entry is `<folder>/<capture filename>` with an mtime
/// matching the timestamp in its name.
pub fn verify_archive(path: &Path) -> anyhow::Result<VerifyReport> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    verify_reader(file).with_context(|| format!("verifying {}", path.display()))
}

pub fn verify_reader<R: Read + Seek>(reader: R) -> anyhow::Result<VerifyReport> {
    let mut archive = ZipArchive::new(reader)?;
    let mut report = VerifyReport::default();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        report.entries += 1;
        let name = entry.name().to_string();

        let Some((folder, filename)) = name.split_once('/') else {
            report.problems.push(format!("{name}: not inside a game folder"));
            continue;
        };
        if folder.is_empty() || filename.contains('/') {
            report.problems.push(format!("{name}: unexpected nesting"));
            continue;
        }
        *report.folders.entry(folder.to_string()).or_default() += 1;

        let record = match parse_capture_filename(filename, None) {
            Ok(record) => record,
            Err(reason) => {
                report.problems.push(format!("{name}: {reason}"));
                continue;
            }
        };

        let expected = record.modification_time();
        match entry.last_modified() {
            Some(mtime) => {
                let got = (
                    mtime.year() as i32,
                    mtime.month() as u32,
                    mtime.day() as u32,
                    mtime.hour() as u32,
                    mtime.minute() as u32,
                    mtime.second() as u32,
                );
                // DOS timestamps keep even seconds only.
                let want = (
                    expected.year(),
                    expected.month(),
                    expected.day(),
                    expected.hour(),
                    expected.minute(),
                    expected.second() / 2 * 2,
                );
                if got != want {
                    report.problems.push(format!(
                        "{name}: modified time {}-{:02}-{:02} {:02}:{:02}:{:02} does not match {}",
                        got.0, got.1, got.2, got.3, got.4, got.5, expected
                    ));
                }
            }
            None => report.problems.push(format!("{name}: no modified time")),
        }

        // Reading the body makes the zip crate check the CRC.
        std::io::copy(&mut entry, &mut std::io::sink())
            .with_context(|| format!("reading {name}"))?;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerWriter, EntryMeta};
    use std::io::Cursor;

    const NAME: &str = "2021100816450300-0123456789ABCDEF0123456789ABCDEF.mp4";

    fn build(entries: &[(&str, chrono::NaiveDateTime)]) -> Vec<u8> {
        let mut w = ContainerWriter::new();
        for (path, modified) in entries {
            w.add_entry(EntryMeta {
                path: path.to_string(),
                modified: *modified,
            })
            .unwrap()
            .write(b"data".to_vec())
            .unwrap();
        }
        w.finish().unwrap();
        w.drain().flatten().collect()
    }

    #[test]
    fn test_verify_clean_archive() {
        let ts = parse_capture_filename(NAME, None).unwrap().timestamp;
        let path = format!("Metroid Dread/{NAME}");
        let bytes = build(&[(path.as_str(), ts)]);
        let report = verify_reader(Cursor::new(bytes)).unwrap();
        assert!(report.is_ok(), "{:?}", report.problems);
        assert_eq!(report.entries, 1);
        assert_eq!(report.folders.get("Metroid Dread"), Some(&1));
    }

    #[test]
    fn test_verify_flags_problems() {
        let ts = parse_capture_filename(NAME, None).unwrap().timestamp;
        let wrong = ts + chrono::TimeDelta::hours(1);
        let path = format!("Game/{NAME}");
        let bytes = build(&[
            (path.as_str(), wrong),
            (NAME, ts),
            ("Game/readme.txt", ts),
        ]);
        let report = verify_reader(Cursor::new(bytes)).unwrap();
        assert_eq!(report.problems.len(), 3);
    }
}
