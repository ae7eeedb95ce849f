//! Offline builder for `captureIds.json`.
//!
//! The console names captures with an AES-128-ECB encryption of the game's
//! title ID. Given the key and local title database dumps, this module derives
//! each capture ID, merges the dumps (later sources win) and writes the table
//! next to a `captureIds.meta.json` describing where it came from.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use anyhow::{bail, Context};
use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::ser::PrettyFormatter;
use tracing::{debug, info, warn};

use crate::capture::sanitize_game_name;

static RELEASE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<release>(.*?)</release>").unwrap());
static TITLE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<titleid>\s*(.*?)\s*</titleid>").unwrap());
static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<name>\s*(.*?)\s*</name>").unwrap());
static REGION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<region>\s*(.*?)\s*</region>").unwrap());

/// The key that maps title IDs to capture IDs.
pub struct CaptureIdKey(Aes128);

impl CaptureIdKey {
    /// Parse a 32-digit hex key.
    pub fn from_hex(key: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(key.trim()).context("capture ID key is not valid hex")?;
        if bytes.len() != 16 {
            bail!("capture ID key must be 16 bytes, got {}", bytes.len());
        }
        Ok(Self(Aes128::new(GenericArray::from_slice(&bytes))))
    }

    /// Capture ID for a title ID (first 16 hex digits are used), or `None`
    /// when it is not hex.
    pub fn capture_id(&self, title_id: &str) -> Option<String> {
        let head = title_id.get(..16)?;
        let mut title = hex::decode(head).ok()?;
        title.reverse();
        let mut block = aes::Block::default();
        block[..8].copy_from_slice(&title);
        self.0.encrypt_block(&mut block);
        Some(hex::encode_upper(block))
    }
}

/// `"<name> (<region>)"`, with the worldwide code spelled out.
pub fn titled_name(name: &str, region: Option<&str>) -> String {
    let name = sanitize_game_name(name);
    match region.map(str::trim).filter(|r| !r.is_empty() && *r != "None") {
        Some("WLD") => format!("{name} (EUR USA)"),
        Some(region) => format!("{name} ({region})"),
        None => name,
    }
}

/// Title database dump formats, in the order they are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpFormat {
    /// nswdb.com `xml.php` release list
    Nswdb,
    /// blawar titledb `US.en.json`
    Titledb,
}

impl DumpFormat {
    pub fn name(self) -> &'static str {
        match self {
            DumpFormat::Nswdb => "nswdb",
            DumpFormat::Titledb => "titledb",
        }
    }
}

/// One title from a dump, before its ID is encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpEntry {
    pub title_id: String,
    pub name: String,
    pub region: Option<String>,
}

#[derive(Deserialize)]
struct TitledbEntry {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "isDemo")]
    is_demo: Option<bool>,
}

fn parse_titledb(text: &str) -> anyhow::Result<Vec<DumpEntry>> {
    let raw: HashMap<String, TitledbEntry> = serde_json::from_str(text)?;
    Ok(raw
        .into_values()
        .filter(|e| !e.is_demo.unwrap_or(false))
        .filter_map(|e| {
            Some(DumpEntry {
                title_id: e.id?,
                name: e.name?,
                // The US.en dump only lists the US storefront.
                region: Some("USA".to_string()),
            })
        })
        .collect())
}

fn tag_value(re: &Regex, release: &str) -> Option<String> {
    re.captures(release)
        .map(|c| decode_entities(&c[1]))
        .filter(|v| !v.is_empty())
}

fn parse_nswdb(text: &str) -> Vec<DumpEntry> {
    RELEASE_RE
        .captures_iter(text)
        .filter_map(|release| {
            let body = release.get(1)?.as_str();
            Some(DumpEntry {
                title_id: tag_value(&TITLE_ID_RE, body)?,
                name: tag_value(&NAME_RE, body)?,
                region: tag_value(&REGION_RE, body),
            })
        })
        .collect()
}

fn decode_entities(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

pub fn read_dump(format: DumpFormat, path: &Path) -> anyhow::Result<Vec<DumpEntry>> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    match format {
        DumpFormat::Titledb => {
            parse_titledb(&text).with_context(|| format!("parsing {}", path.display()))
        }
        DumpFormat::Nswdb => Ok(parse_nswdb(&text)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMetadata {
    pub count: usize,
    pub fetched_at: String,
    pub source_updated_at: Option<String>,
}

/// Contents of `captureIds.meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMetadata {
    pub total_count: usize,
    pub generated_at: String,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceMetadata>,
}

/// `captureIds.json` -> `captureIds.meta.json`
pub fn metadata_path(table: &Path) -> PathBuf {
    table.with_extension("meta.json")
}

pub fn read_metadata(path: &Path) -> anyhow::Result<TableMetadata> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// Accumulates capture IDs from several dumps.
pub struct TableBuilder<'k> {
    key: &'k CaptureIdKey,
    names: HashMap<String, String>,
    sources: BTreeMap<String, SourceMetadata>,
    now: DateTime<Utc>,
}

impl<'k> TableBuilder<'k> {
    pub fn new(key: &'k CaptureIdKey) -> Self {
        Self {
            key,
            names: HashMap::new(),
            sources: BTreeMap::new(),
            now: Utc::now(),
        }
    }

    /// Start from an existing table; dumps added later override its names.
    pub fn with_existing(mut self, existing: HashMap<String, String>) -> Self {
        self.names.extend(existing);
        self
    }

    /// Merge one dump's titles. Returns how many capture IDs it produced.
    pub fn add(&mut self, format: DumpFormat, entries: Vec<DumpEntry>, updated_at: Option<DateTime<Utc>>) -> usize {
        let mut ids = HashMap::new();
        let mut skipped = 0usize;
        for entry in entries {
            match self.key.capture_id(&entry.title_id) {
                Some(id) => {
                    ids.insert(id, titled_name(&entry.name, entry.region.as_deref()));
                }
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            debug!(source = format.name(), skipped, "skipped titles without a hex title ID");
        }
        let count = ids.len();
        info!(source = format.name(), count, "merged title dump");
        self.names.extend(ids);
        self.sources.insert(
            format.name().to_string(),
            SourceMetadata {
                count,
                fetched_at: rfc3339(self.now),
                source_updated_at: updated_at.map(rfc3339),
            },
        );
        count
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Entries sorted by name (case-insensitive) and the metadata describing
    /// them. Sources not merged this time keep their `previous` record.
    pub fn finish(self, previous: Option<TableMetadata>) -> (Vec<(String, String)>, TableMetadata) {
        let mut sources = previous.map(|m| m.sources).unwrap_or_default();
        sources.extend(self.sources);

        let mut entries: Vec<(String, String)> = self.names.into_iter().collect();
        entries.sort_by(|a, b| {
            a.1.to_lowercase()
                .cmp(&b.1.to_lowercase())
                .then_with(|| a.0.cmp(&b.0))
        });
        let metadata = TableMetadata {
            total_count: entries.len(),
            generated_at: rfc3339(self.now),
            sources,
        };
        (entries, metadata)
    }
}

struct InOrder<'a>(&'a [(String, String)]);

impl Serialize for InOrder<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|(id, name)| (id, name)))
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T, indent: &[u8]) -> anyhow::Result<()> {
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(indent));
    value.serialize(&mut ser)?;
    buf.push(b'\n');
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, buf).with_context(|| format!("writing {}", path.display()))
}

/// Settings for one table build.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// `captureIds.json` to write; the metadata goes next to it
    pub output: PathBuf,
    pub nswdb: Option<PathBuf>,
    pub titledb: Option<PathBuf>,
    /// Merge into the current contents of `output` instead of replacing them
    pub keep_existing: bool,
    /// Report what would be written without touching disk
    pub dry_run: bool,
}

fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    fs::metadata(path).and_then(|m| m.modified()).ok().map(DateTime::<Utc>::from)
}

/// Build `captureIds.json` and its metadata from the dumps in `options`.
pub fn build_table(options: &BuildOptions, key: &CaptureIdKey) -> anyhow::Result<TableMetadata> {
    let mut builder = TableBuilder::new(key);
    if options.keep_existing && options.output.exists() {
        let text = fs::read_to_string(&options.output)
            .with_context(|| format!("reading {}", options.output.display()))?;
        let existing: HashMap<String, String> = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", options.output.display()))?;
        info!(count = existing.len(), "loaded existing capture IDs");
        builder = builder.with_existing(existing);
    }

    // titledb has the most complete names, so it is merged last.
    for (format, path) in [
        (DumpFormat::Nswdb, &options.nswdb),
        (DumpFormat::Titledb, &options.titledb),
    ] {
        if let Some(path) = path {
            let entries = read_dump(format, path)?;
            builder.add(format, entries, modified_at(path));
        }
    }

    if builder.is_empty() {
        bail!("no capture IDs found in any source");
    }

    let meta_path = metadata_path(&options.output);
    let previous = if meta_path.exists() {
        match read_metadata(&meta_path) {
            Ok(meta) => Some(meta),
            Err(e) => {
                let msg = format!("{e:#}");
                warn!(error = %msg, "ignoring unreadable table metadata");
                None
            }
        }
    } else {
        None
    };

    let (entries, metadata) = builder.finish(previous);
    if options.dry_run {
        info!(count = entries.len(), "dry run, not writing capture IDs");
        return Ok(metadata);
    }
    write_json(&options.output, &InOrder(&entries), b"    ")?;
    write_json(&meta_path, &metadata, b"  ")?;
    info!(count = entries.len(), path = %options.output.display(), "saved capture IDs");
    Ok(metadata)
}
