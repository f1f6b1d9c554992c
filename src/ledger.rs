//! Append-only, crash-resumable output: one CSV row and one JSONL line per post.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::ser::{Serialize, SerializeMap, Serializer};
use thiserror::Error;
use tracing::{info, warn};

use crate::mechanism::{Mechanism, MECHANISM_COUNT};
use crate::metadata::normalize_post_id;

const CSV_FILE: &str = "predictions.csv";
const JSONL_FILE: &str = "predictions.jsonl";
const STATS_FILE: &str = "stats.json";
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";
const POST_ID_COLUMN: &str = "post_id";

/// Output ledger failures. All of them abort the run.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Filesystem failure.
    #[error("ledger I/O on {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Existing CSV could not be read or a row could not be written.
    #[error("ledger CSV {path}: {source}")]
    Csv {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: csv::Error,
    },
    /// JSON encoding failure.
    #[error("ledger JSON encoding: {0}")]
    Json(#[from] serde_json::Error),
    /// Existing CSV lacks a `post_id` column.
    #[error("existing ledger {path} has no post_id column")]
    MissingColumn {
        /// File involved.
        path: PathBuf,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> LedgerError + '_ {
    move |source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Mechanism column naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnStyle {
    /// `h1..h8`.
    Prefixed,
    /// `1..8`.
    Bare,
}

impl ColumnStyle {
    /// Column name for `mechanism`.
    pub fn column(self, mechanism: Mechanism) -> String {
        match self {
            Self::Prefixed => mechanism.key(),
            Self::Bare => mechanism.number().to_string(),
        }
    }

    /// Full header: `post_id`, mechanisms, `title`, `reasoning`.
    pub fn header(self) -> Vec<String> {
        let mut header = vec![POST_ID_COLUMN.to_string()];
        header.extend(Mechanism::all().map(|m| self.column(m)));
        header.push("title".to_string());
        header.push("reasoning".to_string());
        header
    }
}

/// Terminal outcome for one post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRecord {
    /// Normalized post id.
    pub post_id: String,
    /// One 0/1 label per mechanism, index 0 is mechanism 1.
    pub labels: [u8; MECHANISM_COUNT as usize],
    /// Post title.
    pub title: String,
    /// Rationale or diagnostic text.
    pub reasoning: String,
}

impl OutputRecord {
    /// All-zero record tagged `FAILED:{reason}`.
    pub fn fallback(post_id: &str, title: &str, reason: &str) -> Self {
        Self {
            post_id: normalize_post_id(post_id),
            labels: [0; MECHANISM_COUNT as usize],
            title: title.to_string(),
            reasoning: format!("FAILED:{reason}"),
        }
    }

    fn csv_fields(&self) -> Vec<String> {
        let mut fields = Vec::with_capacity(MECHANISM_COUNT as usize + 3);
        fields.push(self.post_id.clone());
        fields.extend(self.labels.iter().map(u8::to_string));
        fields.push(self.title.clone());
        fields.push(self.reasoning.clone());
        fields
    }
}

/// JSONL view of a record with the ledger's column names, in column order.
struct JsonRow<'a> {
    record: &'a OutputRecord,
    style: ColumnStyle,
}

impl Serialize for JsonRow<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(MECHANISM_COUNT as usize + 3))?;
        map.serialize_entry(POST_ID_COLUMN, &self.record.post_id)?;
        for mechanism in Mechanism::all() {
            map.serialize_entry(&self.style.column(mechanism), &self.record.labels[mechanism.index()])?;
        }
        map.serialize_entry("title", &self.record.title)?;
        map.serialize_entry("reasoning", &self.record.reasoning)?;
        map.end()
    }
}

/// Output file locations inside one directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerPaths {
    /// Output table.
    pub csv: PathBuf,
    /// Resumable log.
    pub jsonl: PathBuf,
    /// Run statistics.
    pub stats: PathBuf,
}

impl LedgerPaths {
    /// Standard file names under `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            csv: dir.join(CSV_FILE),
            jsonl: dir.join(JSONL_FILE),
            stats: dir.join(STATS_FILE),
        }
    }
}

/// Reads completed post ids from an existing output table. Rows with the
/// wrong field count are not counted.
pub fn load_done_ids(path: &Path) -> Result<HashSet<String>, LedgerError> {
    let mut done = HashSet::new();
    let len = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(done),
        Err(err) => return Err(io_err(path)(err)),
    };
    if len == 0 {
        return Ok(done);
    }
    let csv_err = |source| LedgerError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(csv_err)?;
    let headers: Vec<String> = reader
        .headers()
        .map_err(csv_err)?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_lowercase())
        .collect();
    let id_col = headers
        .iter()
        .position(|h| h == POST_ID_COLUMN)
        .ok_or_else(|| LedgerError::MissingColumn {
            path: path.to_path_buf(),
        })?;
    for row in reader.records() {
        let row = row.map_err(csv_err)?;
        if row.len() != headers.len() {
            warn!(path = %path.display(), fields = row.len(), "ignoring torn ledger row");
            continue;
        }
        let post_id = normalize_post_id(row.get(id_col).unwrap_or_default());
        if !post_id.is_empty() {
            done.insert(post_id);
        }
    }
    Ok(done)
}

/// State of the bytes after the last complete line of a ledger file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tail {
    /// Empty file or ends with a newline.
    Clean,
    /// A whole record that only lacks its newline.
    Unterminated,
    /// A partial record starting at this byte offset.
    Torn(u64),
}

/// Scans CSV bytes for the last record boundary. Newlines inside quoted fields
/// do not end a record, and a doubled `""` toggles twice.
fn csv_tail(bytes: &[u8], fields: usize) -> Tail {
    let mut in_quotes = false;
    let mut line_start = 0;
    for (i, &byte) in bytes.iter().enumerate() {
        match byte {
            b'"' => in_quotes = !in_quotes,
            b'\n' if !in_quotes => line_start = i + 1,
            _ => {}
        }
    }
    let tail = &bytes[line_start..];
    if tail.is_empty() {
        return Tail::Clean;
    }
    let count = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(tail)
        .records()
        .next()
        .and_then(Result::ok)
        .map(|row| row.len());
    if !in_quotes && count == Some(fields) {
        Tail::Unterminated
    } else {
        Tail::Torn(line_start as u64)
    }
}

/// A JSONL line is whole when it parses; serialized lines never hold a raw newline.
fn jsonl_tail(bytes: &[u8]) -> Tail {
    let line_start = bytes
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |i| i + 1);
    let tail = &bytes[line_start..];
    if tail.is_empty() {
        Tail::Clean
    } else if serde_json::from_slice::<serde_json::Value>(tail).is_ok() {
        Tail::Unterminated
    } else {
        Tail::Torn(line_start as u64)
    }
}

/// Leaves `path` ending on a complete line: a whole last record gets its
/// newline, a partial one is cut off.
fn repair_tail(path: &Path, inspect: impl FnOnce(&[u8]) -> Tail) -> Result<(), LedgerError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(io_err(path)(err)),
    };
    match inspect(&bytes) {
        Tail::Clean => Ok(()),
        Tail::Unterminated => {
            let mut file = OpenOptions::new()
                .append(true)
                .open(path)
                .map_err(io_err(path))?;
            file.write_all(b"\n").map_err(io_err(path))
        }
        Tail::Torn(at) => {
            warn!(
                path = %path.display(),
                dropped = bytes.len() as u64 - at,
                "truncating torn ledger line"
            );
            let file = OpenOptions::new()
                .write(true)
                .open(path)
                .map_err(io_err(path))?;
            file.set_len(at).map_err(io_err(path))
        }
    }
}

fn open_append(path: &Path, truncate: bool) -> Result<File, LedgerError> {
    let mut options = OpenOptions::new();
    if truncate {
        options.write(true).create(true).truncate(true);
    } else {
        options.append(true).create(true);
    }
    options.open(path).map_err(io_err(path))
}

/// Exclusive writer over the output table and log.
pub struct Ledger {
    paths: LedgerPaths,
    style: ColumnStyle,
    csv: csv::Writer<File>,
    jsonl: File,
    done: HashSet<String>,
    appended: usize,
}

impl Ledger {
    /// Opens the ledger in `dir`. With `resume` the done-set is rebuilt from the
    /// existing table; without it both files are truncated.
    pub fn open(dir: &Path, style: ColumnStyle, resume: bool) -> Result<Self, LedgerError> {
        fs::create_dir_all(dir).map_err(io_err(dir))?;
        let paths = LedgerPaths::in_dir(dir);

        let done = if resume {
            let fields = style.header().len();
            repair_tail(&paths.csv, |bytes| csv_tail(bytes, fields))?;
            repair_tail(&paths.jsonl, jsonl_tail)?;
            load_done_ids(&paths.csv)?
        } else {
            HashSet::new()
        };

        let mut csv_file = open_append(&paths.csv, !resume)?;
        let jsonl = open_append(&paths.jsonl, !resume)?;
        let need_header = csv_file.metadata().map_err(io_err(&paths.csv))?.len() == 0;
        if need_header {
            csv_file.write_all(UTF8_BOM).map_err(io_err(&paths.csv))?;
        }
        let mut csv = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(csv_file);
        if need_header {
            csv.write_record(style.header()).map_err(|source| LedgerError::Csv {
                path: paths.csv.clone(),
                source,
            })?;
            csv.flush().map_err(io_err(&paths.csv))?;
        }
        info!(path = %paths.csv.display(), done = done.len(), resume, "ledger opened");
        Ok(Self {
            paths,
            style,
            csv,
            jsonl,
            done,
            appended: 0,
        })
    }

    /// File locations.
    pub fn paths(&self) -> &LedgerPaths {
        &self.paths
    }

    /// Whether `post_id` already has a record.
    pub fn is_done(&self, post_id: &str) -> bool {
        self.done.contains(&normalize_post_id(post_id))
    }

    /// Posts with a record, including those found on open.
    pub fn done_count(&self) -> usize {
        self.done.len()
    }

    /// Records appended by this process.
    pub fn appended(&self) -> usize {
        self.appended
    }

    /// Writes and flushes one record. Returns `false` without writing when the
    /// post already has one.
    pub fn append(&mut self, record: &OutputRecord) -> Result<bool, LedgerError> {
        let post_id = normalize_post_id(&record.post_id);
        if self.done.contains(&post_id) {
            return Ok(false);
        }
        self.csv
            .write_record(record.csv_fields())
            .map_err(|source| LedgerError::Csv {
                path: self.paths.csv.clone(),
                source,
            })?;
        self.csv.flush().map_err(io_err(&self.paths.csv))?;

        let mut line = serde_json::to_vec(&JsonRow {
            record,
            style: self.style,
        })?;
        line.push(b'\n');
        self.jsonl.write_all(&line).map_err(io_err(&self.paths.jsonl))?;
        self.jsonl.flush().map_err(io_err(&self.paths.jsonl))?;

        self.done.insert(post_id);
        self.appended += 1;
        Ok(true)
    }

    /// Writes `stats` as pretty JSON to the stats file, replacing it.
    pub fn write_stats<T: Serialize>(&self, stats: &T) -> Result<(), LedgerError> {
        let body = serde_json::to_vec_pretty(stats)?;
        fs::write(&self.paths.stats, body).map_err(io_err(&self.paths.stats))
    }
}
