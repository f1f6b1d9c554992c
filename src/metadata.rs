//! Unified post metadata built from the reference, task and label tables.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::mechanism::Mechanism;
use crate::storage::cover_key;

const POST_ID_COLUMN: &str = "post_id";
const TITLE_COLUMN: &str = "title";

/// Trims and lowercases a raw post identifier.
pub fn normalize_post_id(raw: &str) -> String {
    raw.trim().to_lowercase()
}

fn normalize_header(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}').trim().to_lowercase()
}

/// Failures while loading metadata tables.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// Table file could not be opened.
    #[error("failed to open {path}: {source}")]
    Open {
        /// Table path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// Table is not readable CSV.
    #[error("failed to read CSV from {origin}: {source}")]
    Csv {
        /// Table name or path.
        origin: String,
        /// Underlying CSV error.
        #[source]
        source: csv::Error,
    },
    /// Required column absent from the header.
    #[error("{origin} has no '{column}' column")]
    MissingColumn {
        /// Table name or path.
        origin: String,
        /// Missing column name.
        column: String,
    },
}

/// Immutable per-post record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostRecord {
    /// Normalized identifier.
    pub post_id: String,
    /// Post title.
    pub title: String,
    /// Object-storage key of the cover image.
    pub cover_key: String,
    /// `h1:0, h2:1, ...` from the golden labels, shown with exemplars.
    pub reference_labels: Option<String>,
}

impl PostRecord {
    /// Record for `post_id` with its cover key derived from the id.
    pub fn new(post_id: &str, title: &str, reference_labels: Option<String>) -> Self {
        let post_id = normalize_post_id(post_id);
        Self {
            cover_key: cover_key(&post_id),
            post_id,
            title: title.trim().to_string(),
            reference_labels,
        }
    }
}

/// Which corpus a source table feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceRole {
    /// Labeled posts eligible as exemplars.
    Reference,
    /// Posts to annotate.
    Task,
}

/// Keyed record store with ordered reference and task id lists.
#[derive(Debug, Default)]
pub struct MetadataStore {
    records: HashMap<String, PostRecord>,
    reference_ids: Vec<String>,
    reference_seen: HashSet<String>,
    task_ids: Vec<String>,
    task_seen: HashSet<String>,
}

impl MetadataStore {
    /// Loads a `post_id,title` table from disk.
    pub fn add_source_path(&mut self, path: &Path, role: SourceRole) -> Result<usize, MetadataError> {
        let file = File::open(path).map_err(|source| MetadataError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let added = self.add_source(file, role, &path.display().to_string())?;
        info!(path = %path.display(), ?role, rows = added, "loaded metadata source");
        Ok(added)
    }

    /// Loads a `post_id,title` table. Earlier records win; rows without an id
    /// are skipped. Returns the number of rows listed under `role`.
    pub fn add_source<R: Read>(
        &mut self,
        reader: R,
        role: SourceRole,
        origin: &str,
    ) -> Result<usize, MetadataError> {
        let mut csv = csv_reader(reader);
        let headers = read_headers(&mut csv, origin)?;
        let id_col = require_column(&headers, POST_ID_COLUMN, origin)?;
        let title_col = headers.iter().position(|h| h == TITLE_COLUMN);

        let mut listed = 0usize;
        for row in csv.records() {
            let row = row.map_err(|source| MetadataError::Csv {
                origin: origin.to_string(),
                source,
            })?;
            let post_id = normalize_post_id(row.get(id_col).unwrap_or_default());
            if post_id.is_empty() {
                continue;
            }
            let title = title_col.and_then(|col| row.get(col)).unwrap_or_default();
            self.records
                .entry(post_id.clone())
                .or_insert_with(|| PostRecord::new(&post_id, title, None));
            let newly_listed = match role {
                SourceRole::Reference => push_unique(&mut self.reference_ids, &mut self.reference_seen, post_id),
                SourceRole::Task => push_unique(&mut self.task_ids, &mut self.task_seen, post_id),
            };
            if newly_listed {
                listed += 1;
            }
        }
        Ok(listed)
    }

    /// Merges a golden-label table from disk.
    pub fn merge_labels_path(&mut self, path: &Path) -> Result<usize, MetadataError> {
        let file = File::open(path).map_err(|source| MetadataError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let merged = self.merge_labels(file, &path.display().to_string())?;
        info!(path = %path.display(), merged, "merged reference labels");
        Ok(merged)
    }

    /// Attaches `h1:0, h2:1, ...` label strings to known posts. Columns may be
    /// named `1..8` or `h1..h8`; nonzero numbers count as 1.
    pub fn merge_labels<R: Read>(&mut self, reader: R, origin: &str) -> Result<usize, MetadataError> {
        let mut csv = csv_reader(reader);
        let headers = read_headers(&mut csv, origin)?;
        let id_col = require_column(&headers, POST_ID_COLUMN, origin)?;
        let label_cols: Vec<(Mechanism, usize)> = Mechanism::all()
            .filter_map(|mechanism| {
                let bare = mechanism.number().to_string();
                let prefixed = mechanism.key();
                headers
                    .iter()
                    .position(|h| *h == bare || *h == prefixed)
                    .map(|col| (mechanism, col))
            })
            .collect();
        if label_cols.is_empty() {
            return Err(MetadataError::MissingColumn {
                origin: origin.to_string(),
                column: "h1..h8".to_string(),
            });
        }

        let mut merged = 0usize;
        for row in csv.records() {
            let row = row.map_err(|source| MetadataError::Csv {
                origin: origin.to_string(),
                source,
            })?;
            let post_id = normalize_post_id(row.get(id_col).unwrap_or_default());
            let Some(record) = self.records.get_mut(&post_id) else {
                debug!(post_id = %post_id, "label row for unknown post ignored");
                continue;
            };
            let labels: Vec<String> = label_cols
                .iter()
                .map(|(mechanism, col)| {
                    let bit = binarize(row.get(*col).unwrap_or_default());
                    format!("{}:{}", mechanism.key(), bit)
                })
                .collect();
            record.reference_labels = Some(labels.join(", "));
            merged += 1;
        }
        Ok(merged)
    }

    /// Record for `post_id` (normalized before lookup).
    pub fn get(&self, post_id: &str) -> Option<&PostRecord> {
        self.records.get(&normalize_post_id(post_id))
    }

    /// Task ids in first-seen order.
    pub fn task_ids(&self) -> &[String] {
        &self.task_ids
    }

    /// Reference ids in first-seen order, excluding any id that is also a task.
    pub fn reference_ids(&self) -> impl Iterator<Item = &str> {
        self.reference_ids
            .iter()
            .filter(|id| !self.task_seen.contains(*id))
            .map(String::as_str)
    }

    /// Whether `post_id` is in the task set.
    pub fn is_task(&self, post_id: &str) -> bool {
        self.task_seen.contains(&normalize_post_id(post_id))
    }

    /// Number of distinct records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no records were loaded.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn push_unique(list: &mut Vec<String>, seen: &mut HashSet<String>, id: String) -> bool {
    if seen.insert(id.clone()) {
        list.push(id);
        true
    } else {
        false
    }
}

fn binarize(raw: &str) -> u8 {
    match raw.trim().parse::<f64>() {
        Ok(value) if value != 0.0 && !value.is_nan() => 1,
        _ => 0,
    }
}

fn csv_reader<R: Read>(reader: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Fields)
        .from_reader(reader)
}

fn read_headers<R: Read>(csv: &mut csv::Reader<R>, origin: &str) -> Result<Vec<String>, MetadataError> {
    let headers = csv.headers().map_err(|source| MetadataError::Csv {
        origin: origin.to_string(),
        source,
    })?;
    Ok(headers.iter().map(normalize_header).collect())
}

fn require_column(headers: &[String], column: &str, origin: &str) -> Result<usize, MetadataError> {
    headers
        .iter()
        .position(|h| h == column)
        .ok_or_else(|| MetadataError::MissingColumn {
            origin: origin.to_string(),
            column: column.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> MetadataStore {
        let mut store = MetadataStore::default();
        let reference = "\u{feff}Post_ID , Title\nR1,first ref\n r2 ,second ref\n,no id\nT1,shared with task\n";
        let task = "post_id,title\nt1,task title\nT2,another task\nt2,dup\n";
        assert_eq!(store.add_source(reference.as_bytes(), SourceRole::Reference, "ref").unwrap(), 3);
        assert_eq!(store.add_source(task.as_bytes(), SourceRole::Task, "task").unwrap(), 2);
        store
    }

    #[test]
    fn normalizes_ids_and_keeps_first_record() {
        let store = store();
        assert_eq!(store.len(), 4);
        let r2 = store.get(" R2").unwrap();
        assert_eq!(r2.title, "second ref");
        assert_eq!(r2.cover_key, "downloads/r2/cover.jpg");
        // the reference table saw t1 first
        assert_eq!(store.get("t1").unwrap().title, "shared with task");
        assert_eq!(store.task_ids(), &["t1".to_string(), "t2".to_string()]);
    }

    #[test]
    fn reference_ids_exclude_tasks() {
        let store = store();
        let refs: Vec<&str> = store.reference_ids().collect();
        assert_eq!(refs, vec!["r1", "r2"]);
        assert!(store.is_task("T1"));
    }

    #[test]
    fn merges_binarized_labels() {
        let mut store = store();
        let labels = "post_id,1,2,3,4,5,6,7,8\nr1,1,0,2,,x,0.0,-1,0\nghost,1,1,1,1,1,1,1,1\n";
        assert_eq!(store.merge_labels(labels.as_bytes(), "labels").unwrap(), 1);
        assert_eq!(
            store.get("r1").unwrap().reference_labels.as_deref(),
            Some("h1:1, h2:0, h3:1, h4:0, h5:0, h6:0, h7:1, h8:0")
        );
        assert_eq!(store.get("r2").unwrap().reference_labels, None);
    }

    #[test]
    fn prefixed_label_columns_are_accepted() {
        let mut store = store();
        let labels = "post_id,h5,h7\nr2,1,0\n";
        store.merge_labels(labels.as_bytes(), "labels").unwrap();
        assert_eq!(
            store.get("r2").unwrap().reference_labels.as_deref(),
            Some("h5:1, h7:0")
        );
    }

    #[test]
    fn missing_columns_are_errors() {
        let mut store = MetadataStore::default();
        let err = store
            .add_source("id,title\n1,x\n".as_bytes(), SourceRole::Task, "bad")
            .unwrap_err();
        assert!(matches!(err, MetadataError::MissingColumn { ref column, .. } if column == "post_id"));
        let err = store.merge_labels("post_id,foo\n1,x\n".as_bytes(), "labels").unwrap_err();
        assert!(matches!(err, MetadataError::MissingColumn { .. }));
    }
}
