//! Corpus traversal: discover record files below a root directory.
//!
//! The layout is `<root>/<examType>/<examKey>.json`. Files are yielded in
//! sorted order so every stage visits the corpus identically.

use crate::error::{LocalizeError, RecordError};
use crate::record::ExamRecord;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// One record file found in the corpus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFile {
    /// Full path on disk.
    pub path: PathBuf,
    /// Path relative to the corpus root.
    pub rel_path: PathBuf,
    /// First directory below the root; empty for files at the root.
    pub exam_type: String,
    /// File stem.
    pub exam_key: String,
}

impl RecordFile {
    /// Read and parse the record.
    pub fn load(&self) -> Result<ExamRecord, RecordError> {
        load_record(&self.path)
    }
}

/// Per-file outcome counts for one corpus-level stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.processed + self.skipped + self.failed
    }
}

/// Parse one record file.
pub fn load_record(path: &Path) -> Result<ExamRecord, RecordError> {
    let text = std::fs::read_to_string(path).map_err(|source| RecordError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    ExamRecord::from_json(&text).map_err(|source| RecordError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Write a record as pretty JSON, creating parent directories.
pub fn write_record(path: &Path, record: &ExamRecord) -> Result<(), RecordError> {
    let write_err = |source| RecordError::Write {
        path: path.to_path_buf(),
        source,
    };
    let json = record
        .to_json_pretty()
        .map_err(|e| write_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }
    std::fs::write(path, format!("{json}\n")).map_err(write_err)
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

/// List every `*.json` record below `root`, sorted by relative path.
///
/// Entries that cannot be read during the walk are logged and skipped; only
/// a missing or unreadable root is fatal.
pub fn discover(root: &Path) -> Result<Vec<RecordFile>, LocalizeError> {
    if !root.is_dir() {
        return Err(LocalizeError::CorpusUnreadable {
            path: root.to_path_buf(),
            detail: "not a directory".into(),
        });
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) if e.depth() == 0 => {
                return Err(LocalizeError::CorpusUnreadable {
                    path: root.to_path_buf(),
                    detail: e.to_string(),
                })
            }
            Err(e) => {
                warn!("Skipping unreadable corpus entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() || !is_json(entry.path()) {
            continue;
        }

        let Ok(rel_path) = entry.path().strip_prefix(root).map(Path::to_path_buf) else {
            continue;
        };
        let exam_type = if rel_path.components().count() > 1 {
            rel_path
                .components()
                .next()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            String::new()
        };
        let exam_key = rel_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        files.push(RecordFile {
            path: entry.path().to_path_buf(),
            rel_path,
            exam_type,
            exam_key,
        });
    }

    debug!("Discovered {} record files under {}", files.len(), root.display());
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str, body: &str) {
        let p = root.join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, body).unwrap();
    }

    #[test]
    fn discovers_sorted_json_only() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "neet/2020.json", "{}");
        touch(dir.path(), "jee-main/2022.json", "{}");
        touch(dir.path(), "jee-main/2021.JSON", "{}");
        touch(dir.path(), "jee-main/notes.txt", "x");

        let files = discover(dir.path()).unwrap();
        let rels: Vec<_> = files
            .iter()
            .map(|f| (f.exam_type.as_str(), f.exam_key.as_str()))
            .collect();
        assert_eq!(
            rels,
            [("jee-main", "2021"), ("jee-main", "2022"), ("neet", "2020")]
        );
    }

    #[test]
    fn root_level_file_has_empty_exam_type() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "loose.json", "{}");
        let files = discover(dir.path()).unwrap();
        assert_eq!(files[0].exam_type, "");
        assert_eq!(files[0].exam_key, "loose");
        assert_eq!(files[0].rel_path, PathBuf::from("loose.json"));
    }

    #[test]
    fn missing_root_is_fatal() {
        let dir = TempDir::new().unwrap();
        let err = discover(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, LocalizeError::CorpusUnreadable { .. }));
    }

    #[test]
    fn load_reports_parse_errors() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "t/bad.json", "{ not json");
        let files = discover(dir.path()).unwrap();
        assert!(matches!(files[0].load(), Err(RecordError::Parse { .. })));
    }

    #[test]
    fn write_creates_parents() {
        let dir = TempDir::new().unwrap();
        let record = ExamRecord::from_json(r#"{"results":[]}"#).unwrap();
        let out = dir.path().join("localized/t/k.json");
        write_record(&out, &record).unwrap();
        assert!(load_record(&out).is_ok());
    }

    #[test]
    fn summary_total() {
        let s = RunSummary {
            processed: 2,
            skipped: 1,
            failed: 3,
        };
        assert_eq!(s.total(), 6);
    }
}
