//! Verification: audit the localized corpus against the raw one.
//!
//! Canonical identifiers are re-extracted from the raw record with the same
//! algorithm the Extractor uses, and every remote embedding is compared
//! position by position with the `src` the localized record actually holds.
//! Nothing the Rewriter reported is trusted, and nothing is repaired.
//!
//! | Outcome          | Meaning                                                  |
//! |------------------|----------------------------------------------------------|
//! | `matched`        | local href resolves to the expected file, which exists   |
//! | `unresolved`     | still remote, and no downloaded entry exists (partial)   |
//! | `count_mismatch` | structure or `<img>` count differs between the two files |
//! | `not_localized`  | still remote although a downloaded entry exists          |
//! | `path_mismatch`  | local href resolves elsewhere, or the marker is left over |
//! | `missing_file`   | local href is right but the file is not on disk          |
//!
//! Local hrefs are resolved against the directory of the localized record
//! itself, so a link written for the wrong depth is caught here.

use crate::canonical::{is_remote, local_path_for, LinkBase};
use crate::config::LocalizeConfig;
use crate::corpus::{self, RunSummary};
use crate::error::LocalizeError;
use crate::html::{find_images, ImgTag};
use crate::record::{ExamRecord, SlotSite};
use crate::registry::{EntryStatus, Registry};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

/// Mismatch classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchKind {
    CountMismatch,
    NotLocalized,
    PathMismatch,
    MissingFile,
}

/// One detected inconsistency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Mismatch {
    pub kind: MismatchKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<SlotSite>,
    /// Position of the tag within its slot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub found: Option<String>,
    pub detail: String,
}

impl Mismatch {
    fn structural(detail: impl Into<String>) -> Self {
        Self {
            kind: MismatchKind::CountMismatch,
            site: None,
            tag_index: None,
            url: None,
            expected: None,
            found: None,
            detail: detail.into(),
        }
    }
}

/// Verification result for one raw/localized pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordVerification {
    pub file: String,
    pub matched: usize,
    pub unresolved: usize,
    pub mismatches: Vec<Mismatch>,
}

impl RecordVerification {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }

    pub fn count(&self, kind: MismatchKind) -> usize {
        self.mismatches.iter().filter(|m| m.kind == kind).count()
    }
}

/// Corpus-wide diagnostic report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub generated_at: DateTime<Utc>,
    pub files: RunSummary,
    pub matched: usize,
    pub unresolved: usize,
    pub count_mismatch: usize,
    pub not_localized: usize,
    pub path_mismatch: usize,
    pub missing_file: usize,
    /// Records with at least one mismatch.
    pub records: Vec<RecordVerification>,
}

impl VerificationReport {
    fn new() -> Self {
        Self {
            generated_at: Utc::now(),
            files: RunSummary::default(),
            matched: 0,
            unresolved: 0,
            count_mismatch: 0,
            not_localized: 0,
            path_mismatch: 0,
            missing_file: 0,
            records: Vec::new(),
        }
    }

    pub fn mismatches(&self) -> usize {
        self.count_mismatch + self.not_localized + self.path_mismatch + self.missing_file
    }

    pub fn has_mismatches(&self) -> bool {
        self.mismatches() > 0
    }

    fn absorb(&mut self, record: RecordVerification) {
        self.matched += record.matched;
        self.unresolved += record.unresolved;
        self.count_mismatch += record.count(MismatchKind::CountMismatch);
        self.not_localized += record.count(MismatchKind::NotLocalized);
        self.path_mismatch += record.count(MismatchKind::PathMismatch);
        self.missing_file += record.count(MismatchKind::MissingFile);
        if !record.is_clean() {
            self.records.push(record);
        }
    }
}

/// Compare one localized record against its raw source.
///
/// `links` describes where the localized record lives; every local `src`
/// is resolved from there.
pub fn verify_record(
    raw: &ExamRecord,
    localized: &ExamRecord,
    links: &LinkBase,
    registry: &Registry,
) -> RecordVerification {
    let mut out = RecordVerification::default();

    let (raw_shape, loc_shape) = (raw.shape(), localized.shape());
    if raw_shape != loc_shape {
        out.mismatches.push(Mismatch::structural(format!(
            "structure differs: raw {:?}, localized {:?}",
            raw_shape.subjects, loc_shape.subjects
        )));
        return out;
    }

    for ((site, raw_html), (_, loc_html)) in raw.slots().into_iter().zip(localized.slots()) {
        let (raw_tags, loc_tags) = match (find_images(raw_html), find_images(loc_html)) {
            (Ok(r), Ok(l)) => (r, l),
            (Err(e), _) | (_, Err(e)) => {
                out.mismatches.push(Mismatch {
                    site: Some(site),
                    ..Mismatch::structural(e.to_string())
                });
                continue;
            }
        };
        if raw_tags.len() != loc_tags.len() {
            out.mismatches.push(Mismatch {
                expected: Some(raw_tags.len().to_string()),
                found: Some(loc_tags.len().to_string()),
                site: Some(site),
                ..Mismatch::structural("<img> count differs")
            });
            continue;
        }

        for (raw_tag, loc_tag) in raw_tags.iter().zip(&loc_tags) {
            if let Some(m) = check_tag(&site, raw_tag, loc_tag, links, registry, &mut out) {
                out.mismatches.push(m);
            }
        }
    }
    out
}

/// Classify one raw/localized tag pair. Counts `matched`/`unresolved` on
/// `out` and returns any mismatch.
fn check_tag(
    site: &SlotSite,
    raw_tag: &ImgTag,
    loc_tag: &ImgTag,
    links: &LinkBase,
    registry: &Registry,
    out: &mut RecordVerification,
) -> Option<Mismatch> {
    let canonical = raw_tag.canonical()?;
    let entry = registry.get(&canonical);
    let expected = entry
        .map(|e| e.local_path.clone())
        .or_else(|| local_path_for(&canonical))?;
    let found = loc_tag.src().unwrap_or_default().trim().to_string();

    let mismatch = |kind, detail: &str| Mismatch {
        kind,
        site: Some(site.clone()),
        tag_index: Some(raw_tag.index),
        url: Some(canonical.clone()),
        expected: Some(expected.clone()),
        found: Some(found.clone()),
        detail: detail.to_string(),
    };

    if found.is_empty() || is_remote(&found) {
        if entry.is_some_and(|e| e.status == EntryStatus::Success) {
            return Some(mismatch(
                MismatchKind::NotLocalized,
                "remote src despite downloaded entry",
            ));
        }
        out.unresolved += 1;
        return None;
    }

    if loc_tag.original_src().is_some() {
        return Some(mismatch(
            MismatchKind::PathMismatch,
            "marker attribute left on a localized tag",
        ));
    }

    let target = links.target(&expected);
    match links.resolve(&found) {
        Some(path) if path == target => {
            if path.is_file() {
                out.matched += 1;
                None
            } else {
                Some(mismatch(MismatchKind::MissingFile, "local file does not exist"))
            }
        }
        Some(_) => Some(mismatch(
            MismatchKind::PathMismatch,
            "does not resolve to the expected file from the record's directory",
        )),
        None => Some(mismatch(
            MismatchKind::PathMismatch,
            "not a path relative to the record",
        )),
    }
}

/// Verify every raw record against its localized counterpart.
///
/// A raw record without a readable localized counterpart counts as a
/// `count_mismatch` for that file.
pub fn verify_corpus(
    config: &LocalizeConfig,
    registry: &Registry,
) -> Result<VerificationReport, LocalizeError> {
    let files = corpus::discover(&config.raw_root())?;
    info!("Verifying {} records", files.len());

    let mut report = VerificationReport::new();
    for file in &files {
        let raw = match file.load() {
            Ok(r) => r,
            Err(e) => {
                warn!("{}", e);
                report.files.failed += 1;
                continue;
            }
        };

        let localized_path = config.localized_file(&file.rel_path);
        let mut result = if !localized_path.is_file() {
            RecordVerification {
                mismatches: vec![Mismatch::structural("localized record missing")],
                ..RecordVerification::default()
            }
        } else {
            match corpus::load_record(&localized_path) {
                Ok(localized) => {
                    verify_record(&raw, &localized, &config.link_base(&file.rel_path), registry)
                }
                Err(e) => RecordVerification {
                    mismatches: vec![Mismatch::structural(format!("localized record unreadable: {e}"))],
                    ..RecordVerification::default()
                },
            }
        };
        result.file = file.rel_path.to_string_lossy().replace('\\', "/");

        if !result.is_clean() {
            warn!(
                "{}: {} mismatches",
                result.file,
                result.mismatches.len()
            );
        }
        if result.matched + result.unresolved + result.mismatches.len() == 0 {
            report.files.skipped += 1;
        } else {
            report.files.processed += 1;
        }
        report.absorb(result);
    }

    info!(
        "Verification done: {} matched, {} unresolved, {} mismatches",
        report.matched,
        report.unresolved,
        report.mismatches()
    );
    Ok(report)
}
