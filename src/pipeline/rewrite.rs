//! Rewriting: produce the localized corpus from the raw one.

use crate::canonical::LinkBase;
use crate::config::LocalizeConfig;
use crate::corpus::{self, RunSummary};
use crate::error::{LocalizeError, RecordError};
use crate::html::{rewrite_images, HtmlError};
use crate::record::ExamRecord;
use crate::registry::{EntryStatus, Registry};
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
use tracing::{debug, info, warn};

/// Per-record (or per-corpus) rewrite counters.
///
/// `replaced + unresolved` equals the number of usages extraction records
/// for the same input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteStats {
    /// Tags now pointing at a local file.
    pub replaced: usize,
    /// Remote tags left as-is: no downloaded entry.
    pub unresolved: usize,
    /// Tags without a remote source (`data:`, already local, no `src`).
    pub ignored: usize,
}

impl AddAssign for RewriteStats {
    fn add_assign(&mut self, rhs: Self) {
        self.replaced += rhs.replaced;
        self.unresolved += rhs.unresolved;
        self.ignored += rhs.ignored;
    }
}

/// Result of a rewrite pass over the corpus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteReport {
    pub files: RunSummary,
    pub images: RewriteStats,
}

/// Localize one record.
///
/// Every tag whose canonical identifier has a `success` entry gets its `src`
/// replaced by an href relative to where the record is written (`links`)
/// and loses the marker attribute. Everything else is copied unchanged.
pub fn rewrite_record(
    record: &ExamRecord,
    registry: &Registry,
    links: &LinkBase,
) -> Result<(ExamRecord, RewriteStats), HtmlError> {
    let mut out = record.clone();
    let mut stats = RewriteStats::default();
    let mut failure = None;

    out.for_each_slot_mut(|_, html| {
        if failure.is_some() {
            return;
        }
        let rewritten = rewrite_images(html, |tag| {
            let Some(canonical) = tag.canonical() else {
                stats.ignored += 1;
                return None;
            };
            match registry.get(&canonical) {
                Some(entry) if entry.status == EntryStatus::Success => {
                    stats.replaced += 1;
                    Some(links.href(&entry.local_path))
                }
                _ => {
                    stats.unresolved += 1;
                    None
                }
            }
        });
        match rewritten {
            Ok(rewritten) => *html = rewritten,
            Err(e) => failure = Some(e),
        }
    });

    match failure {
        Some(e) => Err(e),
        None => Ok((out, stats)),
    }
}

/// Rewrite every raw record into the output directory.
///
/// Each localized record is written at the same relative path it has below
/// the raw directory. Records without images are copied through so the two
/// corpora stay file-for-file aligned.
pub fn rewrite_corpus(
    config: &LocalizeConfig,
    registry: &Registry,
) -> Result<RewriteReport, LocalizeError> {
    let raw_root = config.raw_root();
    let files = corpus::discover(&raw_root)?;
    info!(
        "Rewriting {} records into {}",
        files.len(),
        config.out_root().display()
    );

    let mut report = RewriteReport::default();
    for file in &files {
        let record = match file.load() {
            Ok(r) => r,
            Err(e) => {
                warn!("{}", e);
                report.files.failed += 1;
                continue;
            }
        };

        let links = config.link_base(&file.rel_path);
        let (localized, stats) = match rewrite_record(&record, registry, &links) {
            Ok(done) => done,
            Err(source) => {
                warn!(
                    "{}",
                    RecordError::Markup {
                        path: file.path.clone(),
                        source
                    }
                );
                report.files.failed += 1;
                continue;
            }
        };
        let target = config.localized_file(&file.rel_path);
        if let Err(e) = corpus::write_record(&target, &localized) {
            warn!("{}", e);
            report.files.failed += 1;
            continue;
        }

        debug!(
            "{}: {} replaced, {} unresolved",
            file.rel_path.display(),
            stats.replaced,
            stats.unresolved
        );
        if stats.replaced + stats.unresolved == 0 {
            report.files.skipped += 1;
        } else {
            report.files.processed += 1;
        }
        report.images += stats;
    }

    info!(
        "Rewrite done: {} replaced, {} unresolved across {} files ({} failed)",
        report.images.replaced,
        report.images.unresolved,
        report.files.processed + report.files.skipped,
        report.files.failed
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::extract::{extract_into, extract_record};
    use std::path::Path;

    fn record(html: &str) -> ExamRecord {
        serde_json::from_value(serde_json::json!({
            "results": [{
                "_id": "Maths",
                "questions": [{ "question": { "en": { "content": html } } }]
            }]
        }))
        .unwrap()
    }

    fn content(r: &ExamRecord) -> &str {
        r.slots()[0].1
    }

    fn links(record_file: &str) -> LinkBase {
        LinkBase::new(Path::new("/p"), &Path::new("/p").join(record_file))
    }

    fn registered(r: &ExamRecord) -> Registry {
        let mut reg = Registry::new();
        extract_into(&mut reg, extract_record(r, "t", "k").unwrap());
        reg
    }

    #[test]
    fn success_entry_replaced_and_marker_removed() {
        let r = record(r#"<img data-orsrc="https://h.com/a.png" src="https://cdn.h.com/fly/@w/a.png?v=1">"#);
        let mut reg = registered(&r);
        reg.mark_success("https://h.com/a.png");

        let (out, stats) = rewrite_record(&r, &reg, &links("localized/t/k.json")).unwrap();
        assert_eq!(content(&out), r#"<img src="../../images/h_com/a.png">"#);
        assert_eq!(
            stats,
            RewriteStats {
                replaced: 1,
                unresolved: 0,
                ignored: 0
            }
        );
    }

    #[test]
    fn failed_entry_left_untouched() {
        let html = r#"<p><img data-orsrc="https://h.com/a.png" src="https://h.com/a.png"></p>"#;
        let r = record(html);
        let mut reg = registered(&r);
        reg.mark_failed("https://h.com/a.png", "HTTP 404");

        let (out, stats) = rewrite_record(&r, &reg, &links("localized/t/k.json")).unwrap();
        assert_eq!(content(&out), html);
        assert_eq!(stats.unresolved, 1);
        assert_eq!(stats.replaced, 0);
    }

    #[test]
    fn counts_match_extraction() {
        let r = record(
            r#"<img src="https://h.com/a.png"><img src="data:image/png;base64,A"><img src="https://h.com/b.png"><img src="https://h.com/a.png">"#,
        );
        let usages = extract_record(&r, "t", "k").unwrap();
        let mut reg = Registry::new();
        extract_into(&mut reg, usages.clone());
        reg.mark_success("https://h.com/a.png");

        let (_, stats) = rewrite_record(&r, &reg, &links("localized/t/k.json")).unwrap();
        assert_eq!(stats.replaced + stats.unresolved, usages.len());
        assert_eq!(stats.replaced + stats.unresolved, reg.stats().usage_sites);
        assert_eq!(stats.replaced, 2);
        assert_eq!(stats.ignored, 1);
    }

    #[test]
    fn href_encodes_spaces() {
        let r = record(r#"<img src="https://h.com/my%20dir/a.png">"#);
        let mut reg = registered(&r);
        reg.mark_success("https://h.com/my%20dir/a.png");
        let (out, _) = rewrite_record(&r, &reg, &links("localized/k.json")).unwrap();
        assert_eq!(content(&out), r#"<img src="../images/h_com/my%20dir/a.png">"#);
    }

    #[test]
    fn href_follows_record_depth() {
        let r = record(r#"<img src="https://h.com/a.png">"#);
        let mut reg = registered(&r);
        reg.mark_success("https://h.com/a.png");
        for (file, expected) in [
            ("localized/loose.json", "../images/h_com/a.png"),
            ("localized/jee/main/2021.json", "../../../images/h_com/a.png"),
        ] {
            let (out, _) = rewrite_record(&r, &reg, &links(file)).unwrap();
            assert_eq!(content(&out), format!(r#"<img src="{expected}">"#));
        }
    }

    #[test]
    fn rewrite_leaves_raw_record_unchanged() {
        let r = record(r#"<img src="https://h.com/a.png">"#);
        let before = r.clone();
        let mut reg = registered(&r);
        reg.mark_success("https://h.com/a.png");
        let _ = rewrite_record(&r, &reg, &links("localized/t/k.json")).unwrap();
        assert_eq!(r, before);
    }
}
