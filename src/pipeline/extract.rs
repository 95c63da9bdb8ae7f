//! Extraction: discover embedded images and record where each one is used.

use crate::config::LocalizeConfig;
use crate::corpus::{self, RunSummary};
use crate::error::{LocalizeError, RecordError};
use crate::html::{find_images, HtmlError};
use crate::record::ExamRecord;
use crate::registry::{Registry, UsageSite};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// One remote embedding found in a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUsage {
    pub canonical: String,
    pub site: UsageSite,
}

/// Result of an extraction pass over the corpus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractReport {
    /// Files parsed. `skipped` counts parsed files without remote images.
    pub files: RunSummary,
    /// Remote embeddings seen.
    pub usages: usize,
    /// Entries created by this pass.
    pub new_entries: usize,
    /// Registry size after the pass.
    pub total_entries: usize,
}

/// Every remote image embedding in `record`, in document order.
///
/// Tags without a remote canonical identifier (`data:` URIs, local paths,
/// tags without any source) are ignored. Each usage carries the tag's
/// position within its slot, so two embeddings of one image in the same
/// slot stay two usages.
pub fn extract_record(
    record: &ExamRecord,
    exam_type: &str,
    exam_key: &str,
) -> Result<Vec<ImageUsage>, HtmlError> {
    let mut usages = Vec::new();
    for (site, html) in record.slots() {
        for tag in find_images(html)? {
            let Some(canonical) = tag.canonical() else {
                continue;
            };
            usages.push(ImageUsage {
                canonical,
                site: UsageSite {
                    exam_type: exam_type.to_string(),
                    exam_key: exam_key.to_string(),
                    subject: site.subject.clone(),
                    chapter: site.chapter.clone(),
                    question_index: site.question_index,
                    location: site.location.clone(),
                    tag_index: tag.index,
                },
            });
        }
    }
    Ok(usages)
}

/// Register each usage. Returns how many new entries were created.
pub fn extract_into(registry: &mut Registry, usages: Vec<ImageUsage>) -> usize {
    let mut created = 0;
    for usage in usages {
        let is_new = !registry.contains(&usage.canonical);
        match registry.register(&usage.canonical, usage.site) {
            Some(_) if is_new => created += 1,
            Some(_) => {}
            None => warn!("{}: no local path derivable, not registered", usage.canonical),
        }
    }
    created
}

/// Walk the raw corpus and register every embedding.
///
/// Unreadable or unparseable files are logged and counted as failed.
pub fn extract_corpus(
    config: &LocalizeConfig,
    registry: &mut Registry,
) -> Result<ExtractReport, LocalizeError> {
    let raw_root = config.raw_root();
    let files = corpus::discover(&raw_root)?;
    info!("Extracting images from {} records in {}", files.len(), raw_root.display());

    let mut report = ExtractReport::default();
    for file in &files {
        let record = match file.load() {
            Ok(r) => r,
            Err(e) => {
                warn!("{}", e);
                report.files.failed += 1;
                continue;
            }
        };
        let usages = match extract_record(&record, &file.exam_type, &file.exam_key) {
            Ok(u) => u,
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
        if usages.is_empty() {
            report.files.skipped += 1;
            continue;
        }
        debug!("{}: {} embeddings", file.rel_path.display(), usages.len());
        report.usages += usages.len();
        report.new_entries += extract_into(registry, usages);
        report.files.processed += 1;
    }
    report.total_entries = registry.len();

    info!(
        "Extraction done: {} usages, {} new images, {} total ({} files, {} without images, {} failed)",
        report.usages,
        report.new_entries,
        report.total_entries,
        report.files.processed,
        report.files.skipped,
        report.files.failed
    );
    Ok(report)
}
