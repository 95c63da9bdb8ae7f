//! Full-pipeline entry points.
//!
//! [`localize`] runs every stage in order against one registry:
//! extract, checkpoint, fetch, rewrite, verify. Use the functions in
//! [`crate::pipeline`] directly to run a single stage.

use crate::config::LocalizeConfig;
use crate::error::LocalizeError;
use crate::pipeline::extract::{extract_corpus, ExtractReport};
use crate::pipeline::fetch::{FetchReport, Fetcher};
use crate::pipeline::rewrite::{rewrite_corpus, RewriteReport};
use crate::pipeline::verify::{verify_corpus, VerificationReport};
use crate::registry::Registry;
use serde::Serialize;
use std::time::Instant;
use tracing::info;

/// Reports of every stage of one full run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalizeOutput {
    pub extract: ExtractReport,
    pub fetch: FetchReport,
    pub rewrite: RewriteReport,
    pub verify: VerificationReport,
    pub total_duration_ms: u64,
}

/// Localize the whole corpus described by `config`.
///
/// The registry at `config.registry_file()` is loaded (or started empty),
/// extended, filled and saved. Download failures and mismatches are
/// reported, not returned as errors.
///
/// # Errors
/// Only fatal conditions: corrupt registry, unreadable corpus root, HTTP
/// client construction, registry write failures.
pub async fn localize(config: &LocalizeConfig) -> Result<LocalizeOutput, LocalizeError> {
    let start = Instant::now();
    let registry_file = config.registry_file();
    let mut registry = Registry::load_or_default(&registry_file)?;

    // ── Step 1: Extract ──────────────────────────────────────────────────
    let extract = extract_corpus(config, &mut registry)?;
    registry.save(&registry_file)?;

    // ── Step 2: Fetch ────────────────────────────────────────────────────
    let fetcher = Fetcher::new(config)?;
    let fetch = fetcher.fetch_pending(&mut registry, config).await?;

    // ── Step 3: Rewrite ──────────────────────────────────────────────────
    let rewrite = rewrite_corpus(config, &registry)?;

    // ── Step 4: Verify ───────────────────────────────────────────────────
    let verify = verify_corpus(config, &registry)?;

    let total_duration_ms = start.elapsed().as_millis() as u64;
    info!(
        "Localization complete: {} images, {} replaced, {} mismatches, {}ms total",
        registry.len(),
        rewrite.images.replaced,
        verify.mismatches(),
        total_duration_ms
    );

    Ok(LocalizeOutput {
        extract,
        fetch,
        rewrite,
        verify,
        total_duration_ms,
    })
}

/// Synchronous wrapper around [`localize`].
///
/// Creates a temporary tokio runtime internally.
pub fn localize_sync(config: &LocalizeConfig) -> Result<LocalizeOutput, LocalizeError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| LocalizeError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(localize(config))
}
