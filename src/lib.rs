//! # exam-img-localize
//!
//! Make a corpus of exam-question records self-contained: every remotely
//! hosted image embedded in a question, option or explanation is downloaded
//! once, and a localized copy of each record points at the local file.
//!
//! ## Pipeline Overview
//!
//! ```text
//! data/raw/<examType>/<examKey>.json
//!  │
//!  ├─ 1. Extract  find <img> tags, canonicalize URLs, record usage sites
//!  ├─ 2. Fetch    download pending registry entries into images/
//!  ├─ 3. Rewrite  src → record-relative images/... href, marker removed
//!  └─ 4. Verify   re-derive the mapping from raw data and diff
//!                                   │
//!                                   ▼
//!                     localized/<examType>/<examKey>.json
//! ```
//!
//! The [`Registry`] (`registry.json`) is the only state shared between
//! stages. It maps each canonical URL to a local path fixed at first
//! registration, a download status and the list of places the image is
//! used. Every stage can be re-run; nothing already downloaded is fetched
//! again.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use exam_img_localize::{localize, LocalizeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = LocalizeConfig::builder().root("/srv/exams").build()?;
//!     let output = localize(&config).await?;
//!     eprintln!(
//!         "{} replaced, {} unresolved, {} mismatches",
//!         output.rewrite.images.replaced,
//!         output.rewrite.images.unresolved,
//!         output.verify.mismatches()
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `imgloc` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! exam-img-localize = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod canonical;
pub mod config;
pub mod corpus;
pub mod error;
pub mod html;
pub mod localize;
pub mod pipeline;
pub mod progress;
pub mod record;
pub mod registry;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use canonical::{canonicalize, local_path_for, LinkBase};
pub use config::{LocalizeConfig, LocalizeConfigBuilder, DEFAULT_USER_AGENT};
pub use corpus::{RecordFile, RunSummary};
pub use error::{FetchError, LocalizeError, RecordError, RegistryFormatError};
pub use html::HtmlError;
pub use localize::{localize, localize_sync, LocalizeOutput};
pub use pipeline::extract::{extract_corpus, extract_into, extract_record, ExtractReport, ImageUsage};
pub use pipeline::fetch::{fetch_pending, FetchOutcome, FetchReport, Fetcher};
pub use pipeline::rewrite::{rewrite_corpus, rewrite_record, RewriteReport, RewriteStats};
pub use pipeline::verify::{
    verify_corpus, verify_record, Mismatch, MismatchKind, RecordVerification, VerificationReport,
};
pub use progress::{FetchProgressCallback, NoopProgressCallback, ProgressCallback};
pub use record::{ExamRecord, Location, SlotSite};
pub use registry::{EntryStatus, Registry, RegistryEntry, RegistryStats, UsageSite};
