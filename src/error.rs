//! Error types for the exam-img-localize library.
//!
//! Three error types reflect three distinct failure scopes:
//!
//! * [`LocalizeError`] (**fatal**): the stage cannot proceed at all
//!   (registry missing or corrupt, corpus root unreadable, bad config).
//!   Returned as `Err(LocalizeError)` from the corpus-level entry points.
//!
//! * [`RecordError`] (**per file**): one record could not be read, parsed or
//!   written. The file is skipped and counted in the stage's
//!   [`crate::corpus::RunSummary`]; the remaining files are still processed.
//!
//! * [`FetchError`] (**per entry**): one image download failed (timeout,
//!   non-2xx, connection reset). Recorded on the registry entry and retried
//!   on the next Fetcher run; never fatal to the batch.

use crate::html::HtmlError;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the exam-img-localize library.
#[derive(Debug, Error)]
pub enum LocalizeError {
    // ── Registry errors ───────────────────────────────────────────────────
    /// The registry file does not exist but this stage needs it as input.
    #[error("Registry not found: '{path}'\nRun `imgloc extract` (and `imgloc fetch`) first.")]
    RegistryMissing { path: PathBuf },

    /// The registry document is not valid JSON at the top level.
    #[error("Registry '{path}' is corrupt: {source}\nRefusing to overwrite it; move it aside and re-run extraction.")]
    RegistryCorrupt {
        path: PathBuf,
        #[source]
        source: RegistryFormatError,
    },

    /// Could not read the registry file.
    #[error("Failed to read registry '{path}': {source}")]
    RegistryReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not write the registry checkpoint.
    #[error("Failed to write registry '{path}': {source}")]
    RegistryWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Corpus errors ─────────────────────────────────────────────────────
    /// The corpus root directory could not be read.
    #[error("Corpus directory '{path}' is unreadable: {detail}")]
    CorpusUnreadable { path: PathBuf, detail: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The HTTP client could not be constructed.
    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Why a registry document was rejected as a whole.
#[derive(Debug, Error)]
pub enum RegistryFormatError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("top level is not an object")]
    NotAnObject,

    #[error("`images` is not an array")]
    ImagesNotArray,
}

/// A non-fatal error for a single record file.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to scan HTML in '{path}': {source}")]
    Markup {
        path: PathBuf,
        #[source]
        source: HtmlError,
    },

    #[error("Failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A non-fatal error for a single image download.
///
/// Its `Display` form is what gets persisted as the registry entry's `error`.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum FetchError {
    /// The request did not complete within the configured timeout.
    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The server answered with a status outside 200–299.
    #[error("HTTP {status}")]
    Http { status: u16 },

    /// Connection refused, reset, DNS failure, body stream interrupted, …
    #[error("network error: {detail}")]
    Network { detail: String },

    /// The body could not be written to the local path.
    #[error("write failed for '{path}': {detail}")]
    Io { path: String, detail: String },

    /// The canonical URL in the registry does not parse.
    #[error("invalid url: {detail}")]
    InvalidUrl { detail: String },
}

impl FetchError {
    /// Classify a `reqwest` error.
    pub fn from_reqwest(err: &reqwest::Error, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            FetchError::Timeout { secs: timeout_secs }
        } else if let Some(status) = err.status() {
            FetchError::Http {
                status: status.as_u16(),
            }
        } else if err.is_builder() {
            FetchError::InvalidUrl {
                detail: err.to_string(),
            }
        } else {
            FetchError::Network {
                detail: err.to_string(),
            }
        }
    }
}
