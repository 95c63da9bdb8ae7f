//! Progress-callback trait for per-image download events.
//!
//! Inject an [`Arc<dyn FetchProgressCallback>`] via
//! [`crate::config::LocalizeConfigBuilder::progress_callback`] to receive
//! events as the Fetcher works through the pending registry entries.
//!
//! # Example
//!
//! ```rust
//! use exam_img_localize::{FetchProgressCallback, LocalizeConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     done: AtomicUsize,
//! }
//!
//! impl FetchProgressCallback for CountingCallback {
//!     fn on_image_complete(&self, url: &str, total: usize, bytes: u64) {
//!         let n = self.done.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{n}/{total} {url} ({bytes} bytes)");
//!     }
//! }
//!
//! let cb = Arc::new(CountingCallback { done: AtomicUsize::new(0) });
//! let config = LocalizeConfig::builder()
//!     .progress_callback(cb as Arc<dyn FetchProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the Fetcher as it processes each pending entry.
///
/// All methods have default no-op implementations. With `concurrency > 1`
/// the per-image methods may be called from different tasks, so shared
/// mutable state needs `Mutex`/atomics.
pub trait FetchProgressCallback: Send + Sync {
    /// Called once, after pre-flight, with the number of entries to download.
    fn on_fetch_start(&self, total: usize) {
        let _ = total;
    }

    /// Called just before the request for `url` is sent.
    fn on_image_start(&self, url: &str, total: usize) {
        let _ = (url, total);
    }

    /// Called when `url` was written to disk (`bytes` long).
    fn on_image_complete(&self, url: &str, total: usize, bytes: u64) {
        let _ = (url, total, bytes);
    }

    /// Called when the download of `url` failed.
    fn on_image_error(&self, url: &str, total: usize, error: &str) {
        let _ = (url, total, error);
    }

    /// Called once after every entry has been attempted.
    fn on_fetch_complete(&self, total: usize, downloaded: usize) {
        let _ = (total, downloaded);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl FetchProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::LocalizeConfig`].
pub type ProgressCallback = Arc<dyn FetchProgressCallback>;
