//! Configuration types for corpus localization.
//!
//! Every stage (extract, fetch, rewrite, verify) reads the same
//! [`LocalizeConfig`], built via its [`LocalizeConfigBuilder`]. Paths are
//! stored relative to [`LocalizeConfig::root`] unless given as absolute
//! paths; the `images/` tree always lives directly under the root because
//! registry local paths are expressed relative to it.

use crate::canonical::{resolve_under, LinkBase};
use crate::error::LocalizeError;
use crate::progress::ProgressCallback;
use std::fmt;
use std::path::{Path, PathBuf};

/// Browser-like identity sent with every image request.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Configuration for a localization run.
///
/// # Example
/// ```rust
/// use exam_img_localize::LocalizeConfig;
///
/// let config = LocalizeConfig::builder()
///     .root("/srv/exams")
///     .request_delay_ms(100)
///     .concurrency(2)
///     .build()
///     .unwrap();
/// assert_eq!(config.registry_file(), std::path::Path::new("/srv/exams/registry.json"));
/// ```
#[derive(Clone)]
pub struct LocalizeConfig {
    /// Project root. `images/` and, by default, everything else live below it.
    pub root: PathBuf,

    /// Directory holding the raw exam records. Default: `data/raw`.
    pub raw_dir: PathBuf,

    /// Directory receiving the localized records. Default: `localized`.
    pub out_dir: PathBuf,

    /// Registry document. Default: `registry.json`.
    pub registry_path: PathBuf,

    /// Per-request timeout in seconds. Default: 30.
    pub timeout_secs: u64,

    /// Politeness delay between image requests in milliseconds. Default: 250.
    pub request_delay_ms: u64,

    /// `User-Agent` header sent with each request.
    pub user_agent: String,

    /// Maximum number of in-flight downloads. Default: 1 (sequential).
    pub concurrency: usize,

    /// Persist the registry after this many status transitions. Default: 25.
    pub checkpoint_every: usize,

    /// Optional progress callback for the Fetcher.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for LocalizeConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            raw_dir: PathBuf::from("data/raw"),
            out_dir: PathBuf::from("localized"),
            registry_path: PathBuf::from("registry.json"),
            timeout_secs: 30,
            request_delay_ms: 250,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            concurrency: 1,
            checkpoint_every: 25,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for LocalizeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalizeConfig")
            .field("root", &self.root)
            .field("raw_dir", &self.raw_dir)
            .field("out_dir", &self.out_dir)
            .field("registry_path", &self.registry_path)
            .field("timeout_secs", &self.timeout_secs)
            .field("request_delay_ms", &self.request_delay_ms)
            .field("user_agent", &self.user_agent)
            .field("concurrency", &self.concurrency)
            .field("checkpoint_every", &self.checkpoint_every)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn FetchProgressCallback>"),
            )
            .finish()
    }
}

impl LocalizeConfig {
    /// Create a new builder for `LocalizeConfig`.
    pub fn builder() -> LocalizeConfigBuilder {
        LocalizeConfigBuilder {
            config: Self::default(),
        }
    }

    /// Absolute-or-root-relative directory of raw records.
    pub fn raw_root(&self) -> PathBuf {
        self.root.join(&self.raw_dir)
    }

    /// Absolute-or-root-relative directory of localized records.
    pub fn out_root(&self) -> PathBuf {
        self.root.join(&self.out_dir)
    }

    /// Registry document location.
    pub fn registry_file(&self) -> PathBuf {
        self.root.join(&self.registry_path)
    }

    /// On-disk location of a registry `localPath` (`images/...`).
    pub fn resolve_local(&self, local_path: &str) -> PathBuf {
        resolve_under(&self.root, local_path)
    }

    /// Where the localized copy of a raw record at `rel_path` is written.
    pub fn localized_file(&self, rel_path: &Path) -> PathBuf {
        self.out_root().join(rel_path)
    }

    /// Relative-link resolver for the localized copy of `rel_path`.
    pub fn link_base(&self, rel_path: &Path) -> LinkBase {
        LinkBase::new(&self.root, &self.localized_file(rel_path))
    }
}

/// Builder for [`LocalizeConfig`].
#[derive(Debug)]
pub struct LocalizeConfigBuilder {
    config: LocalizeConfig,
}

impl LocalizeConfigBuilder {
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.root = root.into();
        self
    }

    pub fn raw_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.raw_dir = dir.into();
        self
    }

    pub fn out_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.out_dir = dir.into();
        self
    }

    pub fn registry_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.registry_path = path.into();
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.config.timeout_secs = secs.max(1);
        self
    }

    pub fn request_delay_ms(mut self, ms: u64) -> Self {
        self.config.request_delay_ms = ms;
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.config.user_agent = ua.into();
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn checkpoint_every(mut self, n: usize) -> Self {
        self.config.checkpoint_every = n.max(1);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<LocalizeConfig, LocalizeError> {
        let c = &self.config;
        if c.user_agent.trim().is_empty() {
            return Err(LocalizeError::InvalidConfig(
                "User-Agent must not be empty".into(),
            ));
        }
        let (raw, out) = (c.raw_root(), c.out_root());
        if raw == out {
            return Err(LocalizeError::InvalidConfig(format!(
                "raw and localized directories must differ, both are '{}'",
                raw.display()
            )));
        }
        if out.starts_with(&raw) {
            return Err(LocalizeError::InvalidConfig(format!(
                "localized directory '{}' must not be inside the raw directory '{}'",
                out.display(),
                raw.display()
            )));
        }
        Ok(self.config)
    }
}
