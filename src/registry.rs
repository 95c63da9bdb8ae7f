//! The image registry: canonical URL → local path, status and usage history.
//!
//! The registry is the only state shared between pipeline stages. It is an
//! append-only discovery log: entries are created by extraction, mutated in
//! place by the Fetcher (status, error) and by later extraction passes
//! (usage accrual), and never deleted.
//!
//! ## Status machine
//!
//! ```text
//! pending ──▶ success            (terminal; only usage sites accrue)
//!    │
//!    └──────▶ failed ──▶ pending (requeued by the next Fetcher run)
//! ```
//!
//! ## Persistence
//!
//! One JSON document, written atomically (temp file in the same directory,
//! then rename). Loading skips individual entries that fail to parse instead
//! of rejecting the whole document.

use crate::canonical::{local_path_for, resolve_under};
use crate::error::{LocalizeError, RegistryFormatError};
use crate::record::Location;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info, warn};

/// One place where an image is embedded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSite {
    pub exam_type: String,
    pub exam_key: String,
    pub subject: String,
    pub chapter: String,
    pub question_index: usize,
    pub location: Location,
    /// Position of the `<img>` within its slot.
    #[serde(default)]
    pub tag_index: usize,
}

/// Download status of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    #[default]
    Pending,
    Success,
    Failed,
}

/// Everything the registry knows about one canonical image URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub url: String,
    /// `/`-separated path below the project root, fixed at first registration.
    pub local_path: String,
    pub status: EntryStatus,
    pub used_in: Vec<UsageSite>,
    pub error: Option<String>,
}

impl RegistryEntry {
    pub fn usage_count(&self) -> usize {
        self.used_in.len()
    }

    fn add_usage(&mut self, usage: UsageSite) -> bool {
        if self.used_in.contains(&usage) {
            false
        } else {
            self.used_in.push(usage);
            true
        }
    }
}

/// Totals per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total: usize,
    pub pending: usize,
    pub downloaded: usize,
    pub failed: usize,
    pub usage_sites: usize,
}

/// On-disk form of an entry.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedEntry {
    url: String,
    local_path: String,
    #[serde(default)]
    status: EntryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default)]
    usage_count: usize,
    #[serde(default)]
    used_in: Vec<Value>,
}

/// On-disk form of the whole registry.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegistryDocument {
    generated_at: DateTime<Utc>,
    total_images: usize,
    downloaded: usize,
    failed: usize,
    images: Vec<PersistedEntry>,
}

/// In-memory registry. Insertion order is preserved.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    entries: Vec<RegistryEntry>,
    index: HashMap<String, usize>,
    /// Owner of each local path.
    paths: HashMap<String, usize>,
}

/// `images/h/a.png` → `images/h/a_2.png`
fn numbered_path(path: &str, n: usize) -> String {
    let (dir, name) = match path.rsplit_once('/') {
        Some((dir, name)) => (format!("{dir}/"), name),
        None => (String::new(), path),
    };
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{dir}{stem}_{n}.{ext}"),
        _ => format!("{dir}{name}_{n}"),
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, url: &str) -> bool {
        self.index.contains_key(url)
    }

    pub fn get(&self, url: &str) -> Option<&RegistryEntry> {
        self.index.get(url).map(|&i| &self.entries[i])
    }

    fn get_mut(&mut self, url: &str) -> Option<&mut RegistryEntry> {
        match self.index.get(url) {
            Some(&i) => Some(&mut self.entries[i]),
            None => None,
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.iter()
    }

    /// Stored local path for `url`, if registered.
    pub fn path_for(&self, url: &str) -> Option<&str> {
        self.get(url).map(|e| e.local_path.as_str())
    }

    /// Create the entry for `url` or add `usage` to the existing one.
    ///
    /// Returns `None` when no local path can be derived from `url`.
    /// Registering the same usage twice is a no-op. When the derived path is
    /// already owned by another URL, the new entry gets a numbered sibling
    /// (`a_2.png`) so no two entries share a file.
    pub fn register(&mut self, url: &str, usage: UsageSite) -> Option<&RegistryEntry> {
        if let Some(&i) = self.index.get(url) {
            let entry = &mut self.entries[i];
            if entry.add_usage(usage) {
                debug!("{}: usage {} recorded", url, entry.usage_count());
            }
            return Some(&self.entries[i]);
        }

        let local_path = self.unclaimed_path(url, local_path_for(url)?);
        let i = self.entries.len();
        self.paths.insert(local_path.clone(), i);
        self.entries.push(RegistryEntry {
            url: url.to_string(),
            local_path,
            status: EntryStatus::Pending,
            used_in: vec![usage],
            error: None,
        });
        self.index.insert(url.to_string(), i);
        Some(&self.entries[i])
    }

    fn unclaimed_path(&self, url: &str, derived: String) -> String {
        if !self.paths.contains_key(&derived) {
            return derived;
        }
        let path = (2..)
            .map(|n| numbered_path(&derived, n))
            .find(|p| !self.paths.contains_key(p))
            .unwrap_or(derived.clone());
        warn!(
            "{}: local path '{}' already used by {}, storing at '{}'",
            url, derived, self.entries[self.paths[&derived]].url, path
        );
        path
    }

    /// Mark `url` as downloaded. Returns `false` for unknown URLs.
    pub fn mark_success(&mut self, url: &str) -> bool {
        match self.get_mut(url) {
            Some(entry) => {
                entry.status = EntryStatus::Success;
                entry.error = None;
                true
            }
            None => false,
        }
    }

    /// Record a failed download. Ignored (returns `false`) for success entries.
    pub fn mark_failed(&mut self, url: &str, error: impl Into<String>) -> bool {
        match self.get_mut(url) {
            Some(entry) if entry.status != EntryStatus::Success => {
                entry.status = EntryStatus::Failed;
                entry.error = Some(error.into());
                true
            }
            Some(_) => {
                warn!("{}: ignoring failure for an entry already downloaded", url);
                false
            }
            None => false,
        }
    }

    /// Move every failed entry back to pending. The last error is kept until
    /// the next attempt replaces or clears it.
    pub fn requeue_failed(&mut self) -> usize {
        let mut n = 0;
        for entry in &mut self.entries {
            if entry.status == EntryStatus::Failed {
                entry.status = EntryStatus::Pending;
                n += 1;
            }
        }
        n
    }

    /// Pre-flight: mark every non-success entry whose file already exists
    /// below `root` as success. Returns how many entries changed.
    pub fn reconcile_with_disk(&mut self, root: &Path) -> usize {
        let mut n = 0;
        for entry in &mut self.entries {
            if entry.status != EntryStatus::Success
                && resolve_under(root, &entry.local_path).is_file()
            {
                debug!("{}: already on disk", entry.url);
                entry.status = EntryStatus::Success;
                entry.error = None;
                n += 1;
            }
        }
        n
    }

    /// `(url, local_path)` of every pending entry, in registration order.
    pub fn pending(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .filter(|e| e.status == EntryStatus::Pending)
            .map(|e| (e.url.clone(), e.local_path.clone()))
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let mut s = RegistryStats {
            total: self.entries.len(),
            ..RegistryStats::default()
        };
        for e in &self.entries {
            match e.status {
                EntryStatus::Pending => s.pending += 1,
                EntryStatus::Success => s.downloaded += 1,
                EntryStatus::Failed => s.failed += 1,
            }
            s.usage_sites += e.used_in.len();
        }
        s
    }

    // ── Persistence ─────────────────────────────────────────────────────

    /// Load a registry that must already exist.
    pub fn load(path: &Path) -> Result<Self, LocalizeError> {
        if !path.exists() {
            return Err(LocalizeError::RegistryMissing {
                path: path.to_path_buf(),
            });
        }
        let text =
            std::fs::read_to_string(path).map_err(|source| LocalizeError::RegistryReadFailed {
                path: path.to_path_buf(),
                source,
            })?;
        let registry = Self::from_json(&text).map_err(|source| LocalizeError::RegistryCorrupt {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded registry {} ({} images)", path.display(), registry.len());
        Ok(registry)
    }

    /// Load the registry at `path`, or start empty when it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, LocalizeError> {
        match Self::load(path) {
            Err(LocalizeError::RegistryMissing { .. }) => {
                info!("No registry at {}; starting empty", path.display());
                Ok(Self::new())
            }
            other => other,
        }
    }

    /// Parse a registry document, skipping entries that do not parse.
    ///
    /// Fails only when the document itself is not a JSON object.
    pub fn from_json(text: &str) -> Result<Self, RegistryFormatError> {
        let doc: Value = serde_json::from_str(text)?;
        let Value::Object(mut doc) = doc else {
            return Err(RegistryFormatError::NotAnObject);
        };

        let images = match doc.remove("images") {
            Some(Value::Array(items)) => items,
            None | Some(Value::Null) => Vec::new(),
            Some(_) => return Err(RegistryFormatError::ImagesNotArray),
        };

        let mut registry = Self::new();
        let mut skipped = 0usize;
        for (i, item) in images.into_iter().enumerate() {
            match Self::entry_from_value(item) {
                Ok(entry) => registry.insert_loaded(entry),
                Err(reason) => {
                    warn!("Registry entry #{} skipped: {}", i, reason);
                    skipped += 1;
                }
            }
        }
        if skipped > 0 {
            warn!("{} unreadable registry entries ignored", skipped);
        }
        Ok(registry)
    }

    fn entry_from_value(item: Value) -> Result<RegistryEntry, String> {
        let p: PersistedEntry = serde_json::from_value(item).map_err(|e| e.to_string())?;
        if p.url.is_empty() {
            return Err("empty url".into());
        }
        if p.local_path.is_empty() || p.local_path.split('/').any(|s| s == "..") {
            return Err(format!("unsafe localPath '{}'", p.local_path));
        }

        let mut used_in = Vec::with_capacity(p.used_in.len());
        for site in p.used_in {
            match serde_json::from_value::<UsageSite>(site) {
                Ok(site) if !used_in.contains(&site) => used_in.push(site),
                Ok(_) => {}
                Err(e) => warn!("{}: usage site skipped: {}", p.url, e),
            }
        }

        Ok(RegistryEntry {
            url: p.url,
            local_path: p.local_path,
            status: p.status,
            used_in,
            error: p.error,
        })
    }

    fn insert_loaded(&mut self, entry: RegistryEntry) {
        if let Some(existing) = self.get_mut(&entry.url) {
            warn!("{}: duplicate registry entry merged", entry.url);
            if entry.status == EntryStatus::Success {
                existing.status = EntryStatus::Success;
                existing.error = None;
            }
            for site in entry.used_in {
                existing.add_usage(site);
            }
            return;
        }
        let i = self.entries.len();
        if let Some(&owner) = self.paths.get(&entry.local_path) {
            warn!(
                "{}: localPath '{}' also claimed by {}",
                entry.url, entry.local_path, self.entries[owner].url
            );
        } else {
            self.paths.insert(entry.local_path.clone(), i);
        }
        self.index.insert(entry.url.clone(), i);
        self.entries.push(entry);
    }

    /// Serialise the registry document.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let stats = self.stats();
        let doc = RegistryDocument {
            generated_at: Utc::now(),
            total_images: stats.total,
            downloaded: stats.downloaded,
            failed: stats.failed,
            images: self
                .entries
                .iter()
                .map(|e| {
                    Ok(PersistedEntry {
                        url: e.url.clone(),
                        local_path: e.local_path.clone(),
                        status: e.status,
                        error: e.error.clone(),
                        usage_count: e.used_in.len(),
                        used_in: e
                            .used_in
                            .iter()
                            .map(serde_json::to_value)
                            .collect::<Result<_, _>>()?,
                    })
                })
                .collect::<Result<_, serde_json::Error>>()?,
        };
        serde_json::to_string_pretty(&doc)
    }

    /// Write the registry to `path` atomically.
    pub fn save(&self, path: &Path) -> Result<(), LocalizeError> {
        let write_err = |source| LocalizeError::RegistryWriteFailed {
            path: path.to_path_buf(),
            source,
        };
        let json = self
            .to_json()
            .map_err(|e| LocalizeError::Internal(format!("registry serialisation: {e}")))?;

        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(write_err)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        tmp.write_all(json.as_bytes()).map_err(write_err)?;
        tmp.write_all(b"\n").map_err(write_err)?;
        tmp.persist(path).map_err(|e| write_err(e.error))?;

        debug!("Registry checkpoint: {} ({} images)", path.display(), self.len());
        Ok(())
    }
}
