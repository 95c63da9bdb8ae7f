//! Fetching: download every pending registry entry to its local path.
//!
//! ## Flow
//!
//! 1. failed entries are requeued as pending
//! 2. pre-flight: pending entries whose file already exists become success
//! 3. each remaining pending entry is downloaded once: GET, 2xx required,
//!    body streamed to `<localPath>.part`, renamed into place
//!
//! Request starts are paced by one shared `tokio::time::interval` of
//! `request_delay_ms`, so the outbound rate stays the same whatever the
//! concurrency. Downloads run through `buffer_unordered(concurrency)`. The pending list is
//! deduplicated by the registry itself, so each canonical URL is owned by
//! exactly one task, and every status transition is applied by the loop
//! that owns the `&mut Registry`. The registry is checkpointed to disk every
//! `checkpoint_every` transitions and once more at the end.

use crate::canonical::resolve_under;
use crate::config::LocalizeConfig;
use crate::error::{FetchError, LocalizeError};
use crate::registry::{EntryStatus, Registry};
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Result of one download attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Downloaded { bytes: u64 },
    Failed(FetchError),
}

/// Totals of a Fetcher run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchReport {
    /// Entries a request was issued for.
    pub attempted: usize,
    pub downloaded: usize,
    pub failed: usize,
    /// Pending entries found on disk during pre-flight.
    pub already_present: usize,
    /// Entries that were already `success` before this run.
    pub skipped_success: usize,
    /// Failed entries moved back to pending at the start of the run.
    pub requeued: usize,
    pub duration_ms: u64,
}

/// HTTP downloader bound to one project root.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    root: PathBuf,
    timeout_secs: u64,
    delay: Duration,
}

impl Fetcher {
    /// Build the HTTP client from `config`.
    pub fn new(config: &LocalizeConfig) -> Result<Self, LocalizeError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.timeout_secs.min(10)))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| LocalizeError::HttpClient(e.to_string()))?;

        Ok(Self {
            client,
            root: config.root.clone(),
            timeout_secs: config.timeout_secs,
            delay: Duration::from_millis(config.request_delay_ms),
        })
    }

    /// Download `url` to `local_path` (relative to the root).
    ///
    /// The body is streamed to a `.part` sibling and renamed on completion,
    /// so a partially written file never sits at the final path.
    pub async fn fetch_one(&self, url: &str, local_path: &str) -> Result<u64, FetchError> {
        let url = reqwest::Url::parse(url).map_err(|e| FetchError::InvalidUrl {
            detail: e.to_string(),
        })?;
        let target = resolve_under(&self.root, local_path);
        let part = part_path(&target);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(&e, self.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
            });
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }

        match self.stream_to(response, &part).await {
            Ok(bytes) => {
                tokio::fs::rename(&part, &target)
                    .await
                    .map_err(|e| io_error(&target, e))?;
                Ok(bytes)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                Err(e)
            }
        }
    }

    async fn stream_to(&self, response: reqwest::Response, part: &Path) -> Result<u64, FetchError> {
        let mut file = tokio::fs::File::create(part)
            .await
            .map_err(|e| io_error(part, e))?;
        let mut body = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| FetchError::from_reqwest(&e, self.timeout_secs))?;
            file.write_all(&chunk).await.map_err(|e| io_error(part, e))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| io_error(part, e))?;
        Ok(written)
    }

    /// Shared request pacer. The first tick completes immediately, each later
    /// one `delay` after the previous request started.
    fn pacer(&self) -> Option<Mutex<Interval>> {
        if self.delay.is_zero() {
            return None;
        }
        let mut interval = tokio::time::interval(self.delay);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(Mutex::new(interval))
    }

    /// Process every pending entry of `registry`.
    ///
    /// Individual download failures are recorded on their entries; only a
    /// failure to write the final registry checkpoint is returned as `Err`.
    pub async fn fetch_pending(
        &self,
        registry: &mut Registry,
        config: &LocalizeConfig,
    ) -> Result<FetchReport, LocalizeError> {
        let start = Instant::now();
        let registry_file = config.registry_file();
        let progress = config.progress_callback.clone();

        let mut report = FetchReport {
            skipped_success: registry
                .entries()
                .filter(|e| e.status == EntryStatus::Success)
                .count(),
            ..FetchReport::default()
        };
        report.requeued = registry.requeue_failed();
        report.already_present = registry.reconcile_with_disk(&self.root);

        let pending = registry.pending();
        let total = pending.len();
        info!(
            "Fetching {} images ({} already downloaded, {} found on disk, {} requeued)",
            total, report.skipped_success, report.already_present, report.requeued
        );
        if let Some(ref cb) = progress {
            cb.on_fetch_start(total);
        }

        let pacer = self.pacer();
        let pacer = pacer.as_ref();
        let mut since_checkpoint = report.already_present;
        let mut results = stream::iter(pending.into_iter().map(|(url, local)| {
            let progress = progress.clone();
            async move {
                if let Some(pacer) = pacer {
                    pacer.lock().await.tick().await;
                }
                if let Some(ref cb) = progress {
                    cb.on_image_start(&url, total);
                }
                let outcome = match self.fetch_one(&url, &local).await {
                    Ok(bytes) => FetchOutcome::Downloaded { bytes },
                    Err(e) => FetchOutcome::Failed(e),
                };
                if let Some(ref cb) = progress {
                    match &outcome {
                        FetchOutcome::Downloaded { bytes } => cb.on_image_complete(&url, total, *bytes),
                        FetchOutcome::Failed(e) => cb.on_image_error(&url, total, &e.to_string()),
                    }
                }
                (url, outcome)
            }
        }))
        .buffer_unordered(config.concurrency);

        while let Some((url, outcome)) = results.next().await {
            report.attempted += 1;
            match outcome {
                FetchOutcome::Downloaded { bytes } => {
                    debug!("{}: {} bytes", url, bytes);
                    registry.mark_success(&url);
                    report.downloaded += 1;
                }
                FetchOutcome::Failed(e) => {
                    warn!("{}: {}", url, e);
                    registry.mark_failed(&url, e.to_string());
                    report.failed += 1;
                }
            }

            since_checkpoint += 1;
            if since_checkpoint >= config.checkpoint_every {
                if let Err(e) = registry.save(&registry_file) {
                    warn!("Registry checkpoint failed: {}", e);
                }
                since_checkpoint = 0;
            }
        }
        drop(results);

        registry.save(&registry_file)?;
        if let Some(ref cb) = progress {
            cb.on_fetch_complete(total, report.downloaded);
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Fetch done: {}/{} downloaded, {} failed in {}ms",
            report.downloaded, report.attempted, report.failed, report.duration_ms
        );
        Ok(report)
    }
}

/// Build a [`Fetcher`] from `config` and process every pending entry.
///
/// Progress events go to `config.progress_callback`, if set.
pub async fn fetch_pending(
    registry: &mut Registry,
    config: &LocalizeConfig,
) -> Result<FetchReport, LocalizeError> {
    Fetcher::new(config)?.fetch_pending(registry, config).await
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    target.with_file_name(name)
}

fn io_error(path: &Path, e: std::io::Error) -> FetchError {
    FetchError::Io {
        path: path.display().to_string(),
        detail: e.to_string(),
    }
}
