//! CLI binary for exam-img-localize.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `LocalizeConfig`, runs one or all stages and prints summaries.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use exam_img_localize::{
    extract_corpus, rewrite_corpus, verify_corpus, EntryStatus, ExtractReport,
    FetchProgressCallback, FetchReport, Fetcher, LocalizeConfig, ProgressCallback, Registry,
    RewriteReport, VerificationReport, DEFAULT_USER_AGENT,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max - 1).collect();
        format!("{head}\u{2026}")
    } else {
        s.to_string()
    }
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar for the whole batch plus one log line
/// per image. Images may complete out of order when `--concurrency > 1`.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<String, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Checking registry…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>4}/{len} images  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Fetching");
        self.bar.reset_eta();
    }

    fn elapsed_secs(&self, url: &str) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(url))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl FetchProgressCallback for CliProgressCallback {
    fn on_fetch_start(&self, total: usize) {
        self.activate_bar(total);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Downloading {total} images…"))
        ));
    }

    fn on_image_start(&self, url: &str, _total: usize) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(url.to_string(), Instant::now());
        }
        self.bar.set_message(truncate(url, 60));
    }

    fn on_image_complete(&self, url: &str, _total: usize, bytes: u64) {
        let secs = self.elapsed_secs(url);
        self.bar.println(format!(
            "  {} {:<70}  {:<10}  {}",
            green("✓"),
            truncate(url, 70),
            dim(&format!("{:>7} KB", bytes / 1024)),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_image_error(&self, url: &str, _total: usize, error: &str) {
        let secs = self.elapsed_secs(url);
        self.errors.fetch_add(1, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} {:<70}  {}  {}",
            red("✗"),
            truncate(url, 70),
            red(&truncate(error, 60)),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_fetch_complete(&self, total: usize, downloaded: usize) {
        let failed = total.saturating_sub(downloaded);
        self.bar.finish_and_clear();

        if failed == 0 {
            eprintln!(
                "{} {} images downloaded",
                green("✔"),
                bold(&downloaded.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} images downloaded  ({} failed, retried on next run)",
                if failed == total { red("✘") } else { cyan("⚠") },
                bold(&downloaded.to_string()),
                total,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Everything, in order: extract, fetch, rewrite, verify
  imgloc --root /srv/exams run

  # Only discover images and update registry.json
  imgloc extract

  # Download politely, two at a time
  imgloc fetch --delay-ms 500 --concurrency 2

  # Rewrite, then write a machine-readable audit
  imgloc rewrite && imgloc verify --report verify.json

  # Registry summary and recent failures
  imgloc status

LAYOUT (relative to --root):
  data/raw/<examType>/<examKey>.json     raw records (read-only)
  localized/<examType>/<examKey>.json    rewritten records
  images/<host_port>/<path>              downloaded images
  registry.json                          URL → local path, status, usage

EXIT STATUS:
  0  success
  1  fatal error (missing or corrupt registry, unreadable corpus, …)
  2  verify found mismatches
"#;

/// Download and localize the remote images of an exam-question corpus.
#[derive(Parser, Debug)]
#[command(
    name = "imgloc",
    version,
    about = "Download and localize remote images embedded in exam-question records",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Project root; every other path is relative to it.
    #[arg(long, global = true, env = "IMGLOC_ROOT", default_value = ".")]
    root: PathBuf,

    /// Directory of raw records.
    #[arg(long, global = true, env = "IMGLOC_RAW_DIR", default_value = "data/raw")]
    raw_dir: PathBuf,

    /// Directory receiving localized records.
    #[arg(long, global = true, env = "IMGLOC_OUT_DIR", default_value = "localized")]
    out_dir: PathBuf,

    /// Registry document.
    #[arg(long, global = true, env = "IMGLOC_REGISTRY", default_value = "registry.json")]
    registry: PathBuf,

    /// Print stage reports as JSON on stdout.
    #[arg(long, global = true, env = "IMGLOC_JSON")]
    json: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "IMGLOC_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "IMGLOC_QUIET")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan raw records and register every remote image.
    Extract,
    /// Download pending registry entries.
    Fetch(FetchArgs),
    /// Write localized records pointing at downloaded images.
    Rewrite,
    /// Audit localized records against raw records.
    Verify(VerifyArgs),
    /// Extract, fetch, rewrite and verify in one go.
    Run {
        #[command(flatten)]
        fetch: FetchArgs,
        #[command(flatten)]
        verify: VerifyArgs,
    },
    /// Show registry totals and the most recent failures.
    Status {
        /// Number of failed entries to list.
        #[arg(long, default_value_t = 10)]
        failures: usize,
    },
}

#[derive(Args, Debug, Clone)]
struct FetchArgs {
    /// Per-request timeout in seconds.
    #[arg(long, env = "IMGLOC_TIMEOUT", default_value_t = 30)]
    timeout: u64,

    /// Politeness delay between requests, in milliseconds.
    #[arg(long, env = "IMGLOC_DELAY_MS", default_value_t = 250)]
    delay_ms: u64,

    /// Maximum in-flight downloads.
    #[arg(short, long, env = "IMGLOC_CONCURRENCY", default_value_t = 1)]
    concurrency: usize,

    /// Save the registry after this many status changes.
    #[arg(long, env = "IMGLOC_CHECKPOINT_EVERY", default_value_t = 25)]
    checkpoint_every: usize,

    /// User-Agent header sent with each request.
    #[arg(long, env = "IMGLOC_USER_AGENT", default_value = DEFAULT_USER_AGENT)]
    user_agent: String,

    /// Disable progress bar.
    #[arg(long, env = "IMGLOC_NO_PROGRESS")]
    no_progress: bool,
}

impl Default for FetchArgs {
    fn default() -> Self {
        Self {
            timeout: 30,
            delay_ms: 250,
            concurrency: 1,
            checkpoint_every: 25,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            no_progress: false,
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
struct VerifyArgs {
    /// Write the full verification report (JSON) to this file.
    #[arg(long, env = "IMGLOC_REPORT")]
    report: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", red("error:"), e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // INFO-level library logs would interleave with the progress bar.
    let show_progress = !cli.quiet
        && !cli.json
        && match &cli.command {
            Command::Fetch(f) | Command::Run { fetch: f, .. } => !f.no_progress,
            _ => false,
        };
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match &cli.command {
        Command::Extract => {
            let config = build_config(&cli, &FetchArgs::default(), None)?;
            let (_, report) = cmd_extract(&cli, &config)?;
            print_json(&cli, &report)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Fetch(args) => {
            let config = build_config(&cli, args, progress_callback(show_progress))?;
            let mut registry = load_required(&config)?;
            let report = cmd_fetch(&cli, &config, &mut registry).await?;
            print_json(&cli, &report)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Rewrite => {
            let config = build_config(&cli, &FetchArgs::default(), None)?;
            let registry = load_required(&config)?;
            let report = cmd_rewrite(&cli, &config, &registry)?;
            print_json(&cli, &report)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Verify(args) => {
            let config = build_config(&cli, &FetchArgs::default(), None)?;
            let registry = load_required(&config)?;
            let report = cmd_verify(&cli, &config, &registry, args)?;
            print_json(&cli, &report)?;
            Ok(verify_exit_code(&report))
        }
        Command::Run { fetch, verify } => {
            let config = build_config(&cli, fetch, progress_callback(show_progress))?;
            let (mut registry, extract) = cmd_extract(&cli, &config)?;
            let fetch = cmd_fetch(&cli, &config, &mut registry).await?;
            let rewrite = cmd_rewrite(&cli, &config, &registry)?;
            let verify = cmd_verify(&cli, &config, &registry, verify)?;
            let code = verify_exit_code(&verify);
            print_json(
                &cli,
                &RunReport {
                    extract,
                    fetch,
                    rewrite,
                    verify,
                },
            )?;
            Ok(code)
        }
        Command::Status { failures } => {
            let config = build_config(&cli, &FetchArgs::default(), None)?;
            cmd_status(&cli, &config, *failures)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// `--json` output of `imgloc run`.
#[derive(Serialize)]
struct RunReport {
    extract: ExtractReport,
    fetch: FetchReport,
    rewrite: RewriteReport,
    verify: VerificationReport,
}

fn verify_exit_code(report: &VerificationReport) -> ExitCode {
    if report.has_mismatches() {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    }
}

fn progress_callback(show: bool) -> Option<ProgressCallback> {
    show.then(|| CliProgressCallback::new() as Arc<dyn FetchProgressCallback>)
}

/// Map CLI args to `LocalizeConfig`.
fn build_config(
    cli: &Cli,
    fetch: &FetchArgs,
    progress: Option<ProgressCallback>,
) -> Result<LocalizeConfig> {
    let mut builder = LocalizeConfig::builder()
        .root(&cli.root)
        .raw_dir(&cli.raw_dir)
        .out_dir(&cli.out_dir)
        .registry_path(&cli.registry)
        .timeout_secs(fetch.timeout)
        .request_delay_ms(fetch.delay_ms)
        .concurrency(fetch.concurrency)
        .checkpoint_every(fetch.checkpoint_every)
        .user_agent(fetch.user_agent.clone());

    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

fn load_required(config: &LocalizeConfig) -> Result<Registry> {
    Registry::load(&config.registry_file()).context("Cannot load registry")
}

fn print_json<T: Serialize>(cli: &Cli, value: &T) -> Result<()> {
    if cli.json {
        let json = serde_json::to_string_pretty(value).context("Failed to serialise report")?;
        println!("{json}");
    }
    Ok(())
}

fn cmd_extract(cli: &Cli, config: &LocalizeConfig) -> Result<(Registry, ExtractReport)> {
    let registry_file = config.registry_file();
    let mut registry =
        Registry::load_or_default(&registry_file).context("Cannot load registry")?;
    let report = extract_corpus(config, &mut registry).context("Extraction failed")?;
    registry
        .save(&registry_file)
        .context("Failed to save registry")?;

    if !cli.quiet && !cli.json {
        eprintln!(
            "{}  {} usages in {} files  →  {} new, {} total images  {}",
            if report.files.failed == 0 { green("✔") } else { cyan("⚠") },
            report.usages,
            report.files.processed,
            bold(&report.new_entries.to_string()),
            report.total_entries,
            dim(&format!(
                "({} without images, {} failed)",
                report.files.skipped, report.files.failed
            )),
        );
    }
    Ok((registry, report))
}

async fn cmd_fetch(
    cli: &Cli,
    config: &LocalizeConfig,
    registry: &mut Registry,
) -> Result<FetchReport> {
    let fetcher = Fetcher::new(config).context("Cannot create HTTP client")?;
    let report = fetcher
        .fetch_pending(registry, config)
        .await
        .context("Fetch failed")?;

    // The progress callback already printed its own summary line.
    if !cli.quiet && !cli.json && config.progress_callback.is_none() {
        eprintln!(
            "{}  {}/{} downloaded  {}ms",
            if report.failed == 0 { green("✔") } else { cyan("⚠") },
            report.downloaded,
            report.attempted,
            report.duration_ms,
        );
    }
    if !cli.quiet && !cli.json {
        eprintln!(
            "   {}",
            dim(&format!(
                "{} already downloaded, {} found on disk, {} failed",
                report.skipped_success, report.already_present, report.failed
            ))
        );
    }
    Ok(report)
}

fn cmd_rewrite(cli: &Cli, config: &LocalizeConfig, registry: &Registry) -> Result<RewriteReport> {
    let report = rewrite_corpus(config, registry).context("Rewrite failed")?;
    if !cli.quiet && !cli.json {
        eprintln!(
            "{}  {} replaced, {} unresolved  →  {}",
            if report.images.unresolved == 0 && report.files.failed == 0 {
                green("✔")
            } else {
                cyan("⚠")
            },
            bold(&report.images.replaced.to_string()),
            report.images.unresolved,
            bold(&config.out_root().display().to_string()),
        );
        if report.files.failed > 0 {
            eprintln!("   {} files failed", red(&report.files.failed.to_string()));
        }
    }
    Ok(report)
}

fn cmd_verify(
    cli: &Cli,
    config: &LocalizeConfig,
    registry: &Registry,
    args: &VerifyArgs,
) -> Result<VerificationReport> {
    let report = verify_corpus(config, registry).context("Verification failed")?;

    if let Some(ref path) = args.report {
        write_report(path, &report)?;
    }
    if !cli.quiet && !cli.json {
        print_verification(&report);
    }
    Ok(report)
}

fn write_report(path: &Path, report: &VerificationReport) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to serialise report")?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {:?}", parent))?;
    }
    std::fs::write(path, json).with_context(|| format!("Failed to write report to {:?}", path))
}

fn print_verification(report: &VerificationReport) {
    let mark = if report.has_mismatches() { red("✘") } else { green("✔") };
    eprintln!(
        "{}  {} matched, {} unresolved, {} mismatches",
        mark,
        bold(&report.matched.to_string()),
        report.unresolved,
        if report.has_mismatches() {
            red(&report.mismatches().to_string())
        } else {
            report.mismatches().to_string()
        },
    );
    if report.has_mismatches() {
        eprintln!(
            "   {}",
            dim(&format!(
                "count_mismatch {}  not_localized {}  path_mismatch {}  missing_file {}",
                report.count_mismatch,
                report.not_localized,
                report.path_mismatch,
                report.missing_file
            ))
        );
        for record in report.records.iter().take(10) {
            eprintln!("   {} {}", red("•"), record.file);
            for m in record.mismatches.iter().take(3) {
                eprintln!(
                    "       {:?}: {}{}",
                    m.kind,
                    m.detail,
                    m.url.as_deref().map(|u| format!(" ({u})")).unwrap_or_default()
                );
            }
        }
    }
}

fn cmd_status(cli: &Cli, config: &LocalizeConfig, failures: usize) -> Result<()> {
    let registry = load_required(config)?;
    let stats = registry.stats();

    if cli.json {
        return print_json(cli, &stats);
    }

    println!("Registry:     {}", config.registry_file().display());
    println!("Images:       {}", stats.total);
    println!("Downloaded:   {}", green(&stats.downloaded.to_string()));
    println!("Pending:      {}", stats.pending);
    println!("Failed:       {}", red(&stats.failed.to_string()));
    println!("Usage sites:  {}", stats.usage_sites);

    let failed: Vec<_> = registry
        .entries()
        .filter(|e| e.status == EntryStatus::Failed)
        .collect();
    if !failed.is_empty() && failures > 0 {
        println!();
        println!("{}", bold("Most recent failures:"));
        for entry in failed.iter().rev().take(failures) {
            println!(
                "  {} {}  {}",
                red("✗"),
                entry.url,
                dim(entry.error.as_deref().unwrap_or("unknown error"))
            );
        }
    }
    Ok(())
}
