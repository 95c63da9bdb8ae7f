//! End-to-end integration tests for exam-img-localize.
//!
//! Each test builds a scratch corpus in a temp directory and serves the
//! images from a local `wiremock` server, so no network access is needed.
//!
//! Run with:
//!   cargo test --test e2e -- --nocapture
//!
//! Set `RUST_LOG=exam_img_localize=debug` to see the pipeline logs.

use exam_img_localize::{
    canonicalize, extract_corpus, fetch_pending, localize, rewrite_corpus, verify_corpus,
    EntryStatus, FetchProgressCallback, LocalizeConfig, Registry,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ── Test helpers ─────────────────────────────────────────────────────────────

const PNG: &[u8] = b"\x89PNG\r\n\x1a\nfake-image-bytes";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config_for(root: &Path) -> LocalizeConfig {
    LocalizeConfig::builder()
        .root(root)
        .request_delay_ms(0)
        .timeout_secs(5)
        .build()
        .unwrap()
}

/// One question: two embeddings of `q1.png` (content, explanation) and one
/// option embedding of `opt.png`.
fn exam_record(base: &str) -> Value {
    json!({
        "results": [{
            "_id": "Physics",
            "questions": [{
                "subject": "Physics",
                "chapter": "Optics",
                "chapterGroup": "Waves",
                "marks": 4,
                "negMarks": 1,
                "difficulty": "medium",
                "isOutOfSyllabus": false,
                "question": {
                    "en": {
                        "content": format!(
                            r#"<p>Find the focal length.</p><img data-orsrc="{base}/img/q1.png" src="{base}/fly/@width/img/q1.png?v=2" />"#
                        ),
                        "options": [
                            { "identifier": "A", "content": format!(r#"<img src="{base}/img/opt.png">"#) },
                            { "identifier": "B", "content": "<p>20 cm</p>" }
                        ],
                        "correct_options": ["A"],
                        "explanation": format!(r#"<p>See figure</p><img src="{base}/img/q1.png?cache=1">"#)
                    }
                }
            }]
        }]
    })
}

fn write_raw(root: &Path, exam_type: &str, exam_key: &str, record: &Value) {
    let p = root
        .join("data/raw")
        .join(exam_type)
        .join(format!("{exam_key}.json"));
    std::fs::create_dir_all(p.parent().unwrap()).unwrap();
    std::fs::write(p, serde_json::to_string_pretty(record).unwrap()).unwrap();
}

fn read_localized(root: &Path, exam_type: &str, exam_key: &str) -> Value {
    let p = root
        .join("localized")
        .join(exam_type)
        .join(format!("{exam_key}.json"));
    serde_json::from_str(&std::fs::read_to_string(p).unwrap()).unwrap()
}

/// `images/<host>_<port>` directory for everything served by `server`.
fn images_dir(server: &MockServer) -> String {
    format!("images/127_0_0_1_{}", server.address().port())
}

async fn serve(server: &MockServer, route: &str, status: u16, times: u64) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(status).set_body_bytes(PNG))
        .expect(times)
        .mount(server)
        .await;
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn three_embeddings_two_images_fully_localized() {
    init_tracing();
    let server = MockServer::start().await;
    serve(&server, "/img/q1.png", 200, 1).await;
    serve(&server, "/img/opt.png", 200, 1).await;

    let dir = TempDir::new().unwrap();
    let base = server.uri();
    write_raw(dir.path(), "jee-main", "2021", &exam_record(&base));
    let config = config_for(dir.path());
    let mut registry = Registry::new();

    // Extract
    let extract = extract_corpus(&config, &mut registry).unwrap();
    assert_eq!(extract.usages, 3);
    assert_eq!(registry.len(), 2);
    let q1 = format!("{base}/img/q1.png");
    let opt = format!("{base}/img/opt.png");
    assert_eq!(registry.get(&q1).unwrap().usage_count(), 2);
    assert_eq!(registry.get(&opt).unwrap().usage_count(), 1);

    // Fetch
    let fetch = fetch_pending(&mut registry, &config).await.unwrap();
    assert_eq!(fetch.downloaded, 2);
    assert_eq!(fetch.failed, 0);
    for url in [&q1, &opt] {
        let entry = registry.get(url).unwrap();
        assert_eq!(entry.status, EntryStatus::Success);
        let file = config.resolve_local(&entry.local_path);
        assert_eq!(std::fs::read(&file).unwrap(), PNG);
        assert!(!file.with_extension("png.part").exists());
    }
    let images = images_dir(&server);
    assert_eq!(
        registry.path_for(&q1),
        Some(format!("{images}/img/q1.png").as_str())
    );

    // Rewrite
    let rewrite = rewrite_corpus(&config, &registry).unwrap();
    assert_eq!(rewrite.images.replaced, 3);
    assert_eq!(rewrite.images.unresolved, 0);

    let localized = read_localized(dir.path(), "jee-main", "2021");
    let en = &localized["results"][0]["questions"][0]["question"]["en"];
    assert_eq!(
        en["content"],
        format!(r#"<p>Find the focal length.</p><img src="../../{images}/img/q1.png" />"#)
    );
    assert_eq!(
        en["options"][0]["content"],
        format!(r#"<img src="../../{images}/img/opt.png">"#)
    );
    assert_eq!(
        en["explanation"],
        format!(r#"<p>See figure</p><img src="../../{images}/img/q1.png">"#)
    );
    assert_eq!(en["correct_options"], json!(["A"]));
    assert_eq!(localized["results"][0]["questions"][0]["marks"], 4);

    // Verify
    let report = verify_corpus(&config, &registry).unwrap();
    assert_eq!(report.matched, 3);
    assert_eq!(report.mismatches(), 0);
    assert_eq!(report.missing_file, 0);
}

#[tokio::test]
async fn cdn_resized_and_plain_urls_share_an_entry() {
    assert_eq!(
        canonicalize("https://cdn.example.com/fly/@width/img/q1.png?v=2").as_deref(),
        Some("https://cdn.example.com/img/q1.png")
    );
    assert_eq!(
        canonicalize("https://cdn.example.com/img/q1.png").as_deref(),
        Some("https://cdn.example.com/img/q1.png")
    );

    let dir = TempDir::new().unwrap();
    let html = r#"<img src="https://cdn.example.com/fly/@width/img/q1.png?v=2"><img src="https://cdn.example.com/img/q1.png">"#;
    write_raw(
        dir.path(),
        "neet",
        "2020",
        &json!({ "results": [{ "_id": "Biology", "questions": [{ "question": { "en": { "content": html } } }] }] }),
    );
    let config = config_for(dir.path());
    let mut registry = Registry::new();
    extract_corpus(&config, &mut registry).unwrap();

    assert_eq!(registry.len(), 1);
    let entry = registry.get("https://cdn.example.com/img/q1.png").unwrap();
    assert_eq!(entry.local_path, "images/cdn_example_com/img/q1.png");
    // Same slot, two tags: two usage sites.
    assert_eq!(entry.usage_count(), 2);
    assert_eq!(entry.used_in[1].tag_index, 1);
}

#[tokio::test]
async fn rerun_downloads_nothing_and_adds_no_usages() {
    init_tracing();
    let server = MockServer::start().await;
    serve(&server, "/img/q1.png", 200, 1).await;
    serve(&server, "/img/opt.png", 200, 1).await;

    let dir = TempDir::new().unwrap();
    write_raw(dir.path(), "jee-main", "2021", &exam_record(&server.uri()));
    let config = config_for(dir.path());

    let first = localize(&config).await.unwrap();
    assert_eq!(first.fetch.downloaded, 2);
    let registry_after_first = Registry::load(&config.registry_file()).unwrap();

    let second = localize(&config).await.unwrap();
    assert_eq!(second.extract.new_entries, 0);
    assert_eq!(second.fetch.attempted, 0);
    assert_eq!(second.fetch.skipped_success, 2);
    assert_eq!(second.verify.matched, 3);

    let registry_after_second = Registry::load(&config.registry_file()).unwrap();
    assert_eq!(registry_after_first.stats(), registry_after_second.stats());
    for entry in registry_after_first.entries() {
        assert_eq!(registry_after_second.get(&entry.url), Some(entry));
    }
    // `expect(1)` on each mock is checked when `server` drops.
}

#[tokio::test]
async fn failed_download_leaves_remote_src_and_is_retried() {
    init_tracing();
    let server = MockServer::start().await;
    serve(&server, "/img/q1.png", 200, 1).await;
    serve(&server, "/img/opt.png", 404, 1).await;

    let dir = TempDir::new().unwrap();
    let base = server.uri();
    write_raw(dir.path(), "jee-main", "2021", &exam_record(&base));
    let config = config_for(dir.path());
    let mut registry = Registry::new();
    let opt = format!("{base}/img/opt.png");

    extract_corpus(&config, &mut registry).unwrap();
    let fetch = fetch_pending(&mut registry, &config).await.unwrap();
    assert_eq!(fetch.downloaded, 1);
    assert_eq!(fetch.failed, 1);
    let entry = registry.get(&opt).unwrap();
    assert_eq!(entry.status, EntryStatus::Failed);
    assert_eq!(entry.error.as_deref(), Some("HTTP 404"));

    // The checkpoint on disk agrees with memory.
    let persisted = Registry::load(&config.registry_file()).unwrap();
    assert_eq!(persisted.get(&opt).unwrap().status, EntryStatus::Failed);

    let rewrite = rewrite_corpus(&config, &registry).unwrap();
    assert_eq!(rewrite.images.replaced, 2);
    assert_eq!(rewrite.images.unresolved, 1);
    let localized = read_localized(dir.path(), "jee-main", "2021");
    assert_eq!(
        localized["results"][0]["questions"][0]["question"]["en"]["options"][0]["content"],
        format!(r#"<img src="{base}/img/opt.png">"#)
    );

    let report = verify_corpus(&config, &registry).unwrap();
    assert_eq!(report.matched, 2);
    assert_eq!(report.unresolved, 1);
    assert!(!report.has_mismatches());

    // The host recovers: the next run requeues and downloads the failed entry.
    server.verify().await;
    server.reset().await;
    serve(&server, "/img/opt.png", 200, 1).await;
    let retry = fetch_pending(&mut registry, &config).await.unwrap();
    assert_eq!(retry.requeued, 1);
    assert_eq!(retry.attempted, 1);
    assert_eq!(retry.downloaded, 1);
    let entry = registry.get(&opt).unwrap();
    assert_eq!(entry.status, EntryStatus::Success);
    assert_eq!(entry.error, None);
}

#[tokio::test]
async fn file_already_on_disk_is_not_downloaded() {
    init_tracing();
    let server = MockServer::start().await;
    serve(&server, "/img/q1.png", 200, 0).await;
    serve(&server, "/img/opt.png", 200, 1).await;

    let dir = TempDir::new().unwrap();
    write_raw(dir.path(), "jee-main", "2021", &exam_record(&server.uri()));
    let config = config_for(dir.path());

    let existing = config.resolve_local(&format!("{}/img/q1.png", images_dir(&server)));
    std::fs::create_dir_all(existing.parent().unwrap()).unwrap();
    std::fs::write(&existing, b"already here").unwrap();

    let mut registry = Registry::new();
    extract_corpus(&config, &mut registry).unwrap();
    let fetch = fetch_pending(&mut registry, &config).await.unwrap();
    assert_eq!(fetch.already_present, 1);
    assert_eq!(fetch.attempted, 1);
    assert_eq!(fetch.downloaded, 1);
    assert_eq!(std::fs::read(&existing).unwrap(), b"already here");
}

#[tokio::test]
async fn concurrent_fetch_downloads_each_url_once() {
    init_tracing();
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let base = server.uri();

    let mut html = String::new();
    for i in 0..8 {
        serve(&server, &format!("/img/{i}.png"), 200, 1).await;
        // Every image embedded twice.
        html.push_str(&format!(r#"<img src="{base}/img/{i}.png"><img src="{base}/img/{i}.png?x">"#));
    }
    write_raw(
        dir.path(),
        "jee-adv",
        "2019",
        &json!({ "results": [{ "_id": "Maths", "questions": [{ "question": { "en": { "content": html } } }] }] }),
    );
    let config = LocalizeConfig::builder()
        .root(dir.path())
        .request_delay_ms(0)
        .concurrency(4)
        .checkpoint_every(3)
        .build()
        .unwrap();

    let mut registry = Registry::new();
    extract_corpus(&config, &mut registry).unwrap();
    assert_eq!(registry.len(), 8);
    let fetch = fetch_pending(&mut registry, &config).await.unwrap();
    assert_eq!(fetch.downloaded, 8);
    assert_eq!(registry.stats().downloaded, 8);
}

#[tokio::test]
async fn missing_localized_record_and_registry_errors() {
    let dir = TempDir::new().unwrap();
    let config = config_for(dir.path());

    // Rewrite and verify need an existing registry.
    assert!(Registry::load(&config.registry_file()).is_err());

    write_raw(
        dir.path(),
        "neet",
        "2018",
        &json!({ "results": [{ "_id": "Chem", "questions": [] }] }),
    );
    std::fs::write(dir.path().join("data/raw/neet/broken.json"), "{ nope").unwrap();

    let registry = Registry::new();
    let report = verify_corpus(&config, &registry).unwrap();
    assert_eq!(report.count_mismatch, 1);
    assert_eq!(report.files.failed, 1);
    assert_eq!(report.records[0].file, "neet/2018.json");
}

#[tokio::test]
async fn links_follow_record_depth() {
    init_tracing();
    let server = MockServer::start().await;
    serve(&server, "/img/a.png", 200, 1).await;

    let dir = TempDir::new().unwrap();
    let base = server.uri();
    let record = json!({ "results": [{ "_id": "Maths", "questions": [{ "question": { "en": {
        "content": format!(r#"<img src="{base}/img/a.png">"#)
    } } }] }] });
    let raw = dir.path().join("data/raw");
    std::fs::create_dir_all(raw.join("jee/main")).unwrap();
    std::fs::write(raw.join("loose.json"), record.to_string()).unwrap();
    std::fs::write(raw.join("jee/main/2021.json"), record.to_string()).unwrap();
    let config = config_for(dir.path());

    let out = localize(&config).await.unwrap();
    assert_eq!(out.fetch.downloaded, 1);
    assert_eq!(out.verify.matched, 2);
    assert!(!out.verify.has_mismatches());

    let images = images_dir(&server);
    for (rel, href) in [
        ("loose.json", format!("../{images}/img/a.png")),
        ("jee/main/2021.json", format!("../../../{images}/img/a.png")),
    ] {
        let file = dir.path().join("localized").join(rel);
        let doc: Value = serde_json::from_str(&std::fs::read_to_string(&file).unwrap()).unwrap();
        let content = doc["results"][0]["questions"][0]["question"]["en"]["content"].clone();
        assert_eq!(content, format!(r#"<img src="{href}">"#));
        assert!(file.parent().unwrap().join(&href).is_file(), "{href} from {rel}");
    }

    // A link written for the usual two-level layout is broken at the root.
    let loose = dir.path().join("localized/loose.json");
    let text = std::fs::read_to_string(&loose).unwrap();
    std::fs::write(&loose, text.replace("\"../images/", "\"../../images/")).unwrap();
    let registry = Registry::load(&config.registry_file()).unwrap();
    let report = verify_corpus(&config, &registry).unwrap();
    assert_eq!(report.matched, 1);
    assert_eq!(report.path_mismatch, 1);
    assert_eq!(report.records[0].file, "loose.json");
}

/// Reads the registry on disk each time a download completes.
struct PersistedSuccesses {
    registry_file: PathBuf,
    seen: Mutex<Vec<usize>>,
    snapshot_at: usize,
    snapshot: Mutex<Option<String>>,
}

impl FetchProgressCallback for PersistedSuccesses {
    fn on_image_complete(&self, _url: &str, _total: usize, _bytes: u64) {
        let text = std::fs::read_to_string(&self.registry_file).unwrap_or_default();
        let downloaded = Registry::from_json(&text)
            .map(|r| r.stats().downloaded)
            .unwrap_or(0);
        let mut seen = self.seen.lock().unwrap();
        seen.push(downloaded);
        if seen.len() == self.snapshot_at {
            *self.snapshot.lock().unwrap() = Some(text);
        }
    }
}

#[tokio::test]
async fn checkpoints_persist_progress_and_bound_rework() {
    init_tracing();
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let base = server.uri();

    let mut html = String::new();
    for i in 0..5 {
        serve(&server, &format!("/img/{i}.png"), 200, 1).await;
        html.push_str(&format!(r#"<img src="{base}/img/{i}.png">"#));
    }
    write_raw(
        dir.path(),
        "neet",
        "2022",
        &json!({ "results": [{ "_id": "Bio", "questions": [{ "question": { "en": { "content": html } } }] }] }),
    );

    let recorder = Arc::new(PersistedSuccesses {
        registry_file: dir.path().join("registry.json"),
        seen: Mutex::new(Vec::new()),
        snapshot_at: 3,
        snapshot: Mutex::new(None),
    });
    let config = LocalizeConfig::builder()
        .root(dir.path())
        .request_delay_ms(0)
        .checkpoint_every(2)
        .progress_callback(recorder.clone() as Arc<dyn FetchProgressCallback>)
        .build()
        .unwrap();

    let out = localize(&config).await.unwrap();
    assert_eq!(out.fetch.downloaded, 5);
    // Every second transition reaches the disk before the run ends.
    assert_eq!(*recorder.seen.lock().unwrap(), [0, 0, 2, 2, 4]);

    // Crash after the third download: only the first checkpoint survived, and
    // the last two files were never written.
    let snapshot = recorder.snapshot.lock().unwrap().take().unwrap();
    std::fs::write(config.registry_file(), snapshot).unwrap();
    let images = images_dir(&server);
    for i in 3..5 {
        std::fs::remove_file(config.resolve_local(&format!("{images}/img/{i}.png"))).unwrap();
    }
    server.verify().await;
    server.reset().await;
    for i in 0..5 {
        let times = if i < 3 { 0 } else { 1 };
        serve(&server, &format!("/img/{i}.png"), 200, times).await;
    }

    let mut registry = Registry::load(&config.registry_file()).unwrap();
    assert_eq!(registry.stats().downloaded, 2);
    let resumed = fetch_pending(&mut registry, &config).await.unwrap();
    assert_eq!(resumed.skipped_success, 2);
    // The third image was written before the crash and is picked up from disk.
    assert_eq!(resumed.already_present, 1);
    assert_eq!(resumed.attempted, 2);
    assert_eq!(registry.stats().downloaded, 5);
}
