//! Canonical image identifiers and the local paths derived from them.
//!
//! Everything in this module is a pure function of its input so that the
//! Extractor, Rewriter and Verifier compute byte-identical keys and paths
//! without consulting each other.

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use std::path::{Component, Path, PathBuf};

/// Directory (relative to the project root) that holds every downloaded image.
pub const IMAGES_DIR: &str = "images";

/// File name used when a remote URL has no usable path segments.
const FALLBACK_FILE_NAME: &str = "image";

/// On-the-fly resize transform, e.g. `/fly/@width/` or `/fly/@600x400/`.
static RE_RESIZE_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"/fly/@[^/]*/").unwrap());

/// True when `src` points at a remote host rather than a local file.
pub fn is_remote(src: &str) -> bool {
    let s = src.trim_start();
    s.starts_with("//")
        || s.get(..7).is_some_and(|p| p.eq_ignore_ascii_case("http://"))
        || s.get(..8).is_some_and(|p| p.eq_ignore_ascii_case("https://"))
}

/// Reduce an embedded image reference to its canonical remote identifier.
///
/// Strips the query string, the fragment and every resize path segment.
/// Returns `None` for references that are not remote `http(s)` URLs
/// (`data:` URIs, relative paths, garbage).
///
/// ```rust
/// use exam_img_localize::canonical::canonicalize;
///
/// assert_eq!(
///     canonicalize("https://cdn.example.com/fly/@width/img/q1.png?v=2").as_deref(),
///     Some("https://cdn.example.com/img/q1.png"),
/// );
/// assert_eq!(canonicalize("data:image/png;base64,AAAA"), None);
/// ```
pub fn canonicalize(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if !is_remote(raw) {
        return None;
    }
    let owned;
    let input = if raw.starts_with("//") {
        owned = format!("https:{raw}");
        owned.as_str()
    } else {
        raw
    };

    let mut url = Url::parse(input).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    url.set_query(None);
    url.set_fragment(None);

    let mut path = url.path().to_string();
    while RE_RESIZE_SEGMENT.is_match(&path) {
        path = RE_RESIZE_SEGMENT.replace_all(&path, "/").into_owned();
    }
    url.set_path(&path);

    Some(url.to_string())
}

/// Compute the local storage path for a canonical identifier.
///
/// `images/<host with dots replaced>[_<port>]/<decoded remote path>`, always
/// `/`-separated. Empty, `.` and `..` segments are dropped so the result
/// never escapes the images directory.
///
/// Distinct identifiers can still share a path (`x%2Fy.png` and `x_y.png`);
/// [`crate::registry::Registry::register`] resolves those collisions.
pub fn local_path_for(canonical: &str) -> Option<String> {
    let url = Url::parse(canonical).ok()?;
    let mut host = url.host_str()?.replace(['.', ':'], "_");
    if let Some(port) = url.port() {
        host = format!("{host}_{port}");
    }

    let segments: Vec<String> = url
        .path_segments()
        .map(|segs| {
            segs.map(|s| {
                urlencoding::decode(s)
                    .map(|d| d.into_owned())
                    .unwrap_or_else(|_| s.to_string())
            })
            .filter(|s| !s.is_empty() && s != "." && s != "..")
            .map(|s| s.replace(['/', '\\'], "_"))
            .collect()
        })
        .unwrap_or_default();

    let path = if segments.is_empty() {
        FALLBACK_FILE_NAME.to_string()
    } else {
        segments.join("/")
    };

    Some(format!("{IMAGES_DIR}/{host}/{path}"))
}

/// On-disk location of a `/`-separated local path below `root`.
pub fn resolve_under(root: &Path, local_path: &str) -> PathBuf {
    local_path
        .split('/')
        .filter(|seg| !seg.is_empty())
        .fold(root.to_path_buf(), |acc, seg| acc.join(seg))
}

/// Lexically absolute form of `path`: `.` dropped, `..` applied.
fn normalize(path: &Path) -> PathBuf {
    let abs = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut out = PathBuf::new();
    for c in abs.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Relative links between one localized record and the project root.
///
/// Hrefs are computed from the directory that actually holds the record, so
/// records at any depth below any output directory link correctly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkBase {
    root: PathBuf,
    record_dir: PathBuf,
}

impl LinkBase {
    /// Links for the record written at `record_file`.
    pub fn new(root: &Path, record_file: &Path) -> Self {
        let record_file = normalize(record_file);
        let record_dir = record_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or(record_file);
        Self {
            root: normalize(root),
            record_dir,
        }
    }

    /// Absolute location of a registry local path.
    pub fn target(&self, local_path: &str) -> PathBuf {
        normalize(&resolve_under(&self.root, local_path))
    }

    /// The `src` value that references `local_path` from the record.
    ///
    /// ```rust
    /// use exam_img_localize::canonical::LinkBase;
    /// use std::path::Path;
    ///
    /// let links = LinkBase::new(Path::new("/p"), Path::new("/p/localized/jee/2021.json"));
    /// assert_eq!(links.href("images/h_com/a b.png"), "../../images/h_com/a%20b.png");
    /// ```
    pub fn href(&self, local_path: &str) -> String {
        let target = self.target(local_path);
        let from: Vec<Component> = self.record_dir.components().collect();
        let to: Vec<Component> = target.components().collect();
        let common = from.iter().zip(&to).take_while(|(a, b)| a == b).count();

        let mut segments = vec!["..".to_string(); from.len() - common];
        segments.extend(
            to[common..]
                .iter()
                .map(|c| urlencoding::encode(&c.as_os_str().to_string_lossy()).into_owned()),
        );
        segments.join("/")
    }

    /// The file a local `src` points at, resolved against the record's
    /// directory.
    ///
    /// Returns `None` for remote, `data:`, root-absolute and empty values.
    pub fn resolve(&self, src: &str) -> Option<PathBuf> {
        let src = src.trim();
        if src.is_empty() || is_remote(src) || src.starts_with("data:") || src.starts_with('/') {
            return None;
        }
        let joined = src.split('/').fold(self.record_dir.clone(), |acc, seg| {
            let seg = urlencoding::decode(seg)
                .map(|d| d.into_owned())
                .unwrap_or_else(|_| seg.to_string());
            acc.join(seg)
        });
        Some(normalize(&joined))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resized_and_plain_urls_collapse() {
        let a = canonicalize("https://cdn.example.com/fly/@width/img/q1.png?v=2").unwrap();
        let b = canonicalize("https://cdn.example.com/img/q1.png").unwrap();
        assert_eq!(a, "https://cdn.example.com/img/q1.png");
        assert_eq!(a, b);
    }

    #[test]
    fn canonicalize_is_idempotent() {
        for raw in [
            "https://cdn.example.com/fly/@width/img/q1.png?v=2",
            "https://CDN.Example.com/a/fly/@300/fly/@x/b.jpg#frag",
            "//cdn.example.com/img/q 1.png?x=1&y=2",
            "http://host/fly/@w/",
        ] {
            let once = canonicalize(raw).unwrap();
            let twice = canonicalize(&once).unwrap();
            assert_eq!(once, twice, "not a projection for {raw}");
        }
    }

    #[test]
    fn nested_resize_segments_stripped() {
        assert_eq!(
            canonicalize("https://h.com/a/fly/@300/fly/@x/b.jpg").as_deref(),
            Some("https://h.com/a/b.jpg")
        );
    }

    #[test]
    fn protocol_relative_promoted_to_https() {
        assert_eq!(
            canonicalize("//cdn.example.com/img/a.png").as_deref(),
            Some("https://cdn.example.com/img/a.png")
        );
    }

    #[test]
    fn non_remote_references_rejected() {
        assert_eq!(canonicalize("data:image/png;base64,AAAA"), None);
        assert_eq!(canonicalize("../../images/a.png"), None);
        assert_eq!(canonicalize(""), None);
        assert_eq!(canonicalize("ftp://host/a.png"), None);
    }

    #[test]
    fn local_path_replaces_host_dots() {
        assert_eq!(
            local_path_for("https://cdn.example.com/img/q1.png").as_deref(),
            Some("images/cdn_example_com/img/q1.png")
        );
    }

    #[test]
    fn local_path_is_deterministic() {
        let url = "https://cdn.example.com/img/sub%20dir/q1.png";
        let a = local_path_for(url).unwrap();
        let b = local_path_for(&canonicalize(url).unwrap()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "images/cdn_example_com/img/sub dir/q1.png");
    }

    #[test]
    fn local_path_never_escapes() {
        // The URL parser already resolves encoded dot segments.
        let p = local_path_for("https://h.com/a/%2E%2E/b.png").unwrap();
        assert_eq!(p, "images/h_com/b.png");
        let p = local_path_for("https://h.com/a/..%2Fetc/b.png").unwrap();
        assert!(!p.contains("/../"), "got {p}");
    }

    #[test]
    fn empty_path_gets_fallback_name() {
        assert_eq!(
            local_path_for("https://h.com/").as_deref(),
            Some("images/h_com/image")
        );
    }

    #[test]
    fn port_kept_in_host_component() {
        let plain = local_path_for("https://h.com/a.png").unwrap();
        let ported = local_path_for("https://h.com:8080/a.png").unwrap();
        assert_eq!(plain, "images/h_com/a.png");
        assert_eq!(ported, "images/h_com_8080/a.png");
        // Default ports are not part of the canonical form.
        assert_eq!(
            local_path_for(&canonicalize("https://h.com:443/a.png").unwrap()).unwrap(),
            plain
        );
    }

    #[test]
    fn href_roundtrip_with_spaces() {
        let links = LinkBase::new(Path::new("/p"), Path::new("/p/localized/jee/2021.json"));
        let local = "images/cdn_example_com/img/sub dir/q1.png";
        let href = links.href(local);
        assert_eq!(href, "../../images/cdn_example_com/img/sub%20dir/q1.png");
        assert_eq!(links.resolve(&href), Some(links.target(local)));
    }

    #[test]
    fn href_depth_follows_record_location() {
        let local = "images/h_com/a.png";
        let flat = LinkBase::new(Path::new("/p"), Path::new("/p/localized/loose.json"));
        assert_eq!(flat.href(local), "../images/h_com/a.png");
        let deep = LinkBase::new(Path::new("/p"), Path::new("/p/localized/jee/main/2021.json"));
        assert_eq!(deep.href(local), "../../../images/h_com/a.png");
        let nested_out = LinkBase::new(Path::new("/p"), Path::new("/p/out/v2/jee/2021.json"));
        assert_eq!(nested_out.href(local), "../../../images/h_com/a.png");
    }

    #[test]
    fn href_from_output_outside_root() {
        let links = LinkBase::new(Path::new("/srv/exams"), Path::new("/mnt/out/jee/2021.json"));
        assert_eq!(
            links.href("images/h_com/a.png"),
            "../../../srv/exams/images/h_com/a.png"
        );
    }

    #[test]
    fn resolve_rejects_non_local_values() {
        let links = LinkBase::new(Path::new("/p"), Path::new("/p/localized/t/k.json"));
        assert_eq!(links.resolve("https://h.com/a.png"), None);
        assert_eq!(links.resolve("data:image/png;base64,AA"), None);
        assert_eq!(links.resolve("/images/h_com/a.png"), None);
        assert_eq!(links.resolve("  "), None);
    }

    #[test]
    fn wrong_depth_resolves_elsewhere() {
        let links = LinkBase::new(Path::new("/p"), Path::new("/p/localized/loose.json"));
        let resolved = links.resolve("../../images/h_com/a.png").unwrap();
        assert_ne!(resolved, links.target("images/h_com/a.png"));
        assert_eq!(resolved, PathBuf::from("/images/h_com/a.png"));
    }
}
