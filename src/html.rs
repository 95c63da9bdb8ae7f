//! `<img>` discovery and rewriting built on `lol_html`.
//!
//! Both operations stream the fragment through `lol_html` with a single
//! `img` element handler. Untouched tags and all surrounding markup come out
//! byte for byte. A rewritten tag is re-serialised by `lol_html`, keeping its
//! remaining attributes in source order.
//!
//! `lol_html` hands attribute values over exactly as written, so character
//! references (`&amp;`, `&#38;`, `&#x26;`, named HTML5 entities) are decoded
//! here with `quick_xml`'s HTML5 entity table.

use crate::canonical::canonicalize;
use lol_html::errors::RewritingError;
use lol_html::{element, rewrite_str, RewriteStrSettings};
use quick_xml::escape::{resolve_html5_entity, unescape_with};
use thiserror::Error;

/// Attribute carrying the untransformed source URL of an embedded image.
pub const ORIGINAL_SRC_ATTR: &str = "data-orsrc";

/// Rendering attribute.
pub const SRC_ATTR: &str = "src";

/// The fragment could not be streamed through the HTML rewriter.
#[derive(Debug, Error)]
#[error("HTML rewriting failed: {0}")]
pub struct HtmlError(#[from] RewritingError);

/// One `<img>` element found in an HTML fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImgTag {
    /// Position among the `<img>` elements of the fragment.
    pub index: usize,
    /// `(lower-cased name, decoded value)` in source order.
    attrs: Vec<(String, String)>,
}

impl ImgTag {
    fn read(index: usize, attrs: impl Iterator<Item = (String, String)>) -> Self {
        Self {
            index,
            attrs: attrs.map(|(name, raw)| (name, decode_attr(&raw))).collect(),
        }
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// The rendering `src` value.
    pub fn src(&self) -> Option<&str> {
        self.attr(SRC_ATTR)
    }

    /// The marker attribute's value, if present.
    pub fn original_src(&self) -> Option<&str> {
        self.attr(ORIGINAL_SRC_ATTR)
    }

    /// Canonical remote identifier of this embedding.
    ///
    /// The marker attribute wins over `src`; `src` is used when the marker is
    /// missing or does not hold a remote URL.
    pub fn canonical(&self) -> Option<String> {
        self.original_src()
            .and_then(canonicalize)
            .or_else(|| self.src().and_then(canonicalize))
    }
}

/// Decode character references in an attribute value.
///
/// Values that are not well-formed (a bare `&` in a query string) are
/// returned as written.
fn decode_attr(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    match unescape_with(raw, resolve_html5_entity) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => raw.to_string(),
    }
}

/// Find every `<img>` element in `html`, in document order.
pub fn find_images(html: &str) -> Result<Vec<ImgTag>, HtmlError> {
    let mut tags = Vec::new();
    rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![element!("img", |el| {
                let attrs = el.attributes().iter().map(|a| (a.name(), a.value()));
                tags.push(ImgTag::read(tags.len(), attrs));
                Ok(())
            })],
            strict: false,
            ..RewriteStrSettings::default()
        },
    )?;
    Ok(tags)
}

/// Rewrite every `<img>` in `html` for which `resolve` returns a new `src`.
///
/// A resolved tag gets `src` set (or added) and loses the marker attribute.
/// Tags for which `resolve` returns `None` are copied unchanged.
pub fn rewrite_images<F>(html: &str, mut resolve: F) -> Result<String, HtmlError>
where
    F: FnMut(&ImgTag) -> Option<String>,
{
    let mut index = 0;
    let out = rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![element!("img", |el| {
                let attrs = el.attributes().iter().map(|a| (a.name(), a.value()));
                let tag = ImgTag::read(index, attrs);
                index += 1;
                if let Some(new_src) = resolve(&tag) {
                    el.set_attribute(SRC_ATTR, &new_src)?;
                    el.remove_attribute(ORIGINAL_SRC_ATTR);
                }
                Ok(())
            })],
            strict: false,
            ..RewriteStrSettings::default()
        },
    )?;
    Ok(out)
}
