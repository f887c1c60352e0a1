//! Streaming rewriters that surface URL-bearing constructs to a callback.
//!
//! The rewriters copy their input byte for byte, except for the URL values a
//! callback chooses to replace. They are the crawler's link-discovery
//! mechanism (callback records URLs, keeps everything) and the materializer's
//! link-rewriting mechanism (callback returns replacements).

pub mod css;
pub mod html;
mod opengraph;

use std::io::Write;

use thiserror::Error;

/// Where a URL was found in the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UrlKind {
    #[default]
    Unknown,
    /// The `href` of the first `<base>` tag.
    Base,
    /// An OpenGraph `<meta>` content URL; always absolute, ignores `<base>`.
    OpenGraph,
    /// A `url(...)` or `@import` argument in a stylesheet.
    Css,
}

/// A URL handed to the rewrite callback.
#[derive(Debug, Clone, Copy)]
pub struct UrlRef<'a> {
    /// The URL as written in the document, unescaped.
    pub value: &'a str,
    /// Base URL in force at this point, empty when the document declared
    /// none (or when rewriting the base itself).
    pub base: &'a str,
    /// The rewritten base URL, empty under the same conditions.
    pub new_base: &'a str,
    pub kind: UrlKind,
}

/// Outcome of a rewrite callback for one URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteAction {
    /// Emit the original bytes untouched.
    Keep,
    /// Replace the URL with this value.
    Replace(String),
}

/// The callback invoked for every URL the rewriters surface, in document
/// order.
pub type UrlRewriter<'a> =
    dyn FnMut(UrlRef<'_>) -> Result<RewriteAction, RewriteError> + 'a;

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),
    #[error("malformed attribute: {0}")]
    MalformedAttribute(String),
    #[error("malformed css string: {0}")]
    MalformedCssString(String),
    #[error("document truncated inside a tag")]
    TruncatedTag,
    #[error("rewrite callback: {0}")]
    Callback(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Document flavors the rewriters understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Html,
    Css,
}

/// Decides which rewriter handles a `Content-Type` value.
///
/// Only `text/html` and `text/css` pass, and only with no `charset`
/// parameter or one equal (case-insensitively) to `utf-8`; the rewriters
/// themselves assume UTF-8 text.
pub fn media_kind(content_type: &str) -> Result<MediaKind, RewriteError> {
    let unsupported = || RewriteError::UnsupportedMediaType(content_type.to_string());
    let mime: mime::Mime = content_type.trim().parse().map_err(|_| unsupported())?;
    let kind = if mime.type_() == mime::TEXT && mime.subtype() == mime::HTML {
        MediaKind::Html
    } else if mime.type_() == mime::TEXT && mime.subtype() == mime::CSS {
        MediaKind::Css
    } else {
        return Err(unsupported());
    };
    if let Some(charset) = mime.get_param(mime::CHARSET) {
        if !charset.as_str().eq_ignore_ascii_case("utf-8") {
            return Err(unsupported());
        }
    }
    Ok(kind)
}

/// Runs the rewriter selected by `kind` over `input`, writing the result to
/// `out`.
pub fn rewrite_document(
    kind: MediaKind,
    input: &[u8],
    out: &mut dyn Write,
    rewriter: &mut UrlRewriter<'_>,
) -> Result<(), RewriteError> {
    match kind {
        MediaKind::Html => html::rewrite(input, out, rewriter),
        MediaKind::Css => css::rewrite(input, out, rewriter),
    }
}
