//! Materializes a repository as a static file tree.
//!
//! Each stored 200-response becomes a file under
//! `<scheme>-<host>-<port>/<path>`. Directory-like paths get an `index`
//! file, query strings stay in the filename, and HTML documents without an
//! `.htm(l)` extension get one appended so static servers pick the right
//! content type. With rewrite mappings, HTML and CSS bodies are rewritten
//! so their links point at the new base.

use std::fs::{self, File};
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use filetime::FileTime;
use thiserror::Error;
use url::Url;

use crate::rebase::{self, RebaseError};
use crate::rewrite::{self, MediaKind, RewriteAction, RewriteError, UrlRef};
use crate::store::{Document, Store, StoreError};
use crate::urlkey;

/// One `--rewrite-url` mapping.
#[derive(Debug, Clone)]
pub struct UrlMapping {
    pub old_base: Url,
    pub new_base: Url,
}

#[derive(Debug, Error)]
pub enum FilesError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Rewrite(#[from] RewriteError),
    #[error("stored url {0:?} does not parse: {1}")]
    BadStoredUrl(String, url::ParseError),
    #[error("content-type {0:?} does not parse")]
    BadContentType(String),
    #[error("last-modified {0:?} does not parse")]
    BadLastModified(String),
    #[error("redirect unsupported {0:?} -> {1:?}")]
    UnsupportedRedirect(String, String),
    #[error("unsupported status code {0}: {1}")]
    UnsupportedStatus(u16, String),
}

/// Writes every stored document into `out_dir`, which must not exist yet.
pub fn generate(store: &Store, out_dir: &Path, mappings: &[UrlMapping]) -> Result<(), FilesError> {
    fs::create_dir(out_dir)?;
    for entry in store.list()? {
        let mut doc = entry.open()?;
        write_entry(&mut doc, out_dir, mappings)?;
    }
    Ok(())
}

fn write_entry(doc: &mut Document, out_dir: &Path, mappings: &[UrlMapping]) -> Result<(), FilesError> {
    let url = Url::parse(&doc.metadata.url)
        .map_err(|e| FilesError::BadStoredUrl(doc.metadata.url.clone(), e))?;
    let canonical = urlkey::canonical(&url);

    match doc.metadata.status_code {
        404 => Ok(()),
        200 => write_file(doc, out_dir, &url, &canonical, mappings),
        300..=399 => {
            let location = doc.metadata.header("location").unwrap_or_default();
            if is_directory_redirect(&canonical, location) {
                return Ok(());
            }
            Err(FilesError::UnsupportedRedirect(
                doc.metadata.url.clone(),
                location.to_string(),
            ))
        }
        code => Err(FilesError::UnsupportedStatus(code, doc.metadata.url.clone())),
    }
}

fn write_file(
    doc: &mut Document,
    out_dir: &Path,
    url: &Url,
    canonical: &Url,
    mappings: &[UrlMapping],
) -> Result<(), FilesError> {
    let content_type = doc.metadata.header("content-type").unwrap_or_default();
    let mime: mime::Mime = content_type
        .parse()
        .map_err(|_| FilesError::BadContentType(content_type.to_string()))?;
    let is_html = mime.type_() == mime::TEXT && mime.subtype() == mime::HTML;

    let site_dir = format!(
        "{}-{}-{}",
        canonical.scheme(),
        canonical.host_str().unwrap_or_default(),
        resolve_port(canonical)
    );

    let mut filename = url.path().to_string();
    if let Some(query) = url.query() {
        filename.push('?');
        filename.push_str(query);
    } else if filename.ends_with('/') {
        filename.push_str("index");
    }
    if is_html && !has_html_extension(&filename) {
        filename.push_str(".html");
    }

    let output_path = out_dir
        .join(site_dir)
        .join(filename.trim_start_matches('/'));
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)?;
    }

    // Rewrite link targets only when mappings are configured and the media
    // type gate admits the document; everything else is copied verbatim.
    let rewrite_kind = if mappings.is_empty() {
        None
    } else {
        rewrite::media_kind(content_type).ok()
    };
    match rewrite_kind {
        Some(kind) => {
            let body = doc.read_body()?;
            let mut out = File::create(&output_path)?;
            rewrite_body(kind, &body, &mut out, mappings)?;
        }
        None => {
            let mut out = File::create(&output_path)?;
            io::copy(&mut doc.body()?, &mut out)?;
        }
    }

    let mtime = match doc.metadata.header("last-modified") {
        Some(value) => DateTime::parse_from_rfc2822(value)
            .map_err(|_| FilesError::BadLastModified(value.to_string()))?
            .with_timezone(&Utc),
        None => doc.metadata.download_started_time,
    };
    filetime::set_file_mtime(&output_path, FileTime::from_system_time(mtime.into()))?;
    Ok(())
}

fn rewrite_body(
    kind: MediaKind,
    body: &[u8],
    out: &mut File,
    mappings: &[UrlMapping],
) -> Result<(), FilesError> {
    let mut callback = |url: UrlRef<'_>| -> Result<RewriteAction, RewriteError> {
        // Relative references have no scheme or host to match a mapping
        // against; they keep working after the move and stay untouched.
        let parsed = match Url::parse(url.value.trim()) {
            Ok(parsed) => parsed,
            Err(_) => return Ok(RewriteAction::Keep),
        };
        for mapping in mappings {
            match rebase::rebase(&parsed, &mapping.old_base, &mapping.new_base) {
                Ok(rebased) => return Ok(RewriteAction::Replace(rebased.to_string())),
                Err(RebaseError::NoBase) => continue,
                Err(e) => return Err(RewriteError::Callback(e.to_string())),
            }
        }
        Ok(RewriteAction::Keep)
    };
    rewrite::rewrite_document(kind, body, out, &mut callback)?;
    Ok(())
}

/// A redirect from `u` to `u/` needs no file; static servers do it
/// themselves.
fn is_directory_redirect(canonical_url: &Url, location: &str) -> bool {
    match Url::parse(location) {
        Ok(target) => {
            format!("{}/", canonical_url) == urlkey::canonical(&target).to_string()
        }
        Err(_) => false,
    }
}

fn resolve_port(url: &Url) -> String {
    match url.port() {
        Some(port) => port.to_string(),
        None => match url.scheme() {
            "http" => "80".to_string(),
            "https" => "443".to_string(),
            _ => String::new(),
        },
    }
}

fn has_html_extension(filename: &str) -> bool {
    let lower = filename.to_ascii_lowercase();
    lower.ends_with(".html") || lower.ends_with(".htm")
}
