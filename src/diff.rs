//! Compares two repositories entry by entry.
//!
//! Entries are matched by canonical URL. For matched pairs the status codes
//! are compared first, then (optionally) headers, then bodies; bodies with
//! NUL bytes are treated as binary and only reported by size.

use std::io::{self, Write};

use similar::TextDiff;
use thiserror::Error;
use url::Url;

use crate::store::{Document, Entry, Store, StoreError};
use crate::urlkey;

#[derive(Debug, Clone, Default)]
pub struct DiffOptions {
    /// Suppress body and header diffs when both sides have one of these
    /// status codes.
    pub ignore_statuses: Vec<u16>,
    /// Also diff response headers.
    pub headers: bool,
}

#[derive(Debug, Error)]
pub enum DiffError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("stored url {0:?} does not parse: {1}")]
    BadStoredUrl(String, url::ParseError),
}

struct DiffEntry {
    canonical_url: String,
    entry: Entry,
}

/// Diffs repositories `a` and `b`, writing a report to `out`.
pub fn diff_repositories(
    a: &Store,
    b: &Store,
    options: &DiffOptions,
    out: &mut dyn Write,
) -> Result<(), DiffError> {
    let entries_a = collect(a)?;
    let entries_b = collect(b)?;

    let mut i = 0;
    let mut j = 0;
    while i < entries_a.len() || j < entries_b.len() {
        if j >= entries_b.len()
            || (i < entries_a.len() && entries_a[i].canonical_url < entries_b[j].canonical_url)
        {
            writeln!(out, "only in A: {}", entries_a[i].canonical_url)?;
            i += 1;
        } else if i >= entries_a.len() || entries_a[i].canonical_url > entries_b[j].canonical_url {
            writeln!(out, "only in B: {}", entries_b[j].canonical_url)?;
            j += 1;
        } else {
            diff_pair(&entries_a[i], &entries_b[j], options, out)?;
            i += 1;
            j += 1;
        }
    }
    Ok(())
}

fn collect(store: &Store) -> Result<Vec<DiffEntry>, DiffError> {
    let mut entries = Vec::new();
    for entry in store.list()? {
        let doc = entry.open()?;
        let url = Url::parse(&doc.metadata.url)
            .map_err(|e| DiffError::BadStoredUrl(doc.metadata.url.clone(), e))?;
        entries.push(DiffEntry {
            canonical_url: urlkey::canonical(&url).to_string(),
            entry,
        });
    }
    entries.sort_by(|x, y| x.canonical_url.cmp(&y.canonical_url));
    Ok(entries)
}

fn diff_pair(
    a: &DiffEntry,
    b: &DiffEntry,
    options: &DiffOptions,
    out: &mut dyn Write,
) -> Result<(), DiffError> {
    let mut doc_a = a.entry.open()?;
    let mut doc_b = b.entry.open()?;
    let url = &a.canonical_url;

    let mut ignore = false;
    if doc_a.metadata.status_code != doc_b.metadata.status_code {
        writeln!(
            out,
            "status code differs {}: {} vs {}",
            url, doc_a.metadata.status_code, doc_b.metadata.status_code
        )?;
    } else if options.ignore_statuses.contains(&doc_a.metadata.status_code) {
        ignore = true;
    }

    if options.headers && !ignore {
        let headers_a = header_lines(&doc_a);
        let headers_b = header_lines(&doc_b);
        if headers_a != headers_b {
            let diff = TextDiff::from_lines(headers_a.as_str(), headers_b.as_str());
            write!(
                out,
                "{}",
                diff.unified_diff()
                    .header(&format!("a (headers): {url}"), &format!("b (headers): {url}"))
            )?;
        }
    }

    if ignore {
        writeln!(out, "ignored body: {url}")?;
        return Ok(());
    }

    let body_a = doc_a.read_body()?;
    let body_b = doc_b.read_body()?;
    if body_a == body_b {
        writeln!(out, "equal: {url}")?;
    } else if is_binary(&body_a) || is_binary(&body_b) {
        writeln!(
            out,
            "binary files different ({} bytes vs {} bytes): {}",
            body_a.len(),
            body_b.len(),
            url
        )?;
    } else {
        let text_a = String::from_utf8_lossy(&body_a);
        let text_b = String::from_utf8_lossy(&body_b);
        let diff = TextDiff::from_lines(text_a.as_ref(), text_b.as_ref());
        write!(
            out,
            "{}",
            diff.unified_diff()
                .header(&format!("a:{url}"), &format!("b:{url}"))
        )?;
        writeln!(out)?;
    }
    Ok(())
}

fn header_lines(doc: &Document) -> String {
    let mut lines = String::new();
    for (name, values) in &doc.metadata.headers {
        for value in values {
            lines.push_str(name);
            lines.push_str(": ");
            lines.push_str(value);
            lines.push('\n');
        }
    }
    lines
}

fn is_binary(data: &[u8]) -> bool {
    data.contains(&0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DocumentMetadata, HeaderValues};
    use chrono::Utc;
    use tempfile::TempDir;

    fn store_response(store: &Store, url: &str, status_code: u16, body: &[u8]) {
        let parsed = Url::parse(url).unwrap();
        let mut headers = HeaderValues::new();
        headers.insert("Content-Type".to_string(), vec!["text/html".to_string()]);
        let metadata = DocumentMetadata {
            key: urlkey::key(&parsed),
            download_started_time: Utc::now(),
            url: url.to_string(),
            status: format!("{status_code} X"),
            status_code,
            proto: "HTTP/1.1".to_string(),
            headers,
            trailers: HeaderValues::new(),
        };
        let mut writer = store.writer().unwrap();
        use std::io::Write as _;
        writer.write_all(body).unwrap();
        writer.close(&metadata).unwrap();
    }

    fn run_diff(a: &Store, b: &Store, options: &DiffOptions) -> String {
        let mut out = Vec::new();
        diff_repositories(a, b, options, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_reports_one_sided_entries() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let a = Store::new(dir_a.path());
        let b = Store::new(dir_b.path());
        store_response(&a, "http://t/only-a", 200, b"x");
        store_response(&b, "http://t/only-b", 200, b"x");

        let report = run_diff(&a, &b, &DiffOptions::default());
        assert!(report.contains("only in A: http://t/only-a"));
        assert!(report.contains("only in B: http://t/only-b"));
    }

    #[test]
    fn test_equal_bodies() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let a = Store::new(dir_a.path());
        let b = Store::new(dir_b.path());
        store_response(&a, "http://t/x", 200, b"same");
        store_response(&b, "http://t/x", 200, b"same");

        let report = run_diff(&a, &b, &DiffOptions::default());
        assert_eq!(report, "equal: http://t/x\n");
    }

    #[test]
    fn test_status_mismatch_reported() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let a = Store::new(dir_a.path());
        let b = Store::new(dir_b.path());
        store_response(&a, "http://t/x", 200, b"x");
        store_response(&b, "http://t/x", 404, b"x");

        let report = run_diff(&a, &b, &DiffOptions::default());
        assert!(report.contains("status code differs http://t/x: 200 vs 404"));
    }

    #[test]
    fn test_ignored_status_suppresses_body_diff() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let a = Store::new(dir_a.path());
        let b = Store::new(dir_b.path());
        store_response(&a, "http://t/x", 404, b"one");
        store_response(&b, "http://t/x", 404, b"two");

        let options = DiffOptions {
            ignore_statuses: vec![404],
            headers: false,
        };
        let report = run_diff(&a, &b, &options);
        assert_eq!(report, "ignored body: http://t/x\n");
    }

    #[test]
    fn test_binary_bodies_reported_by_size() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let a = Store::new(dir_a.path());
        let b = Store::new(dir_b.path());
        store_response(&a, "http://t/x", 200, b"\x00abc");
        store_response(&b, "http://t/x", 200, b"\x00abcd");

        let report = run_diff(&a, &b, &DiffOptions::default());
        assert!(report.contains("binary files different (4 bytes vs 5 bytes): http://t/x"));
    }

    #[test]
    fn test_text_bodies_get_unified_diff() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let a = Store::new(dir_a.path());
        let b = Store::new(dir_b.path());
        store_response(&a, "http://t/x", 200, b"line one\nline two\n");
        store_response(&b, "http://t/x", 200, b"line one\nline 2\n");

        let report = run_diff(&a, &b, &DiffOptions::default());
        assert!(report.contains("-line two"));
        assert!(report.contains("+line 2"));
        assert!(report.contains("a:http://t/x"));
    }
}
