//! Rewrites URLs from one base to another.

use thiserror::Error;
use url::Url;

use crate::urlkey;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RebaseError {
    /// The URL is not under the old base.
    #[error("base is not a parent of url")]
    NoBase,
    /// The old base path ends with a slash but the new one does not.
    #[error("if the old base path ends with a slash, the new one must too")]
    NewBaseNotDirectory,
}

/// Rewrites `input` to be under `new_base` instead of `old_base`.
///
/// All three URLs are absolute by construction (`url::Url` cannot represent
/// a relative reference). The scheme and host of `input` must match
/// `old_base`; when the old base path ends with `/` the input path must
/// start with it (and the new base path must also end with `/`), otherwise
/// the paths must be equal. The query and fragment of `input` are carried
/// over unchanged.
pub fn rebase(input: &Url, old_base: &Url, new_base: &Url) -> Result<Url, RebaseError> {
    let u = urlkey::canonical(input);
    let old_base = urlkey::canonical(old_base);
    let new_base = urlkey::canonical(new_base);

    if u.scheme() != old_base.scheme() {
        return Err(RebaseError::NoBase);
    }
    if u.host() != old_base.host() || u.port() != old_base.port() {
        return Err(RebaseError::NoBase);
    }

    let new_path = if old_base.path().ends_with('/') {
        let rest = u
            .path()
            .strip_prefix(old_base.path())
            .ok_or(RebaseError::NoBase)?;
        if !new_base.path().ends_with('/') {
            return Err(RebaseError::NewBaseNotDirectory);
        }
        format!("{}{}", new_base.path(), rest)
    } else {
        if u.path() != old_base.path() {
            return Err(RebaseError::NoBase);
        }
        new_base.path().to_string()
    };

    let mut out = new_base;
    out.set_path(&new_path);
    out.set_query(u.query());
    out.set_fragment(u.fragment());
    Ok(out)
}
