//! Canonical URL forms and storage keys.
//!
//! Two URLs address the same stored document exactly when their keys are
//! equal, so everything that feeds the queue or the store goes through
//! [`key`] first.

use url::form_urlencoded;
use url::Url;

/// Query parameters that never influence the response and are dropped from
/// keys.
const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
];

/// Returns the canonical form of a URL.
///
/// `url::Url` already performs most RFC 3986 normalization during parsing
/// (lowercase scheme and host, default-port elision, bracketed IPv6 hosts);
/// this pins down the remainder: an absolute URL with an empty path gets
/// path `/`.
pub fn canonical(input: &Url) -> Url {
    let mut u = input.clone();
    if u.path().is_empty() && !u.cannot_be_a_base() {
        u.set_path("/");
    }
    u
}

/// Returns the canonical storage key for a URL.
///
/// On top of [`canonical`]:
///
///  - tracking query parameters are removed,
///  - remaining parameters are sorted by name, values keeping their
///    original order, and re-escaped,
///  - the fragment is dropped.
///
/// Tracking parameters are removed before the fragment so the two steps
/// cannot observe each other.
pub fn key(input: &Url) -> String {
    let mut u = canonical(input);

    let mut params: Vec<(String, Vec<String>)> = Vec::new();
    for (name, value) in u.query_pairs() {
        if TRACKING_PARAMS.contains(&name.as_ref()) {
            continue;
        }
        match params.iter_mut().find(|(n, _)| n.as_str() == name.as_ref()) {
            Some((_, values)) => values.push(value.into_owned()),
            None => params.push((name.into_owned(), vec![value.into_owned()])),
        }
    }
    params.sort_by(|a, b| a.0.cmp(&b.0));

    if params.is_empty() {
        u.set_query(None);
    } else {
        let mut query = form_urlencoded::Serializer::new(String::new());
        for (name, values) in &params {
            for value in values {
                query.append_pair(name, value);
            }
        }
        u.set_query(Some(&query.finish()));
    }

    u.set_fragment(None);
    u.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_canonical_normalizes_scheme_and_host() {
        assert_eq!(
            canonical(&parse("HTTP://EXAMPLE.COM/Path")).as_str(),
            "http://example.com/Path"
        );
    }

    #[test]
    fn test_canonical_elides_default_ports() {
        assert_eq!(
            canonical(&parse("http://example.com:80/")).as_str(),
            "http://example.com/"
        );
        assert_eq!(
            canonical(&parse("https://example.com:443/")).as_str(),
            "https://example.com/"
        );
        assert_eq!(
            canonical(&parse("http://example.com:8080/")).as_str(),
            "http://example.com:8080/"
        );
    }

    #[test]
    fn test_canonical_adds_root_path() {
        assert_eq!(
            canonical(&parse("http://example.com")).as_str(),
            "http://example.com/"
        );
    }

    #[test]
    fn test_canonical_brackets_ipv6() {
        assert_eq!(
            canonical(&parse("http://[::1]:8080/x")).as_str(),
            "http://[::1]:8080/x"
        );
    }

    #[test]
    fn test_key_drops_fragment() {
        assert_eq!(
            key(&parse("https://example.com/page#section")),
            "https://example.com/page"
        );
    }

    #[test]
    fn test_key_removes_tracking_params() {
        assert_eq!(
            key(&parse(
                "https://example.com/?utm_source=x&utm_medium=y&a=1&utm_campaign=z"
            )),
            "https://example.com/?a=1"
        );
        assert_eq!(
            key(&parse("https://example.com/?utm_source=x")),
            "https://example.com/"
        );
    }

    #[test]
    fn test_key_sorts_params_and_keeps_value_order() {
        assert_eq!(
            key(&parse("https://example.com/?b=2&a=1&b=1")),
            "https://example.com/?a=1&b=2&b=1"
        );
    }

    #[test]
    fn test_key_escapes_values() {
        assert_eq!(
            key(&parse("https://example.com/?q=a b")),
            "https://example.com/?q=a+b"
        );
    }

    #[test]
    fn test_key_is_idempotent() {
        let inputs = [
            "https://example.com/?b=2&a=1&utm_source=t#frag",
            "http://EXAMPLE.com:80",
            "https://example.com/path?q=a%20b&q=c",
            "http://[2001:db8::1]/x?z=1&y=2",
        ];
        for input in inputs {
            let first = key(&parse(input));
            let second = key(&parse(&first));
            assert_eq!(first, second, "key not idempotent for {input}");
        }
    }

    #[test]
    fn test_key_equality_defines_identity() {
        assert_eq!(
            key(&parse("https://example.com/a?x=1#f")),
            key(&parse("HTTPS://EXAMPLE.COM:443/a?utm_term=t&x=1"))
        );
        assert_ne!(
            key(&parse("https://example.com/a?x=1")),
            key(&parse("https://example.com/a?x=2"))
        );
    }
}
