//! Byte-preserving HTML rewriter.
//!
//! A small lexer walks the input and reports, with exact byte ranges, start
//! tags, their attributes, and everything else as opaque text. The rewriter
//! copies every token verbatim except attribute values it decides to
//! replace, so with a callback that keeps everything the output equals the
//! input byte for byte.

use std::io::Write;

use std::sync::OnceLock;

use regex::Regex;

use super::opengraph::is_open_graph_url_property;
use super::{RewriteAction, RewriteError, UrlKind, UrlRef, UrlRewriter};

/// Elements whose content is raw text: no tags are discovered inside.
const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style", "textarea", "title"];

/// Rewrites the HTML document in `input`, writing the result to `out`.
///
/// The callback is invoked for every URL-bearing attribute in document
/// order. Lexer errors (a document truncated inside a tag, broken attribute
/// quoting) abort the rewrite.
pub fn rewrite(
    input: &[u8],
    out: &mut dyn Write,
    rewriter: &mut UrlRewriter<'_>,
) -> Result<(), RewriteError> {
    let mut state = Rewriter {
        input,
        out,
        rewriter,
        base_url: String::new(),
        new_base_url: String::new(),
        base_seen: false,
    };
    state.run()
}

// ---------------------------------------------------------------------------
// Lexer

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    /// Text, comments, doctypes, end tags, raw-text content.
    Text,
    /// `<name`.
    StartTagOpen,
    /// Leading whitespace, attribute name, optionally `=` and a value.
    Attr,
    /// Optional whitespace and `>`.
    StartTagClose,
    /// Optional whitespace and `/>`.
    StartTagVoid,
}

#[derive(Debug, Clone, Copy)]
struct Token {
    kind: TokenKind,
    start: usize,
    end: usize,
    /// Tag or attribute name range.
    name: (usize, usize),
    /// Attribute value range, including any surrounding quotes.
    value: Option<(usize, usize)>,
}

impl Token {
    fn plain(kind: TokenKind, start: usize, end: usize) -> Self {
        Token {
            kind,
            start,
            end,
            name: (start, start),
            value: None,
        }
    }
}

struct Lexer<'a> {
    input: &'a [u8],
    pos: usize,
    in_tag: bool,
    /// Lowercased name of a raw-text element whose content comes next.
    raw_text: Option<String>,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a [u8]) -> Self {
        Lexer {
            input,
            pos: 0,
            in_tag: false,
            raw_text: None,
        }
    }

    fn next(&mut self) -> Result<Option<Token>, RewriteError> {
        if self.in_tag {
            return self.next_in_tag().map(Some);
        }
        if self.pos >= self.input.len() {
            return Ok(None);
        }
        if let Some(element) = self.raw_text.take() {
            return Ok(Some(self.raw_text_token(&element)));
        }
        Ok(Some(self.next_outside()))
    }

    fn next_outside(&mut self) -> Token {
        let start = self.pos;
        let input = self.input;
        if input[self.pos] == b'<' {
            if self.pos + 1 < input.len() && input[self.pos + 1].is_ascii_alphabetic() {
                // Start tag: `<` and the tag name.
                self.pos += 2;
                while self.pos < input.len() && is_tag_name_byte(input[self.pos]) {
                    self.pos += 1;
                }
                self.in_tag = true;
                let mut tok = Token::plain(TokenKind::StartTagOpen, start, self.pos);
                tok.name = (start + 1, self.pos);
                return tok;
            }
            if input[self.pos..].starts_with(b"<!--") {
                self.pos = match find(input, self.pos + 4, b"-->") {
                    Some(i) => i + 3,
                    None => input.len(),
                };
                return Token::plain(TokenKind::Text, start, self.pos);
            }
            if input[self.pos..].starts_with(b"</")
                || input[self.pos..].starts_with(b"<!")
                || input[self.pos..].starts_with(b"<?")
            {
                self.pos = match memchr(input, self.pos, b'>') {
                    Some(i) => i + 1,
                    None => input.len(),
                };
                return Token::plain(TokenKind::Text, start, self.pos);
            }
            // A lone `<` that opens nothing; treat it as text.
            self.pos += 1;
        }
        self.pos = memchr(input, self.pos, b'<').unwrap_or(input.len());
        Token::plain(TokenKind::Text, start, self.pos)
    }

    /// Consumes raw element content up to (not including) the matching end
    /// tag.
    fn raw_text_token(&mut self, element: &str) -> Token {
        let start = self.pos;
        let input = self.input;
        let mut pos = self.pos;
        loop {
            match memchr(input, pos, b'<') {
                Some(i) => {
                    let rest = &input[i + 1..];
                    if rest.len() > element.len()
                        && rest[0] == b'/'
                        && rest[1..1 + element.len()].eq_ignore_ascii_case(element.as_bytes())
                    {
                        self.pos = i;
                        break;
                    }
                    pos = i + 1;
                }
                None => {
                    self.pos = input.len();
                    break;
                }
            }
        }
        Token::plain(TokenKind::Text, start, self.pos)
    }

    fn next_in_tag(&mut self) -> Result<Token, RewriteError> {
        let start = self.pos;
        let input = self.input;
        loop {
            while self.pos < input.len() && input[self.pos].is_ascii_whitespace() {
                self.pos += 1;
            }
            // A stray slash that does not close the tag is skipped.
            if self.pos < input.len()
                && input[self.pos] == b'/'
                && input.get(self.pos + 1) != Some(&b'>')
            {
                self.pos += 1;
                continue;
            }
            break;
        }
        if self.pos >= input.len() {
            return Err(RewriteError::TruncatedTag);
        }
        match input[self.pos] {
            b'>' => {
                self.pos += 1;
                self.in_tag = false;
                Ok(Token::plain(TokenKind::StartTagClose, start, self.pos))
            }
            b'/' => {
                // Guaranteed `/>` by the loop above.
                self.pos += 2;
                self.in_tag = false;
                Ok(Token::plain(TokenKind::StartTagVoid, start, self.pos))
            }
            _ => self.attribute_token(start),
        }
    }

    fn attribute_token(&mut self, start: usize) -> Result<Token, RewriteError> {
        let input = self.input;
        let name_start = self.pos;
        while self.pos < input.len() && is_attr_name_byte(input[self.pos]) {
            self.pos += 1;
        }
        let name = (name_start, self.pos);

        // Optional whitespace around `=`.
        let after_name = self.pos;
        while self.pos < input.len() && input[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
        if self.pos >= input.len() || input[self.pos] != b'=' {
            // Attribute without a value; the whitespace we skipped belongs
            // to the next token.
            self.pos = after_name;
            let mut tok = Token::plain(TokenKind::Attr, start, self.pos);
            tok.name = name;
            return Ok(tok);
        }
        self.pos += 1;
        while self.pos < input.len() && input[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }

        let value_start = self.pos;
        if self.pos < input.len() && (input[self.pos] == b'"' || input[self.pos] == b'\'') {
            let quote = input[self.pos];
            self.pos += 1;
            self.pos = memchr(input, self.pos, quote).ok_or_else(|| {
                RewriteError::MalformedAttribute(format!(
                    "attribute {:?} does not have an ending quote",
                    String::from_utf8_lossy(&input[value_start..])
                ))
            })?;
            self.pos += 1;
        } else {
            while self.pos < input.len() && !input[self.pos].is_ascii_whitespace() && input[self.pos] != b'>' {
                self.pos += 1;
            }
        }
        let mut tok = Token::plain(TokenKind::Attr, start, self.pos);
        tok.name = name;
        tok.value = Some((value_start, self.pos));
        Ok(tok)
    }
}

fn is_tag_name_byte(b: u8) -> bool {
    !b.is_ascii_whitespace() && b != b'/' && b != b'>'
}

fn is_attr_name_byte(b: u8) -> bool {
    !b.is_ascii_whitespace() && b != b'=' && b != b'/' && b != b'>'
}

fn memchr(haystack: &[u8], from: usize, needle: u8) -> Option<usize> {
    haystack[from..]
        .iter()
        .position(|&b| b == needle)
        .map(|i| from + i)
}

fn find(haystack: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| from + i)
}

// ---------------------------------------------------------------------------
// Rewriter

/// How to rewrite one attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handler {
    /// The value is a single URL.
    Single,
    /// Space-separated URL list.
    SpaceList,
    /// Comma-separated URL list.
    CommaList,
    /// An `img`/`source` srcset: URLs with optional descriptors.
    SrcSet,
    /// `<meta http-equiv>` refresh content.
    Refresh,
    /// OpenGraph `<meta>` content; ignores the document base.
    OpenGraph,
    /// `<base href>`: records the document base.
    BaseCapture,
}

/// URL-bearing attributes, keyed by attribute and tag name.
fn handler_for(attr: &str, tag: &str) -> Option<Handler> {
    let handler = match (attr, tag) {
        ("action", "form") => Handler::Single,
        ("archive", "object") => Handler::SpaceList,
        ("archive", "applet") => Handler::CommaList,
        ("background", "body") => Handler::Single,
        ("cite", "blockquote" | "del" | "ins" | "q") => Handler::Single,
        ("classid", "object") => Handler::Single,
        ("codebase", "applet" | "object") => Handler::Single,
        ("data", "object") => Handler::Single,
        ("formaction", "button" | "input") => Handler::Single,
        ("href", "a" | "area" | "link") => Handler::Single,
        ("icon", "command") => Handler::Single,
        ("longdesc", "img" | "frame" | "iframe") => Handler::Single,
        ("manifest", "html") => Handler::Single,
        ("poster", "video") => Handler::Single,
        ("profile", "head") => Handler::Single,
        (
            "src",
            "audio" | "embed" | "iframe" | "img" | "input" | "script" | "source" | "track"
            | "video" | "frame",
        ) => Handler::Single,
        ("srcset", "img" | "source") => Handler::SrcSet,
        ("usemap", "img" | "input" | "object") => Handler::Single,
        _ => return None,
    };
    Some(handler)
}

fn refresh_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(\d+)\s*(?:;url=(.*)\s*)?$").unwrap())
}

struct Rewriter<'a, 'r, 'c> {
    input: &'a [u8],
    out: &'r mut dyn Write,
    rewriter: &'r mut UrlRewriter<'c>,
    base_url: String,
    new_base_url: String,
    base_seen: bool,
}

impl<'a, 'r, 'c> Rewriter<'a, 'r, 'c> {
    fn run(&mut self) -> Result<(), RewriteError> {
        let mut lexer = Lexer::new(self.input);
        while let Some(tok) = lexer.next()? {
            match tok.kind {
                TokenKind::StartTagOpen => {
                    self.copy(&tok)?;
                    let tag = lower(&self.input[tok.name.0..tok.name.1]);
                    if RAW_TEXT_ELEMENTS.contains(&tag.as_str()) {
                        lexer.raw_text = Some(tag.clone());
                    }
                    if tag == "meta" {
                        self.process_meta(&mut lexer)?;
                    } else {
                        self.process_tag(&mut lexer, &tag)?;
                    }
                }
                _ => self.copy(&tok)?,
            }
        }
        Ok(())
    }

    fn copy(&mut self, tok: &Token) -> Result<(), RewriteError> {
        self.out.write_all(&self.input[tok.start..tok.end])?;
        Ok(())
    }

    /// Rewrites a start tag's attributes in place.
    fn process_tag(&mut self, lexer: &mut Lexer<'a>, tag: &str) -> Result<(), RewriteError> {
        loop {
            let tok = match lexer.next()? {
                Some(tok) => tok,
                None => return Err(RewriteError::TruncatedTag),
            };
            match tok.kind {
                TokenKind::Attr => {
                    let attr = lower(&self.input[tok.name.0..tok.name.1]);
                    let handler = if tag == "base" {
                        (attr == "href").then_some(Handler::BaseCapture)
                    } else {
                        handler_for(&attr, tag)
                    };
                    match handler {
                        Some(handler) => self.rewrite_attr(&tok, handler)?,
                        None => self.copy(&tok)?,
                    }
                }
                _ => return self.copy(&tok),
            }
        }
    }

    /// Buffers a `<meta>` tag's attributes, classifies the tag, and applies
    /// the matching handler to its `content` attribute only.
    fn process_meta(&mut self, lexer: &mut Lexer<'a>) -> Result<(), RewriteError> {
        let mut attrs = Vec::new();
        let close = loop {
            let tok = match lexer.next()? {
                Some(tok) => tok,
                None => return Err(RewriteError::TruncatedTag),
            };
            match tok.kind {
                TokenKind::Attr => attrs.push(tok),
                _ => break tok,
            }
        };

        let mut has_refresh = false;
        let mut has_item_prop = false;
        let mut item_prop = String::new();
        for tok in &attrs {
            let name = lower(&self.input[tok.name.0..tok.name.1]);
            if name == "http-equiv" {
                has_refresh = true;
            } else if name == "itemprop" || name == "property" {
                has_item_prop = true;
                let (_, value) = self.clean_value(tok)?;
                item_prop = value;
            }
        }

        let content_handler = match (has_refresh, has_item_prop) {
            (true, false) => Some(Handler::Refresh),
            (false, true) if is_open_graph_url_property(&item_prop) => Some(Handler::OpenGraph),
            _ => None,
        };

        for tok in &attrs {
            let name = lower(&self.input[tok.name.0..tok.name.1]);
            match content_handler {
                Some(handler) if name == "content" => self.rewrite_attr(tok, handler)?,
                _ => self.copy(tok)?,
            }
        }
        self.copy(&close)
    }

    fn rewrite_attr(&mut self, tok: &Token, handler: Handler) -> Result<(), RewriteError> {
        let (quote, value) = self.clean_value(tok)?;
        let action = match handler {
            Handler::Single => self.call(&value, UrlKind::Unknown)?,
            Handler::SpaceList => self.rewrite_url_list(&value, ' ')?,
            Handler::CommaList => self.rewrite_url_list(&value, ',')?,
            Handler::SrcSet => self.rewrite_srcset(&value)?,
            Handler::Refresh => self.rewrite_refresh(&value)?,
            Handler::OpenGraph => {
                // OpenGraph URLs are always absolute; they do not obey base.
                (self.rewriter)(UrlRef {
                    value: &value,
                    base: "",
                    new_base: "",
                    kind: UrlKind::OpenGraph,
                })?
            }
            Handler::BaseCapture => self.capture_base(&value)?,
        };

        match action {
            RewriteAction::Keep => self.copy(tok),
            RewriteAction::Replace(new_value) => {
                let raw = &self.input[tok.start..tok.end];
                match tok.value {
                    Some((value_start, _)) => {
                        self.out.write_all(&raw[..value_start - tok.start])?;
                    }
                    None => {
                        self.out.write_all(raw)?;
                        self.out.write_all(b"=")?;
                    }
                }
                self.out.write_all(&[quote])?;
                self.out
                    .write_all(html_escape::encode_safe(&new_value).as_bytes())?;
                self.out.write_all(&[quote])?;
                Ok(())
            }
        }
    }

    /// Strips quoting from an attribute value and unescapes HTML entities.
    /// Returns the quote to use on output (`"` when the input was unquoted).
    fn clean_value(&self, tok: &Token) -> Result<(u8, String), RewriteError> {
        let raw = match tok.value {
            Some((start, end)) => &self.input[start..end],
            None => return Ok((b'"', String::new())),
        };
        let (quote, inner) = match raw.first() {
            Some(&q @ (b'"' | b'\'')) => {
                if raw.len() < 2 {
                    return Err(RewriteError::MalformedAttribute(format!(
                        "attribute {:?} does not have an ending quote",
                        String::from_utf8_lossy(raw)
                    )));
                }
                if raw[raw.len() - 1] != q {
                    return Err(RewriteError::MalformedAttribute(format!(
                        "attribute quote mismatch in {:?}",
                        String::from_utf8_lossy(raw)
                    )));
                }
                (q, &raw[1..raw.len() - 1])
            }
            _ => (b'"', raw),
        };
        let value = String::from_utf8_lossy(inner);
        Ok((
            quote,
            html_escape::decode_html_entities(value.as_ref()).into_owned(),
        ))
    }

    fn call(&mut self, value: &str, kind: UrlKind) -> Result<RewriteAction, RewriteError> {
        (self.rewriter)(UrlRef {
            value,
            base: &self.base_url,
            new_base: &self.new_base_url,
            kind,
        })
    }

    fn rewrite_url_list(
        &mut self,
        value: &str,
        separator: char,
    ) -> Result<RewriteAction, RewriteError> {
        let mut buf = String::new();
        let mut any_modified = false;
        for (i, part) in value.split(separator).enumerate() {
            if i > 0 {
                buf.push(separator);
            }
            match self.call(part, UrlKind::Unknown)? {
                RewriteAction::Keep => buf.push_str(part),
                RewriteAction::Replace(new_value) => {
                    buf.push_str(&new_value);
                    any_modified = true;
                }
            }
        }
        if !any_modified {
            return Ok(RewriteAction::Keep);
        }
        Ok(RewriteAction::Replace(buf))
    }

    fn rewrite_srcset(&mut self, value: &str) -> Result<RewriteAction, RewriteError> {
        let mut buf = String::new();
        let mut any_modified = false;
        for (i, part) in value.split(',').enumerate() {
            if i > 0 {
                buf.push_str(", ");
            }
            let trimmed = part.trim();
            if trimmed.is_empty() {
                buf.push_str(part);
                continue;
            }
            let (url_part, descriptor) = match trimmed.split_once(' ') {
                Some((url_part, descriptor)) => (url_part, Some(descriptor)),
                None => (trimmed, None),
            };
            match self.call(url_part, UrlKind::Unknown)? {
                RewriteAction::Keep => buf.push_str(part),
                RewriteAction::Replace(new_value) => {
                    buf.push_str(&new_value);
                    if let Some(descriptor) = descriptor {
                        buf.push(' ');
                        buf.push_str(descriptor);
                    }
                    any_modified = true;
                }
            }
        }
        if !any_modified {
            return Ok(RewriteAction::Keep);
        }
        Ok(RewriteAction::Replace(buf))
    }

    fn rewrite_refresh(&mut self, value: &str) -> Result<RewriteAction, RewriteError> {
        let captures = match refresh_regex().captures(value) {
            Some(captures) => captures,
            None => return Ok(RewriteAction::Keep),
        };
        let seconds = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
        let url_value = captures.get(2).map(|m| m.as_str()).unwrap_or_default();
        match self.call(url_value, UrlKind::Unknown)? {
            RewriteAction::Keep => Ok(RewriteAction::Keep),
            RewriteAction::Replace(new_value) => {
                Ok(RewriteAction::Replace(format!("{seconds};url={new_value}")))
            }
        }
    }

    /// Handles `<base href>`: the first one sets the document base; later
    /// ones pass through unchanged.
    fn capture_base(&mut self, value: &str) -> Result<RewriteAction, RewriteError> {
        if self.base_seen {
            return Ok(RewriteAction::Keep);
        }
        self.base_seen = true;
        self.base_url = value.to_string();
        let action = (self.rewriter)(UrlRef {
            value,
            base: "",
            new_base: "",
            kind: UrlKind::Base,
        })?;
        match action {
            RewriteAction::Keep => {
                self.new_base_url = self.base_url.clone();
                Ok(RewriteAction::Keep)
            }
            RewriteAction::Replace(new_base) => {
                self.new_base_url = new_base.clone();
                Ok(RewriteAction::Replace(new_base))
            }
        }
    }
}

fn lower(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keep_all(_: UrlRef<'_>) -> Result<RewriteAction, RewriteError> {
        Ok(RewriteAction::Keep)
    }

    fn rewrite_str(
        input: &str,
        rewriter: &mut UrlRewriter<'_>,
    ) -> Result<String, RewriteError> {
        let mut out = Vec::new();
        rewrite(input.as_bytes(), &mut out, rewriter)?;
        Ok(String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_verbatim_with_keep_callback() {
        let inputs = [
            "<html   ><body><a href=\"1&amp;.html\">1</a><a href='2.html'>1</a></body></html>",
            "<html><body><input disabled ><a href = \"3.html\"></a></body></html>",
            "<!DOCTYPE html><!-- comment --><p>text</p>",
            "plain text, no tags",
            "<img src=unquoted.png alt=x>",
            "<br/><hr />",
            "<script>if (a < b) { location.href = \"x\"; }</script>",
            "<style>a { color: red; }</style>",
            "<base href=\"http://example.com/\"><base href=\"http://other/\">",
            "<meta charset=\"utf-8\"><meta name=\"viewport\" content=\"width=device-width\">",
            "text with a lone < sign",
            "<a href=\"x\" href=\"y\">double</a>",
        ];
        for input in inputs {
            assert_eq!(
                rewrite_str(input, &mut keep_all).unwrap(),
                input,
                "identity violated for {input:?}"
            );
        }
    }

    #[test]
    fn test_rewrites_href_values() {
        let input =
            "<html   ><body><a   href=\"1&amp;.html\">1</a><a href='2.html'>1</a></body></html>";
        let output = rewrite_str(input, &mut |url: UrlRef<'_>| {
            Ok(RewriteAction::Replace(format!(
                "{}.new",
                url.value.to_uppercase()
            )))
        })
        .unwrap();
        assert_eq!(
            output,
            "<html   ><body><a   href=\"1&amp;.HTML.new\">1</a><a href='2.HTML.new'>1</a></body></html>"
        );
    }

    #[test]
    fn test_unquoted_value_is_quoted_when_rewritten() {
        let output = rewrite_str("<img src=a.png>", &mut |_| {
            Ok(RewriteAction::Replace("b.png".to_string()))
        })
        .unwrap();
        assert_eq!(output, "<img src=\"b.png\">");
    }

    #[test]
    fn test_preserves_spacing_around_equals() {
        let output = rewrite_str("<a href = \"a.html\">x</a>", &mut |_| {
            Ok(RewriteAction::Replace("b.html".to_string()))
        })
        .unwrap();
        assert_eq!(output, "<a href = \"b.html\">x</a>");
    }

    #[test]
    fn test_escapes_replacement_value() {
        let output = rewrite_str("<a href=\"x\">x</a>", &mut |_| {
            Ok(RewriteAction::Replace("a&b.html".to_string()))
        })
        .unwrap();
        assert_eq!(output, "<a href=\"a&amp;b.html\">x</a>");
    }

    #[test]
    fn test_non_url_attributes_untouched() {
        let input = "<a class=\"btn\" id=\"x\" href=\"a.html\">x</a>";
        let output = rewrite_str(input, &mut |url: UrlRef<'_>| {
            assert_eq!(url.value, "a.html");
            Ok(RewriteAction::Replace("b.html".to_string()))
        })
        .unwrap();
        assert_eq!(output, "<a class=\"btn\" id=\"x\" href=\"b.html\">x</a>");
    }

    #[test]
    fn test_url_attribute_after_unknown_attribute_is_still_rewritten() {
        let output = rewrite_str("<a class=x href=\"a.html\">x</a>", &mut |_| {
            Ok(RewriteAction::Replace("b.html".to_string()))
        })
        .unwrap();
        assert_eq!(output, "<a class=x href=\"b.html\">x</a>");
    }

    #[test]
    fn test_url_list_partial_modification() {
        let output = rewrite_str("<applet archive=\"./a.html, b.html\"></applet>", &mut |url: UrlRef<'_>| {
            if url.value == "./a.html" {
                Ok(RewriteAction::Keep)
            } else {
                Ok(RewriteAction::Replace("REPLACED".to_string()))
            }
        })
        .unwrap();
        assert_eq!(output, "<applet archive=\"./a.html,REPLACED\"></applet>");
    }

    #[test]
    fn test_url_list_all_kept_leaves_attribute() {
        let input = "<applet archive=\"./a.html, b.html\"></applet>";
        assert_eq!(rewrite_str(input, &mut keep_all).unwrap(), input);
    }

    #[test]
    fn test_space_separated_list_on_object() {
        let output = rewrite_str("<object archive=\"a b\"></object>", &mut |_| {
            Ok(RewriteAction::Replace("R".to_string()))
        })
        .unwrap();
        assert_eq!(output, "<object archive=\"R R\"></object>");
    }

    #[test]
    fn test_srcset_rewrites_urls_keeps_descriptors() {
        let output = rewrite_str(
            "<img srcset=\"./a.html 480w, b.html 870w\">",
            &mut |_| Ok(RewriteAction::Replace("REPLACED".to_string())),
        )
        .unwrap();
        assert_eq!(output, "<img srcset=\"REPLACED 480w, REPLACED 870w\">");
    }

    #[test]
    fn test_srcset_partial_modification() {
        let output = rewrite_str(
            "<img srcset=\"./a.html 480w, b.html 780w\">",
            &mut |url: UrlRef<'_>| {
                if url.value == "./a.html" {
                    Ok(RewriteAction::Keep)
                } else {
                    Ok(RewriteAction::Replace("REPLACED".to_string()))
                }
            },
        )
        .unwrap();
        assert_eq!(output, "<img srcset=\"./a.html 480w, REPLACED 780w\">");
    }

    #[test]
    fn test_meta_refresh_rewrite() {
        let input = "<head><meta content=\"5;url=x.html\" http-equiv=\"refresh\"></head>";
        let output = rewrite_str(input, &mut |url: UrlRef<'_>| {
            assert_eq!(url.value, "x.html");
            Ok(RewriteAction::Replace("REPLACED".to_string()))
        })
        .unwrap();
        assert_eq!(
            output,
            "<head><meta content=\"5;url=REPLACED\" http-equiv=\"refresh\"></head>"
        );
    }

    #[test]
    fn test_meta_refresh_without_url_part() {
        let input = "<meta http-equiv=\"refresh\" content=\"5\">";
        assert_eq!(rewrite_str(input, &mut keep_all).unwrap(), input);
    }

    #[test]
    fn test_meta_refresh_non_matching_content() {
        let input = "<meta http-equiv=\"refresh\" content=\"not a refresh\">";
        let output = rewrite_str(input, &mut |_| {
            Ok(RewriteAction::Replace("REPLACED".to_string()))
        })
        .unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn test_meta_opengraph_content_rewritten() {
        let input = "<meta property=\"og:image\" content=\"http://example.com/a.png\">";
        let output = rewrite_str(input, &mut |url: UrlRef<'_>| {
            assert_eq!(url.kind, UrlKind::OpenGraph);
            assert_eq!(url.base, "");
            Ok(RewriteAction::Replace("http://mirror/a.png".to_string()))
        })
        .unwrap();
        assert_eq!(
            output,
            "<meta property=\"og:image\" content=\"http://mirror/a.png\">"
        );
    }

    #[test]
    fn test_meta_non_opengraph_property_untouched() {
        let input = "<meta property=\"og:title\" content=\"not a url\">";
        let output = rewrite_str(input, &mut |_| {
            Ok(RewriteAction::Replace("REPLACED".to_string()))
        })
        .unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn test_base_capture_flows_into_later_urls() {
        let input = "<base href=\"http://example.com\"><a href=\"p.html\">x</a>";
        let mut seen: Vec<(String, String, String)> = Vec::new();
        let output = rewrite_str(input, &mut |url: UrlRef<'_>| {
            seen.push((
                url.value.to_string(),
                url.base.to_string(),
                url.new_base.to_string(),
            ));
            if url.kind == UrlKind::Base {
                Ok(RewriteAction::Replace("http://mirror/".to_string()))
            } else {
                Ok(RewriteAction::Keep)
            }
        })
        .unwrap();
        assert_eq!(
            output,
            "<base href=\"http://mirror/\"><a href=\"p.html\">x</a>"
        );
        assert_eq!(
            seen,
            vec![
                ("http://example.com".to_string(), String::new(), String::new()),
                (
                    "p.html".to_string(),
                    "http://example.com".to_string(),
                    "http://mirror/".to_string()
                ),
            ]
        );
    }

    #[test]
    fn test_base_kept_means_new_base_equals_base() {
        let input = "<base href=\"http://example.com/\"><a href=\"p.html\">x</a>";
        let mut bases: Vec<(String, String)> = Vec::new();
        rewrite_str(input, &mut |url: UrlRef<'_>| {
            if url.kind != UrlKind::Base {
                bases.push((url.base.to_string(), url.new_base.to_string()));
            }
            Ok(RewriteAction::Keep)
        })
        .unwrap();
        assert_eq!(
            bases,
            vec![(
                "http://example.com/".to_string(),
                "http://example.com/".to_string()
            )]
        );
    }

    #[test]
    fn test_only_first_base_counts() {
        let input = "<base href=\"http://one/\"><base href=\"http://two/\">";
        let mut base_calls = 0;
        let output = rewrite_str(input, &mut |url: UrlRef<'_>| {
            if url.kind == UrlKind::Base {
                base_calls += 1;
                return Ok(RewriteAction::Replace("http://mirror/".to_string()));
            }
            Ok(RewriteAction::Keep)
        })
        .unwrap();
        assert_eq!(base_calls, 1);
        assert_eq!(
            output,
            "<base href=\"http://mirror/\"><base href=\"http://two/\">"
        );
    }

    #[test]
    fn test_unterminated_quote_is_malformed() {
        let result = rewrite_str("<a href=\"x>y</a>", &mut keep_all);
        assert!(matches!(
            result,
            Err(RewriteError::MalformedAttribute(_))
        ));
    }

    #[test]
    fn test_truncated_tag_is_an_error() {
        let result = rewrite_str("<a href=\"x\" ", &mut keep_all);
        assert!(matches!(result, Err(RewriteError::TruncatedTag)));
    }

    #[test]
    fn test_callback_error_aborts_document() {
        let result = rewrite_str("<a href=\"x\">y</a>", &mut |_| {
            Err(RewriteError::Callback("boom".to_string()))
        });
        assert!(matches!(result, Err(RewriteError::Callback(_))));
    }

    #[test]
    fn test_raw_text_elements_hide_tags() {
        let input = "<script>document.write('<a href=\"x\">');</script><a href=\"real.html\">x</a>";
        let mut urls = Vec::new();
        rewrite_str(input, &mut |url: UrlRef<'_>| {
            urls.push(url.value.to_string());
            Ok(RewriteAction::Keep)
        })
        .unwrap();
        assert_eq!(urls, vec!["real.html".to_string()]);
    }

    #[test]
    fn test_callbacks_in_document_order() {
        let input = "<a href=\"1\"></a><img src=\"2\"><form action=\"3\"></form>";
        let mut urls = Vec::new();
        rewrite_str(input, &mut |url: UrlRef<'_>| {
            urls.push(url.value.to_string());
            Ok(RewriteAction::Keep)
        })
        .unwrap();
        assert_eq!(urls, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_entity_unescape_before_callback() {
        rewrite_str("<a href=\"a&amp;b.html\">x</a>", &mut |url: UrlRef<'_>| {
            assert_eq!(url.value, "a&b.html");
            Ok(RewriteAction::Keep)
        })
        .unwrap();
    }
}
