//! Byte-preserving CSS rewriter.
//!
//! A minimal lexer splits the stylesheet into whitespace, strings,
//! at-keywords, `url(...)` tokens, and opaque runs. Only `url(...)` tokens
//! and the argument of `@import` are rewritten; every other token is copied
//! verbatim. The lexer keeps a one-slot push-back buffer, enough for the
//! single token of lookahead `@import` needs.

use std::io::Write;

use super::{RewriteAction, RewriteError, UrlKind, UrlRef, UrlRewriter};

/// Rewrites the stylesheet in `input`, writing the result to `out`.
pub fn rewrite(
    input: &[u8],
    out: &mut dyn Write,
    rewriter: &mut UrlRewriter<'_>,
) -> Result<(), RewriteError> {
    let mut lexer = Lexer::new(input);
    while let Some(tok) = lexer.next() {
        match tok.kind {
            TokenKind::Url => handle_url_token(input, out, rewriter, &tok)?,
            TokenKind::AtKeyword
                if input[tok.start..tok.end].eq_ignore_ascii_case(b"@import") =>
            {
                process_import(input, out, rewriter, &mut lexer, &tok)?;
            }
            _ => out.write_all(&input[tok.start..tok.end])?,
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Lexer

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Whitespace,
    /// A quoted string token.
    String,
    /// `@` followed by an identifier.
    AtKeyword,
    /// The whole `url( ... )` construct, quoted or not.
    Url,
    /// Comments, identifiers, numbers, punctuation.
    Other,
}

#[derive(Debug, Clone, Copy)]
struct Token {
    kind: TokenKind,
    start: usize,
    end: usize,
}

struct Lexer<'a> {
    input: &'a [u8],
    pos: usize,
    pushed_back: Option<Token>,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a [u8]) -> Self {
        Lexer {
            input,
            pos: 0,
            pushed_back: None,
        }
    }

    /// Returns a token to the lexer to be yielded again by the next call.
    fn push_back(&mut self, tok: Token) {
        assert!(self.pushed_back.is_none(), "a token is already stored");
        self.pushed_back = Some(tok);
    }

    fn next(&mut self) -> Option<Token> {
        if let Some(tok) = self.pushed_back.take() {
            return Some(tok);
        }
        if self.pos >= self.input.len() {
            return None;
        }
        let start = self.pos;
        let input = self.input;
        let b = input[self.pos];

        if is_css_whitespace(b) {
            while self.pos < input.len() && is_css_whitespace(input[self.pos]) {
                self.pos += 1;
            }
            return Some(Token {
                kind: TokenKind::Whitespace,
                start,
                end: self.pos,
            });
        }
        if b == b'"' || b == b'\'' {
            self.consume_string(b);
            return Some(Token {
                kind: TokenKind::String,
                start,
                end: self.pos,
            });
        }
        if b == b'@' && self.pos + 1 < input.len() && is_ident_byte(input[self.pos + 1]) {
            self.pos += 1;
            while self.pos < input.len() && is_ident_byte(input[self.pos]) {
                self.pos += 1;
            }
            return Some(Token {
                kind: TokenKind::AtKeyword,
                start,
                end: self.pos,
            });
        }
        if b == b'/' && input.get(self.pos + 1) == Some(&b'*') {
            self.pos = match find(input, self.pos + 2, b"*/") {
                Some(i) => i + 2,
                None => input.len(),
            };
            return Some(Token {
                kind: TokenKind::Other,
                start,
                end: self.pos,
            });
        }
        if self.at_url_start() {
            self.consume_url();
            return Some(Token {
                kind: TokenKind::Url,
                start,
                end: self.pos,
            });
        }

        // Opaque run: stop before anything that could start a token above.
        self.pos += 1;
        while self.pos < input.len() {
            let b = input[self.pos];
            if is_css_whitespace(b) || b == b'"' || b == b'\'' || b == b'@' {
                break;
            }
            if b == b'/' && input.get(self.pos + 1) == Some(&b'*') {
                break;
            }
            // `url(` only starts a token at an identifier boundary.
            if (b == b'u' || b == b'U')
                && !is_ident_byte(input[self.pos - 1])
                && self.at_url_start()
            {
                break;
            }
            self.pos += 1;
        }
        Some(Token {
            kind: TokenKind::Other,
            start,
            end: self.pos,
        })
    }

    fn at_url_start(&self) -> bool {
        let rest = &self.input[self.pos..];
        rest.len() >= 4 && rest[..4].eq_ignore_ascii_case(b"url(")
    }

    /// Consumes a string token. The closing quote may be missing at end of
    /// input; a bare newline ends the token early (the rewriter rejects it
    /// if the string is ever unescaped).
    fn consume_string(&mut self, quote: u8) {
        self.pos += 1;
        while self.pos < self.input.len() {
            match self.input[self.pos] {
                b'\\' => {
                    self.pos += 2;
                    if self.pos > self.input.len() {
                        self.pos = self.input.len();
                    }
                }
                b'\n' => return,
                b if b == quote => {
                    self.pos += 1;
                    return;
                }
                _ => self.pos += 1,
            }
        }
    }

    /// Consumes from `url(` through the closing parenthesis.
    fn consume_url(&mut self) {
        let input = self.input;
        self.pos += 4;
        while self.pos < input.len() && is_css_whitespace(input[self.pos]) {
            self.pos += 1;
        }
        if self.pos < input.len() && (input[self.pos] == b'"' || input[self.pos] == b'\'') {
            self.consume_string(input[self.pos]);
        }
        while self.pos < input.len() && input[self.pos] != b')' {
            self.pos += 1;
        }
        if self.pos < input.len() {
            self.pos += 1;
        }
    }
}

fn is_css_whitespace(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r' | b'\x0c')
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b >= 0x80
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
// Rewriting

/// Handles `@import`, whose argument is a string or a `url(...)` token,
/// optionally preceded by whitespace. Anything unexpected is pushed back
/// and handled by the main loop.
fn process_import(
    input: &[u8],
    out: &mut dyn Write,
    rewriter: &mut UrlRewriter<'_>,
    lexer: &mut Lexer<'_>,
    at: &Token,
) -> Result<(), RewriteError> {
    out.write_all(&input[at.start..at.end])?;

    let mut arg = match lexer.next() {
        Some(tok) => tok,
        None => return Ok(()),
    };
    if arg.kind == TokenKind::Whitespace {
        out.write_all(&input[arg.start..arg.end])?;
        arg = match lexer.next() {
            Some(tok) => tok,
            None => return Ok(()),
        };
    }
    match arg.kind {
        TokenKind::String => {
            let text = &input[arg.start..arg.end];
            let (value, consumed) = css_unescape_string(text)?;
            if consumed != text.len() {
                return Err(RewriteError::MalformedCssString(
                    "string does not span the whole token".to_string(),
                ));
            }
            let action = rewriter(UrlRef {
                value: &value,
                base: "",
                new_base: "",
                kind: UrlKind::Css,
            })?;
            match action {
                RewriteAction::Keep => out.write_all(text)?,
                RewriteAction::Replace(new_value) => {
                    out.write_all(&css_escape_string(&new_value))?;
                }
            }
            Ok(())
        }
        TokenKind::Url => handle_url_token(input, out, rewriter, &arg),
        _ => {
            lexer.push_back(arg);
            Ok(())
        }
    }
}

/// Rewrites a `url(...)` token: leading `url(` and whitespace, the value
/// (quoted or bare), trailing whitespace and `)`.
fn handle_url_token(
    input: &[u8],
    out: &mut dyn Write,
    rewriter: &mut UrlRewriter<'_>,
    tok: &Token,
) -> Result<(), RewriteError> {
    let text = &input[tok.start..tok.end];
    if text.len() < 5 {
        return Err(RewriteError::MalformedCssString(format!(
            "unexpected token length for {:?}",
            String::from_utf8_lossy(text)
        )));
    }
    if !text[..4].eq_ignore_ascii_case(b"url(") {
        return Err(RewriteError::MalformedCssString(format!(
            "unexpected token start for {:?}",
            String::from_utf8_lossy(text)
        )));
    }
    if text[text.len() - 1] != b')' {
        return Err(RewriteError::MalformedCssString(format!(
            "unexpected token end for {:?}",
            String::from_utf8_lossy(text)
        )));
    }

    let mut value_start = 4;
    while value_start < text.len() && is_escape_whitespace(text[value_start]) {
        value_start += 1;
    }
    if value_start >= text.len() {
        return Err(RewriteError::MalformedCssString(format!(
            "unexpected token end for {:?}",
            String::from_utf8_lossy(text)
        )));
    }

    let value_end;
    let value;
    if text[value_start] == b'"' || text[value_start] == b'\'' {
        let (unescaped, consumed) = css_unescape_string(&text[value_start..])?;
        value_end = value_start + consumed;
        value = unescaped;
    } else {
        let mut end = text.len() - 1;
        while end > value_start && is_escape_whitespace(text[end - 1]) {
            end -= 1;
        }
        value_end = end;
        value = String::from_utf8_lossy(&text[value_start..value_end]).into_owned();
    }

    let action = rewriter(UrlRef {
        value: &value,
        base: "",
        new_base: "",
        kind: UrlKind::Css,
    })?;
    match action {
        RewriteAction::Keep => out.write_all(text)?,
        RewriteAction::Replace(new_value) => {
            out.write_all(&text[..value_start])?;
            out.write_all(&css_escape_string(&new_value))?;
            out.write_all(&text[value_end..])?;
        }
    }
    Ok(())
}

/// The whitespace set recognized inside `url(...)` and after hex escapes.
fn is_escape_whitespace(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n')
}

/// Serializes a string token: always double-quoted, with `"`, `\n`, and
/// `\` written as hex escapes with a trailing space.
fn css_escape_string(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + 2);
    out.push(b'"');
    for c in value.chars() {
        match c {
            '\n' | '"' | '\\' => {
                out.push(b'\\');
                out.extend_from_slice(format!("{:x} ", c as u32).as_bytes());
            }
            _ => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out.push(b'"');
    out
}

/// Unescapes a quoted string token, returning the value and the number of
/// bytes consumed (through the closing quote).
fn css_unescape_string(data: &[u8]) -> Result<(String, usize), RewriteError> {
    let mut pos = 0;
    let quote = next_char(data, &mut pos)?;
    if quote != '"' && quote != '\'' {
        return Err(RewriteError::MalformedCssString(format!(
            "unexpected character instead of a quote: {quote:?}"
        )));
    }
    let mut out = String::new();
    loop {
        if pos >= data.len() {
            return Err(RewriteError::MalformedCssString(
                "unclosed string".to_string(),
            ));
        }
        let c = next_char(data, &mut pos)?;
        match c {
            c if c == quote => return Ok((out, pos)),
            '\n' => {
                return Err(RewriteError::MalformedCssString(
                    "newline inside a string".to_string(),
                ))
            }
            '\\' => consume_escape(data, &mut pos, &mut out)?,
            c => out.push(c),
        }
    }
}

/// Consumes one escape sequence after a backslash: a hex escape with an
/// optional single trailing whitespace, an escaped newline (line
/// continuation), or a literal character.
fn consume_escape(data: &[u8], pos: &mut usize, out: &mut String) -> Result<(), RewriteError> {
    if *pos >= data.len() {
        return Err(RewriteError::MalformedCssString(
            "end of data in an escape".to_string(),
        ));
    }
    let c = next_char(data, pos)?;
    if c.is_ascii_hexdigit() {
        let mut digits = String::with_capacity(6);
        digits.push(c);
        while digits.len() < 6 && *pos < data.len() && data[*pos].is_ascii_hexdigit() {
            digits.push(data[*pos] as char);
            *pos += 1;
        }
        if *pos < data.len() && is_escape_whitespace(data[*pos]) {
            *pos += 1;
        }
        let code = u32::from_str_radix(&digits, 16).map_err(|_| {
            RewriteError::MalformedCssString(format!("invalid hex escape {digits:?}"))
        })?;
        out.push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
        return Ok(());
    }
    if c == '\n' {
        // Escaped newline: line continuation, nothing is emitted.
        return Ok(());
    }
    out.push(c);
    Ok(())
}

/// Decodes the UTF-8 character at `*pos`, advancing past it.
fn next_char(data: &[u8], pos: &mut usize) -> Result<char, RewriteError> {
    let end = data.len().min(*pos + 4);
    let slice = &data[*pos..end];
    let valid = match std::str::from_utf8(slice) {
        Ok(s) => s,
        Err(e) if e.valid_up_to() > 0 => {
            std::str::from_utf8(&slice[..e.valid_up_to()]).map_err(|_| invalid_utf8())?
        }
        Err(_) => return Err(invalid_utf8()),
    };
    let c = valid.chars().next().ok_or_else(invalid_utf8)?;
    *pos += c.len_utf8();
    Ok(c)
}

fn invalid_utf8() -> RewriteError {
    RewriteError::MalformedCssString("invalid utf-8 data".to_string())
}
