//! SQL text handling for the simple protocol.
//!
//! SQL is opaque apart from placeholders: the lexer only separates code from
//! string literals, quoted identifiers, dollar-quoted bodies and comments so
//! that `$1` inside any of those is left alone.

use std::fmt::Write;
use std::ops::Range;

use super::error::{PgError, PgResult};
use super::types::codec::format_float;
use super::types::{Format, TypeMap, Value};

// ============================================================================
// Lexer
// ============================================================================

/// A slice of SQL text; `code` is false for literals, identifiers and
/// comments.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    code: bool,
    range: Range<usize>,
}

#[inline]
fn is_ident(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80
}

fn segments(sql: &str) -> Vec<Segment> {
    let b = sql.as_bytes();
    let mut out = Vec::new();
    let mut start = 0;
    let mut i = 0;

    let push = |out: &mut Vec<Segment>, code: bool, range: Range<usize>| {
        if !range.is_empty() {
            out.push(Segment { code, range });
        }
    };

    while i < b.len() {
        let end = match b[i] {
            b'\'' => {
                // E'...' strings honor backslash escapes
                let escaped = i > 0
                    && matches!(b[i - 1], b'E' | b'e')
                    && (i < 2 || !is_ident(b[i - 2]));
                Some(skip_quoted(b, i, b'\'', escaped))
            }
            b'"' => Some(skip_quoted(b, i, b'"', false)),
            b'-' if b.get(i + 1) == Some(&b'-') => Some(
                b[i..]
                    .iter()
                    .position(|&c| c == b'\n')
                    .map_or(b.len(), |p| i + p + 1),
            ),
            b'/' if b.get(i + 1) == Some(&b'*') => Some(skip_block_comment(b, i)),
            b'$' => skip_dollar_quoted(b, i),
            _ => None,
        };
        match end {
            Some(end) => {
                push(&mut out, true, start..i);
                push(&mut out, false, i..end);
                i = end;
                start = end;
            }
            None => i += 1,
        }
    }
    push(&mut out, true, start..b.len());
    out
}

fn skip_quoted(b: &[u8], open: usize, quote: u8, backslash: bool) -> usize {
    let mut j = open + 1;
    while j < b.len() {
        if backslash && b[j] == b'\\' {
            j += 2;
            continue;
        }
        if b[j] == quote {
            if b.get(j + 1) == Some(&quote) {
                j += 2;
                continue;
            }
            return j + 1;
        }
        j += 1;
    }
    b.len()
}

/// Block comments nest.
fn skip_block_comment(b: &[u8], open: usize) -> usize {
    let mut depth = 0usize;
    let mut j = open;
    while j + 1 < b.len() {
        match (b[j], b[j + 1]) {
            (b'/', b'*') => {
                depth += 1;
                j += 2;
            }
            (b'*', b'/') => {
                depth -= 1;
                j += 2;
                if depth == 0 {
                    return j;
                }
            }
            _ => j += 1,
        }
    }
    b.len()
}

/// `$tag$ ... $tag$`. `None` when `$` does not open a dollar quote
/// (placeholders, identifiers containing `$`).
fn skip_dollar_quoted(b: &[u8], open: usize) -> Option<usize> {
    if open > 0 && is_ident(b[open - 1]) {
        return None;
    }
    let mut j = open + 1;
    if j < b.len() && b[j].is_ascii_digit() {
        return None;
    }
    while j < b.len() && is_ident(b[j]) && b[j] != b'$' {
        j += 1;
    }
    if j >= b.len() || b[j] != b'$' {
        return None;
    }
    let tag = &b[open..=j];
    let body = j + 1;
    Some(
        b[body..]
            .windows(tag.len())
            .position(|w| w == tag)
            .map_or(b.len(), |p| body + p + tag.len()),
    )
}

/// Positional placeholders in code segments: (byte range, number).
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let b = sql.as_bytes();
    let mut found = Vec::new();
    for seg in segments(sql).into_iter().filter(|s| s.code) {
        let mut i = seg.range.start;
        while i < seg.range.end {
            if b[i] == b'$' && (i == 0 || !is_ident(b[i - 1])) {
                let digits = b[i + 1..seg.range.end]
                    .iter()
                    .take_while(|c| c.is_ascii_digit())
                    .count();
                if digits > 0 {
                    let end = i + 1 + digits;
                    // Absurd numbers are left for the server to reject
                    if let Ok(n) = sql[i + 1..end].parse::<usize>() {
                        found.push((i..end, n));
                    }
                    i = end;
                    continue;
                }
            }
            i += 1;
        }
    }
    found
}

/// Highest positional placeholder number in `sql`.
pub fn placeholder_count(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

// ============================================================================
// Rewriting
// ============================================================================

/// Replace every `$n` with the literal form of `args[n-1]`.
///
/// Every argument must be referenced; structured values (arrays, composites,
/// ranges) cannot be inlined and are rejected.
pub fn substitute(map: &TypeMap, sql: &str, args: &[Value]) -> PgResult<String> {
    let mut literals: Vec<Option<String>> = vec![None; args.len()];
    let mut out = String::with_capacity(sql.len() + args.len() * 8);
    let mut last = 0;

    for (range, n) in placeholders(sql) {
        if n == 0 || n > args.len() {
            return Err(PgError::Encode(format!(
                "placeholder ${} has no argument ({} given)",
                n,
                args.len()
            )));
        }
        let literal = match &literals[n - 1] {
            Some(literal) => literal.clone(),
            None => {
                let literal = quote_value(map, &args[n - 1])?;
                literals[n - 1] = Some(literal.clone());
                literal
            }
        };
        out.push_str(&sql[last..range.start]);
        out.push_str(&literal);
        last = range.end;
    }
    out.push_str(&sql[last..]);

    if let Some(unused) = literals.iter().position(Option::is_none) {
        return Err(PgError::Encode(format!("unused argument ${}", unused + 1)));
    }
    Ok(out)
}

/// Rewrite `@name` placeholders in code segments into `$n`. Returns the new
/// SQL and the names in placeholder order.
pub fn rewrite_named(sql: &str) -> (String, Vec<String>) {
    let b = sql.as_bytes();
    let mut names: Vec<String> = Vec::new();
    let mut out = String::with_capacity(sql.len());

    for seg in segments(sql) {
        if !seg.code {
            out.push_str(&sql[seg.range]);
            continue;
        }
        let mut i = seg.range.start;
        let mut last = i;
        while i < seg.range.end {
            let starts_name = b[i] == b'@'
                && (i == 0 || !(is_ident(b[i - 1]) || b[i - 1] == b'@'))
                && i + 1 < seg.range.end
                && (b[i + 1].is_ascii_alphabetic() || b[i + 1] == b'_');
            if !starts_name {
                i += 1;
                continue;
            }
            let len = b[i + 1..seg.range.end]
                .iter()
                .take_while(|c| c.is_ascii_alphanumeric() || **c == b'_')
                .count();
            let name = &sql[i + 1..i + 1 + len];
            let n = match names.iter().position(|existing| existing == name) {
                Some(pos) => pos + 1,
                None => {
                    names.push(name.to_string());
                    names.len()
                }
            };
            out.push_str(&sql[last..i]);
            let _ = write!(out, "${}", n);
            i += 1 + len;
            last = i;
        }
        out.push_str(&sql[last..seg.range.end]);
    }
    (out, names)
}

// ============================================================================
// Literals
// ============================================================================

/// Quote `s` as a standard-conforming string literal.
pub fn quote_string(s: &str) -> PgResult<String> {
    if s.contains('\0') {
        return Err(PgError::Encode(
            "text values cannot contain NUL bytes".to_string(),
        ));
    }
    Ok(format!("'{}'", s.replace('\'', "''")))
}

fn quote_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2 + 4);
    out.push_str("'\\x");
    for byte in bytes {
        let _ = write!(out, "{:02x}", byte);
    }
    out.push('\'');
    out
}

/// Negative numbers are parenthesized so `1-$1` cannot become a comment.
fn number(text: String) -> String {
    if text.starts_with('-') {
        format!("({})", text)
    } else {
        text
    }
}

/// SQL literal for one argument.
pub fn quote_value(map: &TypeMap, value: &Value) -> PgResult<String> {
    Ok(match value {
        Value::Null => "null".to_string(),
        Value::Bool(v) => v.to_string(),
        Value::Int2(v) => number(v.to_string()),
        Value::Int4(v) => number(v.to_string()),
        Value::Int8(v) => number(v.to_string()),
        Value::Float4(v) if v.is_finite() => number(v.to_string()),
        Value::Float8(v) if v.is_finite() => number(v.to_string()),
        Value::Float4(v) => format!("'{}'::float4", format_float(*v as f64)),
        Value::Float8(v) => format!("'{}'::float8", format_float(*v)),
        Value::Text(s) => quote_string(s)?,
        Value::Bytea(b) => quote_bytes(b),
        Value::Json(v) => quote_string(&v.to_string())?,
        Value::Raw(raw) if raw.format == Format::Text => {
            let text = std::str::from_utf8(&raw.bytes)
                .map_err(|e| PgError::Encode(format!("raw text value is not UTF-8: {}", e)))?;
            quote_string(text)?
        }
        Value::Custom(c) => match c.0.underlying() {
            Some(inner) => quote_value(map, &inner)?,
            None => match c.0.text_value()? {
                Some(text) => quote_string(&text)?,
                None => "null".to_string(),
            },
        },
        v if v.is_structured() => {
            return Err(PgError::Encode(format!(
                "{:?} values cannot be inlined into simple protocol SQL",
                v.kind()
            )))
        }
        other => {
            let oid = map.default_oid(other).ok_or_else(|| {
                PgError::Encode(format!("no default type for {:?}", other.kind()))
            })?;
            match map.encode(oid, Format::Text, other)? {
                Some(text) => {
                    let text = std::str::from_utf8(&text).map_err(|e| {
                        PgError::Encode(format!("text encoding is not UTF-8: {}", e))
                    })?;
                    quote_string(text)?
                }
                None => "null".to_string(),
            }
        }
    })
}

// ============================================================================
// Identifiers
// ============================================================================

/// A possibly schema-qualified identifier, e.g. `["public", "users"]`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Identifier(pub Vec<String>);

impl Identifier {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// Quoted form safe to splice into SQL text.
    pub fn sanitize(&self) -> String {
        self.0
            .iter()
            .map(|part| format!("\"{}\"", part.replace('\0', "").replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(".")
    }
}

impl From<&str> for Identifier {
    fn from(name: &str) -> Self {
        Self(vec![name.to_string()])
    }
}
