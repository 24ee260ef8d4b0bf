//! Array codec plus the quoting helpers shared with composites and ranges.

use bytes::{BufMut, BytesMut};

use super::codec::{mismatch, utf8, Codec, Reader};
use super::{Array, ArrayDimension, Format, Oid, TypeMap, Value, ValueKind};
use crate::pg::error::{PgError, PgResult};

// ============================================================================
// Quoting helpers
// ============================================================================

/// Append `text` to `out`, double-quoted when it contains any of `specials`,
/// whitespace, or is empty.
pub(super) fn put_quoted(out: &mut BytesMut, text: &[u8], specials: &[u8]) {
    let needs_quotes = text.is_empty()
        || text
            .iter()
            .any(|b| specials.contains(b) || b.is_ascii_whitespace() || *b == b'"' || *b == b'\\');
    if !needs_quotes {
        out.put_slice(text);
        return;
    }
    out.put_u8(b'"');
    for &b in text {
        if b == b'"' || b == b'\\' {
            out.put_u8(b'\\');
        }
        out.put_u8(b);
    }
    out.put_u8(b'"');
}

/// Byte scanner over a structured text literal.
pub(super) struct Scanner<'a> {
    src: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> Scanner<'a> {
    pub(super) fn new(src: &'a [u8], what: &'static str) -> Self {
        Self { src, pos: 0, what }
    }

    pub(super) fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    pub(super) fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    pub(super) fn skip_ws(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    pub(super) fn expect(&mut self, byte: u8) -> PgResult<()> {
        match self.bump() {
            Some(b) if b == byte => Ok(()),
            _ => Err(self.error(&format!("expected '{}'", byte as char))),
        }
    }

    pub(super) fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    pub(super) fn error(&self, msg: &str) -> PgError {
        PgError::Decode(format!(
            "Invalid {} literal {:?}: {} at offset {}",
            self.what,
            String::from_utf8_lossy(self.src),
            msg,
            self.pos
        ))
    }

    /// Read one element. Returns the unescaped bytes and whether it was quoted.
    ///
    /// Inside quotes a doubled `""` is a literal quote (composite style) and
    /// backslash escapes the next byte.
    pub(super) fn token(&mut self, terminators: &[u8]) -> PgResult<(Vec<u8>, bool)> {
        let mut out = Vec::new();
        if self.peek() == Some(b'"') {
            self.pos += 1;
            loop {
                match self.bump() {
                    None => return Err(self.error("unterminated quoted string")),
                    Some(b'\\') => match self.bump() {
                        Some(b) => out.push(b),
                        None => return Err(self.error("dangling escape")),
                    },
                    Some(b'"') if self.peek() == Some(b'"') => {
                        self.pos += 1;
                        out.push(b'"');
                    }
                    Some(b'"') => break,
                    Some(b) => out.push(b),
                }
            }
            return Ok((out, true));
        }

        while let Some(b) = self.peek() {
            if terminators.contains(&b) {
                break;
            }
            self.pos += 1;
            if b == b'\\' {
                match self.bump() {
                    Some(b) => out.push(b),
                    None => return Err(self.error("dangling escape")),
                }
            } else {
                out.push(b);
            }
        }
        while out.last().is_some_and(|b| b.is_ascii_whitespace()) {
            out.pop();
        }
        Ok((out, false))
    }
}

// ============================================================================
// Array codec
// ============================================================================

/// One-or-more dimensional arrays of a registered element type.
#[derive(Debug, Clone, Copy)]
pub struct ArrayCodec {
    pub element: Oid,
    /// `;` for box arrays, `,` otherwise.
    pub delimiter: u8,
    pub element_binary: bool,
}

impl ArrayCodec {
    fn write_text(
        &self,
        map: &TypeMap,
        array: &Array,
        dim: usize,
        offset: &mut usize,
        buf: &mut BytesMut,
    ) -> PgResult<()> {
        buf.put_u8(b'{');
        let len = array.dims[dim].len.max(0) as usize;
        let specials = [b'{', b'}', self.delimiter];
        for i in 0..len {
            if i > 0 {
                buf.put_u8(self.delimiter);
            }
            if dim + 1 < array.dims.len() {
                self.write_text(map, array, dim + 1, offset, buf)?;
                continue;
            }
            let element = &array.elements[*offset];
            *offset += 1;
            let mut text = BytesMut::new();
            if map.encode_into(self.element, Format::Text, element, &mut text)? {
                if text.eq_ignore_ascii_case(b"NULL") {
                    buf.put_slice(b"\"NULL\"");
                } else {
                    put_quoted(buf, &text, &specials);
                }
            } else {
                buf.put_slice(b"NULL");
            }
        }
        buf.put_u8(b'}');
        Ok(())
    }

    fn parse_text(&self, map: &TypeMap, src: &[u8]) -> PgResult<Array> {
        let mut scanner = Scanner::new(src, "array");
        scanner.skip_ws();

        // Optional explicit bounds: [1:3][0:1]={...}
        let mut lower_bounds = Vec::new();
        if scanner.peek() == Some(b'[') {
            while scanner.peek() == Some(b'[') {
                scanner.bump();
                let (bounds, _) = scanner.token(b"]")?;
                scanner.expect(b']')?;
                let bounds = utf8(&bounds, "array bounds")?;
                let lower = bounds
                    .split_once(':')
                    .and_then(|(lo, _)| lo.trim().parse::<i32>().ok())
                    .ok_or_else(|| scanner.error("invalid dimension bounds"))?;
                lower_bounds.push(lower);
            }
            scanner.expect(b'=')?;
            scanner.skip_ws();
        }

        let mut lens: Vec<i32> = Vec::new();
        let mut raw: Vec<Option<Vec<u8>>> = Vec::new();
        self.parse_level(&mut scanner, 0, &mut lens, &mut raw)?;
        scanner.skip_ws();
        if !scanner.at_end() {
            return Err(scanner.error("trailing characters"));
        }

        if lens == [0] {
            lens.clear();
        }
        if !lower_bounds.is_empty() && lower_bounds.len() != lens.len() {
            return Err(scanner.error("bounds do not match dimensions"));
        }
        let dims = lens
            .iter()
            .enumerate()
            .map(|(i, len)| ArrayDimension {
                len: *len,
                lower_bound: lower_bounds.get(i).copied().unwrap_or(1),
            })
            .collect();
        let elements = raw
            .iter()
            .map(|e| map.decode(self.element, Format::Text, e.as_deref()))
            .collect::<PgResult<Vec<_>>>()?;
        Ok(Array { dims, elements })
    }

    fn parse_level(
        &self,
        scanner: &mut Scanner<'_>,
        depth: usize,
        lens: &mut Vec<i32>,
        out: &mut Vec<Option<Vec<u8>>>,
    ) -> PgResult<()> {
        scanner.expect(b'{')?;
        scanner.skip_ws();
        let mut count = 0;
        if scanner.peek() == Some(b'}') {
            scanner.bump();
        } else {
            loop {
                scanner.skip_ws();
                if scanner.peek() == Some(b'{') {
                    self.parse_level(scanner, depth + 1, lens, out)?;
                } else {
                    let (token, quoted) = scanner.token(&[self.delimiter, b'}'])?;
                    if !quoted && token.eq_ignore_ascii_case(b"NULL") {
                        out.push(None);
                    } else {
                        out.push(Some(token));
                    }
                }
                count += 1;
                scanner.skip_ws();
                match scanner.bump() {
                    Some(b) if b == self.delimiter => continue,
                    Some(b'}') => break,
                    _ => return Err(scanner.error("expected delimiter or '}'")),
                }
            }
        }

        match lens.get(depth) {
            None => lens.push(count),
            Some(len) if *len == count => {}
            Some(_) => return Err(scanner.error("sub-arrays must have matching dimensions")),
        }
        Ok(())
    }
}

impl Codec for ArrayCodec {
    fn format_supported(&self, format: Format) -> bool {
        format == Format::Text || self.element_binary
    }

    fn preferred_format(&self) -> Format {
        if self.element_binary {
            Format::Binary
        } else {
            Format::Text
        }
    }

    fn accepts(&self, kind: ValueKind) -> bool {
        kind == ValueKind::Array
    }

    fn encode(&self, map: &TypeMap, format: Format, value: &Value, buf: &mut BytesMut) -> PgResult<()> {
        let Value::Array(array) = value else {
            return Err(mismatch("array", value));
        };
        array.validate()?;
        match format {
            Format::Binary => {
                buf.put_i32(array.dims.len() as i32);
                buf.put_i32(array.elements.iter().any(Value::is_null) as i32);
                buf.put_u32(self.element.as_u32());
                for dim in &array.dims {
                    buf.put_i32(dim.len);
                    buf.put_i32(dim.lower_bound);
                }
                for element in &array.elements {
                    map.encode_field(self.element, Format::Binary, element, buf)?;
                }
            }
            Format::Text => {
                if array.dims.is_empty() {
                    buf.put_slice(b"{}");
                    return Ok(());
                }
                if array.dims.iter().any(|d| d.lower_bound != 1) {
                    for dim in &array.dims {
                        let upper = dim.lower_bound + dim.len - 1;
                        buf.put_slice(format!("[{}:{}]", dim.lower_bound, upper).as_bytes());
                    }
                    buf.put_u8(b'=');
                }
                let mut offset = 0;
                self.write_text(map, array, 0, &mut offset, buf)?;
            }
        }
        Ok(())
    }

    fn decode(&self, map: &TypeMap, format: Format, src: &[u8]) -> PgResult<Value> {
        let array = match format {
            Format::Binary => {
                let mut r = Reader::new(src, "array");
                let ndim = r.i32()?;
                let _has_null = r.i32()?;
                let element = Oid(r.u32()?);
                if ndim < 0 || ndim > 6 {
                    return Err(PgError::Decode(format!("Invalid array dimension count {}", ndim)));
                }
                let dims = (0..ndim)
                    .map(|_| {
                        Ok(ArrayDimension {
                            len: r.i32()?,
                            lower_bound: r.i32()?,
                        })
                    })
                    .collect::<PgResult<Vec<_>>>()?;
                let count = if dims.is_empty() {
                    Some(0)
                } else {
                    dims.iter()
                        .try_fold(1usize, |acc, d| acc.checked_mul(d.len.max(0) as usize))
                };
                // Every element carries at least its 4-byte length
                let count = count
                    .filter(|count| *count <= src.len() / 4)
                    .ok_or_else(|| {
                        PgError::Decode(format!(
                            "array dimensions {:?} exceed the {} bytes received",
                            dims.iter().map(|d| d.len).collect::<Vec<_>>(),
                            src.len()
                        ))
                    })?;
                let mut elements = Vec::with_capacity(count);
                for _ in 0..count {
                    elements.push(map.decode(element, Format::Binary, r.field()?)?);
                }
                r.finish()?;
                Array { dims, elements }
            }
            Format::Text => self.parse_text(map, src)?,
        };
        Ok(Value::Array(array))
    }
}
