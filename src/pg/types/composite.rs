//! Composite (row) types.

use bytes::{BufMut, BytesMut};

use super::array::{put_quoted, Scanner};
use super::codec::{mismatch, Codec, Reader};
use super::{Format, Oid, TypeMap, Value, ValueKind};
use crate::pg::error::{PgError, PgResult};

/// Codec for a registered composite type, or the anonymous `record`.
#[derive(Debug, Clone)]
pub struct CompositeCodec {
    /// Field type ids in declaration order; empty for `record`.
    pub fields: Vec<Oid>,
    pub anonymous: bool,
    pub fields_binary: bool,
}

impl CompositeCodec {
    /// The anonymous `record` type: decode-only, field types come from the wire.
    pub fn record() -> Self {
        Self {
            fields: Vec::new(),
            anonymous: true,
            fields_binary: true,
        }
    }

    fn field_oid(&self, index: usize) -> Oid {
        self.fields.get(index).copied().unwrap_or(Oid::TEXT)
    }
}

impl Codec for CompositeCodec {
    fn format_supported(&self, format: Format) -> bool {
        format == Format::Text || self.fields_binary
    }

    fn preferred_format(&self) -> Format {
        if self.fields_binary {
            Format::Binary
        } else {
            Format::Text
        }
    }

    fn accepts(&self, kind: ValueKind) -> bool {
        // The server cannot read anonymous records
        !self.anonymous && kind == ValueKind::Composite
    }

    fn encode(&self, map: &TypeMap, format: Format, value: &Value, buf: &mut BytesMut) -> PgResult<()> {
        let Value::Composite(values) = value else {
            return Err(mismatch("composite", value));
        };
        if values.len() != self.fields.len() {
            return Err(PgError::Encode(format!(
                "composite has {} fields but {} values were given",
                self.fields.len(),
                values.len()
            )));
        }
        match format {
            Format::Binary => {
                buf.put_i32(values.len() as i32);
                for (oid, v) in self.fields.iter().zip(values) {
                    buf.put_u32(oid.as_u32());
                    map.encode_field(*oid, Format::Binary, v, buf)?;
                }
            }
            Format::Text => {
                buf.put_u8(b'(');
                for (i, (oid, v)) in self.fields.iter().zip(values).enumerate() {
                    if i > 0 {
                        buf.put_u8(b',');
                    }
                    let mut text = BytesMut::new();
                    // An empty unquoted field is NULL
                    if map.encode_into(*oid, Format::Text, v, &mut text)? {
                        put_quoted(buf, &text, b"(),");
                    }
                }
                buf.put_u8(b')');
            }
        }
        Ok(())
    }

    fn decode(&self, map: &TypeMap, format: Format, src: &[u8]) -> PgResult<Value> {
        let mut values = Vec::new();
        match format {
            Format::Binary => {
                let mut r = Reader::new(src, "composite");
                let count = r.i32()?;
                if !self.anonymous && count as usize != self.fields.len() {
                    return Err(PgError::Decode(format!(
                        "composite has {} fields but {} were received",
                        self.fields.len(),
                        count
                    )));
                }
                for _ in 0..count.max(0) {
                    let oid = Oid(r.u32()?);
                    values.push(map.decode(oid, Format::Binary, r.field()?)?);
                }
                r.finish()?;
            }
            Format::Text => {
                let mut scanner = Scanner::new(src, "composite");
                scanner.expect(b'(')?;
                if scanner.peek() == Some(b')') && self.fields.len() != 1 {
                    scanner.bump();
                } else {
                    loop {
                        let index = values.len();
                        let value = match scanner.peek() {
                            Some(b',') | Some(b')') => Value::Null,
                            _ => {
                                let (token, _) = scanner.token(b",)")?;
                                map.decode(self.field_oid(index), Format::Text, Some(token.as_slice()))?
                            }
                        };
                        values.push(value);
                        match scanner.bump() {
                            Some(b',') => continue,
                            Some(b')') => break,
                            _ => return Err(scanner.error("expected ',' or ')'")),
                        }
                    }
                }
                if !scanner.at_end() {
                    return Err(scanner.error("trailing characters"));
                }
                if !self.anonymous && values.len() != self.fields.len() {
                    return Err(scanner.error("wrong number of fields"));
                }
            }
        }
        Ok(Value::Composite(values))
    }
}
