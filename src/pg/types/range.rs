//! Range types over a registered subtype.

use bytes::{BufMut, BytesMut};

use super::array::{put_quoted, Scanner};
use super::codec::{mismatch, utf8, Codec, Reader};
use super::{Format, Oid, Range, RangeBound, TypeMap, Value, ValueKind};
use crate::pg::error::PgResult;

const RANGE_EMPTY: u8 = 0x01;
const RANGE_LB_INC: u8 = 0x02;
const RANGE_UB_INC: u8 = 0x04;
const RANGE_LB_INF: u8 = 0x08;
const RANGE_UB_INF: u8 = 0x10;

#[derive(Debug, Clone, Copy)]
pub struct RangeCodec {
    pub subtype: Oid,
    pub subtype_binary: bool,
}

impl RangeCodec {
    fn flags(range: &Range) -> u8 {
        if range.empty {
            return RANGE_EMPTY;
        }
        let mut flags = 0;
        match range.lower {
            RangeBound::Inclusive(_) => flags |= RANGE_LB_INC,
            RangeBound::Exclusive(_) => {}
            RangeBound::Unbounded => flags |= RANGE_LB_INF,
        }
        match range.upper {
            RangeBound::Inclusive(_) => flags |= RANGE_UB_INC,
            RangeBound::Exclusive(_) => {}
            RangeBound::Unbounded => flags |= RANGE_UB_INF,
        }
        flags
    }

    fn bound_value(bound: &RangeBound) -> Option<&Value> {
        match bound {
            RangeBound::Inclusive(v) | RangeBound::Exclusive(v) => Some(v),
            RangeBound::Unbounded => None,
        }
    }

    fn bound(value: Option<Value>, inclusive: bool) -> RangeBound {
        match value {
            None => RangeBound::Unbounded,
            Some(v) if inclusive => RangeBound::Inclusive(v),
            Some(v) => RangeBound::Exclusive(v),
        }
    }

    fn write_text_bound(&self, map: &TypeMap, bound: &RangeBound, buf: &mut BytesMut) -> PgResult<()> {
        if let Some(v) = Self::bound_value(bound) {
            let mut text = BytesMut::new();
            if map.encode_into(self.subtype, Format::Text, v, &mut text)? {
                put_quoted(buf, &text, b"()[],");
            }
        }
        Ok(())
    }
}

impl Codec for RangeCodec {
    fn format_supported(&self, format: Format) -> bool {
        format == Format::Text || self.subtype_binary
    }

    fn preferred_format(&self) -> Format {
        if self.subtype_binary {
            Format::Binary
        } else {
            Format::Text
        }
    }

    fn accepts(&self, kind: ValueKind) -> bool {
        kind == ValueKind::Range
    }

    fn encode(&self, map: &TypeMap, format: Format, value: &Value, buf: &mut BytesMut) -> PgResult<()> {
        let Value::Range(range) = value else {
            return Err(mismatch("range", value));
        };
        match format {
            Format::Binary => {
                buf.put_u8(Self::flags(range));
                if !range.empty {
                    for bound in [&range.lower, &range.upper] {
                        if let Some(v) = Self::bound_value(bound) {
                            map.encode_field(self.subtype, Format::Binary, v, buf)?;
                        }
                    }
                }
            }
            Format::Text => {
                if range.empty {
                    buf.put_slice(b"empty");
                    return Ok(());
                }
                buf.put_u8(if matches!(range.lower, RangeBound::Inclusive(_)) { b'[' } else { b'(' });
                self.write_text_bound(map, &range.lower, buf)?;
                buf.put_u8(b',');
                self.write_text_bound(map, &range.upper, buf)?;
                buf.put_u8(if matches!(range.upper, RangeBound::Inclusive(_)) { b']' } else { b')' });
            }
        }
        Ok(())
    }

    fn decode(&self, map: &TypeMap, format: Format, src: &[u8]) -> PgResult<Value> {
        let range = match format {
            Format::Binary => {
                let mut r = Reader::new(src, "range");
                let flags = r.u8()?;
                if flags & RANGE_EMPTY != 0 {
                    r.finish()?;
                    Range::empty()
                } else {
                    let lower = if flags & RANGE_LB_INF == 0 {
                        Some(map.decode(self.subtype, Format::Binary, r.field()?)?)
                    } else {
                        None
                    };
                    let upper = if flags & RANGE_UB_INF == 0 {
                        Some(map.decode(self.subtype, Format::Binary, r.field()?)?)
                    } else {
                        None
                    };
                    r.finish()?;
                    Range::new(
                        Self::bound(lower, flags & RANGE_LB_INC != 0),
                        Self::bound(upper, flags & RANGE_UB_INC != 0),
                    )
                }
            }
            Format::Text => {
                let src = utf8(src, "range")?.trim().as_bytes();
                if src.eq_ignore_ascii_case(b"empty") {
                    return Ok(Value::Range(Box::new(Range::empty())));
                }
                let mut scanner = Scanner::new(src, "range");
                let lower_inc = match scanner.bump() {
                    Some(b'[') => true,
                    Some(b'(') => false,
                    _ => return Err(scanner.error("expected '[' or '('")),
                };
                let lower = match scanner.peek() {
                    Some(b',') => None,
                    _ => {
                        let (token, _) = scanner.token(b",")?;
                        Some(map.decode(self.subtype, Format::Text, Some(token.as_slice()))?)
                    }
                };
                scanner.expect(b',')?;
                let upper = match scanner.peek() {
                    Some(b']') | Some(b')') => None,
                    _ => {
                        let (token, _) = scanner.token(b"])")?;
                        Some(map.decode(self.subtype, Format::Text, Some(token.as_slice()))?)
                    }
                };
                let upper_inc = match scanner.bump() {
                    Some(b']') => true,
                    Some(b')') => false,
                    _ => return Err(scanner.error("expected ']' or ')'")),
                };
                if !scanner.at_end() {
                    return Err(scanner.error("trailing characters"));
                }
                Range::new(Self::bound(lower, lower_inc), Self::bound(upper, upper_inc))
            }
        };
        Ok(Value::Range(Box::new(range)))
    }
}
