//! The codec abstraction and the scalar codecs.

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, BytesMut};
use uuid::Uuid;

use super::{Format, Oid, Tid, TypeMap, Value, ValueKind};
use crate::pg::error::{PgError, PgResult};

// ============================================================================
// Codec trait
// ============================================================================

/// Encode/decode strategy for one PostgreSQL type in text and binary format.
///
/// Codecs never see NULL: the caller writes the -1 length itself. Structured
/// codecs use `map` to encode and decode their element types.
pub trait Codec: Send + Sync + fmt::Debug {
    /// Whether this codec can handle `format`.
    fn format_supported(&self, format: Format) -> bool {
        let _ = format;
        true
    }

    /// Format to request when the type id is known ahead of time.
    fn preferred_format(&self) -> Format {
        Format::Binary
    }

    /// Whether values of this shape can be encoded directly.
    fn accepts(&self, kind: ValueKind) -> bool;

    fn encode(&self, map: &TypeMap, format: Format, value: &Value, buf: &mut BytesMut)
        -> PgResult<()>;

    fn decode(&self, map: &TypeMap, format: Format, src: &[u8]) -> PgResult<Value>;
}

// ============================================================================
// Helpers shared by codecs
// ============================================================================

/// Interpret wire bytes as UTF-8.
pub(crate) fn utf8<'a>(src: &'a [u8], what: &str) -> PgResult<&'a str> {
    std::str::from_utf8(src).map_err(|e| PgError::Decode(format!("Invalid UTF-8 in {}: {}", what, e)))
}

/// Exact-width binary payload.
pub(crate) fn fixed<const N: usize>(src: &[u8], what: &str) -> PgResult<[u8; N]> {
    src.try_into()
        .map_err(|_| PgError::Decode(format!("Invalid {} length: {}", what, src.len())))
}

pub(crate) fn parse_text<T>(src: &[u8], what: &str) -> PgResult<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let s = utf8(src, what)?;
    s.trim()
        .parse::<T>()
        .map_err(|e| PgError::Decode(format!("Invalid {} {:?}: {}", what, s, e)))
}

pub(crate) fn mismatch(what: &str, value: &Value) -> PgError {
    PgError::Encode(format!("cannot encode {:?} as {}", value.kind(), what))
}

/// Cursor over a binary payload.
pub(crate) struct Reader<'a> {
    src: &'a [u8],
    what: &'static str,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(src: &'a [u8], what: &'static str) -> Self {
        Self { src, what }
    }

    pub(crate) fn take(&mut self, n: usize) -> PgResult<&'a [u8]> {
        if self.src.len() < n {
            return Err(PgError::Decode(format!("{} value is truncated", self.what)));
        }
        let (head, tail) = self.src.split_at(n);
        self.src = tail;
        Ok(head)
    }

    pub(crate) fn u8(&mut self) -> PgResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn i16(&mut self) -> PgResult<i16> {
        Ok(i16::from_be_bytes(fixed(self.take(2)?, self.what)?))
    }

    pub(crate) fn i32(&mut self) -> PgResult<i32> {
        Ok(i32::from_be_bytes(fixed(self.take(4)?, self.what)?))
    }

    pub(crate) fn u32(&mut self) -> PgResult<u32> {
        Ok(u32::from_be_bytes(fixed(self.take(4)?, self.what)?))
    }

    pub(crate) fn i64(&mut self) -> PgResult<i64> {
        Ok(i64::from_be_bytes(fixed(self.take(8)?, self.what)?))
    }

    pub(crate) fn f64(&mut self) -> PgResult<f64> {
        Ok(f64::from_be_bytes(fixed(self.take(8)?, self.what)?))
    }

    /// Length-prefixed field; `None` for the -1 NULL marker.
    pub(crate) fn field(&mut self) -> PgResult<Option<&'a [u8]>> {
        let len = self.i32()?;
        if len < 0 {
            return Ok(None);
        }
        self.take(len as usize).map(Some)
    }

    pub(crate) fn finish(&self) -> PgResult<()> {
        if self.src.is_empty() {
            Ok(())
        } else {
            Err(PgError::Decode(format!(
                "{} value has {} trailing bytes",
                self.what,
                self.src.len()
            )))
        }
    }
}

/// Float text in the server's spelling.
pub(crate) fn format_float(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        v.to_string()
    }
}

pub(crate) fn parse_float(src: &[u8], what: &str) -> PgResult<f64> {
    let s = utf8(src, what)?.trim();
    match s {
        "NaN" => Ok(f64::NAN),
        "Infinity" => Ok(f64::INFINITY),
        "-Infinity" => Ok(f64::NEG_INFINITY),
        _ => s
            .parse::<f64>()
            .map_err(|e| PgError::Decode(format!("Invalid {} {:?}: {}", what, s, e))),
    }
}

fn integer_value(value: &Value) -> Option<i64> {
    match value {
        Value::Int2(v) => Some(*v as i64),
        Value::Int4(v) => Some(*v as i64),
        Value::Int8(v) => Some(*v),
        _ => None,
    }
}

// ============================================================================
// Boolean and binary data
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct BoolCodec;

impl Codec for BoolCodec {
    fn accepts(&self, kind: ValueKind) -> bool {
        kind == ValueKind::Bool
    }

    fn encode(&self, _: &TypeMap, format: Format, value: &Value, buf: &mut BytesMut) -> PgResult<()> {
        let Value::Bool(v) = value else {
            return Err(mismatch("bool", value));
        };
        match format {
            Format::Binary => buf.put_u8(*v as u8),
            Format::Text => buf.put_u8(if *v { b't' } else { b'f' }),
        }
        Ok(())
    }

    fn decode(&self, _: &TypeMap, format: Format, src: &[u8]) -> PgResult<Value> {
        match format {
            Format::Binary => Ok(Value::Bool(fixed::<1>(src, "BOOL")?[0] != 0)),
            Format::Text => match utf8(src, "BOOL")?.trim() {
                "t" | "true" | "TRUE" | "1" | "y" | "yes" | "on" => Ok(Value::Bool(true)),
                "f" | "false" | "FALSE" | "0" | "n" | "no" | "off" => Ok(Value::Bool(false)),
                other => Err(PgError::Decode(format!("Invalid BOOL {:?}", other))),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ByteaCodec;

impl Codec for ByteaCodec {
    fn accepts(&self, kind: ValueKind) -> bool {
        kind == ValueKind::Bytea
    }

    fn encode(&self, _: &TypeMap, format: Format, value: &Value, buf: &mut BytesMut) -> PgResult<()> {
        let Value::Bytea(v) = value else {
            return Err(mismatch("bytea", value));
        };
        match format {
            Format::Binary => buf.put_slice(v),
            Format::Text => {
                const HEX: &[u8; 16] = b"0123456789abcdef";
                buf.reserve(2 + v.len() * 2);
                buf.put_slice(b"\\x");
                for b in v {
                    buf.put_u8(HEX[(b >> 4) as usize]);
                    buf.put_u8(HEX[(b & 0x0f) as usize]);
                }
            }
        }
        Ok(())
    }

    fn decode(&self, _: &TypeMap, format: Format, src: &[u8]) -> PgResult<Value> {
        match format {
            Format::Binary => Ok(Value::Bytea(src.to_vec())),
            Format::Text => decode_bytea_text(src).map(Value::Bytea),
        }
    }
}

fn decode_bytea_text(src: &[u8]) -> PgResult<Vec<u8>> {
    if let Some(hex) = src.strip_prefix(b"\\x") {
        if hex.len() % 2 != 0 {
            return Err(PgError::Decode("Odd-length BYTEA hex string".to_string()));
        }
        return hex
            .chunks(2)
            .map(|pair| {
                let s = utf8(pair, "BYTEA")?;
                u8::from_str_radix(s, 16)
                    .map_err(|_| PgError::Decode(format!("Invalid BYTEA hex digits {:?}", s)))
            })
            .collect();
    }

    // Legacy escape format: \\ and \nnn octal sequences
    let mut out = Vec::with_capacity(src.len());
    let mut i = 0;
    while i < src.len() {
        if src[i] != b'\\' {
            out.push(src[i]);
            i += 1;
        } else if src.get(i + 1) == Some(&b'\\') {
            out.push(b'\\');
            i += 2;
        } else if src.len() >= i + 4 {
            let s = utf8(&src[i + 1..i + 4], "BYTEA")?;
            let b = u8::from_str_radix(s, 8)
                .map_err(|_| PgError::Decode(format!("Invalid BYTEA escape {:?}", s)))?;
            out.push(b);
            i += 4;
        } else {
            return Err(PgError::Decode("Truncated BYTEA escape".to_string()));
        }
    }
    Ok(out)
}

// ============================================================================
// Character types
// ============================================================================

/// text, varchar, bpchar, name, unknown and enum labels.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec;

impl Codec for TextCodec {
    fn accepts(&self, kind: ValueKind) -> bool {
        kind == ValueKind::Text
    }

    fn encode(&self, _: &TypeMap, _: Format, value: &Value, buf: &mut BytesMut) -> PgResult<()> {
        let Value::Text(v) = value else {
            return Err(mismatch("text", value));
        };
        if v.contains('\0') {
            return Err(PgError::Encode("text values cannot contain NUL bytes".to_string()));
        }
        buf.put_slice(v.as_bytes());
        Ok(())
    }

    fn decode(&self, _: &TypeMap, _: Format, src: &[u8]) -> PgResult<Value> {
        Ok(Value::Text(utf8(src, "TEXT")?.to_string()))
    }
}

/// The single-byte `"char"` type, surfaced as a one-character string.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharCodec;

impl Codec for CharCodec {
    fn accepts(&self, kind: ValueKind) -> bool {
        kind == ValueKind::Text
    }

    fn encode(&self, _: &TypeMap, format: Format, value: &Value, buf: &mut BytesMut) -> PgResult<()> {
        let Value::Text(v) = value else {
            return Err(mismatch("\"char\"", value));
        };
        let mut chars = v.chars();
        match (chars.next(), chars.next()) {
            (None, _) => {}
            (Some(c), None) if (c as u32) < 256 => match format {
                Format::Binary => buf.put_u8(c as u32 as u8),
                Format::Text => buf.put_slice(v.as_bytes()),
            },
            _ => {
                return Err(PgError::Encode(format!(
                    "{:?} does not fit in a \"char\"",
                    v
                )))
            }
        }
        Ok(())
    }

    fn decode(&self, _: &TypeMap, format: Format, src: &[u8]) -> PgResult<Value> {
        match format {
            Format::Binary => Ok(Value::Text(src.iter().map(|b| *b as char).collect())),
            Format::Text => Ok(Value::Text(utf8(src, "\"char\"")?.to_string())),
        }
    }
}

/// Codec for the `ltree` extension type. Its OID differs per database, so
/// it is registered by the application once the OID is known.
#[derive(Debug, Clone, Copy, Default)]
pub struct LtreeCodec;

const LTREE_VERSION: u8 = 1;

impl Codec for LtreeCodec {
    fn accepts(&self, kind: ValueKind) -> bool {
        kind == ValueKind::Text
    }

    fn encode(&self, map: &TypeMap, format: Format, value: &Value, buf: &mut BytesMut) -> PgResult<()> {
        if format == Format::Binary {
            buf.put_u8(LTREE_VERSION);
        }
        TextCodec.encode(map, Format::Text, value, buf)
    }

    fn decode(&self, map: &TypeMap, format: Format, src: &[u8]) -> PgResult<Value> {
        let src = match format {
            Format::Binary => match src.split_first() {
                Some((&LTREE_VERSION, rest)) => rest,
                Some((v, _)) => {
                    return Err(PgError::Decode(format!("Unsupported ltree version {}", v)))
                }
                None => return Err(PgError::Decode("Empty ltree value".to_string())),
            },
            Format::Text => src,
        };
        TextCodec.decode(map, Format::Text, src)
    }
}

// ============================================================================
// Numbers
// ============================================================================

macro_rules! int_codec {
    ($(#[$doc:meta])* $name:ident, $ty:ty, $variant:ident, $label:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        impl Codec for $name {
            fn accepts(&self, kind: ValueKind) -> bool {
                kind.is_integer()
            }

            fn encode(&self, _: &TypeMap, format: Format, value: &Value, buf: &mut BytesMut) -> PgResult<()> {
                let wide = integer_value(value).ok_or_else(|| mismatch($label, value))?;
                let v = <$ty>::try_from(wide).map_err(|_| {
                    PgError::Encode(format!("{} is out of range for {}", wide, $label))
                })?;
                match format {
                    Format::Binary => buf.put_slice(&v.to_be_bytes()),
                    Format::Text => buf.put_slice(v.to_string().as_bytes()),
                }
                Ok(())
            }

            fn decode(&self, _: &TypeMap, format: Format, src: &[u8]) -> PgResult<Value> {
                let v = match format {
                    Format::Binary => <$ty>::from_be_bytes(fixed(src, $label)?),
                    Format::Text => parse_text::<$ty>(src, $label)?,
                };
                Ok(Value::$variant(v.into()))
            }
        }
    };
}

int_codec!(Int2Codec, i16, Int2, "INT2");
int_codec!(Int4Codec, i32, Int4, "INT4");
int_codec!(Int8Codec, i64, Int8, "INT8");
int_codec!(
    /// `oid` columns decode to `Value::Int8` so every OID fits.
    OidCodec, u32, Int8, "OID"
);

#[derive(Debug, Clone, Copy, Default)]
pub struct Float4Codec;

impl Codec for Float4Codec {
    fn accepts(&self, kind: ValueKind) -> bool {
        matches!(kind, ValueKind::Float4 | ValueKind::Int2)
    }

    fn encode(&self, _: &TypeMap, format: Format, value: &Value, buf: &mut BytesMut) -> PgResult<()> {
        let v = match value {
            Value::Float4(v) => *v,
            Value::Int2(v) => *v as f32,
            _ => return Err(mismatch("FLOAT4", value)),
        };
        match format {
            Format::Binary => buf.put_f32(v),
            Format::Text if v.is_finite() => buf.put_slice(v.to_string().as_bytes()),
            Format::Text => buf.put_slice(format_float(v as f64).as_bytes()),
        }
        Ok(())
    }

    fn decode(&self, _: &TypeMap, format: Format, src: &[u8]) -> PgResult<Value> {
        Ok(Value::Float4(match format {
            Format::Binary => f32::from_be_bytes(fixed(src, "FLOAT4")?),
            Format::Text => parse_float(src, "FLOAT4")? as f32,
        }))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Float8Codec;

impl Codec for Float8Codec {
    fn accepts(&self, kind: ValueKind) -> bool {
        matches!(
            kind,
            ValueKind::Float8 | ValueKind::Float4 | ValueKind::Int2 | ValueKind::Int4
        )
    }

    fn encode(&self, _: &TypeMap, format: Format, value: &Value, buf: &mut BytesMut) -> PgResult<()> {
        let v = match value {
            Value::Float8(v) => *v,
            Value::Float4(v) => *v as f64,
            Value::Int2(v) => *v as f64,
            Value::Int4(v) => *v as f64,
            _ => return Err(mismatch("FLOAT8", value)),
        };
        match format {
            Format::Binary => buf.put_f64(v),
            Format::Text => buf.put_slice(format_float(v).as_bytes()),
        }
        Ok(())
    }

    fn decode(&self, _: &TypeMap, format: Format, src: &[u8]) -> PgResult<Value> {
        Ok(Value::Float8(match format {
            Format::Binary => f64::from_be_bytes(fixed(src, "FLOAT8")?),
            Format::Text => parse_float(src, "FLOAT8")?,
        }))
    }
}

// ============================================================================
// JSON, UUID, TID
// ============================================================================

/// `json` (`jsonb: false`) and `jsonb` (`jsonb: true`).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec {
    pub jsonb: bool,
}

const JSONB_VERSION: u8 = 1;

impl Codec for JsonCodec {
    fn accepts(&self, kind: ValueKind) -> bool {
        // Text is taken as already-serialized JSON
        matches!(kind, ValueKind::Json | ValueKind::Text)
    }

    fn encode(&self, _: &TypeMap, format: Format, value: &Value, buf: &mut BytesMut) -> PgResult<()> {
        if self.jsonb && format == Format::Binary {
            buf.put_u8(JSONB_VERSION);
        }
        match value {
            Value::Json(v) => {
                let text = serde_json::to_vec(v)
                    .map_err(|e| PgError::Encode(format!("JSON serialization failed: {}", e)))?;
                buf.put_slice(&text);
            }
            Value::Text(v) => buf.put_slice(v.as_bytes()),
            _ => return Err(mismatch("JSON", value)),
        }
        Ok(())
    }

    fn decode(&self, _: &TypeMap, format: Format, src: &[u8]) -> PgResult<Value> {
        let src = if self.jsonb && format == Format::Binary {
            match src.split_first() {
                Some((&JSONB_VERSION, rest)) => rest,
                Some((v, _)) => {
                    return Err(PgError::Decode(format!("Unsupported jsonb version {}", v)))
                }
                None => return Err(PgError::Decode("Empty jsonb value".to_string())),
            }
        } else {
            src
        };
        serde_json::from_slice(src)
            .map(Value::Json)
            .map_err(|e| PgError::Decode(format!("Invalid JSON: {}", e)))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UuidCodec;

impl Codec for UuidCodec {
    fn accepts(&self, kind: ValueKind) -> bool {
        kind == ValueKind::Uuid
    }

    fn encode(&self, _: &TypeMap, format: Format, value: &Value, buf: &mut BytesMut) -> PgResult<()> {
        let Value::Uuid(v) = value else {
            return Err(mismatch("UUID", value));
        };
        match format {
            Format::Binary => buf.put_slice(v.as_bytes()),
            Format::Text => buf.put_slice(v.hyphenated().to_string().as_bytes()),
        }
        Ok(())
    }

    fn decode(&self, _: &TypeMap, format: Format, src: &[u8]) -> PgResult<Value> {
        match format {
            Format::Binary => Ok(Value::Uuid(Uuid::from_bytes(fixed(src, "UUID")?))),
            Format::Text => parse_text(src, "UUID").map(Value::Uuid),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TidCodec;

impl Codec for TidCodec {
    fn accepts(&self, kind: ValueKind) -> bool {
        kind == ValueKind::Tid
    }

    fn encode(&self, _: &TypeMap, format: Format, value: &Value, buf: &mut BytesMut) -> PgResult<()> {
        let Value::Tid(tid) = value else {
            return Err(mismatch("TID", value));
        };
        match format {
            Format::Binary => {
                buf.put_u32(tid.block);
                buf.put_u16(tid.offset);
            }
            Format::Text => buf.put_slice(format!("({},{})", tid.block, tid.offset).as_bytes()),
        }
        Ok(())
    }

    fn decode(&self, _: &TypeMap, format: Format, src: &[u8]) -> PgResult<Value> {
        match format {
            Format::Binary => {
                let mut r = Reader::new(src, "TID");
                let block = r.u32()?;
                let offset = u16::from_be_bytes(fixed(r.take(2)?, "TID")?);
                r.finish()?;
                Ok(Value::Tid(Tid { block, offset }))
            }
            Format::Text => {
                let s = utf8(src, "TID")?.trim();
                let inner = s
                    .strip_prefix('(')
                    .and_then(|s| s.strip_suffix(')'))
                    .ok_or_else(|| PgError::Decode(format!("Invalid TID {:?}", s)))?;
                let (block, offset) = inner
                    .split_once(',')
                    .ok_or_else(|| PgError::Decode(format!("Invalid TID {:?}", s)))?;
                Ok(Value::Tid(Tid {
                    block: parse_text(block.as_bytes(), "TID block")?,
                    offset: parse_text(offset.as_bytes(), "TID offset")?,
                }))
            }
        }
    }
}

/// Natural type id for a scalar value shape.
pub(crate) fn natural_oid(kind: ValueKind) -> Option<Oid> {
    Some(match kind {
        ValueKind::Bool => Oid::BOOL,
        ValueKind::Int2 => Oid::INT2,
        ValueKind::Int4 => Oid::INT4,
        ValueKind::Int8 => Oid::INT8,
        ValueKind::Float4 => Oid::FLOAT4,
        ValueKind::Float8 => Oid::FLOAT8,
        ValueKind::Numeric => Oid::NUMERIC,
        ValueKind::Text => Oid::TEXT,
        ValueKind::Bytea => Oid::BYTEA,
        ValueKind::Uuid => Oid::UUID,
        ValueKind::Json => Oid::JSON,
        ValueKind::Date => Oid::DATE,
        ValueKind::Time => Oid::TIME,
        ValueKind::Timestamp => Oid::TIMESTAMP,
        ValueKind::TimestampTz => Oid::TIMESTAMPTZ,
        ValueKind::Interval => Oid::INTERVAL,
        ValueKind::Inet => Oid::INET,
        ValueKind::MacAddr => Oid::MACADDR,
        ValueKind::Point => Oid::POINT,
        ValueKind::Line => Oid::LINE,
        ValueKind::Lseg => Oid::LSEG,
        ValueKind::Box => Oid::BOX,
        ValueKind::Path => Oid::PATH,
        ValueKind::Polygon => Oid::POLYGON,
        ValueKind::Circle => Oid::CIRCLE,
        ValueKind::Tid => Oid::TID,
        _ => return None,
    })
}
