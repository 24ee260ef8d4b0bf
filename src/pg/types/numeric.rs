//! Arbitrary precision `numeric`.
//!
//! Values are kept as normalized decimal text so no precision is lost.
//! The binary form is base-10000 digits with a weight and display scale.

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, BytesMut};

use super::codec::{format_float, mismatch, utf8, Codec, Reader};
use super::{Format, TypeMap, Value, ValueKind};
use crate::pg::error::{PgError, PgResult};

const SIGN_POS: u16 = 0x0000;
const SIGN_NEG: u16 = 0x4000;
const SIGN_NAN: u16 = 0xC000;
const SIGN_PINF: u16 = 0xD000;
const SIGN_NINF: u16 = 0xF000;

const NBASE: i16 = 10000;

/// Decimal number as PostgreSQL `numeric`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Numeric(String);

impl Numeric {
    /// Parse and normalize decimal text (`-12.50`, `NaN`, `Infinity`).
    pub fn new(text: &str) -> PgResult<Self> {
        let text = text.trim();
        match text {
            "NaN" | "nan" => return Ok(Numeric("NaN".to_string())),
            "Infinity" | "+Infinity" | "inf" => return Ok(Numeric("Infinity".to_string())),
            "-Infinity" | "-inf" => return Ok(Numeric("-Infinity".to_string())),
            _ => {}
        }

        let (negative, body) = match text.as_bytes().first() {
            Some(b'-') => (true, &text[1..]),
            Some(b'+') => (false, &text[1..]),
            _ => (false, text),
        };
        let (int, frac) = body.split_once('.').unwrap_or((body, ""));
        let valid = !(int.is_empty() && frac.is_empty())
            && int.bytes().all(|b| b.is_ascii_digit())
            && frac.bytes().all(|b| b.is_ascii_digit());
        if !valid {
            return Err(PgError::Encode(format!("invalid numeric {:?}", text)));
        }

        let int = int.trim_start_matches('0');
        let is_zero = int.is_empty() && frac.bytes().all(|b| b == b'0');
        let mut out = String::with_capacity(text.len() + 1);
        if negative && !is_zero {
            out.push('-');
        }
        out.push_str(if int.is_empty() { "0" } else { int });
        if !frac.is_empty() {
            out.push('.');
            out.push_str(frac);
        }
        Ok(Numeric(out))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_nan(&self) -> bool {
        self.0 == "NaN"
    }

    /// Lossy conversion to `f64`.
    pub fn to_f64(&self) -> f64 {
        match self.0.as_str() {
            "NaN" => f64::NAN,
            "Infinity" => f64::INFINITY,
            "-Infinity" => f64::NEG_INFINITY,
            s => s.parse().unwrap_or(f64::NAN),
        }
    }

    pub fn from_f64(v: f64) -> Self {
        // Display for finite floats never uses exponent notation
        Numeric::new(&format_float(v)).unwrap_or_else(|_| Numeric("NaN".to_string()))
    }

    /// Encode into the binary wire format.
    fn write_binary(&self, buf: &mut BytesMut) {
        let special = match self.0.as_str() {
            "NaN" => Some(SIGN_NAN),
            "Infinity" => Some(SIGN_PINF),
            "-Infinity" => Some(SIGN_NINF),
            _ => None,
        };
        if let Some(sign) = special {
            buf.put_i16(0);
            buf.put_i16(0);
            buf.put_u16(sign);
            buf.put_i16(0);
            return;
        }

        let (negative, body) = match self.0.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, self.0.as_str()),
        };
        let (int, frac) = body.split_once('.').unwrap_or((body, ""));
        let int = int.trim_start_matches('0');

        let mut digits: Vec<i16> = Vec::new();
        let int_pad = (4 - int.len() % 4) % 4;
        let int_digits = format!("{}{}", "0".repeat(int_pad), int);
        for chunk in int_digits.as_bytes().chunks(4) {
            digits.push(group_value(chunk));
        }
        let mut weight = digits.len() as i16 - 1;

        let frac_pad = (4 - frac.len() % 4) % 4;
        let frac_digits = format!("{}{}", frac, "0".repeat(frac_pad));
        for chunk in frac_digits.as_bytes().chunks(4) {
            digits.push(group_value(chunk));
        }

        let leading = digits.iter().take_while(|d| **d == 0).count();
        digits.drain(..leading);
        weight -= leading as i16;
        while digits.last() == Some(&0) {
            digits.pop();
        }

        let sign = if digits.is_empty() {
            weight = 0;
            SIGN_POS
        } else if negative {
            SIGN_NEG
        } else {
            SIGN_POS
        };

        buf.put_i16(digits.len() as i16);
        buf.put_i16(weight);
        buf.put_u16(sign);
        buf.put_i16(frac.len() as i16);
        for d in digits {
            buf.put_i16(d);
        }
    }

    fn read_binary(src: &[u8]) -> PgResult<Self> {
        let mut r = Reader::new(src, "NUMERIC");
        let ndigits = r.i16()?;
        let weight = r.i16()?;
        let sign = r.i16()? as u16;
        let dscale = r.i16()?;
        let digits = (0..ndigits.max(0))
            .map(|_| r.i16())
            .collect::<PgResult<Vec<i16>>>()?;
        r.finish()?;

        match sign {
            SIGN_NAN => return Ok(Numeric("NaN".to_string())),
            SIGN_PINF => return Ok(Numeric("Infinity".to_string())),
            SIGN_NINF => return Ok(Numeric("-Infinity".to_string())),
            SIGN_POS | SIGN_NEG => {}
            other => return Err(PgError::Decode(format!("Invalid numeric sign {:#x}", other))),
        }
        if digits.iter().any(|d| !(0..NBASE).contains(d)) {
            return Err(PgError::Decode("Numeric digit out of range".to_string()));
        }

        let digit_at = |idx: i32| -> i16 {
            if idx >= 0 && (idx as usize) < digits.len() {
                digits[idx as usize]
            } else {
                0
            }
        };

        let mut out = String::new();
        if sign == SIGN_NEG && !digits.is_empty() {
            out.push('-');
        }
        if weight < 0 {
            out.push('0');
        } else {
            for i in 0..=weight as i32 {
                if i == 0 {
                    out.push_str(&digit_at(0).to_string());
                } else {
                    out.push_str(&format!("{:04}", digit_at(i)));
                }
            }
        }

        if dscale > 0 {
            let mut frac = String::new();
            let groups = (dscale as i32 + 3) / 4;
            for k in 0..groups {
                frac.push_str(&format!("{:04}", digit_at(weight as i32 + 1 + k)));
            }
            frac.truncate(dscale as usize);
            out.push('.');
            out.push_str(&frac);
        }
        Ok(Numeric(out))
    }
}

fn group_value(chunk: &[u8]) -> i16 {
    chunk
        .iter()
        .fold(0i16, |acc, b| acc * 10 + (b - b'0') as i16)
}

impl fmt::Display for Numeric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Numeric {
    type Err = PgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Numeric::new(s)
    }
}

impl From<i64> for Numeric {
    fn from(v: i64) -> Self {
        Numeric(v.to_string())
    }
}

impl From<i32> for Numeric {
    fn from(v: i32) -> Self {
        Numeric(v.to_string())
    }
}

// ============================================================================
// Codec
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct NumericCodec;

impl NumericCodec {
    fn numeric_of(value: &Value) -> PgResult<Numeric> {
        Ok(match value {
            Value::Numeric(n) => n.clone(),
            Value::Int2(v) => Numeric::from(*v as i64),
            Value::Int4(v) => Numeric::from(*v as i64),
            Value::Int8(v) => Numeric::from(*v),
            Value::Float4(v) => Numeric::from_f64(*v as f64),
            Value::Float8(v) => Numeric::from_f64(*v),
            _ => return Err(mismatch("NUMERIC", value)),
        })
    }
}

impl Codec for NumericCodec {
    fn accepts(&self, kind: ValueKind) -> bool {
        matches!(
            kind,
            ValueKind::Numeric
                | ValueKind::Int2
                | ValueKind::Int4
                | ValueKind::Int8
                | ValueKind::Float4
                | ValueKind::Float8
        )
    }

    fn encode(&self, _: &TypeMap, format: Format, value: &Value, buf: &mut BytesMut) -> PgResult<()> {
        let n = Self::numeric_of(value)?;
        match format {
            Format::Binary => n.write_binary(buf),
            Format::Text => buf.put_slice(n.as_str().as_bytes()),
        }
        Ok(())
    }

    fn decode(&self, _: &TypeMap, format: Format, src: &[u8]) -> PgResult<Value> {
        let n = match format {
            Format::Binary => Numeric::read_binary(src)?,
            Format::Text => Numeric::new(utf8(src, "NUMERIC")?)
                .map_err(|e| PgError::Decode(e.to_string()))?,
        };
        Ok(Value::Numeric(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binary_roundtrip(text: &str) -> String {
        let mut buf = BytesMut::new();
        Numeric::new(text).unwrap().write_binary(&mut buf);
        Numeric::read_binary(&buf).unwrap().0
    }

    #[test]
    fn test_normalization() {
        assert_eq!(Numeric::new("007.50").unwrap().as_str(), "7.50");
        assert_eq!(Numeric::new("-0.00").unwrap().as_str(), "0.00");
        assert_eq!(Numeric::new(".5").unwrap().as_str(), "0.5");
        assert_eq!(Numeric::new("+3").unwrap().as_str(), "3");
        assert!(Numeric::new("1e5").is_err());
        assert!(Numeric::new("").is_err());
    }

    #[test]
    fn test_binary_roundtrip() {
        for text in [
            "0",
            "0.00",
            "1",
            "-1",
            "12.340",
            "10000",
            "123456789.987654321",
            "0.0001",
            "0.00001234",
            "-99999999999999999999.5",
            "NaN",
            "Infinity",
            "-Infinity",
        ] {
            assert_eq!(binary_roundtrip(text), text);
        }
    }

    #[test]
    fn test_binary_layout() {
        let mut buf = BytesMut::new();
        Numeric::new("-12.5").unwrap().write_binary(&mut buf);
        // ndigits=2 weight=0 sign=NEG dscale=1 digits=[12, 5000]
        assert_eq!(
            &buf[..],
            &[0, 2, 0, 0, 0x40, 0, 0, 1, 0, 12, 0x13, 0x88]
        );
    }

    #[test]
    fn test_codec_accepts_numbers() {
        let map = TypeMap::empty();
        let mut buf = BytesMut::new();
        NumericCodec
            .encode(&map, Format::Text, &Value::Float8(2.25), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"2.25");
    }
}
