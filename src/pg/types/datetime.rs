//! Date and time codecs.
//!
//! Binary forms count from the PostgreSQL epoch, 2000-01-01.

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};

use super::codec::{fixed, mismatch, utf8, Codec, Reader};
use super::{Format, Interval, TypeMap, Value, ValueKind};
use crate::pg::error::{PgError, PgResult};

const USECS_PER_SEC: i64 = 1_000_000;
const USECS_PER_MINUTE: i64 = 60 * USECS_PER_SEC;
const USECS_PER_HOUR: i64 = 60 * USECS_PER_MINUTE;

fn pg_epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or_default()
}

fn pg_epoch() -> NaiveDateTime {
    pg_epoch_date().and_time(NaiveTime::MIN)
}

fn infinite(what: &str) -> PgError {
    PgError::Decode(format!("infinite {} cannot be represented", what))
}

fn parse_err(what: &str, s: &str, e: impl std::fmt::Display) -> PgError {
    PgError::Decode(format!("Invalid {} {:?}: {}", what, s, e))
}

fn micros_since_epoch(ts: NaiveDateTime) -> PgResult<i64> {
    (ts - pg_epoch())
        .num_microseconds()
        .ok_or_else(|| PgError::Encode(format!("timestamp {} is out of range", ts)))
}

fn from_micros_since_epoch(us: i64) -> PgResult<NaiveDateTime> {
    if us == i64::MAX || us == i64::MIN {
        return Err(infinite("timestamp"));
    }
    pg_epoch()
        .checked_add_signed(Duration::microseconds(us))
        .ok_or_else(|| PgError::Decode(format!("timestamp offset {} is out of range", us)))
}

// ============================================================================
// date
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct DateCodec;

impl Codec for DateCodec {
    fn accepts(&self, kind: ValueKind) -> bool {
        kind == ValueKind::Date
    }

    fn encode(&self, _: &TypeMap, format: Format, value: &Value, buf: &mut BytesMut) -> PgResult<()> {
        let Value::Date(d) = value else {
            return Err(mismatch("DATE", value));
        };
        match format {
            Format::Binary => buf.put_i32((*d - pg_epoch_date()).num_days() as i32),
            Format::Text => buf.put_slice(d.format("%Y-%m-%d").to_string().as_bytes()),
        }
        Ok(())
    }

    fn decode(&self, _: &TypeMap, format: Format, src: &[u8]) -> PgResult<Value> {
        let date = match format {
            Format::Binary => {
                let days = i32::from_be_bytes(fixed(src, "DATE")?);
                if days == i32::MAX || days == i32::MIN {
                    return Err(infinite("date"));
                }
                pg_epoch_date()
                    .checked_add_signed(Duration::days(days as i64))
                    .ok_or_else(|| PgError::Decode(format!("date offset {} is out of range", days)))?
            }
            Format::Text => {
                let s = utf8(src, "DATE")?.trim();
                if s.ends_with("infinity") {
                    return Err(infinite("date"));
                }
                NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| parse_err("DATE", s, e))?
            }
        };
        Ok(Value::Date(date))
    }
}

// ============================================================================
// time
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct TimeCodec;

impl Codec for TimeCodec {
    fn accepts(&self, kind: ValueKind) -> bool {
        kind == ValueKind::Time
    }

    fn encode(&self, _: &TypeMap, format: Format, value: &Value, buf: &mut BytesMut) -> PgResult<()> {
        let Value::Time(t) = value else {
            return Err(mismatch("TIME", value));
        };
        match format {
            Format::Binary => {
                let us = t.num_seconds_from_midnight() as i64 * USECS_PER_SEC
                    + (t.nanosecond() / 1_000) as i64;
                buf.put_i64(us);
            }
            Format::Text => buf.put_slice(t.format("%H:%M:%S%.6f").to_string().as_bytes()),
        }
        Ok(())
    }

    fn decode(&self, _: &TypeMap, format: Format, src: &[u8]) -> PgResult<Value> {
        let time = match format {
            Format::Binary => {
                let us = i64::from_be_bytes(fixed(src, "TIME")?);
                let secs = (us / USECS_PER_SEC) as u32;
                let nanos = ((us % USECS_PER_SEC) * 1_000) as u32;
                NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
                    .ok_or_else(|| PgError::Decode(format!("time offset {} is out of range", us)))?
            }
            Format::Text => {
                let s = utf8(src, "TIME")?.trim();
                NaiveTime::parse_from_str(s, "%H:%M:%S%.f").map_err(|e| parse_err("TIME", s, e))?
            }
        };
        Ok(Value::Time(time))
    }
}

// ============================================================================
// timestamp / timestamptz
// ============================================================================

/// `timestamp` (`with_tz: false`) and `timestamptz` (`with_tz: true`).
#[derive(Debug, Clone, Copy, Default)]
pub struct TimestampCodec {
    pub with_tz: bool,
}

impl Codec for TimestampCodec {
    fn accepts(&self, kind: ValueKind) -> bool {
        matches!(kind, ValueKind::Timestamp | ValueKind::TimestampTz)
    }

    fn encode(&self, _: &TypeMap, format: Format, value: &Value, buf: &mut BytesMut) -> PgResult<()> {
        let naive = match value {
            Value::Timestamp(ts) => *ts,
            Value::TimestampTz(ts) => ts.naive_utc(),
            _ => return Err(mismatch("TIMESTAMP", value)),
        };
        match format {
            Format::Binary => buf.put_i64(micros_since_epoch(naive)?),
            Format::Text => {
                let mut text = naive.format("%Y-%m-%d %H:%M:%S%.6f").to_string();
                if self.with_tz {
                    text.push_str("+00:00");
                }
                buf.put_slice(text.as_bytes());
            }
        }
        Ok(())
    }

    fn decode(&self, _: &TypeMap, format: Format, src: &[u8]) -> PgResult<Value> {
        let naive = match format {
            Format::Binary => from_micros_since_epoch(i64::from_be_bytes(fixed(src, "TIMESTAMP")?))?,
            Format::Text => {
                let s = utf8(src, "TIMESTAMP")?.trim();
                if s.ends_with("infinity") {
                    return Err(infinite("timestamp"));
                }
                if self.with_tz {
                    DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z")
                        .map_err(|e| parse_err("TIMESTAMPTZ", s, e))?
                        .naive_utc()
                } else {
                    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                        .map_err(|e| parse_err("TIMESTAMP", s, e))?
                }
            }
        };
        Ok(if self.with_tz {
            Value::TimestampTz(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
        } else {
            Value::Timestamp(naive)
        })
    }
}

// ============================================================================
// interval
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct IntervalCodec;

impl Codec for IntervalCodec {
    fn accepts(&self, kind: ValueKind) -> bool {
        kind == ValueKind::Interval
    }

    fn encode(&self, _: &TypeMap, format: Format, value: &Value, buf: &mut BytesMut) -> PgResult<()> {
        let Value::Interval(iv) = value else {
            return Err(mismatch("INTERVAL", value));
        };
        match format {
            Format::Binary => {
                buf.put_i64(iv.microseconds);
                buf.put_i32(iv.days);
                buf.put_i32(iv.months);
            }
            Format::Text => buf.put_slice(format_interval(iv).as_bytes()),
        }
        Ok(())
    }

    fn decode(&self, _: &TypeMap, format: Format, src: &[u8]) -> PgResult<Value> {
        let iv = match format {
            Format::Binary => {
                let mut r = Reader::new(src, "INTERVAL");
                let microseconds = r.i64()?;
                let days = r.i32()?;
                let months = r.i32()?;
                r.finish()?;
                Interval::new(months, days, microseconds)
            }
            Format::Text => parse_interval(utf8(src, "INTERVAL")?)?,
        };
        Ok(Value::Interval(iv))
    }
}

/// Text form accepted by every `IntervalStyle`.
fn format_interval(iv: &Interval) -> String {
    let sign = if iv.microseconds < 0 { "-" } else { "" };
    let us = iv.microseconds.unsigned_abs();
    let (h, rest) = (us / USECS_PER_HOUR as u64, us % USECS_PER_HOUR as u64);
    let (m, rest) = (rest / USECS_PER_MINUTE as u64, rest % USECS_PER_MINUTE as u64);
    let (s, frac) = (rest / USECS_PER_SEC as u64, rest % USECS_PER_SEC as u64);
    format!(
        "{} mon {} day {}{:02}:{:02}:{:02}.{:06}",
        iv.months, iv.days, sign, h, m, s, frac
    )
}

/// Parse the `postgres` interval style, e.g. `1 year 2 mons -3 days 04:05:06.5`.
fn parse_interval(s: &str) -> PgResult<Interval> {
    let bad = || PgError::Decode(format!("Invalid INTERVAL {:?}", s));
    let mut iv = Interval::default();
    let mut tokens = s.split_whitespace().peekable();

    while let Some(tok) = tokens.next() {
        if tok.contains(':') {
            let (negative, clock) = match tok.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, tok.strip_prefix('+').unwrap_or(tok)),
            };
            let mut parts = clock.split(':');
            let h: i64 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
            let m: i64 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
            let sec = parts.next().unwrap_or("0");
            let (whole, frac) = sec.split_once('.').unwrap_or((sec, ""));
            let whole: i64 = whole.parse().map_err(|_| bad())?;
            let frac_us: i64 = if frac.is_empty() {
                0
            } else {
                let digits: String = frac.chars().chain(std::iter::repeat('0')).take(6).collect();
                digits.parse().map_err(|_| bad())?
            };
            let total = h * USECS_PER_HOUR + m * USECS_PER_MINUTE + whole * USECS_PER_SEC + frac_us;
            iv.microseconds += if negative { -total } else { total };
            continue;
        }

        let n: i64 = tok.parse().map_err(|_| bad())?;
        let unit = tokens.next().ok_or_else(bad)?;
        match unit.trim_end_matches('s') {
            "year" => iv.months += (n * 12) as i32,
            "mon" | "month" => iv.months += n as i32,
            "day" => iv.days += n as i32,
            "hour" => iv.microseconds += n * USECS_PER_HOUR,
            "min" | "minute" => iv.microseconds += n * USECS_PER_MINUTE,
            "sec" | "second" => iv.microseconds += n * USECS_PER_SEC,
            "microsecond" => iv.microseconds += n,
            _ => return Err(bad()),
        }
    }
    Ok(iv)
}
