//! Network address codecs: `inet`, `cidr` and `macaddr`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};

use super::codec::{fixed, mismatch, utf8, Codec, Reader};
use super::{Format, Inet, TypeMap, Value, ValueKind};
use crate::pg::error::{PgError, PgResult};

// Address family codes used by the server, not the OS values
const PGSQL_AF_INET: u8 = 2;
const PGSQL_AF_INET6: u8 = 3;

/// `inet` (`cidr: false`) and `cidr` (`cidr: true`).
#[derive(Debug, Clone, Copy, Default)]
pub struct InetCodec {
    pub cidr: bool,
}

impl Codec for InetCodec {
    fn accepts(&self, kind: ValueKind) -> bool {
        kind == ValueKind::Inet
    }

    fn encode(&self, _: &TypeMap, format: Format, value: &Value, buf: &mut BytesMut) -> PgResult<()> {
        let Value::Inet(inet) = value else {
            return Err(mismatch("INET", value));
        };
        let max = if inet.addr.is_ipv4() { 32 } else { 128 };
        if inet.prefix > max {
            return Err(PgError::Encode(format!(
                "prefix length {} is too long for {}",
                inet.prefix, inet.addr
            )));
        }
        match format {
            Format::Binary => {
                match inet.addr {
                    IpAddr::V4(a) => {
                        buf.put_u8(PGSQL_AF_INET);
                        buf.put_u8(inet.prefix);
                        buf.put_u8(self.cidr as u8);
                        buf.put_u8(4);
                        buf.put_slice(&a.octets());
                    }
                    IpAddr::V6(a) => {
                        buf.put_u8(PGSQL_AF_INET6);
                        buf.put_u8(inet.prefix);
                        buf.put_u8(self.cidr as u8);
                        buf.put_u8(16);
                        buf.put_slice(&a.octets());
                    }
                }
            }
            Format::Text => {
                buf.put_slice(format!("{}/{}", inet.addr, inet.prefix).as_bytes());
            }
        }
        Ok(())
    }

    fn decode(&self, _: &TypeMap, format: Format, src: &[u8]) -> PgResult<Value> {
        let inet = match format {
            Format::Binary => {
                let mut r = Reader::new(src, "INET");
                let family = r.u8()?;
                let prefix = r.u8()?;
                let _is_cidr = r.u8()?;
                let len = r.u8()? as usize;
                let addr = match (family, len) {
                    (PGSQL_AF_INET, 4) => IpAddr::V4(Ipv4Addr::from(fixed::<4>(r.take(4)?, "INET")?)),
                    (PGSQL_AF_INET6, 16) => {
                        IpAddr::V6(Ipv6Addr::from(fixed::<16>(r.take(16)?, "INET")?))
                    }
                    _ => {
                        return Err(PgError::Decode(format!(
                            "Invalid INET family {} with {} address bytes",
                            family, len
                        )))
                    }
                };
                r.finish()?;
                Inet { addr, prefix }
            }
            Format::Text => parse_inet(utf8(src, "INET")?)?,
        };
        Ok(Value::Inet(inet))
    }
}

fn parse_inet(s: &str) -> PgResult<Inet> {
    let s = s.trim();
    let bad = |e: &dyn std::fmt::Display| PgError::Decode(format!("Invalid INET {:?}: {}", s, e));
    let (addr, prefix) = match s.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (s, None),
    };
    let addr: IpAddr = addr.parse().map_err(|e| bad(&e))?;
    let prefix = match prefix {
        Some(p) => p.parse::<u8>().map_err(|e| bad(&e))?,
        None => Inet::host(addr).prefix,
    };
    Ok(Inet { addr, prefix })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MacAddrCodec;

impl Codec for MacAddrCodec {
    fn accepts(&self, kind: ValueKind) -> bool {
        kind == ValueKind::MacAddr
    }

    fn encode(&self, _: &TypeMap, format: Format, value: &Value, buf: &mut BytesMut) -> PgResult<()> {
        let Value::MacAddr(mac) = value else {
            return Err(mismatch("MACADDR", value));
        };
        match format {
            Format::Binary => buf.put_slice(mac),
            Format::Text => {
                let text = mac
                    .iter()
                    .map(|b| format!("{:02x}", b))
                    .collect::<Vec<_>>()
                    .join(":");
                buf.put_slice(text.as_bytes());
            }
        }
        Ok(())
    }

    fn decode(&self, _: &TypeMap, format: Format, src: &[u8]) -> PgResult<Value> {
        match format {
            Format::Binary => Ok(Value::MacAddr(fixed(src, "MACADDR")?)),
            Format::Text => {
                let s = utf8(src, "MACADDR")?.trim();
                let parts: Vec<&str> = s.split([':', '-']).collect();
                if parts.len() != 6 {
                    return Err(PgError::Decode(format!("Invalid MACADDR {:?}", s)));
                }
                let mut mac = [0u8; 6];
                for (slot, part) in mac.iter_mut().zip(parts) {
                    *slot = u8::from_str_radix(part, 16)
                        .map_err(|_| PgError::Decode(format!("Invalid MACADDR {:?}", s)))?;
                }
                Ok(Value::MacAddr(mac))
            }
        }
    }
}
