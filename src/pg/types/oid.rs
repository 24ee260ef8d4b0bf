//! Built-in PostgreSQL type object identifiers.

use std::fmt;

/// PostgreSQL type object identifier (OID).
///
/// Sent on the wire as a 32-bit integer. `Oid::UNSPECIFIED` (0) asks the
/// server to infer the parameter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid(pub u32);

impl Oid {
    pub const UNSPECIFIED: Oid = Oid(0);

    // Boolean types
    pub const BOOL: Oid = Oid(16);

    // Binary data
    pub const BYTEA: Oid = Oid(17);

    // Character types
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);

    // Integer types
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);

    // Text types
    pub const TEXT: Oid = Oid(25);

    // System identifiers
    pub const OID: Oid = Oid(26);
    pub const TID: Oid = Oid(27);

    // JSON types
    pub const JSON: Oid = Oid(114);
    pub const JSONB: Oid = Oid(3802);

    // Geometric types
    pub const POINT: Oid = Oid(600);
    pub const LSEG: Oid = Oid(601);
    pub const PATH: Oid = Oid(602);
    pub const BOX: Oid = Oid(603);
    pub const POLYGON: Oid = Oid(604);
    pub const LINE: Oid = Oid(628);
    pub const CIRCLE: Oid = Oid(718);

    // Floating point types
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);

    pub const UNKNOWN: Oid = Oid(705);

    // Network types
    pub const CIDR: Oid = Oid(650);
    pub const MACADDR: Oid = Oid(829);
    pub const INET: Oid = Oid(869);

    // String types
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);

    // Date/time types
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const INTERVAL: Oid = Oid(1186);

    // Numeric
    pub const NUMERIC: Oid = Oid(1700);

    // Anonymous composite
    pub const RECORD: Oid = Oid(2249);

    // UUID
    pub const UUID: Oid = Oid(2950);

    // Range types
    pub const INT4RANGE: Oid = Oid(3904);
    pub const NUMRANGE: Oid = Oid(3906);
    pub const TSRANGE: Oid = Oid(3908);
    pub const TSTZRANGE: Oid = Oid(3910);
    pub const DATERANGE: Oid = Oid(3912);
    pub const INT8RANGE: Oid = Oid(3926);

    // Array types
    pub const JSON_ARRAY: Oid = Oid(199);
    pub const LINE_ARRAY: Oid = Oid(629);
    pub const CIDR_ARRAY: Oid = Oid(651);
    pub const CIRCLE_ARRAY: Oid = Oid(719);
    pub const BOOL_ARRAY: Oid = Oid(1000);
    pub const BYTEA_ARRAY: Oid = Oid(1001);
    pub const CHAR_ARRAY: Oid = Oid(1002);
    pub const NAME_ARRAY: Oid = Oid(1003);
    pub const INT2_ARRAY: Oid = Oid(1005);
    pub const INT4_ARRAY: Oid = Oid(1007);
    pub const TEXT_ARRAY: Oid = Oid(1009);
    pub const TID_ARRAY: Oid = Oid(1010);
    pub const BPCHAR_ARRAY: Oid = Oid(1014);
    pub const VARCHAR_ARRAY: Oid = Oid(1015);
    pub const INT8_ARRAY: Oid = Oid(1016);
    pub const POINT_ARRAY: Oid = Oid(1017);
    pub const LSEG_ARRAY: Oid = Oid(1018);
    pub const PATH_ARRAY: Oid = Oid(1019);
    pub const BOX_ARRAY: Oid = Oid(1020);
    pub const FLOAT4_ARRAY: Oid = Oid(1021);
    pub const FLOAT8_ARRAY: Oid = Oid(1022);
    pub const POLYGON_ARRAY: Oid = Oid(1027);
    pub const OID_ARRAY: Oid = Oid(1028);
    pub const MACADDR_ARRAY: Oid = Oid(1040);
    pub const INET_ARRAY: Oid = Oid(1041);
    pub const TIMESTAMP_ARRAY: Oid = Oid(1115);
    pub const DATE_ARRAY: Oid = Oid(1182);
    pub const TIME_ARRAY: Oid = Oid(1183);
    pub const TIMESTAMPTZ_ARRAY: Oid = Oid(1185);
    pub const INTERVAL_ARRAY: Oid = Oid(1187);
    pub const NUMERIC_ARRAY: Oid = Oid(1231);
    pub const RECORD_ARRAY: Oid = Oid(2287);
    pub const UUID_ARRAY: Oid = Oid(2951);
    pub const JSONB_ARRAY: Oid = Oid(3807);
    pub const INT4RANGE_ARRAY: Oid = Oid(3905);
    pub const NUMRANGE_ARRAY: Oid = Oid(3907);
    pub const TSRANGE_ARRAY: Oid = Oid(3909);
    pub const TSTZRANGE_ARRAY: Oid = Oid(3911);
    pub const DATERANGE_ARRAY: Oid = Oid(3913);
    pub const INT8RANGE_ARRAY: Oid = Oid(3927);

    /// Create from the raw wire value
    #[inline]
    pub fn from_u32(oid: u32) -> Self {
        Oid(oid)
    }

    /// Get the raw wire value
    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Check if this is a text-like type
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::NAME | Oid::UNKNOWN
        )
    }

    /// Check if this is an integer type
    pub fn is_integer(self) -> bool {
        matches!(self, Oid::INT2 | Oid::INT4 | Oid::INT8)
    }

    /// Check if this is a floating point type
    pub fn is_float(self) -> bool {
        matches!(self, Oid::FLOAT4 | Oid::FLOAT8)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oid_classification() {
        assert!(Oid::TEXT.is_text_like());
        assert!(Oid::VARCHAR.is_text_like());
        assert!(!Oid::INT4.is_text_like());

        assert!(Oid::INT4.is_integer());
        assert!(Oid::INT8.is_integer());
        assert!(!Oid::FLOAT8.is_integer());

        assert!(Oid::FLOAT4.is_float());
        assert!(Oid::FLOAT8.is_float());
        assert!(!Oid::INT4.is_float());
    }
}
