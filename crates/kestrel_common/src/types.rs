use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a physical backend server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackendId(pub String);

impl BackendId {
    pub fn new(name: impl Into<String>) -> Self {
        BackendId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Column type tags as announced to the client, MySQL-flavored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Int32,
    Int64,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Decimal,
    Text,
    DateTime,
    Timestamp,
    Date,
    Time,
}

impl FieldType {
    pub fn is_integral(self) -> bool {
        matches!(
            self,
            FieldType::Int32 | FieldType::Int64 | FieldType::UInt32 | FieldType::UInt64
        )
    }

    pub fn is_unsigned(self) -> bool {
        matches!(self, FieldType::UInt32 | FieldType::UInt64)
    }

    pub fn is_float(self) -> bool {
        matches!(self, FieldType::Float32 | FieldType::Float64)
    }

    pub fn is_temporal(self) -> bool {
        matches!(
            self,
            FieldType::DateTime | FieldType::Timestamp | FieldType::Date | FieldType::Time
        )
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Int32 => "INT",
            FieldType::Int64 => "BIGINT",
            FieldType::UInt32 => "INT UNSIGNED",
            FieldType::UInt64 => "BIGINT UNSIGNED",
            FieldType::Float32 => "FLOAT",
            FieldType::Float64 => "DOUBLE",
            FieldType::Decimal => "DECIMAL",
            FieldType::Text => "TEXT",
            FieldType::DateTime => "DATETIME",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::Date => "DATE",
            FieldType::Time => "TIME",
        };
        write!(f, "{}", name)
    }
}

/// Digits reserved when an integral SUM is widened to DECIMAL.
pub const DECIMAL_LONGLONG_DIGITS: u32 = 22;

/// Significant digits of a DOUBLE column.
pub const DOUBLE_DIGITS: u32 = 15;

/// Decimal count meaning "not fixed" for float columns.
pub const NOT_FIXED_DEC: u8 = 31;

/// Result-set column metadata. The aggregation executor rewrites the type,
/// length and decimal count in place before the header is sent to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub typ: FieldType,
    pub column_length: u32,
    pub decimals: u8,
}

impl Field {
    pub fn new(name: impl Into<String>, typ: FieldType, column_length: u32, decimals: u8) -> Self {
        Field {
            name: name.into(),
            typ,
            column_length,
            decimals,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_type_predicates() {
        assert!(FieldType::Int64.is_integral());
        assert!(FieldType::UInt64.is_integral());
        assert!(FieldType::UInt64.is_unsigned());
        assert!(!FieldType::Int64.is_unsigned());
        assert!(FieldType::Float64.is_float());
        assert!(!FieldType::Decimal.is_float());
        assert!(FieldType::Timestamp.is_temporal());
        assert!(!FieldType::Text.is_temporal());
    }

    #[test]
    fn test_backend_id_display() {
        let b = BackendId::new("backend0");
        assert_eq!(b.to_string(), "backend0");
    }
}
