use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ValueError;
use crate::types::FieldType;

/// A single scalar value flowing through the aggregation executor.
/// Small enum, no heap alloc for the numeric variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int64(i64),
    UInt64(u64),
    Float64(f64),
    Decimal(Decimal),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            Value::UInt64(v) => i64::try_from(*v).ok(),
            Value::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int64(v) => Some(*v as f64),
            Value::UInt64(v) => Some(*v as f64),
            Value::Float64(v) => Some(*v),
            Value::Decimal(d) => d.to_f64(),
            Value::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Value::Int64(v) => Some(Decimal::from(*v)),
            Value::UInt64(v) => Some(Decimal::from(*v)),
            Value::Float64(v) => Decimal::from_f64(*v),
            Value::Decimal(d) => Some(*d),
            Value::Text(s) => Decimal::from_str(s).ok(),
            _ => None,
        }
    }

    /// Canonical type-tagged byte encoding, used for DISTINCT de-duplication
    /// and shard-key hashing. Numeric values that compare equal encode
    /// equally regardless of the carrying variant.
    pub fn raw(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        match self {
            Value::Null => buf.push(0x00),
            Value::Int64(v) => {
                buf.push(0x01);
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Value::UInt64(v) => {
                // Values that fit i64 share the signed tag.
                if let Ok(i) = i64::try_from(*v) {
                    buf.push(0x01);
                    buf.extend_from_slice(&i.to_le_bytes());
                } else {
                    buf.push(0x02);
                    buf.extend_from_slice(&v.to_le_bytes());
                }
            }
            Value::Float64(v) => {
                buf.push(0x03);
                buf.extend_from_slice(&v.to_bits().to_le_bytes());
            }
            Value::Decimal(d) => {
                buf.push(0x04);
                buf.extend_from_slice(d.normalize().to_string().as_bytes());
            }
            Value::Text(s) => {
                buf.push(0x05);
                buf.extend_from_slice(s.as_bytes());
            }
        }
        buf
    }

    /// Null-safe monotone minimum: NULL loses to any value.
    pub fn min(self, other: Value) -> Value {
        match (self.is_null(), other.is_null()) {
            (true, _) => other,
            (_, true) => self,
            _ => match self.partial_cmp(&other) {
                Some(Ordering::Greater) => other,
                _ => self,
            },
        }
    }

    /// Null-safe monotone maximum: NULL loses to any value.
    pub fn max(self, other: Value) -> Value {
        match (self.is_null(), other.is_null()) {
            (true, _) => other,
            (_, true) => self,
            _ => match self.partial_cmp(&other) {
                Some(Ordering::Less) => other,
                _ => self,
            },
        }
    }

    /// Null-safe addition in the arithmetic class of `typ`. A NULL operand
    /// acts as the identity. Overflow and non-numeric operands error; the
    /// caller decides whether to latch or propagate.
    pub fn nullsafe_add(acc: &Value, v: &Value, typ: FieldType) -> Result<Value, ValueError> {
        if v.is_null() {
            return Ok(acc.clone());
        }
        if acc.is_null() {
            return Value::cast(v.clone(), typ);
        }
        if typ == FieldType::Decimal || typ.is_temporal() {
            let a = acc.as_decimal().ok_or_else(|| type_mismatch("DECIMAL", acc))?;
            let b = v.as_decimal().ok_or_else(|| type_mismatch("DECIMAL", v))?;
            let sum = a.checked_add(b).ok_or(ValueError::Overflow("DECIMAL add"))?;
            return Ok(Value::Decimal(sum));
        }
        if typ.is_float() {
            let a = acc.as_f64().ok_or_else(|| type_mismatch("DOUBLE", acc))?;
            let b = v.as_f64().ok_or_else(|| type_mismatch("DOUBLE", v))?;
            return Ok(Value::Float64(a + b));
        }
        if typ.is_unsigned() {
            let a = match acc {
                Value::UInt64(u) => *u,
                other => other
                    .as_i64()
                    .and_then(|i| u64::try_from(i).ok())
                    .ok_or_else(|| type_mismatch("BIGINT UNSIGNED", other))?,
            };
            let b = match v {
                Value::UInt64(u) => *u,
                other => other
                    .as_i64()
                    .and_then(|i| u64::try_from(i).ok())
                    .ok_or_else(|| type_mismatch("BIGINT UNSIGNED", other))?,
            };
            let sum = a.checked_add(b).ok_or(ValueError::Overflow("BIGINT UNSIGNED add"))?;
            return Ok(Value::UInt64(sum));
        }
        if typ.is_integral() {
            let a = acc.as_i64().ok_or_else(|| type_mismatch("BIGINT", acc))?;
            let b = v.as_i64().ok_or_else(|| type_mismatch("BIGINT", v))?;
            let sum = a.checked_add(b).ok_or(ValueError::Overflow("BIGINT add"))?;
            return Ok(Value::Int64(sum));
        }
        Err(type_mismatch("numeric", v))
    }

    /// Null-safe division. NULL operands or a zero divisor yield NULL, per
    /// SQL semantics. `prec` (when >= 0) fixes the scale of a DECIMAL
    /// quotient.
    pub fn nullsafe_div(a: &Value, b: &Value, typ: FieldType, prec: i32) -> Result<Value, ValueError> {
        if a.is_null() || b.is_null() {
            return Ok(Value::Null);
        }
        if typ == FieldType::Decimal || typ.is_temporal() {
            let da = a.as_decimal().ok_or_else(|| type_mismatch("DECIMAL", a))?;
            let db = b.as_decimal().ok_or_else(|| type_mismatch("DECIMAL", b))?;
            if db.is_zero() {
                return Ok(Value::Null);
            }
            let q = da.checked_div(db).ok_or(ValueError::Overflow("DECIMAL div"))?;
            let q = if prec >= 0 { q.round_dp(prec as u32) } else { q };
            return Ok(Value::Decimal(q));
        }
        let fa = a.as_f64().ok_or_else(|| type_mismatch("DOUBLE", a))?;
        let fb = b.as_f64().ok_or_else(|| type_mismatch("DOUBLE", b))?;
        if fb == 0.0 {
            return Ok(Value::Null);
        }
        Ok(Value::Float64(fa / fb))
    }

    /// Cast a value into the arithmetic class of `typ`. NULL stays NULL.
    pub fn cast(v: Value, typ: FieldType) -> Result<Value, ValueError> {
        if v.is_null() {
            return Ok(Value::Null);
        }
        if typ == FieldType::Decimal || typ.is_temporal() {
            let d = v.as_decimal().ok_or_else(|| type_mismatch("DECIMAL", &v))?;
            return Ok(Value::Decimal(d));
        }
        if typ.is_float() {
            let f = v.as_f64().ok_or_else(|| type_mismatch("DOUBLE", &v))?;
            return Ok(Value::Float64(f));
        }
        if typ.is_unsigned() {
            if let Value::UInt64(u) = v {
                return Ok(Value::UInt64(u));
            }
            let i = v.as_i64().ok_or_else(|| type_mismatch("BIGINT UNSIGNED", &v))?;
            let u = u64::try_from(i).map_err(|_| ValueError::Overflow("BIGINT UNSIGNED cast"))?;
            return Ok(Value::UInt64(u));
        }
        if typ.is_integral() {
            let i = v.as_i64().ok_or_else(|| type_mismatch("BIGINT", &v))?;
            return Ok(Value::Int64(i));
        }
        Ok(v)
    }
}

fn type_mismatch(expected: &str, got: &Value) -> ValueError {
    ValueError::TypeMismatch {
        expected: expected.to_string(),
        got: format!("{:?}", got),
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        matches!(self.partial_cmp(other), Some(Ordering::Equal))
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Text(a), Value::Text(b)) => a.partial_cmp(b),
            (Value::Int64(a), Value::Int64(b)) => a.partial_cmp(b),
            (Value::UInt64(a), Value::UInt64(b)) => a.partial_cmp(b),
            // Mixed numeric comparisons go through DECIMAL to stay exact.
            (a, b) => match (a.as_decimal(), b.as_decimal()) {
                (Some(da), Some(db)) => da.partial_cmp(&db),
                _ => None,
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int64(v) => write!(f, "{}", v),
            Value::UInt64(v) => write!(f, "{}", v),
            Value::Float64(v) => write!(f, "{}", v),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}
