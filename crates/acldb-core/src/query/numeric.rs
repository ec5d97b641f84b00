//! Numeric kernel shared by updates, expressions, and aggregation.
//!
//! Arithmetic runs in `f64` unless either operand is a decimal, in which case
//! both sides are promoted and the exact decimal result is kept.

use std::cmp::Ordering;

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, MathematicalOps};

use acldb_proto::{BinaryOp, Value};

/// A numeric operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Numeric {
    Float(f64),
    Decimal(Decimal),
}

enum Pair {
    Float(f64, f64),
    Decimal(Decimal, Decimal),
}

impl Numeric {
    /// Extract a numeric operand from a value.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => Some(Numeric::Float(*n)),
            Value::Decimal(d) => Some(Numeric::Decimal(*d)),
            _ => None,
        }
    }

    /// Zero of the same kind as `self`.
    pub fn zero_like(&self) -> Self {
        match self {
            Numeric::Float(_) => Numeric::Float(0.0),
            Numeric::Decimal(_) => Numeric::Decimal(Decimal::ZERO),
        }
    }

    pub fn is_decimal(&self) -> bool {
        matches!(self, Numeric::Decimal(_))
    }

    pub fn is_zero(&self) -> bool {
        match self {
            Numeric::Float(f) => *f == 0.0,
            Numeric::Decimal(d) => d.is_zero(),
        }
    }

    pub fn to_f64(self) -> f64 {
        match self {
            Numeric::Float(f) => f,
            Numeric::Decimal(d) => d.to_f64().unwrap_or(f64::NAN),
        }
    }

    pub fn to_decimal(self) -> Option<Decimal> {
        match self {
            Numeric::Float(f) => Decimal::from_f64(f),
            Numeric::Decimal(d) => Some(d),
        }
    }

    /// Convert back to a value. Decimal results are normalized.
    pub fn into_value(self) -> Value {
        match self {
            Numeric::Float(f) => Value::Number(f),
            Numeric::Decimal(d) => Value::Decimal(d.normalize()),
        }
    }

    fn pair(self, other: Numeric) -> Pair {
        if self.is_decimal() || other.is_decimal() {
            if let (Some(a), Some(b)) = (self.to_decimal(), other.to_decimal()) {
                return Pair::Decimal(a, b);
            }
        }
        Pair::Float(self.to_f64(), other.to_f64())
    }

    pub fn add(self, other: Numeric) -> Option<Numeric> {
        match self.pair(other) {
            Pair::Float(a, b) => Some(Numeric::Float(a + b)),
            Pair::Decimal(a, b) => a.checked_add(b).map(Numeric::Decimal),
        }
    }

    pub fn sub(self, other: Numeric) -> Option<Numeric> {
        match self.pair(other) {
            Pair::Float(a, b) => Some(Numeric::Float(a - b)),
            Pair::Decimal(a, b) => a.checked_sub(b).map(Numeric::Decimal),
        }
    }

    pub fn mul(self, other: Numeric) -> Option<Numeric> {
        match self.pair(other) {
            Pair::Float(a, b) => Some(Numeric::Float(a * b)),
            Pair::Decimal(a, b) => a.checked_mul(b).map(Numeric::Decimal),
        }
    }

    /// Division. `None` on a zero divisor.
    pub fn div(self, other: Numeric) -> Option<Numeric> {
        if other.is_zero() {
            return None;
        }
        match self.pair(other) {
            Pair::Float(a, b) => Some(Numeric::Float(a / b)),
            Pair::Decimal(a, b) => a.checked_div(b).map(Numeric::Decimal),
        }
    }

    /// Remainder. `None` on a zero divisor.
    pub fn rem(self, other: Numeric) -> Option<Numeric> {
        if other.is_zero() {
            return None;
        }
        match self.pair(other) {
            Pair::Float(a, b) => Some(Numeric::Float(a % b)),
            Pair::Decimal(a, b) => a.checked_rem(b).map(Numeric::Decimal),
        }
    }

    pub fn pow(self, other: Numeric) -> Option<Numeric> {
        match self.pair(other) {
            Pair::Float(a, b) => Some(Numeric::Float(a.powf(b))),
            Pair::Decimal(a, b) => a.checked_powd(b).map(Numeric::Decimal),
        }
    }

    pub fn sqrt(self) -> Option<Numeric> {
        match self {
            Numeric::Float(f) if f >= 0.0 => Some(Numeric::Float(f.sqrt())),
            Numeric::Float(_) => None,
            Numeric::Decimal(d) => d.sqrt().map(Numeric::Decimal),
        }
    }

    /// Divide by a count.
    pub fn div_count(self, count: usize) -> Option<Numeric> {
        match self {
            Numeric::Float(f) => Some(Numeric::Float(f / count as f64)),
            Numeric::Decimal(d) => d.checked_div(Decimal::from(count)).map(Numeric::Decimal),
        }
    }

    pub fn apply(self, op: BinaryOp, other: Numeric) -> Option<Numeric> {
        match op {
            BinaryOp::Add => self.add(other),
            BinaryOp::Subtract => self.sub(other),
            BinaryOp::Multiply => self.mul(other),
            BinaryOp::Divide => self.div(other),
            BinaryOp::Modulo => self.rem(other),
            BinaryOp::Power => self.pow(other),
        }
    }

    pub fn compare(self, other: Numeric) -> Option<Ordering> {
        match self.pair(other) {
            Pair::Float(a, b) => a.partial_cmp(&b),
            Pair::Decimal(a, b) => Some(a.cmp(&b)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Numeric {
        Numeric::Decimal(Decimal::from_str(s).unwrap())
    }

    #[test]
    fn test_decimal_sum_is_exact() {
        let total = dec("10.5")
            .add(dec("20.25"))
            .and_then(|sum| sum.add(dec("30.75")))
            .unwrap();
        assert_eq!(
            total.into_value(),
            Value::Decimal(Decimal::from_str("61.5").unwrap())
        );
    }

    #[test]
    fn test_mixed_promotes_to_decimal() {
        let result = Numeric::Float(0.5).add(dec("0.25")).unwrap();
        assert!(result.is_decimal());
        assert_eq!(result.to_f64(), 0.75);
    }

    #[test]
    fn test_division_by_zero() {
        assert!(Numeric::Float(1.0).div(Numeric::Float(0.0)).is_none());
        assert!(dec("1").rem(dec("0")).is_none());
        assert_eq!(
            Numeric::Float(7.0).apply(BinaryOp::Modulo, Numeric::Float(4.0)),
            Some(Numeric::Float(3.0))
        );
    }
}
