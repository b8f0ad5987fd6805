//! # Values
//!
//! A small tagged value union standing in for the host language's value
//! system. The engine only depends on three capabilities:
//!
//! - a total order across *all* values: `Min < bool < number < string <
//!   date < container < Max`, natural order within a kind
//! - a canonical order-preserving byte serialization (see
//!   [`crate::encoding::pack`])
//! - conversions to integer and string
//!
//! `Int` and `Dec` are one number class and compare numerically: `Int(5)`
//! equals `Dec{coef: 50, exp: -1}`. Comparison decomposes both into a
//! normalized `(sign, exponent, digits)` form, which is also the form the
//! pack codec serializes, so byte order and value order cannot drift apart.
//!
//! `Min` and `Max` are range sentinels that sort below and above every
//! other value. They never appear in stored records.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

#[derive(Debug, Clone)]
pub enum Value {
    Min,
    Bool(bool),
    Int(i64),
    Dec(Dec),
    Str(Arc<str>),
    Date(u64),
    List(Vec<Value>),
    Max,
}

/// A small decimal: `coef * 10^exp`. Enough for the aggregate arithmetic
/// the query layer needs; not a general arbitrary-precision type.
#[derive(Debug, Clone, Copy)]
pub struct Dec {
    pub coef: i64,
    pub exp: i8,
}

/// Normalized decomposition of a number: `sign * 0.digits * 10^exp`,
/// first digit nonzero, no trailing zero digits. Zero is `sign == 0`.
/// Shared by comparison and by the pack codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumParts {
    pub sign: i8,
    pub exp: i32,
    pub digits: SmallVec<[u8; 20]>,
}

impl NumParts {
    pub fn zero() -> Self {
        NumParts {
            sign: 0,
            exp: 0,
            digits: SmallVec::new(),
        }
    }

    pub fn decompose(coef: i64, exp: i32) -> Self {
        if coef == 0 {
            return NumParts::zero();
        }
        let sign = if coef < 0 { -1 } else { 1 };
        let mut mag = (coef as i128).unsigned_abs();
        let mut digits: SmallVec<[u8; 20]> = SmallVec::new();
        while mag > 0 {
            digits.push((mag % 10) as u8);
            mag /= 10;
        }
        digits.reverse();
        let e = exp + digits.len() as i32;
        while digits.last() == Some(&0) {
            digits.pop();
        }
        NumParts {
            sign,
            exp: e,
            digits,
        }
    }

    pub fn compare(&self, other: &NumParts) -> Ordering {
        if self.sign != other.sign {
            return self.sign.cmp(&other.sign);
        }
        if self.sign == 0 {
            return Ordering::Equal;
        }
        let ord = match self.exp.cmp(&other.exp) {
            Ordering::Equal => self.digits.cmp(&other.digits),
            ne => ne,
        };
        if self.sign < 0 {
            ord.reverse()
        } else {
            ord
        }
    }

    /// Reassemble into (coef, exp), saturating if the digits overflow i64.
    pub fn to_dec(&self) -> Dec {
        if self.sign == 0 {
            return Dec { coef: 0, exp: 0 };
        }
        let mut coef: i64 = 0;
        for &d in &self.digits {
            coef = coef.saturating_mul(10).saturating_add(d as i64);
        }
        let exp = self.exp - self.digits.len() as i32;
        Dec {
            coef: coef * self.sign as i64,
            exp: exp.clamp(i8::MIN as i32, i8::MAX as i32) as i8,
        }
    }
}

impl Dec {
    pub fn parts(&self) -> NumParts {
        NumParts::decompose(self.coef, self.exp as i32)
    }
}

fn ord_rank(v: &Value) -> u8 {
    match v {
        Value::Min => 0,
        Value::Bool(_) => 1,
        Value::Int(_) | Value::Dec(_) => 2,
        Value::Str(_) => 3,
        Value::Date(_) => 4,
        Value::List(_) => 5,
        Value::Max => 7,
    }
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Value {
        Value::Str(Arc::from(s.as_ref()))
    }

    pub fn num_parts(&self) -> Option<NumParts> {
        match self {
            Value::Int(n) => Some(NumParts::decompose(*n, 0)),
            Value::Dec(d) => Some(d.parts()),
            _ => None,
        }
    }

    pub fn to_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Dec(d) if d.exp >= 0 => {
                d.coef.checked_mul(10_i64.checked_pow(d.exp as u32)?)
            }
            Value::Bool(false) => Some(0),
            Value::Bool(true) => Some(1),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn compare(&self, other: &Value) -> Ordering {
        let (r1, r2) = (ord_rank(self), ord_rank(other));
        if r1 != r2 {
            return r1.cmp(&r2);
        }
        match (self, other) {
            (Value::Min, Value::Min) | (Value::Max, Value::Max) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Str(a), Value::Str(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::List(a), Value::List(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let c = x.compare(y);
                    if c != Ordering::Equal {
                        return c;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => {
                // both numbers (Int/Dec in any combination)
                let a = self.num_parts().unwrap();
                let b = other.num_parts().unwrap();
                a.compare(&b)
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Min => write!(f, "<min>"),
            Value::Max => write!(f, "<max>"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Dec(d) => {
                if d.exp == 0 {
                    write!(f, "{}", d.coef)
                } else {
                    write!(f, "{}e{}", d.coef, d.exp)
                }
            }
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Date(d) => write!(f, "#{}", d),
            Value::List(vs) => {
                write!(f, "[")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_order() {
        let vals = [
            Value::Min,
            Value::Bool(false),
            Value::Bool(true),
            Value::Int(-3),
            Value::Int(0),
            Value::Int(7),
            Value::str(""),
            Value::str("abc"),
            Value::Date(20240101),
            Value::List(vec![Value::Int(1)]),
            Value::Max,
        ];
        for w in vals.windows(2) {
            assert!(w[0] < w[1], "{} should sort before {}", w[0], w[1]);
        }
    }

    #[test]
    fn int_dec_one_number_class() {
        assert_eq!(Value::Int(5), Value::Dec(Dec { coef: 50, exp: -1 }));
        assert!(Value::Dec(Dec { coef: 55, exp: -1 }) > Value::Int(5));
        assert!(Value::Dec(Dec { coef: -55, exp: -1 }) < Value::Int(-5));
        assert!(Value::Dec(Dec { coef: 5, exp: -3 }) < Value::Int(1));
    }

    #[test]
    fn decompose_normalizes() {
        let p = NumParts::decompose(5000, -3); // 5.0
        assert_eq!(p.sign, 1);
        assert_eq!(p.exp, 1);
        assert_eq!(&p.digits[..], &[5]);
        assert_eq!(p.compare(&NumParts::decompose(5, 0)), Ordering::Equal);
    }

    #[test]
    fn negative_order_reverses() {
        let a = NumParts::decompose(-100, 0);
        let b = NumParts::decompose(-99, 0);
        assert_eq!(a.compare(&b), Ordering::Less);
    }
}
