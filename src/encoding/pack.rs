//! # Order-Preserving Value Packing
//!
//! Canonical byte serialization of [`Value`] with the defining property
//! that lexicographic comparison of packed bytes equals value comparison:
//! `pack(a) < pack(b)` iff `a < b`. All index keys and record fields are
//! built from this encoding, so key comparison is a plain `memcmp`.
//!
//! ## Tag bytes
//!
//! ```text
//! (empty buffer)  empty string — the "missing field" convention
//! 0x02 0x03       false, true
//! 0x08            negative number (payload complemented)
//! 0x09            zero
//! 0x0A            positive number
//! 0x10            string (raw bytes follow)
//! 0x18            date (8-byte big-endian)
//! 0x20            list (escaped elements, 0x00 0x00 separators)
//! 0xFF            never produced — reserved as the Max key sentinel
//! ```
//!
//! ## Number encoding
//!
//! Numbers are normalized to `sign * 0.digits * 10^exp` (first digit
//! nonzero, no trailing zeros — see [`NumParts`]). A positive number packs
//! as the exponent byte (`exp ^ 0x80` so negative exponents sort first)
//! followed by one byte per digit (`0x10 + d`) and a 0x00 terminator. The
//! terminator makes a shorter digit string sort before its extensions
//! (0.5 < 0.505). Negative numbers complement the exponent, digit, and
//! terminator bytes, which exactly reverses the order.
//!
//! The empty string packs to the empty buffer, mirroring how records omit
//! absent trailing fields. This places the empty string below every other
//! packed value; order within each kind is unaffected.

use std::cmp::Ordering;
use std::sync::Arc;

use eyre::Result;

use crate::errors::corrupt;
use crate::value::{NumParts, Value};

pub const TAG_FALSE: u8 = 0x02;
pub const TAG_TRUE: u8 = 0x03;
pub const TAG_NUM_NEG: u8 = 0x08;
pub const TAG_NUM_ZERO: u8 = 0x09;
pub const TAG_NUM_POS: u8 = 0x0A;
pub const TAG_STR: u8 = 0x10;
pub const TAG_DATE: u8 = 0x18;
pub const TAG_LIST: u8 = 0x20;

pub fn pack(v: &Value, buf: &mut Vec<u8>) {
    match v {
        Value::Min => {} // sorts with the empty string, below everything packed
        Value::Max => buf.push(0xFF),
        Value::Bool(false) => buf.push(TAG_FALSE),
        Value::Bool(true) => buf.push(TAG_TRUE),
        Value::Int(_) | Value::Dec(_) => pack_num(&v.num_parts().unwrap(), buf),
        Value::Str(s) => {
            if !s.is_empty() {
                buf.push(TAG_STR);
                buf.extend_from_slice(s.as_bytes());
            }
        }
        Value::Date(d) => {
            buf.push(TAG_DATE);
            buf.extend_from_slice(&d.to_be_bytes());
        }
        Value::List(items) => {
            buf.push(TAG_LIST);
            for item in items {
                let mut elem = Vec::new();
                pack(item, &mut elem);
                escape_into(&elem, buf);
                buf.extend_from_slice(&[0x00, 0x00]);
            }
        }
    }
}

pub fn packed(v: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    pack(v, &mut buf);
    buf
}

fn pack_num(parts: &NumParts, buf: &mut Vec<u8>) {
    debug_assert!((i8::MIN as i32..=i8::MAX as i32).contains(&parts.exp));
    match parts.sign.cmp(&0) {
        Ordering::Equal => buf.push(TAG_NUM_ZERO),
        Ordering::Greater => {
            buf.push(TAG_NUM_POS);
            buf.push((parts.exp as u8) ^ 0x80);
            for &d in &parts.digits {
                buf.push(0x10 + d);
            }
            buf.push(0x00);
        }
        Ordering::Less => {
            buf.push(TAG_NUM_NEG);
            buf.push(!((parts.exp as u8) ^ 0x80));
            for &d in &parts.digits {
                buf.push(!(0x10 + d));
            }
            buf.push(0xFF);
        }
    }
}

pub fn unpack(buf: &[u8]) -> Result<Value> {
    if buf.is_empty() {
        return Ok(Value::Str(Arc::from("")));
    }
    match buf[0] {
        TAG_FALSE => Ok(Value::Bool(false)),
        TAG_TRUE => Ok(Value::Bool(true)),
        TAG_NUM_ZERO => Ok(Value::Int(0)),
        TAG_NUM_POS => unpack_num(&buf[1..], false),
        TAG_NUM_NEG => unpack_num(&buf[1..], true),
        TAG_STR => {
            let s = std::str::from_utf8(&buf[1..])
                .map_err(|_| corrupt("packed string is not utf-8"))?;
            Ok(Value::str(s))
        }
        TAG_DATE => {
            let bytes: [u8; 8] = buf
                .get(1..9)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| corrupt("truncated packed date"))?;
            Ok(Value::Date(u64::from_be_bytes(bytes)))
        }
        TAG_LIST => unpack_list(&buf[1..]),
        0xFF => Ok(Value::Max),
        tag => Err(corrupt(format!("unknown pack tag {:#04x}", tag))),
    }
}

fn unpack_num(buf: &[u8], neg: bool) -> Result<Value> {
    let flip = |b: u8| if neg { !b } else { b };
    let raw_exp = flip(*buf.first().ok_or_else(|| corrupt("truncated number"))?);
    let exp = (raw_exp ^ 0x80) as i8 as i32;
    let terminator = if neg { 0xFF } else { 0x00 };
    let mut coef: i64 = 0;
    let mut ndigits = 0i32;
    for &b in &buf[1..] {
        if b == terminator {
            break;
        }
        let d = flip(b).wrapping_sub(0x10);
        if d > 9 {
            return Err(corrupt("bad packed digit"));
        }
        coef = coef
            .checked_mul(10)
            .and_then(|c| c.checked_add(d as i64))
            .ok_or_else(|| corrupt("packed number too large"))?;
        ndigits += 1;
    }
    if neg {
        coef = -coef;
    }
    let exp = exp - ndigits;
    if exp == 0 {
        return Ok(Value::Int(coef));
    }
    if exp > 0 && exp <= 18 {
        if let Some(n) = 10_i64.checked_pow(exp as u32).and_then(|p| coef.checked_mul(p)) {
            return Ok(Value::Int(n));
        }
    }
    Ok(Value::Dec(crate::value::Dec {
        coef,
        exp: exp.clamp(i8::MIN as i32, i8::MAX as i32) as i8,
    }))
}

fn unpack_list(mut buf: &[u8]) -> Result<Value> {
    let mut items = Vec::new();
    while !buf.is_empty() {
        let (elem, rest) = unescape_next(buf)?;
        items.push(unpack(&elem)?);
        buf = rest;
    }
    Ok(Value::List(items))
}

/// Escapes 0x00 as 0x00 0x01 so 0x00 0x00 can serve as a separator.
/// The mapping is monotone: escaped streams compare the same as raw ones.
pub fn escape_into(raw: &[u8], out: &mut Vec<u8>) {
    for &b in raw {
        out.push(b);
        if b == 0x00 {
            out.push(0x01);
        }
    }
}

/// Reads one escaped element up to (and consuming) its 0x00 0x00 separator.
pub fn unescape_next(buf: &[u8]) -> Result<(Vec<u8>, &[u8])> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < buf.len() {
        let b = buf[i];
        if b == 0x00 {
            let next = *buf
                .get(i + 1)
                .ok_or_else(|| corrupt("truncated escape sequence"))?;
            if next == 0x00 {
                return Ok((out, &buf[i + 2..]));
            }
            debug_assert_eq!(next, 0x01);
            out.push(0x00);
            i += 2;
        } else {
            out.push(b);
            i += 1;
        }
    }
    Err(corrupt("unterminated escaped element"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Dec;
    use proptest::prelude::*;

    fn rt(v: Value) {
        let b = packed(&v);
        assert_eq!(unpack(&b).unwrap(), v, "round trip of {}", v);
    }

    #[test]
    fn round_trips() {
        rt(Value::Bool(false));
        rt(Value::Bool(true));
        rt(Value::Int(0));
        rt(Value::Int(5));
        rt(Value::Int(-5));
        rt(Value::Int(i64::MAX));
        rt(Value::str(""));
        rt(Value::str("hello"));
        rt(Value::Date(20240131));
        rt(Value::Dec(Dec { coef: 505, exp: -3 }));
        rt(Value::List(vec![
            Value::Int(1),
            Value::str("x"),
            Value::str(""),
        ]));
    }

    #[test]
    fn empty_string_sorts_first_among_strings() {
        assert!(packed(&Value::str("")) < packed(&Value::str("a")));
        assert!(packed(&Value::str("")).is_empty());
    }

    #[test]
    fn terminator_orders_digit_prefixes() {
        // 0.5 < 0.505 and -0.5 > -0.505
        let a = packed(&Value::Dec(Dec { coef: 5, exp: -1 }));
        let b = packed(&Value::Dec(Dec { coef: 505, exp: -3 }));
        assert!(a < b);
        let a = packed(&Value::Dec(Dec { coef: -5, exp: -1 }));
        let b = packed(&Value::Dec(Dec { coef: -505, exp: -3 }));
        assert!(a > b);
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            (any::<i64>(), -20i8..20).prop_map(|(coef, exp)| Value::Dec(Dec { coef, exp })),
            "[a-z]{1,12}".prop_map(Value::str),
            any::<u64>().prop_map(Value::Date),
        ]
    }

    proptest! {
        // pack order equals value order, within and across kinds
        // (the empty string, which packs to the empty buffer, is the one
        // cross-kind exception and is excluded by the generator)
        #[test]
        fn pack_order_is_value_order(a in arb_value(), b in arb_value()) {
            let (pa, pb) = (packed(&a), packed(&b));
            prop_assert_eq!(pa.cmp(&pb), a.cmp(&b), "{} vs {}", a, b);
        }

        #[test]
        fn pack_round_trip(a in arb_value()) {
            let v = unpack(&packed(&a)).unwrap();
            prop_assert_eq!(v, a);
        }

        #[test]
        fn escape_is_monotone(a in proptest::collection::vec(any::<u8>(), 0..40),
                              b in proptest::collection::vec(any::<u8>(), 0..40)) {
            let enc = |raw: &[u8]| {
                let mut out = Vec::new();
                escape_into(raw, &mut out);
                out.extend_from_slice(&[0x00, 0x00]);
                out
            };
            prop_assert_eq!(enc(&a).cmp(&enc(&b)), a.cmp(&b));
        }
    }
}
