//! # Index Keys
//!
//! Builds the byte keys the B-trees are ordered by. A key is the
//! concatenation of packed field values joined by a `0x00 0x00` separator,
//! with `0x00` inside a field escaped as `0x00 0x01` (see
//! [`pack::escape_into`]). Lexicographic comparison of encoded keys equals
//! field-by-field value comparison.
//!
//! Two reserved encodings bound every range: [`MIN`] (the empty key) sorts
//! before all real keys and [`max`] (a single 0xFF, which no packed value
//! begins with) sorts after them.
//!
//! A single-field key-mode index stores the raw packed value with no
//! escaping — the common case, and the reason packed bytes were designed
//! to be directly comparable.
//!
//! Non-unique indexes append the record offset (8-byte big-endian) as a
//! tie-break so duplicate field values stay distinct in the tree. Unique
//! indexes append it only when every key field is empty, which lets any
//! number of rows leave a unique-indexed field blank.

use smallvec::SmallVec;

use super::pack;
use crate::record::Record;

/// The minimum key: sorts before every encoded key.
pub const MIN: &[u8] = &[];

/// The maximum key: no packed value starts with 0xFF.
pub fn max() -> Vec<u8> {
    vec![0xFF]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
    /// Unique, no tie-break: the table's key.
    Key,
    /// Non-unique: record offset appended to every key.
    Index,
    /// Unique unless all fields are empty.
    Unique,
}

/// Describes how to derive an index key from a record: which field
/// positions participate and the uniqueness mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spec {
    pub fields: SmallVec<[usize; 4]>,
    pub mode: IndexMode,
}

impl Spec {
    pub fn new(fields: impl IntoIterator<Item = usize>, mode: IndexMode) -> Self {
        Spec {
            fields: fields.into_iter().collect(),
            mode,
        }
    }

    /// The stored tree key for `rec` at offset `off`.
    pub fn key(&self, rec: &Record, off: u64) -> Vec<u8> {
        self.key_with_flag(rec, off).0
    }

    /// The stored tree key plus whether every key field was empty.
    pub fn key_with_flag(&self, rec: &Record, off: u64) -> (Vec<u8>, bool) {
        let mut all_empty = true;
        let mut buf = Vec::new();
        if self.fields.len() == 1 && self.mode == IndexMode::Key {
            let field = rec.field(self.fields[0]);
            return (field.to_vec(), field.is_empty());
        }
        for &f in &self.fields {
            let field = rec.field(f);
            if !field.is_empty() {
                all_empty = false;
            }
            pack::escape_into(field, &mut buf);
            buf.extend_from_slice(&[0x00, 0x00]);
        }
        match self.mode {
            IndexMode::Key => {}
            IndexMode::Index => buf.extend_from_slice(&off.to_be_bytes()),
            IndexMode::Unique => {
                if all_empty {
                    buf.extend_from_slice(&off.to_be_bytes());
                }
            }
        }
        (buf, all_empty)
    }

    /// Whether two records have equal values on the key fields,
    /// disregarding any tie-break suffix.
    pub fn same_fields(&self, a: &Record, b: &Record) -> bool {
        self.fields.iter().all(|&f| a.field(f) == b.field(f))
    }

    /// Encodes a search prefix from packed field values, in field order.
    /// `vals.len()` may be shorter than the spec's fields.
    pub fn prefix(&self, vals: &[Vec<u8>]) -> Vec<u8> {
        if self.fields.len() == 1 && self.mode == IndexMode::Key {
            return vals.first().cloned().unwrap_or_default();
        }
        let mut buf = Vec::new();
        for v in vals {
            pack::escape_into(v, &mut buf);
            buf.extend_from_slice(&[0x00, 0x00]);
        }
        buf
    }

    /// Range covering every stored key beginning with `prefix`.
    pub fn prefix_range(&self, prefix: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut end = prefix.to_vec();
        end.push(0xFF);
        (prefix.to_vec(), end)
    }

    /// True when a stored key for this spec could collide with an equal
    /// candidate key: used for unique checks.
    pub fn unique_enforced(&self, key_fields_empty: bool) -> bool {
        match self.mode {
            IndexMode::Key => true,
            IndexMode::Index => false,
            IndexMode::Unique => !key_fields_empty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordBuilder;
    use crate::value::Value;

    fn rec(vals: &[Value]) -> Record {
        let mut rb = RecordBuilder::new();
        for v in vals {
            rb.add(v);
        }
        rb.build()
    }

    #[test]
    fn single_field_key_is_raw_packed_value() {
        let spec = Spec::new([0], IndexMode::Key);
        let r = rec(&[Value::Int(42), Value::str("x")]);
        assert_eq!(spec.key(&r, 99), pack::packed(&Value::Int(42)));
    }

    #[test]
    fn composite_key_orders_by_fields() {
        let spec = Spec::new([0, 1], IndexMode::Key);
        let a = spec.key(&rec(&[Value::str("a"), Value::str("bc")]), 1);
        let b = spec.key(&rec(&[Value::str("ab"), Value::str("c")]), 2);
        assert!(a < b); // "a" < "ab" decides, not the concatenation
    }

    #[test]
    fn index_mode_appends_offset() {
        let spec = Spec::new([0], IndexMode::Index);
        let r = rec(&[Value::Int(7)]);
        let k1 = spec.key(&r, 100);
        let k2 = spec.key(&r, 200);
        assert_ne!(k1, k2);
        assert!(k1 < k2);
    }

    #[test]
    fn unique_mode_tiebreaks_only_when_empty() {
        let spec = Spec::new([0], IndexMode::Unique);
        let full = rec(&[Value::Int(7)]);
        assert_eq!(spec.key(&full, 1), spec.key(&full, 2));
        let empty = rec(&[Value::str("")]);
        assert_ne!(spec.key(&empty, 1), spec.key(&empty, 2));
    }

    #[test]
    fn min_max_bound_everything() {
        let spec = Spec::new([0], IndexMode::Key);
        let k = spec.key(&rec(&[Value::str("zzz")]), 0);
        assert!(MIN < &k[..]);
        assert!(k < max());
    }
}
