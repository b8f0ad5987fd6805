//! # Record Codec
//!
//! A record is a length-prefixed, self-describing byte string holding
//! packed values by position:
//!
//! ```text
//! +---------+----------------+---------------------+------------+
//! | flag(1) | count (varint) | offsets (count × w) | field data |
//! +---------+----------------+---------------------+------------+
//! ```
//!
//! The flag byte selects the offset width `w` (1, 2, or 4 bytes,
//! little-endian) chosen by total record length, so small records pay one
//! byte per field. `offsets[i]` is the end position of field `i` relative
//! to the start of the record; field `i` therefore occupies
//! `offsets[i-1] .. offsets[i]` (the header end for `i == 0`), and the
//! last offset doubles as the record length.
//!
//! Records are immutable once built. [`RecordBuilder`] accumulates packed
//! fields and emits a complete record. When a record is written to the
//! store a CRC-32 is appended after it; reads through [`Record::read_ck`]
//! refuse bytes whose checksum does not match.
//!
//! Because fields hold [`pack`](crate::encoding::pack)ed values, two
//! records compare field-by-field on raw bytes exactly as the original
//! values would. Asking for a field at or past `count` returns the empty
//! buffer — the packed empty string — which is how absent columns read.

use std::cmp::Ordering;
use std::sync::Arc;

use eyre::Result;

use crate::cksum;
use crate::encoding::{pack, varint};
use crate::errors::corrupt;
use crate::storage::{Offset, Store};
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record(Arc<[u8]>);

const FLAG_W1: u8 = 1;
const FLAG_W2: u8 = 2;
const FLAG_W4: u8 = 4;

impl Record {
    pub fn from_vec(bytes: Vec<u8>) -> Record {
        Record(Arc::from(bytes))
    }

    /// An empty record (zero fields).
    pub fn empty() -> Record {
        RecordBuilder::new().build()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    fn header(&self) -> Option<(usize, usize, usize)> {
        // (width, count, offsets start)
        let flag = *self.0.first()?;
        let width = match flag {
            FLAG_W1 => 1,
            FLAG_W2 => 2,
            FLAG_W4 => 4,
            _ => return None,
        };
        let (count, n) = varint::decode(&self.0[1..])?;
        Some((width, count as usize, 1 + n))
    }

    pub fn count(&self) -> usize {
        self.header().map_or(0, |(_, count, _)| count)
    }

    fn offset(&self, width: usize, offsets_at: usize, i: usize) -> usize {
        let at = offsets_at + i * width;
        let b = &self.0[at..at + width];
        match width {
            1 => b[0] as usize,
            2 => u16::from_le_bytes([b[0], b[1]]) as usize,
            _ => u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize,
        }
    }

    /// The packed bytes of field `i`; empty for missing fields.
    pub fn field(&self, i: usize) -> &[u8] {
        match self.header() {
            Some((width, count, offsets_at)) if i < count => {
                let end = self.offset(width, offsets_at, i);
                let start = if i == 0 {
                    offsets_at + count * width
                } else {
                    self.offset(width, offsets_at, i - 1)
                };
                &self.0[start..end]
            }
            _ => &[],
        }
    }

    pub fn value(&self, i: usize) -> Result<Value> {
        pack::unpack(self.field(i))
    }

    /// Field-by-field comparison on packed bytes, which equals comparison
    /// of the original values column by column.
    pub fn compare(&self, other: &Record) -> Ordering {
        let n = self.count().max(other.count());
        for i in 0..n {
            let c = self.field(i).cmp(other.field(i));
            if c != Ordering::Equal {
                return c;
            }
        }
        Ordering::Equal
    }

    /// Parses the length of the record starting at `buf`, without
    /// touching the field data.
    pub fn length_at(buf: &[u8]) -> Result<usize> {
        let flag = *buf.first().ok_or_else(|| corrupt("empty record"))?;
        let width = match flag {
            FLAG_W1 => 1usize,
            FLAG_W2 => 2,
            FLAG_W4 => 4,
            f => return Err(corrupt(format!("bad record flag {:#04x}", f))),
        };
        let (count, n) =
            varint::decode(buf.get(1..).unwrap_or(&[])).ok_or_else(|| corrupt("bad record count"))?;
        let count = count as usize;
        let offsets_at = 1 + n;
        if count == 0 {
            return Ok(offsets_at);
        }
        let at = offsets_at + (count - 1) * width;
        let b = buf
            .get(at..at + width)
            .ok_or_else(|| corrupt("truncated record header"))?;
        Ok(match width {
            1 => b[0] as usize,
            2 => u16::from_le_bytes([b[0], b[1]]) as usize,
            _ => u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize,
        })
    }

    /// Appends this record plus its checksum to the store.
    pub fn write_to(&self, store: &Store) -> Offset {
        let (off, buf) = store.alloc(self.0.len() + cksum::LEN);
        buf[..self.0.len()].copy_from_slice(&self.0);
        cksum::update(buf);
        off
    }

    /// Reads the record at `off` without checksum verification.
    pub fn read(store: &Store, off: Offset) -> Result<Record> {
        let data = store.data(off);
        let len = Record::length_at(data)?;
        if len > data.len() {
            return Err(corrupt("record overruns chunk"));
        }
        Ok(Record(Arc::from(&data[..len])))
    }

    /// Reads and checksum-verifies the record at `off`.
    pub fn read_ck(store: &Store, off: Offset) -> Result<Record> {
        let data = store.data(off);
        let len = Record::length_at(data)?;
        if len + cksum::LEN > data.len() {
            return Err(corrupt("record overruns chunk"));
        }
        cksum::check(&data[..len + cksum::LEN])?;
        Ok(Record(Arc::from(&data[..len])))
    }
}

#[derive(Default)]
pub struct RecordBuilder {
    fields: Vec<Vec<u8>>,
}

impl RecordBuilder {
    pub fn new() -> RecordBuilder {
        RecordBuilder::default()
    }

    pub fn add(&mut self, v: &Value) -> &mut Self {
        self.fields.push(pack::packed(v));
        self
    }

    /// Adds an already-packed field.
    pub fn add_raw(&mut self, packed: &[u8]) -> &mut Self {
        self.fields.push(packed.to_vec());
        self
    }

    pub fn build(&mut self) -> Record {
        let count = self.fields.len();
        let data_len: usize = self.fields.iter().map(Vec::len).sum();
        let base = 1 + varint::len(count as u64);
        let (flag, width) = [(FLAG_W1, 1usize), (FLAG_W2, 2), (FLAG_W4, 4)]
            .into_iter()
            .find(|&(_, w)| {
                let total = base + count * w + data_len;
                total <= [0, 0xFF, 0xFFFF, 0, 0xFFFF_FFFF][w]
            })
            .expect("record exceeds 4GB");

        let header = base + count * width;
        let mut buf = Vec::with_capacity(header + data_len);
        buf.push(flag);
        varint::encode(count as u64, &mut buf);
        let mut end = header;
        for f in &self.fields {
            end += f.len();
            match width {
                1 => buf.push(end as u8),
                2 => buf.extend_from_slice(&(end as u16).to_le_bytes()),
                _ => buf.extend_from_slice(&(end as u32).to_le_bytes()),
            }
        }
        for f in &self.fields {
            buf.extend_from_slice(f);
        }
        self.fields.clear();
        Record(Arc::from(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(vals: &[Value]) -> Record {
        let mut rb = RecordBuilder::new();
        for v in vals {
            rb.add(v);
        }
        rb.build()
    }

    #[test]
    fn round_trip_fields() {
        let r = rec(&[Value::Int(42), Value::str("hello"), Value::Bool(true)]);
        assert_eq!(r.count(), 3);
        assert_eq!(r.value(0).unwrap(), Value::Int(42));
        assert_eq!(r.value(1).unwrap(), Value::str("hello"));
        assert_eq!(r.value(2).unwrap(), Value::Bool(true));
        assert_eq!(r.value(3).unwrap(), Value::str("")); // missing
    }

    #[test]
    fn length_at_matches() {
        let r = rec(&[Value::str("abc"), Value::Int(1)]);
        assert_eq!(Record::length_at(r.bytes()).unwrap(), r.len());
    }

    #[test]
    fn empty_record() {
        let r = Record::empty();
        assert_eq!(r.count(), 0);
        assert_eq!(Record::length_at(r.bytes()).unwrap(), r.len());
    }

    #[test]
    fn wide_record_uses_bigger_offsets() {
        let big = "x".repeat(5000);
        let r = rec(&[Value::str(&big)]);
        assert_eq!(r.value(0).unwrap(), Value::str(&big));
        assert!(r.len() > 5000);
    }

    #[test]
    fn compare_is_columnwise() {
        let a = rec(&[Value::str("a"), Value::Int(2)]);
        let b = rec(&[Value::str("a"), Value::Int(10)]);
        assert_eq!(a.compare(&b), Ordering::Less);
        // raw concatenation would say "a2" vs "a10" -> Greater; columns say Less
    }

    #[test]
    fn store_round_trip_with_checksum() {
        let store = Store::heap(4096);
        let r = rec(&[Value::Int(7), Value::str("abc")]);
        let off = r.write_to(&store);
        let back = Record::read_ck(&store, off).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn corrupt_record_is_refused() {
        let store = Store::heap(4096);
        let r = rec(&[Value::Int(7)]);
        let off = r.write_to(&store);
        store.write(off + 2, &[0xEE]);
        assert!(Record::read_ck(&store, off).is_err());
    }
}
