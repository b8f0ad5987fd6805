//! # B-Tree Node Encoding
//!
//! Inner and leaf nodes share one packed layout:
//!
//! ```text
//! +----------+------------+------------+-----------------------+----------+
//! | level(1) | len(2 LE)  | count(2 LE)| entries…              | cksum(4) |
//! +----------+------------+------------+-----------------------+----------+
//! entry: npre(varint) || suffix_len(varint) || suffix || offset(5)
//! ```
//!
//! `level` is 0 for leaves. Each entry's key is stored as the suffix after
//! the shared prefix (`npre` bytes) with the *preceding* entry's key, so a
//! run of similar keys costs a few bytes each. Leaf entries carry the full
//! (reconstructable) key and the data offset; inner entries carry a
//! separator key and a child node offset. An inner node's first separator
//! is always empty: it covers everything below the second separator.
//!
//! Separators are truncated to the shortest prefix of the right sibling's
//! first key that still exceeds the left sibling's last key.
//!
//! `len` is the encoded size excluding the checksum, so a node can be
//! sliced out of chunk memory without scanning its entries.

use eyre::Result;

use crate::cksum;
use crate::encoding::varint;
use crate::errors::corrupt;
use crate::storage::{self, Offset, Store};

const NODE_HEADER: usize = 1 + 2 + 2;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    pub level: u8,
    pub entries: Vec<(Vec<u8>, u64)>,
}

impl Node {
    pub fn blank(level: u8) -> Node {
        Node {
            level,
            entries: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    /// Size of the encoded node, excluding the checksum.
    pub fn encoded_len(&self) -> usize {
        let mut n = NODE_HEADER;
        let mut prev: &[u8] = &[];
        for (key, _) in &self.entries {
            let npre = common_prefix(prev, key);
            let suffix = key.len() - npre;
            n += varint::len(npre as u64) + varint::len(suffix as u64) + suffix;
            n += storage::SMALL_OFFSET_LEN;
            prev = key;
        }
        n
    }

    pub fn encode(&self) -> Vec<u8> {
        let len = self.encoded_len();
        let mut buf = Vec::with_capacity(len + cksum::LEN);
        buf.push(self.level);
        buf.extend_from_slice(&(len as u16).to_le_bytes());
        buf.extend_from_slice(&(self.entries.len() as u16).to_le_bytes());
        let mut prev: &[u8] = &[];
        let mut off5 = [0u8; storage::SMALL_OFFSET_LEN];
        for (key, off) in &self.entries {
            let npre = common_prefix(prev, key);
            varint::encode(npre as u64, &mut buf);
            varint::encode((key.len() - npre) as u64, &mut buf);
            buf.extend_from_slice(&key[npre..]);
            storage::write_small_offset(&mut off5, *off);
            buf.extend_from_slice(&off5);
            prev = key;
        }
        debug_assert_eq!(buf.len(), len);
        buf.resize(len + cksum::LEN, 0);
        cksum::update(&mut buf);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Node> {
        if buf.len() < NODE_HEADER {
            return Err(corrupt("truncated btree node"));
        }
        let level = buf[0];
        let len = u16::from_le_bytes([buf[1], buf[2]]) as usize;
        let count = u16::from_le_bytes([buf[3], buf[4]]) as usize;
        if len > buf.len() {
            return Err(corrupt("btree node overruns chunk"));
        }
        let mut entries = Vec::with_capacity(count);
        let mut at = NODE_HEADER;
        let mut prev: Vec<u8> = Vec::new();
        for _ in 0..count {
            let (npre, n) =
                varint::decode(&buf[at..len]).ok_or_else(|| corrupt("bad node entry"))?;
            at += n;
            let (suffix, n) =
                varint::decode(&buf[at..len]).ok_or_else(|| corrupt("bad node entry"))?;
            at += n;
            let (npre, suffix) = (npre as usize, suffix as usize);
            if npre > prev.len() || at + suffix + storage::SMALL_OFFSET_LEN > len {
                return Err(corrupt("bad node entry bounds"));
            }
            let mut key = Vec::with_capacity(npre + suffix);
            key.extend_from_slice(&prev[..npre]);
            key.extend_from_slice(&buf[at..at + suffix]);
            at += suffix;
            let off = storage::read_small_offset(&buf[at..]);
            at += storage::SMALL_OFFSET_LEN;
            prev = key.clone();
            entries.push((key, off));
        }
        Ok(Node { level, entries })
    }

    /// Reads the node at `off` without checksum verification.
    pub fn read(store: &Store, off: Offset) -> Result<Node> {
        Node::decode(store.data(off))
    }

    /// Reads and checksum-verifies the node at `off`.
    pub fn read_ck(store: &Store, off: Offset) -> Result<Node> {
        let data = store.data(off);
        if data.len() < NODE_HEADER {
            return Err(corrupt("truncated btree node"));
        }
        let len = u16::from_le_bytes([data[1], data[2]]) as usize;
        if len + cksum::LEN > data.len() {
            return Err(corrupt("btree node overruns chunk"));
        }
        cksum::check(&data[..len + cksum::LEN])?;
        Node::decode(data)
    }

    pub fn write_to(&self, store: &Store) -> Offset {
        let buf = self.encode();
        let (off, dst) = store.alloc(buf.len());
        dst.copy_from_slice(&buf);
        off
    }

    /// Index of the child to follow for `key` in an inner node: the last
    /// entry whose separator is <= key.
    pub fn child_for(&self, key: &[u8]) -> usize {
        debug_assert!(!self.is_leaf() && !self.entries.is_empty());
        match self.entries.binary_search_by(|(sep, _)| sep.as_slice().cmp(key)) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        }
    }

    /// Position of `key` in a leaf: Ok(i) exact, Err(i) insertion point.
    pub fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|(k, _)| k.as_slice().cmp(key))
    }
}

pub fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// The shortest prefix of `right` that still sorts above `left`.
/// Requires `left < right`.
pub fn separator(left: &[u8], right: &[u8]) -> Vec<u8> {
    debug_assert!(left < right);
    let n = common_prefix(left, right);
    right[..(n + 1).min(right.len())].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(level: u8, keys: &[&[u8]]) -> Node {
        Node {
            level,
            entries: keys
                .iter()
                .enumerate()
                .map(|(i, k)| (k.to_vec(), i as u64 + 1))
                .collect(),
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let n = node(0, &[b"apple", b"applesauce", b"banana", b"bandana"]);
        let buf = n.encode();
        assert_eq!(Node::decode(&buf).unwrap(), n);
        assert_eq!(buf.len(), n.encoded_len() + cksum::LEN);
    }

    #[test]
    fn prefix_compression_shrinks_similar_keys() {
        let similar = node(0, &[b"prefix_aaa", b"prefix_bbb", b"prefix_ccc"]);
        let distinct = node(0, &[b"aaaaaaaaaa", b"bbbbbbbbbb", b"cccccccccc"]);
        assert!(similar.encoded_len() < distinct.encoded_len());
    }

    #[test]
    fn store_round_trip_and_checksum() {
        let store = Store::heap(4096);
        let n = node(1, &[b"", b"m", b"t"]);
        let off = n.write_to(&store);
        assert_eq!(Node::read_ck(&store, off).unwrap(), n);
        store.write(off + 6, &[0xAB]);
        assert!(Node::read_ck(&store, off).is_err());
    }

    #[test]
    fn child_for_picks_last_separator_at_or_below() {
        let n = node(1, &[b"", b"h", b"p"]);
        assert_eq!(n.child_for(b"a"), 0);
        assert_eq!(n.child_for(b"h"), 1);
        assert_eq!(n.child_for(b"hat"), 1);
        assert_eq!(n.child_for(b"z"), 2);
    }

    #[test]
    fn separator_is_shortest_discriminating_prefix() {
        assert_eq!(separator(b"apple", b"banana"), b"b".to_vec());
        assert_eq!(separator(b"hello", b"help"), b"help".to_vec());
        assert_eq!(separator(b"abc", b"abd"), b"abd".to_vec());
    }
}
