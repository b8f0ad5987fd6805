//! # Chunked Append-Only Storage
//!
//! Persistent, byte-addressed storage with lock-free concurrent
//! allocation. Storage is divided into fixed power-of-two chunks; an
//! allocation never straddles a chunk boundary (the unused tail of a
//! chunk is simply wasted). Offsets are stable for the life of the file:
//! nothing is ever moved or rewritten except by full compaction.
//!
//! ## Allocation
//!
//! `alloc` is a compare-and-swap bump of the `size` counter:
//!
//! 1. read `size`, compute the tentative end of the allocation
//! 2. if the allocation would straddle a chunk, advance to the next
//!    chunk's start and recompute
//! 3. publish with a CAS on `size`; on loss, retry
//!
//! Only materializing a new chunk takes a mutex, and the 3/4-of-chunk
//! threshold maps the *next* chunk ahead of need so allocations almost
//! never wait on it.
//!
//! ## Reading
//!
//! `data(offset)` returns a slice from the offset to the end of its
//! chunk; callers know their own length (records are self-describing).
//! Existing chunks are all mapped at open so reads never lock.
//!
//! ## File layout
//!
//! ```text
//! +--------------------------+-----------------+
//! | header (64 bytes)        | body (chunks)   |
//! +--------------------------+-----------------+
//! header: magic(8) || size (5-byte SmallOffset) || zero padding
//! ```
//!
//! The file itself is always extended to a chunk boundary; the allocated
//! size lives in the header's size slot, rewritten on clean close and by
//! repair. Offsets are stored on disk as 5-byte "small offsets" (1 TB
//! address space).
//!
//! ## Safety
//!
//! Chunk memory (heap blocks or mmap regions) is allocated once and
//! never moved or freed until the store is dropped, so raw-pointer
//! slices into it remain valid for the borrow of `&self` that produced
//! them. Concurrent `alloc` calls hand out non-overlapping ranges
//! (guaranteed by the CAS), so the mutable slices never alias.

mod heap;
mod mmap;

use std::sync::atomic::{AtomicU64, Ordering};

use eyre::Result;
use parking_lot::{Mutex, RwLock};

pub use heap::HeapSource;
pub use mmap::MmapSource;

pub type Offset = u64;

pub const SMALL_OFFSET_LEN: usize = 5;

/// File header: magic, then the allocated size as a small offset,
/// zero-padded to 64 bytes.
pub const MAGIC: &[u8; 8] = b"embr\x01db\x01";
pub const HEADER_SIZE: u64 = 64;

const CLOSED: u64 = u64::MAX;

pub fn write_small_offset(buf: &mut [u8], off: Offset) {
    debug_assert!(off < 1 << 40);
    buf[0] = (off >> 32) as u8;
    buf[1..5].copy_from_slice(&(off as u32).to_be_bytes());
}

pub fn read_small_offset(buf: &[u8]) -> Offset {
    ((buf[0] as u64) << 32) | u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as u64
}

/// One chunk of backing memory. The raw pointer is captured at creation
/// while we hold exclusive access; the owner keeps the memory alive and
/// pinned.
pub(crate) struct Chunk {
    ptr: *mut u8,
    _owner: ChunkOwner,
}

enum ChunkOwner {
    Heap(#[allow(dead_code)] Box<[u8]>),
    Mmap(#[allow(dead_code)] memmap2::MmapMut),
}

impl Chunk {
    pub(crate) fn heap(mut buf: Box<[u8]>) -> Chunk {
        let ptr = buf.as_mut_ptr();
        Chunk {
            ptr,
            _owner: ChunkOwner::Heap(buf),
        }
    }

    pub(crate) fn mmap(mut map: memmap2::MmapMut) -> Chunk {
        let ptr = map.as_mut_ptr();
        Chunk {
            ptr,
            _owner: ChunkOwner::Mmap(map),
        }
    }

    fn flush(&self) {
        if let ChunkOwner::Mmap(m) = &self._owner {
            let _ = m.flush();
        }
    }
}

// SAFETY: the pointer targets heap or mmap memory owned by this Chunk;
// all concurrent access is to disjoint ranges (see module docs).
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

/// Source of chunk memory: a real file (mmap) or transient heap blocks.
pub(crate) trait ChunkSource: Send + Sync {
    fn get(&self, chunk: usize, chunksize: u64) -> Result<Chunk>;
    /// Final size is recorded by truncating the backing file; heap
    /// sources ignore it.
    fn close(&self, size: u64);
}

pub struct Store {
    source: Box<dyn ChunkSource>,
    chunksize: u64,
    shift: u32,
    threshold: u64,
    size: AtomicU64,
    chunks: RwLock<Vec<Chunk>>,
    grow_lock: Mutex<()>,
}

impl Store {
    pub(crate) fn new(source: Box<dyn ChunkSource>, chunksize: u64, size: u64) -> Result<Store> {
        assert!(chunksize.is_power_of_two(), "chunk size must be a power of two");
        let store = Store {
            source,
            chunksize,
            shift: chunksize.trailing_zeros(),
            threshold: chunksize / 4 * 3,
            size: AtomicU64::new(size),
            chunks: RwLock::new(Vec::new()),
            grow_lock: Mutex::new(()),
        };
        // existing chunks must all be mapped up front: lazy mapping on
        // the read path would require locking every read
        let nchunks = (store.offset_to_chunk(size + chunksize - 1)).max(1);
        {
            let mut chunks = store.chunks.write();
            for c in 0..nchunks {
                chunks.push(store.source.get(c, chunksize)?);
            }
        }
        Ok(store)
    }

    /// A transient in-memory store, used by tests and temp-index heaps.
    pub fn heap(chunksize: u64) -> Store {
        Store::new(Box::new(HeapSource), chunksize, 0).expect("heap chunks are infallible")
    }

    fn offset_to_chunk(&self, off: Offset) -> usize {
        (off >> self.shift) as usize
    }

    fn chunk_to_offset(&self, chunk: usize) -> Offset {
        (chunk as u64) << self.shift
    }

    /// Allocates `n` bytes, returning the offset and the writable slice.
    /// Lock-free except when a new chunk must be materialized.
    pub fn alloc(&self, n: usize) -> (Offset, &mut [u8]) {
        assert!(0 < n && n as u64 <= self.chunksize, "alloc of {} bytes", n);
        loop {
            let oldsize = self.size.load(Ordering::Acquire);
            assert_ne!(oldsize, CLOSED, "Store: alloc after close");
            let mut offset = oldsize;
            let mut newsize = offset + n as u64;
            let chunk = self.offset_to_chunk(newsize);
            let nchunks = self.offset_to_chunk(oldsize + self.chunksize - 1);
            if chunk >= nchunks {
                // would straddle: skip to the start of the next chunk
                if chunk >= self.chunks.read().len() {
                    self.get_chunk(chunk);
                }
                offset = self.chunk_to_offset(chunk);
                newsize = offset + n as u64;
            }
            if self
                .size
                .compare_exchange(oldsize, newsize, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // proactively materialize the next chunk past the threshold
                let i = offset & (self.chunksize - 1);
                if i <= self.threshold && i + n as u64 > self.threshold {
                    self.get_chunk(self.offset_to_chunk(offset) + 1);
                }
                return (offset, self.data_mut(offset, n));
            }
            // another thread won the CAS; retry
        }
    }

    fn get_chunk(&self, chunk: usize) {
        let _guard = self.grow_lock.lock(); // serializes mapping, not allocation
        let mut chunks = self.chunks.write();
        while chunk >= chunks.len() {
            let next = chunks.len();
            match self.source.get(next, self.chunksize) {
                Ok(c) => chunks.push(c),
                Err(e) => panic!("Store: cannot grow to chunk {}: {}", next, e),
            }
        }
    }

    /// A read slice from `offset` to the end of its chunk. The caller
    /// knows the length of what it wrote there.
    pub fn data(&self, offset: Offset) -> &[u8] {
        let chunk = self.offset_to_chunk(offset);
        let i = (offset & (self.chunksize - 1)) as usize;
        let chunks = self.chunks.read();
        let ptr = chunks[chunk].ptr;
        // SAFETY: chunk memory is pinned for the life of the store and
        // the returned borrow is tied to &self (module docs).
        unsafe { std::slice::from_raw_parts(ptr.add(i), self.chunksize as usize - i) }
    }

    #[allow(clippy::mut_from_ref)]
    fn data_mut(&self, offset: Offset, n: usize) -> &mut [u8] {
        let chunk = self.offset_to_chunk(offset);
        let i = (offset & (self.chunksize - 1)) as usize;
        let chunks = self.chunks.read();
        let ptr = chunks[chunk].ptr;
        debug_assert!(i + n <= self.chunksize as usize);
        // SAFETY: alloc's CAS guarantees disjoint ranges; write() is only
        // used for the header slot, never inside a live allocation.
        unsafe { std::slice::from_raw_parts_mut(ptr.add(i), n) }
    }

    /// Overwrites bytes in place. Used for the file header's size slot.
    pub fn write(&self, offset: Offset, data: &[u8]) {
        self.data_mut(offset, data.len()).copy_from_slice(data);
    }

    /// Current allocated size (the high-water mark, not the file length).
    pub fn size(&self) -> u64 {
        let size = self.size.load(Ordering::Acquire);
        assert_ne!(size, CLOSED, "Store: size after close");
        size
    }

    pub(crate) fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Release);
    }

    /// Searches forward from `off` for `pattern`, returning its offset or 0.
    pub fn first_offset(&self, off: Offset, pattern: &[u8]) -> Offset {
        let size = self.size();
        let chunks = self.chunks.read();
        let mut c = self.offset_to_chunk(off);
        let mut start = (off & (self.chunksize - 1)) as usize;
        while c < chunks.len() {
            let limit = (size.saturating_sub(self.chunk_to_offset(c))).min(self.chunksize) as usize;
            let buf =
                unsafe { std::slice::from_raw_parts(chunks[c].ptr, self.chunksize as usize) };
            if let Some(i) = find(&buf[..limit], pattern, start) {
                return self.chunk_to_offset(c) + i as u64;
            }
            start = 0;
            c += 1;
        }
        0
    }

    /// Searches backward from `off` (exclusive) for `pattern`. Used by
    /// the repair scan.
    pub fn last_offset(&self, off: Offset, pattern: &[u8]) -> Offset {
        let chunks = self.chunks.read();
        let mut c = self.offset_to_chunk(off) as isize;
        if c as usize >= chunks.len() {
            c = chunks.len() as isize - 1;
        }
        let mut end = (off & (self.chunksize - 1)) as usize;
        if self.offset_to_chunk(off) != c as usize {
            end = self.chunksize as usize;
        }
        while c >= 0 {
            let buf = unsafe {
                std::slice::from_raw_parts(chunks[c as usize].ptr, self.chunksize as usize)
            };
            if let Some(i) = rfind(&buf[..end], pattern) {
                return self.chunk_to_offset(c as usize) + i as u64;
            }
            end = self.chunksize as usize;
            c -= 1;
        }
        0
    }

    /// Flushes mapped chunks and records the final size. Any later
    /// `alloc` or `size` is a fatal error.
    pub fn close(&self) {
        let size = self.size.swap(CLOSED, Ordering::AcqRel);
        if size != CLOSED {
            for chunk in self.chunks.read().iter() {
                chunk.flush();
            }
            self.source.close(size);
        }
    }
}

fn find(buf: &[u8], pattern: &[u8], from: usize) -> Option<usize> {
    if pattern.is_empty() || buf.len() < pattern.len() {
        return None;
    }
    (from..=buf.len() - pattern.len()).find(|&i| &buf[i..i + pattern.len()] == pattern)
}

fn rfind(buf: &[u8], pattern: &[u8]) -> Option<usize> {
    if pattern.is_empty() || buf.len() < pattern.len() {
        return None;
    }
    (0..=buf.len() - pattern.len())
        .rev()
        .find(|&i| &buf[i..i + pattern.len()] == pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_read_back() {
        let store = Store::heap(1024);
        let (off1, buf) = store.alloc(4);
        buf.copy_from_slice(b"abcd");
        let (off2, buf) = store.alloc(3);
        buf.copy_from_slice(b"xyz");
        assert_eq!(&store.data(off1)[..4], b"abcd");
        assert_eq!(&store.data(off2)[..3], b"xyz");
        assert_eq!(store.size(), off2 + 3);
    }

    #[test]
    fn alloc_never_straddles_chunks() {
        let store = Store::heap(64);
        store.alloc(50);
        let (off, _) = store.alloc(30); // would straddle: skips to next chunk
        assert_eq!(off, 64);
        assert_eq!(store.size(), 94);
    }

    #[test]
    fn small_offset_round_trip() {
        let mut buf = [0u8; SMALL_OFFSET_LEN];
        for off in [0u64, 1, 0xFFFF_FFFF, (1 << 40) - 1] {
            write_small_offset(&mut buf, off);
            assert_eq!(read_small_offset(&buf), off);
        }
    }

    #[test]
    fn pattern_scans() {
        let store = Store::heap(64);
        let (off, buf) = store.alloc(8);
        buf.copy_from_slice(b"..MAGIC.");
        store.alloc(60); // force a second chunk
        let (off2, buf) = store.alloc(8);
        buf.copy_from_slice(b"..MAGIC.");
        assert_eq!(store.first_offset(0, b"MAGIC"), off + 2);
        assert_eq!(store.last_offset(store.size(), b"MAGIC"), off2 + 2);
        assert_eq!(store.first_offset(0, b"NOPE"), 0);
    }

    #[test]
    fn concurrent_allocs_are_disjoint() {
        use std::sync::Arc;
        let store = Arc::new(Store::heap(4096));
        let initial = store.size();
        let mut handles = Vec::new();
        for t in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                let mut offs = Vec::new();
                for i in 0..500 {
                    let n = 1 + (t + i) % 40;
                    let (off, buf) = store.alloc(n);
                    buf.fill(t as u8);
                    offs.push((off, n as u64));
                }
                offs
            }));
        }
        let mut ranges: Vec<(u64, u64)> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ranges.sort();
        let mut used = 0;
        for w in ranges.windows(2) {
            assert!(w[0].0 + w[0].1 <= w[1].0, "overlap: {:?} vs {:?}", w[0], w[1]);
        }
        for &(_, n) in &ranges {
            used += n;
        }
        // every allocated byte is inside [initial, size), minus chunk padding
        assert!(initial + used <= store.size());
    }
}
