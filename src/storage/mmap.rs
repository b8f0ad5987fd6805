//! Memory-mapped file chunk source.
//!
//! Each chunk is its own mapping over `[chunk * chunksize, (chunk + 1) *
//! chunksize)`. Requesting a chunk extends the file to the chunk's end
//! first — mapping beyond end-of-file is undefined — so the file length
//! is always a whole number of chunks while the store is open. The
//! allocated size is tracked in the file header, not the file length;
//! `close` truncates the file back to the allocated size.
//!
//! All mappings are created read-write (`MAP_SHARED`), so writes through
//! the store persist via the OS page cache. `Chunk::flush` msyncs on
//! close for durability.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{Result, WrapErr};
use memmap2::MmapOptions;
use parking_lot::Mutex;

use super::{Chunk, ChunkSource, Store};

pub struct MmapSource {
    file: File,
    // file growth must be serialized with mapping; the store's grow lock
    // covers get(), this one covers close racing nothing
    len: Mutex<u64>,
}

impl MmapSource {
    /// Opens (or creates) the file and returns a store sized to its
    /// current length. The caller is responsible for header handling.
    pub fn open(path: &Path, chunksize: u64, create: bool) -> Result<Store> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(path)
            .wrap_err_with(|| format!("cannot open database file '{}'", path.display()))?;
        let len = file
            .metadata()
            .wrap_err("cannot stat database file")?
            .len();
        let source = MmapSource {
            file,
            len: Mutex::new(len),
        };
        Store::new(Box::new(source), chunksize, len)
    }
}

impl ChunkSource for MmapSource {
    fn get(&self, chunk: usize, chunksize: u64) -> Result<Chunk> {
        let end = (chunk as u64 + 1) * chunksize;
        {
            let mut len = self.len.lock();
            if *len < end {
                self.file
                    .set_len(end)
                    .wrap_err("cannot extend database file")?;
                *len = end;
            }
        }
        // SAFETY: the mapping is over our exclusively-opened database
        // file; the Chunk keeps it alive, and the store never unmaps a
        // chunk while borrows exist (storage module docs).
        let map = unsafe {
            MmapOptions::new()
                .offset(chunk as u64 * chunksize)
                .len(chunksize as usize)
                .map_mut(&self.file)
                .wrap_err("cannot map database chunk")?
        };
        Ok(Chunk::mmap(map))
    }

    fn close(&self, size: u64) {
        // shrink the chunk-rounded file back to the allocated size
        let _ = self.file.set_len(size);
        *self.len.lock() = size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::HEADER_SIZE;

    #[test]
    fn create_write_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.edb");

        let store = MmapSource::open(&path, 1024, true).unwrap();
        assert_eq!(store.size(), 0);
        let (off, buf) = store.alloc(HEADER_SIZE as usize + 8);
        assert_eq!(off, 0);
        buf[HEADER_SIZE as usize..].copy_from_slice(b"persists");
        let size = store.size();
        store.close();

        let store = MmapSource::open(&path, 1024, false).unwrap();
        assert_eq!(store.size(), size);
        assert_eq!(&store.data(HEADER_SIZE)[..8], b"persists");
        store.close();
    }

    #[test]
    fn file_extends_by_chunks_then_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grow.edb");
        let store = MmapSource::open(&path, 1024, true).unwrap();
        store.alloc(100);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1024);
        store.alloc(1000); // next chunk
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 2048);
        let size = store.size();
        store.close();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), size);
    }
}
