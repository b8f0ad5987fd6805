//! In-memory chunk source, for tests and for the transient side heaps
//! built by temp indexes. Chunks are zeroed heap blocks; close is a no-op.

use eyre::Result;

use super::{Chunk, ChunkSource};

pub struct HeapSource;

impl ChunkSource for HeapSource {
    fn get(&self, _chunk: usize, chunksize: u64) -> Result<Chunk> {
        Ok(Chunk::heap(vec![0u8; chunksize as usize].into_boxed_slice()))
    }

    fn close(&self, _size: u64) {}
}
