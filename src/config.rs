//! # Configuration Constants
//!
//! This module centralizes the tunable constants of the engine, grouping
//! interdependent values together so a change to one can be checked against
//! the values that depend on it.
//!
//! ```text
//! CHUNK_SIZE (64 MiB)
//!       │
//!       ├─> must be a power of two (Store shifts instead of dividing)
//!       │
//!       └─> upper bound for a single allocation; anything larger is a
//!           programming error (records and nodes are far smaller)
//!
//! NODE_LIMIT (1536 bytes)
//!       │
//!       └─> B-tree nodes split past this size; small nodes keep the
//!           sequential in-node scans cheap
//!
//! MAP_LIMIT (1,000,000 entries)
//!       │
//!       ├─> hard bound on a single in-memory delta tree; a transaction
//!       │   that exceeds it is aborted rather than exhausting memory
//!       │
//!       └─> also bounds hash aggregation (summarize-map)
//! ```

/// Chunk size for database file storage. Must be a power of two.
pub const CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Chunk size for transient in-memory heaps (temp-index side storage).
pub const HEAP_CHUNK_SIZE: u64 = 16 * 1024;

/// B-tree nodes are split when their encoding exceeds this many bytes.
pub const NODE_LIMIT: usize = 1536;

/// Maximum entries in one in-memory delta tree or one hash aggregation.
pub const MAP_LIMIT: usize = 1_000_000;

/// Maximum distinct values accumulated by the `list` aggregate.
pub const SUM_LIST_LIMIT: usize = 16_384;

/// Maximum total size of derived records buffered per row by a temp index.
pub const DERIVED_MAX_SIZE: usize = 8 * 1024;

/// Block size (in offsets) for the external sort used by temp indexes.
pub const SORT_BLOCK: usize = 4096;

/// Number of merged transactions that trigger a background persist.
pub const PERSIST_EVERY: usize = 64;
