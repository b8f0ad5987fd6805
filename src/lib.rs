//! # EmberDB - Embedded Relational Database Engine
//!
//! EmberDB is a single-node relational database for dynamically-typed
//! records: append-only memory-mapped storage, immutable B-tree indexes
//! overlaid by in-memory deltas, snapshot-isolation MVCC, and a
//! cost-based relational query planner.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │      Query Algebra (plan / optimize /       │
//! │        execute relational operators)        │
//! ├─────────────────────────────────────────────┤
//! │   Transactions (snapshot reads, validated   │
//! │         serial commits, conflict check)     │
//! ├──────────────────────┬──────────────────────┤
//! │  Meta (schema+info,  │  DbState holder      │
//! │  views, overlays)    │  (atomic swap)       │
//! ├──────────────────────┴──────────────────────┤
//! │  Index: fbtree (frozen, on disk) + mbtree   │
//! │  (delta, in memory) merged by Overlay       │
//! ├─────────────────────────────────────────────┤
//! │  Record codec (packed values, checksums)    │
//! ├─────────────────────────────────────────────┤
//! │  Store: chunked, append-only, mmap-backed,  │
//! │  CAS bump allocation                        │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Write path
//!
//! An update transaction appends record bytes immediately but stages
//! index changes in private in-memory delta trees. Commit validates
//! against concurrently committed transactions (read/write and
//! write/write intersection) under a serial commit mutex, then pushes
//! the deltas as new overlay layers in one atomic state swap. A
//! background merger squashes accumulated layers, and a background
//! persister folds them into new frozen trees and appends a
//! checksummed state root — so the committed on-disk state always
//! references only fully written, checksum-valid trees.
//!
//! ## Read path
//!
//! A read transaction is one atomic load of the current state pointer.
//! Everything it sees — meta, overlays, frozen trees, records — is
//! immutable, so readers never block and are never blocked.
//!
//! ## Module Overview
//!
//! - [`storage`]: chunked append-only store (mmap or heap chunks)
//! - [`encoding`]: order-preserving value packing, index keys, varints
//! - [`record`]: self-describing packed record codec
//! - [`index`]: frozen B-trees, delta trees, overlays
//! - [`meta`]: schema + info catalog, views
//! - [`state`]: DbState holder and on-disk state roots
//! - [`tran`]: MVCC transactions
//! - [`query`]: relational operators, planner, executor
//! - [`concur`]: background merger and persister
//! - [`repair`] / [`tools`]: crash recovery, compact, dump/load

pub mod cksum;
pub mod concur;
pub mod config;
pub mod database;
pub mod encoding;
pub mod errors;
pub mod index;
pub mod meta;
pub mod query;
pub mod record;
pub mod repair;
pub mod sortlist;
pub mod state;
pub mod storage;
pub mod tools;
pub mod tran;
pub mod value;

pub use database::{compact, Database};
pub use errors::Error;
pub use query::{setup_query, Dir, Mode, Thread};
pub use record::{Record, RecordBuilder};
pub use tran::{QueryTran, ReadTran, UpdateTran};
pub use value::Value;
