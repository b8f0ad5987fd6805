//! # Database State
//!
//! [`DbState`] is an immutable snapshot of the whole database: the meta
//! (and through it every index overlay). The holder keeps the current
//! snapshot behind an atomically swappable pointer; readers grab it with
//! one acquire load and keep reading that snapshot forever, writers go
//! through `update` which shallow-copies, applies a mutation, and swaps
//! — serialized by the holder's mutex so only one update runs at a time.
//!
//! ## State roots
//!
//! A state root is the on-disk anchor of a committed snapshot:
//!
//! ```text
//! magic1(8) || unix-time(8 BE) || meta offsets (NOFFSETS × 5) || cksum(4) || magic2(8)
//! ```
//!
//! The checksum covers everything before it, `magic1` included. Repair
//! scans backward for `magic1` candidates and validates each, so the
//! magic numbers are chosen to never appear in packed data.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use eyre::Result;
use parking_lot::{Mutex, RwLock};

use crate::cksum;
use crate::errors::corrupt;
use crate::meta::{Meta, NOFFSETS};
use crate::storage::{self, Offset, Store};

pub const MAGIC1: &[u8; 8] = b"\x01\x23\x45\x67\x89\xab\xcd\xef";
pub const MAGIC2: &[u8; 8] = b"\xfe\xdc\xba\x98\x76\x54\x32\x10";
const DATE_SIZE: usize = 8;
pub const STATE_LEN: usize =
    MAGIC1.len() + DATE_SIZE + NOFFSETS * storage::SMALL_OFFSET_LEN + cksum::LEN + MAGIC2.len();
const MAGIC2_AT: usize = STATE_LEN - MAGIC2.len();

#[derive(Clone)]
pub struct DbState {
    pub meta: Arc<Meta>,
}

pub struct StateHolder {
    state: RwLock<Arc<DbState>>,
    mutex: Mutex<()>,
}

impl StateHolder {
    pub fn new(state: DbState) -> StateHolder {
        StateHolder {
            state: RwLock::new(Arc::new(state)),
            mutex: Mutex::new(()),
        }
    }

    /// The current snapshot. Read-only; to change it use `update`.
    pub fn get(&self) -> Arc<DbState> {
        Arc::clone(&self.state.read())
    }

    /// Applies `f` to a shallow copy of the current state and swaps the
    /// result in. `f` must copy any nested container before mutating it.
    pub fn update(&self, f: impl FnOnce(&mut DbState)) -> Arc<DbState> {
        let _guard = self.mutex.lock();
        let mut new_state = (**self.state.read()).clone();
        f(&mut new_state);
        let new_state = Arc::new(new_state);
        *self.state.write() = Arc::clone(&new_state);
        new_state
    }
}

/// Appends a state root anchoring the given meta offsets.
pub fn write_state(store: &Store, offsets: [Offset; NOFFSETS]) -> Offset {
    let (state_off, buf) = store.alloc(STATE_LEN);
    buf[..MAGIC1.len()].copy_from_slice(MAGIC1);
    let mut i = MAGIC1.len();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    buf[i..i + DATE_SIZE].copy_from_slice(&t.to_be_bytes());
    i += DATE_SIZE;
    for off in offsets {
        storage::write_small_offset(&mut buf[i..], off);
        i += storage::SMALL_OFFSET_LEN;
    }
    i += cksum::LEN;
    cksum::update(&mut buf[..i]);
    buf[i..].copy_from_slice(MAGIC2);
    debug_assert_eq!(i + MAGIC2.len(), STATE_LEN);
    state_off
}

/// Reads and validates the state root at `off`, returning the meta
/// offsets and the unix time it was written.
pub fn read_state(store: &Store, off: Offset) -> Result<([Offset; NOFFSETS], u64)> {
    let data = store.data(off);
    if data.len() < STATE_LEN {
        return Err(corrupt("state root overruns chunk"));
    }
    let buf = &data[..STATE_LEN];
    if &buf[..MAGIC1.len()] != MAGIC1 {
        return Err(corrupt("bad state root magic"));
    }
    if &buf[MAGIC2_AT..] != MAGIC2 {
        return Err(corrupt("bad state root trailing magic"));
    }
    cksum::check(&buf[..MAGIC2_AT])?;
    let mut i = MAGIC1.len();
    let t = u64::from_be_bytes(buf[i..i + DATE_SIZE].try_into().unwrap());
    i += DATE_SIZE;
    let mut offsets = [0u64; NOFFSETS];
    for off in &mut offsets {
        *off = storage::read_small_offset(&buf[i..]);
        i += storage::SMALL_OFFSET_LEN;
    }
    Ok((offsets, t))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trip() {
        let store = Store::heap(4096);
        store.alloc(8);
        let offsets = [123u64, 456];
        let off = write_state(&store, offsets);
        let (back, t) = read_state(&store, off).unwrap();
        assert_eq!(back, offsets);
        assert!(t > 0);
    }

    #[test]
    fn tampered_state_is_refused() {
        let store = Store::heap(4096);
        let off = write_state(&store, [1, 2]);
        store.write(off + MAGIC1.len() as u64 + 2, &[0x55]);
        assert!(read_state(&store, off).is_err());
    }

    #[test]
    fn holder_swap_is_shallow_copy() {
        let holder = StateHolder::new(DbState {
            meta: Arc::new(Meta::default()),
        });
        let before = holder.get();
        let after = holder.update(|st| {
            let mut meta = (*st.meta).clone();
            meta.views.insert("v".into(), "def".into());
            st.meta = Arc::new(meta);
        });
        assert!(before.meta.views.is_empty()); // old snapshot untouched
        assert_eq!(after.meta.get_view("v"), Some("def"));
        assert_eq!(holder.get().meta.get_view("v"), Some("def"));
    }
}
