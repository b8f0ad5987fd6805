//! # Repair
//!
//! Recovers a database whose tail was torn off by a crash. State roots
//! are interleaved through the body of the file, each one anchoring a
//! complete, checksummed snapshot — so recovery is a backward scan:
//!
//! 1. search backward from end-of-file for a `magic1` candidate
//! 2. validate the candidate's checksum and magics
//! 3. load its meta and `check` every table's every index (node
//!    checksums, key order, and the primary index's record checksums)
//! 4. the first fully valid state wins
//!
//! The winning prefix is copied to a temp file, the header's size slot
//! is rewritten to point at the chosen state, the original is renamed
//! `.bak`, and the temp file takes its place.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use eyre::{Result, WrapErr};
use tracing::{info, warn};

use crate::config::CHUNK_SIZE;
use crate::errors::corrupt;
use crate::meta::Meta;
use crate::record::Record;
use crate::state::{self, MAGIC1, STATE_LEN};
use crate::storage::{self, MmapSource, Store, HEADER_SIZE, MAGIC};

/// Scans backward for the last intact state and truncates the file to
/// it. Returns the recovered size. The original file is kept as `.bak`.
pub fn repair(path: impl AsRef<Path>) -> Result<u64> {
    let path = path.as_ref();
    let store = Arc::new(MmapSource::open(path, CHUNK_SIZE, false)?);
    let mut off = store.size();
    let state_off = loop {
        off = store.last_offset(off, MAGIC1);
        if off == 0 {
            return Err(corrupt("repair failed: no valid state found"));
        }
        match check_state(&store, off) {
            Ok(()) => break off,
            Err(e) => {
                warn!(off, error = %e, "rejected state candidate");
                continue;
            }
        }
    };
    store.close();

    let good = state_off + STATE_LEN as u64;
    let tmp = path.with_extension("tmp");
    copy_prefix(path, &tmp, good).wrap_err("repair: copying good prefix")?;

    let bak = path.with_extension("bak");
    let _ = fs::remove_file(&bak);
    fs::rename(path, &bak).wrap_err("repair: keeping .bak")?;
    fs::rename(&tmp, path).wrap_err("repair: installing repaired file")?;
    info!(path = %path.display(), size = good, "repaired database");
    Ok(good)
}

fn check_state(store: &Arc<Store>, off: u64) -> Result<()> {
    let (offsets, _time) = state::read_state(store, off)?;
    // meta offsets must point inside the part of the file we trust
    for o in offsets {
        if o >= off {
            return Err(corrupt("state references data past itself"));
        }
    }
    let meta = Meta::read(store, offsets)?;
    for tm in meta.tables.values() {
        for (iix, ov) in tm.indexes.iter().enumerate() {
            let mut rec_err: Option<eyre::Report> = None;
            let count = ov.fb.check(&mut |rec_off| {
                if iix == 0 && rec_err.is_none() {
                    if let Err(e) = Record::read_ck(store, rec_off) {
                        rec_err = Some(e);
                    }
                }
            })?;
            if let Some(e) = rec_err {
                return Err(e);
            }
            if iix == 0 && count != tm.info.nrows {
                return Err(corrupt(format!(
                    "{}: index count {} != info nrows {}",
                    tm.schema.table, count, tm.info.nrows
                )));
            }
        }
    }
    Ok(())
}

fn copy_prefix(src: &Path, dst: &Path, len: u64) -> Result<()> {
    let mut from = fs::File::open(src)?;
    let mut to = fs::File::create(dst)?;
    let mut remaining = len;
    let mut buf = vec![0u8; 1 << 20];
    while remaining > 0 {
        let n = buf.len().min(remaining as usize);
        from.read_exact(&mut buf[..n])?;
        to.write_all(&buf[..n])?;
        remaining -= n as u64;
    }
    // point the header's size slot at the recovered state
    let mut slot = [0u8; storage::SMALL_OFFSET_LEN];
    storage::write_small_offset(&mut slot, len);
    to.seek(SeekFrom::Start(MAGIC.len() as u64))?;
    to.write_all(&slot)?;
    to.flush()?;
    debug_assert!(len >= HEADER_SIZE);
    Ok(())
}
