//! # Background Merge and Persist
//!
//! Two long-lived worker threads keep the overlays shallow and the file
//! durable without ever blocking foreground work:
//!
//! - the **merger** wakes on commit notifications and squashes each
//!   overlay's accumulated delta layers into one
//! - the **persister** is poked by the merger every
//!   [`PERSIST_EVERY`](crate::config::PERSIST_EVERY) merged commits and
//!   folds the squashed layers into new frozen trees, appending a state
//!   root
//!
//! Work arrives over bounded channels; a full channel just coalesces
//! (the notification is a hint, not a queue of obligations). Shutdown is
//! cooperative: dropping the senders ends the receive loops, and `stop`
//! joins both threads.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, warn};

use crate::config::PERSIST_EVERY;
use crate::database::Database;

pub struct Background {
    merge_tx: Option<Sender<()>>,
    merger: Option<JoinHandle<()>>,
    persister: Option<JoinHandle<()>>,
}

impl Background {
    pub fn start(db: Arc<Database>) -> Background {
        let (merge_tx, merge_rx) = bounded::<()>(64);
        let (persist_tx, persist_rx) = bounded::<()>(1);

        let merger = {
            let db = Arc::clone(&db);
            std::thread::Builder::new()
                .name("merger".into())
                .spawn(move || merger_loop(db, merge_rx, persist_tx))
                .expect("spawn merger")
        };
        let persister = std::thread::Builder::new()
            .name("persister".into())
            .spawn(move || persister_loop(db, persist_rx))
            .expect("spawn persister");

        Background {
            merge_tx: Some(merge_tx),
            merger: Some(merger),
            persister: Some(persister),
        }
    }

    /// Called after every commit. Never blocks: a full channel means the
    /// merger is already behind and will pick the work up anyway.
    pub fn committed(&self) {
        if let Some(tx) = &self.merge_tx {
            match tx.try_send(()) {
                Ok(()) | Err(TrySendError::Full(())) => {}
                Err(TrySendError::Disconnected(())) => {}
            }
        }
    }

    /// Cooperative shutdown: closing the merge channel ends the merger,
    /// which closes the persist channel on its way out; then join both.
    pub fn stop(mut self) {
        self.merge_tx.take();
        if let Some(h) = self.merger.take() {
            let _ = h.join();
        }
        if let Some(h) = self.persister.take() {
            let _ = h.join();
        }
    }
}

fn merger_loop(db: Arc<Database>, rx: Receiver<()>, persist_tx: Sender<()>) {
    let mut since_persist = 0usize;
    while rx.recv().is_ok() {
        // drain coalesced notifications
        let mut n = 1;
        while rx.try_recv().is_ok() {
            n += 1;
        }
        db.merge();
        since_persist += n;
        if since_persist >= PERSIST_EVERY {
            since_persist = 0;
            match persist_tx.try_send(()) {
                Ok(()) | Err(TrySendError::Full(())) => {}
                Err(TrySendError::Disconnected(())) => break,
            }
        }
    }
    debug!("merger stopped");
}

fn persister_loop(db: Arc<Database>, rx: Receiver<()>) {
    while rx.recv().is_ok() {
        if let Err(e) = db.persist() {
            warn!(error = %e, "background persist failed");
        }
    }
    debug!("persister stopped");
}
