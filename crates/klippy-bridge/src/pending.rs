//! Table of in-flight requests awaiting a response from Klippy.
//!
//! Ids come from a counter that lives as long as the bridge, so an id is never
//! handed out twice even across reconnects. The table is bound to one
//! connection generation at a time: inserts for any other generation are
//! refused, and closing a generation fails every entry it still holds. That
//! keeps a request racing a teardown from being stranded in the table.

use std::{
    collections::HashMap,
    result::Result as StdResult,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::{
    sync::oneshot,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::{Error, Result};

/// One outstanding request.
struct PendingEntry {
    /// Endpoint name, kept for diagnostics and error messages.
    method: String,
    /// Resolves the waiting caller.
    slot: oneshot::Sender<Result<Value>>,
}

/// Mutable table state.
#[derive(Default)]
struct Table {
    /// Generation of the connection currently accepting requests.
    open: Option<u64>,
    /// Outstanding entries by id.
    entries: HashMap<u64, PendingEntry>,
}

/// Pending request table shared by every caller of the bridge.
pub(crate) struct PendingRequests {
    /// Next id to allocate.
    next_id: AtomicU64,
    /// Table guarded by a short-lived sync lock.
    table: Mutex<Table>,
}

impl PendingRequests {
    /// Empty table that accepts nothing until [`open`](Self::open).
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            table: Mutex::new(Table::default()),
        }
    }

    /// Start accepting requests for connection `generation`.
    pub(crate) fn open(&self, generation: u64) {
        let mut table = self.table.lock();
        table.open = Some(generation);
    }

    /// Allocate an id and a result slot for `method` on `generation`.
    pub(crate) fn insert(
        &self,
        generation: u64,
        method: &str,
    ) -> Result<(u64, oneshot::Receiver<Result<Value>>)> {
        let mut table = self.table.lock();
        if table.open != Some(generation) {
            return Err(Error::NotConnected);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (slot, rx) = oneshot::channel();
        table.entries.insert(
            id,
            PendingEntry {
                method: method.to_string(),
                slot,
            },
        );
        Ok((id, rx))
    }

    /// Resolve entry `id` with a decoded response. Returns `false` when no
    /// such entry exists; a second resolution is therefore a no-op.
    pub(crate) fn resolve(&self, id: u64, result: StdResult<Value, String>) -> bool {
        let Some(entry) = self.table.lock().entries.remove(&id) else {
            return false;
        };
        let result = result.map_err(|message| Error::Remote {
            method: entry.method.clone(),
            message,
        });
        if entry.slot.send(result).is_err() {
            debug!(id, method = %entry.method, "response arrived after caller went away");
        }
        true
    }

    /// Fail entry `id` without a response, e.g. when the frame never made it
    /// onto the socket.
    pub(crate) fn fail(&self, id: u64, err: Error) -> bool {
        let Some(entry) = self.table.lock().entries.remove(&id) else {
            return false;
        };
        entry.slot.send(Err(err)).ok();
        true
    }

    /// Stop accepting requests for `generation` and fail everything still
    /// outstanding with [`Error::Disconnected`]. Returns the number failed.
    pub(crate) fn close(&self, generation: u64) -> usize {
        let drained: Vec<PendingEntry> = {
            let mut table = self.table.lock();
            if table.open == Some(generation) {
                table.open = None;
            }
            table.entries.drain().map(|(_, e)| e).collect()
        };
        let count = drained.len();
        for entry in drained {
            entry.slot.send(Err(Error::Disconnected)).ok();
        }
        count
    }

    /// Number of outstanding requests.
    pub(crate) fn len(&self) -> usize {
        self.table.lock().entries.len()
    }
}

/// Wait for a response without ever timing out, logging how long `method`
/// has been outstanding every `log_every`.
pub(crate) async fn wait_for_response(
    id: u64,
    method: &str,
    mut rx: oneshot::Receiver<Result<Value>>,
    log_every: Duration,
) -> Result<Value> {
    let started = Instant::now();
    let mut ticker = time::interval_at(started + log_every, log_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            res = &mut rx => {
                // The sender is only dropped without a value if the table
                // itself goes away.
                return res.unwrap_or(Err(Error::Disconnected));
            }
            _ = ticker.tick() => {
                warn!(
                    id,
                    method,
                    elapsed_secs = started.elapsed().as_secs(),
                    "Klippy request still pending"
                );
            }
        }
    }
}
