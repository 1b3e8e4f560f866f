//! Per-txg write accounting.
//!
//! Tracks dirty bytes not yet written and writes not yet completed for each
//! txg, and keeps the first write error so `wait_synced` can report it.
//! A write is counted from the moment its record is handed to sync, even if
//! the block I/O itself is issued later after its children finish.

use dbc_error::{DbcError, Result};
use dbc_types::Txg;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use tracing::warn;

#[derive(Debug, Default)]
struct TxgState {
    dirty_bytes: u64,
    outstanding: u64,
    error: Option<DbcError>,
}

#[derive(Debug, Default)]
pub(crate) struct TxgWriteTracker {
    txgs: Mutex<BTreeMap<Txg, TxgState>>,
    settled: Condvar,
}

impl TxgWriteTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dirty(&self, txg: Txg, bytes: u64) {
        let mut txgs = self.txgs.lock();
        let state = txgs.entry(txg).or_default();
        state.dirty_bytes = state.dirty_bytes.saturating_add(bytes);
    }

    pub fn undirty(&self, txg: Txg, bytes: u64) {
        if let Some(state) = self.txgs.lock().get_mut(&txg) {
            state.dirty_bytes = state.dirty_bytes.saturating_sub(bytes);
        }
    }

    pub fn write_issued(&self, txg: Txg) {
        self.txgs.lock().entry(txg).or_default().outstanding += 1;
    }

    pub fn write_done(&self, txg: Txg, bytes: u64) {
        let mut txgs = self.txgs.lock();
        let Some(state) = txgs.get_mut(&txg) else {
            return;
        };
        state.dirty_bytes = state.dirty_bytes.saturating_sub(bytes);
        state.outstanding = state.outstanding.saturating_sub(1);
        if state.outstanding == 0 {
            self.settled.notify_all();
        }
    }

    pub fn record_error(&self, txg: Txg, error: &DbcError) {
        let mut txgs = self.txgs.lock();
        let state = txgs.entry(txg).or_default();
        warn!(target: "dbc::sync", txg = txg.0, error = %error, "txg_write_error");
        if state.error.is_none() {
            state.error = Some(error.clone());
        }
    }

    pub fn dirty_bytes(&self, txg: Txg) -> u64 {
        self.txgs.lock().get(&txg).map_or(0, |s| s.dirty_bytes)
    }

    pub fn outstanding(&self, txg: Txg) -> u64 {
        self.txgs.lock().get(&txg).map_or(0, |s| s.outstanding)
    }

    /// Wait for all counted writes of `txg`; consumes its recorded error.
    pub fn wait_synced(&self, txg: Txg) -> Result<()> {
        let mut txgs = self.txgs.lock();
        while txgs.get(&txg).is_some_and(|s| s.outstanding > 0) {
            self.settled.wait(&mut txgs);
        }
        let Some(state) = txgs.get_mut(&txg) else {
            return Ok(());
        };
        let error = state.error.take();
        if state.dirty_bytes == 0 {
            txgs.remove(&txg);
        }
        error.map_or(Ok(()), Err)
    }
}
