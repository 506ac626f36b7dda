//! Live-set registry.
//!
//! Tracks every open connection handle so terminate can close them in bulk
//! and operators can enumerate them. One mutex, pointer-sized critical
//! sections; no user code ever runs while the lock is held.

use crate::handle::{SocketHandle, UNLINKED};
use crate::metrics::HANDLES_OPEN;
use parking_lot::Mutex;
use slab::Slab;
use std::sync::Arc;

pub(crate) struct Registry {
    handles: Mutex<Slab<Arc<SocketHandle>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(Slab::new()),
        }
    }

    /// Link a handle into the live set and record its slot on the handle.
    pub fn add(&self, handle: &Arc<SocketHandle>) {
        let mut handles = self.handles.lock();
        let slot = handles.insert(handle.clone());
        handle.set_slot(slot);
        drop(handles);
        HANDLES_OPEN.increment();
    }

    /// Unlink the handle occupying `slot`. Safe to call with a slot that
    /// was never assigned or was already removed.
    pub fn remove(&self, slot: usize) -> Option<Arc<SocketHandle>> {
        if slot == UNLINKED {
            return None;
        }
        let removed = self.handles.lock().try_remove(slot);
        if removed.is_some() {
            HANDLES_OPEN.decrement();
        }
        removed
    }

    /// Close every handle currently in the live set.
    ///
    /// The membership is snapshotted under the lock and the closes happen
    /// outside it; each close unlinks its own slot.
    pub fn close_open_handles(&self) {
        let open: Vec<Arc<SocketHandle>> = {
            let handles = self.handles.lock();
            handles.iter().map(|(_, handle)| handle.clone()).collect()
        };
        for handle in open {
            handle.close();
        }
    }

    /// Snapshot of the open handles.
    pub fn snapshot(&self) -> Vec<Arc<SocketHandle>> {
        let handles = self.handles.lock();
        handles.iter().map(|(_, handle)| handle.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }
}
