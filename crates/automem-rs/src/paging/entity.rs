//! Paging descriptor attached to a storage.
//!
//! An [`Entity`] owns the placement and transfer state of one storage's
//! device bytes. State changes follow a strict machine:
//!
//! ```text
//! (Online,  None)    --pageout enqueue-->  (InTransit, PageOut)
//! (InTransit, PageOut) --pageout_cb-->     (Offline, None)
//! (Offline, None)    --pagein enqueue-->   (InTransit, PageIn)
//! (InTransit, PageIn)  --pagein_cb-->      (Online, None)
//! ```
//!
//! The `dirty` bit is irrevocable: once set, no new transfer is accepted and
//! an in-flight completion is ignored, leaving the machine wherever it was.
//! `ensure_data` is the single blocking point for readers: it serializes
//! concurrent callers behind `ensure_lock` and either steals a queued fetch
//! for a synchronous fast-path or parks on the placement condvar until the
//! background worker finishes.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use crate::paging::queue::{evict_queue, fetch_queue};
use crate::paging::transfer::{DeviceTransfer, HostAllocator};
use crate::profiling::{debug_log, LogLevel};
use crate::tensor::Storage;

/// Placement of the entity's device bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementStat {
    Online,
    Offline,
    InTransit,
}

/// Transfer intent currently attached to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransStat {
    None,
    PageOut,
    PageIn,
}

struct EntityState {
    dirty: bool,
    trans: TransStat,
    placement: PlacementStat,
    host_data: Option<Box<[u8]>>,
}

static ENTITY_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

pub struct Entity {
    id: u64,
    storage: Weak<Storage>,
    transfer: Arc<dyn DeviceTransfer>,
    host_alloc: Arc<dyn HostAllocator>,
    state: Mutex<EntityState>,
    placement_cv: Condvar,
    /// Serializes the slow path of `ensure_data` across readers.
    ensure_lock: Mutex<()>,
}

impl Entity {
    pub(crate) fn new(
        storage: Weak<Storage>,
        transfer: Arc<dyn DeviceTransfer>,
        host_alloc: Arc<dyn HostAllocator>,
    ) -> Arc<Entity> {
        Arc::new(Entity {
            id: ENTITY_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed),
            storage,
            transfer,
            host_alloc,
            state: Mutex::new(EntityState {
                dirty: false,
                trans: TransStat::None,
                placement: PlacementStat::Online,
                host_data: None,
            }),
            placement_cv: Condvar::new(),
            ensure_lock: Mutex::new(()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn placement(&self) -> PlacementStat {
        self.state.lock().expect("entity state poisoned").placement
    }

    pub fn trans_stat(&self) -> TransStat {
        self.state.lock().expect("entity state poisoned").trans
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().expect("entity state poisoned").dirty
    }

    /// Irrevocably disables paging for this entity.
    pub fn mark_dirty(&self) {
        let mut st = self.state.lock().expect("entity state poisoned");
        st.dirty = true;
        drop(st);
        // Unblock any reader parked on the transfer that will now never
        // complete.
        self.placement_cv.notify_all();
    }

    /// Requests an asynchronous pageout. Returns `false` when the entity is
    /// dirty, not online, or the evict queue refused the entry.
    pub fn pageout(self: &Arc<Self>) -> bool {
        {
            let mut st = self.state.lock().expect("entity state poisoned");
            if st.dirty || st.placement != PlacementStat::Online || st.trans != TransStat::None {
                return false;
            }
            st.placement = PlacementStat::InTransit;
            st.trans = TransStat::PageOut;
        }
        debug_log().add(LogLevel::Debug, "Entity::pageout", "enqueue");
        if evict_queue().submit(self) {
            true
        } else {
            {
                let mut st = self.state.lock().expect("entity state poisoned");
                st.placement = PlacementStat::Online;
                st.trans = TransStat::None;
            }
            // A reader may have parked on the transfer that never started.
            self.placement_cv.notify_all();
            false
        }
    }

    /// Requests an asynchronous pagein. Returns `false` when the entity is
    /// dirty, not offline, or the fetch queue refused the entry.
    pub fn pagein(self: &Arc<Self>) -> bool {
        {
            let mut st = self.state.lock().expect("entity state poisoned");
            if st.dirty || st.placement != PlacementStat::Offline || st.trans != TransStat::None {
                return false;
            }
            st.placement = PlacementStat::InTransit;
            st.trans = TransStat::PageIn;
        }
        debug_log().add(LogLevel::Debug, "Entity::pagein", "enqueue");
        if fetch_queue().submit(self) {
            true
        } else {
            {
                let mut st = self.state.lock().expect("entity state poisoned");
                st.placement = PlacementStat::Offline;
                st.trans = TransStat::None;
            }
            self.placement_cv.notify_all();
            false
        }
    }

    /// Prefetch hint: identical to [`Entity::pagein`] but intended for
    /// policy-driven callers that only suspect an upcoming access.
    pub fn need_prefetch(self: &Arc<Self>) -> bool {
        debug_log().add(LogLevel::Debug, "Entity::need_prefetch", "hint");
        self.pagein()
    }

    /// Blocks until the device bytes are resident. Dirty entities return
    /// immediately; their bytes are garbage by contract.
    pub fn ensure_data(&self) {
        {
            let st = self.state.lock().expect("entity state poisoned");
            if st.dirty || st.placement == PlacementStat::Online {
                return;
            }
        }
        debug_log().add(LogLevel::Debug, "Entity::ensure_data", "slow path");
        let _ensure = self.ensure_lock.lock().expect("ensure lock poisoned");
        loop {
            let mut st = self.state.lock().expect("entity state poisoned");
            if st.dirty || st.placement == PlacementStat::Online {
                return;
            }
            match (st.placement, st.trans) {
                (PlacementStat::Offline, TransStat::None) => {
                    st.placement = PlacementStat::InTransit;
                    st.trans = TransStat::PageIn;
                    drop(st);
                    self.pagein_internal_sync();
                    self.do_pagein_cb();
                }
                (PlacementStat::InTransit, TransStat::PageIn) => {
                    drop(st);
                    if fetch_queue().erase(self.id) {
                        // Stole the queued request; service it synchronously.
                        self.pagein_internal_sync();
                        self.do_pagein_cb();
                    } else {
                        // The fetch worker owns the transfer; park while it
                        // is still in flight.
                        let st = self.state.lock().expect("entity state poisoned");
                        if st.placement == PlacementStat::InTransit && !st.dirty {
                            let _guard = self
                                .placement_cv
                                .wait(st)
                                .expect("entity state poisoned");
                        }
                    }
                }
                (PlacementStat::InTransit, TransStat::PageOut) => {
                    // An eviction is in flight; once it lands the loop pages
                    // the bytes straight back in.
                    let _guard = self
                        .placement_cv
                        .wait(st)
                        .expect("entity state poisoned");
                }
                (placement, trans) => {
                    unreachable!("invalid entity state {:?}/{:?}", placement, trans)
                }
            }
        }
    }

    /// Synchronous device→host copy. The device allocation is released once
    /// the staging copy is stashed.
    pub(crate) fn pageout_internal_sync(&self) {
        let Some(storage) = self.storage.upgrade() else {
            return;
        };
        let host = storage.export_for_pageout(self.transfer.as_ref(), self.host_alloc.as_ref());
        if let Some(host) = host {
            let mut st = self.state.lock().expect("entity state poisoned");
            st.host_data = Some(host);
        }
    }

    /// Synchronous host→device copy from the stashed staging buffer.
    pub(crate) fn pagein_internal_sync(&self) {
        let Some(storage) = self.storage.upgrade() else {
            return;
        };
        let host = {
            let mut st = self.state.lock().expect("entity state poisoned");
            st.host_data.take()
        };
        let Some(host) = host else {
            return;
        };
        storage.import_for_pagein(self.transfer.as_ref(), host);
    }

    /// Completion callback for a pageout. Ignored when dirty or when no
    /// pageout is in flight.
    pub(crate) fn do_pageout_cb(&self) {
        {
            let mut st = self.state.lock().expect("entity state poisoned");
            if st.dirty || st.trans != TransStat::PageOut {
                return;
            }
            st.trans = TransStat::None;
            st.placement = PlacementStat::Offline;
        }
        self.placement_cv.notify_all();
    }

    /// Completion callback for a pagein. Ignored when dirty or when no
    /// pagein is in flight.
    pub(crate) fn do_pagein_cb(&self) {
        {
            let mut st = self.state.lock().expect("entity state poisoned");
            if st.dirty || st.trans != TransStat::PageIn {
                return;
            }
            st.trans = TransStat::None;
            st.placement = PlacementStat::Online;
        }
        self.placement_cv.notify_all();
    }
}
