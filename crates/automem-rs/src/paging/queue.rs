//! Background transfer queues.
//!
//! Two process-global queues serialize storage transfers: the evict queue
//! pages storages out in FIFO order, the fetch queue pages them back in with
//! LIFO service so the most recently requested storage wins. Each queue is
//! drained by exactly one detached worker thread; the `unique` flag keeps a
//! second worker from ever starting, including across stop/start cycles.
//!
//! A popped entry is only acted on while its storage is still alive
//! (`Arc::strong_count > 1`) and the entity is not dirty; anything else is
//! dropped on the floor, which is how a dying storage cancels its own
//! transfers.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;

use crate::paging::entity::Entity;
use crate::util::TokenList;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferKind {
    Evict,
    Fetch,
}

pub struct TransferQueue {
    name: &'static str,
    kind: TransferKind,
    backlog: Mutex<TokenList<Arc<Entity>>>,
    enable_flag: AtomicBool,
    active_flag: AtomicBool,
    unique_flag: AtomicBool,
    not_empty_cv: Condvar,
    empty_cv: Condvar,
}

impl TransferQueue {
    fn new(name: &'static str, kind: TransferKind) -> TransferQueue {
        TransferQueue {
            name,
            kind,
            backlog: Mutex::new(TokenList::new()),
            enable_flag: AtomicBool::new(false),
            active_flag: AtomicBool::new(false),
            unique_flag: AtomicBool::new(false),
            not_empty_cv: Condvar::new(),
            empty_cv: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Appends (evict) or prepends (fetch) an entry. Returns `false` when
    /// the queue is not accepting submissions, in which case the caller must
    /// not assume a transfer will ever happen.
    pub fn submit(&self, entity: &Arc<Entity>) -> bool {
        let mut backlog = self.backlog.lock().expect("queue backlog poisoned");
        if !self.enable_flag.load(AtomicOrdering::SeqCst) {
            return false;
        }
        match self.kind {
            TransferKind::Evict => {
                backlog.push_back(Arc::clone(entity));
            }
            TransferKind::Fetch => {
                backlog.push_front(Arc::clone(entity));
            }
        }
        let notify = self.active_flag.load(AtomicOrdering::SeqCst);
        drop(backlog);
        if notify {
            self.not_empty_cv.notify_all();
        }
        true
    }

    /// Pops the next entry, or `None` when the backlog is empty.
    pub fn dequeue(&self) -> Option<Arc<Entity>> {
        self.backlog
            .lock()
            .expect("queue backlog poisoned")
            .pop_front()
    }

    /// Removes the first queued entry for `entity_id`. Returns `true` on a
    /// hit.
    pub fn erase(&self, entity_id: u64) -> bool {
        let mut backlog = self.backlog.lock().expect("queue backlog poisoned");
        match backlog.find(|entity| entity.id() == entity_id) {
            Some(token) => {
                backlog.take(token);
                true
            }
            None => false,
        }
    }

    /// Backlog length; transfers in flight on the worker are not counted.
    pub fn pending(&self) -> usize {
        self.backlog.lock().expect("queue backlog poisoned").len()
    }

    /// Enables submissions and spawns the worker. Idempotent: a queue that is
    /// active, enabled, or still winding a worker down is left untouched.
    pub fn start_actions(&'static self) {
        let _guard = self.backlog.lock().expect("queue backlog poisoned");
        if self.active_flag.load(AtomicOrdering::SeqCst)
            || self.enable_flag.load(AtomicOrdering::SeqCst)
            || self.unique_flag.load(AtomicOrdering::SeqCst)
        {
            return;
        }
        self.active_flag.store(true, AtomicOrdering::SeqCst);
        self.enable_flag.store(true, AtomicOrdering::SeqCst);
        thread::spawn(move || self.worker_loop());
    }

    /// Re-enables submissions without touching the worker.
    pub fn enable_queue(&self) {
        let _guard = self.backlog.lock().expect("queue backlog poisoned");
        self.enable_flag.store(true, AtomicOrdering::SeqCst);
    }

    /// Disables submissions, drains the backlog, and retires the worker.
    pub fn wait_and_stop_actions(&self) {
        let mut backlog = self.backlog.lock().expect("queue backlog poisoned");
        self.enable_flag.store(false, AtomicOrdering::SeqCst);
        if !self.active_flag.load(AtomicOrdering::SeqCst) {
            return;
        }
        while !backlog.is_empty() {
            backlog = self
                .empty_cv
                .wait(backlog)
                .expect("queue backlog poisoned");
        }
        self.active_flag.store(false, AtomicOrdering::SeqCst);
        drop(backlog);
        // The worker is parked on not_empty; wake it so it observes the
        // cleared active flag and exits.
        self.not_empty_cv.notify_all();
    }

    /// Blocks until the backlog drains, keeping the worker alive. New
    /// submissions are refused while draining.
    pub fn wait_actions(&self) {
        let mut backlog = self.backlog.lock().expect("queue backlog poisoned");
        if !self.active_flag.load(AtomicOrdering::SeqCst) {
            return;
        }
        self.enable_flag.store(false, AtomicOrdering::SeqCst);
        while !backlog.is_empty() {
            backlog = self
                .empty_cv
                .wait(backlog)
                .expect("queue backlog poisoned");
        }
        self.enable_flag.store(true, AtomicOrdering::SeqCst);
    }

    fn worker_loop(&self) {
        {
            let _guard = self.backlog.lock().expect("queue backlog poisoned");
            if self.unique_flag.swap(true, AtomicOrdering::SeqCst) {
                // A worker is already servicing this queue.
                return;
            }
        }
        loop {
            let mut entry = self.dequeue();
            if entry.is_none() {
                let mut backlog = self.backlog.lock().expect("queue backlog poisoned");
                loop {
                    if let Some(popped) = backlog.pop_front() {
                        entry = Some(popped);
                        break;
                    }
                    self.empty_cv.notify_all();
                    // Checked under the backlog lock, so a stop request can
                    // never slip between the check and the wait.
                    if !self.active_flag.load(AtomicOrdering::SeqCst) {
                        self.unique_flag.store(false, AtomicOrdering::SeqCst);
                        return;
                    }
                    backlog = self
                        .not_empty_cv
                        .wait(backlog)
                        .expect("queue backlog poisoned");
                }
            }
            let Some(entity) = entry else {
                continue;
            };
            // Skip entries whose storage already died or went dirty; the
            // strong count drops to one once the owning storage released its
            // handle.
            if Arc::strong_count(&entity) > 1 && !entity.is_dirty() {
                match self.kind {
                    TransferKind::Evict => {
                        entity.pageout_internal_sync();
                        entity.do_pageout_cb();
                    }
                    TransferKind::Fetch => {
                        entity.pagein_internal_sync();
                        entity.do_pagein_cb();
                    }
                }
            }
        }
    }
}

static EVICT_QUEUE: OnceLock<TransferQueue> = OnceLock::new();
static FETCH_QUEUE: OnceLock<TransferQueue> = OnceLock::new();

/// The singleton pageout queue (FIFO service).
pub fn evict_queue() -> &'static TransferQueue {
    EVICT_QUEUE.get_or_init(|| TransferQueue::new("evict", TransferKind::Evict))
}

/// The singleton pagein queue (LIFO service via front insertion).
pub fn fetch_queue() -> &'static TransferQueue {
    FETCH_QUEUE.get_or_init(|| TransferQueue::new("fetch", TransferKind::Fetch))
}
