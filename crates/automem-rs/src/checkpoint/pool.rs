//! Alias pools: the atomic unit of eviction.
//!
//! Every cell belongs to exactly one pool; cells share a pool exactly when
//! their values share a physical storage. Evicting a pool drops every member
//! cell's value in one step, so a partially evicted view family can never be
//! observed. A pool is evictable only while nothing holds a materialized
//! pointer into it (`lock_count == 0`) and it has a producing rematerializer
//! to bring the values back.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use super::cell::{TensorCell, WeakCell};
use super::remat::Rematerializer;

struct PoolInner {
    members: Vec<WeakCell>,
    /// Data-dependent but non-aliased cells, reserved for the eviction cost
    /// heuristic.
    neighbors: Vec<WeakCell>,
    lock_count: usize,
    external_count: usize,
    head_remat: Option<Rc<Rematerializer>>,
    evicted: bool,
    memory: usize,
    last_used: Instant,
}

pub struct AliasPool {
    inner: RefCell<PoolInner>,
}

impl AliasPool {
    /// A pool does not register itself anywhere; the caller decides whether
    /// it joins the eviction registry.
    pub(crate) fn new(head_remat: Option<Rc<Rematerializer>>, memory: usize) -> Rc<AliasPool> {
        Rc::new(AliasPool {
            inner: RefCell::new(PoolInner {
                members: Vec::new(),
                neighbors: Vec::new(),
                lock_count: 0,
                external_count: 0,
                head_remat,
                evicted: false,
                memory,
                last_used: Instant::now(),
            }),
        })
    }

    pub fn lock_count(&self) -> usize {
        self.inner.borrow().lock_count
    }

    pub fn external_count(&self) -> usize {
        self.inner.borrow().external_count
    }

    pub(crate) fn lock(&self) {
        self.inner.borrow_mut().lock_count += 1;
    }

    pub(crate) fn unlock(&self) {
        let mut inner = self.inner.borrow_mut();
        assert!(inner.lock_count > 0, "pool lock underflow");
        inner.lock_count -= 1;
    }

    pub(crate) fn register_external(&self) {
        self.inner.borrow_mut().external_count += 1;
    }

    /// Once the last external is gone and nothing holds a lock, the pool is
    /// a banishing candidate; the registry sweeps it out once the weak
    /// member handles expire.
    pub(crate) fn release_external(&self) {
        let mut inner = self.inner.borrow_mut();
        assert!(inner.external_count > 0, "pool external underflow");
        inner.external_count -= 1;
    }

    /// A pool may be evicted only while unlocked and replayable.
    pub fn evictable(&self) -> bool {
        let inner = self.inner.borrow();
        inner.lock_count == 0 && inner.head_remat.is_some()
    }

    pub fn is_evicted(&self) -> bool {
        self.inner.borrow().evicted
    }

    pub fn memory(&self) -> usize {
        self.inner.borrow().memory
    }

    pub fn last_used(&self) -> Instant {
        self.inner.borrow().last_used
    }

    pub(crate) fn update_last_used(&self) {
        self.inner.borrow_mut().last_used = Instant::now();
    }

    /// Recompute cost of the rematerializer that produced the pool's current
    /// contents, when it still has one.
    pub fn recompute_cost(&self) -> Option<Duration> {
        let inner = self.inner.borrow();
        inner.head_remat.as_ref().map(|r| r.compute_cost())
    }

    pub(crate) fn head_remat(&self) -> Option<Rc<Rematerializer>> {
        self.inner.borrow().head_remat.clone()
    }

    pub(crate) fn clear_head_remat(&self) {
        self.inner.borrow_mut().head_remat = None;
    }

    pub(crate) fn add_member(&self, cell: &Rc<TensorCell>) {
        self.inner.borrow_mut().members.push(Rc::downgrade(cell));
    }

    /// Records a data-dependent but non-aliased cell. Reserved for the
    /// eviction cost heuristic.
    pub fn add_neighbor(&self, cell: &Rc<TensorCell>) {
        self.inner.borrow_mut().neighbors.push(Rc::downgrade(cell));
    }

    /// Clears the evicted flag after a successful rematerialization refills
    /// any member. Idempotent.
    pub(crate) fn set_not_evicted(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.evicted {
            inner.evicted = false;
        }
    }

    /// Drops every member cell's value in one step and marks the pool
    /// evicted. Panics when the pool is not evictable.
    pub fn evict(&self) {
        assert!(self.evictable(), "pool is not evictable");
        let members: Vec<WeakCell> = self.inner.borrow().members.clone();
        for weak in &members {
            if let Some(cell) = weak.upgrade() {
                cell.evict_value();
            }
        }
        self.inner.borrow_mut().evicted = true;
    }

    /// Breaks the cycle with the rematerializer and forgets the weak lists.
    pub fn release_resources(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.members.clear();
        inner.neighbors.clear();
        inner.head_remat = None;
    }
}

/// Scoped pool lock: every acquisition is paired with a release on all exit
/// paths, including unwinds out of a failing operator.
pub(crate) struct PoolLockGuard {
    pool: Rc<AliasPool>,
}

impl PoolLockGuard {
    pub(crate) fn new(pool: Rc<AliasPool>) -> PoolLockGuard {
        pool.lock();
        PoolLockGuard { pool }
    }
}

impl Drop for PoolLockGuard {
    fn drop(&mut self) {
        self.pool.unlock();
    }
}
