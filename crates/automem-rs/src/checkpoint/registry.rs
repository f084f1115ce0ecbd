//! Eviction substrate: the pool registry and the policy seam.
//!
//! The registry tracks every alias pool weakly and can enumerate the
//! currently evictable ones in least-recently-used order, together with the
//! numbers a cost-based heuristic needs (byte size, recompute cost, last
//! use). Which pool actually gets evicted is left to an [`EvictionPolicy`]
//! implementation; the core ships the seam, not a heuristic.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use super::pool::AliasPool;

/// One evictable pool with the numbers a policy ranks by.
pub struct PoolSnapshot {
    pub memory: usize,
    pub last_used: Instant,
    pub recompute_cost: Option<Duration>,
    pool: Rc<AliasPool>,
}

impl PoolSnapshot {
    pub fn pool(&self) -> &Rc<AliasPool> {
        &self.pool
    }

    /// Applies the eviction this snapshot stands for.
    pub fn evict(&self) {
        self.pool.evict();
    }
}

/// Chooses which candidate to evict next. Candidates arrive in LRU order;
/// returning `None` stops an eviction drive early.
pub trait EvictionPolicy {
    fn select(&self, candidates: &[PoolSnapshot]) -> Option<usize>;
}

/// Weak registry of alias pools on this thread's graph.
#[derive(Default)]
pub struct CheckpointPool {
    pools: RefCell<Vec<Weak<AliasPool>>>,
}

impl CheckpointPool {
    pub fn add(&self, pool: &Rc<AliasPool>) {
        self.pools.borrow_mut().push(Rc::downgrade(pool));
    }

    /// Number of live pools still tracked.
    pub fn live_pools(&self) -> usize {
        self.sweep();
        self.pools.borrow().len()
    }

    fn sweep(&self) {
        self.pools
            .borrow_mut()
            .retain(|weak| weak.upgrade().is_some());
    }

    /// Enumerates evictable pools in LRU order by last use.
    pub fn evictable(&self) -> Vec<PoolSnapshot> {
        self.sweep();
        let mut snapshots: Vec<PoolSnapshot> = self
            .pools
            .borrow()
            .iter()
            .filter_map(|weak| weak.upgrade())
            .filter(|pool| pool.evictable() && !pool.is_evicted())
            .map(|pool| PoolSnapshot {
                memory: pool.memory(),
                last_used: pool.last_used(),
                recompute_cost: pool.recompute_cost(),
                pool,
            })
            .collect();
        snapshots.sort_by_key(|s| s.last_used);
        snapshots
    }

    /// Drives the policy until at least `bytes` worth of pools have been
    /// evicted, the policy declines, or no candidates remain. Returns the
    /// bytes actually freed.
    pub fn evict_until<P: EvictionPolicy + ?Sized>(&self, policy: &P, bytes: usize) -> usize {
        let mut freed = 0;
        while freed < bytes {
            let candidates = self.evictable();
            if candidates.is_empty() {
                break;
            }
            let Some(index) = policy.select(&candidates) else {
                break;
            };
            let chosen = &candidates[index];
            freed += chosen.memory;
            chosen.evict();
        }
        freed
    }
}

thread_local! {
    static REGISTRY: CheckpointPool = CheckpointPool::default();
}

/// Runs `f` against this thread's pool registry.
pub fn with_checkpoint_pool<R>(f: impl FnOnce(&CheckpointPool) -> R) -> R {
    REGISTRY.with(|registry| f(registry))
}

pub(crate) fn add_pool(pool: &Rc<AliasPool>) {
    with_checkpoint_pool(|registry| registry.add(pool));
}
