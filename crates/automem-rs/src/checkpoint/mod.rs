//! Checkpointing / rematerialization graph.
//!
//! Nodes are cells (one per logical tensor value), edges are rematerializers
//! (one per operator invocation). Cells that share a physical storage share
//! an alias pool, the atomic unit of eviction. The ownership cycle (an
//! output cell owns its rematerializer, which owns its input cells, while a
//! pool owns its head rematerializer) is broken by weak references from
//! rematerializers to their outputs and from pools to their member cells.

pub mod api;
pub mod cell;
pub mod external;
pub mod pool;
pub mod registry;
pub mod remat;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use anyhow::Result;

use crate::tensor::Tensor;

pub use api::{
    checkpoint, decheckpoint, evict_checkpoint, get_pointer, is_checkpoint, need_prefetch,
    pagein_manual, pageout_manual, remat_checkpoint, try_checkpoint, uncheckpoint,
};
pub use cell::TensorCell;
pub use external::{External, ExternalRef};
pub use pool::AliasPool;
pub use registry::{with_checkpoint_pool, CheckpointPool, EvictionPolicy, PoolSnapshot};
pub use remat::{RematFn, Rematerializer};

static CHECKPOINT_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_checkpoint_id() -> u64 {
    CHECKPOINT_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed)
}

/// Handle stored inside the checkpoint variant of [`Tensor`].
///
/// Clones share the inner slot, so mutation lowering reseats every clone at
/// once. [`CheckpointTensor::snapshot`] makes a handle with its own slot,
/// which keeps observing the pre-mutation external.
#[derive(Clone)]
pub struct CheckpointTensor {
    id: u64,
    slot: ExternalRef,
}

impl CheckpointTensor {
    pub(crate) fn from_external(external: Rc<External>) -> CheckpointTensor {
        CheckpointTensor {
            id: next_checkpoint_id(),
            slot: Rc::new(RefCell::new(external)),
        }
    }

    /// Debug identity, stable across clones of this handle.
    pub fn counter_name(&self) -> String {
        format!("[ckpt{}]", self.id)
    }

    /// The cell currently behind this handle.
    pub fn cell(&self) -> Rc<TensorCell> {
        Rc::clone(self.slot.borrow().cell())
    }

    /// Materializes the underlying tensor, replaying the provenance graph as
    /// needed.
    pub fn materialize(&self) -> Result<Tensor> {
        self.cell().get()
    }

    /// A handle over the same external but with an independent slot; it will
    /// not observe later mutation reseats.
    pub fn snapshot(&self) -> CheckpointTensor {
        CheckpointTensor {
            id: next_checkpoint_id(),
            slot: Rc::new(RefCell::new(Rc::clone(&self.slot.borrow()))),
        }
    }

    pub(crate) fn reseat(&self, external: Rc<External>) {
        *self.slot.borrow_mut() = external;
    }
}
