//! User-visible ownership of cells.
//!
//! Each cell has at most one [`External`]; when it drops, the core knows the
//! cell is only referenced internally and its pool becomes a banishing
//! candidate. The extra [`ExternalRef`] indirection exists solely so that
//! mutation lowering can reseat a handle to the replacement cell while older
//! aliases keep the pre-mutation external.

use std::cell::RefCell;
use std::rc::Rc;

use crate::tensor::Tensor;

use super::cell::TensorCell;
use super::pool::AliasPool;
use super::registry;

/// Unique user handle to one cell.
pub struct External {
    cell: Rc<TensorCell>,
}

impl External {
    /// Wraps an existing cell, registering the external with its pool.
    pub(crate) fn from_cell(cell: Rc<TensorCell>) -> Rc<External> {
        cell.pool().register_external();
        Rc::new(External { cell })
    }

    /// The only legal way to introduce a fresh root: pool, cell, and
    /// external are created in one step. The pool records the tensor's real
    /// byte size and has no rematerializer, so it is never evictable.
    pub fn from_tensor(t: &Tensor) -> Rc<External> {
        let pool = AliasPool::new(None, t.nbytes());
        registry::add_pool(&pool);
        let cell = TensorCell::new(t, Rc::clone(&pool), None);
        pool.add_member(&cell);
        External::from_cell(cell)
    }

    pub fn cell(&self) -> &Rc<TensorCell> {
        &self.cell
    }
}

impl Drop for External {
    fn drop(&mut self) {
        self.cell.pool().release_external();
    }
}

/// Mutable slot holding the current external of a checkpoint handle.
pub type ExternalRef = Rc<RefCell<Rc<External>>>;
