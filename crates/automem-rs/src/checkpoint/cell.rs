//! The unit of materializable value.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use anyhow::Result;

use crate::tensor::{Device, DType, KeySet, Storage, Tensor, TensorRepr};

use super::pool::AliasPool;
use super::remat::Rematerializer;

pub type WeakCell = Weak<TensorCell>;

struct CellState {
    /// The held value; `None` while evicted.
    value: Option<Tensor>,
    defined: bool,
    undefined_tensor: bool,
    key_set: KeySet,
    dtype: Option<DType>,
    device: Option<Device>,
    pool: Rc<AliasPool>,
    remat: Option<Rc<Rematerializer>>,
}

/// A logical tensor value that may or may not currently hold its physical
/// tensor. A cell without a rematerializer is a root and must always hold
/// its value; everything else can be evicted and replayed on demand.
pub struct TensorCell {
    state: RefCell<CellState>,
}

impl TensorCell {
    pub(crate) fn new(
        t: &Tensor,
        pool: Rc<AliasPool>,
        remat: Option<Rc<Rematerializer>>,
    ) -> Rc<TensorCell> {
        let cell = Rc::new(TensorCell {
            state: RefCell::new(CellState {
                value: None,
                defined: false,
                undefined_tensor: false,
                key_set: KeySet::EMPTY,
                dtype: None,
                device: None,
                pool,
                remat,
            }),
        });
        cell.fill(t.clone());
        cell
    }

    pub fn pool(&self) -> Rc<AliasPool> {
        Rc::clone(&self.state.borrow().pool)
    }

    pub fn has_value(&self) -> bool {
        self.state.borrow().value.is_some()
    }

    pub fn is_root(&self) -> bool {
        self.state.borrow().remat.is_none()
    }

    /// Returns the materialized tensor, replaying the producing operator
    /// first when the value has been evicted. Panics when the cell has
    /// neither a value nor a rematerializer; operator failures propagate and
    /// leave the cell unmaterialized for a later retry.
    pub fn get(self: &Rc<Self>) -> Result<Tensor> {
        if self.state.borrow().value.is_none() {
            let remat = self
                .state
                .borrow()
                .remat
                .clone()
                .expect("cell holds no value and has no rematerializer");
            remat.remat()?;
        }
        let st = self.state.borrow();
        let value = st
            .value
            .clone()
            .expect("rematerialization did not restore the cell value");
        st.pool.update_last_used();
        Ok(value)
    }

    /// Stores a value into the cell. A no-op when a value is already held.
    /// The tensor is detached before storing; the first fill captures the
    /// cell's metadata, adding the autograd key when the incoming tensor
    /// tracks gradients.
    pub fn fill(&self, t: Tensor) {
        let pool = {
            let mut st = self.state.borrow_mut();
            if st.value.is_some() {
                return;
            }
            if !st.defined {
                st.defined = true;
                st.undefined_tensor = !t.defined();
                let mut keys = t.key_set();
                if t.requires_grad() {
                    keys = keys.add(KeySet::AUTOGRAD);
                }
                st.key_set = keys;
                if t.defined() {
                    st.dtype = Some(t.dtype());
                }
                st.device = t.optional_device();
            }
            st.value = Some(t.detach());
            Rc::clone(&st.pool)
        };
        pool.set_not_evicted();
    }

    /// Drops the held value. Only the pool may do this; a root cell can
    /// never lose its value.
    pub(crate) fn evict_value(&self) {
        let mut st = self.state.borrow_mut();
        assert!(st.remat.is_some(), "cannot evict a cell with no rematerializer");
        st.value = None;
    }

    /// Materializes, then severs the cell (and its pool) from the
    /// rematerializer, turning the cell into a root.
    pub fn pin(self: &Rc<Self>) -> Result<()> {
        self.get()?;
        self.pool().clear_head_remat();
        self.state.borrow_mut().remat = None;
        Ok(())
    }

    /// Byte size of the pool backing this cell.
    pub fn memory(&self) -> usize {
        let st = self.state.borrow();
        assert!(st.defined, "memory queried before first fill");
        st.pool.memory()
    }

    pub fn key_set(&self) -> KeySet {
        let st = self.state.borrow();
        assert!(st.defined, "key set queried before first fill");
        st.key_set
    }

    pub fn dtype(&self) -> DType {
        let st = self.state.borrow();
        assert!(st.defined, "dtype queried before first fill");
        st.dtype.expect("undefined tensor has no dtype")
    }

    pub fn optional_device(&self) -> Option<Device> {
        let st = self.state.borrow();
        assert!(st.defined, "device queried before first fill");
        st.device
    }

    pub fn is_undefined_tensor(&self) -> bool {
        let st = self.state.borrow();
        assert!(st.defined, "undefined flag queried before first fill");
        st.undefined_tensor
    }

    /// Storage of the currently held value, when there is one.
    pub(crate) fn held_storage(&self) -> Option<Arc<Storage>> {
        let st = self.state.borrow();
        st.value.as_ref().and_then(|t| match t.repr() {
            TensorRepr::Dense(dense) => Some(Arc::clone(dense.storage())),
            _ => None,
        })
    }
}
