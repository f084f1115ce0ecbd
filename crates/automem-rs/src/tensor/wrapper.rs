//! The public tensor wrapper routed through the memory core.
//!
//! A [`Tensor`] is either undefined, a dense host tensor, or a checkpointed
//! handle whose value lives in the rematerialization graph. The dense and
//! undefined variants are plain values; the checkpoint variant forwards
//! metadata queries to its cell's cached metadata and materializes lazily on
//! data access.

use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Result};
use rand::Rng;

use crate::checkpoint::CheckpointTensor;

use super::dense::DenseTensor;
use super::keys::{convert_key_set, Device, KeySet};
use super::{DType, Shape, Storage};

#[derive(Clone)]
pub(crate) enum TensorRepr {
    Undefined,
    Dense(DenseTensor),
    Checkpoint(CheckpointTensor),
}

/// Tensor wrapper shared by the graph and paging layers.
#[derive(Clone)]
pub struct Tensor {
    repr: TensorRepr,
}

impl Tensor {
    /// The undefined tensor value.
    pub fn undefined() -> Tensor {
        Tensor {
            repr: TensorRepr::Undefined,
        }
    }

    /// Constructs an `F32` tensor from raw values.
    pub fn from_vec(shape: Shape, data: Vec<f32>) -> Result<Tensor> {
        Ok(Tensor {
            repr: TensorRepr::Dense(DenseTensor::from_vec(shape, data)?),
        })
    }

    pub fn zeros(shape: Shape) -> Tensor {
        Tensor {
            repr: TensorRepr::Dense(DenseTensor::zeros(shape)),
        }
    }

    pub fn ones(shape: Shape) -> Tensor {
        Tensor {
            repr: TensorRepr::Dense(DenseTensor::ones(shape)),
        }
    }

    /// Samples from `N(0, std^2)`.
    pub fn randn(shape: Shape, std: f32, rng: &mut impl Rng) -> Tensor {
        Tensor {
            repr: TensorRepr::Dense(DenseTensor::randn(shape, std, rng)),
        }
    }

    pub(crate) fn from_dense(dense: DenseTensor) -> Tensor {
        Tensor {
            repr: TensorRepr::Dense(dense),
        }
    }

    pub(crate) fn from_checkpoint(handle: CheckpointTensor) -> Tensor {
        Tensor {
            repr: TensorRepr::Checkpoint(handle),
        }
    }

    pub(crate) fn repr(&self) -> &TensorRepr {
        &self.repr
    }

    /// Returns the checkpoint handle when the tensor is routed through the
    /// rematerialization graph.
    pub fn checkpoint_handle(&self) -> Option<&CheckpointTensor> {
        match &self.repr {
            TensorRepr::Checkpoint(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn defined(&self) -> bool {
        !matches!(self.repr, TensorRepr::Undefined)
    }

    /// Strips gradient tracking. Checkpoint handles are already detached
    /// (their cells detach at fill time), so they pass through unchanged.
    pub fn detach(&self) -> Tensor {
        match &self.repr {
            TensorRepr::Undefined => Tensor::undefined(),
            TensorRepr::Dense(dense) => {
                let mut dense = dense.clone();
                dense.set_requires_grad(false);
                Tensor::from_dense(dense)
            }
            TensorRepr::Checkpoint(handle) => Tensor::from_checkpoint(handle.clone()),
        }
    }

    pub fn requires_grad(&self) -> bool {
        match &self.repr {
            TensorRepr::Undefined => false,
            TensorRepr::Dense(dense) => dense.requires_grad(),
            TensorRepr::Checkpoint(handle) => handle.cell().key_set().has(KeySet::AUTOGRAD),
        }
    }

    /// Builder-style gradient-tracking toggle for dense tensors.
    pub fn with_requires_grad(mut self, flag: bool) -> Tensor {
        if let TensorRepr::Dense(dense) = &mut self.repr {
            dense.set_requires_grad(flag);
        }
        self
    }

    /// Dispatch keys of the tensor. A checkpoint handle reports its cell's
    /// cached keys plus the checkpoint key.
    pub fn key_set(&self) -> KeySet {
        match &self.repr {
            TensorRepr::Undefined => KeySet::EMPTY,
            TensorRepr::Dense(dense) => {
                let keys = KeySet::DENSE;
                if dense.requires_grad() {
                    keys.add(KeySet::AUTOGRAD)
                } else {
                    keys
                }
            }
            TensorRepr::Checkpoint(handle) => convert_key_set(handle.cell().key_set()),
        }
    }

    /// Scalar dtype. Panics on an undefined tensor, and on a checkpoint
    /// handle whose cell has never been filled.
    pub fn dtype(&self) -> DType {
        match &self.repr {
            TensorRepr::Undefined => panic!("undefined tensor has no dtype"),
            TensorRepr::Dense(dense) => dense.dtype(),
            TensorRepr::Checkpoint(handle) => handle.cell().dtype(),
        }
    }

    pub fn optional_device(&self) -> Option<Device> {
        match &self.repr {
            TensorRepr::Undefined => None,
            TensorRepr::Dense(dense) => Some(dense.device()),
            TensorRepr::Checkpoint(handle) => handle.cell().optional_device(),
        }
    }

    pub fn shape(&self) -> Result<Shape> {
        match &self.repr {
            TensorRepr::Undefined => bail!("undefined tensor has no shape"),
            TensorRepr::Dense(dense) => Ok(dense.shape().clone()),
            TensorRepr::Checkpoint(handle) => handle.materialize()?.shape(),
        }
    }

    /// Reports whether two tensors share a physical storage. Checkpoint
    /// handles compare their currently held values; an unmaterialized handle
    /// aliases nothing observable.
    pub fn is_alias_of(&self, other: &Tensor) -> bool {
        match (self.try_storage(), other.try_storage()) {
            (Some(a), Some(b)) => Arc::ptr_eq(&a, &b),
            _ => false,
        }
    }

    fn try_storage(&self) -> Option<Arc<Storage>> {
        match &self.repr {
            TensorRepr::Undefined => None,
            TensorRepr::Dense(dense) => Some(Arc::clone(dense.storage())),
            TensorRepr::Checkpoint(handle) => handle.cell().held_storage(),
        }
    }

    /// The backing storage, materializing a checkpoint handle if needed.
    pub fn storage(&self) -> Result<Arc<Storage>> {
        match &self.repr {
            TensorRepr::Undefined => bail!("undefined tensor has no storage"),
            TensorRepr::Dense(dense) => Ok(Arc::clone(dense.storage())),
            TensorRepr::Checkpoint(handle) => handle.materialize()?.storage(),
        }
    }

    pub fn nbytes(&self) -> usize {
        match &self.repr {
            TensorRepr::Undefined => 0,
            TensorRepr::Dense(dense) => dense.nbytes(),
            TensorRepr::Checkpoint(handle) => handle.cell().memory(),
        }
    }

    /// Copies the payload out as `f32` values, materializing and paging in as
    /// required.
    pub fn to_vec(&self) -> Result<Vec<f32>> {
        match &self.repr {
            TensorRepr::Undefined => bail!("undefined tensor has no data"),
            TensorRepr::Dense(dense) => Ok(dense.to_vec()),
            TensorRepr::Checkpoint(handle) => handle.materialize()?.to_vec(),
        }
    }

    /// Deep copy with fresh storage.
    pub fn deep_clone(&self) -> Result<Tensor> {
        match &self.repr {
            TensorRepr::Undefined => Ok(Tensor::undefined()),
            TensorRepr::Dense(dense) => Ok(Tensor::from_dense(dense.deep_clone())),
            TensorRepr::Checkpoint(handle) => handle.materialize()?.deep_clone(),
        }
    }

    /// A new tensor sharing this tensor's storage (a view).
    pub fn alias(&self) -> Result<Tensor> {
        match &self.repr {
            TensorRepr::Undefined => bail!("cannot alias an undefined tensor"),
            TensorRepr::Dense(dense) => Ok(Tensor::from_dense(dense.clone())),
            TensorRepr::Checkpoint(handle) => handle.materialize()?.alias(),
        }
    }

    fn dense(&self) -> Result<&DenseTensor> {
        match &self.repr {
            TensorRepr::Dense(dense) => Ok(dense),
            TensorRepr::Undefined => bail!("undefined tensor has no dense payload"),
            TensorRepr::Checkpoint(_) => {
                bail!("checkpoint tensors must be materialized before dense access")
            }
        }
    }

    /// Element-wise sum into a fresh tensor.
    pub fn add(&self, rhs: &Tensor) -> Result<Tensor> {
        match (&self.repr, &rhs.repr) {
            (TensorRepr::Dense(a), TensorRepr::Dense(b)) => {
                Ok(Tensor::from_dense(a.apply_binary(b, |x, y| x + y)?))
            }
            _ => {
                let a = self.materialized()?;
                let b = rhs.materialized()?;
                Ok(Tensor::from_dense(
                    a.dense()?.apply_binary(b.dense()?, |x, y| x + y)?,
                ))
            }
        }
    }

    /// Element-wise product into a fresh tensor.
    pub fn mul(&self, rhs: &Tensor) -> Result<Tensor> {
        let a = self.materialized()?;
        let b = rhs.materialized()?;
        Ok(Tensor::from_dense(
            a.dense()?.apply_binary(b.dense()?, |x, y| x * y)?,
        ))
    }

    /// Scales every element into a fresh tensor.
    pub fn scale(&self, factor: f32) -> Result<Tensor> {
        let a = self.materialized()?;
        Ok(Tensor::from_dense(a.dense()?.map(|x| x * factor)))
    }

    /// In-place element-wise sum, writing through the shared storage.
    pub fn add_assign(&self, rhs: &Tensor) -> Result<()> {
        let a = self.materialized()?;
        let b = rhs.materialized()?;
        a.dense()?.apply_binary_inplace(b.dense()?, |x, y| x + y);
        Ok(())
    }

    /// Resolves a checkpoint handle to its underlying dense tensor; dense and
    /// undefined tensors pass through.
    pub(crate) fn materialized(&self) -> Result<Tensor> {
        match &self.repr {
            TensorRepr::Checkpoint(handle) => handle.materialize(),
            _ => Ok(self.clone()),
        }
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            TensorRepr::Undefined => f.debug_struct("Tensor").field("defined", &false).finish(),
            TensorRepr::Dense(dense) => f
                .debug_struct("Tensor")
                .field("shape", &dense.shape().dims())
                .field("dtype", &dense.dtype())
                .finish(),
            TensorRepr::Checkpoint(handle) => f
                .debug_struct("Tensor")
                .field("checkpoint", &handle.counter_name())
                .finish(),
        }
    }
}
