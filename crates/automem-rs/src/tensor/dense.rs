//! Host-resident dense tensor payload used by the wrapper type.

use std::mem::{size_of, ManuallyDrop};
use std::sync::Arc;

use anyhow::{bail, Result};
use rand::Rng;

use super::{keys::Device, DType, Shape, Storage};

/// Dense tensor over a shared [`Storage`].
///
/// Cloning is shallow: the clone shares the storage, which is exactly the
/// alias relationship the checkpoint layer groups into pools.
#[derive(Clone)]
pub struct DenseTensor {
    shape: Shape,
    dtype: DType,
    device: Device,
    requires_grad: bool,
    storage: Arc<Storage>,
}

impl DenseTensor {
    /// Constructs an `F32` tensor from raw values, validating the length
    /// against the shape.
    pub fn from_vec(shape: Shape, data: Vec<f32>) -> Result<Self> {
        if data.len() != shape.num_elements() {
            bail!(
                "tensor data length ({}) does not match shape {:?}",
                data.len(),
                shape.dims()
            );
        }
        Ok(DenseTensor {
            shape,
            dtype: DType::F32,
            device: Device::Cpu,
            requires_grad: false,
            storage: Storage::from_bytes(vec_into_bytes(data)),
        })
    }

    /// Returns a zero-initialized `F32` tensor of the requested shape.
    pub fn zeros(shape: Shape) -> Self {
        let len = shape.num_elements();
        DenseTensor::from_vec(shape, vec![0.0; len]).expect("length matches by construction")
    }

    /// Returns a one-initialized `F32` tensor of the requested shape.
    pub fn ones(shape: Shape) -> Self {
        let len = shape.num_elements();
        DenseTensor::from_vec(shape, vec![1.0; len]).expect("length matches by construction")
    }

    /// Samples from a normal distribution (`N(0, std^2)`) using the
    /// Box-Muller transform.
    pub fn randn(shape: Shape, std: f32, rng: &mut impl Rng) -> Self {
        let len = shape.num_elements();
        let mut values = Vec::with_capacity(len);
        while values.len() < len {
            let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
            let u2: f32 = rng.gen::<f32>();
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f32::consts::PI * u2;
            values.push(r * theta.cos() * std);
            if values.len() < len {
                values.push(r * theta.sin() * std);
            }
        }
        DenseTensor::from_vec(shape, values).expect("length matches by construction")
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn set_requires_grad(&mut self, flag: bool) {
        self.requires_grad = flag;
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn nbytes(&self) -> usize {
        self.storage.nbytes()
    }

    /// Copies the payload out as `f32` values, paging in when necessary.
    pub fn to_vec(&self) -> Vec<f32> {
        assert_eq!(self.dtype, DType::F32, "tensor data is not stored as f32");
        self.storage.with_bytes(|bytes| bytes_to_f32(bytes))
    }

    /// Overwrites the payload from `f32` values of matching length.
    pub fn write_vec(&self, values: &[f32]) {
        assert_eq!(self.dtype, DType::F32, "tensor data is not stored as f32");
        assert_eq!(
            values.len(),
            self.shape.num_elements(),
            "value count does not match tensor shape"
        );
        self.storage.with_bytes_mut(|bytes| {
            for (chunk, v) in bytes.chunks_exact_mut(4).zip(values) {
                chunk.copy_from_slice(&v.to_le_bytes());
            }
        });
    }

    /// Deep copy: fresh storage holding the same bytes.
    pub fn deep_clone(&self) -> DenseTensor {
        let bytes = self.storage.with_bytes(|b| b.to_vec());
        DenseTensor {
            shape: self.shape.clone(),
            dtype: self.dtype,
            device: self.device,
            requires_grad: self.requires_grad,
            storage: Storage::from_bytes(bytes),
        }
    }

    /// Applies a binary function element-wise into a fresh tensor.
    pub fn apply_binary(&self, rhs: &DenseTensor, mut f: impl FnMut(f32, f32) -> f32) -> Result<DenseTensor> {
        self.shape.assert_same(&rhs.shape);
        let lhs = self.to_vec();
        let rhs = rhs.to_vec();
        let out: Vec<f32> = lhs.iter().zip(rhs.iter()).map(|(&a, &b)| f(a, b)).collect();
        DenseTensor::from_vec(self.shape.clone(), out)
    }

    /// Applies a binary function element-wise in place over `self`.
    pub fn apply_binary_inplace(&self, rhs: &DenseTensor, mut f: impl FnMut(f32, f32) -> f32) {
        self.shape.assert_same(&rhs.shape);
        let rhs = rhs.to_vec();
        let mut lhs = self.to_vec();
        for (a, b) in lhs.iter_mut().zip(rhs.iter()) {
            *a = f(*a, *b);
        }
        self.write_vec(&lhs);
    }

    /// Applies a unary function element-wise into a fresh tensor.
    pub fn map(&self, mut f: impl FnMut(f32) -> f32) -> DenseTensor {
        let out: Vec<f32> = self.to_vec().into_iter().map(|v| f(v)).collect();
        DenseTensor::from_vec(self.shape.clone(), out).expect("length preserved by map")
    }
}

/// Converts an owned vector into a raw byte buffer without copying.
fn vec_into_bytes<T>(data: Vec<T>) -> Vec<u8> {
    let mut data = ManuallyDrop::new(data);
    let ptr = data.as_mut_ptr() as *mut u8;
    let len = data.len() * size_of::<T>();
    let cap = data.capacity() * size_of::<T>();
    unsafe { Vec::from_raw_parts(ptr, len, cap) }
}

fn bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    assert_eq!(
        bytes.len() % 4,
        0,
        "byte length {} is not a multiple of the f32 size",
        bytes.len()
    );
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes(chunk.try_into().expect("chunk is 4 bytes")))
        .collect()
}
