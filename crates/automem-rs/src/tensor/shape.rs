//! Logical tensor extents.

/// Dimension list of a tensor value.
///
/// The memory core only consults extents for element counts and byte-size
/// bookkeeping; strides and layout stay with the operator runtime that
/// produces the tensors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    /// Builds a shape from its extents. At least one axis is required, so a
    /// scalar is spelled `[1]`.
    pub fn new<D: Into<Vec<usize>>>(dims: D) -> Self {
        let dims = dims.into();
        assert!(!dims.is_empty(), "tensor shapes need at least one axis");
        Shape { dims }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Element count implied by the extents.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Panics unless `other` has identical extents.
    pub fn assert_same(&self, other: &Shape) {
        assert_eq!(
            self.dims, other.dims,
            "mismatched shapes {:?} and {:?}",
            self, other
        );
    }
}
