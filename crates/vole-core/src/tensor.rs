use std::sync::{Arc, RwLock, RwLockReadGuard};

use crate::backend::{Backend, BackendDevice, BinaryOp};
use crate::backprop::GradStore;
use crate::dtype::{DType, WithDType};
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::op::{Op, TensorId};
use crate::shape::Shape;

// Tensor — The fundamental data structure
//
// A Tensor is an n-dimensional array that:
//
//   1. Holds data on a specific device through its backend's storage
//   2. Has a shape, a dtype and a strided layout
//   3. Records the operation that created it (for autodiff)
//
// MEMORY MODEL:
//
//   The inner data is wrapped in Arc, so cloning a Tensor is O(1). Views
//   (transpose, permute, broadcast, reshape of contiguous data) share the
//   same Arc<RwLock<Storage>> and only differ in Layout. Routines take read
//   locks only; nothing here mutates storage after creation.
//
// The routine layer (dot, solve, inv, qr, conv) lives in linalg.rs and
// conv.rs as further `impl<B: Backend> Tensor<B>` blocks. This file holds
// construction, views, dtype casts and the small set of element-wise
// primitives the gradient rules are written in.

struct TensorInner<B: Backend> {
    id: TensorId,
    storage: Arc<RwLock<B::Storage>>,
    layout: Layout,
    dtype: DType,
    device: B::Device,
    /// The operation that created this tensor (Op::None for leaves).
    op: Op<B>,
}

/// An n-dimensional array on a specific backend.
///
/// ```ignore
/// use vole_core::Tensor;
/// use vole_cpu::{CpuBackend, CpuDevice};
///
/// let a = Tensor::<CpuBackend>::from_f64_slice(&[4.0, 1.0, 2.0, 3.0], (2, 2), DType::F64, &CpuDevice)?;
/// let ainv = a.inv()?;
/// ```
pub struct Tensor<B: Backend> {
    inner: Arc<TensorInner<B>>,
}

impl<B: Backend> Clone for Tensor<B> {
    fn clone(&self) -> Self {
        Tensor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Tensor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(id={:?}, shape={}, dtype={}, device={:?})",
            self.inner.id,
            self.inner.layout.shape(),
            self.inner.dtype,
            self.inner.device,
        )
    }
}

impl<B: Backend> Tensor<B> {
    // Internal constructors

    /// Create a tensor from existing storage and layout.
    pub(crate) fn from_storage(
        storage: B::Storage,
        layout: Layout,
        dtype: DType,
        device: B::Device,
        op: Op<B>,
    ) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::new(RwLock::new(storage)),
                layout,
                dtype,
                device,
                op,
            }),
        }
    }

    /// Wrap freshly computed contiguous storage of `shape` produced from `self`.
    pub(crate) fn derived(&self, storage: B::Storage, shape: Shape, dtype: DType, op: Op<B>) -> Self {
        Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            self.inner.device.clone(),
            op,
        )
    }

    /// A view sharing the same storage with a different layout.
    fn view_with_layout(&self, layout: Layout, op: Op<B>) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::clone(&self.inner.storage),
                layout,
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
                op,
            }),
        }
    }

    // Accessors

    pub fn id(&self) -> TensorId {
        self.inner.id
    }

    pub fn shape(&self) -> &Shape {
        self.inner.layout.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.inner.layout.dims()
    }

    pub fn rank(&self) -> usize {
        self.inner.layout.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.inner.layout.elem_count()
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn device(&self) -> &B::Device {
        &self.inner.device
    }

    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    pub fn is_contiguous(&self) -> bool {
        self.inner.layout.is_contiguous()
    }

    /// The op that created this tensor.
    pub fn op(&self) -> &Op<B> {
        &self.inner.op
    }

    /// Read lock on the underlying storage.
    pub fn storage(&self) -> Result<RwLockReadGuard<'_, B::Storage>> {
        self.inner
            .storage
            .read()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    pub(crate) fn same_device(&self, other: &Self) -> Result<()> {
        if self.device().same_device(other.device()) {
            Ok(())
        } else {
            Err(Error::DeviceMismatch {
                lhs: self.device().name(),
                rhs: other.device().name(),
            })
        }
    }

    // Creation methods

    pub fn zeros(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::zeros(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    pub fn ones(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        Self::full(shape, 1.0, dtype, device)
    }

    pub fn full(
        shape: impl Into<Shape>,
        val: f64,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        let storage = B::full(&shape, val, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// Create a tensor from a flat slice of f64 values, converted to `dtype`.
    pub fn from_f64_slice(
        data: &[f64],
        shape: impl Into<Shape>,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        let storage = B::from_f64_slice(data, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// Create a tensor from typed host data; the dtype follows `T`.
    pub fn from_slice<T: WithDType>(
        data: &[T],
        shape: impl Into<Shape>,
        device: &B::Device,
    ) -> Result<Self> {
        let values: Vec<f64> = data.iter().map(|&v| WithDType::to_f64(v)).collect();
        Self::from_f64_slice(&values, shape, T::DTYPE, device)
    }

    /// Random uniform values in [0, 1).
    pub fn rand(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::rand_uniform(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// Identity matrix (n × n).
    pub fn eye(n: usize, dtype: DType, device: &B::Device) -> Result<Self> {
        let mut data = vec![0.0f64; n * n];
        for i in 0..n {
            data[i * n + i] = 1.0;
        }
        Self::from_f64_slice(&data, (n, n), dtype, device)
    }

    pub fn zeros_like(other: &Self) -> Result<Self> {
        Self::zeros(other.shape().clone(), other.dtype(), other.device())
    }

    pub fn ones_like(other: &Self) -> Result<Self> {
        Self::ones(other.shape().clone(), other.dtype(), other.device())
    }

    // Shape manipulation (these create views, no data copy)

    /// Transpose two dimensions (no data copy).
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Self> {
        let new_layout = self.inner.layout.transpose(dim0, dim1)?;
        let op = Op::Transpose {
            input: self.clone(),
            dim0,
            dim1,
        };
        Ok(self.view_with_layout(new_layout, op))
    }

    /// Swap the trailing two axes (matrix transpose, batched).
    pub fn t(&self) -> Result<Self> {
        let rank = self.rank();
        if rank < 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: rank,
            });
        }
        self.transpose(rank - 2, rank - 1)
    }

    /// Permute the dimensions: output axis `i` is input axis `perm[i]`.
    pub fn permute(&self, perm: &[usize]) -> Result<Self> {
        let new_layout = self.inner.layout.permute(perm)?;
        let op = Op::Permute {
            input: self.clone(),
            perm: perm.to_vec(),
        };
        Ok(self.view_with_layout(new_layout, op))
    }

    /// Reshape to a new shape with the same element count.
    /// Non-contiguous tensors are made contiguous first.
    pub fn reshape(&self, new_shape: impl Into<Shape>) -> Result<Self> {
        let new_shape = new_shape.into();
        if self.shape() == &new_shape {
            return Ok(self.clone());
        }
        let current_count = self.elem_count();
        let new_count = new_shape.elem_count();
        if current_count != new_count {
            return Err(Error::ReshapeElementMismatch {
                src: current_count,
                dst: new_count,
                dst_shape: new_shape,
            });
        }
        let tensor = self.contiguous()?;
        let op = Op::Reshape {
            input: tensor.clone(),
            src_shape: tensor.shape().clone(),
        };
        Ok(tensor.view_with_layout(Layout::contiguous(new_shape), op))
    }

    /// Ensure the tensor is contiguous in memory.
    pub fn contiguous(&self) -> Result<Self> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }
        let new_storage = {
            let storage = self.storage()?;
            B::to_contiguous(&storage, &self.inner.layout)?
        };
        Ok(self.derived(
            new_storage,
            self.shape().clone(),
            self.dtype(),
            Op::Contiguous {
                input: self.clone(),
            },
        ))
    }

    /// Insert a size-1 axis at `dim`.
    pub fn unsqueeze(&self, dim: usize) -> Result<Self> {
        let rank = self.rank();
        if dim > rank {
            return Err(Error::DimOutOfRange {
                dim,
                rank: rank + 1,
            });
        }
        let mut new_dims = self.dims().to_vec();
        let mut new_strides = self.layout().strides().to_vec();
        let stride_val = if dim < rank { new_strides[dim] } else { 1 };
        new_dims.insert(dim, 1);
        new_strides.insert(dim, stride_val);
        let new_layout = Layout::new(Shape::new(new_dims), new_strides, self.layout().offset());
        let op = Op::Reshape {
            input: self.clone(),
            src_shape: self.shape().clone(),
        };
        Ok(self.view_with_layout(new_layout, op))
    }

    /// Remove axis `dim`, which must have size 1.
    pub fn squeeze(&self, dim: usize) -> Result<Self> {
        let rank = self.rank();
        if dim >= rank {
            return Err(Error::DimOutOfRange { dim, rank });
        }
        if self.dims()[dim] != 1 {
            return Err(Error::dim(format!(
                "squeeze: dimension {} has size {}, expected 1",
                dim,
                self.dims()[dim]
            )));
        }
        let mut new_dims = self.dims().to_vec();
        let mut new_strides = self.layout().strides().to_vec();
        new_dims.remove(dim);
        new_strides.remove(dim);
        let new_layout = Layout::new(Shape::new(new_dims), new_strides, self.layout().offset());
        let op = Op::Reshape {
            input: self.clone(),
            src_shape: self.shape().clone(),
        };
        Ok(self.view_with_layout(new_layout, op))
    }

    /// Broadcast view to `target` (right-aligned, stride 0 on expanded axes).
    pub fn expand(&self, target: impl Into<Shape>) -> Result<Self> {
        let target = target.into();
        if self.shape() == &target {
            return Ok(self.clone());
        }
        let new_layout = self.inner.layout.broadcast_as(&target)?;
        let op = Op::Expand {
            input: self.clone(),
            src_shape: self.shape().clone(),
        };
        Ok(self.view_with_layout(new_layout, op))
    }

    /// A leaf sharing this tensor's data, cut off from the graph.
    pub fn detach(&self) -> Self {
        self.view_with_layout(self.inner.layout.clone(), Op::None)
    }

    // Dtype conversion

    /// Cast to `dtype`. Gradients flow back through the cast.
    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        if self.dtype() == dtype {
            return Ok(self.clone());
        }
        let new_storage = {
            let storage = self.storage()?;
            B::cast(&storage, &self.inner.layout, dtype, self.device())?
        };
        Ok(self.derived(
            new_storage,
            self.shape().clone(),
            dtype,
            Op::ToDtype {
                input: self.clone(),
                src_dtype: self.dtype(),
            },
        ))
    }

    // Element-wise primitives used by gradient rules

    pub fn add(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Add)
    }

    pub fn sub(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Sub)
    }

    pub fn mul(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Mul)
    }

    pub fn neg(&self) -> Result<Self> {
        self.affine(-1.0, 0.0)
    }

    /// Broadcasting binary op over operands of the same dtype.
    fn binary_op(&self, rhs: &Self, op: BinaryOp) -> Result<Self> {
        if self.dtype() != rhs.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: rhs.dtype(),
            });
        }
        self.same_device(rhs)?;
        let out_shape = Shape::broadcast_shape(self.shape(), rhs.shape())?;
        let lhs_layout = self.inner.layout.broadcast_as(&out_shape)?;
        let rhs_layout = rhs.inner.layout.broadcast_as(&out_shape)?;
        let result = {
            let storage_lhs = self.storage()?;
            let storage_rhs = rhs.storage()?;
            B::binary_op(op, &storage_lhs, &lhs_layout, &storage_rhs, &rhs_layout)?
        };
        Ok(self.derived(
            result,
            out_shape,
            self.dtype(),
            Op::Binary {
                lhs: self.clone(),
                rhs: rhs.clone(),
                op,
            },
        ))
    }

    /// result = self * mul + add
    pub fn affine(&self, mul: f64, add: f64) -> Result<Self> {
        let result = {
            let storage = self.storage()?;
            B::affine(&storage, &self.inner.layout, mul, add)?
        };
        Ok(self.derived(
            result,
            self.shape().clone(),
            self.dtype(),
            Op::Affine {
                input: self.clone(),
                mul,
                add,
            },
        ))
    }

    /// Sum over `dims`, removing them from the shape.
    pub fn sum(&self, dims: &[usize]) -> Result<Self> {
        if dims.is_empty() {
            return Ok(self.clone());
        }
        let rank = self.rank();
        let mut sorted = dims.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        if let Some(&d) = sorted.iter().find(|&&d| d >= rank) {
            return Err(Error::DimOutOfRange { dim: d, rank });
        }
        let out_dims: Vec<usize> = self
            .dims()
            .iter()
            .enumerate()
            .filter(|(i, _)| !sorted.contains(i))
            .map(|(_, &d)| d)
            .collect();
        let result = {
            let storage = self.storage()?;
            B::sum(&storage, &self.inner.layout, &sorted)?
        };
        Ok(self.derived(
            result,
            Shape::new(out_dims),
            self.dtype(),
            Op::Sum {
                input: self.clone(),
                dims: sorted,
            },
        ))
    }

    /// Sum of all elements, as a 0-D tensor.
    pub fn sum_all(&self) -> Result<Self> {
        let dims: Vec<usize> = (0..self.rank()).collect();
        self.sum(&dims)
    }

    /// Sum the broadcast axes away so the result has `target` shape.
    ///
    /// Inverse of `expand`: leading axes missing from `target` and axes of
    /// size 1 in `target` are summed.
    pub fn sum_to_shape(&self, target: &Shape) -> Result<Self> {
        if self.shape() == target {
            return Ok(self.clone());
        }
        let src = self.dims();
        let dst = target.dims();
        if dst.len() > src.len() {
            return Err(Error::NotBroadcastable {
                lhs: target.clone(),
                rhs: self.shape().clone(),
            });
        }
        let lead = src.len() - dst.len();
        let mut dims: Vec<usize> = (0..lead).collect();
        for (i, &d) in dst.iter().enumerate() {
            let s = src[lead + i];
            if d == s {
                continue;
            }
            if d != 1 {
                return Err(Error::NotBroadcastable {
                    lhs: target.clone(),
                    rhs: self.shape().clone(),
                });
            }
            dims.push(lead + i);
        }
        self.sum(&dims)?.reshape(target.clone())
    }

    /// Lower triangle of the trailing two axes (`diagonal` as in numpy).
    pub fn tril(&self, diagonal: i64) -> Result<Self> {
        self.triangular(diagonal, false)
    }

    /// Upper triangle of the trailing two axes.
    pub fn triu(&self, diagonal: i64) -> Result<Self> {
        self.triangular(diagonal, true)
    }

    fn triangular(&self, diagonal: i64, upper: bool) -> Result<Self> {
        if self.rank() < 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.rank(),
            });
        }
        let result = {
            let storage = self.storage()?;
            B::triangular(&storage, &self.inner.layout, diagonal, upper)?
        };
        Ok(self.derived(
            result,
            self.shape().clone(),
            self.dtype(),
            Op::Triangular {
                input: self.clone(),
                diagonal,
                upper,
            },
        ))
    }

    // Host access

    /// Values in logical (row-major) order as f64.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let storage = self.storage()?;
        B::to_f64_vec(&storage, &self.inner.layout)
    }

    /// Values converted to `T`.
    pub fn to_vec<T: WithDType>(&self) -> Result<Vec<T>> {
        Ok(self.to_f64_vec()?.into_iter().map(T::from_f64).collect())
    }

    /// The single value of a one-element tensor.
    pub fn to_scalar_f64(&self) -> Result<f64> {
        if self.elem_count() != 1 {
            return Err(Error::NotAScalar {
                shape: self.shape().clone(),
            });
        }
        Ok(self.to_f64_vec()?[0])
    }

    // Autodiff

    /// Gradients of this scalar with respect to every tensor in its graph.
    pub fn backward(&self) -> Result<GradStore<B>> {
        crate::backprop::backward(self)
    }

    /// Gradients with an explicit upstream gradient of this tensor's shape.
    pub fn backward_with_grad(&self, grad: &Tensor<B>) -> Result<GradStore<B>> {
        crate::backprop::backward_with_grad(self, grad)
    }
}
