// CPU Backend — Native implementation of the vole Backend trait
//
// ARCHITECTURE:
// - CpuDevice is a unit handle: there is one host.
// - CpuStorage is an enum over a Vec<T> per dtype.
// - ops.rs:    creation, casts, element-wise plumbing, sums, gemm matmul
// - linalg.rs: LU solve/inverse and Householder QR (computed in f64)
// - conv.rs:   N-d convolution via im2col + GEMM, col2im for the adjoint
//
// The CPU backend advertises every capability.
//
// USAGE:
//   let dev = CpuDevice;
//   let a = CpuTensor::rand((3, 3), DType::F64, &dev)?;
//   let x = a.solve(&CpuTensor::ones(3, DType::F64, &dev)?)?;

mod conv;
mod linalg;
mod ops;

use std::fmt;

use half::{bf16, f16};
use vole_core::backend::{
    Backend, BackendDevice, BackendStorage, BinaryOp, Capabilities, ConvGeometry, QrFactors,
    QrMode,
};
use vole_core::dtype::DType;
use vole_core::error::Result;
use vole_core::layout::Layout;
use vole_core::shape::Shape;
use vole_core::tensor::Tensor;

pub use ops::par_threshold;

// CpuDevice

/// The host CPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuDevice;

impl BackendDevice for CpuDevice {
    fn name(&self) -> String {
        "cpu".to_string()
    }
}

// CpuStorage

/// Host-side storage, one variant per dtype.
#[derive(Clone)]
pub enum CpuStorage {
    Bool(Vec<bool>),
    U8(Vec<u8>),
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl fmt::Debug for CpuStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuStorage::{:?}(len={})", self.dtype(), self.len())
    }
}

impl BackendStorage for CpuStorage {
    fn dtype(&self) -> DType {
        match self {
            CpuStorage::Bool(_) => DType::Bool,
            CpuStorage::U8(_) => DType::U8,
            CpuStorage::I8(_) => DType::I8,
            CpuStorage::I16(_) => DType::I16,
            CpuStorage::I32(_) => DType::I32,
            CpuStorage::I64(_) => DType::I64,
            CpuStorage::F16(_) => DType::F16,
            CpuStorage::BF16(_) => DType::BF16,
            CpuStorage::F32(_) => DType::F32,
            CpuStorage::F64(_) => DType::F64,
        }
    }

    fn len(&self) -> usize {
        match self {
            CpuStorage::Bool(v) => v.len(),
            CpuStorage::U8(v) => v.len(),
            CpuStorage::I8(v) => v.len(),
            CpuStorage::I16(v) => v.len(),
            CpuStorage::I32(v) => v.len(),
            CpuStorage::I64(v) => v.len(),
            CpuStorage::F16(v) => v.len(),
            CpuStorage::BF16(v) => v.len(),
            CpuStorage::F32(v) => v.len(),
            CpuStorage::F64(v) => v.len(),
        }
    }
}

// CpuBackend

#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

/// A tensor living on the CPU.
pub type CpuTensor = Tensor<CpuBackend>;

impl Backend for CpuBackend {
    type Device = CpuDevice;
    type Storage = CpuStorage;

    fn name() -> &'static str {
        "cpu"
    }

    fn capabilities(_device: &CpuDevice) -> Capabilities {
        Capabilities::full()
    }

    fn zeros(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(ops::full(shape.elem_count(), 0.0, dtype))
    }

    fn full(shape: &Shape, val: f64, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(ops::full(shape.elem_count(), val, dtype))
    }

    fn from_f64_slice(data: &[f64], dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(ops::from_f64_slice(data, dtype))
    }

    fn rand_uniform(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(ops::rand_uniform(shape.elem_count(), dtype))
    }

    fn to_contiguous(input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        Ok(ops::to_contiguous(input, layout))
    }

    fn to_f64_vec(input: &CpuStorage, layout: &Layout) -> Result<Vec<f64>> {
        Ok(ops::to_f64_vec(input, layout))
    }

    fn cast(
        input: &CpuStorage,
        layout: &Layout,
        dtype: DType,
        _device: &CpuDevice,
    ) -> Result<CpuStorage> {
        Ok(ops::cast(input, layout, dtype))
    }

    fn binary_op(
        op: BinaryOp,
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        ops::binary_op(op, lhs, lhs_layout, rhs, rhs_layout)
    }

    fn affine(input: &CpuStorage, layout: &Layout, mul: f64, add: f64) -> Result<CpuStorage> {
        ops::affine(input, layout, mul, add)
    }

    fn sum(input: &CpuStorage, layout: &Layout, dims: &[usize]) -> Result<CpuStorage> {
        Ok(ops::sum(input, layout, dims))
    }

    fn triangular(
        input: &CpuStorage,
        layout: &Layout,
        diagonal: i64,
        upper: bool,
    ) -> Result<CpuStorage> {
        ops::triangular(input, layout, diagonal, upper)
    }

    fn matmul(
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        ops::matmul(lhs, lhs_layout, rhs, rhs_layout)
    }

    fn solve(
        a: &CpuStorage,
        a_layout: &Layout,
        b: &CpuStorage,
        b_layout: &Layout,
    ) -> Result<CpuStorage> {
        linalg::solve(a, a_layout, b, b_layout)
    }

    fn inverse(a: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        linalg::inverse(a, layout)
    }

    fn qr(a: &CpuStorage, layout: &Layout, mode: QrMode) -> Result<QrFactors<CpuStorage>> {
        linalg::qr(a, layout, mode)
    }

    fn conv_forward(
        image: &CpuStorage,
        image_layout: &Layout,
        weight: &CpuStorage,
        weight_layout: &Layout,
        geom: &ConvGeometry,
    ) -> Result<CpuStorage> {
        conv::forward(image, image_layout, weight, weight_layout, geom)
    }

    fn conv_backward_data(
        col: &CpuStorage,
        col_layout: &Layout,
        weight: &CpuStorage,
        weight_layout: &Layout,
        geom: &ConvGeometry,
    ) -> Result<CpuStorage> {
        conv::backward_data(col, col_layout, weight, weight_layout, geom)
    }

    fn conv_backward_weight(
        image: &CpuStorage,
        image_layout: &Layout,
        col: &CpuStorage,
        col_layout: &Layout,
        geom: &ConvGeometry,
    ) -> Result<CpuStorage> {
        conv::backward_weight(image, image_layout, col, col_layout, geom)
    }
}

#[cfg(test)]
pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
