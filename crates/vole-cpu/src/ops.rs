// CPU Operations — The actual math implementations
//
// Each function takes storage (the raw data) + layout (shape/strides/offset)
// and returns new contiguous storage with the result.
//
// KEY CONCEPT: Layout-aware iteration
//
// Operands might not be contiguous (transposed views, stride-0 broadcast
// axes). Layout::strided_indices() walks elements in logical order and maps
// each one to its flat position in the underlying storage.
//
// DTYPE DISPATCH:
//
// Kernels are written once, generic over `Elem`, and instantiated per
// CpuStorage variant by the `with_storage!` / `map_storage!` macros.
// Integer arithmetic wraps. Bool uses OR for `+` and AND for `*`, which
// turns the naive matmul into the boolean matrix product.
//
// PERFORMANCE NOTE:
// F32/F64 matmul goes to the `gemm` crate (SIMD, arbitrary strides, so
// transposed operands are not copied). Element-wise ops take a contiguous
// fast path and switch to rayon above `par_threshold()` elements.

use std::sync::OnceLock;

use half::{bf16, f16};
use rand::Rng;
use rayon::prelude::*;

use crate::CpuStorage;
use vole_core::backend::{BackendStorage, BinaryOp};
use vole_core::dtype::DType;
use vole_core::error::{Error, Result};
use vole_core::layout::Layout;
use vole_core::shape::Shape;

const DEFAULT_PAR_THRESHOLD: usize = 100_000;

/// Minimum number of elements before kernels go parallel.
///
/// Read once from `VOLE_CPU_PAR_THRESHOLD`, default 100 000.
pub fn par_threshold() -> usize {
    static THRESHOLD: OnceLock<usize> = OnceLock::new();
    *THRESHOLD.get_or_init(|| {
        let value = std::env::var("VOLE_CPU_PAR_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PAR_THRESHOLD);
        log::debug!("cpu: parallel threshold {} elements", value);
        value
    })
}

// Elem — scalar arithmetic per dtype

pub(crate) trait Elem: Copy + Send + Sync + 'static {
    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;
    fn zero() -> Self;
    fn add(self, rhs: Self) -> Self;
    fn sub(self, rhs: Self) -> Self;
    fn mul(self, rhs: Self) -> Self;
}

macro_rules! elem_int {
    ($($t:ty),*) => {
        $(
            impl Elem for $t {
                fn from_f64(v: f64) -> Self {
                    v as $t
                }
                fn to_f64(self) -> f64 {
                    self as f64
                }
                fn zero() -> Self {
                    0
                }
                fn add(self, rhs: Self) -> Self {
                    self.wrapping_add(rhs)
                }
                fn sub(self, rhs: Self) -> Self {
                    self.wrapping_sub(rhs)
                }
                fn mul(self, rhs: Self) -> Self {
                    self.wrapping_mul(rhs)
                }
            }
        )*
    };
}

elem_int!(u8, i8, i16, i32, i64);

macro_rules! elem_float {
    ($($t:ty => $from:expr, $to:expr, $zero:expr);* $(;)?) => {
        $(
            impl Elem for $t {
                fn from_f64(v: f64) -> Self {
                    $from(v)
                }
                fn to_f64(self) -> f64 {
                    $to(self)
                }
                fn zero() -> Self {
                    $zero
                }
                fn add(self, rhs: Self) -> Self {
                    self + rhs
                }
                fn sub(self, rhs: Self) -> Self {
                    self - rhs
                }
                fn mul(self, rhs: Self) -> Self {
                    self * rhs
                }
            }
        )*
    };
}

elem_float!(
    f32 => |v: f64| v as f32, |x: f32| x as f64, 0.0;
    f64 => |v: f64| v, |x: f64| x, 0.0;
    f16 => f16::from_f64, f16::to_f64, f16::ZERO;
    bf16 => bf16::from_f64, bf16::to_f64, bf16::ZERO;
);

impl Elem for bool {
    fn from_f64(v: f64) -> Self {
        v != 0.0
    }
    fn to_f64(self) -> f64 {
        if self {
            1.0
        } else {
            0.0
        }
    }
    fn zero() -> Self {
        false
    }
    fn add(self, rhs: Self) -> Self {
        self | rhs
    }
    fn sub(self, rhs: Self) -> Self {
        self ^ rhs
    }
    fn mul(self, rhs: Self) -> Self {
        self & rhs
    }
}

// Dispatch helpers

/// Evaluate `$body` with `$d` bound to the typed Vec of `$s`.
macro_rules! with_storage {
    ($s:expr, $d:ident => $body:expr) => {
        match $s {
            CpuStorage::Bool($d) => $body,
            CpuStorage::U8($d) => $body,
            CpuStorage::I8($d) => $body,
            CpuStorage::I16($d) => $body,
            CpuStorage::I32($d) => $body,
            CpuStorage::I64($d) => $body,
            CpuStorage::F16($d) => $body,
            CpuStorage::BF16($d) => $body,
            CpuStorage::F32($d) => $body,
            CpuStorage::F64($d) => $body,
        }
    };
}

/// Like `with_storage!`, re-wrapping the result in the same variant.
macro_rules! map_storage {
    ($s:expr, $d:ident => $body:expr) => {
        match $s {
            CpuStorage::Bool($d) => CpuStorage::Bool($body),
            CpuStorage::U8($d) => CpuStorage::U8($body),
            CpuStorage::I8($d) => CpuStorage::I8($body),
            CpuStorage::I16($d) => CpuStorage::I16($body),
            CpuStorage::I32($d) => CpuStorage::I32($body),
            CpuStorage::I64($d) => CpuStorage::I64($body),
            CpuStorage::F16($d) => CpuStorage::F16($body),
            CpuStorage::BF16($d) => CpuStorage::BF16($body),
            CpuStorage::F32($d) => CpuStorage::F32($body),
            CpuStorage::F64($d) => CpuStorage::F64($body),
        }
    };
}

/// Build storage of `$dtype` from a generic expression whose element type
/// is inferred from the variant.
macro_rules! storage_of {
    ($dtype:expr, $body:expr) => {
        match $dtype {
            DType::Bool => CpuStorage::Bool($body),
            DType::U8 => CpuStorage::U8($body),
            DType::I8 => CpuStorage::I8($body),
            DType::I16 => CpuStorage::I16($body),
            DType::I32 => CpuStorage::I32($body),
            DType::I64 => CpuStorage::I64($body),
            DType::F16 => CpuStorage::F16($body),
            DType::BF16 => CpuStorage::BF16($body),
            DType::F32 => CpuStorage::F32($body),
            DType::F64 => CpuStorage::F64($body),
        }
    };
}

// Creation

fn convert<T: Elem>(data: &[f64]) -> Vec<T> {
    data.iter().map(|&v| T::from_f64(v)).collect()
}

fn filled<T: Elem>(n: usize, val: f64) -> Vec<T> {
    vec![T::from_f64(val); n]
}

pub fn full(n: usize, val: f64, dtype: DType) -> CpuStorage {
    storage_of!(dtype, filled(n, val))
}

pub fn from_f64_slice(data: &[f64], dtype: DType) -> CpuStorage {
    storage_of!(dtype, convert(data))
}

/// Uniform [0, 1) values drawn in f64 and converted to `dtype`.
pub fn rand_uniform(n: usize, dtype: DType) -> CpuStorage {
    let mut rng = rand::thread_rng();
    let data: Vec<f64> = (0..n).map(|_| rng.gen::<f64>()).collect();
    from_f64_slice(&data, dtype)
}

// Data movement

pub(crate) fn gather<T: Copy>(data: &[T], layout: &Layout) -> Vec<T> {
    if layout.is_contiguous() {
        return data[..layout.elem_count()].to_vec();
    }
    layout.strided_indices().map(|idx| data[idx]).collect()
}

fn read_f64<T: Elem>(data: &[T], layout: &Layout) -> Vec<f64> {
    layout.strided_indices().map(|idx| data[idx].to_f64()).collect()
}

/// Contiguous copy of storage following the given layout.
pub fn to_contiguous(input: &CpuStorage, layout: &Layout) -> CpuStorage {
    map_storage!(input, d => gather(d, layout))
}

/// Values in logical order as f64.
pub fn to_f64_vec(input: &CpuStorage, layout: &Layout) -> Vec<f64> {
    with_storage!(input, d => read_f64(d, layout))
}

/// Contiguous copy converted to `dtype` (float → int truncates, any → bool
/// tests for non-zero).
pub fn cast(input: &CpuStorage, layout: &Layout, dtype: DType) -> CpuStorage {
    if input.dtype() == dtype {
        return to_contiguous(input, layout);
    }
    from_f64_slice(&to_f64_vec(input, layout), dtype)
}

// Binary operations

fn zip_with<T: Elem>(op: BinaryOp, l: &[T], ll: &Layout, r: &[T], rl: &Layout) -> Vec<T> {
    let f = move |a: T, b: T| match op {
        BinaryOp::Add => a.add(b),
        BinaryOp::Sub => a.sub(b),
        BinaryOp::Mul => a.mul(b),
    };
    let n = ll.elem_count();
    if ll.is_contiguous() && rl.is_contiguous() {
        let (ls, rs) = (&l[..n], &r[..n]);
        if n >= par_threshold() {
            ls.par_iter().zip(rs.par_iter()).map(|(&a, &b)| f(a, b)).collect()
        } else {
            ls.iter().zip(rs.iter()).map(|(&a, &b)| f(a, b)).collect()
        }
    } else {
        ll.strided_indices()
            .zip(rl.strided_indices())
            .map(|(i, j)| f(l[i], r[j]))
            .collect()
    }
}

pub fn binary_op(
    op: BinaryOp,
    lhs: &CpuStorage,
    lhs_layout: &Layout,
    rhs: &CpuStorage,
    rhs_layout: &Layout,
) -> Result<CpuStorage> {
    if lhs.dtype() != rhs.dtype() {
        return Err(Error::DTypeMismatch {
            expected: lhs.dtype(),
            got: rhs.dtype(),
        });
    }
    if op == BinaryOp::Sub && lhs.dtype() == DType::Bool {
        return Err(Error::UnsupportedDType {
            op: "sub",
            dtype: DType::Bool,
        });
    }
    macro_rules! arm {
        ($l:expr, $r:expr, $ctor:path) => {
            $ctor(zip_with(op, $l, lhs_layout, $r, rhs_layout))
        };
    }
    Ok(match (lhs, rhs) {
        (CpuStorage::Bool(l), CpuStorage::Bool(r)) => arm!(l, r, CpuStorage::Bool),
        (CpuStorage::U8(l), CpuStorage::U8(r)) => arm!(l, r, CpuStorage::U8),
        (CpuStorage::I8(l), CpuStorage::I8(r)) => arm!(l, r, CpuStorage::I8),
        (CpuStorage::I16(l), CpuStorage::I16(r)) => arm!(l, r, CpuStorage::I16),
        (CpuStorage::I32(l), CpuStorage::I32(r)) => arm!(l, r, CpuStorage::I32),
        (CpuStorage::I64(l), CpuStorage::I64(r)) => arm!(l, r, CpuStorage::I64),
        (CpuStorage::F16(l), CpuStorage::F16(r)) => arm!(l, r, CpuStorage::F16),
        (CpuStorage::BF16(l), CpuStorage::BF16(r)) => arm!(l, r, CpuStorage::BF16),
        (CpuStorage::F32(l), CpuStorage::F32(r)) => arm!(l, r, CpuStorage::F32),
        (CpuStorage::F64(l), CpuStorage::F64(r)) => arm!(l, r, CpuStorage::F64),
        (l, r) => {
            return Err(Error::DTypeMismatch {
                expected: l.dtype(),
                got: r.dtype(),
            })
        }
    })
}

fn affine_elems<T: Elem>(data: &[T], layout: &Layout, mul: f64, add: f64) -> Vec<T> {
    let f = move |v: T| T::from_f64(v.to_f64() * mul + add);
    let n = layout.elem_count();
    if layout.is_contiguous() {
        let slice = &data[..n];
        if n >= par_threshold() {
            slice.par_iter().map(|&v| f(v)).collect()
        } else {
            slice.iter().map(|&v| f(v)).collect()
        }
    } else {
        layout.strided_indices().map(|idx| f(data[idx])).collect()
    }
}

/// `input * mul + add`, evaluated in f64 and rounded back.
pub fn affine(input: &CpuStorage, layout: &Layout, mul: f64, add: f64) -> Result<CpuStorage> {
    if input.dtype() == DType::Bool {
        return Err(Error::UnsupportedDType {
            op: "affine",
            dtype: DType::Bool,
        });
    }
    Ok(map_storage!(input, d => affine_elems(d, layout, mul, add)))
}

// Reductions
//
// The output is addressed through a second layout over the *input* shape
// whose strides are the output's contiguous strides on kept axes and 0 on
// reduced axes. Zipping the two strided walks pairs every source element
// with its destination slot.

fn sum_dims<T: Elem>(data: &[T], layout: &Layout, dims: &[usize]) -> Vec<T> {
    let in_dims = layout.dims();
    let out_dims: Vec<usize> = (0..in_dims.len())
        .filter(|a| !dims.contains(a))
        .map(|a| in_dims[a])
        .collect();
    let out_shape = Shape::new(out_dims);
    let out_strides = out_shape.stride_contiguous();

    let mut strides = vec![0usize; in_dims.len()];
    let mut kept = out_strides.iter();
    for (axis, stride) in strides.iter_mut().enumerate() {
        if !dims.contains(&axis) {
            if let Some(&s) = kept.next() {
                *stride = s;
            }
        }
    }
    let target = Layout::new(layout.shape().clone(), strides, 0);

    let mut out = vec![T::zero(); out_shape.elem_count()];
    for (src, dst) in layout.strided_indices().zip(target.strided_indices()) {
        out[dst] = out[dst].add(data[src]);
    }
    out
}

/// Sum over `dims` (removed from the output).
pub fn sum(input: &CpuStorage, layout: &Layout, dims: &[usize]) -> CpuStorage {
    map_storage!(input, d => sum_dims(d, layout, dims))
}

fn mask_triangle<T: Elem>(data: &[T], layout: &Layout, diagonal: i64, upper: bool) -> Vec<T> {
    let dims = layout.dims();
    let rank = dims.len();
    let (m, n) = (dims[rank - 2], dims[rank - 1]);
    layout
        .strided_indices()
        .enumerate()
        .map(|(i, src)| {
            let col = (i % n) as i64;
            let row = ((i / n) % m) as i64;
            let keep = if upper {
                col - row >= diagonal
            } else {
                col - row <= diagonal
            };
            if keep {
                data[src]
            } else {
                T::zero()
            }
        })
        .collect()
}

/// Keep the upper (or lower) triangle of the two trailing axes.
pub fn triangular(
    input: &CpuStorage,
    layout: &Layout,
    diagonal: i64,
    upper: bool,
) -> Result<CpuStorage> {
    if layout.rank() < 2 {
        return Err(Error::RankMismatch {
            expected: 2,
            got: layout.rank(),
        });
    }
    if layout.elem_count() == 0 {
        return Ok(to_contiguous(input, layout));
    }
    Ok(map_storage!(input, d => mask_triangle(d, layout, diagonal, upper)))
}

// Matrix multiplication: C = A @ B, batched
//
//   (*batch, m, k) @ (*batch, k, n) → (*batch, m, n)
//
// Both layouts carry the same batch dims. Batch offsets come from walking
// a layout restricted to the batch axes, so stride-0 (broadcast) batches
// reuse one matrix without a copy. Within a batch the two matrix strides
// go straight to gemm, which accepts any row/column stride.

/// Storage offset of every batch matrix, in batch order.
pub(crate) fn batch_offsets(layout: &Layout) -> Vec<usize> {
    let rank = layout.rank();
    Layout::new(
        Shape::new(layout.dims()[..rank - 2].to_vec()),
        layout.strides()[..rank - 2].to_vec(),
        layout.offset(),
    )
    .strided_indices()
    .collect()
}

/// `(rows, cols, row_stride, col_stride)` of the trailing matrix.
fn matrix_geometry(layout: &Layout) -> (usize, usize, isize, isize) {
    let rank = layout.rank();
    let dims = layout.dims();
    let strides = layout.strides();
    (
        dims[rank - 2],
        dims[rank - 1],
        strides[rank - 2] as isize,
        strides[rank - 1] as isize,
    )
}

/// `dst (m × n, row-major) = [dst +] lhs (m × k) · rhs (k × n)`, where
/// `lhs` and `rhs` start at the given slices and are addressed through
/// `(row stride, column stride)`. F32/F64 only.
#[allow(clippy::too_many_arguments)]
pub(crate) fn gemm_into<T: Elem>(
    dst: &mut [T],
    accumulate: bool,
    (m, n, k): (usize, usize, usize),
    lhs: &[T],
    (lhs_rs, lhs_cs): (isize, isize),
    rhs: &[T],
    (rhs_rs, rhs_cs): (isize, isize),
    parallelism: gemm::Parallelism,
) {
    debug_assert!(dst.len() >= m * n);
    // SAFETY: the layouts the strides come from address only elements
    // inside `lhs` and `rhs`, and `dst` holds at least m*n elements.
    unsafe {
        gemm::gemm(
            m,
            n,
            k,
            dst.as_mut_ptr(),
            1,
            n as isize,
            accumulate,
            lhs.as_ptr(),
            lhs_cs,
            lhs_rs,
            rhs.as_ptr(),
            rhs_cs,
            rhs_rs,
            T::from_f64(1.0),
            T::from_f64(1.0),
            false,
            false,
            false,
            parallelism,
        );
    }
}

fn matmul_gemm<T: Elem>(a: &[T], al: &Layout, b: &[T], bl: &Layout) -> Vec<T> {
    let (m, k, a_rs, a_cs) = matrix_geometry(al);
    let (_, n, b_rs, b_cs) = matrix_geometry(bl);
    let a_off = batch_offsets(al);
    let b_off = batch_offsets(bl);
    let mn = m * n;
    let mut out = vec![T::zero(); a_off.len() * mn];

    let run = |c: &mut [T], ao: usize, bo: usize, par: gemm::Parallelism| {
        gemm_into(
            c,
            false,
            (m, n, k),
            &a[ao..],
            (a_rs, a_cs),
            &b[bo..],
            (b_rs, b_cs),
            par,
        )
    };

    let work = a_off.len() * mn * k;
    if a_off.len() > 1 && work >= par_threshold() {
        out.par_chunks_mut(mn)
            .zip(a_off.par_iter().zip(b_off.par_iter()))
            .for_each(|(c, (&ao, &bo))| run(c, ao, bo, gemm::Parallelism::None));
    } else {
        let par = if work >= par_threshold() {
            gemm::Parallelism::Rayon(0)
        } else {
            gemm::Parallelism::None
        };
        for (c, (&ao, &bo)) in out.chunks_mut(mn).zip(a_off.iter().zip(b_off.iter())) {
            run(c, ao, bo, par);
        }
    }
    out
}

fn matmul_naive<T: Elem>(a: &[T], al: &Layout, b: &[T], bl: &Layout) -> Vec<T> {
    let (m, k, a_rs, a_cs) = matrix_geometry(al);
    let (_, n, b_rs, b_cs) = matrix_geometry(bl);
    let (a_rs, a_cs, b_rs, b_cs) = (a_rs as usize, a_cs as usize, b_rs as usize, b_cs as usize);
    let a_off = batch_offsets(al);
    let b_off = batch_offsets(bl);
    let mut out = Vec::with_capacity(a_off.len() * m * n);
    for (&ao, &bo) in a_off.iter().zip(b_off.iter()) {
        for i in 0..m {
            for j in 0..n {
                let mut acc = T::zero();
                for p in 0..k {
                    let x = a[ao + i * a_rs + p * a_cs];
                    let y = b[bo + p * b_rs + j * b_cs];
                    acc = acc.add(x.mul(y));
                }
                out.push(acc);
            }
        }
    }
    out
}

/// Run an F32 kernel on half-precision operands: both are widened to F32,
/// the result is rounded back to the operands' dtype.
pub(crate) fn widened<F>(
    lhs: &CpuStorage,
    lhs_layout: &Layout,
    rhs: &CpuStorage,
    rhs_layout: &Layout,
    kernel: F,
) -> Result<CpuStorage>
where
    F: Fn(&CpuStorage, &Layout, &CpuStorage, &Layout) -> Result<CpuStorage>,
{
    let dtype = lhs.dtype();
    let l = cast(lhs, lhs_layout, DType::F32);
    let r = cast(rhs, rhs_layout, DType::F32);
    let ll = Layout::contiguous(lhs_layout.shape().clone());
    let rl = Layout::contiguous(rhs_layout.shape().clone());
    let out = kernel(&l, &ll, &r, &rl)?;
    let out_len = out.len();
    Ok(cast(&out, &Layout::contiguous(Shape::from(out_len)), dtype))
}

pub fn matmul(
    lhs: &CpuStorage,
    lhs_layout: &Layout,
    rhs: &CpuStorage,
    rhs_layout: &Layout,
) -> Result<CpuStorage> {
    log::trace!(
        "cpu matmul: {} x {} ({})",
        lhs_layout.shape(),
        rhs_layout.shape(),
        lhs.dtype()
    );
    Ok(match (lhs, rhs) {
        (CpuStorage::F32(l), CpuStorage::F32(r)) => {
            CpuStorage::F32(matmul_gemm(l, lhs_layout, r, rhs_layout))
        }
        (CpuStorage::F64(l), CpuStorage::F64(r)) => {
            CpuStorage::F64(matmul_gemm(l, lhs_layout, r, rhs_layout))
        }
        (CpuStorage::F16(_), CpuStorage::F16(_)) | (CpuStorage::BF16(_), CpuStorage::BF16(_)) => {
            return widened(lhs, lhs_layout, rhs, rhs_layout, matmul)
        }
        (CpuStorage::Bool(l), CpuStorage::Bool(r)) => {
            CpuStorage::Bool(matmul_naive(l, lhs_layout, r, rhs_layout))
        }
        (CpuStorage::U8(l), CpuStorage::U8(r)) => {
            CpuStorage::U8(matmul_naive(l, lhs_layout, r, rhs_layout))
        }
        (CpuStorage::I8(l), CpuStorage::I8(r)) => {
            CpuStorage::I8(matmul_naive(l, lhs_layout, r, rhs_layout))
        }
        (CpuStorage::I16(l), CpuStorage::I16(r)) => {
            CpuStorage::I16(matmul_naive(l, lhs_layout, r, rhs_layout))
        }
        (CpuStorage::I32(l), CpuStorage::I32(r)) => {
            CpuStorage::I32(matmul_naive(l, lhs_layout, r, rhs_layout))
        }
        (CpuStorage::I64(l), CpuStorage::I64(r)) => {
            CpuStorage::I64(matmul_naive(l, lhs_layout, r, rhs_layout))
        }
        (l, r) => {
            return Err(Error::DTypeMismatch {
                expected: l.dtype(),
                got: r.dtype(),
            })
        }
    })
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{init_logger, CpuDevice, CpuTensor};

    fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
        assert_eq!(got.len(), expected.len(), "length mismatch");
        for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
            assert!((g - e).abs() < tol, "index {}: got {} expected {}", i, g, e);
        }
    }

    #[test]
    fn test_from_slice_typed_storage() -> Result<()> {
        init_logger();
        let dev = CpuDevice;
        let a = CpuTensor::from_slice(&[1i32, -2, 3], 3, &dev)?;
        assert_eq!(a.dtype(), DType::I32);
        assert_eq!(a.to_vec::<i32>()?, vec![1, -2, 3]);

        let b = CpuTensor::from_slice(&[1.25f32, -0.5], 2, &dev)?;
        assert_eq!(b.dtype(), DType::F32);
        assert_eq!(b.to_vec::<f32>()?, vec![1.25, -0.5]);
        assert_eq!(b.add(&b)?.to_f64_vec()?, vec![2.5, -1.0]);
        Ok(())
    }

    #[test]
    fn test_binary_broadcast_and_wrapping() -> Result<()> {
        init_logger();
        let dev = CpuDevice;
        let a = CpuTensor::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), DType::F32, &dev)?;
        let b = CpuTensor::from_f64_slice(&[10.0, 20.0], 2, DType::F32, &dev)?;
        assert_vec_approx(&a.add(&b)?.to_f64_vec()?, &[11.0, 22.0, 13.0, 24.0], 1e-6);

        let x = CpuTensor::from_f64_slice(&[120.0], 1, DType::I8, &dev)?;
        let y = CpuTensor::from_f64_slice(&[10.0], 1, DType::I8, &dev)?;
        assert_eq!(x.add(&y)?.to_vec::<i8>()?, vec![-126]);
        Ok(())
    }

    #[test]
    fn test_sum_dims() -> Result<()> {
        let dev = CpuDevice;
        let data: Vec<f64> = (0..24).map(|v| v as f64).collect();
        let t = CpuTensor::from_f64_slice(&data, (2, 3, 4), DType::F64, &dev)?;
        let s = t.sum(&[0, 2])?;
        assert_eq!(s.dims(), &[3]);
        assert_eq!(s.to_f64_vec()?, vec![60.0, 92.0, 124.0]);

        // transposed input
        let s = t.transpose(1, 2)?.sum(&[1])?;
        assert_eq!(s.dims(), &[2, 3]);
        assert_eq!(s.to_f64_vec()?, vec![6.0, 22.0, 38.0, 54.0, 70.0, 86.0]);
        Ok(())
    }

    #[test]
    fn test_triangular() -> Result<()> {
        let dev = CpuDevice;
        let t = CpuTensor::ones((3, 3), DType::F64, &dev)?;
        assert_eq!(
            t.tril(0)?.to_f64_vec()?,
            vec![1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0, 1.0]
        );
        assert_eq!(
            t.triu(1)?.to_f64_vec()?,
            vec![0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]
        );
        Ok(())
    }

    #[test]
    fn test_matmul_strided_and_broadcast() -> Result<()> {
        let dev = CpuDevice;
        let a = CpuTensor::from_f64_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (3, 2), DType::F64, &dev)?;
        // aᵀ (2, 3) is a strided view handed to gemm directly
        let b = CpuTensor::from_f64_slice(&[1.0, 0.0, 0.0, 1.0, 1.0, 1.0], (3, 2), DType::F64, &dev)?;
        let c = a.t()?.dot(&b)?;
        assert_eq!(c.dims(), &[2, 2]);
        assert_vec_approx(&c.to_f64_vec()?, &[6.0, 8.0, 8.0, 10.0], 1e-12);

        let batch = CpuTensor::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 1, 2), DType::F32, &dev)?;
        let c = batch.dot(&a.t()?.to_dtype(DType::F32)?)?;
        assert_eq!(c.dims(), &[2, 1, 3]);
        assert_vec_approx(&c.to_f64_vec()?, &[5.0, 11.0, 17.0, 11.0, 25.0, 39.0], 1e-5);
        Ok(())
    }

    #[test]
    fn test_matmul_integer_bool_half() -> Result<()> {
        let dev = CpuDevice;
        let a = CpuTensor::from_slice(&[1i32, 2, 3, 4], (2, 2), &dev)?;
        let b = CpuTensor::from_slice(&[5i32, 6, 7, 8], (2, 2), &dev)?;
        assert_eq!(a.dot(&b)?.to_vec::<i32>()?, vec![19, 22, 43, 50]);

        let p = CpuTensor::from_f64_slice(&[1.0, 0.0, 0.0, 0.0], (2, 2), DType::Bool, &dev)?;
        let q = CpuTensor::from_f64_slice(&[0.0, 1.0, 1.0, 0.0], (2, 2), DType::Bool, &dev)?;
        assert_eq!(p.dot(&q)?.to_f64_vec()?, vec![0.0, 1.0, 0.0, 0.0]);

        let h = CpuTensor::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), DType::F16, &dev)?;
        let r = h.dot(&h)?;
        assert_eq!(r.dtype(), DType::F16);
        assert_vec_approx(&r.to_f64_vec()?, &[7.0, 10.0, 15.0, 22.0], 1e-2);
        Ok(())
    }

    #[test]
    fn test_cast_and_bool_sub() -> Result<()> {
        let dev = CpuDevice;
        let t = CpuTensor::from_f64_slice(&[1.7, -0.2, 0.0], 3, DType::F64, &dev)?;
        assert_eq!(t.to_dtype(DType::I32)?.to_vec::<i32>()?, vec![1, 0, 0]);
        assert_eq!(t.to_dtype(DType::Bool)?.to_f64_vec()?, vec![1.0, 1.0, 0.0]);

        let b = CpuTensor::ones(2, DType::Bool, &dev)?;
        assert!(b.sub(&b).is_err());
        Ok(())
    }

    #[test]
    fn test_par_threshold_is_positive() {
        assert!(par_threshold() > 0);
    }
}
