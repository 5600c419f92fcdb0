// Op — Computational graph node for automatic differentiation
//
// Every tensor that results from a routine records HOW it was created via
// the Op enum. The ops form a DAG that backward() traverses:
//
//   x = A.solve(b)
//     A.op = Op::None                (leaf)
//     b.op = Op::None                (leaf)
//     x.op = Op::Solve { a: A, b }
//
// Each variant stores the input tensors themselves (Arc clones), so the
// graph lives exactly as long as the outputs that reference it.
//
// Ops never reference their own output. Rules that need the forward result
// (solve, inv, qr) recompute it from the stored inputs inside backward, which
// keeps the graph acyclic and makes the recomputed value differentiable for
// double backward.

use crate::backend::{Backend, BinaryOp, ConvGeometry, QrMode};
use crate::dtype::DType;
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Unique identifier for a tensor. Used as keys in GradStore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub(crate) u64);

impl Default for TensorId {
    fn default() -> Self {
        Self::new()
    }
}

impl TensorId {
    /// Generate a new unique tensor ID (global atomic counter).
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        TensorId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Which factor of a QR decomposition a tensor holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QrPart {
    Q,
    R,
    /// Householder reflectors of `raw` mode.
    H,
    /// Reflector scalings of `raw` mode.
    Tau,
}

/// Records the operation that produced a tensor, storing references to inputs.
#[derive(Clone)]
pub enum Op<B: Backend> {
    /// Leaf tensor (input data or constant).
    None,

    /// Element-wise binary with broadcasting: result = op(lhs, rhs).
    Binary {
        lhs: Tensor<B>,
        rhs: Tensor<B>,
        op: BinaryOp,
    },

    /// result = input * mul + add
    Affine {
        input: Tensor<B>,
        mul: f64,
        add: f64,
    },

    /// Sum over `dims` (removed from the shape).
    Sum { input: Tensor<B>, dims: Vec<usize> },

    /// Reshape, squeeze and unsqueeze.
    Reshape { input: Tensor<B>, src_shape: Shape },

    Transpose {
        input: Tensor<B>,
        dim0: usize,
        dim1: usize,
    },

    /// Output axis `i` is input axis `perm[i]`.
    Permute { input: Tensor<B>, perm: Vec<usize> },

    /// Broadcast view (stride 0 on expanded axes).
    Expand { input: Tensor<B>, src_shape: Shape },

    /// Same values, contiguous storage.
    Contiguous { input: Tensor<B> },

    /// Backward casts the gradient back to `src_dtype`.
    ToDtype { input: Tensor<B>, src_dtype: DType },

    /// tril / triu of the trailing two axes.
    Triangular {
        input: Tensor<B>,
        diagonal: i64,
        upper: bool,
    },

    /// Batched matrix product of two operands of rank ≥ 2 with broadcast
    /// batch axes.
    Dot { lhs: Tensor<B>, rhs: Tensor<B> },

    /// x = solve(a, b), `b` of shape (n, k).
    Solve { a: Tensor<B>, b: Tensor<B> },

    Inverse { input: Tensor<B> },

    /// One factor of `qr(input, mode)`.
    Qr {
        input: Tensor<B>,
        mode: QrMode,
        part: QrPart,
    },

    /// col = conv(image, weight) without bias.
    Conv {
        image: Tensor<B>,
        weight: Tensor<B>,
        geom: ConvGeometry,
    },

    /// image = conv_transpose(col, weight) without bias.
    ConvTranspose {
        col: Tensor<B>,
        weight: Tensor<B>,
        geom: ConvGeometry,
    },

    /// weight-shaped correlation of image and col.
    ConvGradWeight {
        image: Tensor<B>,
        col: Tensor<B>,
        geom: ConvGeometry,
    },
}

// Concise Debug: show op type and tensor IDs only (not full tensor data).
impl<B: Backend> std::fmt::Debug for Op<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::None => write!(f, "None"),
            Op::Binary { lhs, rhs, op } => {
                write!(f, "Binary({:?}, id={:?}, id={:?})", op, lhs.id(), rhs.id())
            }
            Op::Affine { input, mul, add } => {
                write!(f, "Affine(*{} +{}, id={:?})", mul, add, input.id())
            }
            Op::Sum { input, dims } => write!(f, "Sum(dims={:?}, id={:?})", dims, input.id()),
            Op::Reshape { input, src_shape } => {
                write!(f, "Reshape(from {}, id={:?})", src_shape, input.id())
            }
            Op::Transpose { input, dim0, dim1 } => {
                write!(f, "Transpose({}, {}, id={:?})", dim0, dim1, input.id())
            }
            Op::Permute { input, perm } => {
                write!(f, "Permute({:?}, id={:?})", perm, input.id())
            }
            Op::Expand { input, src_shape } => {
                write!(f, "Expand(from {}, id={:?})", src_shape, input.id())
            }
            Op::Contiguous { input } => write!(f, "Contiguous(id={:?})", input.id()),
            Op::ToDtype { input, src_dtype } => {
                write!(f, "ToDtype(from={}, id={:?})", src_dtype, input.id())
            }
            Op::Triangular {
                input,
                diagonal,
                upper,
            } => {
                let name = if *upper { "Triu" } else { "Tril" };
                write!(f, "{}(k={}, id={:?})", name, diagonal, input.id())
            }
            Op::Dot { lhs, rhs } => write!(f, "Dot(id={:?}, id={:?})", lhs.id(), rhs.id()),
            Op::Solve { a, b } => write!(f, "Solve(a={:?}, b={:?})", a.id(), b.id()),
            Op::Inverse { input } => write!(f, "Inverse(id={:?})", input.id()),
            Op::Qr { input, mode, part } => {
                write!(f, "Qr({}, {:?}, id={:?})", mode, part, input.id())
            }
            Op::Conv {
                image,
                weight,
                geom,
            } => write!(
                f,
                "Conv(x={:?}, w={:?}, s={:?}, p={:?})",
                image.id(),
                weight.id(),
                geom.stride,
                geom.pad
            ),
            Op::ConvTranspose { col, weight, geom } => write!(
                f,
                "ConvTranspose(x={:?}, w={:?}, s={:?}, p={:?})",
                col.id(),
                weight.id(),
                geom.stride,
                geom.pad
            ),
            Op::ConvGradWeight { image, col, .. } => {
                write!(f, "ConvGradWeight(x={:?}, gy={:?})", image.id(), col.id())
            }
        }
    }
}

impl<B: Backend> Op<B> {
    /// References to all input tensors of this operation.
    /// Used by the topological sort in backward().
    pub fn inputs(&self) -> Vec<&Tensor<B>> {
        match self {
            Op::None => vec![],
            Op::Binary { lhs, rhs, .. } | Op::Dot { lhs, rhs } => vec![lhs, rhs],
            Op::Solve { a, b } => vec![a, b],
            Op::Affine { input, .. }
            | Op::Sum { input, .. }
            | Op::Reshape { input, .. }
            | Op::Transpose { input, .. }
            | Op::Permute { input, .. }
            | Op::Expand { input, .. }
            | Op::Contiguous { input }
            | Op::ToDtype { input, .. }
            | Op::Triangular { input, .. }
            | Op::Inverse { input }
            | Op::Qr { input, .. } => vec![input],
            Op::Conv { image, weight, .. } => vec![image, weight],
            Op::ConvTranspose { col, weight, .. } => vec![col, weight],
            Op::ConvGradWeight { image, col, .. } => vec![image, col],
        }
    }

    /// Short name used in logs and gradient errors.
    pub fn name(&self) -> &'static str {
        match self {
            Op::None => "leaf",
            Op::Binary { .. } => "binary",
            Op::Affine { .. } => "affine",
            Op::Sum { .. } => "sum",
            Op::Reshape { .. } => "reshape",
            Op::Transpose { .. } => "transpose",
            Op::Permute { .. } => "permute",
            Op::Expand { .. } => "expand",
            Op::Contiguous { .. } => "contiguous",
            Op::ToDtype { .. } => "to_dtype",
            Op::Triangular { .. } => "triangular",
            Op::Dot { .. } => "dot",
            Op::Solve { .. } => "solve",
            Op::Inverse { .. } => "inv",
            Op::Qr { .. } => "qr",
            Op::Conv { .. } => "conv",
            Op::ConvTranspose { .. } => "conv_transpose",
            Op::ConvGradWeight { .. } => "conv_grad_weight",
        }
    }
}
