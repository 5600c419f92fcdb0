use std::fmt;

use crate::dtype::DType;
use crate::error::Result;
use crate::layout::Layout;
use crate::shape::Shape;

// Backend — Abstraction over compute devices
//
// Each backend implements this trait with its own storage type. The routine
// layer (dot, solve, inv, qr, conv) validates shapes and dtypes, asks the
// backend for its Capabilities on the operand device, and only then calls a
// kernel. Kernels receive already-validated metadata and never re-check
// shapes.
//
// Kernel families:
//
//   creation      zeros, full, from_f64_slice, rand_uniform
//   movement      to_contiguous, to_f64_vec, cast
//   plumbing      binary_op, affine, sum, triangular (used by gradient rules)
//   routines      matmul, solve, inverse, qr,
//                 conv_forward, conv_backward_data, conv_backward_weight

/// Identifies a compute device (e.g. "cpu", "cuda:0").
pub trait BackendDevice: Clone + fmt::Debug + Send + Sync + 'static {
    /// A human-readable name for this device.
    fn name(&self) -> String;

    /// Whether two handles refer to the same physical device.
    fn same_device(&self, other: &Self) -> bool {
        self.name() == other.name()
    }
}

/// A storage buffer that holds tensor data on a specific device.
pub trait BackendStorage: Clone + Send + Sync + 'static {
    /// The data type of the elements in this storage.
    fn dtype(&self) -> DType;

    /// Total number of elements that fit in this storage.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Element-wise binary operations needed by the gradient rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
}

/// What a backend can run on a given device.
///
/// The native backend supports everything. Accelerated backends typically
/// lack integer GEMM, `cover_all` and an explicit transposed output size,
/// and need at least two spatial axes for convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// `dot` over integer and boolean operands.
    pub integer_dot: bool,
    /// `dot` over F16/BF16 operands.
    pub half_dot: bool,
    /// `solve`, `inv` and `qr`.
    pub linalg: bool,
    /// `cover_all = true` in convolutions.
    pub conv_cover_all: bool,
    /// An explicit `outsize` in transposed convolution.
    pub conv_transpose_outsize: bool,
    /// Minimum number of spatial axes a convolution must have.
    pub min_conv_spatial_dims: usize,
}

impl Capabilities {
    /// Everything supported.
    pub const fn full() -> Self {
        Capabilities {
            integer_dot: true,
            half_dot: true,
            linalg: true,
            conv_cover_all: true,
            conv_transpose_outsize: true,
            min_conv_spatial_dims: 0,
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::full()
    }
}

// ConvGeometry — one description shared by all three convolution kernels
//
// The "image" side is the high-resolution tensor, the "col" side is the
// output of a forward convolution:
//
//   conv_forward          image (N, Ci, *I)  ×  weight (Co, Ci, *K)  → col   (N, Co, *C)
//   conv_backward_data    col   (N, Co, *C)  ×  weight (Co, Ci, *K)  → image (N, Ci, *I)
//   conv_backward_weight  image (N, Ci, *I)  ×  col    (N, Co, *C)   → weight (Co, Ci, *K)
//
// Image position covered by col position `o` and kernel tap `t` on axis d:
//
//   i = o * stride[d] + t - pad[d]        (out of range ⇒ zero padding)
//
// `col_dims` already accounts for cover_all, so the kernels never see it.

/// Geometry of an N-dimensional convolution, in forward orientation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvGeometry {
    pub batch: usize,
    pub image_channels: usize,
    pub col_channels: usize,
    pub image_dims: Vec<usize>,
    pub col_dims: Vec<usize>,
    pub kernel: Vec<usize>,
    pub stride: Vec<usize>,
    pub pad: Vec<usize>,
}

impl ConvGeometry {
    pub fn spatial_rank(&self) -> usize {
        self.kernel.len()
    }

    pub fn image_shape(&self) -> Shape {
        Shape::new(vec![self.batch, self.image_channels]).extend(&self.image_dims)
    }

    pub fn col_shape(&self) -> Shape {
        Shape::new(vec![self.batch, self.col_channels]).extend(&self.col_dims)
    }

    pub fn weight_shape(&self) -> Shape {
        Shape::new(vec![self.col_channels, self.image_channels]).extend(&self.kernel)
    }

    /// Number of image positions read per output position and channel.
    pub fn patch_len(&self) -> usize {
        self.image_channels * self.kernel.iter().product::<usize>()
    }

    pub fn col_spatial_len(&self) -> usize {
        self.col_dims.iter().product()
    }

    pub fn image_spatial_len(&self) -> usize {
        self.image_dims.iter().product()
    }
}

/// QR output modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QrMode {
    /// `R (k, n)` only.
    R,
    /// Householder reflectors `h (n, m)` and scalings `tau (k,)`, always F64.
    Raw,
    /// `Q (m, k)`, `R (k, n)`.
    Reduced,
    /// `Q (m, m)`, `R (m, n)`.
    Complete,
}

impl fmt::Display for QrMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QrMode::R => "r",
            QrMode::Raw => "raw",
            QrMode::Reduced => "reduced",
            QrMode::Complete => "complete",
        };
        write!(f, "{}", s)
    }
}

/// Storage produced by a QR kernel, one arm per output family.
#[derive(Debug, Clone)]
pub enum QrFactors<S> {
    R(S),
    Raw { h: S, tau: S },
    QR { q: S, r: S },
}

// Backend Trait — The core interface every backend must implement

/// A complete compute backend.
///
/// All operations take storage + layout (which encodes shape/strides) and
/// return new contiguous storage. Inputs to routine kernels share one dtype;
/// the caller has already cast them.
pub trait Backend: Clone + Send + Sync + fmt::Debug + 'static {
    type Device: BackendDevice;
    type Storage: BackendStorage;

    /// Short backend name used in error messages ("cpu", ...).
    fn name() -> &'static str;

    /// What this backend can run on `device`.
    fn capabilities(device: &Self::Device) -> Capabilities;

    //  Creation

    fn zeros(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    fn full(shape: &Shape, val: f64, dtype: DType, device: &Self::Device)
        -> Result<Self::Storage>;

    /// Create storage from a flat f64 slice, converting to the target dtype.
    fn from_f64_slice(data: &[f64], dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Random uniform values in [0, 1).
    fn rand_uniform(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    //  Data movement

    /// Make a contiguous copy of the storage following the given layout.
    fn to_contiguous(input: &Self::Storage, layout: &Layout) -> Result<Self::Storage>;

    /// Copy data to a host Vec<f64> in logical order.
    fn to_f64_vec(input: &Self::Storage, layout: &Layout) -> Result<Vec<f64>>;

    /// Cast storage to a different dtype.
    ///
    /// The default goes through the host; backends should override it.
    fn cast(
        input: &Self::Storage,
        layout: &Layout,
        dtype: DType,
        device: &Self::Device,
    ) -> Result<Self::Storage> {
        let data = Self::to_f64_vec(input, layout)?;
        Self::from_f64_slice(&data, dtype, device)
    }

    //  Plumbing for gradient rules

    /// `result[i] = op(lhs[i], rhs[i])`; both layouts have the same shape
    /// (broadcast operands arrive as stride-0 views).
    fn binary_op(
        op: BinaryOp,
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
    ) -> Result<Self::Storage>;

    /// `result = input * mul + add`.
    fn affine(input: &Self::Storage, layout: &Layout, mul: f64, add: f64) -> Result<Self::Storage>;

    /// Sum over `dims`, which are removed from the output shape.
    fn sum(input: &Self::Storage, layout: &Layout, dims: &[usize]) -> Result<Self::Storage>;

    /// Keep the lower (or upper) triangle of the trailing two axes relative
    /// to `diagonal`, zero the rest.
    fn triangular(
        input: &Self::Storage,
        layout: &Layout,
        diagonal: i64,
        upper: bool,
    ) -> Result<Self::Storage>;

    //  Routines

    /// Batched GEMM: `(*batch, m, k) × (*batch, k, n) → (*batch, m, n)`.
    ///
    /// Both layouts have the same rank ≥ 2 and identical batch dims; batch
    /// axes that were broadcast arrive with stride 0, and the matrix axes
    /// may be arbitrarily strided (transposed views).
    fn matmul(
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
    ) -> Result<Self::Storage>;

    /// Solve `A X = B` for square `A (n, n)` and `B (n, k)`.
    fn solve(
        a: &Self::Storage,
        a_layout: &Layout,
        b: &Self::Storage,
        b_layout: &Layout,
    ) -> Result<Self::Storage>;

    /// Inverse of square `A (n, n)`.
    fn inverse(a: &Self::Storage, layout: &Layout) -> Result<Self::Storage>;

    /// QR factorization of `A (m, n)`.
    fn qr(a: &Self::Storage, layout: &Layout, mode: QrMode) -> Result<QrFactors<Self::Storage>>;

    /// image × weight → col.
    fn conv_forward(
        image: &Self::Storage,
        image_layout: &Layout,
        weight: &Self::Storage,
        weight_layout: &Layout,
        geom: &ConvGeometry,
    ) -> Result<Self::Storage>;

    /// col × weight → image (transposed convolution).
    fn conv_backward_data(
        col: &Self::Storage,
        col_layout: &Layout,
        weight: &Self::Storage,
        weight_layout: &Layout,
        geom: &ConvGeometry,
    ) -> Result<Self::Storage>;

    /// image × col → weight.
    fn conv_backward_weight(
        image: &Self::Storage,
        image_layout: &Layout,
        col: &Self::Storage,
        col_layout: &Layout,
        geom: &ConvGeometry,
    ) -> Result<Self::Storage>;
}
