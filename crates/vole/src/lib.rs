//! # Vole
//!
//! Batched linear algebra and N-dimensional convolution over strided
//! tensors, with reverse-mode autograd that can be differentiated again.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use vole::prelude::*;
//!
//! # fn main() -> vole::Result<()> {
//! let dev = CpuDevice;
//! let a = CpuTensor::from_f64_slice(&[4.0, 7.0, 2.0, 6.0], (2, 2), DType::F64, &dev)?;
//! let b = CpuTensor::from_f64_slice(&[1.0, 0.0], 2, DType::F64, &dev)?;
//! let x = a.solve(&b)?;
//! let grads = x.sum_all()?.backward()?;
//! assert_eq!(grads.require(&a)?.dims(), &[2, 2]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `vole-core` | Tensor, Shape, DType, Layout, Backend trait, routines, autograd, gradcheck |
//! | `vole-cpu` | CPU backend: gemm matmul, LU/Householder linear algebra, im2col convolution |

/// Re-export core types.
pub use vole_core::{
    backend::{
        Backend, BackendDevice, BackendStorage, BinaryOp, Capabilities, ConvGeometry, QrFactors,
        QrMode,
    },
    conv::{conv_output_size, conv_transpose_output_size, ConvParams, Dims},
    gradcheck::{check_double_gradients, check_gradients, GradCheckConfig, GradCheckReport},
    linalg::QrOutput,
    op::{Op, QrPart, TensorId},
    DType, DotShape, Error, ErrorKind, GradStore, Layout, Result, Shape, Tensor, Tolerance,
    WithDType,
};

/// Re-export CPU backend.
pub use vole_cpu::{CpuBackend, CpuDevice, CpuStorage, CpuTensor};

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::{
        Backend, BackendDevice, Capabilities, ConvParams, CpuBackend, CpuDevice, CpuTensor, DType,
        Dims, Error, ErrorKind, GradCheckConfig, GradStore, QrMode, QrOutput, Result, Shape,
        Tensor,
    };
}
