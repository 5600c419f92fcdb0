//! # vole-core
//!
//! Core tensor primitives, backend traits, numerical routines and autograd
//! for vole.
//!
//! This crate provides:
//! - [`Tensor`] — n-dimensional array that records the routine producing it
//! - [`Shape`] / [`Layout`] — shape, strides, and memory layout
//! - [`DType`] — element types, promotion and per-dtype tolerances
//! - [`Backend`] trait and [`Capabilities`] — abstraction over devices
//! - routines: [`Tensor::dot`], [`Tensor::solve`], [`Tensor::inv`],
//!   [`Tensor::qr`], [`Tensor::conv`], [`Tensor::conv_transpose`]
//! - [`GradStore`] — gradients returned by `backward()`, themselves
//!   differentiable
//! - [`gradcheck`] — finite-difference checks of first and second order
//!   gradients

pub mod backend;
pub mod backprop;
pub mod conv;
pub mod dtype;
pub mod error;
pub mod gradcheck;
pub mod layout;
pub mod linalg;
pub mod op;
pub mod shape;
pub mod tensor;

pub use backend::{
    Backend, BackendDevice, BackendStorage, BinaryOp, Capabilities, ConvGeometry, QrFactors,
    QrMode,
};
pub use backprop::GradStore;
pub use conv::{conv_output_size, conv_transpose_output_size, ConvParams, Dims};
pub use dtype::{DType, Tolerance, WithDType};
pub use error::{Error, ErrorKind, Result};
pub use gradcheck::{check_double_gradients, check_gradients, GradCheckConfig, GradCheckReport};
pub use layout::Layout;
pub use linalg::QrOutput;
pub use op::{Op, QrPart, TensorId};
pub use shape::{DotShape, Shape};
pub use tensor::Tensor;
