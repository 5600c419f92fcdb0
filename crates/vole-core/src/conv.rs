use crate::backend::{Backend, Capabilities, ConvGeometry};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::op::Op;
use crate::shape::Shape;
use crate::tensor::Tensor;

// N-dimensional convolution and transposed convolution
//
//   conv            x (N, Ci, *S)  ·  w (Co, Ci, *K)  [+ b (Co,)]  → (N, Co, *O)
//   conv_transpose  x (N, Ci, *S)  ·  w (Ci, Co, *K)  [+ b (Co,)]  → (N, Co, *O)
//
// Output sizes per spatial axis (s = stride, p = pad, k = kernel):
//
//   conv                 O = (S + 2p − k) / s + 1
//   conv, cover_all      O = (S + 2p − k + s − 1) / s + 1
//   conv_transpose       O = s·(S − 1) + k − 2p
//
// An explicit conv_transpose `outsize` is accepted iff conv maps it back to
// S with or without cover_all.
//
// Both routines reduce to three bias-free primitives that share one
// ConvGeometry (see backend.rs); the bias is a broadcast add on top so its
// gradient is the usual sum over batch and spatial axes.

/// Per-axis integer parameter: one value for every axis, or one per axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dims {
    Uniform(usize),
    PerAxis(Vec<usize>),
}

impl Dims {
    /// Expand to exactly `rank` values.
    pub fn resolve(&self, rank: usize, what: &str) -> Result<Vec<usize>> {
        match self {
            Dims::Uniform(v) => Ok(vec![*v; rank]),
            Dims::PerAxis(v) if v.len() == rank => Ok(v.clone()),
            Dims::PerAxis(v) => Err(Error::dim(format!(
                "expected {} {} values for {} spatial axes, got {}",
                rank,
                what,
                rank,
                v.len()
            ))),
        }
    }
}

impl From<usize> for Dims {
    fn from(v: usize) -> Self {
        Dims::Uniform(v)
    }
}

impl From<Vec<usize>> for Dims {
    fn from(v: Vec<usize>) -> Self {
        Dims::PerAxis(v)
    }
}

impl From<&[usize]> for Dims {
    fn from(v: &[usize]) -> Self {
        Dims::PerAxis(v.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Dims {
    fn from(v: [usize; N]) -> Self {
        Dims::PerAxis(v.to_vec())
    }
}

/// Convolution parameters.
///
/// ```ignore
/// let params = ConvParams::new().stride([1, 2]).pad(1).cover_all(true);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvParams {
    pub stride: Dims,
    pub pad: Dims,
    /// Add a trailing output position when the kernel does not tile the
    /// padded input evenly (conv only).
    pub cover_all: bool,
    /// Explicit spatial output size (conv_transpose only).
    pub outsize: Option<Vec<usize>>,
}

impl Default for ConvParams {
    fn default() -> Self {
        ConvParams {
            stride: Dims::Uniform(1),
            pad: Dims::Uniform(0),
            cover_all: false,
            outsize: None,
        }
    }
}

impl ConvParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stride(mut self, stride: impl Into<Dims>) -> Self {
        self.stride = stride.into();
        self
    }

    pub fn pad(mut self, pad: impl Into<Dims>) -> Self {
        self.pad = pad.into();
        self
    }

    pub fn cover_all(mut self, cover_all: bool) -> Self {
        self.cover_all = cover_all;
        self
    }

    pub fn outsize(mut self, outsize: impl Into<Vec<usize>>) -> Self {
        self.outsize = Some(outsize.into());
        self
    }
}

/// Forward convolution output size along one axis.
pub fn conv_output_size(
    size: usize,
    kernel: usize,
    stride: usize,
    pad: usize,
    cover_all: bool,
) -> Result<usize> {
    if stride == 0 {
        return Err(Error::dim("convolution stride must be positive"));
    }
    let padded = (size + 2 * pad) as i64;
    let k = kernel as i64;
    let s = stride as i64;
    // cover_all keeps a window that starts inside the input even when the
    // kernel runs past its end
    let span = if cover_all { padded - k + s - 1 } else { padded - k };
    if span < 0 {
        return Err(Error::dim(format!(
            "kernel size {} exceeds padded input size {}",
            kernel, padded
        )));
    }
    Ok((span / s + 1) as usize)
}

/// Default transposed convolution output size along one axis.
pub fn conv_transpose_output_size(
    size: usize,
    kernel: usize,
    stride: usize,
    pad: usize,
) -> Result<usize> {
    if stride == 0 {
        return Err(Error::dim("convolution stride must be positive"));
    }
    let out = stride as i64 * (size as i64 - 1) + kernel as i64 - 2 * pad as i64;
    if out <= 0 {
        return Err(Error::dim(format!(
            "transposed convolution output size {} is not positive (in={}, k={}, s={}, p={})",
            out, size, kernel, stride, pad
        )));
    }
    Ok(out as usize)
}

/// Which forward rule maps `outsize` back to `size`: `Some(false)` for the
/// standard rule, `Some(true)` for cover_all only, `None` for neither.
fn outsize_cover_all(outsize: usize, size: usize, k: usize, s: usize, p: usize) -> Option<bool> {
    if conv_output_size(outsize, k, s, p, false).ok() == Some(size) {
        Some(false)
    } else if conv_output_size(outsize, k, s, p, true).ok() == Some(size) {
        Some(true)
    } else {
        None
    }
}

/// Checks common to both routines; returns (spatial rank, stride, pad).
fn validate_common<B: Backend>(
    x: &Tensor<B>,
    w: &Tensor<B>,
    bias: Option<&Tensor<B>>,
    params: &ConvParams,
    w_in_axis: usize,
    op: &'static str,
) -> Result<(usize, Vec<usize>, Vec<usize>)> {
    if x.rank() < 2 {
        return Err(Error::dim(format!(
            "{}: input must be (batch, channels, *spatial), got {}",
            op,
            x.shape()
        )));
    }
    if w.rank() != x.rank() {
        return Err(Error::dim(format!(
            "{}: input {} and weight {} have different numbers of spatial axes",
            op,
            x.shape(),
            w.shape()
        )));
    }
    if w.dims()[w_in_axis] != x.dims()[1] {
        return Err(Error::dim(format!(
            "{}: input has {} channels but weight {} expects {}",
            op,
            x.dims()[1],
            w.shape(),
            w.dims()[w_in_axis]
        )));
    }
    let out_channels = w.dims()[1 - w_in_axis];
    if let Some(b) = bias {
        if b.dims() != [out_channels] {
            return Err(Error::dim(format!(
                "{}: bias {} does not match {} output channels",
                op,
                b.shape(),
                out_channels
            )));
        }
    }
    let nd = x.rank() - 2;
    let stride = params.stride.resolve(nd, "stride")?;
    let pad = params.pad.resolve(nd, "pad")?;
    if stride.contains(&0) {
        return Err(Error::dim(format!("{}: stride must be positive, got {:?}", op, stride)));
    }
    Ok((nd, stride, pad))
}

fn unsupported<B: Backend>(feature: &str) -> Error {
    log::warn!("{} backend rejected {}", B::name(), feature);
    Error::Unsupported {
        backend: B::name(),
        feature: feature.to_string(),
    }
}

fn check_spatial_rank<B: Backend>(caps: &Capabilities, nd: usize, op: &str) -> Result<()> {
    if nd < caps.min_conv_spatial_dims {
        log::warn!("{} backend rejected {}-d {}", B::name(), nd, op);
        return Err(Error::dim(format!(
            "{}: {} backend needs at least {} spatial axes, got {}",
            op,
            B::name(),
            caps.min_conv_spatial_dims,
            nd
        )));
    }
    Ok(())
}

/// Promote x, w (and bias) to one float dtype.
fn conv_dtype<B: Backend>(
    x: &Tensor<B>,
    w: &Tensor<B>,
    bias: Option<&Tensor<B>>,
    op: &'static str,
) -> Result<DType> {
    let mut dtype = DType::promote(x.dtype(), w.dtype());
    if let Some(b) = bias {
        dtype = DType::promote(dtype, b.dtype());
    }
    if !dtype.is_float() {
        return Err(Error::UnsupportedDType { op, dtype });
    }
    Ok(dtype)
}

fn add_bias<B: Backend>(y: Tensor<B>, bias: Option<&Tensor<B>>) -> Result<Tensor<B>> {
    match bias {
        None => Ok(y),
        Some(b) => {
            let mut shape = vec![1usize; y.rank()];
            shape[1] = b.dims()[0];
            y.add(&b.to_dtype(y.dtype())?.reshape(shape)?)
        }
    }
}

impl<B: Backend> Tensor<B> {
    /// N-dimensional convolution.
    pub fn conv(&self, weight: &Self, bias: Option<&Self>, params: &ConvParams) -> Result<Self> {
        let (nd, stride, pad) = validate_common(self, weight, bias, params, 1, "conv")?;
        if params.outsize.is_some() {
            return Err(Error::dim("conv: outsize only applies to conv_transpose"));
        }
        let kernel = weight.dims()[2..].to_vec();
        let in_dims = self.dims()[2..].to_vec();
        let col_dims = (0..nd)
            .map(|d| conv_output_size(in_dims[d], kernel[d], stride[d], pad[d], params.cover_all))
            .collect::<Result<Vec<_>>>()?;

        self.same_device(weight)?;
        if let Some(b) = bias {
            self.same_device(b)?;
        }
        let dtype = conv_dtype(self, weight, bias, "conv")?;
        let caps = B::capabilities(self.device());
        check_spatial_rank::<B>(&caps, nd, "conv")?;
        if params.cover_all && !caps.conv_cover_all {
            return Err(unsupported::<B>("conv with cover_all"));
        }

        let geom = ConvGeometry {
            batch: self.dims()[0],
            image_channels: self.dims()[1],
            col_channels: weight.dims()[0],
            image_dims: in_dims,
            col_dims,
            kernel,
            stride,
            pad,
        };
        log::debug!(
            "conv: {} * {} -> {} ({}, {})",
            self.shape(),
            weight.shape(),
            geom.col_shape(),
            dtype,
            B::name()
        );
        let y = Tensor::conv_image_to_col(&self.to_dtype(dtype)?, &weight.to_dtype(dtype)?, &geom)?;
        add_bias(y, bias)
    }

    /// N-dimensional transposed convolution (the adjoint of `conv`).
    pub fn conv_transpose(
        &self,
        weight: &Self,
        bias: Option<&Self>,
        params: &ConvParams,
    ) -> Result<Self> {
        let (nd, stride, pad) = validate_common(self, weight, bias, params, 0, "conv_transpose")?;
        if params.cover_all {
            return Err(Error::dim(
                "conv_transpose: cover_all is inferred from outsize, not passed in",
            ));
        }
        let kernel = weight.dims()[2..].to_vec();
        let in_dims = self.dims()[2..].to_vec();

        let mut needs_cover_all = false;
        let image_dims = match &params.outsize {
            None => (0..nd)
                .map(|d| conv_transpose_output_size(in_dims[d], kernel[d], stride[d], pad[d]))
                .collect::<Result<Vec<_>>>()?,
            Some(out) => {
                if out.len() != nd {
                    return Err(Error::dim(format!(
                        "conv_transpose: outsize {:?} has {} axes, input has {}",
                        out,
                        out.len(),
                        nd
                    )));
                }
                for d in 0..nd {
                    if out[d] == 0 {
                        return Err(Error::dim(format!(
                            "conv_transpose: output sizes must be positive, got {:?}",
                            out
                        )));
                    }
                    match outsize_cover_all(out[d], in_dims[d], kernel[d], stride[d], pad[d]) {
                        Some(c) => needs_cover_all |= c,
                        None => {
                            return Err(Error::dim(format!(
                                "conv_transpose: outsize {:?} is inconsistent with input {}",
                                out,
                                self.shape()
                            )))
                        }
                    }
                }
                out.clone()
            }
        };

        self.same_device(weight)?;
        if let Some(b) = bias {
            self.same_device(b)?;
        }
        let dtype = conv_dtype(self, weight, bias, "conv_transpose")?;
        let caps = B::capabilities(self.device());
        check_spatial_rank::<B>(&caps, nd, "conv_transpose")?;
        if params.outsize.is_some() && !caps.conv_transpose_outsize {
            return Err(unsupported::<B>("conv_transpose with explicit outsize"));
        }
        if needs_cover_all && !caps.conv_cover_all {
            return Err(unsupported::<B>("conv_transpose with cover_all geometry"));
        }

        let geom = ConvGeometry {
            batch: self.dims()[0],
            image_channels: weight.dims()[1],
            col_channels: weight.dims()[0],
            image_dims,
            col_dims: in_dims,
            kernel,
            stride,
            pad,
        };
        log::debug!(
            "conv_transpose: {} * {} -> {} ({}, {})",
            self.shape(),
            weight.shape(),
            geom.image_shape(),
            dtype,
            B::name()
        );
        let y = Tensor::conv_col_to_image(&self.to_dtype(dtype)?, &weight.to_dtype(dtype)?, &geom)?;
        add_bias(y, bias)
    }

    // Bias-free primitives. Inputs already share one dtype and match `geom`.

    fn check_geometry(&self, expected: Shape) -> Result<()> {
        if self.shape() != &expected {
            return Err(Error::ShapeMismatch {
                expected,
                got: self.shape().clone(),
            });
        }
        Ok(())
    }

    /// image × weight → col
    pub(crate) fn conv_image_to_col(image: &Self, weight: &Self, geom: &ConvGeometry) -> Result<Self> {
        image.check_geometry(geom.image_shape())?;
        weight.check_geometry(geom.weight_shape())?;
        let out_shape = geom.col_shape();
        let storage = if out_shape.elem_count() == 0 || geom.patch_len() == 0 {
            B::zeros(&out_shape, image.dtype(), image.device())?
        } else {
            let si = image.storage()?;
            let sw = weight.storage()?;
            B::conv_forward(&si, image.layout(), &sw, weight.layout(), geom)?
        };
        Ok(image.derived(
            storage,
            out_shape,
            image.dtype(),
            Op::Conv {
                image: image.clone(),
                weight: weight.clone(),
                geom: geom.clone(),
            },
        ))
    }

    /// col × weight → image
    pub(crate) fn conv_col_to_image(col: &Self, weight: &Self, geom: &ConvGeometry) -> Result<Self> {
        col.check_geometry(geom.col_shape())?;
        weight.check_geometry(geom.weight_shape())?;
        let out_shape = geom.image_shape();
        let storage = if out_shape.elem_count() == 0 || col.elem_count() == 0 {
            B::zeros(&out_shape, col.dtype(), col.device())?
        } else {
            let sc = col.storage()?;
            let sw = weight.storage()?;
            B::conv_backward_data(&sc, col.layout(), &sw, weight.layout(), geom)?
        };
        Ok(col.derived(
            storage,
            out_shape,
            col.dtype(),
            Op::ConvTranspose {
                col: col.clone(),
                weight: weight.clone(),
                geom: geom.clone(),
            },
        ))
    }

    /// image × col → weight
    pub(crate) fn conv_weight_grad(image: &Self, col: &Self, geom: &ConvGeometry) -> Result<Self> {
        image.check_geometry(geom.image_shape())?;
        col.check_geometry(geom.col_shape())?;
        let out_shape = geom.weight_shape();
        let storage = if out_shape.elem_count() == 0 || col.elem_count() == 0 {
            B::zeros(&out_shape, image.dtype(), image.device())?
        } else {
            let si = image.storage()?;
            let sc = col.storage()?;
            B::conv_backward_weight(&si, image.layout(), &sc, col.layout(), geom)?
        };
        Ok(image.derived(
            storage,
            out_shape,
            image.dtype(),
            Op::ConvGradWeight {
                image: image.clone(),
                col: col.clone(),
                geom: geom.clone(),
            },
        ))
    }
}
