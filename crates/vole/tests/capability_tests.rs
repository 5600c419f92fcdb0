// Capability gating, exercised through a backend that advertises less than
// the CPU one while reusing its kernels.

mod common;

use common::init_logger;
use vole::prelude::*;
use vole::{BackendDevice, BinaryOp, ConvGeometry, CpuStorage, Layout, QrFactors};

/// An accelerator-like device: numbered, and unable to run integer GEMM,
/// cover_all, explicit transposed output sizes or convolutions with fewer
/// than two spatial axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RestrictedDevice {
    ordinal: usize,
}

impl BackendDevice for RestrictedDevice {
    fn name(&self) -> String {
        format!("restricted:{}", self.ordinal)
    }
}

#[derive(Debug, Clone, Copy)]
struct RestrictedBackend;

type RTensor = Tensor<RestrictedBackend>;

impl Backend for RestrictedBackend {
    type Device = RestrictedDevice;
    type Storage = CpuStorage;

    fn name() -> &'static str {
        "restricted"
    }

    fn capabilities(_device: &RestrictedDevice) -> Capabilities {
        Capabilities {
            integer_dot: false,
            half_dot: false,
            linalg: true,
            conv_cover_all: false,
            conv_transpose_outsize: false,
            min_conv_spatial_dims: 2,
        }
    }

    fn zeros(shape: &Shape, dtype: DType, _: &RestrictedDevice) -> vole::Result<CpuStorage> {
        CpuBackend::zeros(shape, dtype, &CpuDevice)
    }

    fn full(shape: &Shape, val: f64, dtype: DType, _: &RestrictedDevice) -> vole::Result<CpuStorage> {
        CpuBackend::full(shape, val, dtype, &CpuDevice)
    }

    fn from_f64_slice(data: &[f64], dtype: DType, _: &RestrictedDevice) -> vole::Result<CpuStorage> {
        CpuBackend::from_f64_slice(data, dtype, &CpuDevice)
    }

    fn rand_uniform(shape: &Shape, dtype: DType, _: &RestrictedDevice) -> vole::Result<CpuStorage> {
        CpuBackend::rand_uniform(shape, dtype, &CpuDevice)
    }

    fn to_contiguous(input: &CpuStorage, layout: &Layout) -> vole::Result<CpuStorage> {
        CpuBackend::to_contiguous(input, layout)
    }

    fn to_f64_vec(input: &CpuStorage, layout: &Layout) -> vole::Result<Vec<f64>> {
        CpuBackend::to_f64_vec(input, layout)
    }

    fn binary_op(
        op: BinaryOp,
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> vole::Result<CpuStorage> {
        CpuBackend::binary_op(op, lhs, lhs_layout, rhs, rhs_layout)
    }

    fn affine(input: &CpuStorage, layout: &Layout, mul: f64, add: f64) -> vole::Result<CpuStorage> {
        CpuBackend::affine(input, layout, mul, add)
    }

    fn sum(input: &CpuStorage, layout: &Layout, dims: &[usize]) -> vole::Result<CpuStorage> {
        CpuBackend::sum(input, layout, dims)
    }

    fn triangular(
        input: &CpuStorage,
        layout: &Layout,
        diagonal: i64,
        upper: bool,
    ) -> vole::Result<CpuStorage> {
        CpuBackend::triangular(input, layout, diagonal, upper)
    }

    fn matmul(
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> vole::Result<CpuStorage> {
        CpuBackend::matmul(lhs, lhs_layout, rhs, rhs_layout)
    }

    fn solve(
        a: &CpuStorage,
        a_layout: &Layout,
        b: &CpuStorage,
        b_layout: &Layout,
    ) -> vole::Result<CpuStorage> {
        CpuBackend::solve(a, a_layout, b, b_layout)
    }

    fn inverse(a: &CpuStorage, layout: &Layout) -> vole::Result<CpuStorage> {
        CpuBackend::inverse(a, layout)
    }

    fn qr(a: &CpuStorage, layout: &Layout, mode: QrMode) -> vole::Result<QrFactors<CpuStorage>> {
        CpuBackend::qr(a, layout, mode)
    }

    fn conv_forward(
        image: &CpuStorage,
        image_layout: &Layout,
        weight: &CpuStorage,
        weight_layout: &Layout,
        geom: &ConvGeometry,
    ) -> vole::Result<CpuStorage> {
        CpuBackend::conv_forward(image, image_layout, weight, weight_layout, geom)
    }

    fn conv_backward_data(
        col: &CpuStorage,
        col_layout: &Layout,
        weight: &CpuStorage,
        weight_layout: &Layout,
        geom: &ConvGeometry,
    ) -> vole::Result<CpuStorage> {
        CpuBackend::conv_backward_data(col, col_layout, weight, weight_layout, geom)
    }

    fn conv_backward_weight(
        image: &CpuStorage,
        image_layout: &Layout,
        col: &CpuStorage,
        col_layout: &Layout,
        geom: &ConvGeometry,
    ) -> vole::Result<CpuStorage> {
        CpuBackend::conv_backward_weight(image, image_layout, col, col_layout, geom)
    }
}

const DEV0: RestrictedDevice = RestrictedDevice { ordinal: 0 };
const DEV1: RestrictedDevice = RestrictedDevice { ordinal: 1 };

fn ones(shape: impl Into<Shape>, dtype: DType, dev: &RestrictedDevice) -> RTensor {
    RTensor::ones(shape, dtype, dev).expect("ones")
}

#[test]
fn test_float_dot_runs() -> vole::Result<()> {
    init_logger();
    let a = ones((2, 3), DType::F32, &DEV0);
    let b = ones((3, 2), DType::F32, &DEV0);
    assert_eq!(a.dot(&b)?.to_f64_vec()?, vec![3.0; 4]);
    Ok(())
}

#[test]
fn test_integer_and_half_dot_unsupported() {
    init_logger();
    for dtype in [DType::I32, DType::Bool, DType::F16] {
        let a = ones((2, 3), dtype, &DEV0);
        let b = ones((3, 2), dtype, &DEV0);
        let err = a.dot(&b).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported, "{}", dtype);
        assert!(err.to_string().contains("restricted"));
    }
    // promotion decides: int · f32 is a float product
    let a = ones((2, 3), DType::I32, &DEV0);
    let b = ones((3, 2), DType::F32, &DEV0);
    assert!(a.dot(&b).is_ok());
}

#[test]
fn test_shape_errors_come_before_capability() {
    let a = ones((2, 3), DType::I32, &DEV0);
    let b = ones((2, 3), DType::I32, &DEV0);
    assert_eq!(a.dot(&b).unwrap_err().kind(), ErrorKind::Dimension);
}

#[test]
fn test_conv_cover_all_unsupported() -> vole::Result<()> {
    let x = ones((1, 1, 5, 5), DType::F32, &DEV0);
    let w = ones((1, 1, 2, 2), DType::F32, &DEV0);
    let params = ConvParams::new().stride(2);
    assert_eq!(x.conv(&w, None, &params)?.dims(), &[1, 1, 2, 2]);

    let err = x.conv(&w, None, &params.clone().cover_all(true)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    // a transposed output size that needs cover_all is refused too
    let y = ones((1, 1, 3, 3), DType::F32, &DEV0);
    let err = y.conv_transpose(&w, None, &params.clone().outsize(vec![5, 5])).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
    Ok(())
}

#[test]
fn test_conv_transpose_outsize_unsupported() -> vole::Result<()> {
    let y = ones((1, 2, 3, 3), DType::F32, &DEV0);
    let w = ones((2, 1, 3, 3), DType::F32, &DEV0);
    let params = ConvParams::new().stride(2);
    assert_eq!(y.conv_transpose(&w, None, &params)?.dims(), &[1, 1, 7, 7]);

    // 8 is consistent with the standard rule but still needs outsize
    let err = y
        .conv_transpose(&w, None, &params.clone().outsize(vec![8, 8]))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
    Ok(())
}

#[test]
fn test_conv_needs_two_spatial_axes() {
    init_logger();
    let x = ones((1, 2, 5), DType::F32, &DEV0);
    let w = ones((3, 2, 3), DType::F32, &DEV0);
    let err = x.conv(&w, None, &ConvParams::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Dimension);

    let x = ones((1, 2), DType::F32, &DEV0);
    let w = ones((3, 2), DType::F32, &DEV0);
    let err = x.conv(&w, None, &ConvParams::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Dimension);
}

#[test]
fn test_device_mismatch() {
    let a = ones((2, 2), DType::F32, &DEV0);
    let b = ones((2, 2), DType::F32, &DEV1);
    assert_eq!(a.dot(&b).unwrap_err().kind(), ErrorKind::Device);
    assert_eq!(a.solve(&b).unwrap_err().kind(), ErrorKind::Device);

    let x = ones((1, 2, 4, 4), DType::F32, &DEV0);
    let w = ones((3, 2, 2, 2), DType::F32, &DEV1);
    let err = x.conv(&w, None, &ConvParams::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Device);
}

#[test]
fn test_linalg_and_gradients_on_restricted_backend() -> vole::Result<()> {
    let a = RTensor::from_f64_slice(&[4.0, 1.0, 2.0, 3.0], (2, 2), DType::F64, &DEV0)?;
    let x = a.inv()?;
    let grads = x.sum_all()?.backward()?;
    assert_eq!(grads.require(&a)?.dims(), &[2, 2]);
    assert_eq!(x.device(), &DEV0);
    Ok(())
}
