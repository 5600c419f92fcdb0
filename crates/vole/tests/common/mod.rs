// Shared helpers for the integration tests.
#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vole::prelude::*;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() <= tol * (1.0 + b.abs())
}

pub fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(
        got.len(),
        expected.len(),
        "length mismatch: {} vs {}",
        got.len(),
        expected.len()
    );
    for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
        assert!(
            approx_eq(*g, *e, tol),
            "index {}: got {} expected {} (tol {})",
            i,
            g,
            e,
            tol
        );
    }
}

/// Uniform values in [-1, 1) from a fixed seed.
pub fn uniform(shape: impl Into<Shape>, dtype: DType, seed: u64) -> CpuTensor {
    let shape = shape.into();
    let mut rng = StdRng::seed_from_u64(seed);
    let data: Vec<f64> = (0..shape.elem_count())
        .map(|_| rng.gen_range(-1.0..1.0))
        .collect();
    CpuTensor::from_f64_slice(&data, shape, dtype, &CpuDevice).expect("uniform tensor")
}

/// A well-conditioned square matrix: random entries plus `n` on the diagonal.
pub fn well_conditioned(n: usize, dtype: DType, seed: u64) -> CpuTensor {
    let mut data = uniform((n, n), DType::F64, seed).to_f64_vec().expect("host data");
    for i in 0..n {
        data[i * n + i] += n as f64;
    }
    CpuTensor::from_f64_slice(&data, (n, n), dtype, &CpuDevice).expect("square matrix")
}

/// Row-major multi-index of `flat` in `dims`.
fn unravel(mut flat: usize, dims: &[usize]) -> Vec<usize> {
    let mut idx = vec![0; dims.len()];
    for d in (0..dims.len()).rev() {
        idx[d] = flat % dims[d];
        flat /= dims[d];
    }
    idx
}

fn ravel(idx: &[usize], dims: &[usize]) -> usize {
    idx.iter().zip(dims).fold(0, |acc, (&i, &d)| acc * d + i)
}

/// Direct N-d convolution by definition, in f64.
///
/// x (N, Ci, *S), w (Co, Ci, *K), output spatial dims given explicitly.
pub fn conv_reference(
    x: &[f64],
    x_dims: &[usize],
    w: &[f64],
    w_dims: &[usize],
    out_spatial: &[usize],
    stride: &[usize],
    pad: &[usize],
) -> Vec<f64> {
    let (n, ci) = (x_dims[0], x_dims[1]);
    let co = w_dims[0];
    let in_spatial = &x_dims[2..];
    let kernel = &w_dims[2..];
    let out_len: usize = out_spatial.iter().product();
    let k_len: usize = kernel.iter().product();
    let in_len: usize = in_spatial.iter().product();

    let mut y = vec![0.0; n * co * out_len];
    for b in 0..n {
        for o in 0..co {
            for pos in 0..out_len {
                let oi = unravel(pos, out_spatial);
                let mut acc = 0.0;
                for c in 0..ci {
                    for t in 0..k_len {
                        let ti = unravel(t, kernel);
                        let mut inside = true;
                        let mut ii = Vec::with_capacity(oi.len());
                        for d in 0..oi.len() {
                            let i = (oi[d] * stride[d] + ti[d]) as i64 - pad[d] as i64;
                            if i < 0 || i >= in_spatial[d] as i64 {
                                inside = false;
                                break;
                            }
                            ii.push(i as usize);
                        }
                        if inside {
                            let xv = x[(b * ci + c) * in_len + ravel(&ii, in_spatial)];
                            let wv = w[(o * ci + c) * k_len + t];
                            acc += xv * wv;
                        }
                    }
                }
                y[(b * co + o) * out_len + pos] = acc;
            }
        }
    }
    y
}
