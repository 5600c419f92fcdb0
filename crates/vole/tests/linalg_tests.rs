// Integration tests for solve / inv / qr on the CPU backend.

mod common;

use common::{assert_vec_approx, init_logger, uniform, well_conditioned};
use vole::prelude::*;

fn assert_identity(t: &CpuTensor, tol: f64) -> vole::Result<()> {
    let n = t.dims()[0];
    let eye = CpuTensor::eye(n, DType::F64, &CpuDevice)?;
    assert_vec_approx(&t.to_f64_vec()?, &eye.to_f64_vec()?, tol);
    Ok(())
}

#[test]
fn test_inv_roundtrip() -> vole::Result<()> {
    init_logger();
    for (n, dtype, tol) in [(1, DType::F64, 1e-12), (4, DType::F64, 1e-10), (5, DType::F32, 1e-4)] {
        let a = well_conditioned(n, dtype, n as u64);
        let inv = a.inv()?;
        assert_eq!(inv.dtype(), dtype);
        assert_identity(&a.dot(&inv)?, tol)?;
        assert_vec_approx(&inv.inv()?.to_f64_vec()?, &a.to_f64_vec()?, tol);
    }
    Ok(())
}

#[test]
fn test_solve_vector_and_matrix_rhs() -> vole::Result<()> {
    init_logger();
    let a = well_conditioned(4, DType::F64, 21);

    let b = uniform(4, DType::F64, 22);
    let x = a.solve(&b)?;
    assert_eq!(x.dims(), &[4]);
    assert_vec_approx(&a.dot(&x)?.to_f64_vec()?, &b.to_f64_vec()?, 1e-10);

    let b = uniform((4, 3), DType::F64, 23);
    let x = a.solve(&b)?;
    assert_eq!(x.dims(), &[4, 3]);
    assert_vec_approx(&a.dot(&x)?.to_f64_vec()?, &b.to_f64_vec()?, 1e-10);

    // solve agrees with inv · b
    let via_inv = a.inv()?.dot(&b)?;
    assert_vec_approx(&x.to_f64_vec()?, &via_inv.to_f64_vec()?, 1e-10);
    Ok(())
}

#[test]
fn test_solve_promotes_f32_f64() -> vole::Result<()> {
    let a = well_conditioned(3, DType::F32, 31);
    let b = uniform(3, DType::F64, 32);
    let x = a.solve(&b)?;
    assert_eq!(x.dtype(), DType::F64);
    Ok(())
}

#[test]
fn test_linalg_shape_errors() {
    init_logger();
    let rect = uniform((2, 3), DType::F64, 1);
    assert_eq!(rect.inv().unwrap_err().kind(), ErrorKind::Dimension);
    let rhs = uniform(2, DType::F64, 2);
    assert_eq!(rect.solve(&rhs).unwrap_err().kind(), ErrorKind::Dimension);

    let batched = uniform((2, 3, 3), DType::F64, 3);
    assert_eq!(batched.inv().unwrap_err().kind(), ErrorKind::Dimension);
    assert_eq!(batched.qr(QrMode::Reduced).unwrap_err().kind(), ErrorKind::Dimension);

    let a = well_conditioned(3, DType::F64, 4);
    for bad in [vec![4usize], vec![2, 3], vec![3, 2, 2]] {
        let b = CpuTensor::zeros(bad.clone(), DType::F64, &CpuDevice).unwrap();
        let err = a.solve(&b).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Dimension, "rhs {:?}", bad);
    }
}

#[test]
fn test_singular_matrix() {
    init_logger();
    let a = CpuTensor::from_f64_slice(
        &[1.0, 2.0, 3.0, 2.0, 4.0, 6.0, 0.0, 1.0, 1.0],
        (3, 3),
        DType::F64,
        &CpuDevice,
    )
    .unwrap();
    assert_eq!(a.inv().unwrap_err().kind(), ErrorKind::Singular);
    let b = CpuTensor::ones(3, DType::F64, &CpuDevice).unwrap();
    assert_eq!(a.solve(&b).unwrap_err().kind(), ErrorKind::Singular);

    let zero = CpuTensor::zeros((2, 2), DType::F32, &CpuDevice).unwrap();
    assert_eq!(zero.inv().unwrap_err().kind(), ErrorKind::Singular);
}

#[test]
fn test_linalg_rejects_non_float32_64() {
    for dtype in [DType::F16, DType::BF16, DType::I32, DType::Bool] {
        let a = CpuTensor::eye(2, dtype, &CpuDevice).unwrap();
        assert_eq!(a.inv().unwrap_err().kind(), ErrorKind::Dtype, "{}", dtype);
        assert_eq!(a.qr(QrMode::R).unwrap_err().kind(), ErrorKind::Dtype, "{}", dtype);
        let b = CpuTensor::ones(2, DType::F64, &CpuDevice).unwrap();
        assert_eq!(a.solve(&b).unwrap_err().kind(), ErrorKind::Dtype, "{}", dtype);
    }
}

#[test]
fn test_empty_matrices() -> vole::Result<()> {
    let a = CpuTensor::zeros((0, 0), DType::F64, &CpuDevice)?;
    assert_eq!(a.inv()?.dims(), &[0, 0]);

    let b = CpuTensor::zeros((0, 3), DType::F64, &CpuDevice)?;
    assert_eq!(a.solve(&b)?.dims(), &[0, 3]);

    let a = well_conditioned(2, DType::F64, 5);
    let b = CpuTensor::zeros((2, 0), DType::F64, &CpuDevice)?;
    assert_eq!(a.solve(&b)?.dims(), &[2, 0]);
    Ok(())
}

fn check_qr(m: usize, n: usize, dtype: DType, tol: f64) -> vole::Result<()> {
    let k = m.min(n);
    let a = uniform((m, n), dtype, (m * 10 + n) as u64);
    let av = a.to_f64_vec()?;

    for (mode, q_cols, r_rows) in [(QrMode::Reduced, k, k), (QrMode::Complete, m, m)] {
        let (q, r) = a.qr(mode)?.into_qr()?;
        assert_eq!(q.dims(), &[m, q_cols], "{}x{} {}", m, n, mode);
        assert_eq!(r.dims(), &[r_rows, n], "{}x{} {}", m, n, mode);
        assert_eq!(q.dtype(), dtype);

        // Q·R reconstructs A
        assert_vec_approx(&q.dot(&r)?.to_f64_vec()?, &av, tol);
        // QᵀQ = I
        assert_identity(&q.t()?.dot(&q)?.to_dtype(DType::F64)?, tol)?;
        // R is upper triangular
        let rv = r.to_f64_vec()?;
        for i in 0..r_rows {
            for j in 0..n.min(i) {
                assert_eq!(rv[i * n + j], 0.0, "R[{}, {}] of {}x{}", i, j, m, n);
            }
        }
    }
    Ok(())
}

#[test]
fn test_qr_properties() -> vole::Result<()> {
    init_logger();
    for (m, n) in [(1, 1), (3, 3), (5, 3), (3, 5), (4, 1), (1, 4)] {
        check_qr(m, n, DType::F64, 1e-10)?;
    }
    check_qr(6, 4, DType::F32, 1e-4)?;
    Ok(())
}

#[test]
fn test_qr_modes_agree() -> vole::Result<()> {
    let a = uniform((5, 3), DType::F32, 41);
    let reduced = a.qr(QrMode::Reduced)?;
    let r_reduced = reduced.r().expect("reduced has R").to_f64_vec()?;

    let r_only = a.qr(QrMode::R)?;
    assert!(r_only.q().is_none());
    let r = r_only.r().expect("mode r has R");
    assert_eq!(r.dims(), &[3, 3]);
    assert_eq!(r.dtype(), DType::F32);
    assert_vec_approx(&r.to_f64_vec()?, &r_reduced, 1e-6);

    match a.qr(QrMode::Raw)? {
        QrOutput::Raw { h, tau } => {
            assert_eq!(h.dims(), &[3, 5]);
            assert_eq!(tau.dims(), &[3]);
            assert_eq!(h.dtype(), DType::F64);
            assert_eq!(tau.dtype(), DType::F64);
            // the upper triangle of hᵀ is R
            let hv = h.to_f64_vec()?;
            for i in 0..3 {
                for j in i..3 {
                    let got = hv[j * 5 + i];
                    assert!((got - r_reduced[i * 3 + j]).abs() < 1e-5);
                }
            }
            assert!(a.qr(QrMode::Raw)?.into_qr().is_err());
        }
        other => panic!("expected raw factors, got {:?}", other),
    }
    Ok(())
}

#[test]
fn test_qr_empty() -> vole::Result<()> {
    let a = CpuTensor::zeros((0, 3), DType::F64, &CpuDevice)?;
    let (q, r) = a.qr(QrMode::Reduced)?.into_qr()?;
    assert_eq!(q.dims(), &[0, 0]);
    assert_eq!(r.dims(), &[0, 3]);

    let a = CpuTensor::zeros((3, 0), DType::F64, &CpuDevice)?;
    let (q, r) = a.qr(QrMode::Complete)?.into_qr()?;
    assert_eq!(q.dims(), &[3, 3]);
    assert_eq!(r.dims(), &[3, 0]);
    assert_identity(&q, 0.0)?;
    Ok(())
}
