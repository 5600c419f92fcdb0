// Dense linear algebra on the host
//
// All factorizations run in f64 on a row-major copy of the operand and the
// results are rounded back to the input dtype (F32 or F64; the routine
// layer has already refused everything else).
//
//   solve / inverse   LU with partial pivoting; an exactly zero pivot
//                     means the matrix is singular
//   qr                Householder reflections in LAPACK geqrf convention:
//                       H_j = I − tau_j v_j v_jᵀ,  v_j[0] = 1
//                       beta = −sign(alpha)·‖x‖,  tau = (beta − alpha) / beta
//                     Q is rebuilt by applying the reflectors to the
//                     identity in reverse order (orgqr).
//
// Raw mode returns the packed reflectors transposed, h (n, m), next to
// tau (k,), both as F64.

use crate::ops;
use crate::CpuStorage;
use vole_core::backend::{BackendStorage, QrFactors, QrMode};
use vole_core::dtype::DType;
use vole_core::error::{Error, Result};
use vole_core::layout::Layout;

/// Row-major dense matrix.
struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    fn read(storage: &CpuStorage, layout: &Layout) -> Result<Self> {
        let dims = layout.dims();
        if dims.len() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: dims.len(),
            });
        }
        Ok(Matrix {
            rows: dims[0],
            cols: dims[1],
            data: ops::to_f64_vec(storage, layout),
        })
    }

    fn identity(n: usize) -> Self {
        let mut data = vec![0.0; n * n];
        for i in 0..n {
            data[i * n + i] = 1.0;
        }
        Matrix {
            rows: n,
            cols: n,
            data,
        }
    }

    fn at(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.cols + j]
    }

    fn at_mut(&mut self, i: usize, j: usize) -> &mut f64 {
        &mut self.data[i * self.cols + j]
    }

    /// Rows `..rows`, columns `..cols`, with entries below the diagonal
    /// zeroed when `upper` is set.
    fn block(&self, rows: usize, cols: usize, upper: bool) -> Vec<f64> {
        let mut out = Vec::with_capacity(rows * cols);
        for i in 0..rows {
            for j in 0..cols {
                if upper && j < i {
                    out.push(0.0);
                } else {
                    out.push(self.at(i, j));
                }
            }
        }
        out
    }
}

// LU with partial pivoting

struct Lu {
    lu: Matrix,
    perm: Vec<usize>,
}

impl Lu {
    fn factor(mut a: Matrix, op: &'static str) -> Result<Self> {
        let n = a.rows;
        let mut perm: Vec<usize> = (0..n).collect();
        for col in 0..n {
            let mut pivot = col;
            let mut best = a.at(col, col).abs();
            for row in col + 1..n {
                let v = a.at(row, col).abs();
                if v > best {
                    best = v;
                    pivot = row;
                }
            }
            if best == 0.0 {
                log::debug!("{}: zero pivot in column {}", op, col);
                return Err(Error::SingularMatrix { op });
            }
            if pivot != col {
                for j in 0..n {
                    a.data.swap(col * n + j, pivot * n + j);
                }
                perm.swap(col, pivot);
            }
            let diag = a.at(col, col);
            for row in col + 1..n {
                let factor = a.at(row, col) / diag;
                *a.at_mut(row, col) = factor;
                for j in col + 1..n {
                    let upd = factor * a.at(col, j);
                    *a.at_mut(row, j) -= upd;
                }
            }
        }
        Ok(Lu { lu: a, perm })
    }

    /// Solve in place for every column of `b` (n × k).
    fn solve(&self, b: &Matrix) -> Matrix {
        let n = self.lu.rows;
        let k = b.cols;
        let mut x = Matrix {
            rows: n,
            cols: k,
            data: vec![0.0; n * k],
        };
        for (i, &p) in self.perm.iter().enumerate() {
            for j in 0..k {
                *x.at_mut(i, j) = b.at(p, j);
            }
        }
        for j in 0..k {
            for i in 0..n {
                let mut s = x.at(i, j);
                for p in 0..i {
                    s -= self.lu.at(i, p) * x.at(p, j);
                }
                *x.at_mut(i, j) = s;
            }
            for i in (0..n).rev() {
                let mut s = x.at(i, j);
                for p in i + 1..n {
                    s -= self.lu.at(i, p) * x.at(p, j);
                }
                *x.at_mut(i, j) = s / self.lu.at(i, i);
            }
        }
        x
    }
}

pub fn solve(a: &CpuStorage, a_layout: &Layout, b: &CpuStorage, b_layout: &Layout) -> Result<CpuStorage> {
    let dtype = a.dtype();
    let lu = Lu::factor(Matrix::read(a, a_layout)?, "solve")?;
    let x = lu.solve(&Matrix::read(b, b_layout)?);
    Ok(ops::from_f64_slice(&x.data, dtype))
}

pub fn inverse(a: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
    let dtype = a.dtype();
    let m = Matrix::read(a, layout)?;
    let n = m.rows;
    let lu = Lu::factor(m, "inv")?;
    let x = lu.solve(&Matrix::identity(n));
    Ok(ops::from_f64_slice(&x.data, dtype))
}

// Householder QR

/// Packed geqrf result: R on and above the diagonal, reflector tails below.
struct Householder {
    packed: Matrix,
    tau: Vec<f64>,
}

impl Householder {
    fn factor(mut a: Matrix) -> Self {
        let (m, n) = (a.rows, a.cols);
        let k = m.min(n);
        let mut tau = vec![0.0; k];
        for j in 0..k {
            let alpha = a.at(j, j);
            let xnorm = (j + 1..m).map(|i| a.at(i, j).powi(2)).sum::<f64>().sqrt();
            if xnorm == 0.0 {
                continue;
            }
            let beta = -alpha.signum() * alpha.hypot(xnorm);
            tau[j] = (beta - alpha) / beta;
            let scale = 1.0 / (alpha - beta);
            for i in j + 1..m {
                *a.at_mut(i, j) *= scale;
            }
            *a.at_mut(j, j) = beta;

            for c in j + 1..n {
                let w = a.at(j, c) + (j + 1..m).map(|i| a.at(i, j) * a.at(i, c)).sum::<f64>();
                let tw = tau[j] * w;
                *a.at_mut(j, c) -= tw;
                for i in j + 1..m {
                    let upd = tw * a.at(i, j);
                    *a.at_mut(i, c) -= upd;
                }
            }
        }
        Householder { packed: a, tau }
    }

    /// First `cols` columns of H_0 · … · H_{k−1}.
    fn q(&self, cols: usize) -> Vec<f64> {
        let m = self.packed.rows;
        let mut q = Matrix::identity(m);
        for j in (0..self.tau.len()).rev() {
            let tau = self.tau[j];
            if tau == 0.0 {
                continue;
            }
            for c in 0..m {
                let w = q.at(j, c) + (j + 1..m).map(|i| self.packed.at(i, j) * q.at(i, c)).sum::<f64>();
                let tw = tau * w;
                *q.at_mut(j, c) -= tw;
                for i in j + 1..m {
                    let upd = tw * self.packed.at(i, j);
                    *q.at_mut(i, c) -= upd;
                }
            }
        }
        q.block(m, cols, false)
    }

    /// Packed reflectors transposed to (n, m).
    fn h_transposed(&self) -> Vec<f64> {
        let (m, n) = (self.packed.rows, self.packed.cols);
        let mut out = Vec::with_capacity(m * n);
        for j in 0..n {
            for i in 0..m {
                out.push(self.packed.at(i, j));
            }
        }
        out
    }
}

pub fn qr(a: &CpuStorage, layout: &Layout, mode: QrMode) -> Result<QrFactors<CpuStorage>> {
    let dtype = a.dtype();
    let h = Householder::factor(Matrix::read(a, layout)?);
    let (m, n) = (h.packed.rows, h.packed.cols);
    let k = m.min(n);
    let cast = |data: Vec<f64>| ops::from_f64_slice(&data, dtype);
    Ok(match mode {
        QrMode::R => QrFactors::R(cast(h.packed.block(k, n, true))),
        QrMode::Raw => QrFactors::Raw {
            h: ops::from_f64_slice(&h.h_transposed(), DType::F64),
            tau: ops::from_f64_slice(&h.tau, DType::F64),
        },
        QrMode::Reduced => QrFactors::QR {
            q: cast(h.q(k)),
            r: cast(h.packed.block(k, n, true)),
        },
        QrMode::Complete => QrFactors::QR {
            q: cast(h.q(m)),
            r: cast(h.packed.block(m, n, true)),
        },
    })
}

#[cfg(test)]
mod tests {
    use crate::{init_logger, CpuDevice, CpuTensor};
    use vole_core::{DType, Error, QrMode, Result};

    fn assert_close(got: &[f64], expected: &[f64], tol: f64) {
        assert_eq!(got.len(), expected.len());
        for (i, (g, e)) in got.iter().zip(expected).enumerate() {
            assert!((g - e).abs() < tol, "index {}: got {} expected {}", i, g, e);
        }
    }

    #[test]
    fn test_solve_needs_pivoting() -> Result<()> {
        init_logger();
        let dev = CpuDevice;
        // zero in the (0, 0) position forces a row swap
        let a = CpuTensor::from_f64_slice(&[0.0, 2.0, 1.0, 1.0], (2, 2), DType::F64, &dev)?;
        let b = CpuTensor::from_f64_slice(&[4.0, 3.0], 2, DType::F64, &dev)?;
        let x = a.solve(&b)?;
        assert_eq!(x.dims(), &[2]);
        assert_close(&x.to_f64_vec()?, &[1.0, 2.0], 1e-12);
        Ok(())
    }

    #[test]
    fn test_singular_matrix() -> Result<()> {
        let dev = CpuDevice;
        let a = CpuTensor::from_f64_slice(&[1.0, 2.0, 2.0, 4.0], (2, 2), DType::F64, &dev)?;
        assert!(matches!(a.inv(), Err(Error::SingularMatrix { op: "inv" })));
        let b = CpuTensor::ones(2, DType::F64, &dev)?;
        assert!(matches!(a.solve(&b), Err(Error::SingularMatrix { .. })));
        Ok(())
    }

    #[test]
    fn test_inverse_f32() -> Result<()> {
        let dev = CpuDevice;
        let a = CpuTensor::from_f64_slice(&[4.0, 7.0, 2.0, 6.0], (2, 2), DType::F32, &dev)?;
        let inv = a.inv()?;
        assert_eq!(inv.dtype(), DType::F32);
        assert_close(&inv.to_f64_vec()?, &[0.6, -0.7, -0.2, 0.4], 1e-6);
        Ok(())
    }

    #[test]
    fn test_qr_raw_follows_geqrf() -> Result<()> {
        let dev = CpuDevice;
        let a = CpuTensor::from_f64_slice(&[3.0, 4.0], (2, 1), DType::F32, &dev)?;
        let out = a.qr(QrMode::Raw)?;
        let (h, tau) = match out {
            vole_core::QrOutput::Raw { h, tau } => (h, tau),
            _ => panic!("expected raw factors"),
        };
        assert_eq!(h.dims(), &[1, 2]);
        assert_eq!(h.dtype(), DType::F64);
        assert_eq!(tau.dtype(), DType::F64);
        assert_close(&h.to_f64_vec()?, &[-5.0, 0.5], 1e-12);
        assert_close(&tau.to_f64_vec()?, &[1.6], 1e-12);
        Ok(())
    }

    #[test]
    fn test_qr_reconstructs() -> Result<()> {
        let dev = CpuDevice;
        let data = [2.0, -1.0, 0.5, 1.0, 3.0, -2.0, 0.0, 1.0, 4.0, 1.5, -0.5, 2.0];
        let cases = [
            ((4, 3), QrMode::Reduced),
            ((4, 3), QrMode::Complete),
            ((3, 4), QrMode::Reduced),
        ];
        for (shape, mode) in cases {
            let a = CpuTensor::from_f64_slice(&data, shape, DType::F64, &dev)?;
            let (q, r) = a.qr(mode)?.into_qr()?;
            assert_close(&q.dot(&r)?.to_f64_vec()?, &data, 1e-12);
            let qtq = q.t()?.dot(&q)?;
            let cols = q.dims()[1];
            let eye = CpuTensor::eye(cols, DType::F64, &dev)?;
            assert_close(&qtq.to_f64_vec()?, &eye.to_f64_vec()?, 1e-12);
            assert_close(&r.tril(-1)?.to_f64_vec()?, &vec![0.0; r.elem_count()], 1e-15);
        }
        Ok(())
    }
}
