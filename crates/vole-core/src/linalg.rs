use crate::backend::{Backend, BackendStorage, QrFactors, QrMode};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::op::{Op, QrPart};
use crate::shape::{DotShape, Shape};
use crate::tensor::Tensor;

// Linear algebra routines: dot, tensordot_last, solve, inv, qr
//
// Every routine follows the same order:
//
//   1. shape/rank validation      → Dimension errors, nothing computed yet
//   2. device and dtype checks    → DeviceMismatch / UnsupportedDType
//   3. capability query           → Unsupported
//   4. cast to the result dtype, dispatch to the backend kernel
//   5. record the Op so backward() can differentiate it

/// Factors returned by [`Tensor::qr`], one arm per mode family.
#[derive(Debug, Clone)]
pub enum QrOutput<B: Backend> {
    /// Mode `R`: `R (k, n)`.
    R(Tensor<B>),
    /// Mode `Raw`: `h (n, m)` and `tau (k,)`, both F64.
    Raw { h: Tensor<B>, tau: Tensor<B> },
    /// Modes `Reduced` and `Complete`.
    QR { q: Tensor<B>, r: Tensor<B> },
}

impl<B: Backend> QrOutput<B> {
    pub fn q(&self) -> Option<&Tensor<B>> {
        match self {
            QrOutput::QR { q, .. } => Some(q),
            _ => None,
        }
    }

    pub fn r(&self) -> Option<&Tensor<B>> {
        match self {
            QrOutput::R(r) | QrOutput::QR { r, .. } => Some(r),
            QrOutput::Raw { .. } => None,
        }
    }

    /// `(Q, R)` for the reduced/complete modes.
    pub fn into_qr(self) -> Result<(Tensor<B>, Tensor<B>)> {
        match self {
            QrOutput::QR { q, r } => Ok((q, r)),
            _ => Err(Error::msg("qr: Q is only produced by reduced/complete modes")),
        }
    }
}

impl<B: Backend> Tensor<B> {
    // dot — batched matrix product
    //
    //   ()    · x      → elementwise product
    //   (k,)  · (k,)   → ()
    //   (..., m, k) · (..., k, n) → (batch, m, n), batch axes broadcast

    /// Matrix product with broadcast batch axes (matmul semantics).
    pub fn dot(&self, rhs: &Self) -> Result<Self> {
        let out_dtype = DType::promote(self.dtype(), rhs.dtype());

        if self.rank() == 0 || rhs.rank() == 0 {
            Shape::broadcast_shape(self.shape(), rhs.shape())?;
            self.same_device(rhs)?;
            self.check_dot_capability(out_dtype)?;
            return self.to_dtype(out_dtype)?.mul(&rhs.to_dtype(out_dtype)?);
        }

        let geom = DotShape::resolve(self.shape(), rhs.shape())?;
        self.same_device(rhs)?;
        self.check_dot_capability(out_dtype)?;
        log::debug!(
            "dot: {} . {} -> {} ({}, {})",
            self.shape(),
            rhs.shape(),
            geom.out,
            out_dtype,
            B::name()
        );

        let mut lhs = self.to_dtype(out_dtype)?;
        let mut rhs = rhs.to_dtype(out_dtype)?;
        if geom.lhs_vector {
            lhs = lhs.unsqueeze(0)?;
        }
        if geom.rhs_vector {
            rhs = rhs.unsqueeze(1)?;
        }

        let mut result = lhs.dot_matrices(&rhs, &geom)?;
        if geom.rhs_vector {
            result = result.squeeze(result.rank() - 1)?;
        }
        if geom.lhs_vector {
            result = result.squeeze(geom.batch.rank())?;
        }
        Ok(result)
    }

    /// Batched product of two operands of rank ≥ 2 with the same dtype.
    fn dot_matrices(&self, rhs: &Self, geom: &DotShape) -> Result<Self> {
        let out_shape = geom.batch.extend(&[geom.m, geom.n]);
        let op = Op::Dot {
            lhs: self.clone(),
            rhs: rhs.clone(),
        };

        if geom.k == 0 || out_shape.elem_count() == 0 {
            let storage = B::zeros(&out_shape, self.dtype(), self.device())?;
            return Ok(self.derived(storage, out_shape, self.dtype(), op));
        }

        let lhs_layout = self
            .layout()
            .broadcast_as(&geom.batch.extend(&[geom.m, geom.k]))?;
        let rhs_layout = rhs
            .layout()
            .broadcast_as(&geom.batch.extend(&[geom.k, geom.n]))?;
        let storage = {
            let l = self.storage()?;
            let r = rhs.storage()?;
            B::matmul(&l, &lhs_layout, &r, &rhs_layout)?
        };
        Ok(self.derived(storage, out_shape, self.dtype(), op))
    }

    fn check_dot_capability(&self, dtype: DType) -> Result<()> {
        let caps = B::capabilities(self.device());
        let allowed = if dtype.is_half() {
            caps.half_dot
        } else if dtype.is_float() {
            true
        } else {
            caps.integer_dot
        };
        if allowed {
            return Ok(());
        }
        let feature = format!("dot over {}", dtype);
        log::warn!("{} backend rejected {}", B::name(), feature);
        Err(Error::Unsupported {
            backend: B::name(),
            feature,
        })
    }

    // tensordot_last — the array-library `dot` for N-d operands
    //
    // Contracts the last axis of self with the second-to-last axis of rhs:
    //
    //   (A..., k) · (Bb..., k, n) → (A..., Bb..., n)
    //
    // Built from reshape/permute/dot so gradients come for free.

    /// N-d dot: result shape is `self[:-1] + rhs[:-2] + rhs[-1:]`.
    pub fn tensordot_last(&self, rhs: &Self) -> Result<Self> {
        if self.rank() == 0 || rhs.rank() <= 1 || self.rank() == 1 {
            return self.dot(rhs);
        }
        let ra = self.rank();
        let rb = rhs.rank();
        let k = self.dims()[ra - 1];
        let kb = rhs.dims()[rb - 2];
        if k != kb {
            return Err(Error::DotShapeMismatch {
                lhs: self.shape().clone(),
                rhs: rhs.shape().clone(),
                k1: k,
                k2: kb,
            });
        }
        let lead_a = &self.dims()[..ra - 1];
        let lead_b = &rhs.dims()[..rb - 2];
        let n = rhs.dims()[rb - 1];
        let p: usize = lead_a.iter().product();
        let q: usize = lead_b.iter().product();

        let mut perm = Vec::with_capacity(rb);
        perm.push(rb - 2);
        perm.extend(0..rb - 2);
        perm.push(rb - 1);

        let a2 = self.reshape((p, k))?;
        let b2 = rhs.permute(&perm)?.reshape((k, q * n))?;
        let mut out_dims = lead_a.to_vec();
        out_dims.extend_from_slice(lead_b);
        out_dims.push(n);
        a2.dot(&b2)?.reshape(out_dims)
    }

    // solve / inv

    fn check_linalg(&self, op: &'static str) -> Result<()> {
        self.dtype().ensure_linalg(op)?;
        if !B::capabilities(self.device()).linalg {
            log::warn!("{} backend rejected {}", B::name(), op);
            return Err(Error::Unsupported {
                backend: B::name(),
                feature: op.to_string(),
            });
        }
        Ok(())
    }

    fn square_dim(&self, op: &'static str) -> Result<usize> {
        if self.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.rank(),
            });
        }
        let (m, n) = self.shape().matrix_dims()?;
        if m != n {
            return Err(Error::NotSquare {
                op,
                shape: self.shape().clone(),
            });
        }
        Ok(n)
    }

    /// Solve `self · x = b` for square `self (n, n)` and `b (n,)` or `(n, k)`.
    pub fn solve(&self, b: &Self) -> Result<Self> {
        let n = self.square_dim("solve")?;
        if b.rank() == 0 || b.rank() > 2 || b.dims()[0] != n {
            let mut expected = b.dims().to_vec();
            match expected.first_mut() {
                Some(first) => *first = n,
                None => expected.push(n),
            }
            return Err(Error::ShapeMismatch {
                expected: Shape::new(expected),
                got: b.shape().clone(),
            });
        }
        self.same_device(b)?;
        self.check_linalg("solve")?;
        b.check_linalg("solve")?;
        let dtype = DType::promote(self.dtype(), b.dtype());
        log::debug!("solve: {} \\ {} ({})", self.shape(), b.shape(), dtype);

        let a = self.to_dtype(dtype)?;
        let vector = b.rank() == 1;
        let b2 = if vector {
            b.to_dtype(dtype)?.unsqueeze(1)?
        } else {
            b.to_dtype(dtype)?
        };

        let out_shape = b2.shape().clone();
        let storage = if out_shape.elem_count() == 0 {
            B::zeros(&out_shape, dtype, a.device())?
        } else {
            let sa = a.storage()?;
            let sb = b2.storage()?;
            B::solve(&sa, a.layout(), &sb, b2.layout())?
        };
        let x = a.derived(
            storage,
            out_shape,
            dtype,
            Op::Solve {
                a: a.clone(),
                b: b2.clone(),
            },
        );
        if vector {
            x.squeeze(1)
        } else {
            Ok(x)
        }
    }

    /// Inverse of a square matrix.
    pub fn inv(&self) -> Result<Self> {
        let n = self.square_dim("inv")?;
        self.check_linalg("inv")?;
        log::debug!("inv: {} ({})", self.shape(), self.dtype());
        let shape = Shape::from((n, n));
        let storage = if n == 0 {
            B::zeros(&shape, self.dtype(), self.device())?
        } else {
            let s = self.storage()?;
            B::inverse(&s, self.layout())?
        };
        Ok(self.derived(
            storage,
            shape,
            self.dtype(),
            Op::Inverse {
                input: self.clone(),
            },
        ))
    }

    // qr
    //
    //   mode       outputs             (k = min(m, n))
    //   R          R (k, n)
    //   Raw        h (n, m), tau (k,)  F64
    //   Reduced    Q (m, k), R (k, n)
    //   Complete   Q (m, m), R (m, n)

    /// QR factorization of a 2-D matrix.
    pub fn qr(&self, mode: QrMode) -> Result<QrOutput<B>> {
        if self.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.rank(),
            });
        }
        self.check_linalg("qr")?;
        let (m, n) = self.shape().matrix_dims()?;
        let k = m.min(n);
        log::debug!("qr: {} mode={} ({})", self.shape(), mode, self.dtype());

        let factors = {
            let s = self.storage()?;
            B::qr(&s, self.layout(), mode)?
        };
        let part = |storage: B::Storage, shape: Shape, part: QrPart| -> Self {
            let dtype = storage.dtype();
            Tensor::from_storage(
                storage,
                Layout::contiguous(shape),
                dtype,
                self.device().clone(),
                Op::Qr {
                    input: self.clone(),
                    mode,
                    part,
                },
            )
        };

        Ok(match (mode, factors) {
            (QrMode::R, QrFactors::R(r)) => QrOutput::R(part(r, Shape::from((k, n)), QrPart::R)),
            (QrMode::Raw, QrFactors::Raw { h, tau }) => QrOutput::Raw {
                h: part(h, Shape::from((n, m)), QrPart::H),
                tau: part(tau, Shape::from(k), QrPart::Tau),
            },
            (QrMode::Reduced, QrFactors::QR { q, r }) => QrOutput::QR {
                q: part(q, Shape::from((m, k)), QrPart::Q),
                r: part(r, Shape::from((k, n)), QrPart::R),
            },
            (QrMode::Complete, QrFactors::QR { q, r }) => QrOutput::QR {
                q: part(q, Shape::from((m, m)), QrPart::Q),
                r: part(r, Shape::from((m, n)), QrPart::R),
            },
            (mode, _) => {
                return Err(Error::msg(format!(
                    "{} backend returned factors that do not match qr mode {}",
                    B::name(),
                    mode
                )))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::tensor::tests::{t, HostDevice, T};
    use crate::{DType, Error, ErrorKind};

    #[test]
    fn test_dot_matrix_vector() {
        let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3));
        let v = t(&[1.0, 0.0, -1.0], 3);
        let r = a.dot(&v).unwrap();
        assert_eq!(r.dims(), &[2]);
        assert_eq!(r.to_f64_vec().unwrap(), vec![-2.0, -2.0]);

        let w = t(&[1.0, 1.0], 2);
        let r = w.dot(&a).unwrap();
        assert_eq!(r.dims(), &[3]);
        assert_eq!(r.to_f64_vec().unwrap(), vec![5.0, 7.0, 9.0]);
    }

    #[test]
    fn test_dot_broadcast_batch() {
        let a = t(&[1.0, 2.0, 3.0, 4.0], (2, 1, 2));
        let b = t(&[1.0, 1.0], (2, 1));
        let r = a.dot(&b).unwrap();
        assert_eq!(r.dims(), &[2, 1, 1]);
        assert_eq!(r.to_f64_vec().unwrap(), vec![3.0, 7.0]);

        let bad = t(&[0.0; 6], (3, 2, 1));
        assert!(matches!(a.dot(&bad), Err(Error::NotBroadcastable { .. })));
    }

    #[test]
    fn test_dot_scalar_and_empty() {
        let s = t(&[2.0], ());
        let a = t(&[1.0, 2.0, 3.0], 3);
        assert_eq!(s.dot(&a).unwrap().to_f64_vec().unwrap(), vec![2.0, 4.0, 6.0]);

        let e1 = T::zeros((2, 0), DType::F64, &HostDevice).unwrap();
        let e2 = T::zeros((0, 3), DType::F64, &HostDevice).unwrap();
        let r = e1.dot(&e2).unwrap();
        assert_eq!(r.dims(), &[2, 3]);
        assert_eq!(r.to_f64_vec().unwrap(), vec![0.0; 6]);
    }

    #[test]
    fn test_dot_promotes_dtype() {
        let a = T::from_f64_slice(&[1.0, 2.0], 2, DType::I32, &HostDevice).unwrap();
        let b = T::from_f64_slice(&[3.0, 4.0], 2, DType::F32, &HostDevice).unwrap();
        let r = a.dot(&b).unwrap();
        assert_eq!(r.dtype(), DType::F32);
        assert_eq!(r.to_f64_vec().unwrap(), vec![11.0]);
    }

    #[test]
    fn test_tensordot_last_shape() {
        let a = T::ones((2, 3, 4), DType::F64, &HostDevice).unwrap();
        let b = T::ones((5, 4, 6), DType::F64, &HostDevice).unwrap();
        let r = a.tensordot_last(&b).unwrap();
        assert_eq!(r.dims(), &[2, 3, 5, 6]);
        assert!(r.to_f64_vec().unwrap().iter().all(|&v| v == 4.0));

        let bad = T::ones((5, 3, 6), DType::F64, &HostDevice).unwrap();
        let err = a.tensordot_last(&bad).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Dimension);
    }

    #[test]
    fn test_linalg_validation_precedes_dispatch() {
        let a = t(&[1.0; 6], (2, 3));
        assert!(matches!(a.inv(), Err(Error::NotSquare { .. })));
        let sq = t(&[1.0, 0.0, 0.0, 1.0], (2, 2));
        let b = t(&[1.0, 2.0, 3.0], 3);
        assert!(matches!(sq.solve(&b), Err(Error::ShapeMismatch { .. })));
        let half = T::from_f64_slice(&[1.0, 0.0, 0.0, 1.0], (2, 2), DType::F16, &HostDevice).unwrap();
        assert_eq!(half.inv().unwrap_err().kind(), ErrorKind::Dtype);
        let v = t(&[1.0, 2.0], 2);
        assert!(matches!(v.qr(crate::QrMode::Reduced), Err(Error::RankMismatch { .. })));
    }
}
