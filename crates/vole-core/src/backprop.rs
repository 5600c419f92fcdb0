// Backpropagation — Reverse-mode automatic differentiation
//
//   1. Forward: every routine records an Op holding its inputs.
//   2. backward() topologically sorts the DAG reachable from the root.
//   3. Starting from the seed gradient, walk in reverse order and apply the
//      chain rule of each Op, accumulating into a GradStore.
//
// Every rule below is written with recorded tensor routines (dot, solve,
// conv, tril, sum, ...), never with raw host loops. The gradients returned
// are therefore graph nodes themselves: calling backward() on a function of
// first-order gradients gives second-order gradients.
//
// GRADIENT RULES:
//
//   Binary Add/Sub/Mul   the usual, then summed back over broadcast axes
//   Dot                  gA = gC·Bᵀ,  gB = Aᵀ·gC        (batched, summed to shape)
//   Solve                gB = solve(Aᵀ, gX),  gA = −gB·Xᵀ
//   Inverse              gA = −Yᵀ·gY·Yᵀ
//   Qr (square R)        M = R·gRᵀ − gQᵀ·Q
//                        gA = (gQ + Q·copyltu(M))·R⁻ᵀ
//   Conv                 gx = conv_transpose(gy, w),  gw = corr(x, gy)
//   ConvTranspose        gx = conv(gy, w),            gw = corr(gy, x)
//   ConvGradWeight       gx = conv_transpose(gy_col, ggw), gcol = conv(x, ggw)
//   Sum / Expand         expand / sum_to_shape (each other's adjoint)
//   Triangular           same mask applied to the gradient
//
// ACCUMULATION: a tensor used several times receives the sum of all
// contributions.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::backend::{Backend, BinaryOp, QrMode};
use crate::error::{Error, Result};
use crate::op::{Op, QrPart, TensorId};
use crate::tensor::Tensor;

/// Stores gradients for all tensors in a computation graph.
///
/// After calling `tensor.backward()`, use `grads.get(&x)` to retrieve the
/// gradient of any tensor that contributed to the root.
pub struct GradStore<B: Backend> {
    grads: HashMap<TensorId, Tensor<B>>,
}

impl<B: Backend> Clone for GradStore<B> {
    fn clone(&self) -> Self {
        GradStore {
            grads: self.grads.clone(),
        }
    }
}

impl<B: Backend> fmt::Debug for GradStore<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GradStore(len={})", self.grads.len())
    }
}

impl<B: Backend> Default for GradStore<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> GradStore<B> {
    pub fn new() -> Self {
        GradStore {
            grads: HashMap::new(),
        }
    }

    /// Get the gradient of a tensor (if any gradient reached it).
    pub fn get(&self, tensor: &Tensor<B>) -> Option<&Tensor<B>> {
        self.grads.get(&tensor.id())
    }

    /// Like `get`, but an unreached tensor is an error.
    pub fn require(&self, tensor: &Tensor<B>) -> Result<&Tensor<B>> {
        self.get(tensor)
            .ok_or_else(|| Error::msg(format!("no gradient reached tensor {:?}", tensor.id())))
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    /// Accumulate gradient for a tensor.
    pub fn accumulate(&mut self, id: TensorId, grad: Tensor<B>) -> Result<()> {
        let merged = match self.grads.get(&id) {
            Some(existing) => existing.add(&grad)?,
            None => grad,
        };
        self.grads.insert(id, merged);
        Ok(())
    }
}

/// Post-order DFS from the root: every tensor appears after its inputs.
fn build_topo<B: Backend>(root: &Tensor<B>) -> Vec<Tensor<B>> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    // Explicit stack: deep graphs (long chains of views) must not overflow.
    let mut stack: Vec<(Tensor<B>, bool)> = vec![(root.clone(), false)];
    while let Some((t, expanded)) = stack.pop() {
        if expanded {
            order.push(t);
            continue;
        }
        if !visited.insert(t.id()) {
            continue;
        }
        stack.push((t.clone(), true));
        for input in t.op().inputs() {
            if !visited.contains(&input.id()) {
                stack.push((input.clone(), false));
            }
        }
    }
    order
}

/// Gradients of a one-element `root` (seed gradient 1).
pub fn backward<B: Backend>(root: &Tensor<B>) -> Result<GradStore<B>> {
    if !root.dtype().is_float() {
        return Err(Error::UnsupportedDType {
            op: "backward",
            dtype: root.dtype(),
        });
    }
    if root.elem_count() != 1 {
        return Err(Error::NotAScalar {
            shape: root.shape().clone(),
        });
    }
    let seed = Tensor::<B>::ones(root.shape().clone(), root.dtype(), root.device())?;
    backward_with_grad(root, &seed)
}

/// Gradients of `root` given the upstream gradient `grad` (same shape).
pub fn backward_with_grad<B: Backend>(root: &Tensor<B>, grad: &Tensor<B>) -> Result<GradStore<B>> {
    if !root.dtype().is_float() {
        return Err(Error::UnsupportedDType {
            op: "backward",
            dtype: root.dtype(),
        });
    }
    if grad.shape() != root.shape() {
        return Err(Error::ShapeMismatch {
            expected: root.shape().clone(),
            got: grad.shape().clone(),
        });
    }
    root.same_device(grad)?;

    let topo = build_topo(root);
    log::debug!("backward: {} nodes from root {:?}", topo.len(), root.id());

    let mut grads = GradStore::new();
    grads.accumulate(root.id(), grad.to_dtype(root.dtype())?)?;

    for tensor in topo.iter().rev() {
        let grad_output = match grads.get(tensor) {
            Some(g) => g.clone(),
            None => continue,
        };
        log::trace!("backward: applying {:?}", tensor.op());

        match tensor.op() {
            Op::None => {}

            Op::Contiguous { input } => {
                grads.accumulate(input.id(), grad_output)?;
            }

            Op::Binary { lhs, rhs, op } => {
                compute_binary_grad(*op, &grad_output, lhs, rhs, &mut grads)?;
            }

            Op::Affine { input, mul, .. } => {
                grads.accumulate(input.id(), grad_output.affine(*mul, 0.0)?)?;
            }

            Op::Sum { input, dims } => {
                // dims are sorted ascending, so unsqueezing in order restores positions
                let mut g = grad_output;
                for &d in dims {
                    g = g.unsqueeze(d)?;
                }
                grads.accumulate(input.id(), g.expand(input.shape().clone())?)?;
            }

            Op::Reshape { input, src_shape } => {
                grads.accumulate(input.id(), grad_output.reshape(src_shape.clone())?)?;
            }

            Op::Transpose { input, dim0, dim1 } => {
                grads.accumulate(input.id(), grad_output.transpose(*dim0, *dim1)?)?;
            }

            Op::Permute { input, perm } => {
                let mut inverse = vec![0usize; perm.len()];
                for (i, &p) in perm.iter().enumerate() {
                    inverse[p] = i;
                }
                grads.accumulate(input.id(), grad_output.permute(&inverse)?)?;
            }

            Op::Expand { input, src_shape } => {
                grads.accumulate(input.id(), grad_output.sum_to_shape(src_shape)?)?;
            }

            Op::ToDtype { input, src_dtype } => {
                // integer sources are constants for differentiation
                if src_dtype.is_float() {
                    grads.accumulate(input.id(), grad_output.to_dtype(*src_dtype)?)?;
                }
            }

            Op::Triangular {
                input,
                diagonal,
                upper,
            } => {
                let g = if *upper {
                    grad_output.triu(*diagonal)?
                } else {
                    grad_output.tril(*diagonal)?
                };
                grads.accumulate(input.id(), g)?;
            }

            Op::Dot { lhs, rhs } => {
                compute_dot_grad(&grad_output, lhs, rhs, &mut grads)?;
            }

            Op::Solve { a, b } => {
                compute_solve_grad(&grad_output, a, b, &mut grads)?;
            }

            Op::Inverse { input } => {
                let y = input.inv()?;
                let yt = y.t()?;
                let g = yt.dot(&grad_output)?.dot(&yt)?.neg()?;
                grads.accumulate(input.id(), g)?;
            }

            Op::Qr { input, mode, part } => {
                compute_qr_grad(&grad_output, input, *mode, *part, &mut grads)?;
            }

            Op::Conv {
                image,
                weight,
                geom,
            } => {
                let gx = Tensor::conv_col_to_image(&grad_output, weight, geom)?;
                let gw = Tensor::conv_weight_grad(image, &grad_output, geom)?;
                grads.accumulate(image.id(), gx)?;
                grads.accumulate(weight.id(), gw)?;
            }

            Op::ConvTranspose { col, weight, geom } => {
                let gc = Tensor::conv_image_to_col(&grad_output, weight, geom)?;
                let gw = Tensor::conv_weight_grad(&grad_output, col, geom)?;
                grads.accumulate(col.id(), gc)?;
                grads.accumulate(weight.id(), gw)?;
            }

            Op::ConvGradWeight { image, col, geom } => {
                let gx = Tensor::conv_col_to_image(col, &grad_output, geom)?;
                let gc = Tensor::conv_image_to_col(image, &grad_output, geom)?;
                grads.accumulate(image.id(), gx)?;
                grads.accumulate(col.id(), gc)?;
            }
        }
    }

    Ok(grads)
}

// Gradient rules for binary operations

fn compute_binary_grad<B: Backend>(
    op: BinaryOp,
    grad_output: &Tensor<B>,
    lhs: &Tensor<B>,
    rhs: &Tensor<B>,
    grads: &mut GradStore<B>,
) -> Result<()> {
    let (raw_lhs, raw_rhs) = match op {
        BinaryOp::Add => (grad_output.clone(), grad_output.clone()),
        BinaryOp::Sub => (grad_output.clone(), grad_output.neg()?),
        BinaryOp::Mul => (grad_output.mul(rhs)?, grad_output.mul(lhs)?),
    };
    grads.accumulate(lhs.id(), raw_lhs.sum_to_shape(lhs.shape())?)?;
    grads.accumulate(rhs.id(), raw_rhs.sum_to_shape(rhs.shape())?)?;
    Ok(())
}

// Dot: operands are rank ≥ 2 here (vectors were unsqueezed by the routine),
// batch axes may have been broadcast, so each gradient is summed back.

fn compute_dot_grad<B: Backend>(
    grad_output: &Tensor<B>,
    lhs: &Tensor<B>,
    rhs: &Tensor<B>,
    grads: &mut GradStore<B>,
) -> Result<()> {
    let grad_lhs = grad_output.dot(&rhs.t()?)?;
    grads.accumulate(lhs.id(), grad_lhs.sum_to_shape(lhs.shape())?)?;

    let grad_rhs = lhs.t()?.dot(grad_output)?;
    grads.accumulate(rhs.id(), grad_rhs.sum_to_shape(rhs.shape())?)?;
    Ok(())
}

fn compute_solve_grad<B: Backend>(
    grad_output: &Tensor<B>,
    a: &Tensor<B>,
    b: &Tensor<B>,
    grads: &mut GradStore<B>,
) -> Result<()> {
    let x = a.solve(b)?;
    let grad_b = a.t()?.solve(grad_output)?;
    let grad_a = grad_b.dot(&x.t()?)?.neg()?;
    grads.accumulate(a.id(), grad_a)?;
    grads.accumulate(b.id(), grad_b)?;
    Ok(())
}

// QR: the rule only exists when R is square (reduced with m ≥ n, or complete
// with m == n). It is linear in (gQ, gR), so the Q and R outputs contribute
// independently:
//
//   from Q:  M = −gQᵀ·Q      B = gQ + Q·copyltu(M)
//   from R:  M =  R·gRᵀ      B = Q·copyltu(M)
//   gA = B·R⁻ᵀ = solve(R, Bᵀ)ᵀ

fn compute_qr_grad<B: Backend>(
    grad_output: &Tensor<B>,
    input: &Tensor<B>,
    mode: QrMode,
    part: QrPart,
    grads: &mut GradStore<B>,
) -> Result<()> {
    let (m, n) = input.shape().matrix_dims()?;
    let square_r = match mode {
        QrMode::Reduced => m >= n,
        QrMode::Complete => m == n,
        QrMode::R | QrMode::Raw => false,
    };
    if !square_r {
        return Err(Error::GradientNotImplemented {
            op: format!("qr(mode={}) for a {}x{} matrix", mode, m, n),
        });
    }

    let (q, r) = input.qr(mode)?.into_qr()?;
    let b = match part {
        QrPart::Q => {
            let mm = grad_output.t()?.dot(&q)?.neg()?;
            grad_output.add(&q.dot(&copyltu(&mm)?)?)?
        }
        QrPart::R => {
            let mm = r.dot(&grad_output.t()?)?;
            q.dot(&copyltu(&mm)?)?
        }
        QrPart::H | QrPart::Tau => {
            return Err(Error::GradientNotImplemented {
                op: "qr(mode=raw)".to_string(),
            })
        }
    };
    let grad_a = r.solve(&b.t()?)?.t()?;
    grads.accumulate(input.id(), grad_a)?;
    Ok(())
}

/// tril(M) + tril(M, −1)ᵀ
fn copyltu<B: Backend>(m: &Tensor<B>) -> Result<Tensor<B>> {
    m.tril(0)?.add(&m.tril(-1)?.t()?)
}

#[cfg(test)]
mod tests {
    use super::GradStore;
    use crate::tensor::tests::{init_logger, t, HostBackend, HostDevice, T};
    use crate::{DType, Error, ErrorKind};

    fn approx(a: &[f64], b: &[f64]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-12, "{:?} vs {:?}", a, b);
        }
    }

    #[test]
    fn test_grad_store_debug() {
        let a = t(&[1.0, 2.0], 2);
        let b = t(&[3.0, 4.0], 2);
        let grads = a.mul(&b).unwrap().sum_all().unwrap().backward().unwrap();
        assert_eq!(format!("{:?}", grads), format!("GradStore(len={})", grads.len()));
        assert_eq!(format!("{:?}", GradStore::<HostBackend>::new()), "GradStore(len=0)");
    }

    #[test]
    fn test_mul_broadcast_grad() {
        init_logger();
        let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3));
        let b = t(&[10.0, 20.0, 30.0], 3);
        let loss = a.mul(&b).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        approx(
            &grads.get(&a).unwrap().to_f64_vec().unwrap(),
            &[10.0, 20.0, 30.0, 10.0, 20.0, 30.0],
        );
        approx(&grads.get(&b).unwrap().to_f64_vec().unwrap(), &[5.0, 7.0, 9.0]);
    }

    #[test]
    fn test_reuse_accumulates() {
        let a = t(&[3.0], ());
        let loss = a.mul(&a).unwrap();
        let grads = loss.backward().unwrap();
        approx(&grads.get(&a).unwrap().to_f64_vec().unwrap(), &[6.0]);
    }

    #[test]
    fn test_dot_grad() {
        let a = t(&[1.0, 2.0, 3.0, 4.0], (2, 2));
        let b = t(&[5.0, 6.0], 2);
        let grads = a.dot(&b).unwrap().sum_all().unwrap().backward().unwrap();
        // d/dA sum(A·b) = 1 bᵀ
        approx(&grads.get(&a).unwrap().to_f64_vec().unwrap(), &[5.0, 6.0, 5.0, 6.0]);
        // d/db = Aᵀ 1
        approx(&grads.get(&b).unwrap().to_f64_vec().unwrap(), &[4.0, 6.0]);
    }

    #[test]
    fn test_permute_and_tril_grad() {
        let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (1, 2, 3));
        let p = a.permute(&[2, 0, 1]).unwrap();
        let w = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (3, 1, 2));
        let grads = p.mul(&w).unwrap().sum_all().unwrap().backward().unwrap();
        // gradient of a[0, i, j] is w[j, 0, i]
        approx(
            &grads.get(&a).unwrap().to_f64_vec().unwrap(),
            &[1.0, 3.0, 5.0, 2.0, 4.0, 6.0],
        );

        let m = t(&[1.0, 2.0, 3.0, 4.0], (2, 2));
        let g = m.tril(0).unwrap().sum_all().unwrap().backward().unwrap();
        approx(&g.get(&m).unwrap().to_f64_vec().unwrap(), &[1.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_backward_with_grad_and_checks() {
        let a = t(&[1.0, 2.0], 2);
        let y = a.affine(3.0, 1.0).unwrap();
        let seed = t(&[1.0, -1.0], 2);
        let grads = y.backward_with_grad(&seed).unwrap();
        approx(&grads.get(&a).unwrap().to_f64_vec().unwrap(), &[3.0, -3.0]);

        assert!(matches!(y.backward(), Err(Error::NotAScalar { .. })));
        let wrong = t(&[1.0], 1);
        assert!(y.backward_with_grad(&wrong).is_err());
    }

    #[test]
    fn test_non_float_root_rejected() {
        init_logger();
        let i = T::from_f64_slice(&[1.0], (), DType::I32, &HostDevice).unwrap();
        let err = i.backward().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Dtype);
    }

    #[test]
    fn test_double_backward_of_square() {
        // y = x·x·x, dy/dx = 3x², d²y/dx² = 6x
        let x = t(&[2.0], ());
        let y = x.mul(&x).unwrap().mul(&x).unwrap();
        let g = y.backward().unwrap().get(&x).unwrap().clone();
        approx(&g.to_f64_vec().unwrap(), &[12.0]);
        let gg = g.backward().unwrap();
        approx(&gg.get(&x).unwrap().to_f64_vec().unwrap(), &[12.0]);
    }
}
