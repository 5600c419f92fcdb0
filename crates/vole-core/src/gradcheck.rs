//! Finite-difference gradient checking.
//!
//! `check_gradients` compares the reverse-mode gradients of
//! `L(x) = Σ f(x) ⊙ gy` against central differences
//! `(L(x + εeᵢ) − L(x − εeᵢ)) / 2ε`, one input element at a time.
//!
//! `check_double_gradients` does the same one level up: it treats the
//! first-order gradients as a function of `(x, gy)`, contracts them with
//! `ggx`, and checks the gradient of that contraction. The first-order
//! gradients are graph nodes, so this exercises the backward of every
//! backward rule.
//!
//! ```ignore
//! let x = CpuTensor::rand((3, 3), DType::F64, &dev)?;
//! let gy = CpuTensor::rand((3, 3), DType::F64, &dev)?;
//! check_gradients(|xs| xs[0].inv(), &[x], &gy, &GradCheckConfig::default())?;
//! ```

use crate::backend::Backend;
use crate::dtype::Tolerance;
use crate::error::{Error, Result};
use crate::tensor::Tensor;

/// Step size and tolerances for a gradient check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradCheckConfig {
    /// Finite-difference step.
    pub eps: f64,
    pub atol: f64,
    pub rtol: f64,
}

impl Default for GradCheckConfig {
    fn default() -> Self {
        GradCheckConfig {
            eps: 1e-3,
            atol: 1e-4,
            rtol: 1e-3,
        }
    }
}

impl GradCheckConfig {
    fn tolerance(&self) -> Tolerance {
        Tolerance::new(self.atol, self.rtol)
    }
}

/// Largest deviation seen by a passing check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradCheckReport {
    pub max_abs_diff: f64,
    pub num_checked: usize,
}

/// Σ a ⊙ b as a host scalar.
fn contract<B: Backend>(a: &Tensor<B>, b: &Tensor<B>) -> Result<f64> {
    let av = a.to_f64_vec()?;
    let bv = b.to_f64_vec()?;
    if av.len() != bv.len() {
        return Err(Error::ShapeMismatch {
            expected: a.shape().clone(),
            got: b.shape().clone(),
        });
    }
    Ok(av.iter().zip(&bv).map(|(x, y)| x * y).sum())
}

/// Fresh leaf copies of `inputs`, with element `which = (input, index)`
/// shifted by `delta`.
fn perturbed<B: Backend>(
    inputs: &[Tensor<B>],
    which: (usize, usize),
    delta: f64,
) -> Result<Vec<Tensor<B>>> {
    inputs
        .iter()
        .enumerate()
        .map(|(i, t)| {
            let mut data = t.to_f64_vec()?;
            if i == which.0 {
                data[which.1] += delta;
            }
            Tensor::from_f64_slice(&data, t.shape().clone(), t.dtype(), t.device())
        })
        .collect()
}

/// Gradient of `root` w.r.t. each of `wrt`, zeros where nothing reached.
fn gradients_of<B: Backend>(
    root: &Tensor<B>,
    seed: &Tensor<B>,
    wrt: &[Tensor<B>],
) -> Result<Vec<Tensor<B>>> {
    let grads = root.backward_with_grad(seed)?;
    wrt.iter()
        .map(|t| match grads.get(t) {
            Some(g) => Ok(g.clone()),
            None => Tensor::zeros_like(t),
        })
        .collect()
}

/// Compare analytic gradients with central differences of the host scalar
/// `loss` over every element of every input.
fn compare<B, L>(
    inputs: &[Tensor<B>],
    analytic: &[Tensor<B>],
    loss: L,
    config: &GradCheckConfig,
    what: &str,
) -> Result<GradCheckReport>
where
    B: Backend,
    L: Fn(&[Tensor<B>]) -> Result<f64>,
{
    let tol = config.tolerance();
    let mut report = GradCheckReport {
        max_abs_diff: 0.0,
        num_checked: 0,
    };
    for (i, (input, grad)) in inputs.iter().zip(analytic).enumerate() {
        if !input.dtype().is_float() {
            continue;
        }
        let expected = grad.to_f64_vec()?;
        for (j, &exp) in expected.iter().enumerate() {
            let plus = loss(&perturbed(inputs, (i, j), config.eps)?)?;
            let minus = loss(&perturbed(inputs, (i, j), -config.eps)?)?;
            let numeric = (plus - minus) / (2.0 * config.eps);
            let diff = (numeric - exp).abs();
            report.max_abs_diff = report.max_abs_diff.max(diff);
            report.num_checked += 1;
            if !tol.allclose(exp, numeric) {
                log::warn!(
                    "{}: input {} element {}: analytic {} numeric {}",
                    what,
                    i,
                    j,
                    exp,
                    numeric
                );
                return Err(Error::msg(format!(
                    "{} mismatch at input {} element {}: analytic {}, numeric {} (atol {}, rtol {})",
                    what, i, j, exp, numeric, config.atol, config.rtol
                )));
            }
        }
    }
    log::debug!(
        "{}: {} elements checked, max |diff| {:e}",
        what,
        report.num_checked,
        report.max_abs_diff
    );
    Ok(report)
}

/// Check first-order gradients of `f` at `inputs` with upstream gradient `gy`.
pub fn check_gradients<B, F>(
    f: F,
    inputs: &[Tensor<B>],
    gy: &Tensor<B>,
    config: &GradCheckConfig,
) -> Result<GradCheckReport>
where
    B: Backend,
    F: Fn(&[Tensor<B>]) -> Result<Tensor<B>>,
{
    let y = f(inputs)?;
    let analytic = gradients_of(&y, gy, inputs)?;
    compare(inputs, &analytic, |xs| contract(&f(xs)?, gy), config, "gradient")
}

/// Check second-order gradients of `f`.
///
/// The checked function is `(x, gy) ↦ Σᵢ ⟨∂L/∂xᵢ, ggxᵢ⟩`, so both the
/// dependence on the inputs and on the upstream gradient are verified.
/// `ggx` holds one tensor per input.
pub fn check_double_gradients<B, F>(
    f: F,
    inputs: &[Tensor<B>],
    gy: &Tensor<B>,
    ggx: &[Tensor<B>],
    config: &GradCheckConfig,
) -> Result<GradCheckReport>
where
    B: Backend,
    F: Fn(&[Tensor<B>]) -> Result<Tensor<B>>,
{
    if ggx.len() != inputs.len() {
        return Err(Error::msg(format!(
            "expected {} second-order seeds, got {}",
            inputs.len(),
            ggx.len()
        )));
    }

    // all = [x..., gy]
    let first_order = |all: &[Tensor<B>]| -> Result<Vec<Tensor<B>>> {
        let (xs, gy) = all.split_at(inputs.len());
        let y = f(xs)?;
        gradients_of(&y, &gy[0], xs)
    };

    let mut all = inputs.to_vec();
    all.push(gy.clone());

    let gxs = first_order(&all)?;
    let mut total: Option<Tensor<B>> = None;
    for (gx, gg) in gxs.iter().zip(ggx) {
        let term = gx.mul(&gg.to_dtype(gx.dtype())?)?.sum_all()?;
        total = Some(match total {
            Some(acc) => acc.add(&term)?,
            None => term,
        });
    }
    let total = match total {
        Some(t) => t,
        None => return Err(Error::msg("check_double_gradients needs at least one input")),
    };
    let seed = Tensor::ones_like(&total)?;
    let analytic = gradients_of(&total, &seed, &all)?;

    compare(
        &all,
        &analytic,
        |xs| {
            let gxs = first_order(xs)?;
            gxs.iter()
                .zip(ggx)
                .map(|(gx, gg)| contract(gx, gg))
                .sum::<Result<f64>>()
        },
        config,
        "double gradient",
    )
}
