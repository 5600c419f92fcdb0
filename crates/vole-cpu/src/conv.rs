// N-dimensional convolution kernels (im2col + GEMM)
//
// For one sample, with P = output positions, T = kernel taps and
// Ci·T = patch length:
//
//   im2col   image (Ci, *I)  → col (Ci·T, P)      gather, zero for padding
//   forward  y   (Co, P)     = W (Co, Ci·T) · col
//   data     col             = Wᵀ · gy,  then col2im scatter-adds into
//                              the image (overlapping taps accumulate)
//   weight   gW (Co, Ci·T)  += gy (Co, P) · colᵀ, summed over the batch
//
// The (position, tap) → image offset table is built once per call and
// shared by every sample and channel. Forward and data kernels run one
// rayon task per sample once the work passes `par_threshold()`.

use rayon::prelude::*;

use crate::ops::{self, gemm_into, par_threshold, Elem};
use crate::CpuStorage;
use vole_core::backend::{BackendStorage, ConvGeometry};
use vole_core::error::{Error, Result};
use vole_core::layout::Layout;
use vole_core::shape::Shape;

/// Image offset (within one channel) of every (output position, tap) pair,
/// `None` where the tap falls into padding.
struct Patches {
    table: Vec<Option<usize>>,
    taps: usize,
    positions: usize,
}

/// Row-major multi-index of `flat` in `dims`.
fn unravel(mut flat: usize, dims: &[usize], out: &mut [usize]) {
    for d in (0..dims.len()).rev() {
        out[d] = flat % dims[d];
        flat /= dims[d];
    }
}

impl Patches {
    fn new(geom: &ConvGeometry) -> Self {
        let nd = geom.spatial_rank();
        let taps: usize = geom.kernel.iter().product();
        let positions = geom.col_spatial_len();
        let image_strides = Shape::new(geom.image_dims.clone()).stride_contiguous();

        let mut table = Vec::with_capacity(positions * taps);
        let mut o_idx = vec![0usize; nd];
        let mut t_idx = vec![0usize; nd];
        for o in 0..positions {
            unravel(o, &geom.col_dims, &mut o_idx);
            for t in 0..taps {
                unravel(t, &geom.kernel, &mut t_idx);
                let mut offset = Some(0usize);
                for d in 0..nd {
                    let i = (o_idx[d] * geom.stride[d] + t_idx[d]) as i64 - geom.pad[d] as i64;
                    if i < 0 || i >= geom.image_dims[d] as i64 {
                        offset = None;
                        break;
                    }
                    offset = offset.map(|acc| acc + i as usize * image_strides[d]);
                }
                table.push(offset);
            }
        }
        Patches {
            table,
            taps,
            positions,
        }
    }

    fn im2col<T: Elem>(&self, image: &[T], channels: usize, spatial: usize, col: &mut [T]) {
        let (taps, positions) = (self.taps, self.positions);
        for c in 0..channels {
            let src = &image[c * spatial..(c + 1) * spatial];
            for t in 0..taps {
                let row = &mut col[(c * taps + t) * positions..(c * taps + t + 1) * positions];
                for (o, slot) in row.iter_mut().enumerate() {
                    *slot = match self.table[o * taps + t] {
                        Some(i) => src[i],
                        None => T::zero(),
                    };
                }
            }
        }
    }

    fn col2im<T: Elem>(&self, col: &[T], channels: usize, spatial: usize, image: &mut [T]) {
        let (taps, positions) = (self.taps, self.positions);
        for c in 0..channels {
            let dst = &mut image[c * spatial..(c + 1) * spatial];
            for t in 0..taps {
                let row = &col[(c * taps + t) * positions..(c * taps + t + 1) * positions];
                for (o, &v) in row.iter().enumerate() {
                    if let Some(i) = self.table[o * taps + t] {
                        dst[i] = dst[i].add(v);
                    }
                }
            }
        }
    }
}

fn forward_typed<T: Elem>(x: &[T], w: &[T], geom: &ConvGeometry) -> Vec<T> {
    let patches = Patches::new(geom);
    let (co, kp, p) = (geom.col_channels, geom.patch_len(), patches.positions);
    let (ci, spatial) = (geom.image_channels, geom.image_spatial_len());
    let in_len = ci * spatial;

    let mut out = vec![T::zero(); geom.batch * co * p];
    let body = |(n, y): (usize, &mut [T])| {
        let mut col = vec![T::zero(); kp * p];
        patches.im2col(&x[n * in_len..(n + 1) * in_len], ci, spatial, &mut col);
        gemm_into(
            y,
            false,
            (co, p, kp),
            w,
            (kp as isize, 1),
            &col,
            (p as isize, 1),
            gemm::Parallelism::None,
        );
    };
    if geom.batch > 1 && out.len() * kp >= par_threshold() {
        out.par_chunks_mut(co * p).enumerate().for_each(body);
    } else {
        out.chunks_mut(co * p).enumerate().for_each(body);
    }
    out
}

fn backward_data_typed<T: Elem>(gy: &[T], w: &[T], geom: &ConvGeometry) -> Vec<T> {
    let patches = Patches::new(geom);
    let (co, kp, p) = (geom.col_channels, geom.patch_len(), patches.positions);
    let (ci, spatial) = (geom.image_channels, geom.image_spatial_len());
    let in_len = ci * spatial;

    let mut out = vec![T::zero(); geom.batch * in_len];
    let body = |(n, image): (usize, &mut [T])| {
        let mut col = vec![T::zero(); kp * p];
        // Wᵀ (Ci·T, Co) read through swapped strides
        gemm_into(
            &mut col,
            false,
            (kp, p, co),
            w,
            (1, kp as isize),
            &gy[n * co * p..(n + 1) * co * p],
            (p as isize, 1),
            gemm::Parallelism::None,
        );
        patches.col2im(&col, ci, spatial, image);
    };
    if in_len == 0 {
        return out;
    }
    if geom.batch > 1 && geom.batch * co * p * kp >= par_threshold() {
        out.par_chunks_mut(in_len).enumerate().for_each(body);
    } else {
        out.chunks_mut(in_len).enumerate().for_each(body);
    }
    out
}

fn backward_weight_typed<T: Elem>(x: &[T], gy: &[T], geom: &ConvGeometry) -> Vec<T> {
    let patches = Patches::new(geom);
    let (co, kp, p) = (geom.col_channels, geom.patch_len(), patches.positions);
    let (ci, spatial) = (geom.image_channels, geom.image_spatial_len());
    let in_len = ci * spatial;

    let mut gw = vec![T::zero(); co * kp];
    let mut col = vec![T::zero(); kp * p];
    let par = if geom.batch * co * p * kp >= par_threshold() {
        gemm::Parallelism::Rayon(0)
    } else {
        gemm::Parallelism::None
    };
    for n in 0..geom.batch {
        patches.im2col(&x[n * in_len..(n + 1) * in_len], ci, spatial, &mut col);
        // colᵀ (P, Ci·T) read through swapped strides
        gemm_into(
            &mut gw,
            n > 0,
            (co, kp, p),
            &gy[n * co * p..(n + 1) * co * p],
            (p as isize, 1),
            &col,
            (1, p as isize),
            par,
        );
    }
    gw
}

/// Dispatch a typed kernel on F32/F64, widen half precision to F32, refuse
/// everything else.
macro_rules! float_kernel {
    ($op:literal, $this:ident, $typed:ident, $lhs:expr, $ll:expr, $rhs:expr, $rl:expr, $geom:expr) => {
        match ($lhs, $rhs) {
            (CpuStorage::F32(a), CpuStorage::F32(b)) => Ok(CpuStorage::F32($typed(
                &ops::gather(a, $ll),
                &ops::gather(b, $rl),
                $geom,
            ))),
            (CpuStorage::F64(a), CpuStorage::F64(b)) => Ok(CpuStorage::F64($typed(
                &ops::gather(a, $ll),
                &ops::gather(b, $rl),
                $geom,
            ))),
            (CpuStorage::F16(_), CpuStorage::F16(_))
            | (CpuStorage::BF16(_), CpuStorage::BF16(_)) => {
                ops::widened($lhs, $ll, $rhs, $rl, |a, al, b, bl| $this(a, al, b, bl, $geom))
            }
            (a, b) if a.dtype() != b.dtype() => Err(Error::DTypeMismatch {
                expected: a.dtype(),
                got: b.dtype(),
            }),
            (a, _) => Err(Error::UnsupportedDType {
                op: $op,
                dtype: a.dtype(),
            }),
        }
    };
}

pub fn forward(
    image: &CpuStorage,
    image_layout: &Layout,
    weight: &CpuStorage,
    weight_layout: &Layout,
    geom: &ConvGeometry,
) -> Result<CpuStorage> {
    log::trace!("cpu conv forward: {:?}", geom);
    float_kernel!(
        "conv",
        forward,
        forward_typed,
        image,
        image_layout,
        weight,
        weight_layout,
        geom
    )
}

pub fn backward_data(
    col: &CpuStorage,
    col_layout: &Layout,
    weight: &CpuStorage,
    weight_layout: &Layout,
    geom: &ConvGeometry,
) -> Result<CpuStorage> {
    log::trace!("cpu conv backward data: {:?}", geom);
    float_kernel!(
        "conv_transpose",
        backward_data,
        backward_data_typed,
        col,
        col_layout,
        weight,
        weight_layout,
        geom
    )
}

pub fn backward_weight(
    image: &CpuStorage,
    image_layout: &Layout,
    col: &CpuStorage,
    col_layout: &Layout,
    geom: &ConvGeometry,
) -> Result<CpuStorage> {
    log::trace!("cpu conv backward weight: {:?}", geom);
    float_kernel!(
        "conv",
        backward_weight,
        backward_weight_typed,
        image,
        image_layout,
        col,
        col_layout,
        geom
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(image: &[usize], kernel: &[usize], stride: &[usize], pad: &[usize], col: &[usize]) -> ConvGeometry {
        ConvGeometry {
            batch: 1,
            image_channels: 1,
            col_channels: 1,
            image_dims: image.to_vec(),
            col_dims: col.to_vec(),
            kernel: kernel.to_vec(),
            stride: stride.to_vec(),
            pad: pad.to_vec(),
        }
    }

    #[test]
    fn test_patch_table_padding() {
        // 1-d, in=3, k=2, s=2, p=1 → positions 0, 1 cover image indices (-1, 0), (1, 2)
        let g = geometry(&[3], &[2], &[2], &[1], &[2]);
        let p = Patches::new(&g);
        assert_eq!(p.table, vec![None, Some(0), Some(1), Some(2)]);

        // in=1, k=2, s=2: the covering window's second tap is off the image
        let g = geometry(&[1], &[2], &[2], &[0], &[1]);
        let p = Patches::new(&g);
        assert_eq!(p.table, vec![Some(0), None]);
    }

    #[test]
    fn test_forward_and_adjoint() {
        crate::init_logger();
        // 2-d, 3x3 image, 2x2 kernel, stride 1 → 2x2 output
        let g = geometry(&[3, 3], &[2, 2], &[1, 1], &[0, 0], &[2, 2]);
        let x: Vec<f64> = (1..=9).map(|v| v as f64).collect();
        let w = vec![1.0, 0.0, 0.0, -1.0];
        let y = forward_typed(&x, &w, &g);
        assert_eq!(y, vec![-4.0, -4.0, -4.0, -4.0]);

        // ⟨conv(x), gy⟩ = ⟨x, conv_transposeᵀ(gy)⟩
        let gy = vec![1.0, 2.0, 3.0, 4.0];
        let gx = backward_data_typed(&gy, &w, &g);
        let lhs: f64 = y.iter().zip(&gy).map(|(a, b)| a * b).sum();
        let rhs: f64 = x.iter().zip(&gx).map(|(a, b)| a * b).sum();
        assert!((lhs - rhs).abs() < 1e-12);

        let gw = backward_weight_typed(&x, &gy, &g);
        let rhs: f64 = w.iter().zip(&gw).map(|(a, b)| a * b).sum();
        assert!((lhs - rhs).abs() < 1e-12);
    }

    #[test]
    fn test_integer_kernel_refused() {
        let g = geometry(&[2], &[1], &[1], &[0], &[2]);
        let x = CpuStorage::I32(vec![1, 2]);
        let w = CpuStorage::I32(vec![1]);
        let l = Layout::contiguous(Shape::from((1, 1, 2)));
        let wl = Layout::contiguous(Shape::from((1, 1, 1)));
        assert!(matches!(
            forward(&x, &l, &w, &wl, &g),
            Err(Error::UnsupportedDType { op: "conv", .. })
        ));
    }
}
