use std::fmt;

use crate::error::{Error, Result};

// Shape — N-dimensional shape representation
//
//   - Scalar: Shape([])          — 0 dimensions, 1 element
//   - Vector: Shape([5])         — 1 dimension, 5 elements
//   - Matrix: Shape([3, 4])      — 2 dimensions, 12 elements
//   - Batch:  Shape([2, 3, 4])   — 3 dimensions, 24 elements
//   - Empty:  Shape([0, 3])      — legal, 0 elements
//
// Size-0 dimensions are first-class: every routine propagates them.

/// N-dimensional shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions (0 for scalar, 1 for vector, 2 for matrix, etc.).
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements (product of all dimensions).
    /// A scalar shape [] has 1 element, any shape with a 0 dimension has 0.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product::<usize>()
    }

    /// Compute the contiguous (row-major / C-order) strides for this shape.
    ///
    /// For shape [2, 3, 4], strides are [12, 4, 1].
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.rank()];
        if self.rank() > 0 {
            strides[self.rank() - 1] = 1;
            for i in (0..self.rank() - 1).rev() {
                strides[i] = strides[i + 1] * self.0[i + 1];
            }
        }
        strides
    }

    /// Size of a specific dimension.
    pub fn dim(&self, d: usize) -> Result<usize> {
        self.0.get(d).copied().ok_or(Error::DimOutOfRange {
            dim: d,
            rank: self.rank(),
        })
    }

    /// Dims for the trailing-two matrix axes, `(rows, cols)`.
    pub fn matrix_dims(&self) -> Result<(usize, usize)> {
        match self.0.as_slice() {
            [.., r, c] => Ok((*r, *c)),
            _ => Err(Error::RankMismatch {
                expected: 2,
                got: self.rank(),
            }),
        }
    }

    /// Shape with `extra` appended (used to build `batch + (m, n)` shapes).
    pub fn extend(&self, extra: &[usize]) -> Shape {
        let mut dims = self.0.clone();
        dims.extend_from_slice(extra);
        Shape(dims)
    }

    // Broadcasting

    /// Compute the broadcast output shape from two input shapes.
    ///
    /// NumPy-style broadcasting rules:
    ///   1. Align shapes from the right (trailing dimensions).
    ///   2. Dimensions are compatible if they are equal or one of them is 1.
    ///   3. Missing leading dimensions are treated as 1.
    ///
    /// Examples:
    ///   [3, 4] and [4]       → [3, 4]
    ///   [2, 1] and [1, 3]    → [2, 3]
    ///   [5, 3, 1] and [3, 4] → [5, 3, 4]
    ///   [3] and [4]          → Error (3 ≠ 4 and neither is 1)
    pub fn broadcast_shape(lhs: &Shape, rhs: &Shape) -> Result<Shape> {
        let l = lhs.dims();
        let r = rhs.dims();
        let max_rank = l.len().max(r.len());
        let mut result = Vec::with_capacity(max_rank);

        for i in 0..max_rank {
            let ld = if i < l.len() { l[l.len() - 1 - i] } else { 1 };
            let rd = if i < r.len() { r[r.len() - 1 - i] } else { 1 };

            if ld == rd || rd == 1 {
                result.push(ld);
            } else if ld == 1 {
                result.push(rd);
            } else {
                return Err(Error::NotBroadcastable {
                    lhs: lhs.clone(),
                    rhs: rhs.clone(),
                });
            }
        }

        result.reverse();
        Ok(Shape::new(result))
    }

    /// Output shape of `dot(lhs, rhs)`, including the 0-D (scalar product) case.
    pub fn dot_shape(lhs: &Shape, rhs: &Shape) -> Result<Shape> {
        if lhs.rank() == 0 || rhs.rank() == 0 {
            return Shape::broadcast_shape(lhs, rhs);
        }
        Ok(DotShape::resolve(lhs, rhs)?.out)
    }
}

// DotShape — shape resolution for batched matrix multiplication
//
// Operands are promoted to at least 2-D:
//   lhs (k,)  → (1, k)   and the row axis is dropped from the result
//   rhs (k,)  → (k, 1)   and the column axis is dropped from the result
//
// The last two axes are matrix axes, everything before is batch:
//
//   lhs (5, 1, 3, 2) · rhs (4, 2, 6)
//        batch (5, 1) ⊕ (4,) → (5, 4);  m=3 k=2 n=6  → out (5, 4, 3, 6)
//
// Contraction sizes never broadcast; batch axes do.

/// Resolved geometry of a batched `dot` between two operands of rank ≥ 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DotShape {
    /// Broadcast batch shape (may be empty).
    pub batch: Shape,
    pub m: usize,
    pub k: usize,
    pub n: usize,
    /// Lhs was 1-D; its row axis is squeezed from `out`.
    pub lhs_vector: bool,
    /// Rhs was 1-D; its column axis is squeezed from `out`.
    pub rhs_vector: bool,
    pub out: Shape,
}

impl DotShape {
    pub fn resolve(lhs: &Shape, rhs: &Shape) -> Result<DotShape> {
        if lhs.rank() == 0 || rhs.rank() == 0 {
            return Err(Error::RankMismatch {
                expected: 1,
                got: 0,
            });
        }
        let lhs_vector = lhs.rank() == 1;
        let rhs_vector = rhs.rank() == 1;
        let l: Vec<usize> = if lhs_vector {
            vec![1, lhs.dims()[0]]
        } else {
            lhs.dims().to_vec()
        };
        let r: Vec<usize> = if rhs_vector {
            vec![rhs.dims()[0], 1]
        } else {
            rhs.dims().to_vec()
        };

        let (m, k1) = (l[l.len() - 2], l[l.len() - 1]);
        let (k2, n) = (r[r.len() - 2], r[r.len() - 1]);
        if k1 != k2 {
            return Err(Error::DotShapeMismatch {
                lhs: lhs.clone(),
                rhs: rhs.clone(),
                k1,
                k2,
            });
        }

        let lb = Shape::from(&l[..l.len() - 2]);
        let rb = Shape::from(&r[..r.len() - 2]);
        let batch = Shape::broadcast_shape(&lb, &rb).map_err(|_| Error::NotBroadcastable {
            lhs: lhs.clone(),
            rhs: rhs.clone(),
        })?;

        let mut out = batch.dims().to_vec();
        if !lhs_vector {
            out.push(m);
        }
        if !rhs_vector {
            out.push(n);
        }

        Ok(DotShape {
            batch,
            m,
            k: k1,
            n,
            lhs_vector,
            rhs_vector,
            out: Shape::new(out),
        })
    }

    /// Number of independent matrix products.
    pub fn batch_count(&self) -> usize {
        self.batch.elem_count()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

// Convenient From implementations
// These let you write: Shape::from((3, 4)) instead of Shape::new(vec![3, 4])

impl From<()> for Shape {
    /// Scalar shape (0 dimensions).
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize,)> for Shape {
    fn from((d0,): (usize,)) -> Self {
        Shape(vec![d0])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<(usize, usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3, d4): (usize, usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3, d4])
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape(dims.to_vec())
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

impl From<&Shape> for Shape {
    fn from(s: &Shape) -> Self {
        s.clone()
    }
}
