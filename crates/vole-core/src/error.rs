use crate::dtype::DType;
use crate::shape::Shape;

/// Coarse classification of an [`Error`].
///
/// Callers that only need to decide "was this a shape problem, a dtype
/// problem, a numerical failure or a missing feature?" match on this instead
/// of on the individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Shape, rank or parameter-count incompatibility.
    Dimension,
    /// Unsupported or disallowed dtype.
    Dtype,
    /// The factorization hit a singular (or numerically degenerate) matrix.
    Singular,
    /// A gradient rule that does not exist (feature absent, not a failure).
    NotImplemented,
    /// Operands live on different devices.
    Device,
    /// The backend does not advertise the requested capability.
    Unsupported,
    /// Anything else.
    Other,
}

/// All errors that can occur within vole.
///
/// A single error type across the workspace keeps propagation with `?`
/// trivial; [`Error::kind`] recovers the coarse category.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shape mismatch between two tensors.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Operation requires a specific rank (number of dimensions).
    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// Dimension index out of range for the tensor's rank.
    #[error("dimension out of range: dim {dim} for tensor with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    /// Two shapes cannot be broadcast against each other.
    #[error("shapes {lhs} and {rhs} are not broadcast-compatible")]
    NotBroadcastable { lhs: Shape, rhs: Shape },

    /// Contraction dimensions of a `dot` do not agree.
    #[error("dot shape mismatch: {lhs} . {rhs} contracts {k1} against {k2}")]
    DotShapeMismatch {
        lhs: Shape,
        rhs: Shape,
        k1: usize,
        k2: usize,
    },

    /// A routine that needs a square matrix got something else.
    #[error("{op}: matrix must be square, got shape {shape}")]
    NotSquare { op: &'static str, shape: Shape },

    /// Any other shape/parameter inconsistency (convolution geometry etc).
    #[error("dimension error: {0}")]
    Dimension(String),

    /// Element count mismatch when creating from a vec.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Cannot reshape because element counts differ.
    #[error(
        "cannot reshape: source has {src} elements, target shape {dst_shape} has {dst} elements"
    )]
    ReshapeElementMismatch {
        src: usize,
        dst: usize,
        dst_shape: Shape,
    },

    /// Tried to read a scalar out of a non-scalar tensor.
    #[error("not a scalar: tensor has shape {shape}")]
    NotAScalar { shape: Shape },

    /// DType mismatch between tensors that must agree.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    /// The routine refuses this dtype (e.g. half precision into `solve`).
    #[error("{op} does not support dtype {dtype}")]
    UnsupportedDType { op: &'static str, dtype: DType },

    /// LU/QR factorization found the matrix to be singular.
    #[error("{op}: matrix is singular")]
    SingularMatrix { op: &'static str },

    /// Backward rule is not available for this operation/mode.
    #[error("gradient not implemented: {op}")]
    GradientNotImplemented { op: String },

    /// Operands live on different devices.
    #[error("device mismatch: {lhs} vs {rhs}")]
    DeviceMismatch { lhs: String, rhs: String },

    /// The backend does not advertise the requested capability.
    #[error("{backend} backend does not support {feature}")]
    Unsupported {
        backend: &'static str,
        feature: String,
    },

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Create a dimension error from a message.
    pub fn dim(s: impl Into<String>) -> Self {
        Error::Dimension(s.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ShapeMismatch { .. }
            | Error::RankMismatch { .. }
            | Error::DimOutOfRange { .. }
            | Error::NotBroadcastable { .. }
            | Error::DotShapeMismatch { .. }
            | Error::NotSquare { .. }
            | Error::Dimension(_)
            | Error::ElementCountMismatch { .. }
            | Error::ReshapeElementMismatch { .. }
            | Error::NotAScalar { .. } => ErrorKind::Dimension,
            Error::DTypeMismatch { .. } | Error::UnsupportedDType { .. } => ErrorKind::Dtype,
            Error::SingularMatrix { .. } => ErrorKind::Singular,
            Error::GradientNotImplemented { .. } => ErrorKind::NotImplemented,
            Error::DeviceMismatch { .. } => ErrorKind::Device,
            Error::Unsupported { .. } => ErrorKind::Unsupported,
            Error::Msg(_) => ErrorKind::Other,
        }
    }
}

/// Convenience Result type used throughout vole.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_distinct() {
        let dim = Error::NotSquare {
            op: "inv",
            shape: Shape::from((2, 3)),
        };
        let singular = Error::SingularMatrix { op: "inv" };
        let dtype = Error::UnsupportedDType {
            op: "inv",
            dtype: DType::F16,
        };
        let missing = Error::GradientNotImplemented {
            op: "qr(mode=r)".into(),
        };
        assert_eq!(dim.kind(), ErrorKind::Dimension);
        assert_eq!(singular.kind(), ErrorKind::Singular);
        assert_eq!(dtype.kind(), ErrorKind::Dtype);
        assert_eq!(missing.kind(), ErrorKind::NotImplemented);
    }

    #[test]
    fn test_display() {
        let e = Error::DotShapeMismatch {
            lhs: Shape::from((3, 2)),
            rhs: Shape::from((1, 3)),
            k1: 2,
            k2: 1,
        };
        assert_eq!(
            e.to_string(),
            "dot shape mismatch: [3, 2] . [1, 3] contracts 2 against 1"
        );
    }
}
