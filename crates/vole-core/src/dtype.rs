use std::fmt;

use crate::error::{Error, Result};

// DType — Supported element types
//
// The set follows what a numerical array library is expected to expose:
// a boolean type, signed integers of every width, one unsigned byte type
// (images, masks) and four floating-point types.
//
//   Bool                  — logical values
//   U8                    — unsigned byte
//   I8 / I16 / I32 / I64  — signed integers
//   F16 / BF16            — half precision, accepted by dot, refused by linalg
//   F32 / F64             — the workhorses

/// Enum of all supported element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Bool,
    U8,
    I8,
    I16,
    I32,
    I64,
    F16,
    BF16,
    F32,
    F64,
}

impl DType {
    /// Every dtype, in promotion order within each kind.
    pub const ALL: [DType; 10] = [
        DType::Bool,
        DType::U8,
        DType::I8,
        DType::I16,
        DType::I32,
        DType::I64,
        DType::F16,
        DType::BF16,
        DType::F32,
        DType::F64,
    ];

    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::Bool | DType::U8 | DType::I8 => 1,
            DType::I16 | DType::F16 | DType::BF16 => 2,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    /// Whether this dtype is a floating-point type (needed for gradient tracking).
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
    }

    /// Whether this is a half-precision type (F16 or BF16).
    pub fn is_half(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16)
    }

    pub fn is_signed_int(&self) -> bool {
        matches!(self, DType::I8 | DType::I16 | DType::I32 | DType::I64)
    }

    // Promotion
    //
    //   a == b                      → a
    //   Bool ⊕ x                    → x
    //   float ⊕ int                 → the float
    //   F16 ⊕ BF16                  → F32 (neither holds the other)
    //   float ⊕ float               → the wider one
    //   signed ⊕ signed             → the wider one
    //   U8 ⊕ signed iN              → max(I16, iN)

    /// Result dtype of a binary routine over operands of dtype `a` and `b`.
    pub fn promote(a: DType, b: DType) -> DType {
        if a == b {
            return a;
        }
        match (a, b) {
            (DType::Bool, other) | (other, DType::Bool) => other,
            (DType::F16, DType::BF16) | (DType::BF16, DType::F16) => DType::F32,
            (x, y) if x.is_float() && y.is_float() => wider(x, y),
            (x, _) if x.is_float() => x,
            (_, y) if y.is_float() => y,
            (DType::U8, s) | (s, DType::U8) => wider(DType::I16, s),
            (x, y) => wider(x, y),
        }
    }

    /// Gate used by `solve`, `inv` and `qr`: only F32/F64 are accepted.
    pub fn ensure_linalg(self, op: &'static str) -> Result<()> {
        match self {
            DType::F32 | DType::F64 => Ok(()),
            dtype => Err(Error::UnsupportedDType { op, dtype }),
        }
    }

    /// Comparison tolerance against a float64 reference for this dtype.
    pub fn tolerance(&self) -> Tolerance {
        match self {
            DType::F64 => Tolerance::new(1e-8, 1e-8),
            DType::F32 => Tolerance::new(1e-4, 1e-4),
            DType::F16 | DType::BF16 => Tolerance::new(1e-2, 1e-2),
            _ => Tolerance::new(0.0, 0.0),
        }
    }
}

fn wider(a: DType, b: DType) -> DType {
    if a.size_in_bytes() >= b.size_in_bytes() {
        a
    } else {
        b
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::Bool => "bool",
            DType::U8 => "u8",
            DType::I8 => "i8",
            DType::I16 => "i16",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
        };
        write!(f, "{}", s)
    }
}

/// Absolute/relative tolerance pair: `|a - b| <= atol + rtol * |b|`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub atol: f64,
    pub rtol: f64,
}

impl Tolerance {
    pub fn new(atol: f64, rtol: f64) -> Self {
        Tolerance { atol, rtol }
    }

    pub fn allclose(&self, actual: f64, expected: f64) -> bool {
        (actual - expected).abs() <= self.atol + self.rtol * expected.abs()
    }
}

// WithDType — Trait that connects Rust types to DType enum

/// Trait implemented by Rust types that can be stored in a tensor.
///
/// Provides the mapping between the concrete Rust type and the DType enum,
/// plus conversions to/from f64 for numeric operations. `bool` has no
/// numeric cast and is handled by the backends directly.
pub trait WithDType: Copy + Send + Sync + 'static + num_traits::NumCast + fmt::Debug {
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    /// Convert this value to f64 (for generic numeric code).
    fn to_f64(self) -> f64;

    /// Create a value of this type from f64 (saturating for integers).
    fn from_f64(v: f64) -> Self;

    fn zero() -> Self {
        Self::from_f64(0.0)
    }

    fn one() -> Self {
        Self::from_f64(1.0)
    }
}

macro_rules! with_dtype_primitive {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(
            impl WithDType for $ty {
                const DTYPE: DType = DType::$dtype;
                fn to_f64(self) -> f64 {
                    self as f64
                }
                fn from_f64(v: f64) -> Self {
                    v as $ty
                }
            }
        )*
    };
}

with_dtype_primitive!(
    u8 => U8,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    f32 => F32,
    f64 => F64,
);

impl WithDType for half::f16 {
    const DTYPE: DType = DType::F16;
    fn to_f64(self) -> f64 {
        self.to_f64()
    }
    fn from_f64(v: f64) -> Self {
        half::f16::from_f64(v)
    }
}

impl WithDType for half::bf16 {
    const DTYPE: DType = DType::BF16;
    fn to_f64(self) -> f64 {
        self.to_f64()
    }
    fn from_f64(v: f64) -> Self {
        half::bf16::from_f64(v)
    }
}
