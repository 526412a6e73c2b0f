use std::fmt;
use std::str::FromStr;

use crate::error::Error;

// DType — Element types a Volume can hold
//
// Only floating-point types are carried: every Volume in a training graph
// owns a gradient, and gradients are meaningless for integer data.
//
//   F16  — 16-bit IEEE half float, for mixed-precision training
//   BF16 — 16-bit brain float, for mixed-precision training
//   F32  — 32-bit float, the default workhorse
//   F64  — 64-bit float, for high-precision work and tests

/// Enum of all supported element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F16,
    BF16,
    F32,
    F64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F16 => 2,
            DType::BF16 => 2,
            DType::F32 => 4,
            DType::F64 => 8,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for DType {
    type Err = Error;

    /// Accepts the short names produced by `Display` as well as the
    /// long names used by older weight files ("Float", "Double", "Half").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "f16" | "half" => Ok(DType::F16),
            "bf16" | "bfloat16" => Ok(DType::BF16),
            "f32" | "float" => Ok(DType::F32),
            "f64" | "double" => Ok(DType::F64),
            other => Err(Error::msg(format!("unknown dtype tag: {other}"))),
        }
    }
}

// WithDType — Trait that connects Rust types to DType enum
//
// Backends store elements natively and convert through f64 at the host
// boundary (loading weights, reading values back for inspection).

/// Trait implemented by Rust types that can be stored in a Volume.
pub trait WithDType: Copy + Send + Sync + 'static + num_traits::NumCast + std::fmt::Debug {
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    /// Convert this value to f64 (for generic numeric code).
    fn to_f64(self) -> f64;

    /// Create a value of this type from f64.
    fn from_f64(v: f64) -> Self;
}

impl WithDType for f32 {
    const DTYPE: DType = DType::F32;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl WithDType for f64 {
    const DTYPE: DType = DType::F64;
    fn to_f64(self) -> f64 {
        self
    }
    fn from_f64(v: f64) -> Self {
        v
    }
}

impl WithDType for half::f16 {
    const DTYPE: DType = DType::F16;
    fn to_f64(self) -> f64 {
        self.to_f32() as f64
    }
    fn from_f64(v: f64) -> Self {
        half::f16::from_f64(v)
    }
}

impl WithDType for half::bf16 {
    const DTYPE: DType = DType::BF16;
    fn to_f64(self) -> f64 {
        self.to_f32() as f64
    }
    fn from_f64(v: f64) -> Self {
        half::bf16::from_f64(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_size() {
        assert_eq!(DType::F16.size_in_bytes(), 2);
        assert_eq!(DType::BF16.size_in_bytes(), 2);
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::F64.size_in_bytes(), 8);
    }

    #[test]
    fn test_dtype_parse_long_names() {
        assert_eq!("Float".parse::<DType>().unwrap(), DType::F32);
        assert_eq!("DOUBLE".parse::<DType>().unwrap(), DType::F64);
        assert_eq!("f16".parse::<DType>().unwrap(), DType::F16);
        assert!("int8".parse::<DType>().is_err());
    }

    #[test]
    fn test_dtype_display_parses_back() {
        for d in [DType::F16, DType::BF16, DType::F32, DType::F64] {
            assert_eq!(d.to_string().parse::<DType>().unwrap(), d);
        }
    }

    #[test]
    fn test_with_dtype_f32() {
        assert_eq!(f32::DTYPE, DType::F32);
        assert_eq!(f32::from_f64(3.14).to_f64(), 3.140000104904175);
    }
}
