//! Element types handed over by the lowering stage

use std::fmt;

use serde::{Deserialize, Serialize};

/// Primitive element type of an array operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Pred,
    S4,
    S8,
    S16,
    S32,
    S64,
    U4,
    U8,
    U16,
    U32,
    U64,
    F8E4M3FN,
    F8E5M2,
    /// 16-bit floating point (IEEE 754)
    F16,
    /// Brain floating point (16-bit)
    BF16,
    F32,
    F64,
    /// Complex with two f32 components
    C64,
    /// Complex with two f64 components
    C128,
    /// Ordering token, carries no data
    Token,
}

impl DType {
    /// Size of one element in bytes.
    ///
    /// Sub-byte types report 1 (they are stored unpacked); `Token` reports 0.
    #[must_use]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::Token => 0,
            Self::Pred
            | Self::S4
            | Self::S8
            | Self::U4
            | Self::U8
            | Self::F8E4M3FN
            | Self::F8E5M2 => 1,
            Self::S16 | Self::U16 | Self::F16 | Self::BF16 => 2,
            Self::S32 | Self::U32 | Self::F32 => 4,
            Self::S64 | Self::U64 | Self::F64 | Self::C64 => 8,
            Self::C128 => 16,
        }
    }

    #[must_use]
    pub const fn is_complex(self) -> bool {
        matches!(self, Self::C64 | Self::C128)
    }

    /// Lowercase name, as used in error messages and configs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Pred => "pred",
            Self::S4 => "s4",
            Self::S8 => "s8",
            Self::S16 => "s16",
            Self::S32 => "s32",
            Self::S64 => "s64",
            Self::U4 => "u4",
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::F8E4M3FN => "f8e4m3fn",
            Self::F8E5M2 => "f8e5m2",
            Self::F16 => "f16",
            Self::BF16 => "bf16",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::C64 => "c64",
            Self::C128 => "c128",
            Self::Token => "token",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Element types the GEMM path can execute.
///
/// The dispatcher specialises on this tag instead of on a generic type
/// parameter; every other `DType` is rejected before the backend is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GemmElementType {
    F16,
    BF16,
    F32,
}

impl GemmElementType {
    /// The `DType` this tag stands for.
    #[must_use]
    pub const fn dtype(self) -> DType {
        match self {
            Self::F16 => DType::F16,
            Self::BF16 => DType::BF16,
            Self::F32 => DType::F32,
        }
    }

    /// Map an output dtype onto an executable GEMM element type.
    #[must_use]
    pub const fn from_dtype(dtype: DType) -> Option<Self> {
        match dtype {
            DType::F16 => Some(Self::F16),
            DType::BF16 => Some(Self::BF16),
            DType::F32 => Some(Self::F32),
            _ => None,
        }
    }
}

/// Trait for host scalar types backing a `GemmElementType`.
pub trait TensorDType: Copy + Clone + Default + Send + Sync + 'static {
    /// The corresponding `DType` enum value
    const DTYPE: DType;

    fn to_f32(self) -> f32;

    fn from_f32(value: f32) -> Self;
}

impl TensorDType for f32 {
    const DTYPE: DType = DType::F32;

    fn to_f32(self) -> f32 {
        self
    }

    fn from_f32(value: f32) -> Self {
        value
    }
}

impl TensorDType for half::f16 {
    const DTYPE: DType = DType::F16;

    fn to_f32(self) -> f32 {
        half::f16::to_f32(self)
    }

    fn from_f32(value: f32) -> Self {
        half::f16::from_f32(value)
    }
}

impl TensorDType for half::bf16 {
    const DTYPE: DType = DType::BF16;

    fn to_f32(self) -> f32 {
        half::bf16::to_f32(self)
    }

    fn from_f32(value: f32) -> Self {
        half::bf16::from_f32(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_size_in_bytes() {
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::F16.size_in_bytes(), 2);
        assert_eq!(DType::BF16.size_in_bytes(), 2);
        assert_eq!(DType::C64.size_in_bytes(), 8);
        assert_eq!(DType::C128.size_in_bytes(), 16);
        assert_eq!(DType::Token.size_in_bytes(), 0);
    }

    #[test]
    fn test_dtype_display() {
        assert_eq!(format!("{}", DType::F32), "f32");
        assert_eq!(format!("{}", DType::BF16), "bf16");
        assert_eq!(format!("{}", DType::F8E4M3FN), "f8e4m3fn");
        assert_eq!(format!("{}", DType::C128), "c128");
    }

    #[test]
    fn test_dtype_serde_names_match_display() {
        for dtype in [DType::F16, DType::BF16, DType::S32, DType::C64] {
            let json = serde_json::to_string(&dtype).unwrap();
            assert_eq!(json, format!("\"{dtype}\""));
        }
    }

    #[test]
    fn test_gemm_element_type_from_dtype() {
        assert_eq!(
            GemmElementType::from_dtype(DType::F16),
            Some(GemmElementType::F16)
        );
        assert_eq!(
            GemmElementType::from_dtype(DType::BF16),
            Some(GemmElementType::BF16)
        );
        assert_eq!(
            GemmElementType::from_dtype(DType::F32),
            Some(GemmElementType::F32)
        );
        for dtype in [DType::S32, DType::F64, DType::C64, DType::C128] {
            assert_eq!(GemmElementType::from_dtype(dtype), None);
        }
    }

    #[test]
    fn test_tensor_dtype_trait() {
        assert_eq!(f32::DTYPE, DType::F32);
        assert_eq!(half::f16::DTYPE, DType::F16);
        assert_eq!(half::bf16::DTYPE, DType::BF16);
        assert_eq!(<half::bf16 as TensorDType>::from_f32(1.5).to_f32(), 1.5);
    }
}
