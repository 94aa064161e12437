//! Error types for strata

use thiserror::Error;

use crate::dtype::DType;

/// Result type alias using strata's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for GEMM and collective thunks
#[derive(Error, Debug)]
pub enum Error {
    #[error("GEMM lhs type({lhs}) and rhs type({rhs}) must match output type({output})")]
    DtypeMismatch {
        lhs: DType,
        rhs: DType,
        output: DType,
    },

    #[error("Unexpected GEMM dtype: {0}")]
    UnexpectedDtype(DType),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Scratch allocation of {bytes} bytes failed: {reason}")]
    ScratchAllocation { bytes: usize, reason: String },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    #[error("Invalid collective config: {0}")]
    InvalidConfig(String),

    #[error("Collective error: {0}")]
    Collective(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_mismatch_names_all_operands() {
        let err = Error::DtypeMismatch {
            lhs: DType::F16,
            rhs: DType::F32,
            output: DType::F32,
        };
        assert_eq!(
            err.to_string(),
            "GEMM lhs type(f16) and rhs type(f32) must match output type(f32)"
        );
    }

    #[test]
    fn test_unexpected_dtype_message() {
        assert_eq!(
            Error::UnexpectedDtype(DType::C128).to_string(),
            "Unexpected GEMM dtype: c128"
        );
    }
}
