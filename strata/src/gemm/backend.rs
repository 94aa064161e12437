//! Numeric-backend seam for the GEMM path
//!
//! The dispatcher describes a matmul as a [`MatmulPrimitiveDesc`] and hands
//! it to a [`MatmulBackend`]. The backend owns everything behind that call:
//! resolving its engine for the stream, building the primitive, reporting a
//! workspace size and enqueueing the computation.

use crate::config::Fp32MathMode;
use crate::dtype::GemmElementType;
use crate::memory::DeviceMemory;
use crate::Result;

/// Shape, strides (in elements) and element type of one operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryDesc {
    pub dims: [i64; 3],
    pub strides: [i64; 3],
    pub dtype: GemmElementType,
}

impl MemoryDesc {
    /// Number of elements between the first and one past the last addressed
    /// element. Zero if any dimension is empty.
    #[must_use]
    pub fn span_elements(&self) -> i64 {
        if self.dims.iter().any(|&d| d <= 0) {
            return 0;
        }
        self.dims
            .iter()
            .zip(&self.strides)
            .map(|(&d, &s)| (d - 1) * s)
            .sum::<i64>()
            + 1
    }
}

/// A transform fused into the matmul epilogue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PostOp {
    /// `dst = alpha * dst + beta`
    Linear { alpha: f32, beta: f32 },
    /// `dst = dst + scale * previous_dst`
    Sum { scale: f32 },
}

/// Attributes attached to a matmul primitive.
///
/// The scratchpad is always user-managed: the dispatcher allocates it and
/// passes it in [`MatmulArgs::scratchpad`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrimitiveAttr {
    /// Applied in order after the product is computed
    pub post_ops: Vec<PostOp>,
    /// Only set for f32 operands
    pub fpmath_mode: Option<Fp32MathMode>,
}

/// Everything a backend needs to build a matmul primitive:
/// `dst = src @ weights`, followed by `attr.post_ops`.
#[derive(Debug, Clone, PartialEq)]
pub struct MatmulPrimitiveDesc {
    pub src: MemoryDesc,
    pub weights: MemoryDesc,
    pub dst: MemoryDesc,
    pub attr: PrimitiveAttr,
}

/// Memory bound to a primitive for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatmulArgs {
    pub src: DeviceMemory,
    pub weights: DeviceMemory,
    pub dst: DeviceMemory,
    pub scratchpad: DeviceMemory,
}

/// A constructed matmul, ready to run.
pub trait MatmulPrimitive {
    type Stream;

    /// Workspace bytes the primitive needs for [`MatmulArgs::scratchpad`].
    fn scratchpad_size(&self) -> usize;

    /// Enqueue the matmul on `stream`. Completion is observed through the
    /// stream, not through this call.
    ///
    /// # Errors
    /// Returns an error if the backend rejects the submission.
    fn execute(&self, stream: &Self::Stream, args: &MatmulArgs) -> Result<()>;
}

/// A vendor math library, as seen by the GEMM dispatcher.
pub trait MatmulBackend {
    type Stream;
    type Primitive: MatmulPrimitive<Stream = Self::Stream>;

    /// Build a primitive for `desc` on the engine bound to `stream`.
    ///
    /// # Errors
    /// Returns an error if the backend cannot construct the primitive.
    fn create_matmul(
        &self,
        stream: &Self::Stream,
        desc: &MatmulPrimitiveDesc,
    ) -> Result<Self::Primitive>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_of_dense_desc() {
        let desc = MemoryDesc {
            dims: [2, 3, 4],
            strides: [12, 4, 1],
            dtype: GemmElementType::F32,
        };
        assert_eq!(desc.span_elements(), 24);
    }

    #[test]
    fn test_span_of_padded_and_transposed_desc() {
        let padded = MemoryDesc {
            dims: [1, 3, 4],
            strides: [0, 8, 1],
            dtype: GemmElementType::F16,
        };
        assert_eq!(padded.span_elements(), 2 * 8 + 3 + 1);

        let transposed = MemoryDesc {
            dims: [1, 4, 3],
            strides: [12, 1, 4],
            dtype: GemmElementType::F16,
        };
        assert_eq!(transposed.span_elements(), 12);
    }

    #[test]
    fn test_span_of_empty_desc() {
        let empty = MemoryDesc {
            dims: [1, 0, 4],
            strides: [0, 4, 1],
            dtype: GemmElementType::BF16,
        };
        assert_eq!(empty.span_elements(), 0);
    }
}
