//! GEMM dispatch: `output = alpha * (lhs @ rhs) + beta * output`

use std::path::Path;

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use super::backend::{
    MatmulArgs, MatmulBackend, MatmulPrimitive, MatmulPrimitiveDesc, MemoryDesc, PostOp,
    PrimitiveAttr,
};
use super::layout::{make_gemm_compatible, MatrixDescriptor, MatrixLayout};
use super::params::BackendMatMulParams;
use crate::config::{ComputePrecision, Fp32MathMode};
use crate::dtype::{DType, GemmElementType};
use crate::memory::{DeviceMemory, ScratchAllocator};
use crate::{Error, Result};

/// `alpha` and `beta` closer than this to 1 and 0 register no post-op.
pub const POST_OP_TOLERANCE: f32 = 1e-6;

/// Static description of one compiled matrix multiply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GemmConfig {
    pub lhs_layout: MatrixLayout,
    pub rhs_layout: MatrixLayout,
    pub output_layout: MatrixLayout,
    /// Only the real part is used
    #[serde(default = "default_alpha")]
    pub alpha: Complex64,
    #[serde(default)]
    pub beta: f64,
    #[serde(default)]
    pub precision: ComputePrecision,
}

fn default_alpha() -> Complex64 {
    Complex64::new(1.0, 0.0)
}

impl GemmConfig {
    /// Plain product with `alpha = 1`, `beta = 0` and default precision.
    #[must_use]
    pub fn new(
        lhs_layout: MatrixLayout,
        rhs_layout: MatrixLayout,
        output_layout: MatrixLayout,
    ) -> Self {
        Self {
            lhs_layout,
            rhs_layout,
            output_layout,
            alpha: default_alpha(),
            beta: 0.0,
            precision: ComputePrecision::Default,
        }
    }

    /// Parse a config from its JSON form.
    ///
    /// # Errors
    /// Returns an error if the JSON is malformed or missing required fields.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a config from a JSON file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }
}

/// Post-ops implementing `alpha * product + beta * dst`.
///
/// The scale comes first so that it never touches the accumulated term.
#[must_use]
pub fn gemm_post_ops(alpha: f32, beta: f32) -> Vec<PostOp> {
    let mut post_ops = Vec::with_capacity(2);
    if (alpha - 1.0).abs() > POST_OP_TOLERANCE {
        post_ops.push(PostOp::Linear { alpha, beta: 0.0 });
    }
    if beta.abs() > POST_OP_TOLERANCE {
        post_ops.push(PostOp::Sum { scale: beta });
    }
    post_ops
}

/// Check that operand dtypes agree and map the output dtype to an
/// executable element type.
///
/// # Errors
/// `DtypeMismatch` if a floating or complex output disagrees with either
/// input; `UnexpectedDtype` for any output dtype the GEMM path cannot run.
pub fn check_gemm_dtypes(lhs: DType, rhs: DType, output: DType) -> Result<GemmElementType> {
    let checked = output.is_complex()
        || matches!(output, DType::F16 | DType::BF16 | DType::F32 | DType::F64);
    if checked && (lhs != output || rhs != output) {
        return Err(Error::DtypeMismatch { lhs, rhs, output });
    }
    GemmElementType::from_dtype(output).ok_or(Error::UnexpectedDtype(output))
}

fn check_gemm_shapes(
    lhs: &MatrixDescriptor,
    rhs: &MatrixDescriptor,
    output: &MatrixDescriptor,
) -> Result<()> {
    if lhs.reduced_dim() != rhs.logical_rows() {
        return Err(Error::ShapeMismatch(format!(
            "contraction extents differ: lhs has {} columns, rhs has {} rows",
            lhs.reduced_dim(),
            rhs.logical_rows()
        )));
    }
    if output.logical_rows() != lhs.logical_rows() || output.logical_cols() != rhs.logical_cols() {
        return Err(Error::ShapeMismatch(format!(
            "output is {}x{}, product is {}x{}",
            output.logical_rows(),
            output.logical_cols(),
            lhs.logical_rows(),
            rhs.logical_cols()
        )));
    }
    Ok(())
}

/// Run one compiled GEMM on `stream`.
///
/// Operand layouts come from `config`; buffers are the raw device memory
/// for each operand. The computation is enqueued, not awaited.
///
/// # Errors
/// Returns an error on dtype or shape mismatch (before the backend is
/// touched), or when primitive construction, scratch allocation or
/// submission fails. Nothing is retried.
#[allow(clippy::too_many_arguments)]
pub fn run_gemm<B: MatmulBackend>(
    config: &GemmConfig,
    lhs_buffer: DeviceMemory,
    rhs_buffer: DeviceMemory,
    output_buffer: DeviceMemory,
    backend: &B,
    stream: &B::Stream,
    scratch_allocator: &mut dyn ScratchAllocator,
) -> Result<()> {
    let lhs_layout = &config.lhs_layout;
    let rhs_layout = &config.rhs_layout;
    let output_layout = &config.output_layout;

    tracing::debug!(
        batch = output_layout.batch_size,
        m = output_layout.num_rows,
        n = output_layout.num_cols,
        k = lhs_layout.num_cols,
        dtype = %output_layout.dtype,
        "Executing a GEMM"
    );

    let mut lhs = MatrixDescriptor::new(lhs_layout, lhs_buffer);
    let mut rhs = MatrixDescriptor::new(rhs_layout, rhs_buffer);
    let mut output = MatrixDescriptor::new(output_layout, output_buffer);
    if make_gemm_compatible(&mut lhs, &mut rhs, &mut output) {
        tracing::trace!("transposed output: computing C^T = B^T @ A^T");
    }

    let element_type = check_gemm_dtypes(lhs_layout.dtype, rhs_layout.dtype, output_layout.dtype)?;
    check_gemm_shapes(&lhs, &rhs, &output)?;

    #[allow(clippy::cast_possible_truncation)]
    let (alpha, beta) = (config.alpha.re as f32, config.beta as f32);
    let fp32_math_mode = config
        .precision
        .fp32_math_mode(Fp32MathMode::process_default());

    let operands = GemmOperands {
        batch_size: output_layout.batch_size,
        lhs,
        rhs,
        output,
    };
    match element_type {
        GemmElementType::F16 | GemmElementType::BF16 => {
            do_gemm(element_type, &operands, alpha, beta, None, backend, stream, scratch_allocator)
        }
        GemmElementType::F32 => do_gemm(
            element_type,
            &operands,
            alpha,
            beta,
            Some(fp32_math_mode),
            backend,
            stream,
            scratch_allocator,
        ),
    }
}

struct GemmOperands {
    batch_size: i64,
    lhs: MatrixDescriptor,
    rhs: MatrixDescriptor,
    output: MatrixDescriptor,
}

#[allow(clippy::too_many_arguments)]
fn do_gemm<B: MatmulBackend>(
    element_type: GemmElementType,
    operands: &GemmOperands,
    alpha: f32,
    beta: f32,
    fpmath_mode: Option<Fp32MathMode>,
    backend: &B,
    stream: &B::Stream,
    scratch_allocator: &mut dyn ScratchAllocator,
) -> Result<()> {
    let GemmOperands {
        batch_size,
        lhs,
        rhs,
        output,
    } = operands;
    assert!(
        !output.is_transposed(),
        "GEMM output must not be transposed after normalization"
    );

    let params = BackendMatMulParams::new(*batch_size, lhs, rhs, output);
    let desc = MatmulPrimitiveDesc {
        src: MemoryDesc {
            dims: params.lhs_dims,
            strides: params.lhs_strides,
            dtype: element_type,
        },
        weights: MemoryDesc {
            dims: params.rhs_dims,
            strides: params.rhs_strides,
            dtype: element_type,
        },
        dst: MemoryDesc {
            dims: params.out_dims,
            strides: params.out_strides,
            dtype: element_type,
        },
        attr: PrimitiveAttr {
            post_ops: gemm_post_ops(alpha, beta),
            fpmath_mode,
        },
    };

    let primitive = backend.create_matmul(stream, &desc)?;
    let scratchpad = allocate_workspace(scratch_allocator, primitive.scratchpad_size())?;
    primitive.execute(
        stream,
        &MatmulArgs {
            src: lhs.data,
            weights: rhs.data,
            dst: output.data,
            scratchpad,
        },
    )
}

fn allocate_workspace(
    scratch_allocator: &mut dyn ScratchAllocator,
    bytes: usize,
) -> Result<DeviceMemory> {
    let workspace = scratch_allocator.allocate_bytes(bytes)?;
    if workspace.size() < bytes {
        return Err(Error::ScratchAllocation {
            bytes,
            reason: format!("allocator returned only {} bytes", workspace.size()),
        });
    }
    Ok(workspace)
}
