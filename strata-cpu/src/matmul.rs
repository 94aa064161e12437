//! Reference matmul primitive
//!
//! Executes `dst = src @ weights` over strided `(batch, rows, cols)` views of
//! host-device memory, then the fused post-ops. Accumulation is always f32;
//! f32 inputs are first rounded to whatever the primitive's fp32 math mode
//! allows, so lowered-precision modes produce the same kind of error a
//! vendor library would. Output rows are parallelized with Rayon on a
//! per-stream thread pool.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use bytemuck::Pod;
use rayon::prelude::*;
use strata::gemm::{MatmulArgs, MatmulBackend, MatmulPrimitive, MatmulPrimitiveDesc, MemoryDesc};
use strata::{DeviceMemory, Error, Fp32MathMode, GemmElementType, PostOp, Result, TensorDType};

use crate::device::HostDevice;
use crate::stream::CpuStream;

/// Matmul backend over one [`HostDevice`].
///
/// Engines (thread pools) are created lazily, one per stream. They are
/// never evicted: an engine lives until the backend is dropped, so a
/// backend shared across many short-lived streams keeps one pool for each.
pub struct CpuMatmulBackend {
    device: HostDevice,
    num_threads: usize,
    engines: RwLock<HashMap<u64, Arc<CpuEngine>>>,
}

struct CpuEngine {
    pool: rayon::ThreadPool,
}

impl CpuMatmulBackend {
    /// Backend whose engines use Rayon's default thread count.
    #[must_use]
    pub fn new(device: HostDevice) -> Self {
        Self::with_threads(device, 0)
    }

    /// Backend whose engines use `num_threads` workers (0 = Rayon default).
    #[must_use]
    pub fn with_threads(device: HostDevice, num_threads: usize) -> Self {
        Self {
            device,
            num_threads,
            engines: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn device(&self) -> &HostDevice {
        &self.device
    }

    /// Number of streams an engine has been created for.
    #[must_use]
    pub fn engine_count(&self) -> usize {
        self.engines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn engine_for(&self, stream: &CpuStream) -> Result<Arc<CpuEngine>> {
        if let Some(engine) = self
            .engines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&stream.id())
        {
            return Ok(Arc::clone(engine));
        }

        let mut engines = self.engines.write().unwrap_or_else(PoisonError::into_inner);
        match engines.entry(stream.id()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let ordinal = self.device.ordinal();
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(self.num_threads)
                    .thread_name(move |i| format!("strata-cpu-{ordinal}-matmul-{i}"))
                    .build()
                    .map_err(|e| Error::Backend(format!("failed to build matmul engine: {e}")))?;
                tracing::debug!(
                    device = ordinal,
                    stream = stream.id(),
                    threads = pool.current_num_threads(),
                    "created matmul engine"
                );
                Ok(Arc::clone(entry.insert(Arc::new(CpuEngine { pool }))))
            }
        }
    }
}

impl MatmulBackend for CpuMatmulBackend {
    type Stream = CpuStream;
    type Primitive = CpuMatmulPrimitive;

    fn create_matmul(
        &self,
        stream: &CpuStream,
        desc: &MatmulPrimitiveDesc,
    ) -> Result<CpuMatmulPrimitive> {
        let src = StridedView::new("src", &desc.src)?;
        let weights = StridedView::new("weights", &desc.weights)?;
        let dst = StridedView::new("dst", &desc.dst)?;

        let [batch, m, k] = src.dims;
        let [w_batch, w_k, n] = weights.dims;
        if w_batch != batch || w_k != k || dst.dims != [batch, m, n] {
            return Err(Error::ShapeMismatch(format!(
                "matmul src {:?} @ weights {:?} cannot produce dst {:?}",
                src.dims, weights.dims, dst.dims
            )));
        }

        Ok(CpuMatmulPrimitive {
            device: self.device.clone(),
            engine: self.engine_for(stream)?,
            kernel: Arc::new(Kernel {
                src,
                weights,
                dst,
                post_ops: desc.attr.post_ops.clone(),
                fpmath_mode: desc.attr.fpmath_mode,
            }),
        })
    }
}

/// A validated matmul bound to an engine.
pub struct CpuMatmulPrimitive {
    device: HostDevice,
    engine: Arc<CpuEngine>,
    kernel: Arc<Kernel>,
}

impl MatmulPrimitive for CpuMatmulPrimitive {
    type Stream = CpuStream;

    /// One f32 accumulator per output element.
    fn scratchpad_size(&self) -> usize {
        self.kernel.dst.dims.iter().product::<usize>() * std::mem::size_of::<f32>()
    }

    fn execute(&self, stream: &CpuStream, args: &MatmulArgs) -> Result<()> {
        let required = self.scratchpad_size();
        if args.scratchpad.size() < required {
            return Err(Error::Backend(format!(
                "scratchpad of {} bytes is smaller than the required {required}",
                args.scratchpad.size()
            )));
        }

        let device = self.device.clone();
        let engine = Arc::clone(&self.engine);
        let kernel = Arc::clone(&self.kernel);
        let args = *args;
        stream.enqueue(move || kernel.run(&device, &engine, &args));
        Ok(())
    }
}

/// Dims and strides of a `(batch, rows, cols)` operand, in elements.
#[derive(Debug, Clone, Copy)]
struct StridedView {
    dims: [usize; 3],
    strides: [usize; 3],
    dtype: GemmElementType,
    /// Bytes from the first to one past the last addressed element
    span_bytes: usize,
}

impl StridedView {
    fn new(name: &str, desc: &MemoryDesc) -> Result<Self> {
        let convert = |values: [i64; 3], what: &str| -> Result<[usize; 3]> {
            let mut out = [0usize; 3];
            for (slot, &v) in out.iter_mut().zip(&values) {
                *slot = usize::try_from(v).map_err(|_| {
                    Error::Backend(format!("{name} has negative {what}: {values:?}"))
                })?;
            }
            Ok(out)
        };
        let dims = convert(desc.dims, "dims")?;
        let strides = convert(desc.strides, "strides")?;
        let span_elements = usize::try_from(desc.span_elements())
            .map_err(|_| Error::Backend(format!("{name} has a negative span")))?;
        Ok(Self {
            dims,
            strides,
            dtype: desc.dtype,
            span_bytes: span_elements * element_size(desc.dtype),
        })
    }

    fn offset(&self, b: usize, row: usize, col: usize) -> usize {
        b * self.strides[0] + row * self.strides[1] + col * self.strides[2]
    }
}

struct Kernel {
    src: StridedView,
    weights: StridedView,
    dst: StridedView,
    post_ops: Vec<PostOp>,
    fpmath_mode: Option<Fp32MathMode>,
}

impl Kernel {
    #[allow(clippy::many_single_char_names)]
    fn run(&self, device: &HostDevice, engine: &CpuEngine, args: &MatmulArgs) -> Result<()> {
        let [batch, m, k] = self.src.dims;
        let n = self.weights.dims[2];
        if batch * m * n == 0 {
            return Ok(());
        }

        let a = self.load(device, &self.src, args.src)?;
        let b = self.load(device, &self.weights, args.weights)?;

        let mut acc = vec![0.0f32; batch * m * n];
        engine.pool.install(|| {
            acc.par_chunks_mut(n).enumerate().for_each(|(r, c_row)| {
                let (bi, row) = (r / m, r % m);
                for (col, c) in c_row.iter_mut().enumerate() {
                    *c = (0..k)
                        .map(|i| {
                            a[self.src.offset(bi, row, i)] * b[self.weights.offset(bi, i, col)]
                        })
                        .sum();
                }
            });
        });
        device.write(args.scratchpad, &acc)?;

        let dst_mem = args.dst.slice(0, self.dst.span_bytes)?;
        let mut dst_bytes = device.read_bytes(dst_mem)?;
        let previous = decode(&dst_bytes, self.dst.dtype);

        for bi in 0..batch {
            for row in 0..m {
                for col in 0..n {
                    let index = self.dst.offset(bi, row, col);
                    let mut value = acc[(bi * m + row) * n + col];
                    for op in &self.post_ops {
                        value = match *op {
                            PostOp::Linear { alpha, beta } => alpha * value + beta,
                            PostOp::Sum { scale } => value + scale * previous[index],
                        };
                    }
                    encode(&mut dst_bytes, self.dst.dtype, index, value);
                }
            }
        }
        device.write_bytes(dst_mem, &dst_bytes)
    }

    fn load(
        &self,
        device: &HostDevice,
        view: &StridedView,
        mem: DeviceMemory,
    ) -> Result<Vec<f32>> {
        let bytes = device.read_bytes(mem.slice(0, view.span_bytes)?)?;
        let mut values = decode(&bytes, view.dtype);
        if view.dtype == GemmElementType::F32 {
            if let Some(mode) = self.fpmath_mode {
                values.iter_mut().for_each(|v| *v = round_for_mode(*v, mode));
            }
        }
        Ok(values)
    }
}

fn element_size(dtype: GemmElementType) -> usize {
    dtype.dtype().size_in_bytes()
}

fn decode(bytes: &[u8], dtype: GemmElementType) -> Vec<f32> {
    fn decode_as<T: TensorDType + Pod>(bytes: &[u8]) -> Vec<f32> {
        bytemuck::pod_collect_to_vec::<u8, T>(bytes)
            .into_iter()
            .map(T::to_f32)
            .collect()
    }
    match dtype {
        GemmElementType::F16 => decode_as::<half::f16>(bytes),
        GemmElementType::BF16 => decode_as::<half::bf16>(bytes),
        GemmElementType::F32 => decode_as::<f32>(bytes),
    }
}

fn encode(bytes: &mut [u8], dtype: GemmElementType, index: usize, value: f32) {
    fn encode_as<T: TensorDType + Pod>(bytes: &mut [u8], index: usize, value: f32) {
        let size = std::mem::size_of::<T>();
        bytes[index * size..(index + 1) * size]
            .copy_from_slice(bytemuck::bytes_of(&T::from_f32(value)));
    }
    match dtype {
        GemmElementType::F16 => encode_as::<half::f16>(bytes, index, value),
        GemmElementType::BF16 => encode_as::<half::bf16>(bytes, index, value),
        GemmElementType::F32 => encode_as::<f32>(bytes, index, value),
    }
}

/// Round an f32 input the way an implicit down-conversion under `mode` would.
fn round_for_mode(value: f32, mode: Fp32MathMode) -> f32 {
    match mode {
        Fp32MathMode::Strict => value,
        Fp32MathMode::Tf32 => round_to_tf32(value),
        Fp32MathMode::Bf16 | Fp32MathMode::Any => half::bf16::from_f32(value).to_f32(),
        Fp32MathMode::F16 => half::f16::from_f32(value).to_f32(),
    }
}

/// Keep 10 mantissa bits, rounding to nearest.
fn round_to_tf32(value: f32) -> f32 {
    if !value.is_finite() {
        return value;
    }
    f32::from_bits(value.to_bits().wrapping_add(0x1000) & !0x1FFF)
}
