//! Matrix layouts and the strided descriptors derived from them
//!
//! The backend only understands row-major matrices. A column-major operand
//! is expressed as the transpose of a row-major matrix: an `R x C`
//! column-major layout becomes a `C x R` row-major descriptor flagged as
//! transposed. Nothing is copied; only the interpretation of the strides
//! changes.

use serde::{Deserialize, Serialize};

use crate::dtype::DType;
use crate::memory::DeviceMemory;

/// Storage order of a matrix in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Order {
    RowMajor,
    ColumnMajor,
}

/// Whether a descriptor is read as-is or as its transpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transpose {
    NoTranspose,
    Transpose,
}

impl Transpose {
    #[must_use]
    pub const fn flipped(self) -> Self {
        match self {
            Self::NoTranspose => Self::Transpose,
            Self::Transpose => Self::NoTranspose,
        }
    }
}

/// Abstract layout of one (batched) GEMM operand, as produced by lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixLayout {
    pub dtype: DType,
    pub num_rows: i64,
    pub num_cols: i64,
    pub order: Order,
    /// Elements between consecutive rows (row-major) or columns (column-major)
    pub leading_dim_stride: i64,
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
    /// Elements between consecutive matrices of the batch
    #[serde(default)]
    pub batch_stride: i64,
}

fn default_batch_size() -> i64 {
    1
}

impl MatrixLayout {
    /// Densely packed layout: the leading dimension equals the minor extent
    /// and matrices follow each other without padding.
    #[must_use]
    pub fn packed(
        dtype: DType,
        num_rows: i64,
        num_cols: i64,
        order: Order,
        batch_size: i64,
    ) -> Self {
        let leading_dim_stride = match order {
            Order::RowMajor => num_cols,
            Order::ColumnMajor => num_rows,
        };
        Self {
            dtype,
            num_rows,
            num_cols,
            order,
            leading_dim_stride,
            batch_size,
            batch_stride: num_rows * num_cols,
        }
    }
}

/// Row-major view of an operand plus the transpose flag the backend applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixDescriptor {
    pub data: DeviceMemory,
    pub transpose: Transpose,
    pub num_rows: i64,
    pub num_cols: i64,
    pub batch_stride: i64,
    pub leading_dim_stride: i64,
}

impl MatrixDescriptor {
    /// Derive the backend descriptor for `layout` backed by `data`.
    #[must_use]
    pub fn new(layout: &MatrixLayout, data: DeviceMemory) -> Self {
        let transpose = layout.order == Order::ColumnMajor;
        Self {
            data,
            transpose: if transpose {
                Transpose::Transpose
            } else {
                Transpose::NoTranspose
            },
            num_rows: if transpose {
                layout.num_cols
            } else {
                layout.num_rows
            },
            num_cols: if transpose {
                layout.num_rows
            } else {
                layout.num_cols
            },
            batch_stride: layout.batch_stride,
            leading_dim_stride: layout.leading_dim_stride,
        }
    }

    #[must_use]
    pub fn is_transposed(&self) -> bool {
        self.transpose == Transpose::Transpose
    }

    /// The contraction extent when this descriptor is the lhs of a matmul.
    #[must_use]
    pub fn reduced_dim(&self) -> i64 {
        if self.is_transposed() {
            self.num_rows
        } else {
            self.num_cols
        }
    }

    /// Rows of the matrix the backend actually multiplies.
    #[must_use]
    pub fn logical_rows(&self) -> i64 {
        if self.is_transposed() {
            self.num_cols
        } else {
            self.num_rows
        }
    }

    /// Columns of the matrix the backend actually multiplies.
    #[must_use]
    pub fn logical_cols(&self) -> i64 {
        if self.is_transposed() {
            self.num_rows
        } else {
            self.num_cols
        }
    }

    pub fn flip_transpose(&mut self) {
        self.transpose = self.transpose.flipped();
    }
}

/// Rewrite `(lhs, rhs, output)` so the output is never transposed.
///
/// Uses `Cᵗ = (A·B)ᵗ = Bᵗ·Aᵗ`: when the output is transposed, the operands
/// are swapped and all three transpose flags are flipped. Returns whether
/// the rewrite fired.
pub fn make_gemm_compatible(
    lhs: &mut MatrixDescriptor,
    rhs: &mut MatrixDescriptor,
    output: &mut MatrixDescriptor,
) -> bool {
    if !output.is_transposed() {
        return false;
    }
    std::mem::swap(lhs, rhs);
    lhs.flip_transpose();
    rhs.flip_transpose();
    output.flip_transpose();
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn mem(addr: u64) -> DeviceMemory {
        DeviceMemory::new(addr, 4096)
    }

    #[test]
    fn test_row_major_descriptor() {
        let layout = MatrixLayout::packed(DType::F32, 3, 5, Order::RowMajor, 2);
        let desc = MatrixDescriptor::new(&layout, mem(16));
        assert_eq!(desc.transpose, Transpose::NoTranspose);
        assert_eq!((desc.num_rows, desc.num_cols), (3, 5));
        assert_eq!(desc.leading_dim_stride, 5);
        assert_eq!(desc.batch_stride, 15);
        assert_eq!(desc.reduced_dim(), 5);
    }

    #[test]
    fn test_column_major_is_transposed_row_major() {
        let layout = MatrixLayout::packed(DType::F32, 3, 5, Order::ColumnMajor, 1);
        let desc = MatrixDescriptor::new(&layout, mem(16));
        assert_eq!(desc.transpose, Transpose::Transpose);
        assert_eq!((desc.num_rows, desc.num_cols), (5, 3));
        assert_eq!(desc.leading_dim_stride, 3);
        assert_eq!((desc.logical_rows(), desc.logical_cols()), (3, 5));
        assert_eq!(desc.reduced_dim(), 5);
    }

    #[test]
    fn test_compatible_is_noop_for_row_major_output() {
        let a = MatrixDescriptor::new(
            &MatrixLayout::packed(DType::F32, 2, 3, Order::ColumnMajor, 1),
            mem(16),
        );
        let b = MatrixDescriptor::new(
            &MatrixLayout::packed(DType::F32, 3, 4, Order::RowMajor, 1),
            mem(32),
        );
        let c = MatrixDescriptor::new(
            &MatrixLayout::packed(DType::F32, 2, 4, Order::RowMajor, 1),
            mem(64),
        );
        let (mut lhs, mut rhs, mut out) = (a, b, c);
        assert!(!make_gemm_compatible(&mut lhs, &mut rhs, &mut out));
        assert_eq!((lhs, rhs, out), (a, b, c));
    }

    #[test]
    fn test_compatible_swaps_operands_for_transposed_output() {
        let a = MatrixDescriptor::new(
            &MatrixLayout::packed(DType::F32, 2, 3, Order::RowMajor, 1),
            mem(16),
        );
        let b = MatrixDescriptor::new(
            &MatrixLayout::packed(DType::F32, 3, 4, Order::RowMajor, 1),
            mem(32),
        );
        let c = MatrixDescriptor::new(
            &MatrixLayout::packed(DType::F32, 2, 4, Order::ColumnMajor, 1),
            mem(64),
        );
        let (mut lhs, mut rhs, mut out) = (a, b, c);
        assert!(make_gemm_compatible(&mut lhs, &mut rhs, &mut out));

        assert_eq!(lhs.data, b.data);
        assert_eq!(rhs.data, a.data);
        assert!(lhs.is_transposed());
        assert!(rhs.is_transposed());
        assert!(!out.is_transposed());

        // Bᵗ (4x3) · Aᵗ (3x2) = Cᵗ (4x2)
        assert_eq!((lhs.logical_rows(), lhs.logical_cols()), (4, 3));
        assert_eq!((rhs.logical_rows(), rhs.logical_cols()), (3, 2));
        assert_eq!((out.logical_rows(), out.logical_cols()), (4, 2));
    }

    fn arb_layout() -> impl Strategy<Value = MatrixLayout> {
        (1i64..64, 1i64..64, 1i64..8, any::<bool>()).prop_map(|(rows, cols, batch, col_major)| {
            let order = if col_major {
                Order::ColumnMajor
            } else {
                Order::RowMajor
            };
            MatrixLayout::packed(DType::F32, rows, cols, order, batch)
        })
    }

    proptest! {
        #[test]
        fn prop_reduced_dim_follows_transpose(layout in arb_layout()) {
            let desc = MatrixDescriptor::new(&layout, mem(8));
            if desc.is_transposed() {
                prop_assert_eq!(desc.reduced_dim(), desc.num_rows);
            } else {
                prop_assert_eq!(desc.reduced_dim(), desc.num_cols);
            }
            prop_assert_eq!(desc.is_transposed(), layout.order == Order::ColumnMajor);
            prop_assert_eq!(desc.logical_rows(), layout.num_rows);
            prop_assert_eq!(desc.logical_cols(), layout.num_cols);
        }

        #[test]
        fn prop_compatible_output_never_transposed(
            a in arb_layout(),
            b in arb_layout(),
            c in arb_layout(),
        ) {
            let mut lhs = MatrixDescriptor::new(&a, mem(8));
            let mut rhs = MatrixDescriptor::new(&b, mem(16));
            let mut out = MatrixDescriptor::new(&c, mem(32));
            let was_transposed = out.is_transposed();
            let swapped = make_gemm_compatible(&mut lhs, &mut rhs, &mut out);
            prop_assert_eq!(swapped, was_transposed);
            prop_assert!(!out.is_transposed());
            if swapped {
                prop_assert_eq!(lhs.data, mem(16));
                prop_assert_eq!(rhs.data, mem(8));
            }
        }
    }
}
