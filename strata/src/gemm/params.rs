//! Backend shapes and strides for one matmul dispatch

use super::layout::MatrixDescriptor;

const IDX_2ND_LAST: usize = 1;
const IDX_LAST: usize = 2;

/// `(batch, rows, cols)` shapes and matching element strides for the three
/// operands of a batched matmul.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendMatMulParams {
    pub lhs_dims: [i64; 3],
    pub rhs_dims: [i64; 3],
    pub out_dims: [i64; 3],
    pub lhs_strides: [i64; 3],
    pub rhs_strides: [i64; 3],
    pub out_strides: [i64; 3],
}

impl BackendMatMulParams {
    /// Build shapes and strides from already-normalized descriptors.
    ///
    /// A transposed operand gets the last two entries of both its shape and
    /// its strides swapped, so the backend reads the transpose in place. The
    /// output must not be transposed.
    #[must_use]
    pub fn new(
        batch_size: i64,
        lhs: &MatrixDescriptor,
        rhs: &MatrixDescriptor,
        out: &MatrixDescriptor,
    ) -> Self {
        debug_assert!(!out.is_transposed(), "output descriptor must not be transposed");
        let (lhs_dims, lhs_strides) = operand_dims(batch_size, lhs);
        let (rhs_dims, rhs_strides) = operand_dims(batch_size, rhs);
        let (out_dims, out_strides) = operand_dims(batch_size, out);
        Self {
            lhs_dims,
            rhs_dims,
            out_dims,
            lhs_strides,
            rhs_strides,
            out_strides,
        }
    }
}

fn operand_dims(batch_size: i64, desc: &MatrixDescriptor) -> ([i64; 3], [i64; 3]) {
    let mut dims = [batch_size, desc.num_rows, desc.num_cols];
    let mut strides = [desc.batch_stride, desc.leading_dim_stride, 1];
    if desc.is_transposed() {
        dims.swap(IDX_2ND_LAST, IDX_LAST);
        strides.swap(IDX_2ND_LAST, IDX_LAST);
    }
    (dims, strides)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::gemm::layout::{MatrixLayout, Order};
    use crate::memory::DeviceMemory;

    fn desc(rows: i64, cols: i64, order: Order, batch: i64) -> MatrixDescriptor {
        MatrixDescriptor::new(
            &MatrixLayout::packed(DType::F32, rows, cols, order, batch),
            DeviceMemory::new(64, 1 << 16),
        )
    }

    #[test]
    fn test_row_major_operands_keep_dense_strides() {
        let lhs = desc(2, 3, Order::RowMajor, 4);
        let rhs = desc(3, 5, Order::RowMajor, 4);
        let out = desc(2, 5, Order::RowMajor, 4);
        let params = BackendMatMulParams::new(4, &lhs, &rhs, &out);
        assert_eq!(params.lhs_dims, [4, 2, 3]);
        assert_eq!(params.lhs_strides, [6, 3, 1]);
        assert_eq!(params.rhs_dims, [4, 3, 5]);
        assert_eq!(params.rhs_strides, [15, 5, 1]);
        assert_eq!(params.out_dims, [4, 2, 5]);
        assert_eq!(params.out_strides, [10, 5, 1]);
    }

    #[test]
    fn test_transposed_operand_swaps_inner_dims_and_strides() {
        // 2x3 column-major: element (i, j) lives at j * 2 + i
        let lhs = desc(2, 3, Order::ColumnMajor, 1);
        let rhs = desc(3, 5, Order::RowMajor, 1);
        let out = desc(2, 5, Order::RowMajor, 1);
        let params = BackendMatMulParams::new(1, &lhs, &rhs, &out);
        assert_eq!(params.lhs_dims, [1, 2, 3]);
        assert_eq!(params.lhs_strides, [6, 1, 2]);
        assert_eq!(params.rhs_strides, [15, 5, 1]);
    }

    #[test]
    fn test_padded_leading_dim_is_preserved() {
        let mut layout = MatrixLayout::packed(DType::F16, 4, 4, Order::RowMajor, 2);
        layout.leading_dim_stride = 8;
        layout.batch_stride = 32;
        let padded = MatrixDescriptor::new(&layout, DeviceMemory::new(64, 1 << 10));
        let params = BackendMatMulParams::new(2, &padded, &padded, &padded);
        assert_eq!(params.lhs_strides, [32, 8, 1]);
        assert_eq!(params.out_dims, [2, 4, 4]);
    }
}
