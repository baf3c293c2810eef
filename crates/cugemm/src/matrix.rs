//! Host-side dense matrices and tensor (batch) helpers.
//!
//! Storage is column-major end-to-end, the order the device multiply
//! primitive expects, so uploads and downloads are straight copies and
//! no transpose flag is ever set on a cuBLAS call.

use std::mem::size_of;

use rand::Rng;

use crate::element::GemmElement;
use crate::error::{CugemmError, CugemmResult};

/// A dense 2D array with a contiguous column-major backing buffer.
///
/// The shape is fixed at construction; `buffer length == rows * cols`
/// always holds. Zero-sized shapes are rejected so no operation can ever
/// request a zero-byte device allocation.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseMatrix<T> {
    rows: usize,
    cols: usize,
    data: Vec<T>,
}

impl<T: GemmElement> DenseMatrix<T> {
    /// Wraps a column-major buffer, validating its length against the shape.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<T>) -> CugemmResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(CugemmError::shape(
                "from_vec",
                format!("matrix shape {rows}x{cols} has a zero dimension"),
            ));
        }
        if data.len() != rows * cols {
            return Err(CugemmError::shape(
                "from_vec",
                format!(
                    "buffer length {} does not match shape {rows}x{cols}",
                    data.len()
                ),
            ));
        }
        Ok(Self { rows, cols, data })
    }

    /// Returns a zero-filled matrix of the requested shape.
    ///
    /// Panics on a zero dimension; use [`from_vec`](Self::from_vec) to
    /// validate untrusted shapes.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        assert!(
            rows > 0 && cols > 0,
            "matrix shape {rows}x{cols} has a zero dimension"
        );
        Self {
            rows,
            cols,
            data: vec![T::zero(); rows * cols],
        }
    }

    /// Returns the identity matrix of order `n`, scaled by `diag`.
    pub fn scaled_identity(n: usize, diag: T) -> Self {
        let mut m = Self::zeros(n, n);
        for i in 0..n {
            m.set(i, i, diag);
        }
        m
    }

    /// Fills a matrix with uniform samples in `[-1, 1)`.
    pub fn random(rows: usize, cols: usize, rng: &mut impl Rng) -> Self {
        let mut m = Self::zeros(rows, cols);
        for v in m.data_mut() {
            *v = T::sample(rng);
        }
        m
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size of the backing buffer in bytes.
    pub fn byte_len(&self) -> usize {
        self.data.len() * size_of::<T>()
    }

    pub fn get(&self, row: usize, col: usize) -> T {
        self.data[col * self.rows + row]
    }

    pub fn set(&mut self, row: usize, col: usize, value: T) {
        self.data[col * self.rows + row] = value;
    }

    /// Borrows the column-major backing buffer.
    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Constructs without re-validating; used for buffers the engine
    /// sized itself.
    pub(crate) fn from_raw(rows: usize, cols: usize, data: Vec<T>) -> Self {
        debug_assert_eq!(data.len(), rows * cols);
        Self { rows, cols, data }
    }
}

/// Validates that a tensor (ordered batch of matrices) is non-empty and
/// shape-uniform, returning the shared `(rows, cols)`.
pub fn uniform_shape<T: GemmElement>(
    op: &'static str,
    tensor: &[DenseMatrix<T>],
) -> CugemmResult<(usize, usize)> {
    let first = tensor
        .first()
        .ok_or_else(|| CugemmError::shape(op, "tensor argument is empty"))?;
    let (rows, cols) = (first.rows(), first.cols());
    for (slot, m) in tensor.iter().enumerate() {
        if m.rows() != rows || m.cols() != cols {
            return Err(CugemmError::shape(
                op,
                format!(
                    "tensor slot {slot} is {}x{}, expected uniform {rows}x{cols}",
                    m.rows(),
                    m.cols()
                ),
            ));
        }
    }
    Ok((rows, cols))
}

/// Stacks a sequence of same-width matrices vertically, row blocks in
/// slot order. Pure host-side; no device interaction.
pub fn stack<T: GemmElement>(tensor: &[DenseMatrix<T>]) -> CugemmResult<DenseMatrix<T>> {
    let first = tensor
        .first()
        .ok_or_else(|| CugemmError::shape("stack", "tensor argument is empty"))?;
    let cols = first.cols();
    let mut total_rows = 0usize;
    for (slot, m) in tensor.iter().enumerate() {
        if m.cols() != cols {
            return Err(CugemmError::shape(
                "stack",
                format!("tensor slot {slot} has {} columns, expected {cols}", m.cols()),
            ));
        }
        total_rows += m.rows();
    }

    let mut data = vec![T::zero(); total_rows * cols];
    let mut row_offset = 0usize;
    for m in tensor {
        for c in 0..cols {
            let src = &m.data()[c * m.rows()..(c + 1) * m.rows()];
            let dst_start = c * total_rows + row_offset;
            data[dst_start..dst_start + m.rows()].copy_from_slice(src);
        }
        row_offset += m.rows();
    }
    Ok(DenseMatrix::from_raw(total_rows, cols, data))
}

/// Views a typed slice as raw bytes for host/device copies.
pub(crate) fn as_byte_slice<T>(data: &[T]) -> &[u8] {
    // SAFETY: Plain-old-data elements reinterpreted byte-wise; length is
    // scaled by the element size.
    unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, std::mem::size_of_val(data)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_major_indexing_matches_buffer_layout() {
        // [[1, 3], [2, 4]] stored column-major as [1, 2, 3, 4].
        let m = DenseMatrix::from_vec(2, 2, vec![1.0f32, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(m.get(0, 0), 1.0);
        assert_eq!(m.get(1, 0), 2.0);
        assert_eq!(m.get(0, 1), 3.0);
        assert_eq!(m.get(1, 1), 4.0);
    }

    #[test]
    fn from_vec_rejects_length_mismatch() {
        let err = DenseMatrix::from_vec(2, 3, vec![0.0f32; 5]).unwrap_err();
        assert!(matches!(err, CugemmError::ShapeMismatch { op: "from_vec", .. }));
    }

    #[test]
    fn from_vec_rejects_zero_dimension() {
        let err = DenseMatrix::<f64>::from_vec(0, 3, Vec::new()).unwrap_err();
        assert!(matches!(err, CugemmError::ShapeMismatch { .. }));
    }

    #[test]
    fn uniform_shape_rejects_ragged_tensor() {
        let tensor = vec![
            DenseMatrix::<f32>::zeros(2, 2),
            DenseMatrix::<f32>::zeros(3, 2),
        ];
        let err = uniform_shape("test", &tensor).unwrap_err();
        assert!(matches!(err, CugemmError::ShapeMismatch { .. }));
    }

    #[test]
    fn uniform_shape_rejects_empty_tensor() {
        let err = uniform_shape::<f32>("test", &[]).unwrap_err();
        assert!(matches!(err, CugemmError::ShapeMismatch { .. }));
    }

    #[test]
    fn stack_concatenates_row_blocks_in_slot_order() {
        let a = DenseMatrix::from_vec(1, 2, vec![1.0f32, 2.0]).unwrap();
        let b = DenseMatrix::from_vec(2, 2, vec![3.0, 4.0, 5.0, 6.0]).unwrap();
        let s = stack(&[a, b]).unwrap();
        assert_eq!(s.rows(), 3);
        assert_eq!(s.cols(), 2);
        // Row 0 comes from the first slot, rows 1-2 from the second.
        assert_eq!(s.get(0, 0), 1.0);
        assert_eq!(s.get(0, 1), 2.0);
        assert_eq!(s.get(1, 0), 3.0);
        assert_eq!(s.get(2, 0), 4.0);
        assert_eq!(s.get(1, 1), 5.0);
        assert_eq!(s.get(2, 1), 6.0);
    }
}
