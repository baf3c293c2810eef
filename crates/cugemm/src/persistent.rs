//! Persistent batch buffers for repeated same-shape multiplies.

use crate::batch::PointerTable;
use crate::element::GemmElement;
use crate::engine::{EngineConfig, GemmEngine};
use crate::error::{CugemmError, CugemmResult};
use crate::matrix::{uniform_shape, DenseMatrix};
use crate::memory::DeviceBuffer;

/// An engine that allocates its batch buffers once and reuses them.
///
/// Shapes and the batch count are fixed at construction. Each call to
/// [`tensor_dot_matrix`](Self::tensor_dot_matrix) overwrites the slot
/// contents in place, so a workload of many same-shape batches pays
/// for allocation exactly once. The slots are independent buffers
/// addressed through device-resident pointer tables, which is the form
/// the pointer-array batched multiply consumes.
pub struct PersistentGemmEngine<T: GemmElement> {
    engine: GemmEngine,
    batch_count: usize,
    lhs_shape: (usize, usize),
    rhs_shape: (usize, usize),
    out_shape: (usize, usize),
    a_slots: Vec<DeviceBuffer<T>>,
    b_slots: Vec<DeviceBuffer<T>>,
    c_slots: Vec<DeviceBuffer<T>>,
    a_table: PointerTable<T>,
    b_table: PointerTable<T>,
    c_table: PointerTable<T>,
}

impl<T: GemmElement> PersistentGemmEngine<T> {
    /// Builds an engine with buffers for `batch_count` products of
    /// `lhs_shape` by `rhs_shape`.
    pub fn new(
        config: EngineConfig,
        batch_count: usize,
        lhs_shape: (usize, usize),
        rhs_shape: (usize, usize),
    ) -> CugemmResult<Self> {
        if batch_count == 0 {
            return Err(CugemmError::shape(
                "persistent",
                "batch count must be at least 1",
            ));
        }
        if lhs_shape.1 != rhs_shape.0 {
            return Err(CugemmError::shape(
                "persistent",
                format!(
                    "cannot multiply {}x{} by {}x{}",
                    lhs_shape.0, lhs_shape.1, rhs_shape.0, rhs_shape.1
                ),
            ));
        }
        let out_shape = (lhs_shape.0, rhs_shape.1);

        let engine = GemmEngine::new(config)?;
        let assembler = engine.assembler();
        let a_slots = assembler.alloc_slots::<T>("persistent", lhs_shape.0, lhs_shape.1, batch_count)?;
        let b_slots = assembler.alloc_slots::<T>("persistent", rhs_shape.0, rhs_shape.1, batch_count)?;
        let c_slots = assembler.alloc_slots::<T>("persistent", out_shape.0, out_shape.1, batch_count)?;
        let a_table = assembler.pointer_table("persistent", &a_slots)?;
        let b_table = assembler.pointer_table("persistent", &b_slots)?;
        let c_table = assembler.pointer_table("persistent", &c_slots)?;

        Ok(Self {
            engine,
            batch_count,
            lhs_shape,
            rhs_shape,
            out_shape,
            a_slots,
            b_slots,
            c_slots,
            a_table,
            b_table,
            c_table,
        })
    }

    pub fn batch_count(&self) -> usize {
        self.batch_count
    }

    pub fn engine(&self) -> &GemmEngine {
        &self.engine
    }

    /// Computes `out[i] = tensor[i] * b` into the persistent buffers.
    ///
    /// The tensor must hold exactly `batch_count` matrices of the
    /// construction-time left shape, and `b` must match the right
    /// shape.
    pub fn tensor_dot_matrix(
        &self,
        tensor: &[DenseMatrix<T>],
        b: &DenseMatrix<T>,
    ) -> CugemmResult<Vec<DenseMatrix<T>>> {
        if tensor.len() != self.batch_count {
            return Err(CugemmError::shape(
                "tensor_dot_matrix",
                format!(
                    "tensor holds {} matrices, engine was built for {}",
                    tensor.len(),
                    self.batch_count
                ),
            ));
        }
        let shape = uniform_shape("tensor_dot_matrix", tensor)?;
        if shape != self.lhs_shape {
            return Err(CugemmError::shape(
                "tensor_dot_matrix",
                format!(
                    "tensor slots are {}x{}, engine was built for {}x{}",
                    shape.0, shape.1, self.lhs_shape.0, self.lhs_shape.1
                ),
            ));
        }
        if (b.rows(), b.cols()) != self.rhs_shape {
            return Err(CugemmError::shape(
                "tensor_dot_matrix",
                format!(
                    "right operand is {}x{}, engine was built for {}x{}",
                    b.rows(),
                    b.cols(),
                    self.rhs_shape.0,
                    self.rhs_shape.1
                ),
            ));
        }

        let transfer = self.engine.transfer();
        for (matrix, slot) in tensor.iter().zip(&self.a_slots) {
            transfer.upload_into(matrix, slot)?;
        }
        for slot in &self.b_slots {
            transfer.upload_into(b, slot)?;
        }

        let shapes = crate::blas::Shapes::for_product(
            "tensor_dot_matrix",
            self.lhs_shape.0,
            self.lhs_shape.1,
            self.rhs_shape.0,
            self.rhs_shape.1,
        )?;
        self.engine.blas().gemm_batched::<T>(
            shapes,
            self.a_table.device_ptr(),
            self.b_table.device_ptr(),
            self.c_table.device_ptr(),
            self.batch_count,
        )?;

        let mut out = Vec::with_capacity(self.batch_count);
        for slot in &self.c_slots {
            out.push(transfer.download(slot, self.out_shape.0, self.out_shape.1)?);
        }
        Ok(out)
    }
}
