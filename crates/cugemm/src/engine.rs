//! The synchronous multiply engine.
//!
//! One engine owns one device context, one stream, and one cuBLAS
//! handle. Every operation validates shapes before touching device
//! memory, runs asynchronously on the engine's stream, and returns
//! only after its results are back on the host. Engines hold no
//! internal locks; callers that share an engine across threads
//! serialize access themselves.

use std::sync::Arc;

use crate::batch::BatchAssembler;
use crate::blas::{CublasContext, Shapes, Strides};
use crate::device::{self, CudaContext};
use crate::element::GemmElement;
use crate::error::CugemmResult;
use crate::matrix::{stack, uniform_shape, DenseMatrix};
use crate::memory::MemoryManager;
use crate::transfer::TransferEngine;

/// Engine construction options.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Device ordinal the engine binds to.
    pub device: usize,
    /// Stage host transfers through pinned memory.
    pub pinned: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: 0,
            pinned: false,
        }
    }
}

pub struct GemmEngine {
    ctx: Arc<CudaContext>,
    blas: CublasContext,
    memory: MemoryManager,
    transfer: TransferEngine,
    batch: BatchAssembler,
}

impl GemmEngine {
    pub fn new(config: EngineConfig) -> CugemmResult<Self> {
        let ctx = Arc::new(CudaContext::new(config.device)?);
        let memory = MemoryManager::new(Arc::clone(&ctx));
        let blas = CublasContext::new(Arc::clone(&ctx), &memory)?;
        let transfer = TransferEngine::new(memory.clone(), config.pinned);
        let batch = BatchAssembler::new(memory.clone(), transfer.clone());
        Ok(Self {
            ctx,
            blas,
            memory,
            transfer,
            batch,
        })
    }

    /// True when at least one device can be used.
    pub fn is_available() -> bool {
        device::is_available()
    }

    /// Number of usable devices, 0 when the query fails.
    pub fn device_count() -> usize {
        device::device_count()
    }

    pub fn device_ordinal(&self) -> usize {
        self.ctx.device_ordinal()
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn transfer(&self) -> &TransferEngine {
        &self.transfer
    }

    pub fn assembler(&self) -> &BatchAssembler {
        &self.batch
    }

    pub(crate) fn blas(&self) -> &CublasContext {
        &self.blas
    }

    /// Dense product `C = A * B`.
    pub fn dot<T: GemmElement>(
        &self,
        a: &DenseMatrix<T>,
        b: &DenseMatrix<T>,
    ) -> CugemmResult<DenseMatrix<T>> {
        let shapes = Shapes::for_product("dot", a.rows(), a.cols(), b.rows(), b.cols())?;
        let d_a = self.transfer.upload("dot", a)?;
        let d_b = self.transfer.upload("dot", b)?;
        let d_c = self.memory.alloc::<T>("dot", shapes.c_len())?;
        self.blas
            .gemm::<T>(shapes, d_a.device_ptr(), d_b.device_ptr(), d_c.device_ptr())?;
        self.transfer.download(&d_c, shapes.c_rows, shapes.c_cols())
    }

    /// Batched right multiplication `C[i] = A * tensor[i]`.
    ///
    /// `A` is uploaded once and broadcast across every slot with a
    /// zero stride, so its transfer cost does not grow with the batch.
    pub fn right_matrix_tensor<T: GemmElement>(
        &self,
        a: &DenseMatrix<T>,
        tensor: &[DenseMatrix<T>],
    ) -> CugemmResult<Vec<DenseMatrix<T>>> {
        let (t_rows, t_cols) = uniform_shape("right_matrix_tensor", tensor)?;
        let shapes =
            Shapes::for_product("right_matrix_tensor", a.rows(), a.cols(), t_rows, t_cols)?;

        let d_a = self.transfer.upload("right_matrix_tensor", a)?;
        let d_t = self.batch.assemble("right_matrix_tensor", tensor)?;
        let d_c = self.batch.alloc_batch::<T>(
            "right_matrix_tensor",
            shapes.c_rows,
            shapes.c_cols(),
            d_t.batch(),
        )?;

        let strides = Strides {
            st_a: 0,
            st_b: d_t.stride() as i64,
            st_c: d_c.stride() as i64,
        };
        self.blas.gemm_strided_batched::<T>(
            shapes,
            strides,
            d_a.device_ptr(),
            d_t.device_ptr(),
            d_c.device_ptr(),
            d_t.batch(),
        )?;

        self.download_batch(&d_c, shapes)
    }

    /// Batched right multiplication returned as one stacked matrix of
    /// the per-slot results laid down the rows.
    pub fn matrix_tensor<T: GemmElement>(
        &self,
        a: &DenseMatrix<T>,
        tensor: &[DenseMatrix<T>],
    ) -> CugemmResult<DenseMatrix<T>> {
        let products = self.right_matrix_tensor(a, tensor)?;
        stack(&products)
    }

    /// Batched sandwich product `out[i] = A * tensor[i] * C`.
    ///
    /// The intermediate `A * tensor[i]` stays on the device; only the
    /// final products are copied back.
    pub fn triple_tensor_product<T: GemmElement>(
        &self,
        a: &DenseMatrix<T>,
        c: &DenseMatrix<T>,
        tensor: &[DenseMatrix<T>],
    ) -> CugemmResult<Vec<DenseMatrix<T>>> {
        let (t_rows, t_cols) = uniform_shape("triple_tensor_product", tensor)?;
        let left =
            Shapes::for_product("triple_tensor_product", a.rows(), a.cols(), t_rows, t_cols)?;
        let right = Shapes::for_product(
            "triple_tensor_product",
            left.c_rows,
            left.c_cols(),
            c.rows(),
            c.cols(),
        )?;

        let d_a = self.transfer.upload("triple_tensor_product", a)?;
        let d_c = self.transfer.upload("triple_tensor_product", c)?;
        let d_t = self.batch.assemble("triple_tensor_product", tensor)?;
        let d_mid = self.batch.alloc_batch::<T>(
            "triple_tensor_product",
            left.c_rows,
            left.c_cols(),
            d_t.batch(),
        )?;
        let d_out = self.batch.alloc_batch::<T>(
            "triple_tensor_product",
            right.c_rows,
            right.c_cols(),
            d_t.batch(),
        )?;

        self.blas.gemm_strided_batched::<T>(
            left,
            Strides {
                st_a: 0,
                st_b: d_t.stride() as i64,
                st_c: d_mid.stride() as i64,
            },
            d_a.device_ptr(),
            d_t.device_ptr(),
            d_mid.device_ptr(),
            d_t.batch(),
        )?;
        self.blas.gemm_strided_batched::<T>(
            right,
            Strides {
                st_a: d_mid.stride() as i64,
                st_b: 0,
                st_c: d_out.stride() as i64,
            },
            d_mid.device_ptr(),
            d_c.device_ptr(),
            d_out.device_ptr(),
            d_t.batch(),
        )?;

        self.download_batch(&d_out, right)
    }

    fn download_batch<T: GemmElement>(
        &self,
        batch: &crate::batch::StridedBatch<T>,
        shapes: Shapes,
    ) -> CugemmResult<Vec<DenseMatrix<T>>> {
        let mut out = Vec::with_capacity(batch.batch());
        for i in 0..batch.batch() {
            out.push(self.transfer.download_region(
                batch.buffer(),
                i * batch.stride(),
                shapes.c_rows,
                shapes.c_cols(),
            )?);
        }
        Ok(out)
    }
}
