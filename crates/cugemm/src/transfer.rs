//! Host/device matrix transfers.
//!
//! Copies are issued asynchronously on the engine's stream and
//! synchronized before returning, so every transfer is synchronous from
//! the caller's point of view. Host matrices are column-major already
//! (the device's expected order), making each copy a straight memcpy.

use std::mem::size_of;
use std::sync::Arc;

use crate::device::CudaContext;
use crate::element::GemmElement;
use crate::error::{CugemmError, CugemmResult};
use crate::matrix::{as_byte_slice, DenseMatrix};
use crate::memory::{DeviceBuffer, MemoryManager};

/// Moves dense matrices between host and device memory.
#[derive(Clone)]
pub struct TransferEngine {
    ctx: Arc<CudaContext>,
    memory: MemoryManager,
    pinned: bool,
}

impl TransferEngine {
    pub fn new(memory: MemoryManager, pinned: bool) -> Self {
        Self {
            ctx: Arc::clone(memory.context()),
            memory,
            pinned,
        }
    }

    /// Allocates a device region for the matrix and copies it up.
    pub fn upload<T: GemmElement>(
        &self,
        op: &'static str,
        matrix: &DenseMatrix<T>,
    ) -> CugemmResult<DeviceBuffer<T>> {
        let buffer = self.memory.alloc::<T>(op, matrix.len())?;
        self.upload_into(matrix, &buffer)?;
        Ok(buffer)
    }

    /// Copies a matrix into an existing device buffer of matching size.
    pub fn upload_into<T: GemmElement>(
        &self,
        matrix: &DenseMatrix<T>,
        buffer: &DeviceBuffer<T>,
    ) -> CugemmResult<()> {
        if matrix.len() != buffer.len() {
            return Err(CugemmError::shape(
                "upload",
                format!(
                    "matrix of {} elements does not fit device buffer of {}",
                    matrix.len(),
                    buffer.len()
                ),
            ));
        }
        self.issue_upload(matrix, buffer, 0)?;
        self.ctx.synchronize()
    }

    /// Issues the copy for one batch slot at `elem_offset` without
    /// synchronizing; the assembler synchronizes once per batch.
    pub(crate) fn issue_upload<T: GemmElement>(
        &self,
        matrix: &DenseMatrix<T>,
        buffer: &DeviceBuffer<T>,
        elem_offset: usize,
    ) -> CugemmResult<()> {
        debug_assert!(elem_offset + matrix.len() <= buffer.len());
        let bytes = as_byte_slice(matrix.data());
        let dst = buffer.device_ptr_at(elem_offset);
        if self.pinned {
            let mut staging = self.ctx.alloc_pinned(bytes.len())?;
            staging.copy_from(bytes);
            self.ctx.memcpy_htod_async(dst, staging.as_slice(bytes.len()))?;
            // The staging buffer is freed on return; the copy must have
            // left it by then.
            self.ctx.synchronize()
        } else {
            self.ctx.memcpy_htod_async(dst, bytes)
        }
    }

    /// Copies a device region back into a newly allocated host matrix.
    pub fn download<T: GemmElement>(
        &self,
        buffer: &DeviceBuffer<T>,
        rows: usize,
        cols: usize,
    ) -> CugemmResult<DenseMatrix<T>> {
        if rows * cols != buffer.len() {
            return Err(CugemmError::shape(
                "download",
                format!(
                    "requested shape {rows}x{cols} does not match device buffer of {} elements",
                    buffer.len()
                ),
            ));
        }
        self.download_region(buffer, 0, rows, cols)
    }

    /// Copies one `rows x cols` slot starting at `elem_offset` back to
    /// the host.
    pub(crate) fn download_region<T: GemmElement>(
        &self,
        buffer: &DeviceBuffer<T>,
        elem_offset: usize,
        rows: usize,
        cols: usize,
    ) -> CugemmResult<DenseMatrix<T>> {
        let len = rows * cols;
        debug_assert!(elem_offset + len <= buffer.len());
        let mut data = vec![T::zero(); len];
        {
            // SAFETY: Plain-old-data elements viewed byte-wise for the copy.
            let dst = unsafe {
                std::slice::from_raw_parts_mut(data.as_mut_ptr() as *mut u8, len * size_of::<T>())
            };
            self.ctx
                .memcpy_dtoh_async(dst, buffer.device_ptr_at(elem_offset))?;
            self.ctx.synchronize()?;
        }
        Ok(DenseMatrix::from_raw(rows, cols, data))
    }
}
