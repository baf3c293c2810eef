//! Assembly of host matrix collections into device-resident batch forms.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::device::CudaContext;
use crate::element::GemmElement;
use crate::error::CugemmResult;
use crate::matrix::{uniform_shape, DenseMatrix};
use crate::memory::{DeviceBuffer, MemoryManager};
use crate::transfer::TransferEngine;

/// A batch stored as one contiguous allocation, slot `i` at element
/// offset `i * stride()`.
pub struct StridedBatch<T: GemmElement> {
    buffer: DeviceBuffer<T>,
    rows: usize,
    cols: usize,
    batch: usize,
}

impl<T: GemmElement> StridedBatch<T> {
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    /// Elements per slot, which is also the inter-slot stride.
    pub fn stride(&self) -> usize {
        self.rows * self.cols
    }

    pub fn device_ptr(&self) -> u64 {
        self.buffer.device_ptr()
    }

    pub fn buffer(&self) -> &DeviceBuffer<T> {
        &self.buffer
    }

    pub fn into_buffer(self) -> DeviceBuffer<T> {
        self.buffer
    }
}

/// Device-resident array of per-slot device pointers, as consumed by
/// the pointer-array batched multiply.
pub struct PointerTable<T: GemmElement> {
    table: DeviceBuffer<u64>,
    batch: usize,
    _elem: PhantomData<T>,
}

impl<T: GemmElement> PointerTable<T> {
    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn device_ptr(&self) -> u64 {
        self.table.device_ptr()
    }
}

/// Builds device batches from host tensors.
///
/// The strided contiguous form is the common case; independent slots
/// plus a pointer table serve callers that keep per-slot buffers alive
/// across many multiplies. Partial failures release every allocation
/// made so far before the error is returned.
#[derive(Clone)]
pub struct BatchAssembler {
    ctx: Arc<CudaContext>,
    memory: MemoryManager,
    transfer: TransferEngine,
}

impl BatchAssembler {
    pub fn new(memory: MemoryManager, transfer: TransferEngine) -> Self {
        Self {
            ctx: Arc::clone(memory.context()),
            memory,
            transfer,
        }
    }

    /// Uploads a uniform tensor into one contiguous strided batch.
    ///
    /// Per-slot copies are issued asynchronously and the stream is
    /// synchronized once at the end.
    pub fn assemble<T: GemmElement>(
        &self,
        op: &'static str,
        tensor: &[DenseMatrix<T>],
    ) -> CugemmResult<StridedBatch<T>> {
        let (rows, cols) = uniform_shape(op, tensor)?;
        let batch = self.alloc_batch::<T>(op, rows, cols, tensor.len())?;
        for (i, matrix) in tensor.iter().enumerate() {
            self.transfer
                .issue_upload(matrix, &batch.buffer, i * batch.stride())?;
        }
        self.ctx.synchronize()?;
        Ok(batch)
    }

    /// Allocates an uninitialized contiguous batch of `batch` slots of
    /// `rows x cols` each.
    pub fn alloc_batch<T: GemmElement>(
        &self,
        op: &'static str,
        rows: usize,
        cols: usize,
        batch: usize,
    ) -> CugemmResult<StridedBatch<T>> {
        let buffer = self.memory.alloc::<T>(op, rows * cols * batch)?;
        Ok(StridedBatch {
            buffer,
            rows,
            cols,
            batch,
        })
    }

    /// Allocates `batch` independent slots of `rows x cols` each.
    ///
    /// If any allocation fails, the slots already allocated are dropped
    /// and freed before the error propagates, leaving device memory as
    /// it was.
    pub fn alloc_slots<T: GemmElement>(
        &self,
        op: &'static str,
        rows: usize,
        cols: usize,
        batch: usize,
    ) -> CugemmResult<Vec<DeviceBuffer<T>>> {
        let mut slots = Vec::with_capacity(batch);
        for _ in 0..batch {
            slots.push(self.memory.alloc::<T>(op, rows * cols)?);
        }
        Ok(slots)
    }

    /// Uploads the device addresses of `slots` into a device-resident
    /// pointer table.
    pub fn pointer_table<T: GemmElement>(
        &self,
        op: &'static str,
        slots: &[DeviceBuffer<T>],
    ) -> CugemmResult<PointerTable<T>> {
        let addrs: Vec<u64> = slots.iter().map(DeviceBuffer::device_ptr).collect();
        let table = self.memory.alloc::<u64>(op, addrs.len())?;
        // SAFETY: Reinterpreting a u64 slice as bytes for the copy.
        let bytes = unsafe {
            std::slice::from_raw_parts(
                addrs.as_ptr().cast::<u8>(),
                addrs.len() * std::mem::size_of::<u64>(),
            )
        };
        self.ctx.memcpy_htod_async(table.device_ptr(), bytes)?;
        self.ctx.synchronize()?;
        Ok(PointerTable {
            table,
            batch: slots.len(),
            _elem: PhantomData,
        })
    }
}
