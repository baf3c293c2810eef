//! Device memory ownership and the allocation manager.

use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::Arc;

use crate::device::{self, CUdeviceptr, CudaContext};
use crate::error::{CugemmError, CugemmResult};

/// An owning handle to one device allocation of `len` elements of `T`.
///
/// Move-only: there is no `Clone`, so exactly one owner exists and the
/// region is freed exactly once, on drop. The raw address escapes only
/// as a non-owning borrow for the duration of a single vendor call.
pub struct DeviceBuffer<T> {
    ctx: Arc<CudaContext>,
    ptr: CUdeviceptr,
    len: usize,
    _elem: PhantomData<T>,
}

impl<T> DeviceBuffer<T> {
    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the region in bytes.
    pub fn byte_len(&self) -> usize {
        self.len * size_of::<T>()
    }

    /// Raw device address, borrowed for one vendor call.
    pub fn device_ptr(&self) -> u64 {
        self.ptr
    }

    /// Device address of the element at `offset`.
    pub(crate) fn device_ptr_at(&self, offset: usize) -> u64 {
        debug_assert!(offset <= self.len);
        self.ptr + (offset * size_of::<T>()) as u64
    }
}

impl<T> fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

impl<T> Drop for DeviceBuffer<T> {
    fn drop(&mut self) {
        self.ctx.mem_free(self.ptr);
    }
}

/// Allocates device buffers with an advisory free-memory pre-check.
#[derive(Clone)]
pub struct MemoryManager {
    ctx: Arc<CudaContext>,
}

impl MemoryManager {
    pub fn new(ctx: Arc<CudaContext>) -> Self {
        Self { ctx }
    }

    /// Allocates `len` elements of `T` on the device.
    ///
    /// Free memory is queried fresh at call time; a request larger than
    /// the currently free bytes fails without touching the allocator.
    /// The check is advisory, not a reservation; if a concurrent
    /// allocator wins the race, the underlying allocation failure
    /// surfaces as `OutOfDeviceMemory` as well.
    pub fn alloc<T>(&self, op: &'static str, len: usize) -> CugemmResult<DeviceBuffer<T>> {
        let (free_bytes, total_bytes) = self.ctx.mem_get_info()?;
        // An element count whose byte size overflows cannot fit either;
        // report it saturated rather than wrapped past the pre-check.
        let requested_bytes = match len.checked_mul(size_of::<T>()) {
            Some(bytes) => bytes,
            None => {
                return Err(CugemmError::OutOfDeviceMemory {
                    op,
                    requested_bytes: usize::MAX,
                    free_bytes,
                    total_bytes,
                })
            }
        };
        if requested_bytes > free_bytes {
            return Err(CugemmError::OutOfDeviceMemory {
                op,
                requested_bytes,
                free_bytes,
                total_bytes,
            });
        }
        match self.ctx.mem_alloc(requested_bytes) {
            Ok(ptr) => Ok(DeviceBuffer {
                ctx: Arc::clone(&self.ctx),
                ptr,
                len,
                _elem: PhantomData,
            }),
            Err(_) => Err(CugemmError::OutOfDeviceMemory {
                op,
                requested_bytes,
                free_bytes,
                total_bytes,
            }),
        }
    }

    /// Releases a buffer. Consuming the handle makes a second release
    /// unrepresentable.
    pub fn free<T>(&self, buffer: DeviceBuffer<T>) {
        drop(buffer);
    }

    /// Current `(free, total)` device memory in bytes.
    pub fn mem_info(&self) -> CugemmResult<(usize, usize)> {
        self.ctx.mem_get_info()
    }

    /// Number of available accelerator devices; 0 when the query fails.
    pub fn device_count() -> usize {
        device::device_count()
    }

    pub(crate) fn context(&self) -> &Arc<CudaContext> {
        &self.ctx
    }
}
