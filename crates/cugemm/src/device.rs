//! Runtime binding of the CUDA driver API.
//!
//! The driver library is loaded once per process and probed by name, so
//! no CUDA toolkit is required at build time. Each engine instance owns
//! its own context and stream on an explicit device ordinal; nothing
//! about device selection is ambient process state.

use std::ffi::c_void;
use std::sync::{Arc, OnceLock};

use libloading::Library;

use crate::error::{CugemmError, CugemmResult};

type CUresult = i32;
type CUdevice = i32;
type CUcontext = *mut c_void;
type CUstream = *mut c_void;
pub(crate) type CUdeviceptr = u64;

const CUDA_SUCCESS: CUresult = 0;

type CuInitFn = unsafe extern "C" fn(flags: u32) -> CUresult;
type CuDeviceGetFn = unsafe extern "C" fn(device: *mut CUdevice, ordinal: i32) -> CUresult;
type CuDeviceGetCountFn = unsafe extern "C" fn(count: *mut i32) -> CUresult;
type CuCtxCreateV2Fn =
    unsafe extern "C" fn(ctx: *mut CUcontext, flags: u32, dev: CUdevice) -> CUresult;
type CuCtxDestroyV2Fn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuCtxSetCurrentFn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuStreamCreateFn = unsafe extern "C" fn(stream: *mut CUstream, flags: u32) -> CUresult;
type CuStreamDestroyV2Fn = unsafe extern "C" fn(stream: CUstream) -> CUresult;
type CuStreamSynchronizeFn = unsafe extern "C" fn(stream: CUstream) -> CUresult;
type CuMemAllocV2Fn = unsafe extern "C" fn(dptr: *mut CUdeviceptr, bytesize: usize) -> CUresult;
type CuMemFreeV2Fn = unsafe extern "C" fn(dptr: CUdeviceptr) -> CUresult;
type CuMemcpyHtoDAsyncV2Fn = unsafe extern "C" fn(
    dst_device: CUdeviceptr,
    src_host: *const c_void,
    byte_count: usize,
    stream: CUstream,
) -> CUresult;
type CuMemcpyDtoHAsyncV2Fn = unsafe extern "C" fn(
    dst_host: *mut c_void,
    src_device: CUdeviceptr,
    byte_count: usize,
    stream: CUstream,
) -> CUresult;
type CuMemGetInfoV2Fn = unsafe extern "C" fn(free: *mut usize, total: *mut usize) -> CUresult;
type CuMemHostAllocFn =
    unsafe extern "C" fn(pp: *mut *mut c_void, bytesize: usize, flags: u32) -> CUresult;
type CuMemFreeHostFn = unsafe extern "C" fn(p: *mut c_void) -> CUresult;

struct DriverFns {
    cu_device_get: CuDeviceGetFn,
    cu_device_get_count: CuDeviceGetCountFn,
    cu_ctx_create_v2: CuCtxCreateV2Fn,
    cu_ctx_destroy_v2: CuCtxDestroyV2Fn,
    cu_ctx_set_current: CuCtxSetCurrentFn,
    cu_stream_create: CuStreamCreateFn,
    cu_stream_destroy_v2: CuStreamDestroyV2Fn,
    cu_stream_synchronize: CuStreamSynchronizeFn,
    cu_mem_alloc_v2: CuMemAllocV2Fn,
    cu_mem_free_v2: CuMemFreeV2Fn,
    cu_memcpy_hto_d_async_v2: CuMemcpyHtoDAsyncV2Fn,
    cu_memcpy_dto_h_async_v2: CuMemcpyDtoHAsyncV2Fn,
    cu_mem_get_info_v2: CuMemGetInfoV2Fn,
    cu_mem_host_alloc: CuMemHostAllocFn,
    cu_mem_free_host: CuMemFreeHostFn,
}

/// Process-wide CUDA driver symbol table, loaded and initialized once.
pub struct CudaApi {
    _lib: Library,
    fns: DriverFns,
}

static CUDA_API: OnceLock<Result<Arc<CudaApi>, String>> = OnceLock::new();

/// Resolves the process-wide driver binding, loading it on first use.
pub(crate) fn api() -> CugemmResult<Arc<CudaApi>> {
    let init = CUDA_API.get_or_init(|| match CudaApi::load() {
        Ok(api) => Ok(Arc::new(api)),
        Err(err) => Err(err.to_string()),
    });
    match init {
        Ok(api) => Ok(Arc::clone(api)),
        Err(msg) => Err(CugemmError::device("libcuda", msg.clone())),
    }
}

/// Whether a CUDA driver and at least one device are present.
pub fn is_available() -> bool {
    device_count() > 0
}

/// Number of available accelerator devices.
///
/// Returns 0 when the driver cannot be loaded or the count query fails:
/// absence of a device is a valid runtime fact, not an error.
pub fn device_count() -> usize {
    let Ok(api) = api() else {
        return 0;
    };
    let mut count: i32 = 0;
    // SAFETY: `count` is a valid out pointer for the query.
    let status = unsafe { (api.fns.cu_device_get_count)(&mut count as *mut i32) };
    if status == CUDA_SUCCESS && count > 0 {
        count as usize
    } else {
        0
    }
}

impl CudaApi {
    fn load() -> CugemmResult<Self> {
        let lib = load_cuda_library()?;
        let fns = DriverFns {
            cu_device_get: load_symbol(&lib, b"cuDeviceGet\0")?,
            cu_device_get_count: load_symbol(&lib, b"cuDeviceGetCount\0")?,
            cu_ctx_create_v2: load_symbol(&lib, b"cuCtxCreate_v2\0")?,
            cu_ctx_destroy_v2: load_symbol(&lib, b"cuCtxDestroy_v2\0")?,
            cu_ctx_set_current: load_symbol(&lib, b"cuCtxSetCurrent\0")?,
            cu_stream_create: load_symbol(&lib, b"cuStreamCreate\0")?,
            cu_stream_destroy_v2: load_symbol(&lib, b"cuStreamDestroy_v2\0")?,
            cu_stream_synchronize: load_symbol(&lib, b"cuStreamSynchronize\0")?,
            cu_mem_alloc_v2: load_symbol(&lib, b"cuMemAlloc_v2\0")?,
            cu_mem_free_v2: load_symbol(&lib, b"cuMemFree_v2\0")?,
            cu_memcpy_hto_d_async_v2: load_symbol(&lib, b"cuMemcpyHtoDAsync_v2\0")?,
            cu_memcpy_dto_h_async_v2: load_symbol(&lib, b"cuMemcpyDtoHAsync_v2\0")?,
            cu_mem_get_info_v2: load_symbol(&lib, b"cuMemGetInfo_v2\0")?,
            cu_mem_host_alloc: load_symbol(&lib, b"cuMemHostAlloc\0")?,
            cu_mem_free_host: load_symbol(&lib, b"cuMemFreeHost\0")?,
        };

        let cu_init: CuInitFn = load_symbol(&lib, b"cuInit\0")?;
        // SAFETY: cuInit takes only a flags word.
        unsafe {
            check_cuda(cu_init(0), "cuInit")?;
        }
        Ok(Self { _lib: lib, fns })
    }
}

/// Per-engine compute context: one device ordinal, one context, one
/// stream, created once and destroyed once.
pub struct CudaContext {
    api: Arc<CudaApi>,
    device: usize,
    // Stored as usize so the context satisfies Send/Sync bounds.
    ctx: usize,
    stream: usize,
}

// SAFETY: The raw handles are opaque driver pointers owned exclusively
// by this context; all uses go through &self methods, and the engine
// holding the context is the documented serialization point.
unsafe impl Send for CudaContext {}
unsafe impl Sync for CudaContext {}

impl CudaContext {
    /// Creates a context and dedicated stream on the given device ordinal.
    pub fn new(device: usize) -> CugemmResult<Self> {
        let api = api()?;
        let ordinal = i32::try_from(device)
            .map_err(|_| CugemmError::device("cuDeviceGet", "device ordinal exceeds i32"))?;

        // SAFETY: Out pointers are valid; handles are checked before use.
        unsafe {
            let mut dev: CUdevice = 0;
            check_cuda(
                (api.fns.cu_device_get)(&mut dev as *mut CUdevice, ordinal),
                "cuDeviceGet",
            )?;

            let mut ctx: CUcontext = std::ptr::null_mut();
            check_cuda(
                (api.fns.cu_ctx_create_v2)(&mut ctx as *mut CUcontext, 0, dev),
                "cuCtxCreate_v2",
            )?;
            check_cuda((api.fns.cu_ctx_set_current)(ctx), "cuCtxSetCurrent")?;

            let mut stream: CUstream = std::ptr::null_mut();
            if let Err(err) = check_cuda(
                (api.fns.cu_stream_create)(&mut stream as *mut CUstream, 0),
                "cuStreamCreate",
            ) {
                let _ = (api.fns.cu_ctx_destroy_v2)(ctx);
                return Err(err);
            }

            Ok(Self {
                api,
                device,
                ctx: ctx as usize,
                stream: stream as usize,
            })
        }
    }

    pub fn device_ordinal(&self) -> usize {
        self.device
    }

    /// Makes this context current on the calling thread.
    pub(crate) fn ensure_current(&self) -> CugemmResult<()> {
        // SAFETY: The context handle remains valid until drop.
        unsafe {
            check_cuda(
                (self.api.fns.cu_ctx_set_current)(self.ctx as CUcontext),
                "cuCtxSetCurrent",
            )
        }
    }

    /// Blocks until all work issued on this context's stream has completed.
    pub(crate) fn synchronize(&self) -> CugemmResult<()> {
        self.ensure_current()?;
        // SAFETY: The stream handle remains valid until drop.
        unsafe {
            check_cuda(
                (self.api.fns.cu_stream_synchronize)(self.stream as CUstream),
                "cuStreamSynchronize",
            )
        }
    }

    pub(crate) fn stream_ptr(&self) -> *mut c_void {
        self.stream as CUstream
    }

    /// Fresh free/total device memory snapshot in bytes.
    pub fn mem_get_info(&self) -> CugemmResult<(usize, usize)> {
        self.ensure_current()?;
        let mut free: usize = 0;
        let mut total: usize = 0;
        // SAFETY: Both out pointers are valid.
        unsafe {
            check_cuda(
                (self.api.fns.cu_mem_get_info_v2)(&mut free as *mut usize, &mut total as *mut usize),
                "cuMemGetInfo_v2",
            )?;
        }
        Ok((free, total))
    }

    pub(crate) fn mem_alloc(&self, bytes: usize) -> CugemmResult<CUdeviceptr> {
        self.ensure_current()?;
        let mut ptr: CUdeviceptr = 0;
        // SAFETY: `ptr` is a valid out pointer for the allocation.
        unsafe {
            check_cuda(
                (self.api.fns.cu_mem_alloc_v2)(&mut ptr as *mut CUdeviceptr, bytes),
                "cuMemAlloc_v2",
            )?;
        }
        Ok(ptr)
    }

    /// Best-effort release; called from buffer destructors.
    pub(crate) fn mem_free(&self, ptr: CUdeviceptr) {
        if self.ensure_current().is_err() {
            return;
        }
        // SAFETY: The pointer was allocated by this context and is freed once.
        let _ = unsafe { (self.api.fns.cu_mem_free_v2)(ptr) };
    }

    /// Issues an async host-to-device copy on this context's stream.
    pub(crate) fn memcpy_htod_async(
        &self,
        dst: CUdeviceptr,
        src: &[u8],
    ) -> CugemmResult<()> {
        if src.is_empty() {
            return Ok(());
        }
        self.ensure_current()?;
        // SAFETY: Destination was sized for at least `src.len()` bytes by
        // the caller; the source slice outlives the synchronizing call
        // that follows every transfer.
        unsafe {
            check_cuda(
                (self.api.fns.cu_memcpy_hto_d_async_v2)(
                    dst,
                    src.as_ptr() as *const c_void,
                    src.len(),
                    self.stream as CUstream,
                ),
                "cuMemcpyHtoDAsync_v2",
            )
        }
    }

    /// Issues an async device-to-host copy on this context's stream.
    pub(crate) fn memcpy_dtoh_async(
        &self,
        dst: &mut [u8],
        src: CUdeviceptr,
    ) -> CugemmResult<()> {
        if dst.is_empty() {
            return Ok(());
        }
        self.ensure_current()?;
        // SAFETY: Source device region covers `dst.len()` bytes; the
        // destination slice outlives the synchronizing call that follows.
        unsafe {
            check_cuda(
                (self.api.fns.cu_memcpy_dto_h_async_v2)(
                    dst.as_mut_ptr() as *mut c_void,
                    src,
                    dst.len(),
                    self.stream as CUstream,
                ),
                "cuMemcpyDtoHAsync_v2",
            )
        }
    }

    /// Allocates page-locked host memory for faster transfer staging.
    pub(crate) fn alloc_pinned(self: &Arc<Self>, bytes: usize) -> CugemmResult<PinnedHostBuffer> {
        self.ensure_current()?;
        let mut ptr: *mut c_void = std::ptr::null_mut();
        // SAFETY: `ptr` is a valid out pointer; flags 0 requests default
        // pinned allocation.
        unsafe {
            check_cuda(
                (self.api.fns.cu_mem_host_alloc)(&mut ptr as *mut *mut c_void, bytes, 0),
                "cuMemHostAlloc",
            )?;
        }
        Ok(PinnedHostBuffer {
            ctx: Arc::clone(self),
            ptr: ptr as usize,
            bytes,
        })
    }
}

impl Drop for CudaContext {
    fn drop(&mut self) {
        // SAFETY: Stream and context are owned by this instance and
        // released exactly once.
        unsafe {
            if self.stream != 0 {
                let _ = (self.api.fns.cu_ctx_set_current)(self.ctx as CUcontext);
                let _ = (self.api.fns.cu_stream_destroy_v2)(self.stream as CUstream);
                self.stream = 0;
            }
            if self.ctx != 0 {
                let _ = (self.api.fns.cu_ctx_destroy_v2)(self.ctx as CUcontext);
                self.ctx = 0;
            }
        }
    }
}

/// Page-locked host staging buffer, freed exactly once on drop.
pub(crate) struct PinnedHostBuffer {
    ctx: Arc<CudaContext>,
    ptr: usize,
    bytes: usize,
}

impl PinnedHostBuffer {
    pub(crate) fn copy_from(&mut self, src: &[u8]) {
        assert!(src.len() <= self.bytes, "staging buffer overflow");
        // SAFETY: The pinned region holds at least `src.len()` bytes and
        // does not overlap the source slice.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr as *mut u8, src.len());
        }
    }

    pub(crate) fn as_slice(&self, len: usize) -> &[u8] {
        assert!(len <= self.bytes, "staging buffer overread");
        // SAFETY: The pinned region holds at least `len` initialized bytes
        // after `copy_from`.
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, len) }
    }
}

impl Drop for PinnedHostBuffer {
    fn drop(&mut self) {
        if self.ctx.ensure_current().is_err() {
            return;
        }
        // SAFETY: The pointer came from cuMemHostAlloc and is freed once.
        let _ = unsafe { (self.ctx.api.fns.cu_mem_free_host)(self.ptr as *mut c_void) };
    }
}

fn load_cuda_library() -> CugemmResult<Library> {
    let candidates = ["libcuda.so.1", "libcuda.so", "nvcuda.dll", "libcuda.dylib"];

    for candidate in candidates {
        // SAFETY: Dynamic library probe only; no symbols are invoked here.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            return Ok(lib);
        }
    }

    Err(CugemmError::device(
        "libcuda",
        "failed to load CUDA driver library (tried libcuda.so.1, libcuda.so, nvcuda.dll, libcuda.dylib)",
    ))
}

fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> CugemmResult<T> {
    // SAFETY: Caller provides the expected symbol type from the CUDA
    // driver API.
    let sym = unsafe { lib.get::<T>(name) }.map_err(|err| {
        CugemmError::device(
            "libcuda",
            format!(
                "failed to resolve CUDA symbol {}: {err}",
                String::from_utf8_lossy(name)
            ),
        )
    })?;
    Ok(*sym)
}

fn check_cuda(code: CUresult, call: &'static str) -> CugemmResult<()> {
    if code == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(CugemmError::device_status(call, code))
    }
}
