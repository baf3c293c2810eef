//! Runtime binding of the cuBLAS multiply primitive.
//!
//! Three call shapes are used: single product, pointer-array batched
//! (explicit device array of per-slot pointers), and strided batched
//! (base pointer plus fixed inter-slot stride). All operands are
//! column-major with natural leading dimensions, so every call is
//! OP_N/OP_N, and every product runs with alpha=1, beta=0.

use std::ffi::c_void;
use std::sync::{Arc, OnceLock};

use libloading::Library;

use crate::device::CudaContext;
use crate::element::{GemmElement, Precision};
use crate::error::{CugemmError, CugemmResult};
use crate::memory::{DeviceBuffer, MemoryManager};

type CublasStatus = i32;
type CublasHandle = *mut c_void;

const CUBLAS_STATUS_SUCCESS: CublasStatus = 0;
const CUBLAS_OP_N: i32 = 0;
const CUBLAS_POINTER_MODE_DEVICE: i32 = 1;

type CublasCreateFn = unsafe extern "C" fn(handle: *mut CublasHandle) -> CublasStatus;
type CublasDestroyFn = unsafe extern "C" fn(handle: CublasHandle) -> CublasStatus;
type CublasSetStreamFn =
    unsafe extern "C" fn(handle: CublasHandle, stream: *mut c_void) -> CublasStatus;
type CublasSetPointerModeFn = unsafe extern "C" fn(handle: CublasHandle, mode: i32) -> CublasStatus;

// The S and D entry points share an ABI modulo the scalar pointee type,
// so one signature with `c_void` scalars serves both precisions.
type GemmFn = unsafe extern "C" fn(
    handle: CublasHandle,
    transa: i32,
    transb: i32,
    m: i32,
    n: i32,
    k: i32,
    alpha: *const c_void,
    a: *const c_void,
    lda: i32,
    b: *const c_void,
    ldb: i32,
    beta: *const c_void,
    c: *mut c_void,
    ldc: i32,
) -> CublasStatus;
type GemmBatchedFn = unsafe extern "C" fn(
    handle: CublasHandle,
    transa: i32,
    transb: i32,
    m: i32,
    n: i32,
    k: i32,
    alpha: *const c_void,
    a_array: *const c_void,
    lda: i32,
    b_array: *const c_void,
    ldb: i32,
    beta: *const c_void,
    c_array: *mut c_void,
    ldc: i32,
    batch_count: i32,
) -> CublasStatus;
type GemmStridedBatchedFn = unsafe extern "C" fn(
    handle: CublasHandle,
    transa: i32,
    transb: i32,
    m: i32,
    n: i32,
    k: i32,
    alpha: *const c_void,
    a: *const c_void,
    lda: i32,
    stride_a: i64,
    b: *const c_void,
    ldb: i32,
    stride_b: i64,
    beta: *const c_void,
    c: *mut c_void,
    ldc: i32,
    stride_c: i64,
    batch_count: i32,
) -> CublasStatus;

struct CublasFns {
    create: CublasCreateFn,
    destroy: CublasDestroyFn,
    set_stream: CublasSetStreamFn,
    set_pointer_mode: CublasSetPointerModeFn,
    sgemm: GemmFn,
    dgemm: GemmFn,
    sgemm_batched: GemmBatchedFn,
    dgemm_batched: GemmBatchedFn,
    sgemm_strided_batched: GemmStridedBatchedFn,
    dgemm_strided_batched: GemmStridedBatchedFn,
}

/// Process-wide cuBLAS symbol table, loaded once.
pub struct CublasApi {
    _lib: Library,
    fns: CublasFns,
}

static CUBLAS_API: OnceLock<Result<Arc<CublasApi>, String>> = OnceLock::new();

fn api() -> CugemmResult<Arc<CublasApi>> {
    let init = CUBLAS_API.get_or_init(|| match CublasApi::load() {
        Ok(api) => Ok(Arc::new(api)),
        Err(err) => Err(err.to_string()),
    });
    match init {
        Ok(api) => Ok(Arc::clone(api)),
        Err(msg) => Err(CugemmError::device("libcublas", msg.clone())),
    }
}

impl CublasApi {
    fn load() -> CugemmResult<Self> {
        let lib = load_cublas_library()?;
        let fns = CublasFns {
            create: load_cublas_symbol(&lib, b"cublasCreate_v2\0")?,
            destroy: load_cublas_symbol(&lib, b"cublasDestroy_v2\0")?,
            set_stream: load_cublas_symbol(&lib, b"cublasSetStream_v2\0")?,
            set_pointer_mode: load_cublas_symbol(&lib, b"cublasSetPointerMode_v2\0")?,
            sgemm: load_cublas_symbol(&lib, b"cublasSgemm_v2\0")?,
            dgemm: load_cublas_symbol(&lib, b"cublasDgemm_v2\0")?,
            sgemm_batched: load_cublas_symbol(&lib, b"cublasSgemmBatched\0")?,
            dgemm_batched: load_cublas_symbol(&lib, b"cublasDgemmBatched\0")?,
            sgemm_strided_batched: load_cublas_symbol(&lib, b"cublasSgemmStridedBatched\0")?,
            dgemm_strided_batched: load_cublas_symbol(&lib, b"cublasDgemmStridedBatched\0")?,
        };
        Ok(Self { _lib: lib, fns })
    }
}

/// Dimensions for one multiply call, derived from operand shapes.
///
/// `a_cols == b_rows` is enforced at construction, before any device
/// allocation can happen for the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shapes {
    pub a_rows: usize,
    pub a_cols: usize,
    pub b_rows: usize,
    pub b_cols: usize,
    pub c_rows: usize,
}

impl Shapes {
    /// Validates the algebraic precondition of `A(a_rows x a_cols) *
    /// B(b_rows x b_cols)` and derives the call dimensions.
    pub fn for_product(
        op: &'static str,
        a_rows: usize,
        a_cols: usize,
        b_rows: usize,
        b_cols: usize,
    ) -> CugemmResult<Self> {
        if a_cols != b_rows {
            return Err(CugemmError::shape(
                op,
                format!("cannot multiply {a_rows}x{a_cols} by {b_rows}x{b_cols}"),
            ));
        }
        Ok(Self {
            a_rows,
            a_cols,
            b_rows,
            b_cols,
            c_rows: a_rows,
        })
    }

    pub fn c_cols(&self) -> usize {
        self.b_cols
    }

    /// Elements in one result slot.
    pub fn c_len(&self) -> usize {
        self.c_rows * self.b_cols
    }

    fn dims_i32(&self) -> CugemmResult<(i32, i32, i32)> {
        Ok((
            dim_i32("m", self.a_rows)?,
            dim_i32("n", self.b_cols)?,
            dim_i32("k", self.a_cols)?,
        ))
    }

    fn leading_dims_i32(&self) -> CugemmResult<(i32, i32, i32)> {
        Ok((
            dim_i32("lda", self.a_rows)?,
            dim_i32("ldb", self.b_rows)?,
            dim_i32("ldc", self.c_rows)?,
        ))
    }
}

/// Element offsets between consecutive batch slots for the strided form.
///
/// A stride of 0 broadcasts a read-only operand across every slot;
/// written operands always carry a stride of at least one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Strides {
    pub st_a: i64,
    pub st_b: i64,
    pub st_c: i64,
}

/// Per-engine cuBLAS handle bound to the engine's stream.
///
/// The scalar coefficients alpha=1 and beta=0 are uploaded once per
/// precision at construction and referenced in device pointer mode, so
/// every multiply is a pure product with no accumulation.
pub struct CublasContext {
    api: Arc<CublasApi>,
    ctx: Arc<CudaContext>,
    handle: usize,
    alpha_f32: DeviceBuffer<f32>,
    beta_f32: DeviceBuffer<f32>,
    alpha_f64: DeviceBuffer<f64>,
    beta_f64: DeviceBuffer<f64>,
}

// SAFETY: The handle is used only through &self methods; the engine
// owning this context is the documented serialization point.
unsafe impl Send for CublasContext {}
unsafe impl Sync for CublasContext {}

impl CublasContext {
    pub fn new(ctx: Arc<CudaContext>, memory: &MemoryManager) -> CugemmResult<Self> {
        let api = api()?;
        ctx.ensure_current()?;

        // Coefficient buffers come first: once cublasCreate_v2 has
        // succeeded there must be nothing fallible left except the
        // handle configuration below, which destroys the handle on
        // failure. The source bytes stay live until the stream is
        // drained; the copies are asynchronous.
        let one_f32 = 1.0f32.to_ne_bytes();
        let zero_f32 = 0.0f32.to_ne_bytes();
        let one_f64 = 1.0f64.to_ne_bytes();
        let zero_f64 = 0.0f64.to_ne_bytes();
        let alpha_f32 = upload_coeff(ctx.as_ref(), memory, &one_f32)?;
        let beta_f32 = upload_coeff(ctx.as_ref(), memory, &zero_f32)?;
        let alpha_f64 = upload_coeff(ctx.as_ref(), memory, &one_f64)?;
        let beta_f64 = upload_coeff(ctx.as_ref(), memory, &zero_f64)?;
        ctx.synchronize()?;

        let mut handle: CublasHandle = std::ptr::null_mut();
        // SAFETY: cublasCreate_v2 initializes the out handle; stream and
        // pointer mode are set on the freshly created handle.
        unsafe {
            check_cublas((api.fns.create)(&mut handle as *mut CublasHandle), "cublasCreate_v2")?;
            if let Err(err) = check_cublas(
                (api.fns.set_stream)(handle, ctx.stream_ptr()),
                "cublasSetStream_v2",
            )
            .and_then(|()| {
                check_cublas(
                    (api.fns.set_pointer_mode)(handle, CUBLAS_POINTER_MODE_DEVICE),
                    "cublasSetPointerMode_v2",
                )
            }) {
                let _ = (api.fns.destroy)(handle);
                return Err(err);
            }
        }

        Ok(Self {
            api,
            ctx,
            handle: handle as usize,
            alpha_f32,
            beta_f32,
            alpha_f64,
            beta_f64,
        })
    }

    fn coeff_ptrs<T: GemmElement>(&self) -> (u64, u64) {
        match T::PRECISION {
            Precision::Single => (self.alpha_f32.device_ptr(), self.beta_f32.device_ptr()),
            Precision::Double => (self.alpha_f64.device_ptr(), self.beta_f64.device_ptr()),
        }
    }

    /// Single product: `C = A * B`.
    pub fn gemm<T: GemmElement>(
        &self,
        shapes: Shapes,
        d_a: u64,
        d_b: u64,
        d_c: u64,
    ) -> CugemmResult<()> {
        let (m, n, k) = shapes.dims_i32()?;
        let (lda, ldb, ldc) = shapes.leading_dims_i32()?;
        let (alpha, beta) = self.coeff_ptrs::<T>();
        let f = match T::PRECISION {
            Precision::Single => self.api.fns.sgemm,
            Precision::Double => self.api.fns.dgemm,
        };

        self.ctx.ensure_current()?;
        // SAFETY: Pointers are valid device addresses for buffers sized
        // according to `shapes`.
        unsafe {
            check_cublas(
                f(
                    self.handle as CublasHandle,
                    CUBLAS_OP_N,
                    CUBLAS_OP_N,
                    m,
                    n,
                    k,
                    alpha as usize as *const c_void,
                    d_a as usize as *const c_void,
                    lda,
                    d_b as usize as *const c_void,
                    ldb,
                    beta as usize as *const c_void,
                    d_c as usize as *mut c_void,
                    ldc,
                ),
                "cublasXgemm",
            )
        }
    }

    /// Pointer-array batched product: `C[i] = A[i] * B[i]` with the
    /// per-slot pointers held in device-resident arrays.
    pub fn gemm_batched<T: GemmElement>(
        &self,
        shapes: Shapes,
        d_a_array: u64,
        d_b_array: u64,
        d_c_array: u64,
        batch: usize,
    ) -> CugemmResult<()> {
        let (m, n, k) = shapes.dims_i32()?;
        let (lda, ldb, ldc) = shapes.leading_dims_i32()?;
        let batch_i32 = dim_i32("batch", batch)?;
        let (alpha, beta) = self.coeff_ptrs::<T>();
        let f = match T::PRECISION {
            Precision::Single => self.api.fns.sgemm_batched,
            Precision::Double => self.api.fns.dgemm_batched,
        };

        self.ctx.ensure_current()?;
        // SAFETY: The three arrays are device-resident arrays of `batch`
        // device pointers, each pointing at a slot sized for `shapes`.
        unsafe {
            check_cublas(
                f(
                    self.handle as CublasHandle,
                    CUBLAS_OP_N,
                    CUBLAS_OP_N,
                    m,
                    n,
                    k,
                    alpha as usize as *const c_void,
                    d_a_array as usize as *const c_void,
                    lda,
                    d_b_array as usize as *const c_void,
                    ldb,
                    beta as usize as *const c_void,
                    d_c_array as usize as *mut c_void,
                    ldc,
                    batch_i32,
                ),
                "cublasXgemmBatched",
            )
        }
    }

    /// Strided batched product: slot `i` of each operand lives at its
    /// base pointer plus `i * stride` elements.
    pub fn gemm_strided_batched<T: GemmElement>(
        &self,
        shapes: Shapes,
        strides: Strides,
        d_a: u64,
        d_b: u64,
        d_c: u64,
        batch: usize,
    ) -> CugemmResult<()> {
        let (m, n, k) = shapes.dims_i32()?;
        let (lda, ldb, ldc) = shapes.leading_dims_i32()?;
        let batch_i32 = dim_i32("batch", batch)?;
        let (alpha, beta) = self.coeff_ptrs::<T>();
        let f = match T::PRECISION {
            Precision::Single => self.api.fns.sgemm_strided_batched,
            Precision::Double => self.api.fns.dgemm_strided_batched,
        };

        self.ctx.ensure_current()?;
        // SAFETY: Base pointers and strides describe valid device regions
        // for `batch` slots sized according to `shapes`.
        unsafe {
            check_cublas(
                f(
                    self.handle as CublasHandle,
                    CUBLAS_OP_N,
                    CUBLAS_OP_N,
                    m,
                    n,
                    k,
                    alpha as usize as *const c_void,
                    d_a as usize as *const c_void,
                    lda,
                    strides.st_a,
                    d_b as usize as *const c_void,
                    ldb,
                    strides.st_b,
                    beta as usize as *const c_void,
                    d_c as usize as *mut c_void,
                    ldc,
                    strides.st_c,
                    batch_i32,
                ),
                "cublasXgemmStridedBatched",
            )
        }
    }
}

impl Drop for CublasContext {
    fn drop(&mut self) {
        if self.handle != 0 {
            let _ = self.ctx.ensure_current();
            // SAFETY: Handle was created once and is destroyed once here.
            let _ = unsafe { (self.api.fns.destroy)(self.handle as CublasHandle) };
            self.handle = 0;
        }
    }
}

fn upload_coeff<T>(
    ctx: &CudaContext,
    memory: &MemoryManager,
    bytes: &[u8],
) -> CugemmResult<DeviceBuffer<T>> {
    debug_assert_eq!(bytes.len(), std::mem::size_of::<T>());
    let buffer = memory.alloc::<T>("cublas coefficients", 1)?;
    ctx.memcpy_htod_async(buffer.device_ptr(), bytes)?;
    Ok(buffer)
}

fn dim_i32(name: &'static str, value: usize) -> CugemmResult<i32> {
    i32::try_from(value)
        .map_err(|_| CugemmError::device("cublas", format!("dimension {name}={value} exceeds i32")))
}

fn load_cublas_library() -> CugemmResult<Library> {
    let candidates = [
        "libcublas.so.12",
        "libcublas.so.11",
        "libcublas.so",
        "cublas64_12.dll",
        "cublas64_11.dll",
    ];

    for candidate in candidates {
        // SAFETY: Dynamic library probe only.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            return Ok(lib);
        }
    }

    Err(CugemmError::device(
        "libcublas",
        "failed to load cuBLAS library (tried libcublas.so.12, libcublas.so.11, libcublas.so, cublas64_12.dll, cublas64_11.dll)",
    ))
}

fn load_cublas_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> CugemmResult<T> {
    // SAFETY: Symbol type is expected to match the cuBLAS API.
    let symbol = unsafe { lib.get::<T>(name) }.map_err(|err| {
        CugemmError::device(
            "libcublas",
            format!(
                "failed to resolve cuBLAS symbol {}: {err}",
                String::from_utf8_lossy(name)
            ),
        )
    })?;
    Ok(*symbol)
}

fn check_cublas(status: CublasStatus, call: &'static str) -> CugemmResult<()> {
    if status == CUBLAS_STATUS_SUCCESS {
        Ok(())
    } else {
        Err(CugemmError::device_status(call, status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_product_derives_result_dimensions() {
        let shapes = Shapes::for_product("dot", 2, 3, 3, 4).unwrap();
        assert_eq!(shapes.c_rows, 2);
        assert_eq!(shapes.c_cols(), 4);
        assert_eq!(shapes.c_len(), 8);
    }

    #[test]
    fn for_product_rejects_inner_dimension_mismatch() {
        let err = Shapes::for_product("dot", 2, 3, 4, 2).unwrap_err();
        assert!(matches!(err, CugemmError::ShapeMismatch { op: "dot", .. }));
    }
}
