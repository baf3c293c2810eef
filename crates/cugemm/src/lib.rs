//! Host-side dense and batched matrix multiplication on CUDA devices.
//!
//! The CUDA driver and cuBLAS libraries are resolved at runtime with
//! `libloading`, so the crate builds without any CUDA toolkit
//! installed and degrades gracefully at runtime when no device is
//! present. A [`GemmEngine`] owns one device context, one stream, and
//! one cuBLAS handle; every operation is synchronous to the caller and
//! computes pure products (alpha=1, beta=0) over column-major data.
//!
//! ```no_run
//! use cugemm::{DenseMatrix, EngineConfig, GemmEngine};
//!
//! # fn main() -> Result<(), cugemm::CugemmError> {
//! let engine = GemmEngine::new(EngineConfig::default())?;
//! let a = DenseMatrix::<f32>::from_vec(2, 3, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0])?;
//! let b = DenseMatrix::<f32>::scaled_identity(3, 2.0);
//! let c = engine.dot(&a, &b)?;
//! assert_eq!(c.get(0, 0), 2.0);
//! # Ok(())
//! # }
//! ```

mod batch;
mod blas;
mod device;
mod element;
mod engine;
mod error;
mod matrix;
mod memory;
mod persistent;
mod transfer;

pub use batch::{BatchAssembler, PointerTable, StridedBatch};
pub use blas::{Shapes, Strides};
pub use device::{device_count, is_available, CudaContext};
pub use element::{GemmElement, Precision};
pub use engine::{EngineConfig, GemmEngine};
pub use error::{CugemmError, CugemmResult};
pub use matrix::{stack, uniform_shape, DenseMatrix};
pub use memory::{DeviceBuffer, MemoryManager};
pub use persistent::PersistentGemmEngine;
pub use transfer::TransferEngine;
