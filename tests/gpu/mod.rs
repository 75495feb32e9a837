//! CUDA device tests for flashbench-rs.
//!
//! Kernels run on host buffers; these tests check that tensors resident on a
//! CUDA device are staged correctly and that results come back on the
//! caller's device and dtype. Tests are skipped if:
//!
//! 1. The `cuda` feature is not enabled
//! 2. No CUDA-capable GPU is available
//!
//! ## Running GPU Tests
//!
//! ```bash
//! cargo test --features cuda --test integration gpu
//! ```

/// Check if a CUDA GPU is available for testing.
#[cfg(feature = "cuda")]
pub fn cuda_device() -> Option<candle_core::Device> {
    match candle_core::Device::new_cuda(0) {
        Ok(device) => match candle_core::Tensor::ones((2, 2), candle_core::DType::F32, &device)
            .and_then(|t| t.sum_all())
        {
            Ok(_) => Some(device),
            Err(e) => {
                tracing::warn!("GPU detected but tensor operations failed: {}", e);
                None
            }
        },
        Err(e) => {
            tracing::warn!("No CUDA GPU available: {}", e);
            None
        }
    }
}

#[cfg(not(feature = "cuda"))]
pub fn cuda_device() -> Option<candle_core::Device> {
    None
}

/// Bind a CUDA device or skip the test.
///
/// This macro works with `Result<(), _>` return types by returning `Ok(())`.
#[macro_export]
macro_rules! require_gpu {
    () => {
        match $crate::gpu::cuda_device() {
            Some(device) => device,
            None => {
                eprintln!("SKIP: Test requires CUDA GPU - use 'cargo test --features cuda'");
                return Ok(());
            }
        }
    };
}

pub mod device;
