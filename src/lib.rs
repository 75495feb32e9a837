//! # flashbench-rs
//!
//! Tiled flash attention kernels with autotuned configurations, built on
//! [Candle](https://github.com/huggingface/candle).
//!
//! This crate provides:
//!
//! - A streaming (online) softmax core working in base 2
//! - Forward attention over query/key tiles in five kernel variants
//! - A backward pass that recomputes attention weights from saved row statistics
//! - Per-shape autotuning over validated configuration pools
//! - A benchmark harness comparing variants against direct attention
//! - Memory estimation utilities
//!
//! ## Status
//!
//! Kernels run on host buffers with `rayon` parallelism. Tensors on CUDA
//! devices (feature `cuda`) are staged through the host and results are
//! returned on the caller's device and dtype.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use flashbench_rs::kernels::{FlashAttention, KernelVariant};
//! use candle_core::{Device, Tensor};
//!
//! let q = Tensor::randn(0.0f32, 1.0, (1, 8, 1024, 64), &Device::Cpu)?;
//! let attention = FlashAttention::new(KernelVariant::Baseline);
//! let out = attention.forward(&q, &q, &q, 0.125, true)?;
//! let grads = attention.backward(
//!     &q, &q, &q, &out.output, &out.output, &out.row_stats, 0.125, true,
//! )?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod harness;
pub mod kernels;
pub mod memory;
pub mod precision;

pub use error::{FlashbenchError, Result};
pub use precision::Precision;
