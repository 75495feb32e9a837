// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Error types for flashbench-rs.

use thiserror::Error;

use crate::kernels::flash::config::ConfigError;

/// Result type alias for flashbench-rs operations.
pub type Result<T> = std::result::Result<T, FlashbenchError>;

/// Errors that can occur in flashbench-rs operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FlashbenchError {
    /// Kernel execution error.
    #[error("kernel error: {0}")]
    Kernel(String),

    /// Shape mismatch.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// Head dimension outside the supported set.
    #[error("unsupported head dimension {0}, expected one of 16, 32, 64, 128, 256")]
    UnsupportedHeadDim(usize),

    /// Element type the kernels cannot run on.
    #[error("unsupported dtype {0:?}, expected f32, bf16 or f16")]
    UnsupportedDType(candle_core::DType),

    /// Invalid configuration or arguments.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A kernel configuration was rejected by validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Every candidate of a pool was filtered out or failed.
    #[error("no valid configuration for {0}")]
    NoValidConfig(String),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
