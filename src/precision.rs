// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Storage precision handling.
//!
//! The attention kernels keep scores, running statistics and accumulators in
//! f32. Only the operands of the two value-side matrix multiplies (`P` in the
//! forward pass, `P` and `dS` in the backward pass) are rounded to the storage
//! precision of the inputs, which is what a reduced-precision tensor core
//! would consume.

use candle_core::DType;
use half::{bf16, f16};

use crate::error::{FlashbenchError, Result};

/// Element precision of the tensors handed to a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Precision {
    /// Full 32-bit floats.
    #[default]
    F32,
    /// bfloat16 storage.
    Bf16,
    /// IEEE half precision storage.
    F16,
}

impl Precision {
    /// Map a Candle dtype to a kernel precision.
    ///
    /// # Errors
    ///
    /// Returns [`FlashbenchError::UnsupportedDType`] for integer and f64 tensors.
    pub fn from_dtype(dtype: DType) -> Result<Self> {
        match dtype {
            DType::F32 => Ok(Self::F32),
            DType::BF16 => Ok(Self::Bf16),
            DType::F16 => Ok(Self::F16),
            other => Err(FlashbenchError::UnsupportedDType(other)),
        }
    }

    /// The Candle dtype with this precision.
    #[must_use]
    pub const fn dtype(self) -> DType {
        match self {
            Self::F32 => DType::F32,
            Self::Bf16 => DType::BF16,
            Self::F16 => DType::F16,
        }
    }

    /// Bytes per stored element.
    #[must_use]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::Bf16 | Self::F16 => 2,
        }
    }

    /// Round an f32 value through the storage precision.
    #[inline]
    #[must_use]
    pub fn round(self, x: f32) -> f32 {
        match self {
            Self::F32 => x,
            Self::Bf16 => bf16::from_f32(x).to_f32(),
            Self::F16 => f16::from_f32(x).to_f32(),
        }
    }

    /// Absolute tolerance used when comparing against a full precision reference.
    #[must_use]
    pub const fn default_atol(self) -> f32 {
        match self {
            Self::F32 => 1e-5,
            Self::Bf16 | Self::F16 => 1e-2,
        }
    }
}
