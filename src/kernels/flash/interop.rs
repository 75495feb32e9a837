// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Candle ↔ host buffer conversion for the tile kernels.
//!
//! The kernels operate on contiguous row-major f32 host buffers. Inputs of any
//! supported dtype on any device are made contiguous, widened to f32 and
//! copied to the host; results are narrowed back to the caller's dtype and
//! moved to the caller's device.
//!
//! ## Key Functions
//!
//! - [`validate_attention_inputs`] - Check Q/K/V shapes, head dim and dtype
//! - [`tensor_to_host`] - Stage a tensor as a host `Vec<f32>`
//! - [`host_to_tensor`] - Turn a kernel result back into a Candle tensor

use candle_core::{DType, Device, Tensor};

use super::config::is_supported_head_dim;
use crate::error::{FlashbenchError, Result};
use crate::precision::Precision;

/// Dimensions of a validated attention problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionShape {
    /// Batch size.
    pub batch: usize,
    /// Number of heads.
    pub heads: usize,
    /// Sequence length.
    pub seq_len: usize,
    /// Head dimension.
    pub head_dim: usize,
}

impl AttentionShape {
    /// Dimensions as a 4-D shape.
    #[must_use]
    pub const fn dims4(&self) -> (usize, usize, usize, usize) {
        (self.batch, self.heads, self.seq_len, self.head_dim)
    }

    /// Dimensions of the row statistics tensor.
    #[must_use]
    pub const fn stats_dims(&self) -> [usize; 3] {
        [self.batch, self.heads, self.seq_len]
    }
}

/// Validate attention input tensors.
///
/// Q, K and V must be 4-D `[batch, heads, seq, head_dim]` tensors of the same
/// shape and dtype, the dtype must be f32, bf16 or f16 and the head dimension
/// one of the supported sizes.
///
/// # Errors
///
/// Returns [`FlashbenchError::InvalidConfig`] for non 4-D inputs,
/// [`FlashbenchError::ShapeMismatch`] when shapes differ,
/// [`FlashbenchError::UnsupportedDType`] or
/// [`FlashbenchError::UnsupportedHeadDim`].
pub fn validate_attention_inputs(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
) -> Result<(AttentionShape, Precision)> {
    let q_dims = q.dims();
    let k_dims = k.dims();
    let v_dims = v.dims();

    if q_dims.len() != 4 || k_dims.len() != 4 || v_dims.len() != 4 {
        return Err(FlashbenchError::InvalidConfig(format!(
            "Expected 4D tensors [batch, heads, seq, dim], got Q: {q_dims:?}, K: {k_dims:?}, V: {v_dims:?}"
        )));
    }
    for other in [k_dims, v_dims] {
        if other != q_dims {
            return Err(FlashbenchError::ShapeMismatch {
                expected: q_dims.to_vec(),
                actual: other.to_vec(),
            });
        }
    }

    if k.dtype() != q.dtype() || v.dtype() != q.dtype() {
        return Err(FlashbenchError::InvalidConfig(format!(
            "dtype mismatch: Q={:?}, K={:?}, V={:?}",
            q.dtype(),
            k.dtype(),
            v.dtype()
        )));
    }
    let precision = Precision::from_dtype(q.dtype())?;

    let head_dim = q_dims[3];
    if !is_supported_head_dim(head_dim) {
        return Err(FlashbenchError::UnsupportedHeadDim(head_dim));
    }

    Ok((
        AttentionShape {
            batch: q_dims[0],
            heads: q_dims[1],
            seq_len: q_dims[2],
            head_dim,
        },
        precision,
    ))
}

/// Check that `tensor` has exactly the dimensions `expected`.
///
/// # Errors
///
/// Returns [`FlashbenchError::ShapeMismatch`] otherwise.
pub fn expect_dims(tensor: &Tensor, expected: &[usize]) -> Result<()> {
    if tensor.dims() == expected {
        Ok(())
    } else {
        Err(FlashbenchError::ShapeMismatch {
            expected: expected.to_vec(),
            actual: tensor.dims().to_vec(),
        })
    }
}

/// Copy a tensor into a contiguous row-major f32 host buffer.
///
/// Non-f32 tensors are widened exactly, so bf16/f16 values keep their
/// storage-precision rounding.
///
/// # Errors
///
/// Returns an error if the device-to-host copy fails.
pub fn tensor_to_host(tensor: &Tensor) -> Result<Vec<f32>> {
    let tensor = tensor.contiguous()?;
    let tensor = if tensor.dtype() == DType::F32 {
        tensor
    } else {
        tensor.to_dtype(DType::F32)?
    };
    Ok(tensor.flatten_all()?.to_vec1::<f32>()?)
}

/// Build a tensor of `dtype` on `device` from a host buffer.
///
/// # Errors
///
/// Returns [`FlashbenchError::ShapeMismatch`] if the buffer length does not
/// match `shape`, or a Candle error if the transfer fails.
pub fn host_to_tensor(
    data: Vec<f32>,
    shape: &[usize],
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let num_elements: usize = shape.iter().product();
    if data.len() != num_elements {
        return Err(FlashbenchError::ShapeMismatch {
            expected: shape.to_vec(),
            actual: vec![data.len()],
        });
    }
    let tensor = Tensor::from_vec(data, shape, device)?;
    if dtype == DType::F32 {
        Ok(tensor)
    } else {
        Ok(tensor.to_dtype(dtype)?)
    }
}
