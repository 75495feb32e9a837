// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Direct attention built from Candle ops.
//!
//! Materializes the full `seq × seq` score matrix, so it needs O(N²) memory.
//! It is the accuracy baseline for the tiled kernels and, through Candle's
//! autodiff, the source of reference gradients.

use candle_core::{DType, Device, Tensor, Var};

use crate::error::{FlashbenchError, Result};

/// Reference gradients of `sum(O * dO)`.
#[derive(Debug, Clone)]
pub struct ReferenceGrads {
    /// Gradient with respect to Q.
    pub dq: Tensor,
    /// Gradient with respect to K.
    pub dk: Tensor,
    /// Gradient with respect to V.
    pub dv: Tensor,
}

/// Softmax attention `softmax(Q·Kᵀ·scale + mask)·V`, computed in f32.
///
/// The result is f32 regardless of the input dtype.
///
/// # Errors
///
/// Returns an error if the Candle ops fail (for example on shape mismatch).
pub fn reference_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    sm_scale: f64,
    causal: bool,
) -> Result<Tensor> {
    let q = q.to_dtype(DType::F32)?;
    let k = k.to_dtype(DType::F32)?;
    let v = v.to_dtype(DType::F32)?;
    attention_f32(&q, &k, &v, sm_scale, causal)
}

fn attention_f32(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    sm_scale: f64,
    causal: bool,
) -> Result<Tensor> {
    let scores = q.matmul(&k.transpose(2, 3)?.contiguous()?)?;
    let scores = (scores * sm_scale)?;

    let scores = if causal {
        let seq_len = q.dims()[2];
        let causal_mask = create_causal_mask_tensor(seq_len, q.device())?;
        scores.broadcast_add(&causal_mask)?
    } else {
        scores
    };

    let attn_weights = candle_nn::ops::softmax(&scores, 3)?;
    Ok(attn_weights.matmul(&v.contiguous()?)?)
}

/// Gradients of `sum(reference_attention(q, k, v) * d_output)` by autodiff.
///
/// # Errors
///
/// Returns an error if the forward or backward graph fails.
pub fn reference_gradients(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    d_output: &Tensor,
    sm_scale: f64,
    causal: bool,
) -> Result<ReferenceGrads> {
    let q = Var::from_tensor(&q.to_dtype(DType::F32)?)?;
    let k = Var::from_tensor(&k.to_dtype(DType::F32)?)?;
    let v = Var::from_tensor(&v.to_dtype(DType::F32)?)?;
    let d_output = d_output.to_dtype(DType::F32)?;

    let output = attention_f32(q.as_tensor(), k.as_tensor(), v.as_tensor(), sm_scale, causal)?;
    let loss = (output * d_output)?.sum_all()?;
    let grads = loss.backward()?;

    let take = |var: &Var, name: &str| -> Result<Tensor> {
        grads.get(var.as_tensor()).cloned().ok_or_else(|| {
            FlashbenchError::Kernel(format!("autodiff produced no gradient for {name}"))
        })
    };

    Ok(ReferenceGrads {
        dq: take(&q, "q")?,
        dk: take(&k, "k")?,
        dv: take(&v, "v")?,
    })
}

/// Create a causal mask tensor with -inf in the upper triangle.
fn create_causal_mask_tensor(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mut mask_data = vec![0.0f32; seq_len * seq_len];
    for i in 0..seq_len {
        for j in (i + 1)..seq_len {
            mask_data[i * seq_len + j] = f32::NEG_INFINITY;
        }
    }
    Ok(Tensor::from_vec(mask_data, (1, 1, seq_len, seq_len), device)?)
}
