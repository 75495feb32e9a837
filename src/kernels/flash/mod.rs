// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Tiled flash attention with autotuned configurations.
//!
//! Flash attention computes `softmax(Q·Kᵀ·scale)·V` tile by tile with a
//! streaming softmax, so the `seq × seq` score matrix is never materialized.
//! The forward pass also saves one base-2 log-sum-exp per query row, which
//! the backward pass uses to recompute attention weights on the fly.
//!
//! ## Module Structure
//!
//! - [`config`] - Kernel variants, tile configurations and validation
//! - [`space`] - Candidate pools per variant
//! - [`autotune`] - Per-shape measurement and caching
//! - [`forward`] / [`backward`] - The tile kernels over host buffers
//! - [`descriptor`] / [`pipeline`] - K/V staging used by some variants
//! - [`interop`] - Candle ↔ host buffer conversion
//! - [`reference`] - Direct attention and autodiff gradients for validation
//!
//! ## Usage
//!
//! ```rust,no_run
//! use candle_core::{Device, Tensor};
//! use flashbench_rs::kernels::flash::{FlashAttention, KernelVariant};
//!
//! # fn main() -> flashbench_rs::Result<()> {
//! let device = Device::Cpu;
//! let q = Tensor::randn(0.0f32, 1.0, (1, 4, 512, 128), &device)?;
//! let attention = FlashAttention::new(KernelVariant::WarpSpecialized);
//! let out = attention.forward(&q, &q, &q, 1.0 / 128f64.sqrt(), true)?;
//! println!("best config: {}", out.config);
//! # Ok(())
//! # }
//! ```

pub mod autotune;
pub mod backward;
pub mod config;
pub mod descriptor;
pub mod forward;
pub mod interop;
pub mod pipeline;
pub mod reference;
pub mod space;

use std::sync::Arc;

use candle_core::Tensor;

pub use autotune::{Autotuner, ShapeSignature, Timing, TuneSettings, TunedChoice};
pub use backward::{flash_backward, BackwardInputs, BackwardResult};
pub use config::{
    BackwardConfig, ConfigError, KernelConfig, KernelOptions, KernelVariant, LoopSchedule,
    TileConfig, WarpSpecConfig,
};
pub use forward::{flash_forward, AttentionProblem, ForwardResult};
pub use reference::{reference_attention, reference_gradients, ReferenceGrads};
pub use space::{CandidatePool, ConfigSpace};

use crate::error::Result;
use interop::{
    expect_dims, host_to_tensor, tensor_to_host, validate_attention_inputs, AttentionShape,
};

/// Forward pass result.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// Attention output, same shape, dtype and device as Q.
    pub output: Tensor,
    /// Base-2 log-sum-exp per query row, f32 `[batch, heads, seq]`.
    pub row_stats: Tensor,
    /// Configuration the output was computed with.
    pub config: KernelConfig,
}

/// Backward pass result, each with the shape, dtype and device of Q.
#[derive(Debug, Clone)]
pub struct AttentionGrads {
    /// Gradient with respect to Q.
    pub dq: Tensor,
    /// Gradient with respect to K.
    pub dk: Tensor,
    /// Gradient with respect to V.
    pub dv: Tensor,
}

/// Flash attention front end for one kernel variant.
///
/// Owns a shared [`Autotuner`]; clones and instances built with
/// [`FlashAttention::with_autotuner`] reuse the same cache.
#[derive(Debug, Clone)]
pub struct FlashAttention {
    variant: KernelVariant,
    options: KernelOptions,
    backward_config: BackwardConfig,
    autotuner: Arc<Autotuner>,
}

/// Host copies of Q, K and V with their problem description.
struct StagedInputs {
    shape: AttentionShape,
    problem: AttentionProblem,
    q: Vec<f32>,
    k: Vec<f32>,
    v: Vec<f32>,
}

impl FlashAttention {
    /// Front end for `variant` with default options and a private cache.
    #[must_use]
    pub fn new(variant: KernelVariant) -> Self {
        Self {
            variant,
            options: KernelOptions::default(),
            backward_config: BackwardConfig::default(),
            autotuner: Arc::new(Autotuner::default()),
        }
    }

    /// Set the candidate pool options.
    #[must_use]
    pub const fn with_options(mut self, options: KernelOptions) -> Self {
        self.options = options;
        self
    }

    /// Share a tuning cache.
    #[must_use]
    pub fn with_autotuner(mut self, autotuner: Arc<Autotuner>) -> Self {
        self.autotuner = autotuner;
        self
    }

    /// Set the backward tiling.
    #[must_use]
    pub const fn with_backward_config(mut self, backward_config: BackwardConfig) -> Self {
        self.backward_config = backward_config;
        self
    }

    /// Selected variant.
    #[must_use]
    pub const fn variant(&self) -> KernelVariant {
        self.variant
    }

    /// The tuning cache.
    #[must_use]
    pub fn autotuner(&self) -> &Arc<Autotuner> {
        &self.autotuner
    }

    /// Candidate pool for a head dimension and masking mode.
    #[must_use]
    pub fn candidate_pool(&self, head_dim: usize, causal: bool) -> CandidatePool {
        ConfigSpace::new(self.variant, self.options).build(head_dim, causal)
    }

    fn stage(
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        sm_scale: f64,
        causal: bool,
    ) -> Result<StagedInputs> {
        let (shape, precision) = validate_attention_inputs(q, k, v)?;
        #[allow(clippy::cast_possible_truncation)]
        let problem = AttentionProblem {
            batch: shape.batch,
            heads: shape.heads,
            seq_len: shape.seq_len,
            head_dim: shape.head_dim,
            sm_scale: sm_scale as f32,
            causal,
            precision,
        };
        Ok(StagedInputs {
            shape,
            problem,
            q: tensor_to_host(q)?,
            k: tensor_to_host(k)?,
            v: tensor_to_host(v)?,
        })
    }

    fn finish_forward(
        staged: &StagedInputs,
        like: &Tensor,
        result: ForwardResult,
        config: KernelConfig,
    ) -> Result<AttentionOutput> {
        let (b, h, n, d) = staged.shape.dims4();
        Ok(AttentionOutput {
            output: host_to_tensor(result.output, &[b, h, n, d], like.dtype(), like.device())?,
            row_stats: host_to_tensor(
                result.row_stats,
                &staged.shape.stats_dims(),
                candle_core::DType::F32,
                like.device(),
            )?,
            config,
        })
    }

    /// Autotuned forward pass.
    ///
    /// The first call for a shape signature measures every candidate of the
    /// variant's pool; later calls reuse the cached choice.
    ///
    /// # Arguments
    /// * `q`, `k`, `v` - `[batch, heads, seq, head_dim]` tensors of equal shape and dtype
    /// * `sm_scale` - Softmax temperature, typically `1/sqrt(head_dim)`
    /// * `causal` - Restrict row `i` to keys `<= i`
    ///
    /// # Errors
    ///
    /// Returns a validation error for bad inputs,
    /// [`FlashbenchError::NoValidConfig`](crate::FlashbenchError::NoValidConfig)
    /// if no configuration of the variant fits the problem, or the last
    /// candidate's error if every candidate failed.
    pub fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        sm_scale: f64,
        causal: bool,
    ) -> Result<AttentionOutput> {
        let staged = Self::stage(q, k, v, sm_scale, causal)?;
        let problem = staged.problem;
        let signature = ShapeSignature {
            seq_len: problem.seq_len,
            head_dim: problem.head_dim,
            causal,
            variant: self.variant,
            precision: problem.precision,
            options: self.options,
        };

        tracing::debug!(
            "flash attention {} batch={}, heads={}, seq={}, head_dim={}, causal={}",
            self.variant,
            problem.batch,
            problem.heads,
            problem.seq_len,
            problem.head_dim,
            causal
        );

        let pool = self.candidate_pool(problem.head_dim, causal);
        let choice = self.autotuner.get_or_tune(signature, &pool, |config| {
            flash_forward(&problem, config, &staged.q, &staged.k, &staged.v).map(|_| ())
        })?;

        let result = flash_forward(&problem, &choice.config, &staged.q, &staged.k, &staged.v)?;
        Self::finish_forward(&staged, q, result, choice.config)
    }

    /// Forward pass with an explicit configuration, bypassing the tuner.
    ///
    /// # Errors
    ///
    /// Returns a validation error for bad inputs or a configuration that does
    /// not fit the problem.
    pub fn forward_with_config(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        sm_scale: f64,
        causal: bool,
        config: &KernelConfig,
    ) -> Result<AttentionOutput> {
        let staged = Self::stage(q, k, v, sm_scale, causal)?;
        tracing::debug!("flash attention with fixed config: {}", config);
        let result = flash_forward(&staged.problem, config, &staged.q, &staged.k, &staged.v)?;
        Self::finish_forward(&staged, q, result, *config)
    }

    /// Backward pass from the saved forward tensors.
    ///
    /// # Arguments
    /// * `q`, `k`, `v` - Forward inputs
    /// * `output` - Forward output
    /// * `d_output` - Gradient of the loss with respect to `output`
    /// * `row_stats` - Row statistics returned by the forward pass
    ///
    /// # Errors
    ///
    /// Returns a validation error for mismatched shapes or an invalid
    /// backward tiling.
    #[allow(clippy::too_many_arguments)]
    pub fn backward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        output: &Tensor,
        d_output: &Tensor,
        row_stats: &Tensor,
        sm_scale: f64,
        causal: bool,
    ) -> Result<AttentionGrads> {
        let staged = Self::stage(q, k, v, sm_scale, causal)?;
        let (b, h, n, d) = staged.shape.dims4();
        expect_dims(output, &[b, h, n, d])?;
        expect_dims(d_output, &[b, h, n, d])?;
        expect_dims(row_stats, &staged.shape.stats_dims())?;

        let output = tensor_to_host(output)?;
        let d_output = tensor_to_host(d_output)?;
        let row_stats = tensor_to_host(row_stats)?;
        let inputs = BackwardInputs {
            q: &staged.q,
            k: &staged.k,
            v: &staged.v,
            output: &output,
            d_output: &d_output,
            row_stats: &row_stats,
        };

        tracing::debug!(
            "flash attention backward batch={}, heads={}, seq={}, head_dim={}, causal={}",
            b,
            h,
            n,
            d,
            causal
        );
        let grads = flash_backward(&staged.problem, &self.backward_config, &inputs)?;

        let dims = [b, h, n, d];
        Ok(AttentionGrads {
            dq: host_to_tensor(grads.dq, &dims, q.dtype(), q.device())?,
            dk: host_to_tensor(grads.dk, &dims, q.dtype(), q.device())?,
            dv: host_to_tensor(grads.dv, &dims, q.dtype(), q.device())?,
        })
    }
}
