//! Test utilities and fixtures for flash attention integration tests.
//!
//! This module provides seeded input generation, comparison utilities and
//! timing helpers shared by the integration tests.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Attention problem used to generate inputs.
#[derive(Debug, Clone, Copy)]
pub struct AttentionTestConfig {
    pub batch_size: usize,
    pub num_heads: usize,
    pub seq_len: usize,
    pub head_dim: usize,
    pub causal: bool,
    pub dtype: DType,
    /// Random seed for reproducible tests.
    pub seed: u64,
}

impl AttentionTestConfig {
    /// Small configuration for basic correctness tests.
    pub fn small() -> Self {
        Self {
            batch_size: 1,
            num_heads: 2,
            seq_len: 128,
            head_dim: 64,
            causal: false,
            dtype: DType::F32,
            seed: 42,
        }
    }

    /// Multi-head, multi-batch configuration with a ragged last tile.
    pub fn ragged() -> Self {
        Self {
            batch_size: 2,
            num_heads: 3,
            seq_len: 200,
            head_dim: 64,
            causal: true,
            dtype: DType::F32,
            seed: 7,
        }
    }

    pub fn with_causal(mut self, causal: bool) -> Self {
        self.causal = causal;
        self
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn with_seq_len(mut self, seq_len: usize) -> Self {
        self.seq_len = seq_len;
        self
    }

    pub fn with_head_dim(mut self, head_dim: usize) -> Self {
        self.head_dim = head_dim;
        self
    }

    pub fn dims(&self) -> (usize, usize, usize, usize) {
        (self.batch_size, self.num_heads, self.seq_len, self.head_dim)
    }

    /// Default softmax scale, `1/sqrt(head_dim)`.
    pub fn sm_scale(&self) -> f64 {
        1.0 / (self.head_dim as f64).sqrt()
    }
}

/// Test fixtures for attention inputs.
pub struct TestFixtures;

impl TestFixtures {
    /// Generate Q, K, V from the config's seed, uniform in `[-1, 1]`.
    pub fn attention_inputs(config: &AttentionTestConfig) -> Result<(Tensor, Tensor, Tensor)> {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let q = Self::uniform(config, &mut rng)?;
        let k = Self::uniform(config, &mut rng)?;
        let v = Self::uniform(config, &mut rng)?;
        Ok((q, k, v))
    }

    /// Generate an upstream gradient with a seed distinct from the inputs.
    pub fn output_gradient(config: &AttentionTestConfig) -> Result<Tensor> {
        let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(1_000));
        Self::uniform(config, &mut rng)
    }

    fn uniform(config: &AttentionTestConfig, rng: &mut StdRng) -> Result<Tensor> {
        let (b, h, n, d) = config.dims();
        let data: Vec<f32> = (0..b * h * n * d).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        Ok(Tensor::from_vec(data, (b, h, n, d), &Device::Cpu)?.to_dtype(config.dtype)?)
    }
}

/// Accuracy metrics for numerical validation.
#[derive(Debug, Clone)]
pub struct AccuracyMetrics {
    /// Mean Absolute Error.
    pub mae: f32,
    /// Root Mean Square Error.
    pub rmse: f32,
    /// Maximum absolute error.
    pub max_error: f32,
    /// Cosine similarity between tensors.
    pub cosine_similarity: f32,
}

pub struct ValidationUtils;

impl ValidationUtils {
    /// Calculate accuracy metrics between two tensors of any float dtype.
    pub fn calculate_accuracy_metrics(
        expected: &Tensor,
        actual: &Tensor,
    ) -> Result<AccuracyMetrics> {
        let expected = expected.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let actual = actual.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;

        assert_eq!(expected.len(), actual.len(), "Tensor dimensions must match");

        let n = expected.len() as f32;
        let mut sum_abs_error = 0.0;
        let mut sum_squared_error = 0.0;
        let mut max_error: f32 = 0.0;
        let mut dot_product = 0.0;
        let mut expected_norm_sq = 0.0;
        let mut actual_norm_sq = 0.0;

        for (e, a) in expected.iter().zip(actual.iter()) {
            let error = (e - a).abs();
            sum_abs_error += error;
            sum_squared_error += error * error;
            max_error = max_error.max(error);

            dot_product += e * a;
            expected_norm_sq += e * e;
            actual_norm_sq += a * a;
        }

        let cosine_similarity = if expected_norm_sq > 0.0 && actual_norm_sq > 0.0 {
            dot_product / (expected_norm_sq.sqrt() * actual_norm_sq.sqrt())
        } else {
            0.0
        };

        Ok(AccuracyMetrics {
            mae: sum_abs_error / n,
            rmse: (sum_squared_error / n).sqrt(),
            max_error,
            cosine_similarity,
        })
    }

    /// Flatten a tensor to f32 host values.
    pub fn to_host(tensor: &Tensor) -> Result<Vec<f32>> {
        Ok(tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?)
    }
}

/// Timing utilities for performance validation.
pub struct TimingUtils;

impl TimingUtils {
    /// Time a function execution and return (result, duration_ms).
    pub fn time_execution<F, R>(f: F) -> (R, f64)
    where
        F: FnOnce() -> R,
    {
        let start = std::time::Instant::now();
        let result = f();
        (result, start.elapsed().as_secs_f64() * 1000.0)
    }
}
