// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Benchmark harness comparing kernel variants against direct attention.
//!
//! For every shape the harness generates seeded inputs, computes the
//! reference result once, then measures each candidate: median latency,
//! achieved TFLOPS, an elementwise accuracy check against the reference and
//! the autotuned configuration. Accuracy failures and kernel candidates that
//! cannot run on a shape are reported and logged but never stop the run.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use flashbench_rs::harness::{BenchmarkHarness, Candidate};
//! use flashbench_rs::kernels::KernelVariant;
//!
//! # fn main() -> flashbench_rs::Result<()> {
//! let reports = BenchmarkHarness::new(vec![(1, 8, 1024, 128)])
//!     .with_causal(true)
//!     .with_candidates(vec![
//!         Candidate::Reference,
//!         Candidate::Flash(KernelVariant::WarpSpecialized),
//!     ])
//!     .run()?;
//! for report in &reports {
//!     for c in &report.candidates {
//!         println!("{}: {:.2} TFLOPS", c.name, c.tflops);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::Result;
use crate::kernels::flash::interop::{host_to_tensor, tensor_to_host, AttentionShape};
use crate::kernels::flash::{
    reference_attention, reference_gradients, Autotuner, FlashAttention, KernelOptions,
    KernelVariant, TuneSettings,
};
use crate::precision::Precision;

/// Work of the backward pass relative to the forward pass.
const BACKWARD_FLOP_RATIO: f64 = 2.5;

/// Something the harness can measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Candidate {
    /// Direct attention with a materialized score matrix.
    Reference,
    /// Autotuned flash attention of one variant.
    Flash(KernelVariant),
}

impl Candidate {
    /// Reference plus every kernel variant.
    #[must_use]
    pub fn all() -> Vec<Self> {
        std::iter::once(Self::Reference)
            .chain(KernelVariant::ALL.into_iter().map(Self::Flash))
            .collect()
    }

    /// Report name.
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::Reference => "reference".to_string(),
            Self::Flash(variant) => format!("triton_tutorial_flash_v2_{variant}"),
        }
    }
}

/// Outcome of comparing one result tensor to the reference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccuracyCheck {
    /// Every element satisfied `|x - ref| <= atol + rtol * |ref|`.
    pub passed: bool,
    /// Largest absolute difference.
    pub max_abs_error: f32,
}

impl AccuracyCheck {
    /// Compare `actual` against `expected` elementwise.
    #[must_use]
    pub fn compare(actual: &[f32], expected: &[f32], atol: f32, rtol: f32) -> Self {
        let mut passed = actual.len() == expected.len();
        let mut max_abs_error = 0.0f32;
        for (x, r) in actual.iter().zip(expected) {
            let err = (x - r).abs();
            // NaN must fail the check.
            if !(err <= atol + rtol * r.abs()) {
                passed = false;
            }
            max_abs_error = max_abs_error.max(err);
        }
        Self { passed, max_abs_error }
    }

    /// Check of a candidate that produced no result.
    #[must_use]
    pub const fn failed() -> Self {
        Self {
            passed: false,
            max_abs_error: f32::INFINITY,
        }
    }

    fn merge(self, other: Self) -> Self {
        Self {
            passed: self.passed && other.passed,
            max_abs_error: self.max_abs_error.max(other.max_abs_error),
        }
    }
}

/// Measurements of one candidate on one shape.
#[derive(Debug, Clone)]
pub struct CandidateReport {
    /// Candidate name.
    pub name: String,
    /// Median latency.
    pub latency: Duration,
    /// Achieved throughput.
    pub tflops: f64,
    /// Accuracy against the reference.
    pub accuracy: AccuracyCheck,
    /// Autotuned configuration, for kernel candidates.
    pub best_config: Option<String>,
    /// Why the candidate could not run on this shape.
    pub error: Option<String>,
}

impl CandidateReport {
    fn failed(candidate: Candidate, error: String) -> Self {
        Self {
            name: candidate.name(),
            latency: Duration::ZERO,
            tflops: 0.0,
            accuracy: AccuracyCheck::failed(),
            best_config: None,
            error: Some(error),
        }
    }
}

/// Reports of every candidate on one shape.
#[derive(Debug, Clone)]
pub struct ShapeReport {
    /// Problem dimensions.
    pub shape: AttentionShape,
    /// Causal masking.
    pub causal: bool,
    /// Candidates in the order they were given.
    pub candidates: Vec<CandidateReport>,
}

impl fmt::Display for ShapeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (b, h, n, d) = self.shape.dims4();
        writeln!(f, "(Batch, Heads, SeqLen, Dhead) = ({b}, {h}, {n}, {d}) causal={}", self.causal)?;
        for c in &self.candidates {
            if let Some(error) = &c.error {
                writeln!(f, "  {:<40} failed: {error}", c.name)?;
                continue;
            }
            writeln!(
                f,
                "  {:<40} {:>10.3} ms {:>8.3} TFLOPS  accuracy={} ({:.2e})  {}",
                c.name,
                c.latency.as_secs_f64() * 1e3,
                c.tflops,
                c.accuracy.passed,
                c.accuracy.max_abs_error,
                c.best_config.as_deref().unwrap_or("-")
            )?;
        }
        Ok(())
    }
}

/// Seeded inputs of one shape.
struct Inputs {
    q: Tensor,
    k: Tensor,
    v: Tensor,
    d_output: Tensor,
}

/// Expected results of one shape, as f32 host buffers.
struct Expected {
    output: Vec<f32>,
    grads: Option<[Vec<f32>; 3]>,
}

/// Benchmark driver.
#[derive(Debug, Clone)]
pub struct BenchmarkHarness {
    shapes: Vec<(usize, usize, usize, usize)>,
    causal: bool,
    precision: Precision,
    seed: u64,
    candidates: Vec<Candidate>,
    options: KernelOptions,
    atol: f32,
    rtol: f32,
    timing: TuneSettings,
    backward: bool,
    device: Device,
}

impl BenchmarkHarness {
    /// Harness over `(batch, heads, seq, head_dim)` shapes with every candidate.
    #[must_use]
    pub fn new(shapes: Vec<(usize, usize, usize, usize)>) -> Self {
        Self {
            shapes,
            causal: false,
            precision: Precision::F32,
            seed: 0,
            candidates: Candidate::all(),
            options: KernelOptions::default(),
            atol: Precision::F32.default_atol(),
            rtol: 0.0,
            timing: TuneSettings::default(),
            backward: false,
            device: Device::Cpu,
        }
    }

    /// Set causal masking.
    #[must_use]
    pub fn with_causal(mut self, causal: bool) -> Self {
        self.causal = causal;
        self
    }

    /// Set the input precision; the absolute tolerance follows it.
    #[must_use]
    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self.atol = precision.default_atol();
        self
    }

    /// Set the input seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the candidate list.
    #[must_use]
    pub fn with_candidates(mut self, candidates: Vec<Candidate>) -> Self {
        self.candidates = candidates;
        self
    }

    /// Set the candidate pool options of the kernel variants.
    #[must_use]
    pub fn with_options(mut self, options: KernelOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the accuracy tolerances.
    #[must_use]
    pub fn with_tolerance(mut self, atol: f32, rtol: f32) -> Self {
        self.atol = atol;
        self.rtol = rtol;
        self
    }

    /// Set untimed and timed repetitions.
    #[must_use]
    pub fn with_repetitions(mut self, warmup: usize, rep: usize) -> Self {
        self.timing = TuneSettings { warmup, rep };
        self
    }

    /// Measure forward plus backward and check the gradients.
    #[must_use]
    pub fn with_backward(mut self, backward: bool) -> Self {
        self.backward = backward;
        self
    }

    /// Device the inputs live on.
    #[must_use]
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Measure every candidate on every shape.
    ///
    /// # Errors
    ///
    /// Returns an error if input generation or the reference fails. Kernel
    /// candidates that cannot run on a shape (for example when their pool is
    /// empty for it) and accuracy failures are recorded, not returned.
    pub fn run(&self) -> Result<Vec<ShapeReport>> {
        let autotuner = Arc::new(Autotuner::new(self.timing));
        let mut rng = StdRng::seed_from_u64(self.seed);

        let mut reports = Vec::with_capacity(self.shapes.len());
        for &(batch, heads, seq_len, head_dim) in &self.shapes {
            let shape = AttentionShape {
                batch,
                heads,
                seq_len,
                head_dim,
            };
            let inputs = self.generate(&shape, &mut rng)?;
            let expected = self.expected(&inputs)?;
            let sm_scale = 1.0 / (head_dim as f64).sqrt();

            let mut candidates = Vec::with_capacity(self.candidates.len());
            for &candidate in &self.candidates {
                let report = match candidate {
                    Candidate::Reference => {
                        self.measure_reference(&shape, &inputs, &expected, sm_scale)?
                    }
                    Candidate::Flash(variant) => {
                        let attention = FlashAttention::new(variant)
                            .with_options(self.options)
                            .with_autotuner(Arc::clone(&autotuner));
                        match self.measure_flash(&shape, &attention, &inputs, &expected, sm_scale) {
                            Ok(report) => report,
                            Err(e) => {
                                tracing::warn!(
                                    "{} could not run on {:?}: {}",
                                    candidate.name(),
                                    shape.dims4(),
                                    e
                                );
                                candidates.push(CandidateReport::failed(candidate, e.to_string()));
                                continue;
                            }
                        }
                    }
                };
                if !report.accuracy.passed {
                    tracing::warn!(
                        "{} failed accuracy on {:?} (max abs error {:.3e}, atol {}, rtol {})",
                        report.name,
                        shape.dims4(),
                        report.accuracy.max_abs_error,
                        self.atol,
                        self.rtol
                    );
                }
                candidates.push(report);
            }

            reports.push(ShapeReport {
                shape,
                causal: self.causal,
                candidates,
            });
        }
        Ok(reports)
    }

    fn generate(&self, shape: &AttentionShape, rng: &mut StdRng) -> Result<Inputs> {
        let (b, h, n, d) = shape.dims4();
        let dims = [b, h, n, d];
        let numel = b * h * n * d;
        let mut tensor = || -> Result<Tensor> {
            let data: Vec<f32> = (0..numel).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
            host_to_tensor(data, &dims, self.precision.dtype(), &self.device)
        };
        Ok(Inputs {
            q: tensor()?,
            k: tensor()?,
            v: tensor()?,
            d_output: tensor()?,
        })
    }

    fn expected(&self, inputs: &Inputs) -> Result<Expected> {
        let sm_scale = 1.0 / (inputs.q.dims()[3] as f64).sqrt();
        let Inputs { q, k, v, d_output } = inputs;
        let output = tensor_to_host(&reference_attention(q, k, v, sm_scale, self.causal)?)?;
        let grads = if self.backward {
            let g = reference_gradients(q, k, v, d_output, sm_scale, self.causal)?;
            Some([tensor_to_host(&g.dq)?, tensor_to_host(&g.dk)?, tensor_to_host(&g.dv)?])
        } else {
            None
        };
        Ok(Expected { output, grads })
    }

    #[allow(clippy::cast_precision_loss)]
    fn tflops(&self, shape: &AttentionShape, latency: Duration) -> f64 {
        let (b, h, n, d) = shape.dims4();
        let mut flops = 4.0 * (b * h) as f64 * (n * n) as f64 * d as f64;
        if self.causal {
            flops *= 0.5;
        }
        if self.backward {
            flops *= 1.0 + BACKWARD_FLOP_RATIO;
        }
        flops / latency.as_secs_f64().max(f64::MIN_POSITIVE) * 1e-12
    }

    fn check(&self, actual: &Tensor, expected: &[f32]) -> Result<AccuracyCheck> {
        Ok(AccuracyCheck::compare(&tensor_to_host(actual)?, expected, self.atol, self.rtol))
    }

    fn measure_reference(
        &self,
        shape: &AttentionShape,
        inputs: &Inputs,
        expected: &Expected,
        sm_scale: f64,
    ) -> Result<CandidateReport> {
        let Inputs { q, k, v, d_output } = inputs;
        let causal = self.causal;
        let timing = if self.backward {
            self.timing
                .time(|| reference_gradients(q, k, v, d_output, sm_scale, causal).map(|_| ()))?
        } else {
            self.timing
                .time(|| reference_attention(q, k, v, sm_scale, causal).map(|_| ()))?
        };
        let latency = timing.median;

        let output = reference_attention(q, k, v, sm_scale, self.causal)?;
        Ok(CandidateReport {
            name: Candidate::Reference.name(),
            latency,
            tflops: self.tflops(shape, latency),
            accuracy: self.check(&output, &expected.output)?,
            best_config: None,
            error: None,
        })
    }

    fn measure_flash(
        &self,
        shape: &AttentionShape,
        attention: &FlashAttention,
        inputs: &Inputs,
        expected: &Expected,
        sm_scale: f64,
    ) -> Result<CandidateReport> {
        let Inputs { q, k, v, d_output } = inputs;
        let causal = self.causal;

        // Tunes on first use, so the timed runs below hit the cache.
        let out = attention.forward(q, k, v, sm_scale, causal)?;
        tracing::debug!("{} best config: {}", attention.variant(), out.config);
        let mut accuracy = self.check(&out.output, &expected.output)?;

        let timing = if self.backward {
            let grads = attention.backward(
                q,
                k,
                v,
                &out.output,
                d_output,
                &out.row_stats,
                sm_scale,
                causal,
            )?;
            if let Some([dq, dk, dv]) = &expected.grads {
                accuracy = accuracy
                    .merge(self.check(&grads.dq, dq)?)
                    .merge(self.check(&grads.dk, dk)?)
                    .merge(self.check(&grads.dv, dv)?);
            }
            self.timing.time(|| {
                let fwd = attention.forward(q, k, v, sm_scale, causal)?;
                attention
                    .backward(q, k, v, &fwd.output, d_output, &fwd.row_stats, sm_scale, causal)
                    .map(|_| ())
            })?
        } else {
            self.timing
                .time(|| attention.forward(q, k, v, sm_scale, causal).map(|_| ()))?
        };
        let latency = timing.median;

        Ok(CandidateReport {
            name: Candidate::Flash(attention.variant()).name(),
            latency,
            tflops: self.tflops(shape, latency),
            accuracy,
            best_config: Some(out.config.to_string()),
            error: None,
        })
    }
}
