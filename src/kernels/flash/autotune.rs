// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Per-shape configuration selection.
//!
//! The first call for a [`ShapeSignature`] times every candidate of the
//! variant's pool and caches the fastest one; later calls reuse the cached
//! choice without measuring. Each signature has its own lock, so concurrent
//! callers for the same shape wait for one measurement pass instead of
//! repeating it, while different shapes tune in parallel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::config::{KernelConfig, KernelOptions, KernelVariant};
use super::space::CandidatePool;
use crate::error::{FlashbenchError, Result};
use crate::precision::Precision;

/// Key of the tuning cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShapeSignature {
    /// Sequence length.
    pub seq_len: usize,
    /// Head dimension.
    pub head_dim: usize,
    /// Causal masking.
    pub causal: bool,
    /// Kernel variant.
    pub variant: KernelVariant,
    /// Storage precision of the inputs.
    pub precision: Precision,
    /// Options the candidate pool was built with.
    pub options: KernelOptions,
}

impl std::fmt::Display for ShapeSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} N_CTX={} HEAD_DIM={} causal={} dtype={:?}",
            self.variant,
            self.seq_len,
            self.head_dim,
            self.causal,
            self.precision.dtype()
        )?;
        if self.options.force_single_tile_variant {
            write!(f, " single_tile")?;
        } else if self.options.enable_alternate_pipelining {
            write!(f, " alt_pipelining")?;
        }
        Ok(())
    }
}

/// Measurement repetitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TuneSettings {
    /// Untimed runs before measuring.
    pub warmup: usize,
    /// Timed runs; the median is reported.
    pub rep: usize,
}

impl Default for TuneSettings {
    fn default() -> Self {
        Self { warmup: 1, rep: 5 }
    }
}

impl TuneSettings {
    /// Single untimed run and a single timed run, for tests.
    #[must_use]
    pub const fn quick() -> Self {
        Self { warmup: 0, rep: 1 }
    }

    /// Set warmup runs.
    #[must_use]
    pub const fn with_warmup(mut self, warmup: usize) -> Self {
        self.warmup = warmup;
        self
    }

    /// Set timed runs.
    #[must_use]
    pub const fn with_rep(mut self, rep: usize) -> Self {
        self.rep = rep;
        self
    }

    /// Run `run` untimed `warmup` times, then time at least one run.
    ///
    /// # Errors
    ///
    /// Returns the first error of `run`.
    pub fn time<F>(&self, mut run: F) -> Result<Timing>
    where
        F: FnMut() -> Result<()>,
    {
        for _ in 0..self.warmup {
            run()?;
        }
        let mut times = Vec::with_capacity(self.rep.max(1));
        for _ in 0..self.rep.max(1) {
            let start = Instant::now();
            run()?;
            times.push(start.elapsed());
        }
        times.sort_unstable();
        Ok(Timing {
            median: times[times.len() / 2],
            min: times[0],
            max: times[times.len() - 1],
        })
    }
}

/// Latency summary of repeated runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Median latency.
    pub median: Duration,
    /// Fastest run.
    pub min: Duration,
    /// Slowest run.
    pub max: Duration,
}

/// Timing of one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurement {
    /// Measured configuration.
    pub config: KernelConfig,
    /// Median latency.
    pub median: Duration,
    /// Fastest run.
    pub min: Duration,
    /// Slowest run.
    pub max: Duration,
}

/// Result of a tuning pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunedChoice {
    /// Fastest configuration.
    pub config: KernelConfig,
    /// Its median latency.
    pub latency: Duration,
    /// Timings of every candidate that ran successfully.
    pub measurements: Vec<Measurement>,
}

type Slot = Arc<Mutex<Option<TunedChoice>>>;

/// Shared tuning cache.
#[derive(Debug, Default)]
pub struct Autotuner {
    settings: TuneSettings,
    cache: Mutex<HashMap<ShapeSignature, Slot>>,
    passes: AtomicUsize,
}

impl Autotuner {
    /// Create an empty cache.
    #[must_use]
    pub fn new(settings: TuneSettings) -> Self {
        Self {
            settings,
            cache: Mutex::new(HashMap::new()),
            passes: AtomicUsize::new(0),
        }
    }

    /// Measurement repetitions in use.
    #[must_use]
    pub const fn settings(&self) -> TuneSettings {
        self.settings
    }

    /// Return the cached choice for `signature`, tuning `pool` on a miss.
    ///
    /// `run` executes one candidate end to end.
    ///
    /// # Errors
    ///
    /// Returns [`FlashbenchError::NoValidConfig`] for an empty pool, or the
    /// error of the last candidate if every candidate failed. Nothing is
    /// cached in either case.
    pub fn get_or_tune<F>(
        &self,
        signature: ShapeSignature,
        pool: &CandidatePool,
        run: F,
    ) -> Result<TunedChoice>
    where
        F: FnMut(&KernelConfig) -> Result<()>,
    {
        if pool.is_empty() {
            return Err(FlashbenchError::NoValidConfig(signature.to_string()));
        }

        let slot = Arc::clone(self.cache.lock().entry(signature).or_default());
        let mut slot = slot.lock();
        if let Some(choice) = slot.as_ref().filter(|c| pool.configs().contains(&c.config)) {
            tracing::debug!("autotune hit for {}: {}", signature, choice.config);
            return Ok(choice.clone());
        }

        let choice = self.tune(signature, pool, run)?;
        *slot = Some(choice.clone());
        Ok(choice)
    }

    /// Time every candidate and pick the fastest.
    fn tune<F>(
        &self,
        signature: ShapeSignature,
        pool: &CandidatePool,
        mut run: F,
    ) -> Result<TunedChoice>
    where
        F: FnMut(&KernelConfig) -> Result<()>,
    {
        self.passes.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("autotuning {} over {} candidates", signature, pool.len());

        let mut measurements = Vec::with_capacity(pool.len());
        let mut last_error = None;
        for config in pool {
            match self.measure(config, &mut run) {
                Ok(m) => measurements.push(m),
                Err(e) => {
                    tracing::warn!("skipping candidate {} for {}: {}", config, signature, e);
                    last_error = Some(e);
                }
            }
        }

        let Some(best) = measurements.iter().min_by_key(|m| m.median).copied() else {
            return Err(last_error
                .unwrap_or_else(|| FlashbenchError::NoValidConfig(signature.to_string())));
        };

        tracing::info!(
            "best config for {}: {} ({:.3} ms)",
            signature,
            best.config,
            best.median.as_secs_f64() * 1e3
        );

        Ok(TunedChoice {
            config: best.config,
            latency: best.median,
            measurements,
        })
    }

    fn measure<F>(&self, config: &KernelConfig, run: &mut F) -> Result<Measurement>
    where
        F: FnMut(&KernelConfig) -> Result<()>,
    {
        let timing = self.settings.time(|| run(config))?;
        Ok(Measurement {
            config: *config,
            median: timing.median,
            min: timing.min,
            max: timing.max,
        })
    }

    /// Cached configuration for `signature`, without tuning.
    #[must_use]
    pub fn cached(&self, signature: &ShapeSignature) -> Option<KernelConfig> {
        let slot = self.cache.lock().get(signature).map(Arc::clone)?;
        let choice = slot.lock();
        choice.as_ref().map(|c| c.config)
    }

    /// Number of signatures with a cached choice.
    #[must_use]
    pub fn len(&self) -> usize {
        let slots: Vec<Slot> = self.cache.lock().values().map(Arc::clone).collect();
        slots.iter().filter(|s| s.lock().is_some()).count()
    }

    /// Whether nothing has been tuned yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of measurement passes run so far.
    #[must_use]
    pub fn tuning_passes(&self) -> usize {
        self.passes.load(Ordering::Relaxed)
    }

    /// Drop every cached choice.
    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}
