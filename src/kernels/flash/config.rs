// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Kernel configuration for flash attention.
//!
//! A [`KernelConfig`] is a closed sum over the kernel variants. Each variant
//! carries the validated configuration type it needs: plain tile parameters
//! for the baseline, pipelined and descriptor kernels, and additional
//! producer/consumer parameters for the warp-specialized kernels.
//!
//! # Example
//!
//! ```rust
//! use flashbench_rs::kernels::flash::config::{KernelConfig, TileConfig};
//!
//! let config = KernelConfig::Baseline(TileConfig::default().with_blocks(64, 64));
//! assert!(config.validate(64, true).is_ok());
//! assert!(config.validate(32, true).is_err()); // block_n > head_dim
//! ```

use std::fmt;

use thiserror::Error;

/// Head dimensions the kernels accept.
pub const SUPPORTED_HEAD_DIMS: [usize; 5] = [16, 32, 64, 128, 256];

/// Smallest block size along either tile axis.
pub const MIN_BLOCK: usize = 16;

/// Warp count at which a configuration counts as wide.
pub const WIDE_WARPS: usize = 8;

/// Tile area a wide configuration needs to keep every warp busy.
pub const MIN_WIDE_TILE_AREA: usize = 128 * 128;

/// Whether `head_dim` is one of [`SUPPORTED_HEAD_DIMS`].
#[must_use]
pub fn is_supported_head_dim(head_dim: usize) -> bool {
    SUPPORTED_HEAD_DIMS.contains(&head_dim)
}

/// Kernel variant selector.
///
/// Choosing a variant is an explicit caller decision; only the configuration
/// within a variant is autotuned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KernelVariant {
    /// Plain tile loop with in-place K/V reads.
    Baseline,
    /// In-place reads with software-pipelined loop schedules.
    Pipelined,
    /// Producer/consumer split with a bounded tile queue.
    WarpSpecialized,
    /// K/V staged through tile descriptors.
    HardwareDescriptor,
    /// Tile descriptors feeding a producer/consumer split.
    HardwareDescriptorWarpSpecialized,
}

impl KernelVariant {
    /// All variants, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Baseline,
        Self::Pipelined,
        Self::WarpSpecialized,
        Self::HardwareDescriptor,
        Self::HardwareDescriptorWarpSpecialized,
    ];

    /// Short name used in reports.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Baseline => "base",
            Self::Pipelined => "opt",
            Self::WarpSpecialized => "ws",
            Self::HardwareDescriptor => "tma",
            Self::HardwareDescriptorWarpSpecialized => "tma_ws",
        }
    }

    /// Whether K/V tiles go through tile descriptors.
    #[must_use]
    pub const fn uses_descriptors(self) -> bool {
        matches!(self, Self::HardwareDescriptor | Self::HardwareDescriptorWarpSpecialized)
    }

    /// Whether the variant runs a separate load stage.
    #[must_use]
    pub const fn is_warp_specialized(self) -> bool {
        matches!(self, Self::WarpSpecialized | Self::HardwareDescriptorWarpSpecialized)
    }
}

impl fmt::Display for KernelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordering of the two matrix multiplies inside the key-tile loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LoopSchedule {
    /// One tile at a time: `Q·Kᵀ`, softmax, `P·V`.
    #[default]
    Default,
    /// The next tile's `Q·Kᵀ` is issued before the current tile's `P·V`.
    FirstDot,
    /// The current tile's `P·V` is issued after the next tile's softmax step.
    SecondDot,
}

impl LoopSchedule {
    /// Name used in configuration strings.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::FirstDot => "FA_firstDot",
            Self::SecondDot => "FA_secondDot",
        }
    }

    /// Whether this is one of the software-pipelined schedules.
    #[must_use]
    pub const fn is_pipelined(self) -> bool {
        !matches!(self, Self::Default)
    }
}

/// Tile, warp and pipeline parameters shared by every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileConfig {
    /// Rows per query tile.
    pub block_m: usize,
    /// Columns per key tile.
    pub block_n: usize,
    /// Parallel width of one tile worker.
    pub num_warps: usize,
    /// Software pipeline depth.
    pub num_stages: usize,
    /// Key-loop schedule.
    pub schedule: LoopSchedule,
    /// Process the final key tile outside the loop body.
    pub peel_last: bool,
}

impl Default for TileConfig {
    fn default() -> Self {
        Self {
            block_m: 128,
            block_n: 128,
            num_warps: 8,
            num_stages: 3,
            schedule: LoopSchedule::Default,
            peel_last: false,
        }
    }
}

impl TileConfig {
    /// Set both block sizes.
    #[must_use]
    pub const fn with_blocks(mut self, block_m: usize, block_n: usize) -> Self {
        self.block_m = block_m;
        self.block_n = block_n;
        self
    }

    /// Set the warp count.
    #[must_use]
    pub const fn with_warps(mut self, num_warps: usize) -> Self {
        self.num_warps = num_warps;
        self
    }

    /// Set the pipeline depth.
    #[must_use]
    pub const fn with_stages(mut self, num_stages: usize) -> Self {
        self.num_stages = num_stages;
        self
    }

    /// Set the loop schedule.
    #[must_use]
    pub const fn with_schedule(mut self, schedule: LoopSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Peel the last key-loop iteration.
    #[must_use]
    pub const fn with_peel_last(mut self, peel_last: bool) -> Self {
        self.peel_last = peel_last;
        self
    }

    /// Number of query tiles for a sequence.
    #[must_use]
    pub const fn num_q_tiles(&self, seq_len: usize) -> usize {
        seq_len.div_ceil(self.block_m)
    }

    /// Number of key tiles for a sequence.
    #[must_use]
    pub const fn num_kv_tiles(&self, seq_len: usize) -> usize {
        seq_len.div_ceil(self.block_n)
    }

    /// Whether the tile keeps all of its warps occupied.
    #[must_use]
    pub const fn is_efficient(&self) -> bool {
        !(self.num_warps >= WIDE_WARPS && self.block_m * self.block_n < MIN_WIDE_TILE_AREA)
    }

    /// Check correctness constraints against a problem.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self, head_dim: usize, causal: bool) -> Result<(), ConfigError> {
        for block in [self.block_m, self.block_n] {
            if !block.is_power_of_two() || block < MIN_BLOCK {
                return Err(ConfigError::InvalidBlockSize(block));
            }
        }
        if self.block_n > head_dim {
            return Err(ConfigError::BlockExceedsHeadDim {
                block_n: self.block_n,
                head_dim,
            });
        }
        if causal && self.block_m % self.block_n != 0 {
            return Err(ConfigError::CausalBlockMismatch {
                block_m: self.block_m,
                block_n: self.block_n,
            });
        }
        if !self.num_warps.is_power_of_two() || self.num_warps > 16 {
            return Err(ConfigError::InvalidWarpCount(self.num_warps));
        }
        Ok(())
    }
}

/// Producer/consumer parameters of the warp-specialized kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WarpSpecConfig {
    /// Tile parameters.
    pub tile: TileConfig,
    /// Capacity of the load-stage queue.
    pub num_buffers: usize,
    /// Row groups the compute stage splits a query tile into.
    pub num_consumer_groups: usize,
    /// Register budget released by the producer.
    pub reg_dec_producer: usize,
    /// Register budget claimed by each consumer.
    pub reg_inc_consumer: usize,
}

impl Default for WarpSpecConfig {
    fn default() -> Self {
        Self {
            tile: TileConfig::default().with_warps(4).with_stages(0),
            num_buffers: 2,
            num_consumer_groups: 2,
            reg_dec_producer: 24,
            reg_inc_consumer: 240,
        }
    }
}

impl WarpSpecConfig {
    /// Register split known to hang the producer/consumer handshake.
    pub const HANGING_REGISTER_SPLIT: (usize, usize) = (32, 240);

    /// Build from tile parameters with the default producer/consumer split.
    #[must_use]
    pub fn from_tile(tile: TileConfig) -> Self {
        Self {
            tile,
            ..Self::default()
        }
    }

    fn validate(&self, head_dim: usize, causal: bool) -> Result<(), ConfigError> {
        self.tile.validate(head_dim, causal)?;
        if self.num_buffers == 0 {
            return Err(ConfigError::InvalidBufferCount(self.num_buffers));
        }
        if self.num_consumer_groups == 0 || self.tile.block_m % self.num_consumer_groups != 0 {
            return Err(ConfigError::InvalidConsumerGroups {
                groups: self.num_consumer_groups,
                block_m: self.tile.block_m,
            });
        }
        if (self.reg_dec_producer, self.reg_inc_consumer) == Self::HANGING_REGISTER_SPLIT {
            return Err(ConfigError::HangingRegisterSplit {
                producer: self.reg_dec_producer,
                consumer: self.reg_inc_consumer,
            });
        }
        Ok(())
    }
}

/// A complete, variant-tagged kernel configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelConfig {
    /// Baseline kernel.
    Baseline(TileConfig),
    /// Software-pipelined kernel.
    Pipelined(TileConfig),
    /// Producer/consumer kernel.
    WarpSpecialized(WarpSpecConfig),
    /// Descriptor-staged kernel.
    HardwareDescriptor(TileConfig),
    /// Descriptor-staged producer/consumer kernel.
    HardwareDescriptorWarpSpecialized(WarpSpecConfig),
}

impl KernelConfig {
    /// The variant this configuration belongs to.
    #[must_use]
    pub const fn variant(&self) -> KernelVariant {
        match self {
            Self::Baseline(_) => KernelVariant::Baseline,
            Self::Pipelined(_) => KernelVariant::Pipelined,
            Self::WarpSpecialized(_) => KernelVariant::WarpSpecialized,
            Self::HardwareDescriptor(_) => KernelVariant::HardwareDescriptor,
            Self::HardwareDescriptorWarpSpecialized(_) => {
                KernelVariant::HardwareDescriptorWarpSpecialized
            }
        }
    }

    /// Tile parameters.
    #[must_use]
    pub const fn tile(&self) -> &TileConfig {
        match self {
            Self::Baseline(t) | Self::Pipelined(t) | Self::HardwareDescriptor(t) => t,
            Self::WarpSpecialized(ws) | Self::HardwareDescriptorWarpSpecialized(ws) => &ws.tile,
        }
    }

    /// Producer/consumer parameters, for warp-specialized variants.
    #[must_use]
    pub const fn warp_spec(&self) -> Option<&WarpSpecConfig> {
        match self {
            Self::WarpSpecialized(ws) | Self::HardwareDescriptorWarpSpecialized(ws) => Some(ws),
            _ => None,
        }
    }

    /// Check the configuration against a problem.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for impossible tilings, unsupported warp
    /// counts and the combinations known to hang or to compute wrong results.
    pub fn validate(&self, head_dim: usize, causal: bool) -> Result<(), ConfigError> {
        match self {
            Self::Baseline(t) | Self::Pipelined(t) | Self::HardwareDescriptor(t) => {
                t.validate(head_dim, causal)
            }
            Self::WarpSpecialized(ws) => ws.validate(head_dim, causal),
            Self::HardwareDescriptorWarpSpecialized(ws) => {
                ws.validate(head_dim, causal)?;
                // Open issue: this combination produces wrong output and has no
                // known fix, so it is refused outright.
                if ws.tile.peel_last && ws.tile.schedule == LoopSchedule::FirstDot {
                    return Err(ConfigError::KnownIncorrectCombination);
                }
                Ok(())
            }
        }
    }

    /// Occupancy predicate applied when building candidate pools.
    #[must_use]
    pub const fn is_efficient(&self) -> bool {
        self.tile().is_efficient()
    }
}

impl fmt::Display for KernelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = self.tile();
        write!(
            f,
            "variant: {}, BLOCK_M: {}, BLOCK_N: {}, LOOP_SCHEDULE: {}, num_warps: {}, num_stages: {}",
            self.variant(),
            t.block_m,
            t.block_n,
            t.schedule.name(),
            t.num_warps,
            t.num_stages
        )?;
        if t.peel_last {
            f.write_str(", peel_last: true")?;
        }
        if let Some(ws) = self.warp_spec() {
            write!(
                f,
                ", num_buffers_warp_spec: {}, num_consumer_groups: {}, reg_dec_producer: {}, reg_inc_consumer: {}",
                ws.num_buffers, ws.num_consumer_groups, ws.reg_dec_producer, ws.reg_inc_consumer
            )?;
        }
        Ok(())
    }
}

/// Options recognized when building candidate pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct KernelOptions {
    /// Add the software-pipelined loop schedules to the candidate pools.
    pub enable_alternate_pipelining: bool,
    /// Restrict pools to the single peeled second-dot schedule.
    pub force_single_tile_variant: bool,
}

impl KernelOptions {
    /// Enable the alternate loop schedules.
    #[must_use]
    pub const fn with_alternate_pipelining(mut self) -> Self {
        self.enable_alternate_pipelining = true;
        self
    }

    /// Force the single peeled schedule.
    #[must_use]
    pub const fn with_single_tile_variant(mut self) -> Self {
        self.force_single_tile_variant = true;
        self
    }

    /// Loop schedules candidates are generated for.
    #[must_use]
    pub fn schedules(&self) -> Vec<LoopSchedule> {
        if self.force_single_tile_variant {
            vec![LoopSchedule::SecondDot]
        } else if self.enable_alternate_pipelining {
            vec![LoopSchedule::Default, LoopSchedule::FirstDot, LoopSchedule::SecondDot]
        } else {
            vec![LoopSchedule::Default]
        }
    }
}

/// Tiling of the backward pass.
///
/// The dK/dV sweep holds a key block of `block_n1` rows and walks query
/// blocks of `block_m1`; the dQ sweep holds a query block of `block_m2` rows
/// and walks key blocks of `block_n2`. Blocks on the diagonal are walked in
/// steps divided by `slice_factor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackwardConfig {
    /// Query block of the dK/dV sweep.
    pub block_m1: usize,
    /// Key block held by the dK/dV sweep.
    pub block_n1: usize,
    /// Query block held by the dQ sweep.
    pub block_m2: usize,
    /// Key block of the dQ sweep.
    pub block_n2: usize,
    /// Divisor applied to step sizes on the diagonal.
    pub slice_factor: usize,
    /// Rows per block of the `Delta` preprocessing step.
    pub pre_block: usize,
}

impl Default for BackwardConfig {
    fn default() -> Self {
        Self {
            block_m1: 32,
            block_n1: 128,
            block_m2: 128,
            block_n2: 32,
            slice_factor: 2,
            pre_block: 128,
        }
    }
}

impl BackwardConfig {
    /// Scale every block down for short sequences, keeping the ratios.
    #[must_use]
    pub const fn with_blocks(mut self, block_m1: usize, block_n1: usize) -> Self {
        self.block_m1 = block_m1;
        self.block_n1 = block_n1;
        self.block_m2 = block_n1;
        self.block_n2 = block_m1;
        self
    }

    /// Set the diagonal slice factor.
    #[must_use]
    pub const fn with_slice_factor(mut self, slice_factor: usize) -> Self {
        self.slice_factor = slice_factor;
        self
    }

    /// Step of the masked part of the dK/dV sweep.
    #[must_use]
    pub const fn mask_block_m1(&self) -> usize {
        self.block_m1 / self.slice_factor
    }

    /// Step of the masked part of the dQ sweep.
    #[must_use]
    pub const fn mask_block_n2(&self) -> usize {
        self.block_n2 / self.slice_factor
    }

    /// Check block divisibility.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBackwardTiling`] naming the broken rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let blocks = [self.block_m1, self.block_n1, self.block_m2, self.block_n2, self.pre_block];
        if blocks.iter().any(|b| *b == 0 || !b.is_power_of_two()) {
            return Err(ConfigError::InvalidBackwardTiling("block sizes must be powers of 2"));
        }
        if self.block_n1 % self.block_m1 != 0 {
            return Err(ConfigError::InvalidBackwardTiling(
                "block_n1 must be a multiple of block_m1",
            ));
        }
        if self.block_m2 % self.block_n2 != 0 {
            return Err(ConfigError::InvalidBackwardTiling(
                "block_m2 must be a multiple of block_n2",
            ));
        }
        if self.slice_factor == 0
            || self.block_m1 % self.slice_factor != 0
            || self.block_n2 % self.slice_factor != 0
        {
            return Err(ConfigError::InvalidBackwardTiling(
                "slice_factor must divide block_m1 and block_n2",
            ));
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Block size must be a power of 2 and at least [`MIN_BLOCK`].
    #[error("block size {0} must be a power of 2 and at least 16")]
    InvalidBlockSize(usize),
    /// Key tile wider than the head dimension.
    #[error("BLOCK_N {block_n} exceeds head dimension {head_dim}")]
    BlockExceedsHeadDim {
        /// Key tile width.
        block_n: usize,
        /// Head dimension of the problem.
        head_dim: usize,
    },
    /// Causal diagonal needs whole key tiles per query tile.
    #[error("causal tiling needs BLOCK_M {block_m} to be a multiple of BLOCK_N {block_n}")]
    CausalBlockMismatch {
        /// Query tile height.
        block_m: usize,
        /// Key tile width.
        block_n: usize,
    },
    /// Warp count must be a power of 2 up to 16.
    #[error("num_warps {0} must be a power of 2 and at most 16")]
    InvalidWarpCount(usize),
    /// Producer queue needs at least one slot.
    #[error("num_buffers_warp_spec {0} must be at least 1")]
    InvalidBufferCount(usize),
    /// Consumer groups must evenly split the query tile.
    #[error("num_consumer_groups {groups} must be non-zero and divide BLOCK_M {block_m}")]
    InvalidConsumerGroups {
        /// Consumer group count.
        groups: usize,
        /// Query tile height.
        block_m: usize,
    },
    /// Register split that deadlocks the producer/consumer handshake.
    #[error("register split ({producer}, {consumer}) is known to hang")]
    HangingRegisterSplit {
        /// Producer register budget.
        producer: usize,
        /// Consumer register budget.
        consumer: usize,
    },
    /// Peeled first-dot schedule with descriptors and warp specialization.
    #[error("peel_last + FA_firstDot + warp specialization + descriptors produces incorrect results")]
    KnownIncorrectCombination,
    /// Backward tiling violates a divisibility rule.
    #[error("invalid backward tiling: {0}")]
    InvalidBackwardTiling(&'static str),
}
