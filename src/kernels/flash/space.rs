// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Candidate pools for autotuning.
//!
//! [`ConfigSpace`] enumerates the tuning grid of one kernel variant and
//! filters it with two pure predicates: [`KernelConfig::validate`] for
//! correctness and [`KernelConfig::is_efficient`] for occupancy. The
//! surviving configurations form an immutable [`CandidatePool`].

use super::config::{KernelConfig, KernelOptions, KernelVariant, TileConfig, WarpSpecConfig};

/// Register splits tried by the warp-specialized kernel.
const WS_REGISTER_SPLITS: [(usize, usize); 2] = [(24, 240), (40, 232)];

/// Register splits tried by the descriptor-backed warp-specialized kernel.
const DESCRIPTOR_WS_REGISTER_SPLITS: [(usize, usize); 1] = [(24, 240)];

/// Tuning grid for one kernel variant.
#[derive(Debug, Clone, Copy)]
pub struct ConfigSpace {
    variant: KernelVariant,
    options: KernelOptions,
}

impl ConfigSpace {
    /// Grid of `variant` under `options`.
    #[must_use]
    pub const fn new(variant: KernelVariant, options: KernelOptions) -> Self {
        Self { variant, options }
    }

    /// Variant this grid belongs to.
    #[must_use]
    pub const fn variant(&self) -> KernelVariant {
        self.variant
    }

    /// Every configuration of the grid, before filtering.
    #[must_use]
    pub fn enumerate(&self) -> Vec<KernelConfig> {
        let peel_last = self.options.force_single_tile_variant;
        let schedules = self.options.schedules();

        match self.variant {
            // The baseline kernel has a single loop body and only tunes tiling.
            KernelVariant::Baseline => {
                let mut configs = Vec::new();
                for block_m in [64, 128] {
                    for block_n in [64, 128] {
                        for num_stages in [3, 4, 7] {
                            for num_warps in [4, 8] {
                                let tile = TileConfig::default()
                                    .with_blocks(block_m, block_n)
                                    .with_stages(num_stages)
                                    .with_warps(num_warps)
                                    .with_peel_last(peel_last);
                                configs.push(KernelConfig::Baseline(tile));
                            }
                        }
                    }
                }
                configs
            }
            KernelVariant::Pipelined | KernelVariant::HardwareDescriptor => schedules
                .iter()
                .map(|&schedule| {
                    let num_stages = if schedule.is_pipelined() { 4 } else { 3 };
                    let tile = TileConfig::default()
                        .with_blocks(128, 128)
                        .with_warps(8)
                        .with_stages(num_stages)
                        .with_schedule(schedule)
                        .with_peel_last(peel_last);
                    if self.variant == KernelVariant::Pipelined {
                        KernelConfig::Pipelined(tile)
                    } else {
                        KernelConfig::HardwareDescriptor(tile)
                    }
                })
                .collect(),
            KernelVariant::WarpSpecialized | KernelVariant::HardwareDescriptorWarpSpecialized => {
                let splits: &[(usize, usize)] = if self.variant == KernelVariant::WarpSpecialized {
                    &WS_REGISTER_SPLITS
                } else {
                    &DESCRIPTOR_WS_REGISTER_SPLITS
                };
                let mut configs = Vec::new();
                for &schedule in &schedules {
                    let num_stages = if schedule.is_pipelined() { 2 } else { 0 };
                    for &(reg_dec_producer, reg_inc_consumer) in splits {
                        let ws = WarpSpecConfig {
                            tile: TileConfig::default()
                                .with_blocks(128, 128)
                                .with_warps(4)
                                .with_stages(num_stages)
                                .with_schedule(schedule)
                                .with_peel_last(peel_last),
                            num_buffers: 2,
                            num_consumer_groups: 2,
                            reg_dec_producer,
                            reg_inc_consumer,
                        };
                        configs.push(if self.variant == KernelVariant::WarpSpecialized {
                            KernelConfig::WarpSpecialized(ws)
                        } else {
                            KernelConfig::HardwareDescriptorWarpSpecialized(ws)
                        });
                    }
                }
                configs
            }
        }
    }

    /// Filter the grid for a problem.
    #[must_use]
    pub fn build(&self, head_dim: usize, causal: bool) -> CandidatePool {
        let all = self.enumerate();
        let total = all.len();
        let configs: Vec<KernelConfig> = all
            .into_iter()
            .filter(|c| keep(c, head_dim, causal))
            .collect();

        tracing::debug!(
            "config space {}: kept {} of {} candidates (head_dim={}, causal={})",
            self.variant,
            configs.len(),
            total,
            head_dim,
            causal
        );

        CandidatePool {
            variant: self.variant,
            configs,
        }
    }
}

/// Pool filter: correct for the problem and able to keep its warps busy.
#[must_use]
pub fn keep(config: &KernelConfig, head_dim: usize, causal: bool) -> bool {
    config.validate(head_dim, causal).is_ok() && config.is_efficient()
}

/// Validated, immutable list of configurations for one variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePool {
    variant: KernelVariant,
    configs: Vec<KernelConfig>,
}

impl CandidatePool {
    /// Variant of every configuration in the pool.
    #[must_use]
    pub const fn variant(&self) -> KernelVariant {
        self.variant
    }

    /// Configurations in enumeration order.
    #[must_use]
    pub fn configs(&self) -> &[KernelConfig] {
        &self.configs
    }

    /// Number of candidates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.configs.len()
    }

    /// Whether filtering removed every candidate.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// Iterate over the candidates.
    pub fn iter(&self) -> std::slice::Iter<'_, KernelConfig> {
        self.configs.iter()
    }
}

impl<'a> IntoIterator for &'a CandidatePool {
    type Item = &'a KernelConfig;
    type IntoIter = std::slice::Iter<'a, KernelConfig>;

    fn into_iter(self) -> Self::IntoIter {
        self.configs.iter()
    }
}
