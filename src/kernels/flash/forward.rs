// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Tiled forward pass.
//!
//! Every `(batch·head, query tile)` pair is an independent unit of work. A
//! unit walks the key tiles produced by [`KeyTilePlan`], folding each one into
//! a [`StreamingSoftmax`], and finally writes its output rows and base-2
//! row statistics.
//!
//! The variants only differ in how K/V tiles reach the compute step (in
//! place, through a [`TileDescriptor`], or through the two-stage pipeline) and
//! in the order the two matrix multiplies of neighbouring tiles are issued.
//! The per-row arithmetic is shared, so all variants produce bit-identical
//! results for the same tile configuration.

use std::borrow::Cow;

use rayon::prelude::*;

use super::config::{KernelConfig, LoopSchedule};
use super::descriptor::TileDescriptor;
use super::pipeline::run_pipelined;
use crate::error::{FlashbenchError, Result};
use crate::kernels::softmax::{block_logits, CausalMask, StreamingSoftmax, TileProbs};
use crate::precision::Precision;

/// Problem description shared by the forward and backward passes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttentionProblem {
    /// Batch size.
    pub batch: usize,
    /// Number of heads.
    pub heads: usize,
    /// Sequence length.
    pub seq_len: usize,
    /// Head dimension.
    pub head_dim: usize,
    /// Softmax temperature applied to `q·k`.
    pub sm_scale: f32,
    /// Whether row `i` only attends to columns `<= i`.
    pub causal: bool,
    /// Storage precision of the inputs.
    pub precision: Precision,
}

impl AttentionProblem {
    /// Number of `(batch, head)` slices.
    #[must_use]
    pub const fn batch_heads(&self) -> usize {
        self.batch * self.heads
    }

    /// Elements in one `(seq, head_dim)` slice.
    #[must_use]
    pub const fn head_len(&self) -> usize {
        self.seq_len * self.head_dim
    }

    /// Elements in one `(batch, heads, seq, head_dim)` tensor.
    #[must_use]
    pub const fn numel(&self) -> usize {
        self.batch_heads() * self.head_len()
    }

    pub(crate) fn check_buffer(&self, name: &str, buf: &[f32], expected: usize) -> Result<()> {
        if buf.len() == expected {
            Ok(())
        } else {
            Err(FlashbenchError::InvalidConfig(format!(
                "{name} buffer holds {} elements, expected {expected}",
                buf.len()
            )))
        }
    }
}

/// Output of the forward pass as host buffers.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardResult {
    /// `(batch, heads, seq, head_dim)` output, row-major.
    pub output: Vec<f32>,
    /// `(batch, heads, seq)` base-2 log-sum-exp per query row.
    pub row_stats: Vec<f32>,
}

/// Masking regime of a range of key tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    /// Keys strictly before the query tile, visible to every row.
    Unmasked,
    /// Keys overlapping the query tile, masked element-wise.
    Diagonal,
    /// No keys left.
    Done,
}

/// One key tile of the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyTile {
    /// First key index.
    pub start: usize,
    /// Number of keys, shorter than `block_n` on ragged tails.
    pub len: usize,
    /// Whether the causal mask applies.
    pub masked: bool,
}

/// Key tiles visited by one query tile, in sweep order.
#[derive(Debug, Clone)]
pub struct KeyTilePlan {
    region: Region,
    next: usize,
    region_end: usize,
    diagonal_end: usize,
    block_n: usize,
    causal: bool,
}

impl KeyTilePlan {
    /// Plan for the query tile starting at `q_start`.
    #[must_use]
    pub fn new(
        q_start: usize,
        block_m: usize,
        block_n: usize,
        seq_len: usize,
        causal: bool,
    ) -> Self {
        let (region_end, diagonal_end) = if causal {
            (q_start, (q_start + block_m).min(seq_len))
        } else {
            (seq_len, seq_len)
        };
        Self {
            region: Region::Unmasked,
            next: 0,
            region_end,
            diagonal_end,
            block_n,
            causal,
        }
    }
}

impl Iterator for KeyTilePlan {
    type Item = KeyTile;

    fn next(&mut self) -> Option<KeyTile> {
        loop {
            match self.region {
                Region::Done => return None,
                _ if self.next < self.region_end => {
                    let len = self.block_n.min(self.region_end - self.next);
                    let tile = KeyTile {
                        start: self.next,
                        len,
                        masked: self.region == Region::Diagonal,
                    };
                    self.next += len;
                    return Some(tile);
                }
                Region::Unmasked if self.causal => {
                    self.region = Region::Diagonal;
                    self.region_end = self.diagonal_end;
                }
                _ => self.region = Region::Done,
            }
        }
    }
}

/// A K/V tile ready for the compute step.
#[derive(Debug, Clone)]
struct LoadedTile<'a> {
    tile: KeyTile,
    keys: Cow<'a, [f32]>,
    values: Cow<'a, [f32]>,
}

/// Where a unit reads its K/V tiles from.
enum KvSource<'a> {
    InPlace {
        keys: &'a [f32],
        values: &'a [f32],
        head_dim: usize,
    },
    Descriptor {
        keys: &'a [f32],
        values: &'a [f32],
        k_desc: TileDescriptor,
        v_desc: TileDescriptor,
    },
}

impl<'a> KvSource<'a> {
    fn new(
        keys: &'a [f32],
        values: &'a [f32],
        problem: &AttentionProblem,
        config: &KernelConfig,
    ) -> Result<Self> {
        let d = problem.head_dim;
        if config.variant().uses_descriptors() {
            let box_rows = config.tile().block_n;
            Ok(Self::Descriptor {
                keys,
                values,
                k_desc: TileDescriptor::new(problem.seq_len, d, box_rows, d)?,
                v_desc: TileDescriptor::new(problem.seq_len, d, box_rows, d)?,
            })
        } else {
            Ok(Self::InPlace {
                keys,
                values,
                head_dim: d,
            })
        }
    }

    /// Borrow or stage the tile.
    fn load(&self, tile: KeyTile) -> Result<LoadedTile<'a>> {
        match *self {
            Self::InPlace { keys, values, head_dim } => {
                let range = tile.start * head_dim..(tile.start + tile.len) * head_dim;
                Ok(LoadedTile {
                    tile,
                    keys: Cow::Borrowed(&keys[range.clone()]),
                    values: Cow::Borrowed(&values[range]),
                })
            }
            Self::Descriptor { keys, values, k_desc, v_desc } => {
                let mut k_buf = Vec::new();
                let mut v_buf = Vec::new();
                k_desc.load(keys, tile.start, 0, &mut k_buf)?;
                v_desc.load(values, tile.start, 0, &mut v_buf)?;
                // Zero-filled padding rows never reach the compute step.
                k_buf.truncate(tile.len * k_desc.box_cols());
                v_buf.truncate(tile.len * v_desc.box_cols());
                Ok(LoadedTile {
                    tile,
                    keys: Cow::Owned(k_buf),
                    values: Cow::Owned(v_buf),
                })
            }
        }
    }
}

/// Softmax state for a contiguous group of query rows.
struct RowGroup<'a> {
    row_start: usize,
    queries: &'a [f32],
    softmax: StreamingSoftmax,
}

/// Compute step for one query tile, split into row groups.
struct QueryTileWorker<'a> {
    head_dim: usize,
    groups: Vec<RowGroup<'a>>,
}

impl<'a> QueryTileWorker<'a> {
    fn new(
        queries: &'a [f32],
        q_start: usize,
        num_groups: usize,
        group_rows: usize,
        problem: &AttentionProblem,
    ) -> Self {
        let d = problem.head_dim;
        let rows = queries.len() / d;
        let groups = (0..num_groups)
            .map(|g| g * group_rows)
            .take_while(|&lo| lo < rows)
            .map(|lo| {
                let hi = (lo + group_rows).min(rows);
                RowGroup {
                    row_start: q_start + lo,
                    queries: &queries[lo * d..hi * d],
                    softmax: StreamingSoftmax::new(hi - lo, d, problem.sm_scale, problem.precision),
                }
            })
            .collect();
        Self { head_dim: d, groups }
    }

    /// First dot: `Q·Kᵀ` per group.
    fn logits(&self, kv: &LoadedTile<'_>) -> Vec<Vec<f32>> {
        self.groups
            .iter()
            .map(|g| block_logits(g.queries, &kv.keys, self.head_dim))
            .collect()
    }

    fn prepare(&mut self, kv: &LoadedTile<'_>, logits: &[Vec<f32>]) -> Vec<TileProbs> {
        self.groups
            .iter_mut()
            .zip(logits)
            .map(|(g, s)| {
                let mask = kv.tile.masked.then_some(CausalMask {
                    row_start: g.row_start,
                    col_start: kv.tile.start,
                });
                g.softmax.prepare(s, kv.tile.len, mask)
            })
            .collect()
    }

    /// Second dot: `P·V` per group.
    fn accumulate(&mut self, kv: &LoadedTile<'_>, probs: &[TileProbs]) {
        for (g, p) in self.groups.iter_mut().zip(probs) {
            g.softmax.accumulate(p, &kv.values);
        }
    }

    fn step(&mut self, kv: &LoadedTile<'_>) {
        let s = self.logits(kv);
        let p = self.prepare(kv, &s);
        self.accumulate(kv, &p);
    }

    fn finish(self) -> (Vec<f32>, Vec<f32>) {
        let mut out = Vec::new();
        let mut stats = Vec::new();
        for g in self.groups {
            let (o, s) = g.softmax.finish();
            out.extend(o);
            stats.extend(s);
        }
        (out, stats)
    }
}

type Pending<'a> = Option<(LoadedTile<'a>, Vec<TileProbs>)>;

/// Drive the key-tile loop of one query tile with the given schedule.
fn run_schedule<'a, I>(
    worker: &mut QueryTileWorker<'_>,
    tiles: I,
    schedule: LoopSchedule,
    peel_last: bool,
) where
    I: Iterator<Item = LoadedTile<'a>>,
{
    let mut tiles = tiles.peekable();
    let mut peeled = None;

    let pending = {
        let body = std::iter::from_fn(|| {
            let kv = tiles.next()?;
            if peel_last && tiles.peek().is_none() {
                peeled = Some(kv);
                return None;
            }
            Some(kv)
        });
        match schedule {
            LoopSchedule::Default => {
                body.for_each(|kv| worker.step(&kv));
                None
            }
            LoopSchedule::FirstDot => {
                first_dot_loop(worker, body);
                None
            }
            LoopSchedule::SecondDot => second_dot_loop(worker, body),
        }
    };

    match (peeled, pending) {
        (Some(last), pending) => {
            let s = worker.logits(&last);
            let p = worker.prepare(&last, &s);
            if let Some((prev, prev_p)) = pending {
                worker.accumulate(&prev, &prev_p);
            }
            worker.accumulate(&last, &p);
        }
        (None, Some((prev, prev_p))) => worker.accumulate(&prev, &prev_p),
        (None, None) => {}
    }
}

/// Issue the next tile's `Q·Kᵀ` before the current tile's `P·V`.
fn first_dot_loop<'a>(
    worker: &mut QueryTileWorker<'_>,
    mut tiles: impl Iterator<Item = LoadedTile<'a>>,
) {
    let Some(mut cur) = tiles.next() else {
        return;
    };
    let mut cur_s = worker.logits(&cur);
    loop {
        let p = worker.prepare(&cur, &cur_s);
        match tiles.next() {
            Some(next) => {
                let next_s = worker.logits(&next);
                worker.accumulate(&cur, &p);
                cur = next;
                cur_s = next_s;
            }
            None => {
                worker.accumulate(&cur, &p);
                return;
            }
        }
    }
}

/// Defer each tile's `P·V` until the next tile's softmax step has run.
///
/// Returns the tile whose `P·V` is still outstanding.
fn second_dot_loop<'a>(
    worker: &mut QueryTileWorker<'_>,
    tiles: impl Iterator<Item = LoadedTile<'a>>,
) -> Pending<'a> {
    let mut pending: Pending<'a> = None;
    for kv in tiles {
        let s = worker.logits(&kv);
        let p = worker.prepare(&kv, &s);
        if let Some((prev, prev_p)) = pending.take() {
            worker.accumulate(&prev, &prev_p);
        }
        pending = Some((kv, p));
    }
    pending
}

/// Output rows and statistics of one unit.
struct UnitResult {
    bh: usize,
    q_start: usize,
    output: Vec<f32>,
    row_stats: Vec<f32>,
}

fn run_unit(
    problem: &AttentionProblem,
    config: &KernelConfig,
    q: &[f32],
    k: &[f32],
    v: &[f32],
    bh: usize,
    q_tile: usize,
) -> Result<UnitResult> {
    let tile = config.tile();
    let d = problem.head_dim;
    let n = problem.seq_len;
    let head = bh * problem.head_len()..(bh + 1) * problem.head_len();
    let (q, k, v) = (&q[head.clone()], &k[head.clone()], &v[head]);

    let q_start = q_tile * tile.block_m;
    let q_end = (q_start + tile.block_m).min(n);
    let queries = &q[q_start * d..q_end * d];

    let (num_groups, group_rows) = match config.warp_spec() {
        Some(ws) => (ws.num_consumer_groups, tile.block_m / ws.num_consumer_groups),
        None => (1, tile.block_m),
    };
    let mut worker = QueryTileWorker::new(queries, q_start, num_groups, group_rows, problem);
    let plan = KeyTilePlan::new(q_start, tile.block_m, tile.block_n, n, problem.causal);
    let source = KvSource::new(k, v, problem, config)?;

    match config.warp_spec() {
        None => {
            let tiles = plan.map(|t| source.load(t)).collect::<Result<Vec<_>>>()?;
            run_schedule(&mut worker, tiles.into_iter(), tile.schedule, tile.peel_last);
        }
        Some(ws) => {
            run_pipelined(
                ws.num_buffers,
                |producer| {
                    for t in plan {
                        if !producer.push(source.load(t)?) {
                            break;
                        }
                    }
                    Ok(())
                },
                |tiles| run_schedule(&mut worker, tiles, tile.schedule, tile.peel_last),
            )?;
        }
    }

    let (output, row_stats) = worker.finish();
    Ok(UnitResult {
        bh,
        q_start,
        output,
        row_stats,
    })
}

/// Run the forward pass over host buffers.
///
/// # Errors
///
/// Returns an error if a buffer has the wrong length, the configuration is
/// invalid for the problem, or a pipeline stage fails.
pub fn flash_forward(
    problem: &AttentionProblem,
    config: &KernelConfig,
    q: &[f32],
    k: &[f32],
    v: &[f32],
) -> Result<ForwardResult> {
    config.validate(problem.head_dim, problem.causal)?;
    let numel = problem.numel();
    problem.check_buffer("q", q, numel)?;
    problem.check_buffer("k", k, numel)?;
    problem.check_buffer("v", v, numel)?;

    let num_q_tiles = config.tile().num_q_tiles(problem.seq_len);
    let units = problem.batch_heads() * num_q_tiles;

    tracing::debug!(
        "flash forward: {} units ({} heads x {} query tiles), {}",
        units,
        problem.batch_heads(),
        num_q_tiles,
        config
    );

    let results = (0..units)
        .into_par_iter()
        .map(|unit| run_unit(problem, config, q, k, v, unit / num_q_tiles, unit % num_q_tiles))
        .collect::<Result<Vec<_>>>()?;

    let d = problem.head_dim;
    let n = problem.seq_len;
    let mut output = vec![0.0f32; numel];
    let mut row_stats = vec![0.0f32; problem.batch_heads() * n];
    for unit in results {
        let rows = unit.row_stats.len();
        let row0 = unit.bh * n + unit.q_start;
        output[row0 * d..(row0 + rows) * d].copy_from_slice(&unit.output);
        row_stats[row0..row0 + rows].copy_from_slice(&unit.row_stats);
    }

    Ok(ForwardResult { output, row_stats })
}
