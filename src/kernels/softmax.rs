// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Streaming (online) softmax.
//!
//! Folds one block of logits at a time into per-row running statistics so the
//! full `seq × seq` score matrix is never materialized:
//!
//! ```text
//! m_new = max(m_old, rowmax(s))
//! p     = 2^(s - m_new)
//! alpha = 2^(m_old - m_new)
//! l     = l * alpha + rowsum(p)
//! acc   = acc * alpha + p @ V
//! ```
//!
//! Everything runs in the base-2 domain: logits are prescaled by
//! `sm_scale * log2(e)` so `exp2` can replace `exp`. The result is identical
//! to natural-log softmax.
//!
//! The update is split into [`StreamingSoftmax::prepare`], which advances
//! `m` and `l` and produces the block probabilities, and
//! [`StreamingSoftmax::accumulate`], which folds `P @ V` into the accumulator.
//! Loop schedules may interleave the two steps of neighbouring tiles as long
//! as each tile's `accumulate` runs before the next tile's.

use crate::precision::Precision;

/// `log2(e)`, the prescale that turns `exp` into `exp2`.
pub const LOG2_E: f32 = std::f32::consts::LOG2_E;

/// Additive sentinel for masked logits.
///
/// A finite value keeps `max` and `exp2` free of NaN; `2^-1e6` is exactly zero
/// in f32.
pub const MASK_SENTINEL: f32 = -1.0e6;

/// Causal mask placement for one block of logits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CausalMask {
    /// Absolute sequence index of the first row in the block.
    pub row_start: usize,
    /// Absolute sequence index of the first column in the block.
    pub col_start: usize,
}

impl CausalMask {
    /// Whether row `r` may attend to column `c` (block-relative indices).
    #[inline]
    #[must_use]
    pub const fn allows(&self, r: usize, c: usize) -> bool {
        self.row_start + r >= self.col_start + c
    }
}

/// Probabilities and rescale factors of one prepared block.
#[derive(Debug, Clone)]
pub struct TileProbs {
    cols: usize,
    p: Vec<f32>,
    alpha: Vec<f32>,
}

impl TileProbs {
    /// Number of key columns in the block.
    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Row-major `rows × cols` probabilities (unnormalized).
    #[must_use]
    pub fn probs(&self) -> &[f32] {
        &self.p
    }
}

/// Running softmax state for one query tile.
#[derive(Debug, Clone)]
pub struct StreamingSoftmax {
    rows: usize,
    head_dim: usize,
    qk_scale: f32,
    precision: Precision,
    m: Vec<f32>,
    l: Vec<f32>,
    acc: Vec<f32>,
}

impl StreamingSoftmax {
    /// Create the state for `rows` query rows.
    ///
    /// `sm_scale` is the natural softmax temperature (usually `1/sqrt(d)`).
    #[must_use]
    pub fn new(rows: usize, head_dim: usize, sm_scale: f32, precision: Precision) -> Self {
        Self {
            rows,
            head_dim,
            qk_scale: sm_scale * LOG2_E,
            precision,
            m: vec![f32::NEG_INFINITY; rows],
            l: vec![0.0; rows],
            acc: vec![0.0; rows * head_dim],
        }
    }

    /// Running maxima (base-2 domain).
    #[must_use]
    pub fn row_max(&self) -> &[f32] {
        &self.m
    }

    /// Running normalizers.
    #[must_use]
    pub fn row_sum(&self) -> &[f32] {
        &self.l
    }

    /// Advance `m` and `l` with a block of raw `q·k` logits (`rows × cols`).
    ///
    /// # Panics
    ///
    /// Panics if `logits.len() != rows * cols`.
    pub fn prepare(&mut self, logits: &[f32], cols: usize, mask: Option<CausalMask>) -> TileProbs {
        assert_eq!(logits.len(), self.rows * cols, "logit block has wrong size");

        let mut p = vec![0.0f32; self.rows * cols];
        let mut alpha = vec![0.0f32; self.rows];

        for r in 0..self.rows {
            let row = &logits[r * cols..(r + 1) * cols];
            let out = &mut p[r * cols..(r + 1) * cols];
            let m_old = self.m[r];

            let m_new = match mask {
                None => {
                    let block_max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
                    let m_new = m_old.max(block_max * self.qk_scale);
                    for (o, &x) in out.iter_mut().zip(row) {
                        *o = x * self.qk_scale - m_new;
                    }
                    m_new
                }
                Some(mask) => {
                    for (c, (o, &x)) in out.iter_mut().zip(row).enumerate() {
                        let bias = if mask.allows(r, c) { 0.0 } else { MASK_SENTINEL };
                        *o = x * self.qk_scale + bias;
                    }
                    let block_max = out.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
                    let m_new = m_old.max(block_max);
                    for o in out.iter_mut() {
                        *o -= m_new;
                    }
                    m_new
                }
            };

            let mut row_sum = 0.0f32;
            for o in out.iter_mut() {
                *o = o.exp2();
                row_sum += *o;
            }

            let a = (m_old - m_new).exp2();
            self.l[r] = self.l[r] * a + row_sum;
            self.m[r] = m_new;
            alpha[r] = a;
        }

        TileProbs { cols, p, alpha }
    }

    /// Fold `P @ V` of a prepared block into the accumulator.
    ///
    /// `values` is the row-major `cols × head_dim` value tile.
    ///
    /// # Panics
    ///
    /// Panics if `values` does not hold `cols × head_dim` elements.
    pub fn accumulate(&mut self, probs: &TileProbs, values: &[f32]) {
        let cols = probs.cols;
        let d = self.head_dim;
        assert_eq!(values.len(), cols * d, "value tile has wrong size");

        let mut pv = vec![0.0f32; d];
        for r in 0..self.rows {
            pv.fill(0.0);
            for c in 0..cols {
                let w = self.precision.round(probs.p[r * cols + c]);
                let v_row = &values[c * d..(c + 1) * d];
                for (acc, &v) in pv.iter_mut().zip(v_row) {
                    *acc += w * v;
                }
            }
            let a = probs.alpha[r];
            for (acc, &x) in self.acc[r * d..(r + 1) * d].iter_mut().zip(&pv) {
                *acc = *acc * a + x;
            }
        }
    }

    /// Process one block end to end.
    pub fn update(
        &mut self,
        logits: &[f32],
        cols: usize,
        mask: Option<CausalMask>,
        values: &[f32],
    ) {
        let probs = self.prepare(logits, cols, mask);
        self.accumulate(&probs, values);
    }

    /// Normalize the accumulator and produce the base-2 log-sum-exp per row.
    ///
    /// Returns `(output, row_stats)` where `output` is `rows × head_dim`.
    #[must_use]
    pub fn finish(self) -> (Vec<f32>, Vec<f32>) {
        let d = self.head_dim;
        let mut out = self.acc;
        let mut stats = self.m;
        for (r, stat) in stats.iter_mut().enumerate() {
            let l = self.l[r];
            *stat += l.log2();
            for x in &mut out[r * d..(r + 1) * d] {
                *x /= l;
            }
        }
        (out, stats)
    }
}

/// Raw logits `Q_tile · K_tileᵀ` for row-major tiles.
///
/// `queries` is `rows × head_dim`, `keys` is `cols × head_dim`; returns
/// `rows × cols`.
#[must_use]
pub fn block_logits(queries: &[f32], keys: &[f32], head_dim: usize) -> Vec<f32> {
    let rows = queries.len() / head_dim;
    let cols = keys.len() / head_dim;
    let mut out = Vec::with_capacity(rows * cols);
    for q in queries.chunks_exact(head_dim) {
        for k in keys.chunks_exact(head_dim) {
            out.push(dot(q, k));
        }
    }
    out
}

/// Sequential dot product; the fixed summation order keeps results reproducible.
#[inline]
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).fold(0.0, |acc, (x, y)| acc + x * y)
}
