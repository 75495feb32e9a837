// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Tiled backward pass.
//!
//! Attention weights are never stored by the forward pass. They are
//! recomputed block by block from Q, K and the saved base-2 row statistics:
//!
//! ```text
//! p_ij  = 2^(qk_scale * q_i·k_j - M_i)
//! dV_j += p_ij * dO_i
//! dP_ij = dO_i · v_j
//! dS_ij = p_ij * (dP_ij - Delta_i)
//! dK_j += dS_ij * q_i
//! dQ_i += dS_ij * k_j
//! ```
//!
//! with `Delta_i = O_i · dO_i` computed by a preprocessing step that finishes
//! before the sweeps start. `dK` and `dQ` are scaled by `sm_scale` once at the
//! end.

use rayon::prelude::*;

use super::config::BackwardConfig;
use super::forward::AttentionProblem;
use crate::error::Result;
use crate::kernels::softmax::{dot, LOG2_E};

/// Gradients of the backward pass as host buffers.
#[derive(Debug, Clone, PartialEq)]
pub struct BackwardResult {
    /// Gradient with respect to Q.
    pub dq: Vec<f32>,
    /// Gradient with respect to K.
    pub dk: Vec<f32>,
    /// Gradient with respect to V.
    pub dv: Vec<f32>,
}

/// Saved forward tensors and the incoming gradient.
#[derive(Debug, Clone, Copy)]
pub struct BackwardInputs<'a> {
    /// Queries.
    pub q: &'a [f32],
    /// Keys.
    pub k: &'a [f32],
    /// Values.
    pub v: &'a [f32],
    /// Forward output.
    pub output: &'a [f32],
    /// Gradient of the loss with respect to the output.
    pub d_output: &'a [f32],
    /// Base-2 row statistics saved by the forward pass.
    pub row_stats: &'a [f32],
}

/// `Delta_i = sum_d(O_i * dO_i)` for every row of every `(batch, head)`.
///
/// Rows are processed in blocks of `pre_block`.
#[must_use]
pub fn preprocess_delta(
    output: &[f32],
    d_output: &[f32],
    head_dim: usize,
    pre_block: usize,
) -> Vec<f32> {
    let block_len = pre_block.max(1) * head_dim;
    output
        .par_chunks(block_len)
        .zip(d_output.par_chunks(block_len))
        .map(|(o, d_o)| {
            o.chunks_exact(head_dim)
                .zip(d_o.chunks_exact(head_dim))
                .map(|(o_row, do_row)| dot(o_row, do_row))
                .collect::<Vec<f32>>()
        })
        .flatten_iter()
        .collect()
}

/// One `(batch, head)` slice of every input, plus `Delta`.
struct HeadSlices<'a> {
    q: &'a [f32],
    k: &'a [f32],
    v: &'a [f32],
    d_output: &'a [f32],
    row_stats: &'a [f32],
    delta: &'a [f32],
}

/// Contiguous row range `[start, end)` swept as one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block {
    start: usize,
    end: usize,
    masked: bool,
}

/// Blocks of `step` rows covering `[start, end)`.
fn blocks(start: usize, end: usize, step: usize, masked: bool) -> impl Iterator<Item = Block> {
    (start..end)
        .step_by(step.max(1))
        .map(move |s| Block {
            start: s,
            end: (s + step).min(end),
            masked,
        })
}

/// Query blocks visited by the dK/dV sweep of the key block at `n0`.
fn dkdv_schedule(n0: usize, config: &BackwardConfig, seq_len: usize, causal: bool) -> Vec<Block> {
    if causal {
        let diag_end = (n0 + config.block_n1).min(seq_len);
        blocks(n0, diag_end, config.mask_block_m1(), true)
            .chain(blocks(diag_end, seq_len, config.block_m1, false))
            .collect()
    } else {
        blocks(0, seq_len, config.block_m1, false).collect()
    }
}

/// Key blocks visited by the dQ sweep of the query block at `m0`.
fn dq_schedule(m0: usize, config: &BackwardConfig, seq_len: usize, causal: bool) -> Vec<Block> {
    if causal {
        let diag_end = (m0 + config.block_m2).min(seq_len);
        blocks(m0, diag_end, config.mask_block_n2(), true)
            .chain(blocks(0, m0, config.block_n2, false))
            .collect()
    } else {
        blocks(0, seq_len, config.block_n2, false).collect()
    }
}

/// Recomputed probability of query `i` attending to key `j`.
#[inline]
fn recompute_p(
    problem: &AttentionProblem,
    head: &HeadSlices<'_>,
    i: usize,
    j: usize,
    masked: bool,
) -> f32 {
    if masked && i < j {
        return 0.0;
    }
    let d = problem.head_dim;
    let qk = dot(&head.q[i * d..(i + 1) * d], &head.k[j * d..(j + 1) * d]);
    (qk * (problem.sm_scale * LOG2_E) - head.row_stats[i]).exp2()
}

/// `dK, dV` for keys `[n0, n1)`.
fn dkdv_block(
    problem: &AttentionProblem,
    config: &BackwardConfig,
    head: &HeadSlices<'_>,
    n0: usize,
    n1: usize,
) -> (Vec<f32>, Vec<f32>) {
    let d = problem.head_dim;
    let precision = problem.precision;
    let mut dk = vec![0.0f32; (n1 - n0) * d];
    let mut dv = vec![0.0f32; (n1 - n0) * d];

    for block in dkdv_schedule(n0, config, problem.seq_len, problem.causal) {
        for i in block.start..block.end {
            let q_i = &head.q[i * d..(i + 1) * d];
            let do_i = &head.d_output[i * d..(i + 1) * d];
            let delta_i = head.delta[i];
            for j in n0..n1 {
                let p = recompute_p(problem, head, i, j, block.masked);
                let row = (j - n0) * d..(j - n0 + 1) * d;

                let p_r = precision.round(p);
                for (acc, &x) in dv[row.clone()].iter_mut().zip(do_i) {
                    *acc += p_r * x;
                }

                let dp = dot(do_i, &head.v[j * d..(j + 1) * d]);
                let ds = precision.round(p * (dp - delta_i));
                for (acc, &x) in dk[row].iter_mut().zip(q_i) {
                    *acc += ds * x;
                }
            }
        }
    }

    for x in &mut dk {
        *x *= problem.sm_scale;
    }
    (dk, dv)
}

/// `dQ` for queries `[m0, m1)`.
fn dq_block(
    problem: &AttentionProblem,
    config: &BackwardConfig,
    head: &HeadSlices<'_>,
    m0: usize,
    m1: usize,
) -> Vec<f32> {
    let d = problem.head_dim;
    let mut dq = vec![0.0f32; (m1 - m0) * d];

    for block in dq_schedule(m0, config, problem.seq_len, problem.causal) {
        for i in m0..m1 {
            let do_i = &head.d_output[i * d..(i + 1) * d];
            let delta_i = head.delta[i];
            let dq_i = &mut dq[(i - m0) * d..(i - m0 + 1) * d];
            for j in block.start..block.end {
                let p = recompute_p(problem, head, i, j, block.masked);
                let dp = dot(do_i, &head.v[j * d..(j + 1) * d]);
                let ds = problem.precision.round(p * (dp - delta_i));
                for (acc, &x) in dq_i.iter_mut().zip(&head.k[j * d..(j + 1) * d]) {
                    *acc += ds * x;
                }
            }
        }
    }

    for x in &mut dq {
        *x *= problem.sm_scale;
    }
    dq
}

/// Gradients produced by one program.
struct UnitGrads {
    bh: usize,
    key_block: Option<(usize, Vec<f32>, Vec<f32>)>,
    query_block: Option<(usize, Vec<f32>)>,
}

/// Run the backward pass over host buffers.
///
/// Program `pid` of every `(batch, head)` computes `dK, dV` for key block
/// `pid` and `dQ` for query block `pid`.
///
/// # Errors
///
/// Returns an error if the tiling is invalid or a buffer has the wrong
/// length.
pub fn flash_backward(
    problem: &AttentionProblem,
    config: &BackwardConfig,
    inputs: &BackwardInputs<'_>,
) -> Result<BackwardResult> {
    config.validate()?;
    let numel = problem.numel();
    problem.check_buffer("q", inputs.q, numel)?;
    problem.check_buffer("k", inputs.k, numel)?;
    problem.check_buffer("v", inputs.v, numel)?;
    problem.check_buffer("output", inputs.output, numel)?;
    problem.check_buffer("d_output", inputs.d_output, numel)?;
    problem.check_buffer("row_stats", inputs.row_stats, problem.batch_heads() * problem.seq_len)?;

    let n = problem.seq_len;
    let d = problem.head_dim;

    // Every sweep reads Delta, so it is complete before any of them start.
    let delta = preprocess_delta(inputs.output, inputs.d_output, d, config.pre_block);

    let key_blocks = n.div_ceil(config.block_n1);
    let query_blocks = n.div_ceil(config.block_m2);
    let programs = key_blocks.max(query_blocks);
    let units = problem.batch_heads() * programs;

    tracing::debug!(
        "flash backward: {} units ({} heads x {} programs), BLOCK_M1={}, BLOCK_N1={}, BLOCK_M2={}, BLOCK_N2={}",
        units,
        problem.batch_heads(),
        programs,
        config.block_m1,
        config.block_n1,
        config.block_m2,
        config.block_n2
    );

    let results: Vec<UnitGrads> = (0..units)
        .into_par_iter()
        .map(|unit| {
            let (bh, pid) = (unit / programs, unit % programs);
            let head_range = bh * problem.head_len()..(bh + 1) * problem.head_len();
            let head = HeadSlices {
                q: &inputs.q[head_range.clone()],
                k: &inputs.k[head_range.clone()],
                v: &inputs.v[head_range.clone()],
                d_output: &inputs.d_output[head_range],
                row_stats: &inputs.row_stats[bh * n..(bh + 1) * n],
                delta: &delta[bh * n..(bh + 1) * n],
            };

            let n0 = pid * config.block_n1;
            let key_block = (n0 < n).then(|| {
                let n1 = (n0 + config.block_n1).min(n);
                let (dk, dv) = dkdv_block(problem, config, &head, n0, n1);
                (n0, dk, dv)
            });

            let m0 = pid * config.block_m2;
            let query_block = (m0 < n).then(|| {
                let m1 = (m0 + config.block_m2).min(n);
                (m0, dq_block(problem, config, &head, m0, m1))
            });

            UnitGrads {
                bh,
                key_block,
                query_block,
            }
        })
        .collect();

    let mut grads = BackwardResult {
        dq: vec![0.0; numel],
        dk: vec![0.0; numel],
        dv: vec![0.0; numel],
    };
    for unit in results {
        let base = unit.bh * n * d;
        if let Some((n0, dk, dv)) = unit.key_block {
            let at = base + n0 * d;
            grads.dk[at..at + dk.len()].copy_from_slice(&dk);
            grads.dv[at..at + dv.len()].copy_from_slice(&dv);
        }
        if let Some((m0, dq)) = unit.query_block {
            let at = base + m0 * d;
            grads.dq[at..at + dq.len()].copy_from_slice(&dq);
        }
    }
    Ok(grads)
}
