//! Memory estimation utilities.

use crate::kernels::flash::interop::AttentionShape;
use crate::precision::Precision;

/// Working-set estimate of one attention call, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionMemory {
    /// Q, K and V.
    pub inputs: usize,
    /// Attention output.
    pub output: usize,
    /// f32 row statistics saved for the backward pass.
    pub row_stats: usize,
    /// Per-unit tile state: accumulator, running max/sum and one score tile.
    pub tile_state: usize,
    /// Full `seq × seq` score matrix of the materialized path.
    pub scores: usize,
}

impl AttentionMemory {
    /// Bytes needed by the tiled kernel.
    #[must_use]
    pub const fn tiled(&self) -> usize {
        self.inputs + self.output + self.row_stats + self.tile_state
    }

    /// Bytes needed by direct attention.
    #[must_use]
    pub const fn materialized(&self) -> usize {
        self.inputs + self.output + self.scores
    }
}

/// Estimate the working set of the tiled and materialized attention paths.
///
/// `block_m` is the query tile height; tile state is counted once per
/// (tile, batch·head) unit.
#[must_use]
pub fn estimate_attention_memory(
    shape: &AttentionShape,
    precision: Precision,
    block_m: usize,
) -> AttentionMemory {
    let (b, h, n, d) = shape.dims4();
    let f32_bytes = Precision::F32.size_in_bytes();
    let tensor = b * h * n * d * precision.size_in_bytes();
    let units = b * h * n.div_ceil(block_m.max(1));

    // Accumulator and score tile are f32 regardless of storage precision.
    let per_unit =
        block_m * d * f32_bytes + 2 * block_m * f32_bytes + block_m * block_m * f32_bytes;

    AttentionMemory {
        inputs: 3 * tensor,
        output: tensor,
        row_stats: b * h * n * f32_bytes,
        tile_state: units * per_unit,
        scores: b * h * n * n * f32_bytes,
    }
}

/// Format a byte count with a binary unit.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}
