// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Host model of 2-D tensor-memory descriptors.
//!
//! A descriptor describes a row-major global matrix and a fixed box shape.
//! Loading copies one box at a given coordinate into a staging buffer; rows
//! past the end of the matrix are zero-filled, the way a hardware bulk copy
//! treats out-of-bounds coordinates.

use crate::error::{FlashbenchError, Result};

/// Descriptor over a row-major `rows × cols` matrix with a fixed box shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileDescriptor {
    rows: usize,
    cols: usize,
    box_rows: usize,
    box_cols: usize,
}

impl TileDescriptor {
    /// Create a descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`FlashbenchError::InvalidConfig`] if the box is empty or wider
    /// than the matrix.
    pub fn new(rows: usize, cols: usize, box_rows: usize, box_cols: usize) -> Result<Self> {
        if box_rows == 0 || box_cols == 0 {
            return Err(FlashbenchError::InvalidConfig(format!(
                "descriptor box must be non-empty, got {box_rows}x{box_cols}"
            )));
        }
        if box_cols > cols {
            return Err(FlashbenchError::InvalidConfig(format!(
                "descriptor box width {box_cols} exceeds matrix width {cols}"
            )));
        }
        Ok(Self {
            rows,
            cols,
            box_rows,
            box_cols,
        })
    }

    /// Box height.
    #[must_use]
    pub const fn box_rows(&self) -> usize {
        self.box_rows
    }

    /// Box width.
    #[must_use]
    pub const fn box_cols(&self) -> usize {
        self.box_cols
    }

    /// Copy the box whose top-left corner is `(row, col)` into `staging`.
    ///
    /// `staging` is resized to `box_rows × box_cols`. Returns the number of
    /// rows that lie inside the matrix.
    ///
    /// # Errors
    ///
    /// Returns [`FlashbenchError::ShapeMismatch`] if `src` does not hold the
    /// described matrix, or [`FlashbenchError::InvalidConfig`] if the box
    /// crosses the right edge.
    pub fn load(
        &self,
        src: &[f32],
        row: usize,
        col: usize,
        staging: &mut Vec<f32>,
    ) -> Result<usize> {
        if src.len() != self.rows * self.cols {
            return Err(FlashbenchError::ShapeMismatch {
                expected: vec![self.rows, self.cols],
                actual: vec![src.len()],
            });
        }
        if col + self.box_cols > self.cols {
            return Err(FlashbenchError::InvalidConfig(format!(
                "box at column {col} crosses matrix width {}",
                self.cols
            )));
        }

        staging.clear();
        staging.resize(self.box_rows * self.box_cols, 0.0);

        let valid = self.rows.saturating_sub(row).min(self.box_rows);
        for r in 0..valid {
            let from = (row + r) * self.cols + col;
            staging[r * self.box_cols..(r + 1) * self.box_cols]
                .copy_from_slice(&src[from..from + self.box_cols]);
        }
        Ok(valid)
    }
}
