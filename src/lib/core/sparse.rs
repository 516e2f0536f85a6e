//! Sparse matrix utilities shared across scSNV

use crate::core::error::{Result, ScsnvError};
use nalgebra_sparse::CsrMatrix;
use rayon::prelude::*;

pub struct SparseOps;

impl SparseOps {
    /// Row sums (per cell), saturating at `u32::MAX`.
    pub fn compute_row_sums(matrix: &CsrMatrix<u32>) -> Vec<u32> {
        (0..matrix.nrows())
            .into_par_iter()
            .map(|row_idx| {
                let row = matrix.row(row_idx);
                row.values()
                    .iter()
                    .fold(0u64, |acc, &val| acc.saturating_add(val as u64))
                    .min(u32::MAX as u64) as u32
            })
            .collect()
    }

    /// Column sums (per site) using a chunked parallel reduction over the CSR rows.
    pub fn compute_col_sums(matrix: &CsrMatrix<u32>) -> Vec<u32> {
        let ncols = matrix.ncols();
        let chunk_size = std::cmp::max(1, matrix.nrows() / rayon::current_num_threads().max(1));

        (0..matrix.nrows())
            .into_par_iter()
            .chunks(chunk_size)
            .map(|chunk| {
                let mut local_sums = vec![0u64; ncols];
                for row_idx in chunk {
                    let row = matrix.row(row_idx);
                    for (&col_idx, &val) in row.col_indices().iter().zip(row.values()) {
                        local_sums[col_idx] = local_sums[col_idx].saturating_add(val as u64);
                    }
                }
                local_sums
            })
            .reduce(
                || vec![0u64; ncols],
                |mut acc, local| {
                    for (i, val) in local.into_iter().enumerate() {
                        acc[i] = acc[i].saturating_add(val);
                    }
                    acc
                },
            )
            .into_iter()
            .map(|sum| (sum.min(u32::MAX as u64)) as u32)
            .collect()
    }

    /// Grand total of all stored values.
    pub fn total(matrix: &CsrMatrix<u32>) -> u64 {
        matrix.values().iter().map(|&v| v as u64).sum()
    }

    /// Transpose so that sites become rows.
    pub fn transpose_u32(matrix: &CsrMatrix<u32>) -> CsrMatrix<u32> {
        matrix.transpose()
    }

    /// Get matrix density statistics
    pub fn get_density_stats(matrix: &CsrMatrix<u32>) -> (f64, usize, usize) {
        let total_elements = matrix.nrows() * matrix.ncols();
        let nnz = matrix.nnz();
        let density = if total_elements > 0 {
            nnz as f64 / total_elements as f64
        } else {
            0.0
        };
        (density, nnz, total_elements)
    }
}

/// Incremental CSR construction from entries arriving in (row, col) order.
///
/// Zero values are skipped so the result never stores explicit zeros.
#[derive(Debug)]
pub struct CsrAssembler {
    nrows: usize,
    ncols: usize,
    row_offsets: Vec<usize>,
    col_indices: Vec<usize>,
    values: Vec<u32>,
    last: Option<(usize, usize)>,
}

impl CsrAssembler {
    pub fn with_capacity(nrows: usize, ncols: usize, nnz_hint: usize) -> Self {
        let mut row_offsets = Vec::with_capacity(nrows + 1);
        row_offsets.push(0);
        Self {
            nrows,
            ncols,
            row_offsets,
            col_indices: Vec::with_capacity(nnz_hint),
            values: Vec::with_capacity(nnz_hint),
            last: None,
        }
    }

    pub fn push(&mut self, row: usize, col: usize, value: u32) -> Result<()> {
        if row >= self.nrows || col >= self.ncols {
            return Err(ScsnvError::InvalidInput(format!(
                "Index ({}, {}) exceeds matrix dimensions ({}, {})",
                row, col, self.nrows, self.ncols
            )));
        }
        if let Some(last) = self.last {
            if (row, col) <= last {
                return Err(ScsnvError::SparseMatrix(format!(
                    "Entry ({}, {}) arrived after ({}, {})",
                    row, col, last.0, last.1
                )));
            }
        }
        self.last = Some((row, col));

        if value == 0 {
            return Ok(());
        }
        while self.row_offsets.len() <= row {
            self.row_offsets.push(self.col_indices.len());
        }
        self.col_indices.push(col);
        self.values.push(value);
        Ok(())
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    pub fn finish(mut self) -> Result<CsrMatrix<u32>> {
        while self.row_offsets.len() <= self.nrows {
            self.row_offsets.push(self.col_indices.len());
        }
        Ok(CsrMatrix::try_from_csr_data(
            self.nrows,
            self.ncols,
            self.row_offsets,
            self.col_indices,
            self.values,
        )?)
    }
}
