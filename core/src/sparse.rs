//! Sparse vectors and matrices for per-DAI training.
//!
//! A [`CsrMatrix`] holds the training rows of one classifier and supports
//! the operations the trainer needs: per-column occupancy counts, column
//! zeroing for adaptive pruning, clipping of non-finite values, zero
//! elimination, row resampling for class balancing, and densification for
//! the tree learner. Matrices live only for the duration of one DAI's
//! training; the long-lived state is the [`SparseVec`] coefficient vectors.

use serde::{Deserialize, Serialize};

/// Finite bound that NaN and infinite feature values are cropped to.
pub const FINITE_BOUND: f64 = 1e12;

/// Crop a value to a finite range: NaN becomes the positive bound,
/// infinities saturate.
pub fn crop_to_finite(value: f64) -> f64 {
    if value.is_nan() {
        FINITE_BOUND
    } else {
        value.clamp(-FINITE_BOUND, FINITE_BOUND)
    }
}

/// A sparse vector: parallel index/value arrays sorted by index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseVec {
    idxs: Vec<usize>,
    vals: Vec<f64>,
}

impl SparseVec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(index, value)` pairs; zero values are dropped.
    pub fn from_pairs(mut pairs: Vec<(usize, f64)>) -> Self {
        pairs.retain(|(_, v)| *v != 0.0);
        pairs.sort_by_key(|(i, _)| *i);
        Self {
            idxs: pairs.iter().map(|(i, _)| *i).collect(),
            vals: pairs.iter().map(|(_, v)| *v).collect(),
        }
    }

    /// Build from a dense slice, keeping nonzero entries.
    pub fn from_dense(dense: &[f64]) -> Self {
        let pairs = dense
            .iter()
            .enumerate()
            .filter(|(_, v)| **v != 0.0)
            .map(|(i, v)| (i, *v))
            .collect();
        Self::from_pairs(pairs)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.idxs.iter().copied().zip(self.vals.iter().copied())
    }

    pub fn nnz(&self) -> usize {
        self.idxs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idxs.is_empty()
    }

    pub fn nonzero_idxs(&self) -> &[usize] {
        &self.idxs
    }

    /// Dot product with a dense vector; indices beyond its length
    /// contribute nothing.
    pub fn dot_dense(&self, dense: &[f64]) -> f64 {
        self.iter()
            .map(|(i, v)| v * dense.get(i).copied().unwrap_or(0.0))
            .sum()
    }

    /// Remap indices through `old2new`, dropping entries with no mapping.
    pub fn remap(&self, old2new: &ahash::AHashMap<usize, usize>) -> Self {
        let pairs = self
            .iter()
            .filter_map(|(i, v)| old2new.get(&i).map(|ni| (*ni, v)))
            .collect();
        Self::from_pairs(pairs)
    }
}

/// A compressed sparse row matrix with an explicit column count.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CsrMatrix {
    n_cols: usize,
    indptr: Vec<usize>,
    indices: Vec<usize>,
    data: Vec<f64>,
}

impl CsrMatrix {
    pub fn new(n_cols: usize) -> Self {
        Self {
            n_cols,
            indptr: vec![0],
            indices: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Append a row given as sorted `(column, value)` pairs.
    pub fn push_row(&mut self, pairs: &[(usize, f64)]) {
        for (col, val) in pairs {
            debug_assert!(*col < self.n_cols);
            self.indices.push(*col);
            self.data.push(*val);
        }
        self.indptr.push(self.indices.len());
    }

    pub fn n_rows(&self) -> usize {
        self.indptr.len() - 1
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    pub fn row(&self, row: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let span = self.indptr[row]..self.indptr[row + 1];
        self.indices[span.clone()]
            .iter()
            .copied()
            .zip(self.data[span].iter().copied())
    }

    /// Count entries per column that are finite and nonzero.
    pub fn column_occupancy(&self) -> Vec<usize> {
        let mut counts = vec![0; self.n_cols];
        for (col, val) in self.indices.iter().zip(self.data.iter()) {
            if val.is_finite() && *val != 0.0 {
                counts[*col] += 1;
            }
        }
        counts
    }

    /// Zero every entry of the marked columns, crop the rest to a finite
    /// range, and drop the zeros from storage.
    pub fn zero_columns_and_crop(&mut self, zeroed: &[bool]) {
        for (col, val) in self.indices.iter().zip(self.data.iter_mut()) {
            if zeroed[*col] {
                *val = 0.0;
            } else {
                *val = crop_to_finite(*val);
            }
        }
        self.eliminate_zeros();
    }

    /// Rebuild storage without explicit zeros.
    pub fn eliminate_zeros(&mut self) {
        let mut indptr = Vec::with_capacity(self.indptr.len());
        let mut indices = Vec::with_capacity(self.indices.len());
        let mut data = Vec::with_capacity(self.data.len());
        indptr.push(0);
        for row in 0..self.n_rows() {
            for (col, val) in self.row(row) {
                if val != 0.0 {
                    indices.push(col);
                    data.push(val);
                }
            }
            indptr.push(indices.len());
        }
        self.indptr = indptr;
        self.indices = indices;
        self.data = data;
    }

    /// A new matrix whose rows are the given rows of this one, in order.
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        let mut out = Self::new(self.n_cols);
        for &row in rows {
            let pairs: Vec<(usize, f64)> = self.row(row).collect();
            out.push_row(&pairs);
        }
        out
    }

    /// Dense row-major copy, for learners that need dense input.
    pub fn to_dense_rows(&self) -> Vec<Vec<f64>> {
        (0..self.n_rows())
            .map(|row| {
                let mut dense = vec![0.0; self.n_cols];
                for (col, val) in self.row(row) {
                    dense[col] += val;
                }
                dense
            })
            .collect()
    }

    /// `w · x_row + b` for a dense weight vector.
    pub fn row_score(&self, row: usize, weights: &[f64], bias: f64) -> f64 {
        bias + self
            .row(row)
            .map(|(col, val)| weights[col] * val)
            .sum::<f64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CsrMatrix {
        let mut m = CsrMatrix::new(3);
        m.push_row(&[(0, 1.0), (2, 2.0)]);
        m.push_row(&[(0, f64::NAN)]);
        m.push_row(&[(1, f64::INFINITY), (2, 3.0)]);
        m
    }

    #[test]
    fn occupancy_skips_non_finite() {
        let counts = sample().column_occupancy();
        assert_eq!(counts, vec![1, 0, 2]);
    }

    #[test]
    fn zeroing_and_cropping() {
        let mut m = sample();
        m.zero_columns_and_crop(&[false, true, false]);
        // NaN cropped to the bound, infinity column zeroed out.
        let row1: Vec<_> = m.row(1).collect();
        assert_eq!(row1, vec![(0, FINITE_BOUND)]);
        let row2: Vec<_> = m.row(2).collect();
        assert_eq!(row2, vec![(2, 3.0)]);
        assert_eq!(m.nnz(), 4);
    }

    #[test]
    fn crop_to_finite_bounds() {
        assert_eq!(crop_to_finite(f64::NAN), FINITE_BOUND);
        assert_eq!(crop_to_finite(f64::NEG_INFINITY), -FINITE_BOUND);
        assert_eq!(crop_to_finite(1.5), 1.5);
    }

    #[test]
    fn sparse_vec_dot_and_remap() {
        let v = SparseVec::from_pairs(vec![(2, 0.5), (0, 1.0), (1, 0.0)]);
        assert_eq!(v.nnz(), 2);
        assert!((v.dot_dense(&[2.0, 9.0, 4.0]) - 4.0).abs() < 1e-12);

        let mut old2new = ahash::AHashMap::new();
        old2new.insert(2, 0);
        let remapped = v.remap(&old2new);
        assert_eq!(remapped.nnz(), 1);
        assert!((remapped.dot_dense(&[0.5]) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn select_rows_copies_in_order() {
        let m = sample();
        let sel = m.select_rows(&[2, 0]);
        assert_eq!(sel.n_rows(), 2);
        let row0: Vec<_> = sel.row(0).collect();
        assert_eq!(row0.len(), 2);
    }
}
