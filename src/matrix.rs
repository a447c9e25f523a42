//! Toggle matrix kernel.
//!
//! A compressed-row sparse matrix for signal-by-window toggle data,
//! a small row-major dense matrix for reduced data, and the
//! aggregation helpers shared by every pipeline stage.

use serde::{ Serialize, Deserialize };
use std::collections::HashMap;
use crate::error::{ Error, Result };
use crate::regression::Term;

/// Compressed sparse row matrix.
///
/// Rows are signals and columns are time windows for toggle data.
/// Column indices inside a row are strictly increasing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CsrMatrix {
    nrows: usize,
    ncols: usize,
    indptr: Vec<usize>,
    indices: Vec<usize>,
    data: Vec<f64>,
}

/// Arena-style builder for [`CsrMatrix`].
///
/// Entries are appended row by row; the layout is validated
/// once in [`CsrBuilder::build`].
#[derive(Debug, Clone)]
pub struct CsrBuilder {
    ncols: usize,
    indptr: Vec<usize>,
    indices: Vec<usize>,
    data: Vec<f64>,
}

impl CsrBuilder {
    /// Create an empty builder for a matrix with `ncols` columns.
    #[inline]
    pub fn new(ncols: usize) -> CsrBuilder {
        CsrBuilder {
            ncols,
            indptr: vec![0],
            indices: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Append an entry to the current row.
    #[inline]
    pub fn push(&mut self, col: usize, value: f64) {
        self.indices.push(col);
        self.data.push(value);
    }

    /// Close the current row.
    #[inline]
    pub fn finish_row(&mut self) {
        self.indptr.push(self.indices.len());
    }

    /// Number of finished rows.
    #[inline]
    pub fn nrows(&self) -> usize {
        self.indptr.len() - 1
    }

    /// Validate and produce the matrix.
    pub fn build(self) -> Result<CsrMatrix> {
        let nrows = self.nrows();
        CsrMatrix::from_parts(
            nrows, self.ncols, self.indptr, self.indices, self.data)
    }
}

impl CsrMatrix {
    /// Build a matrix from raw CSR arrays, checking shape and ordering.
    pub fn from_parts(
        nrows: usize, ncols: usize,
        indptr: Vec<usize>, indices: Vec<usize>, data: Vec<f64>
    ) -> Result<CsrMatrix> {
        if indptr.len() != nrows + 1 {
            return Err(Error::mismatch(
                "row pointer length vs rows + 1", indptr.len(), nrows + 1));
        }
        if indices.len() != data.len() {
            return Err(Error::mismatch(
                "column indices vs values", indices.len(), data.len()));
        }
        if indptr[0] != 0 || indptr[nrows] != indices.len() {
            return Err(Error::format(format!(
                "row pointers must span 0..{}, got {}..{}",
                indices.len(), indptr[0], indptr[nrows])));
        }
        for (i, w) in indptr.windows(2).enumerate() {
            if w[0] > w[1] {
                return Err(Error::format(format!(
                    "row pointer decreases at row {}", i)));
            }
            let cols = &indices[w[0]..w[1]];
            if cols.windows(2).any(|c| c[0] >= c[1]) {
                return Err(Error::format(format!(
                    "columns of row {} are not strictly increasing", i)));
            }
            if let Some(&c) = cols.last() {
                if c >= ncols {
                    return Err(Error::format(format!(
                        "column {} out of range in row {} ({} columns)",
                        c, i, ncols)));
                }
            }
        }
        Ok(CsrMatrix { nrows, ncols, indptr, indices, data })
    }

    /// An all-zero matrix.
    pub fn zeros(nrows: usize, ncols: usize) -> CsrMatrix {
        CsrMatrix {
            nrows, ncols,
            indptr: vec![0; nrows + 1],
            indices: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Sparse copy of a dense matrix, dropping exact zeros.
    pub fn from_dense(m: &DenseMatrix) -> CsrMatrix {
        let mut builder = CsrBuilder::new(m.ncols());
        for i in 0..m.nrows() {
            for (j, &v) in m.row(i).iter().enumerate() {
                if v != 0.0 {
                    builder.push(j, v);
                }
            }
            builder.finish_row();
        }
        let nrows = builder.nrows();
        CsrMatrix {
            nrows,
            ncols: builder.ncols,
            indptr: builder.indptr,
            indices: builder.indices,
            data: builder.data,
        }
    }

    #[inline]
    pub fn nrows(&self) -> usize { self.nrows }

    #[inline]
    pub fn ncols(&self) -> usize { self.ncols }

    /// Number of stored entries.
    #[inline]
    pub fn nnz(&self) -> usize { self.data.len() }

    #[inline]
    pub fn indptr(&self) -> &[usize] { &self.indptr }

    #[inline]
    pub fn indices(&self) -> &[usize] { &self.indices }

    #[inline]
    pub fn data(&self) -> &[f64] { &self.data }

    /// Column indices and values of row `i`.
    #[inline]
    pub fn row(&self, i: usize) -> (&[usize], &[f64]) {
        let (lo, hi) = (self.indptr[i], self.indptr[i + 1]);
        (&self.indices[lo..hi], &self.data[lo..hi])
    }

    /// Value at `(i, j)`, zero when not stored.
    pub fn get(&self, i: usize, j: usize) -> f64 {
        let (cols, vals) = self.row(i);
        match cols.binary_search(&j) {
            Ok(p) => vals[p],
            Err(_) => 0.0
        }
    }

    /// Sum of every row.
    pub fn row_sums(&self) -> Vec<f64> {
        (0..self.nrows).map(|i| self.row(i).1.iter().sum()).collect()
    }

    /// Keep only the listed rows, in the given order.
    pub fn select_rows(&self, rows: &[usize]) -> CsrMatrix {
        let mut builder = CsrBuilder::new(self.ncols);
        for &r in rows {
            let (cols, vals) = self.row(r);
            for (&c, &v) in cols.iter().zip(vals) {
                builder.push(c, v);
            }
            builder.finish_row();
        }
        CsrMatrix {
            nrows: rows.len(),
            ncols: self.ncols,
            indptr: builder.indptr,
            indices: builder.indices,
            data: builder.data,
        }
    }

    /// Concatenate matrices along the column axis.
    pub fn hstack(parts: &[CsrMatrix]) -> Result<CsrMatrix> {
        let Some(first) = parts.first() else {
            return Ok(CsrMatrix::zeros(0, 0));
        };
        for p in &parts[1..] {
            if p.nrows != first.nrows {
                return Err(Error::mismatch(
                    "rows of concatenated matrices", first.nrows, p.nrows));
            }
        }
        let ncols = parts.iter().map(|p| p.ncols).sum();
        let mut builder = CsrBuilder::new(ncols);
        for i in 0..first.nrows {
            let mut offset = 0;
            for p in parts {
                let (cols, vals) = p.row(i);
                for (&c, &v) in cols.iter().zip(vals) {
                    builder.push(c + offset, v);
                }
                offset += p.ncols;
            }
            builder.finish_row();
        }
        builder.build()
    }

    /// Dense copy with the same shape.
    pub fn to_dense(&self) -> DenseMatrix {
        let mut m = DenseMatrix::zeros(self.nrows, self.ncols);
        for i in 0..self.nrows {
            let (cols, vals) = self.row(i);
            for (&c, &v) in cols.iter().zip(vals) {
                m.set(i, c, v);
            }
        }
        m
    }

    /// Dense transpose: windows become rows (samples), signals columns.
    pub fn transpose_dense(&self) -> DenseMatrix {
        let mut m = DenseMatrix::zeros(self.ncols, self.nrows);
        for i in 0..self.nrows {
            let (cols, vals) = self.row(i);
            for (&c, &v) in cols.iter().zip(vals) {
                m.set(c, i, v);
            }
        }
        m
    }

    /// `self * x` for a dense vector of length `ncols`.
    pub fn mul_vec(&self, x: &[f64]) -> Vec<f64> {
        debug_assert_eq!(x.len(), self.ncols);
        (0..self.nrows).map(|i| {
            let (cols, vals) = self.row(i);
            cols.iter().zip(vals).map(|(&c, &v)| v * x[c]).sum()
        }).collect()
    }

    /// `self^T * y` for a dense vector of length `nrows`.
    pub fn t_mul_vec(&self, y: &[f64]) -> Vec<f64> {
        debug_assert_eq!(y.len(), self.nrows);
        let mut out = vec![0.0; self.ncols];
        for (i, &yi) in y.iter().enumerate() {
            if yi == 0.0 {
                continue;
            }
            let (cols, vals) = self.row(i);
            for (&c, &v) in cols.iter().zip(vals) {
                out[c] += v * yi;
            }
        }
        out
    }

    fn scale_rows(&self, mut f: impl FnMut(usize, f64) -> f64) -> CsrMatrix {
        let mut data = Vec::with_capacity(self.data.len());
        for i in 0..self.nrows {
            data.extend(self.row(i).1.iter().map(|&v| f(i, v)));
        }
        CsrMatrix {
            nrows: self.nrows,
            ncols: self.ncols,
            indptr: self.indptr.clone(),
            indices: self.indices.clone(),
            data,
        }
    }
}

/// Row-major dense matrix, used only for already-reduced data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DenseMatrix {
    nrows: usize,
    ncols: usize,
    data: Vec<f64>,
}

impl DenseMatrix {
    #[inline]
    pub fn zeros(nrows: usize, ncols: usize) -> DenseMatrix {
        DenseMatrix { nrows, ncols, data: vec![0.0; nrows * ncols] }
    }

    /// Wrap a row-major buffer.
    pub fn from_vec(nrows: usize, ncols: usize, data: Vec<f64>) -> Result<DenseMatrix> {
        if data.len() != nrows * ncols {
            return Err(Error::mismatch(
                "dense buffer length vs rows * cols", data.len(), nrows * ncols));
        }
        Ok(DenseMatrix { nrows, ncols, data })
    }

    /// Build from equally long rows.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<DenseMatrix> {
        let ncols = rows.first().map_or(0, |r| r.len());
        let mut data = Vec::with_capacity(rows.len() * ncols);
        for r in rows {
            if r.len() != ncols {
                return Err(Error::mismatch("dense row length", r.len(), ncols));
            }
            data.extend_from_slice(r);
        }
        Ok(DenseMatrix { nrows: rows.len(), ncols, data })
    }

    #[inline]
    pub fn nrows(&self) -> usize { self.nrows }

    #[inline]
    pub fn ncols(&self) -> usize { self.ncols }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.ncols + j]
    }

    #[inline]
    pub fn set(&mut self, i: usize, j: usize, v: f64) {
        self.data[i * self.ncols + j] = v;
    }

    #[inline]
    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.ncols..(i + 1) * self.ncols]
    }

    #[inline]
    pub fn row_mut(&mut self, i: usize) -> &mut [f64] {
        &mut self.data[i * self.ncols..(i + 1) * self.ncols]
    }

    pub fn column(&self, j: usize) -> Vec<f64> {
        (0..self.nrows).map(|i| self.get(i, j)).collect()
    }

    /// Copy of the first `k` columns.
    pub fn leading_columns(&self, k: usize) -> DenseMatrix {
        let k = k.min(self.ncols);
        let mut data = Vec::with_capacity(self.nrows * k);
        for i in 0..self.nrows {
            data.extend_from_slice(&self.row(i)[..k]);
        }
        DenseMatrix { nrows: self.nrows, ncols: k, data }
    }

    /// `self * x`.
    pub fn dot(&self, x: &[f64]) -> Result<Vec<f64>> {
        if x.len() != self.ncols {
            return Err(Error::mismatch("matrix columns vs vector", self.ncols, x.len()));
        }
        Ok((0..self.nrows).map(|i| {
            self.row(i).iter().zip(x).map(|(a, b)| a * b).sum()
        }).collect())
    }

    /// Concatenate matrices along the column axis.
    pub fn hstack(parts: &[DenseMatrix]) -> Result<DenseMatrix> {
        let Some(first) = parts.first() else {
            return Ok(DenseMatrix::zeros(0, 0));
        };
        for p in &parts[1..] {
            if p.nrows != first.nrows {
                return Err(Error::mismatch(
                    "rows of concatenated matrices", first.nrows, p.nrows));
            }
        }
        let ncols = parts.iter().map(|p| p.ncols).sum();
        let mut data = Vec::with_capacity(first.nrows * ncols);
        for i in 0..first.nrows {
            for p in parts {
                data.extend_from_slice(p.row(i));
            }
        }
        Ok(DenseMatrix { nrows: first.nrows, ncols, data })
    }
}

/// Windowed averaging along the column (time) axis.
pub trait AverageRows: Sized {
    /// Merge every `window` consecutive columns into one.
    fn average_rows(&self, window: usize) -> Self;
}

impl AverageRows for DenseMatrix {
    /// Group mean; a trailing partial group is averaged over the
    /// entries it actually has.
    fn average_rows(&self, window: usize) -> DenseMatrix {
        if window <= 1 {
            return self.clone();
        }
        let ncols = self.ncols.div_ceil(window);
        let mut out = DenseMatrix::zeros(self.nrows, ncols);
        for i in 0..self.nrows {
            for (j, chunk) in self.row(i).chunks(window).enumerate() {
                out.set(i, j, chunk.iter().sum::<f64>() / chunk.len() as f64);
            }
        }
        out
    }
}

impl AverageRows for CsrMatrix {
    /// Values are divided by `window` and summed per bucket
    /// `col / window`.
    fn average_rows(&self, window: usize) -> CsrMatrix {
        if window <= 1 {
            return self.clone();
        }
        let mut builder = CsrBuilder::new(self.ncols.div_ceil(window));
        for i in 0..self.nrows {
            let (cols, vals) = self.row(i);
            let row_start = builder.indices.len();
            for (&c, &v) in cols.iter().zip(vals) {
                let bucket = c / window;
                let v = v / window as f64;
                // columns are sorted, so a bucket only continues the last entry
                let merge = builder.indices.len() > row_start
                    && builder.indices.last() == Some(&bucket);
                if merge {
                    if let Some(acc) = builder.data.last_mut() {
                        *acc += v;
                    }
                }
                else {
                    builder.push(bucket, v);
                }
            }
            builder.finish_row();
        }
        CsrMatrix {
            nrows: self.nrows,
            ncols: builder.ncols,
            indptr: builder.indptr,
            indices: builder.indices,
            data: builder.data,
        }
    }
}

/// Average every `window` columns of `m`. `window == 1` is the identity.
#[inline]
pub fn average_rows<M: AverageRows>(m: &M, window: usize) -> M {
    m.average_rows(window)
}

/// Divide every stored entry of row `i` by `denoms[i]`.
pub fn divide_csr(m: &CsrMatrix, denoms: &[f64]) -> Result<CsrMatrix> {
    if denoms.len() != m.nrows {
        return Err(Error::mismatch("row denominators vs rows", denoms.len(), m.nrows));
    }
    Ok(m.scale_rows(|i, v| v / denoms[i]))
}

/// Multiply every stored entry of row `i` by `factors[i]`.
pub fn multiply_rows(m: &CsrMatrix, factors: &[f64]) -> Result<CsrMatrix> {
    if factors.len() != m.nrows {
        return Err(Error::mismatch("row factors vs rows", factors.len(), m.nrows));
    }
    Ok(m.scale_rows(|i, v| v * factors[i]))
}

/// Remap term indices from the `from` signal ordering to `to`.
///
/// `to` must be a subset of `from`. Every index in `terms` refers to
/// a position in `from` and is rewritten to that signal's position
/// in `to`.
pub fn translate_indices<S: AsRef<str>>(
    from: &[S], to: &[S], terms: &[Term]
) -> Result<Vec<Term>> {
    if to.len() > from.len() {
        return Err(Error::mismatch("target signals vs source signals", to.len(), from.len()));
    }
    let positions: HashMap<&str, usize> = from.iter().enumerate()
        .map(|(i, s)| (s.as_ref(), i))
        .collect();
    let mut signal_map = HashMap::with_capacity(to.len());
    for (new_idx, s) in to.iter().enumerate() {
        let old_idx = positions.get(s.as_ref())
            .ok_or_else(|| Error::Lookup(format!("signal {}", s.as_ref())))?;
        signal_map.insert(*old_idx, new_idx);
    }
    terms.iter().map(|term| {
        term.0.iter().map(|var| {
            signal_map.get(var).copied().ok_or_else(|| Error::Lookup(
                match from.get(*var) {
                    Some(s) => format!("signal {} in translated set", s.as_ref()),
                    None => format!("signal index {}", var)
                }))
        }).collect::<Result<Vec<_>>>().map(Term)
    }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> CsrMatrix {
        let mut b = CsrBuilder::new(5);
        b.push(0, 1.0);
        b.push(3, 4.0);
        b.finish_row();
        b.finish_row();
        b.push(1, 2.0);
        b.push(2, 6.0);
        b.push(4, 8.0);
        b.finish_row();
        b.build().unwrap()
    }

    #[test]
    fn builder_rejects_unsorted_columns() {
        let mut b = CsrBuilder::new(4);
        b.push(2, 1.0);
        b.push(1, 1.0);
        b.finish_row();
        assert!(matches!(b.build(), Err(Error::Format(_))));
    }

    #[test]
    fn builder_rejects_out_of_range_column() {
        let mut b = CsrBuilder::new(2);
        b.push(2, 1.0);
        b.finish_row();
        assert!(b.build().is_err());
    }

    #[test]
    fn sparse_average_buckets() {
        let m = sample();
        let avg = average_rows(&m, 2);
        assert_eq!(avg.ncols(), 3);
        assert_eq!(avg.row(0).0, &[0, 1]);
        assert_eq!(avg.get(0, 0), 0.5);
        assert_eq!(avg.get(0, 1), 2.0);
        assert_eq!(avg.row(1).0.len(), 0);
        assert_eq!(avg.get(2, 0), 1.0);
        assert_eq!(avg.get(2, 1), 3.0);
        assert_eq!(avg.get(2, 2), 4.0);
    }

    #[test]
    fn dense_average_trailing_group() {
        let m = DenseMatrix::from_rows(&[vec![1.0, 3.0, 5.0, 7.0, 10.0]]).unwrap();
        let avg = average_rows(&m, 2);
        assert_eq!(avg.row(0), &[2.0, 6.0, 10.0]);
    }

    #[test]
    fn hstack_offsets_columns() {
        let m = sample();
        let h = CsrMatrix::hstack(&[m.clone(), m.clone()]).unwrap();
        assert_eq!(h.ncols(), 10);
        assert_eq!(h.get(0, 3), 4.0);
        assert_eq!(h.get(0, 8), 4.0);
        assert_eq!(h.row_sums()[2], 32.0);
    }

    #[test]
    fn hstack_rejects_row_mismatch() {
        let r = CsrMatrix::hstack(&[sample(), CsrMatrix::zeros(2, 3)]);
        assert!(matches!(r, Err(Error::DimensionMismatch { .. })));
    }

    #[test]
    fn transpose_dense_layout() {
        let t = sample().transpose_dense();
        assert_eq!((t.nrows(), t.ncols()), (5, 3));
        assert_eq!(t.get(4, 2), 8.0);
        assert_eq!(t.get(3, 0), 4.0);
    }

    #[test]
    fn translate_reorders_terms() {
        let from = ["a", "b", "c"];
        let to = ["c", "a"];
        let terms = vec![Term(vec![0]), Term(vec![2, 0]), Term(vec![2, 2])];
        let out = translate_indices(&from, &to, &terms).unwrap();
        assert_eq!(out, vec![Term(vec![1]), Term(vec![0, 1]), Term(vec![0, 0])]);
    }

    #[test]
    fn translate_unknown_signal() {
        let from = ["a", "b"];
        let to = ["z"];
        let r = translate_indices(&from, &to, &[Term(vec![0])]);
        assert!(matches!(r, Err(Error::Lookup(_))));
    }

    #[test]
    fn translate_dropped_signal_in_term() {
        let from = ["a", "b"];
        let to = ["a"];
        let r = translate_indices(&from, &to, &[Term(vec![1])]);
        assert!(matches!(r, Err(Error::Lookup(_))));
    }

    fn dense_strategy() -> impl Strategy<Value = DenseMatrix> {
        (1usize..6, 1usize..24).prop_flat_map(|(r, c)| {
            proptest::collection::vec(
                prop_oneof![3 => Just(0.0), 1 => 0.0f64..4.0], r * c)
                .prop_map(move |d| DenseMatrix::from_vec(r, c, d).unwrap())
        })
    }

    proptest! {
        #[test]
        fn average_window_one_is_identity(d in dense_strategy()) {
            let s = CsrMatrix::from_dense(&d);
            prop_assert_eq!(average_rows(&s, 1), s);
            prop_assert_eq!(average_rows(&d, 1), d);
        }

        #[test]
        fn average_conserves_row_mean(d in dense_strategy(), w in 1usize..5) {
            // pad to a multiple of the window
            let c = d.ncols().div_ceil(w) * w;
            let mut padded = DenseMatrix::zeros(d.nrows(), c);
            for i in 0..d.nrows() {
                padded.row_mut(i)[..d.ncols()].copy_from_slice(d.row(i));
            }
            let sparse = CsrMatrix::from_dense(&padded);
            let sa = average_rows(&sparse, w);
            let da = average_rows(&padded, w);
            for i in 0..padded.nrows() {
                let mean = padded.row(i).iter().sum::<f64>() / c as f64;
                let sm = sa.row(i).1.iter().sum::<f64>() / sa.ncols() as f64;
                let dm = da.row(i).iter().sum::<f64>() / da.ncols() as f64;
                prop_assert!((mean - sm).abs() < 1e-9);
                prop_assert!((mean - dm).abs() < 1e-9);
                for j in 0..da.ncols() {
                    prop_assert!((sa.get(i, j) - da.get(i, j)).abs() < 1e-9);
                }
            }
        }

        #[test]
        fn divide_inverts_multiply(
            d in dense_strategy(),
            f in proptest::collection::vec(0.5f64..64.0, 6)
        ) {
            let m = CsrMatrix::from_dense(&d);
            let f = &f[..m.nrows()];
            let back = divide_csr(&multiply_rows(&m, f).unwrap(), f).unwrap();
            prop_assert_eq!(back.indices(), m.indices());
            for (a, b) in back.data().iter().zip(m.data()) {
                prop_assert!((a - b).abs() <= 1e-12 * b.abs().max(1.0));
            }
        }

        #[test]
        fn translate_identity(n in 1usize..8, raw in proptest::collection::vec(
            proptest::collection::vec(0usize..64, 1..4), 0..10)) {
            let names: Vec<String> = (0..n).map(|i| format!("s{}", i)).collect();
            let terms: Vec<Term> = raw.into_iter()
                .map(|t| Term(t.into_iter().map(|x| x % n).collect()))
                .collect();
            prop_assert_eq!(translate_indices(&names, &names, &terms).unwrap(), terms);
        }
    }
}
