//! Polynomial terms and cross-validated sparse regression.
//!
//! Features are standardized, then an L1 or elastic-net penalized
//! least squares problem is solved by coordinate descent along a
//! log-spaced regularization path. The path point (and mixing ratio)
//! with the lowest held-out error over contiguous folds is refit on
//! all samples and mapped back to physical units.

use itertools::Itertools;
use rayon::prelude::*;
use serde::{ Serialize, Deserialize };
use std::fmt;
use crate::config::FitConfig;
use crate::error::{ Error, Result };
use crate::matrix::DenseMatrix;

/// Product of signal toggle-rate columns. Indices refer to positions
/// in a signal list; repeated indices form power terms.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Term(pub Vec<usize>);

impl Term {
    #[inline]
    pub fn degree(&self) -> usize {
        self.0.len()
    }

    /// Human readable form, e.g. `core.a*core.b`.
    pub fn label<S: AsRef<str>>(&self, signals: &[S]) -> String {
        self.0.iter().map(|&i| signals[i].as_ref()).join("*")
    }
}

impl fmt::Display for Term {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.iter().format("*"))
    }
}

/// All terms of a degree-`degree` polynomial over `n` signals.
///
/// Order: single signals; then for each degree `2..=degree` the
/// lexicographic combinations of distinct signals; then for each
/// degree `2..=degree` the pure power of every signal. Stored models
/// depend on this order.
pub fn build_terms(n: usize, degree: usize) -> Vec<Term> {
    let mut terms: Vec<Term> = (0..n).map(|i| Term(vec![i])).collect();
    for k in 2..=degree {
        terms.extend((0..n).combinations(k).map(Term));
    }
    for k in 2..=degree {
        terms.extend((0..n).map(|i| Term(vec![i; k])));
    }
    terms
}

/// Design matrix with a leading constant column followed by one
/// column per term.
pub fn design_matrix(samples: &DenseMatrix, terms: &[Term]) -> Result<DenseMatrix> {
    let nvars = samples.ncols();
    if let Some(&bad) = terms.iter().flat_map(|t| t.0.iter()).find(|&&i| i >= nvars) {
        return Err(Error::mismatch("term signal index vs signal count", bad, nvars));
    }
    let mut out = DenseMatrix::zeros(samples.nrows(), terms.len() + 1);
    for i in 0..samples.nrows() {
        let x = samples.row(i);
        let row = out.row_mut(i);
        row[0] = 1.0;
        for (j, term) in terms.iter().enumerate() {
            row[j + 1] = term.0.iter().map(|&v| x[v]).product();
        }
    }
    Ok(out)
}

/// Statistics of one fit.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FitReport {
    /// Nonzero coefficients, intercept excluded.
    pub df: usize,
    /// Coefficient of determination on the training samples.
    pub r2: f64,
    /// Sum of squared errors.
    pub sse: f64,
    /// `sse / var(y) + ln(n) * df`.
    pub bic: f64,
    /// Selected regularization strength (standardized units).
    pub alpha: f64,
    /// Selected L1 share of the penalty.
    pub l1_ratio: f64,
}

/// Result of a polynomial regression.
#[derive(Debug, Clone)]
pub struct PolyFit {
    /// `[intercept, term_1, ..]` in physical units.
    pub coefficients: Vec<f64>,
    pub terms: Vec<Term>,
    pub report: FitReport,
    /// Fitted values on the training samples.
    pub prediction: Vec<f64>,
}

/// Column-wise mean and standard deviation. Constant columns keep a
/// scale of one.
#[derive(Debug, Clone)]
struct Scaler {
    mean: Vec<f64>,
    scale: Vec<f64>,
}

impl Scaler {
    fn fit(columns: &[Vec<f64>]) -> Scaler {
        let (mean, scale) = columns.iter().map(|c| {
            let (m, s) = mean_std(c);
            (m, if s > 0.0 { s } else { 1.0 })
        }).unzip();
        Scaler { mean, scale }
    }

    fn transform(&self, columns: &mut [Vec<f64>]) {
        for ((c, m), s) in columns.iter_mut().zip(&self.mean).zip(&self.scale) {
            c.iter_mut().for_each(|v| *v = (*v - m) / s);
        }
    }
}

/// Population mean and standard deviation.
fn mean_std(v: &[f64]) -> (f64, f64) {
    if v.is_empty() {
        return (0.0, 0.0);
    }
    let n = v.len() as f64;
    let mean = v.iter().sum::<f64>() / n;
    let var = v.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n;
    (mean, var.sqrt())
}

#[inline]
fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[inline]
fn soft_threshold(x: f64, t: f64) -> f64 {
    if x > t { x - t } else if x < -t { x + t } else { 0.0 }
}

/// Penalized least squares on standardized, column-major data.
struct Problem<'a> {
    columns: Vec<&'a [f64]>,
    norms: Vec<f64>,
    y: &'a [f64],
    positive: bool,
    max_iter: usize,
    tol: f64,
}

impl<'a> Problem<'a> {
    fn new(columns: Vec<&'a [f64]>, y: &'a [f64], positive: bool, config: &FitConfig) -> Problem<'a> {
        let norms = columns.iter().map(|c| dot(c, c)).collect();
        Problem { columns, norms, y, positive, max_iter: config.max_iter, tol: config.tol }
    }

    #[inline]
    fn nsamples(&self) -> usize {
        self.y.len()
    }

    /// Minimize `1/(2n)|y - Xw|^2 + a*r|w|_1 + a(1-r)/2 |w|^2`,
    /// warm-started from `w`. Returns whether the sweep converged.
    fn solve(&self, alpha: f64, l1_ratio: f64, w: &mut [f64]) -> bool {
        let n = self.nsamples() as f64;
        let l1 = alpha * l1_ratio * n;
        let l2 = alpha * (1.0 - l1_ratio) * n;
        let mut r: Vec<f64> = self.y.to_vec();
        for (c, &wj) in self.columns.iter().zip(w.iter()) {
            if wj != 0.0 {
                r.iter_mut().zip(c.iter()).for_each(|(ri, x)| *ri -= wj * x);
            }
        }
        for _ in 0..self.max_iter {
            let mut max_dw: f64 = 0.0;
            let mut max_w: f64 = 0.0;
            for (j, c) in self.columns.iter().enumerate() {
                if self.norms[j] == 0.0 {
                    continue;
                }
                let old = w[j];
                let rho = dot(c, &r) + self.norms[j] * old;
                let mut new = soft_threshold(rho, l1) / (self.norms[j] + l2);
                if self.positive && new < 0.0 {
                    new = 0.0;
                }
                if new != old {
                    let d = new - old;
                    r.iter_mut().zip(c.iter()).for_each(|(ri, x)| *ri -= d * x);
                    w[j] = new;
                }
                max_dw = max_dw.max((new - old).abs());
                max_w = max_w.max(new.abs());
            }
            if max_w == 0.0 || max_dw / max_w < self.tol {
                return true;
            }
        }
        false
    }

    /// Largest alpha with a nonzero solution.
    fn alpha_max(&self, l1_ratio: f64) -> f64 {
        let n = self.nsamples() as f64;
        self.columns.iter()
            .map(|c| dot(c, self.y).abs())
            .fold(0.0, f64::max) / (n * l1_ratio)
    }
}

/// Log-spaced path from `alpha_max` down to `alpha_max * eps`.
fn alpha_path(alpha_max: f64, eps: f64, n_alphas: usize) -> Vec<f64> {
    if n_alphas <= 1 {
        return vec![alpha_max];
    }
    let (hi, lo) = (alpha_max.log10(), (alpha_max * eps).log10());
    (0..n_alphas)
        .map(|i| 10f64.powf(hi + (lo - hi) * i as f64 / (n_alphas - 1) as f64))
        .collect()
}

/// Contiguous fold boundaries; the first `n % k` folds get one extra sample.
fn fold_ranges(n: usize, k: usize) -> Vec<(usize, usize)> {
    let mut start = 0;
    (0..k).map(|f| {
        let len = n / k + usize::from(f < n % k);
        let range = (start, start + len);
        start += len;
        range
    }).collect()
}

/// Held-out mean squared error along the path for one fold.
fn fold_path_mse(
    columns: &[Vec<f64>], y: &[f64], (lo, hi): (usize, usize),
    alphas: &[f64], l1_ratio: f64, positive: bool, config: &FitConfig
) -> Vec<f64> {
    let split = |v: &[f64]| -> (Vec<f64>, Vec<f64>) {
        let train = v[..lo].iter().chain(&v[hi..]).copied().collect();
        (train, v[lo..hi].to_vec())
    };
    let (train_cols, test_cols): (Vec<_>, Vec<_>) =
        columns.iter().map(|c| split(&c[..])).unzip();
    let (y_train, y_test) = split(y);
    let problem = Problem::new(
        train_cols.iter().map(|c| &c[..]).collect(), &y_train, positive, config);
    let mut w = vec![0.0; columns.len()];
    alphas.iter().map(|&alpha| {
        if !problem.solve(alpha, l1_ratio, &mut w) {
            clilog::debug!(CV_NOCONV, "fold {}..{} did not converge at alpha {:e}",
                           lo, hi, alpha);
        }
        let mut err = 0.0;
        for (i, yt) in y_test.iter().enumerate() {
            let pred: f64 = test_cols.iter().zip(&w).map(|(c, wj)| c[i] * wj).sum();
            err += (yt - pred) * (yt - pred);
        }
        err / y_test.len().max(1) as f64
    }).collect()
}

/// Fit the design matrix (leading constant column) against `y`.
///
/// Returns `[intercept, coefficients..]` in physical units together
/// with fit statistics and the fitted values.
pub fn fit(
    design: &DenseMatrix, y: &[f64], positive: bool, config: &FitConfig
) -> Result<(Vec<f64>, FitReport, Vec<f64>)> {
    let n = design.nrows();
    if n != y.len() {
        return Err(Error::mismatch("design rows vs target samples", n, y.len()));
    }
    if design.ncols() == 0 {
        return Err(Error::mismatch("design columns vs intercept", 0, 1));
    }
    if config.folds < 2 || n < config.folds {
        return Err(Error::mismatch("samples vs cross-validation folds", n, config.folds));
    }
    let p = design.ncols() - 1;
    let mut columns: Vec<Vec<f64>> = (1..=p).map(|j| design.column(j)).collect();
    let x_scaler = Scaler::fit(&columns);
    x_scaler.transform(&mut columns);
    let (y_mean, y_std) = mean_std(y);
    let y_scale = if y_std > 0.0 { y_std } else { 1.0 };
    let ys: Vec<f64> = y.iter().map(|v| (v - y_mean) / y_scale).collect();

    let full = Problem::new(columns.iter().map(|c| &c[..]).collect(), &ys, positive, config);
    let folds = fold_ranges(n, config.folds);

    // (mean held-out mse, alpha index, ratio, path)
    let mut best: Option<(f64, usize, f64, Vec<f64>)> = None;
    for l1_ratio in config.mixing_ratios() {
        let alpha_max = full.alpha_max(l1_ratio);
        if !(alpha_max > 0.0) || !alpha_max.is_finite() {
            continue;
        }
        let alphas = alpha_path(alpha_max, config.eps, config.n_alphas);
        let per_fold: Vec<Vec<f64>> = folds.par_iter()
            .map(|&range| fold_path_mse(
                &columns, &ys, range, &alphas, l1_ratio, positive, config))
            .collect();
        for (a, _) in alphas.iter().enumerate() {
            let mse = per_fold.iter().map(|f| f[a]).sum::<f64>() / folds.len() as f64;
            if best.as_ref().map_or(true, |b| mse < b.0) {
                best = Some((mse, a, l1_ratio, alphas.clone()));
            }
        }
    }

    let mut w = vec![0.0; p];
    let (alpha, l1_ratio) = match best {
        Some((mse, a, l1_ratio, alphas)) => {
            // refit on all samples, warm-started along the path
            for (i, &alpha) in alphas[..=a].iter().enumerate() {
                let converged = full.solve(alpha, l1_ratio, &mut w);
                if i == a && !converged {
                    return Err(Error::DegenerateFit(format!(
                        "coordinate descent did not converge in {} sweeps \
                         (alpha {:e}, l1 ratio {})", config.max_iter, alpha, l1_ratio)));
                }
            }
            clilog::debug!(CV_BEST, "cv mse {:.6}, alpha {:e}, l1 ratio {}",
                           mse, alphas[a], l1_ratio);
            (alphas[a], l1_ratio)
        }
        None => {
            clilog::warn!(FIT_CONST, "no feature correlates with the target; \
                                      fitting a constant");
            (0.0, 1.0)
        }
    };
    if w.iter().any(|v| !v.is_finite()) {
        return Err(Error::DegenerateFit("non-finite coefficients".into()));
    }

    let mut coefficients = Vec::with_capacity(p + 1);
    coefficients.push(0.0);
    coefficients.extend(w.iter().zip(&x_scaler.scale)
        .map(|(&wj, s)| if wj != 0.0 { wj * y_scale / s } else { 0.0 }));
    coefficients[0] = y_mean - dot(&x_scaler.mean, &coefficients[1..]);

    let prediction = design.dot(&coefficients)?;
    let df = w.iter().filter(|&&v| v != 0.0).count();
    let sse: f64 = y.iter().zip(&prediction).map(|(a, b)| (a - b) * (a - b)).sum();
    let tss: f64 = y.iter().map(|v| (v - y_mean) * (v - y_mean)).sum();
    let r2 = if tss > 0.0 { 1.0 - sse / tss } else if sse == 0.0 { 1.0 } else { 0.0 };
    let sigma2 = y_std * y_std + f64::EPSILON;
    let bic = sse / sigma2 + (n as f64).ln() * df as f64;
    clilog::info!(FIT_DONE, "alpha {:e}, l1 ratio {:.2}, {} terms, R^2 {:.6}",
                  alpha, l1_ratio, df, r2);
    Ok((coefficients, FitReport { df, r2, sse, bic, alpha, l1_ratio }, prediction))
}

/// Terms and design matrix over a fixed sample matrix, reusable for
/// several targets.
#[derive(Debug, Clone)]
pub struct PolynomialDesign {
    pub terms: Vec<Term>,
    pub matrix: DenseMatrix,
}

impl PolynomialDesign {
    /// Expand `samples` (rows are windows, columns are signals).
    pub fn new(samples: &DenseMatrix, degree: usize) -> Result<PolynomialDesign> {
        let terms = build_terms(samples.ncols(), degree);
        let matrix = design_matrix(samples, &terms)?;
        clilog::info!(POLY_TERMS, "{} terms, design matrix {}x{}",
                      terms.len(), matrix.nrows(), matrix.ncols());
        Ok(PolynomialDesign { terms, matrix })
    }

    /// Fit one target.
    pub fn fit(&self, y: &[f64], positive: bool, config: &FitConfig) -> Result<PolyFit> {
        let (coefficients, report, prediction) = fit(&self.matrix, y, positive, config)?;
        Ok(PolyFit { coefficients, terms: self.terms.clone(), report, prediction })
    }
}

/// Regression of `y` on all polynomial terms of the sample columns.
pub fn polynomial_regression(
    samples: &DenseMatrix, y: &[f64], positive: bool, config: &FitConfig
) -> Result<PolyFit> {
    if samples.nrows() != y.len() {
        return Err(Error::mismatch("toggle samples vs power samples",
                                   samples.nrows(), y.len()));
    }
    PolynomialDesign::new(samples, config.degree)?.fit(y, positive, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lasso() -> FitConfig {
        FitConfig { degree: 1, elastic_net: false, ..Default::default() }
    }

    /// Two uncorrelated square waves over `n` samples.
    fn square_waves(n: usize) -> DenseMatrix {
        let rows: Vec<Vec<f64>> = (0..n).map(|i| vec![
            if i % 2 == 0 { 1.0 } else { 0.0 },
            if i % 4 < 2 { 1.0 } else { 0.0 },
        ]).collect();
        DenseMatrix::from_rows(&rows).unwrap()
    }

    #[test]
    fn term_order() {
        let t = build_terms(3, 2);
        let expect: Vec<Term> = [
            vec![0], vec![1], vec![2],
            vec![0, 1], vec![0, 2], vec![1, 2],
            vec![0, 0], vec![1, 1], vec![2, 2],
        ].into_iter().map(Term).collect();
        assert_eq!(t, expect);
        assert_eq!(build_terms(4, 3).len(), 4 + 6 + 4 + 4 + 4);
        assert_eq!(t[3].label(&["a", "b", "c"]), "a*b");
        assert_eq!(t[7].to_string(), "1*1");
    }

    #[test]
    fn design_products() {
        let s = DenseMatrix::from_rows(&[vec![2.0, 3.0], vec![0.5, 4.0]]).unwrap();
        let d = design_matrix(&s, &build_terms(2, 2)).unwrap();
        assert_eq!(d.row(0), &[1.0, 2.0, 3.0, 6.0, 4.0, 9.0]);
        assert_eq!(d.row(1), &[1.0, 0.5, 4.0, 2.0, 0.25, 16.0]);
        assert!(design_matrix(&s, &[Term(vec![2])]).is_err());
    }

    #[test]
    fn recovers_single_linear_term() {
        let s = square_waves(40);
        let y: Vec<f64> = (0..40).map(|i| 3.0 * s.get(i, 0) + 1.0).collect();
        let f = polynomial_regression(&s, &y, true, &lasso()).unwrap();
        assert_eq!(f.report.df, 1);
        assert_eq!(f.coefficients[2], 0.0);
        assert!((f.coefficients[1] - 3.0).abs() < 0.01, "{:?}", f.coefficients);
        assert!((f.coefficients[0] - 1.0).abs() < 0.01, "{:?}", f.coefficients);
        assert!(f.report.r2 > 0.999);
        let design = design_matrix(&s, &f.terms).unwrap();
        assert_eq!(design.dot(&f.coefficients).unwrap().len(), y.len());
    }

    #[test]
    fn elastic_net_prefers_pure_l1_on_exact_data() {
        let s = square_waves(40);
        let y: Vec<f64> = (0..40).map(|i| 2.0 * s.get(i, 1)).collect();
        let config = FitConfig { degree: 1, ..Default::default() };
        let f = polynomial_regression(&s, &y, true, &config).unwrap();
        assert_eq!(f.report.l1_ratio, 1.0);
        assert_eq!(f.report.df, 1);
        assert!(f.coefficients[1].abs() < 1e-12);
        assert!(f.report.r2 > 0.999);
    }

    #[test]
    fn positivity_constraint() {
        let s = square_waves(40);
        let y: Vec<f64> = (0..40).map(|i| 5.0 - 2.0 * s.get(i, 0)).collect();
        let constrained = polynomial_regression(&s, &y, true, &lasso()).unwrap();
        assert!(constrained.coefficients[1..].iter().all(|&c| c >= 0.0));
        assert_eq!(constrained.report.df, 0);
        let free = polynomial_regression(&s, &y, false, &lasso()).unwrap();
        assert!((free.coefficients[1] + 2.0).abs() < 0.01);
    }

    #[test]
    fn constant_target_fits_intercept() {
        let s = square_waves(20);
        let y = vec![1.5; 20];
        let f = polynomial_regression(&s, &y, true, &lasso()).unwrap();
        assert_eq!(f.report.df, 0);
        assert_eq!(f.coefficients, vec![1.5, 0.0, 0.0]);
        assert_eq!(f.report.r2, 1.0);
    }

    #[test]
    fn sample_count_mismatch() {
        let s = square_waves(20);
        let r = polynomial_regression(&s, &[1.0; 19], true, &lasso());
        assert!(matches!(r, Err(Error::DimensionMismatch { .. })));
    }

    #[test]
    fn non_convergence_is_reported() {
        let s = square_waves(40);
        let y: Vec<f64> = (0..40).map(|i| s.get(i, 0) + 0.3 * s.get(i, 1)).collect();
        let config = FitConfig { max_iter: 0, ..lasso() };
        let r = polynomial_regression(&s, &y, true, &config);
        assert!(matches!(r, Err(Error::DegenerateFit(_))));
    }

    #[test]
    fn folds_cover_all_samples() {
        let f = fold_ranges(11, 5);
        assert_eq!(f, vec![(0, 3), (3, 5), (5, 7), (7, 9), (9, 11)]);
    }
}
