//! Spectral signal clustering with BIC model selection.
//!
//! Signals are projected onto the leading right singular vectors of the
//! toggle matrix, grouped by k-means for a range of `k`, and a simulated
//! annealing sweep over `k` picks a clustering by its BIC score. The
//! member nearest to each centroid represents its cluster.

use compact_str::CompactString;
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde::{ Serialize, Deserialize };
use crate::config::ClusterConfig;
use crate::error::{ Error, Result };
use crate::matrix::{ CsrMatrix, DenseMatrix };

/// Residual variance below which a clustering is considered exact
/// and scored `+inf`.
const MIN_VARIANCE: f64 = 1e-25;

/// A clustering of signals.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClusterResult {
    /// Representative signal index of each cluster.
    pub centers: Vec<usize>,
    /// Cluster index of each signal.
    pub labels: Vec<usize>,
    pub k: usize,
    /// BIC score; lower is better.
    pub score: f64,
}

impl ClusterResult {
    /// Names of the representative signals, in cluster order.
    pub fn center_names<S: AsRef<str>>(&self, names: &[S]) -> Vec<CompactString> {
        self.centers.iter().map(|&c| names[c].as_ref().into()).collect()
    }

    /// Each cluster as `[center, other members sorted by name]`, the
    /// clusters sorted by center name.
    pub fn groups<S: AsRef<str>>(&self, names: &[S]) -> Vec<Vec<CompactString>> {
        let mut groups: Vec<Vec<CompactString>> = self.centers.iter().enumerate()
            .map(|(i, &c)| {
                let mut members: Vec<CompactString> = self.labels.iter().enumerate()
                    .filter(|&(j, &l)| l == i && j != c)
                    .map(|(j, _)| names[j].as_ref().into())
                    .collect();
                members.sort();
                members.insert(0, names[c].as_ref().into());
                members
            })
            .collect();
        groups.sort_by(|a, b| a[0].cmp(&b[0]));
        groups
    }
}

#[inline]
fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[inline]
fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Normalize in place, returning the previous length.
fn normalize(v: &mut [f64]) -> f64 {
    let n = dot(v, v).sqrt();
    if n > 1e-300 {
        v.iter_mut().for_each(|x| *x /= n);
    }
    n
}

/// Remove the components of `v` along the (orthonormal) `basis`.
fn orthogonalize(v: &mut [f64], basis: &[Vec<f64>]) {
    for b in basis {
        let p = dot(v, b);
        v.iter_mut().zip(b).for_each(|(x, y)| *x -= p * y);
    }
}

fn random_unit(dim: usize, basis: &[Vec<f64>], rng: &mut StdRng) -> Vec<f64> {
    let mut v: Vec<f64> = (0..dim).map(|_| rng.sample(StandardNormal)).collect();
    orthogonalize(&mut v, basis);
    normalize(&mut v);
    v
}

/// Leading `k` right singular vectors of `a`, by decreasing singular
/// value, together with the singular values.
///
/// Orthogonal iteration on `AᵀA` using only sparse products.
pub fn right_singular_vectors(
    a: &CsrMatrix, k: usize, config: &ClusterConfig
) -> Result<(Vec<f64>, Vec<Vec<f64>>)> {
    let m = a.ncols();
    if k > m {
        return Err(Error::mismatch("singular vectors vs windows", k, m));
    }
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut basis: Vec<Vec<f64>> = Vec::with_capacity(k);
    for _ in 0..k {
        let v = random_unit(m, &basis, &mut rng);
        basis.push(v);
    }
    for _ in 0..config.svd_iters {
        let mut next: Vec<Vec<f64>> = Vec::with_capacity(k);
        for v in &basis {
            let mut w = a.t_mul_vec(&a.mul_vec(v));
            orthogonalize(&mut w, &next);
            if normalize(&mut w) < 1e-12 {
                // rank deficient: any direction orthogonal to the rest
                w = random_unit(m, &next, &mut rng);
            }
            next.push(w);
        }
        basis = next;
    }
    let mut pairs: Vec<(f64, Vec<f64>)> = basis.into_iter()
        .map(|v| {
            let av = a.mul_vec(&v);
            (dot(&av, &av).sqrt(), v)
        })
        .collect();
    pairs.sort_by(|x, y| y.0.total_cmp(&x.0));
    Ok(pairs.into_iter().unzip())
}

/// Project the rows of `a` onto its leading `k` right singular vectors.
pub fn project(a: &CsrMatrix, k: usize, config: &ClusterConfig) -> Result<DenseMatrix> {
    let (sigmas, vectors) = right_singular_vectors(a, k, config)?;
    clilog::debug!(SVD_SIGMA, "leading singular values: {:?}",
                   &sigmas[..sigmas.len().min(8)]);
    let mut out = DenseMatrix::zeros(a.nrows(), k);
    for (j, v) in vectors.iter().enumerate() {
        for (i, x) in a.mul_vec(v).into_iter().enumerate() {
            out.set(i, j, x);
        }
    }
    Ok(out)
}

/// Outcome of one k-means run.
#[derive(Debug, Clone)]
pub struct KMeans {
    /// `k` centroids, one per row.
    pub centroids: DenseMatrix,
    pub labels: Vec<usize>,
    /// Sum of squared distances to the assigned centroid.
    pub inertia: f64,
}

/// Nearest centroid of every point and its squared distance.
fn assign(points: &DenseMatrix, centroids: &[Vec<f64>]) -> (Vec<usize>, Vec<f64>) {
    (0..points.nrows()).map(|i| {
        let p = points.row(i);
        let mut best = (0, f64::INFINITY);
        for (c, centroid) in centroids.iter().enumerate() {
            let d = squared_distance(p, centroid);
            if d < best.1 {
                best = (c, d);
            }
        }
        best
    }).unzip()
}

/// k-means++ seeding.
fn seed_centroids(points: &DenseMatrix, k: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
    let n = points.nrows();
    let mut centroids = vec![points.row(rng.gen_range(0..n)).to_vec()];
    let mut d2: Vec<f64> = (0..n)
        .map(|i| squared_distance(points.row(i), &centroids[0]))
        .collect();
    while centroids.len() < k {
        let next = match WeightedIndex::new(&d2) {
            Ok(w) => w.sample(rng),
            Err(_) => rng.gen_range(0..n),
        };
        let c = points.row(next).to_vec();
        for (i, d) in d2.iter_mut().enumerate() {
            *d = d.min(squared_distance(points.row(i), &c));
        }
        centroids.push(c);
    }
    centroids
}

/// One seeded k-means run: k-means++ then Lloyd iterations.
fn kmeans_run(points: &DenseMatrix, k: usize, config: &ClusterConfig, seed: u64) -> Result<KMeans> {
    let (n, dim) = (points.nrows(), points.ncols());
    let mut rng = StdRng::seed_from_u64(seed);
    let mut centroids = seed_centroids(points, k, &mut rng);

    // tolerance relative to the mean per-dimension variance
    let variance = (0..dim).map(|j| {
        let col = points.column(j);
        let mean = col.iter().sum::<f64>() / n as f64;
        col.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n as f64
    }).sum::<f64>() / dim.max(1) as f64;
    let tol = config.tol * variance;

    for _ in 0..config.max_iter {
        let (labels, mut dist) = assign(points, &centroids);
        let mut sums = vec![vec![0.0; dim]; k];
        let mut counts = vec![0usize; k];
        for (i, &l) in labels.iter().enumerate() {
            sums[l].iter_mut().zip(points.row(i)).for_each(|(s, x)| *s += x);
            counts[l] += 1;
        }
        let mut shift = 0.0;
        for c in 0..k {
            let next = if counts[c] > 0 {
                sums[c].iter().map(|s| s / counts[c] as f64).collect()
            } else {
                // reseed an empty cluster with the farthest point
                let far = dist.iter().enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map_or(0, |(i, _)| i);
                dist[far] = 0.0;
                points.row(far).to_vec()
            };
            shift += squared_distance(&centroids[c], &next);
            centroids[c] = next;
        }
        if shift <= tol {
            break;
        }
    }
    let (labels, dist) = assign(points, &centroids);
    let centroids = DenseMatrix::from_vec(k, dim, centroids.concat())?;
    Ok(KMeans { centroids, labels, inertia: dist.iter().sum() })
}

/// Best of `config.restarts` k-means runs by inertia.
///
/// Restart seeds are drawn up front from `seed`, runs are evaluated
/// in parallel, and ties go to the earliest restart.
pub fn kmeans(points: &DenseMatrix, k: usize, config: &ClusterConfig, seed: u64) -> Result<KMeans> {
    if k == 0 || k > points.nrows() {
        return Err(Error::mismatch("clusters vs points", k, points.nrows()));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let seeds: Vec<u64> = (0..config.restarts.max(1)).map(|_| rng.gen()).collect();
    let runs = seeds.par_iter()
        .map(|&s| kmeans_run(points, k, config, s))
        .collect::<Result<Vec<KMeans>>>()?;
    let mut best: Option<KMeans> = None;
    for run in runs {
        if best.as_ref().map_or(true, |b| run.inertia < b.inertia) {
            best = Some(run);
        }
    }
    best.ok_or_else(|| Error::DegenerateFit("no k-means run".into()))
}

/// BIC of a clustering of `n` points with `k` clusters, `d = k`.
fn bic_score(n: usize, k: usize, inertia: f64, labels: &[usize]) -> f64 {
    let sig = inertia / (n - k) as f64;
    if sig < MIN_VARIANCE {
        return f64::INFINITY;
    }
    let mut counts = vec![0usize; k];
    for &l in labels {
        counts[l] += 1;
    }
    let (n, d, kf) = (n as f64, k as f64, k as f64);
    let mut l = 0.5 * kf;
    l -= 0.5 * n * d * sig.ln();
    l += counts.iter()
        .filter(|&&c| c > 0)
        .map(|&c| c as f64 * (c as f64 / n).ln())
        .sum::<f64>();
    (kf + 1.0) * d - 2.0 * l
}

/// Cluster the first `k` projected dimensions and pick centers.
fn cluster_k(projected: &DenseMatrix, k: usize, config: &ClusterConfig) -> Result<ClusterResult> {
    let points = projected.leading_columns(k);
    let run = kmeans(&points, k, config, config.seed.wrapping_add(k as u64))?;
    let score = bic_score(points.nrows(), k, run.inertia, &run.labels);
    let mut centers = Vec::with_capacity(k);
    for c in 0..k {
        let centroid = run.centroids.row(c);
        let center = run.labels.iter().enumerate()
            .filter(|&(_, &l)| l == c)
            .map(|(i, _)| (i, squared_distance(points.row(i), centroid)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)
            .ok_or_else(|| Error::DegenerateFit(format!(
                "cluster {} of {} has no members", c, k)))?;
        centers.push(center);
    }
    Ok(ClusterResult { centers, labels: run.labels, k, score })
}

/// Annealed sweep over `ks`.
///
/// The temperature starts at the absolute value of the first finite
/// score and reaches zero at the last `k`. Each step draws once from
/// `rng` and stops when `exp(-delta / T)` falls below the draw. A
/// candidate is retained only when it beats the retained score by
/// more than `margin`.
fn anneal<R, F>(
    min_k: usize, max_k: usize, margin: f64, rng: &mut R, mut eval: F
) -> Result<Option<ClusterResult>>
where R: Rng + ?Sized, F: FnMut(usize) -> Result<ClusterResult>
{
    let mut retained: Option<ClusterResult> = None;
    let mut best = f64::INFINITY;
    let mut temperature: Option<(f64, f64)> = None;
    for k in min_k..=max_k {
        let timer = clilog::stimer!("cluster k");
        let candidate = eval(k)?;
        let delta = candidate.score - best;
        clilog::info!(CLS_K, "k: {}, BIC: {:.2}, delta: {:.2}", k, candidate.score, delta);
        clilog::finish!(timer);
        if temperature.is_none() && candidate.score.is_finite() {
            let t = candidate.score.abs();
            temperature = Some((t, t / (max_k - min_k).max(1) as f64));
        }
        let draw: f64 = rng.gen();
        if let Some((t, _)) = temperature {
            if (-delta / t).exp() < draw {
                clilog::debug!(CLS_STOP, "sweep stopped at k = {}", k);
                break;
            }
        }
        if delta < -margin {
            best = candidate.score;
            retained = Some(candidate);
        }
        if let Some((t, step)) = temperature.as_mut() {
            *t -= *step;
        }
    }
    Ok(retained)
}

/// Cluster the signals (rows) of a toggle matrix.
///
/// `rng` drives only the sweep's stop rule; SVD starts and k-means
/// restarts derive from `config.seed`.
pub fn cluster_signals<R: Rng + ?Sized>(
    toggles: &CsrMatrix, min_k: usize, max_k: usize,
    config: &ClusterConfig, rng: &mut R
) -> Result<ClusterResult> {
    let n = toggles.nrows();
    if min_k == 0 || min_k > max_k {
        return Err(Error::mismatch("min_k vs max_k", min_k, max_k));
    }
    if max_k >= n {
        return Err(Error::mismatch("max_k vs signals", max_k, n));
    }
    if max_k > toggles.ncols() {
        return Err(Error::mismatch("max_k vs windows", max_k, toggles.ncols()));
    }
    let timer = clilog::stimer!("dimension reduction");
    let projected = project(toggles, max_k, config)?;
    clilog::finish!(timer);
    let result = anneal(min_k, max_k, config.accept_margin, rng,
                        |k| cluster_k(&projected, k, config))?;
    let result = result.ok_or(Error::NoClusterFound { min_k, max_k })?;
    clilog::info!(CLS_DONE, "selected {} representative signals", result.k);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    fn never_stop() -> StepRng {
        StepRng::new(0, 0)
    }

    fn always_draw_one() -> StepRng {
        StepRng::new(u64::MAX, 0)
    }

    fn stub(k: usize, score: f64) -> ClusterResult {
        ClusterResult { centers: vec![0; k], labels: vec![], k, score }
    }

    fn sweep(scores: &[f64], rng: &mut StepRng) -> Option<usize> {
        anneal(1, scores.len(), 10.0, rng, |k| Ok(stub(k, scores[k - 1])))
            .unwrap()
            .map(|r| r.k)
    }

    #[test]
    fn sweep_retains_improvements_beyond_margin() {
        assert_eq!(sweep(&[100.0, 50.0, 60.0, 10.0], &mut never_stop()), Some(4));
        assert_eq!(sweep(&[100.0, 95.0], &mut never_stop()), Some(1));
    }

    #[test]
    fn sweep_stops_on_worse_score() {
        assert_eq!(sweep(&[100.0, 50.0, 60.0, 10.0], &mut always_draw_one()), Some(2));
    }

    #[test]
    fn infinite_scores_are_never_retained() {
        assert_eq!(sweep(&[f64::INFINITY, 100.0], &mut never_stop()), Some(2));
        assert_eq!(sweep(&[f64::INFINITY, f64::INFINITY], &mut never_stop()), None);
    }

    #[test]
    fn singular_vectors_of_diagonal() {
        let a = CsrMatrix::from_dense(&DenseMatrix::from_rows(&[
            vec![1.0, 0.0, 0.0],
            vec![0.0, 3.0, 0.0],
            vec![0.0, 0.0, 2.0],
        ]).unwrap());
        let (sigmas, _) = right_singular_vectors(&a, 2, &ClusterConfig::default()).unwrap();
        assert!((sigmas[0] - 3.0).abs() < 1e-9);
        assert!((sigmas[1] - 2.0).abs() < 1e-9);
        let p = project(&a, 2, &ClusterConfig::default()).unwrap();
        assert!(p.get(0, 0).abs() < 1e-9 && p.get(0, 1).abs() < 1e-9);
        assert!((p.get(1, 0).abs() - 3.0).abs() < 1e-9);
        assert!((p.get(2, 1).abs() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn kmeans_separates_blobs() {
        let points = DenseMatrix::from_rows(&[
            vec![0.0, 0.0], vec![10.0, 10.0], vec![0.1, 0.0], vec![10.1, 10.0],
        ]).unwrap();
        let r = kmeans(&points, 2, &ClusterConfig::default(), 7).unwrap();
        assert_eq!(r.labels[0], r.labels[2]);
        assert_eq!(r.labels[1], r.labels[3]);
        assert_ne!(r.labels[0], r.labels[1]);
        assert!((r.inertia - 0.01).abs() < 1e-9);
        // centroids are the member means
        let c = r.centroids.row(r.labels[1]);
        assert!((c[0] - 10.05).abs() < 1e-9 && (c[1] - 10.0).abs() < 1e-9);
        assert_eq!((r.centroids.nrows(), r.centroids.ncols()), (2, 2));
    }

    /// Three groups of three signals with nearly identical activity.
    fn grouped_toggles() -> CsrMatrix {
        let patterns = [
            [1.0, 0.0, 1.0, 0.0, 1.0, 0.0],
            [0.0, 1.0, 0.0, 1.0, 0.0, 1.0],
            [1.0, 1.0, 0.0, 0.0, 1.0, 1.0],
        ];
        let mut rows = Vec::new();
        for (g, p) in patterns.iter().enumerate() {
            for m in 0..3 {
                let jitter = 0.01 * (g * 3 + m) as f64;
                rows.push(p.iter().map(|x| x * (1.0 - jitter)).collect::<Vec<_>>());
            }
        }
        CsrMatrix::from_dense(&DenseMatrix::from_rows(&rows).unwrap())
    }

    #[test]
    fn recovers_groups() {
        let a = grouped_toggles();
        let r = cluster_signals(&a, 3, 3, &ClusterConfig::default(), &mut never_stop())
            .unwrap();
        assert_eq!(r.k, 3);
        for g in 0..3 {
            let l = r.labels[g * 3];
            assert!(r.labels[g * 3..g * 3 + 3].iter().all(|&x| x == l));
        }
        for (i, &c) in r.centers.iter().enumerate() {
            assert_eq!(r.labels[c], i);
        }
        let names: Vec<String> = (0..9).map(|i| format!("s{}", i)).collect();
        let groups = r.groups(&names);
        assert_eq!(groups.len(), 3);
        assert!(groups.iter().all(|g| g.len() == 3));
        assert!(groups.windows(2).all(|w| w[0][0] < w[1][0]));
    }

    #[test]
    fn sweep_is_deterministic_for_a_seed() {
        let a = grouped_toggles();
        let config = ClusterConfig::default();
        let x = cluster_signals(&a, 2, 5, &config, &mut never_stop()).unwrap();
        let y = cluster_signals(&a, 2, 5, &config, &mut never_stop()).unwrap();
        assert_eq!(x, y);
        assert!((2..=5).contains(&x.k));
        assert_eq!(x.centers.len(), x.k);
    }

    #[test]
    fn rejects_bad_bounds() {
        let a = grouped_toggles();
        let c = ClusterConfig::default();
        let mut rng = never_stop();
        assert!(matches!(cluster_signals(&a, 0, 3, &c, &mut rng),
                         Err(Error::DimensionMismatch { .. })));
        assert!(matches!(cluster_signals(&a, 4, 3, &c, &mut rng),
                         Err(Error::DimensionMismatch { .. })));
        assert!(matches!(cluster_signals(&a, 2, 7, &c, &mut rng),
                         Err(Error::DimensionMismatch { .. })));
    }

    #[test]
    fn identical_signals_find_no_cluster() {
        let a = CsrMatrix::from_dense(&DenseMatrix::from_rows(&[
            vec![1.0, 0.0], vec![1.0, 0.0], vec![1.0, 0.0],
        ]).unwrap());
        let r = cluster_signals(&a, 1, 1, &ClusterConfig::default(), &mut never_stop());
        assert!(matches!(r, Err(Error::NoClusterFound { min_k: 1, max_k: 1 })));
    }
}
