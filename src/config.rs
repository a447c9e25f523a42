//! Stage configuration.
//!
//! The naming heuristics and thresholds here are tied to the RTL
//! naming convention of the traced design, so they are data rather
//! than logic. All structs deserialize with `serde` and fall back to
//! their `Default` for missing fields.

use compact_str::CompactString;
use serde::{ Serialize, Deserialize };
use std::collections::HashSet;

/// Options for waveform ingest and post-filtering.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct IngestConfig {
    /// Cycles aggregated into one toggle-matrix column.
    pub window: u64,
    /// Exact (prefix-stripped) name of the clock signal.
    pub clock: CompactString,
    /// Exact (prefix-stripped) name of the reset signal.
    pub reset: CompactString,
    /// Signals whose name contains any of these are not tracked.
    pub deny_substrings: Vec<CompactString>,
    /// Signals at least this wide are dropped unless a keep-list is set.
    pub wide_signal_width: usize,
    /// A name containing all of these markers is dropped unless kept.
    pub exclusion_markers: Vec<CompactString>,
    /// Optional keep-list. When set only these signals are tracked and
    /// the width threshold is not applied.
    pub keep: Option<HashSet<CompactString>>,
}

impl Default for IngestConfig {
    fn default() -> IngestConfig {
        IngestConfig {
            window: 1,
            clock: "clock".into(),
            reset: "reset".into(),
            deny_substrings: [
                "clock", "reset", "_clk", "_rst",
                "initvar", "_RAND", "_GEN_"
            ].into_iter().map(CompactString::from).collect(),
            wide_signal_width: 96,
            exclusion_markers: vec!["_ext".into(), "_reg".into()],
            keep: None,
        }
    }
}

impl IngestConfig {
    /// Default configuration with the given window.
    #[inline]
    pub fn with_window(window: u64) -> IngestConfig {
        IngestConfig { window, ..Default::default() }
    }

    /// Restrict ingest to the given signal names.
    pub fn keep_signals<I, S>(mut self, signals: I) -> IngestConfig
    where I: IntoIterator<Item = S>, S: Into<CompactString>
    {
        self.keep = Some(signals.into_iter().map(Into::into).collect());
        self
    }

    #[inline]
    pub(crate) fn is_kept(&self, name: &str) -> bool {
        self.keep.as_ref().map_or(true, |k| k.contains(name))
    }

    #[inline]
    pub(crate) fn is_denied(&self, name: &str) -> bool {
        self.deny_substrings.iter().any(|d| name.contains(d.as_str()))
    }

    /// Whether a name hits the residual exclusion heuristic.
    #[inline]
    pub(crate) fn is_excluded(&self, name: &str) -> bool {
        !self.exclusion_markers.is_empty() &&
            self.exclusion_markers.iter().all(|m| name.contains(m.as_str()))
    }
}

/// Options for the clustering sweep.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ClusterConfig {
    /// Independent k-means runs per candidate `k`.
    pub restarts: usize,
    /// Lloyd iteration cap per run.
    pub max_iter: usize,
    /// Relative centroid-shift tolerance.
    pub tol: f64,
    /// Power iterations per singular vector.
    pub svd_iters: usize,
    /// A candidate is retained only if it beats the best BIC by more
    /// than this margin.
    pub accept_margin: f64,
    /// Seed for SVD starting vectors and k-means restarts.
    pub seed: u64,
}

impl Default for ClusterConfig {
    fn default() -> ClusterConfig {
        ClusterConfig {
            restarts: 10,
            max_iter: 300,
            tol: 1e-4,
            svd_iters: 200,
            accept_margin: 10.0,
            seed: 0,
        }
    }
}

impl ClusterConfig {
    /// Default upper bound of the sweep for `n` signals.
    pub fn max_k_for(n: usize, min_k: usize) -> usize {
        if n > 200 { 200 } else { (min_k + 10).min(n / 2) }
    }
}

/// Options for polynomial regression.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct FitConfig {
    /// Highest polynomial degree.
    pub degree: usize,
    /// Elastic net over the `l1_ratios` when true, plain L1 otherwise.
    pub elastic_net: bool,
    /// Candidate L1/L2 mixing ratios for the elastic net.
    pub l1_ratios: Vec<f64>,
    /// Cross-validation folds.
    pub folds: usize,
    /// Length of the regularization path.
    pub n_alphas: usize,
    /// Ratio of the smallest to the largest alpha on the path.
    pub eps: f64,
    /// Coordinate descent sweep cap.
    pub max_iter: usize,
    /// Coordinate descent tolerance on the largest coefficient update.
    pub tol: f64,
}

impl Default for FitConfig {
    fn default() -> FitConfig {
        FitConfig {
            degree: 2,
            elastic_net: true,
            l1_ratios: vec![0.1, 0.5, 1.0],
            folds: 5,
            n_alphas: 100,
            eps: 1e-3,
            max_iter: 10000,
            tol: 1e-4,
        }
    }
}

impl FitConfig {
    /// Mixing ratios actually searched.
    #[inline]
    pub(crate) fn mixing_ratios(&self) -> Vec<f64> {
        if self.elastic_net { self.l1_ratios.clone() } else { vec![1.0] }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusion_needs_every_marker() {
        let c = IngestConfig::default();
        assert!(c.is_excluded("core.mem_ext.data_reg"));
        assert!(!c.is_excluded("core.mem_ext.data"));
        assert!(!c.is_excluded("core.data_reg"));
    }

    #[test]
    fn deny_list_matches_substrings() {
        let c = IngestConfig::default();
        assert!(c.is_denied("core._GEN_12"));
        assert!(c.is_denied("core.io_clock_en"));
        assert!(!c.is_denied("core.pc"));
    }

    #[test]
    fn default_sweep_bound() {
        assert_eq!(ClusterConfig::max_k_for(1000, 2), 200);
        assert_eq!(ClusterConfig::max_k_for(100, 2), 12);
        assert_eq!(ClusterConfig::max_k_for(10, 2), 5);
    }
}
